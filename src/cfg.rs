//! Control-flow and call graph query surface
//!
//! The exploration engines interpret a graph of atomic basic blocks (ABBs):
//! the smallest control-flow units, each classified as computation, call or
//! syscall. Local edges connect consecutive blocks inside one function;
//! interprocedural edges connect a call block to the entry block of each of
//! its callees. The call graph proper is the per-call-site target list.
//!
//! Building this graph from compiled program representations is a front-end
//! concern; this module only stores the result and answers the queries the
//! engines need, including the dominator-based "is this block conditional"
//! query and per-function create-syscall reachability used to prune call
//! targets.

use fnv::FnvHashMap;
use petgraph::algo::dominators::{self, Dominators};
use petgraph::graph::DiGraph;
use petgraph::visit::{EdgeFiltered, EdgeRef};
use petgraph::Direction;
use std::cell::RefCell;

/// Node index of an atomic basic block within a [`Cfg`].
pub type AbbId = petgraph::graph::NodeIndex;

/// Index into the function table of a [`Cfg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub usize);

/// Classification of an atomic basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbbKind {
    Computation,
    Call,
    Syscall,
}

/// Edge flavor in the control-flow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    /// Flow between consecutive blocks of the same function.
    Local,
    /// Flow from a call block into a callee's entry block.
    Interprocedural,
}

/// Where an ABB came from in the application sources, when known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

/// An atomic basic block. Immutable once the graph is built, except for
/// the BCET/WCET attributes applied by the timing table.
#[derive(Debug, Clone)]
pub struct Abb {
    pub name: String,
    pub kind: AbbKind,
    pub function: FunctionId,
    pub is_exit: bool,
    pub part_of_loop: bool,
    /// Resolved syscall name for `AbbKind::Syscall` blocks.
    pub syscall: Option<String>,
    /// Best-case execution time in abstract ticks.
    pub bcet: u64,
    /// Worst-case execution time in abstract ticks.
    pub wcet: u64,
    pub source: Option<SourceLocation>,
}

#[derive(Debug, Clone)]
struct Function {
    name: String,
    entry: Option<AbbId>,
    blocks: Vec<AbbId>,
}

#[derive(Debug, Clone, Copy)]
struct FlowEdge {
    kind: FlowKind,
}

/// The control/call graph consumed by the exploration engines.
#[derive(Debug, Default)]
pub struct Cfg {
    graph: DiGraph<Abb, FlowEdge>,
    functions: Vec<Function>,
    by_name: FnvHashMap<String, FunctionId>,
    /// Call graph: per call-site block, the statically resolved callees.
    call_targets: FnvHashMap<AbbId, Vec<FunctionId>>,
    /// Per function: can a create-category syscall be reached from it?
    reaches_create: Option<Vec<bool>>,
    /// Dominator trees of the local flow, computed lazily per function.
    dom_cache: RefCell<FnvHashMap<usize, Dominators<AbbId>>>,
}

impl Cfg {
    pub fn new() -> Self {
        Self::default()
    }

    // --- construction (front ends and test fixtures) ---

    pub fn add_function(&mut self, name: &str) -> FunctionId {
        let id = FunctionId(self.functions.len());
        self.functions.push(Function {
            name: name.to_string(),
            entry: None,
            blocks: Vec::new(),
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Add a block to `function`. The first block added becomes its entry.
    pub fn add_block(&mut self, function: FunctionId, name: &str, kind: AbbKind) -> AbbId {
        let abb = self.graph.add_node(Abb {
            name: name.to_string(),
            kind,
            function,
            is_exit: false,
            part_of_loop: false,
            syscall: None,
            bcet: 0,
            wcet: 0,
            source: None,
        });
        let func = &mut self.functions[function.0];
        if func.entry.is_none() {
            func.entry = Some(abb);
        }
        func.blocks.push(abb);
        self.dom_cache.borrow_mut().remove(&function.0);
        abb
    }

    /// Add a syscall block with its resolved syscall name.
    pub fn add_syscall_block(&mut self, function: FunctionId, name: &str, syscall: &str) -> AbbId {
        let abb = self.add_block(function, name, AbbKind::Syscall);
        self.graph[abb].syscall = Some(syscall.to_string());
        abb
    }

    pub fn mark_exit(&mut self, abb: AbbId) {
        self.graph[abb].is_exit = true;
        let function = self.graph[abb].function;
        self.dom_cache.borrow_mut().remove(&function.0);
    }

    pub fn mark_loop(&mut self, abb: AbbId) {
        self.graph[abb].part_of_loop = true;
    }

    pub fn set_timing(&mut self, abb: AbbId, bcet: u64, wcet: u64) {
        let block = &mut self.graph[abb];
        block.bcet = bcet;
        block.wcet = wcet;
    }

    pub fn set_source(&mut self, abb: AbbId, file: &str, line: u32) {
        self.graph[abb].source = Some(SourceLocation {
            file: file.to_string(),
            line,
        });
    }

    pub fn add_local_edge(&mut self, from: AbbId, to: AbbId) {
        self.graph.add_edge(
            from,
            to,
            FlowEdge {
                kind: FlowKind::Local,
            },
        );
        self.dom_cache
            .borrow_mut()
            .remove(&self.graph[from].function.0);
    }

    /// Register `callee` as a target of the call block `call_site` and add
    /// the interprocedural edge into its entry block.
    pub fn add_call_edge(&mut self, call_site: AbbId, callee: FunctionId) {
        if let Some(entry) = self.functions[callee.0].entry {
            self.graph.add_edge(
                call_site,
                entry,
                FlowEdge {
                    kind: FlowKind::Interprocedural,
                },
            );
        }
        self.call_targets.entry(call_site).or_default().push(callee);
    }

    // --- queries ---

    pub fn block(&self, abb: AbbId) -> &Abb {
        &self.graph[abb]
    }

    pub fn block_name(&self, abb: AbbId) -> &str {
        &self.graph[abb].name
    }

    pub fn function_of(&self, abb: AbbId) -> FunctionId {
        self.graph[abb].function
    }

    pub fn function_by_name(&self, name: &str) -> Option<FunctionId> {
        self.by_name.get(name).copied()
    }

    pub fn function_name(&self, function: FunctionId) -> &str {
        &self.functions[function.0].name
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn block_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn blocks(&self) -> impl Iterator<Item = AbbId> + '_ {
        self.graph.node_indices()
    }

    pub fn blocks_of(&self, function: FunctionId) -> &[AbbId] {
        &self.functions[function.0].blocks
    }

    pub fn entry_block(&self, function: FunctionId) -> Option<AbbId> {
        self.functions[function.0].entry
    }

    pub fn syscall_name(&self, abb: AbbId) -> Option<&str> {
        self.graph[abb].syscall.as_deref()
    }

    /// Successor blocks along edges of the requested flavor.
    pub fn successors(&self, abb: AbbId, kind: FlowKind) -> Vec<AbbId> {
        let mut out: Vec<AbbId> = self
            .graph
            .edges_directed(abb, Direction::Outgoing)
            .filter(|e| e.weight().kind == kind)
            .map(|e| e.target())
            .collect();
        out.reverse(); // petgraph yields edges newest-first
        out
    }

    /// Statically resolved callees of a call block. Empty for blocks that
    /// are not call sites.
    pub fn call_targets(&self, call_site: AbbId) -> &[FunctionId] {
        self.call_targets
            .get(&call_site)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Is `abb` only reached under a condition? True when it does not
    /// dominate every exit block of its function in the local flow.
    pub fn is_in_condition(&self, abb: AbbId) -> bool {
        let function = self.graph[abb].function;
        let Some(entry) = self.functions[function.0].entry else {
            return false;
        };
        if abb == entry {
            return false;
        }
        self.ensure_dominators(function, entry);
        let cache = self.dom_cache.borrow();
        let dom = &cache[&function.0];
        for &exit in &self.functions[function.0].blocks {
            if !self.graph[exit].is_exit {
                continue;
            }
            match dom.dominators(exit) {
                Some(mut chain) => {
                    if !chain.any(|d| d == abb) {
                        return true;
                    }
                }
                // Exit unreachable in the local flow (e.g. dead code after
                // an endless loop): it cannot constrain dominance.
                None => continue,
            }
        }
        false
    }

    fn ensure_dominators(&self, function: FunctionId, entry: AbbId) {
        if self.dom_cache.borrow().contains_key(&function.0) {
            return;
        }
        let local = EdgeFiltered::from_fn(&self.graph, |e| e.weight().kind == FlowKind::Local);
        let dom = dominators::simple_fast(&local, entry);
        self.dom_cache.borrow_mut().insert(function.0, dom);
    }

    /// Compute, per function, whether a syscall block accepted by
    /// `is_create` is reachable through the call graph. Used by the
    /// instance-graph pass to prune call targets that can never create.
    pub fn compute_create_reachability(&mut self, is_create: impl Fn(&str) -> bool) {
        let mut reaches = vec![false; self.functions.len()];
        for abb in self.graph.node_indices() {
            let block = &self.graph[abb];
            if block.kind == AbbKind::Syscall {
                if let Some(name) = &block.syscall {
                    if is_create(name) {
                        reaches[block.function.0] = true;
                    }
                }
            }
        }
        // Propagate backwards over call edges to a fixpoint.
        let mut changed = true;
        while changed {
            changed = false;
            for (&site, callees) in &self.call_targets {
                let caller = self.graph[site].function;
                if reaches[caller.0] {
                    continue;
                }
                if callees.iter().any(|c| reaches[c.0]) {
                    reaches[caller.0] = true;
                    changed = true;
                }
            }
        }
        self.reaches_create = Some(reaches);
    }

    /// Can `function` reach a create-category syscall? Conservatively true
    /// when reachability has not been computed.
    pub fn reaches_create(&self, function: FunctionId) -> bool {
        match &self.reaches_create {
            Some(reaches) => reaches[function.0],
            None => true,
        }
    }
}
