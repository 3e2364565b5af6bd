//! Single-core state-space exploration
//!
//! The walker pops states off a LIFO worklist and executes their pending
//! blocks one at a time: syscall blocks go to the OS model, call blocks
//! fork into every non-recursive callee, exit blocks return along the call
//! path, and computation blocks advance along local flow. No
//! `(call path, block)` pair is ever executed twice, which bounds the walk
//! to the context-sensitive reachable blocks.
//!
//! Two specializations drive the walker to a fixpoint over dynamically
//! discovered entry points: [`InstanceGraphBuilder`] (create-category
//! syscalls only, finds every kernel object the application creates) and
//! [`InteractionBuilder`] (comm-category syscalls only, adds communication
//! edges between already-known objects).

use crate::call_path::{CallPath, CallSite};
use crate::cfg::{AbbId, AbbKind, Cfg, FlowKind, FunctionId};
use crate::error::{ExplorationError, Result};
use crate::instance::{InstanceGraph, InstanceId};
use crate::os::{CategorySet, OsModel};
use crate::state::State;
use fnv::{FnvHashMap, FnvHashSet};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, info};

/// The system-state transition graph produced by one exploration run.
pub type Sstg = DiGraph<State, ()>;

/// Summary of one exploration run, serializable for offline comparison.
#[derive(Debug, Clone, Serialize)]
pub struct SseStats {
    pub entry_point: String,
    pub iterations: u64,
    pub max_call_depth: usize,
}

impl SseStats {
    pub fn write_json<W: std::io::Write>(&self, writer: W) -> anyhow::Result<()> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

/// One finished run: the SSTG, its root, and the run summary.
#[derive(Debug)]
pub struct SseRun {
    pub sstg: Sstg,
    pub root: NodeIndex,
    pub stats: SseStats,
}

/// Specialization hooks for the walker. Every hook has a no-op default;
/// the plain walker uses [`NoHooks`].
pub trait ExplorationHooks {
    /// Which syscall categories the OS model should act on.
    fn categories(&self) -> CategorySet {
        CategorySet::EVERY
    }

    /// Adjust a state before its pending blocks are executed.
    fn before_step(&mut self, _cfg: &Cfg, _state: &mut State) {}

    /// Prepare the transient state handed to the OS model for a syscall.
    fn prepare_syscall(&mut self, _cfg: &Cfg, _state: &mut State, _block: AbbId) {}

    /// Observe the OS model's results for a syscall block.
    fn after_syscall(&mut self, _cfg: &Cfg, _results: &[State], _block: AbbId) {}

    /// Adjust the forked state entering a callee.
    fn enter_call(&mut self, _cfg: &Cfg, _caller: &State, _callee: &mut State, _block: AbbId) {}

    /// Reject interprocedural call targets the analysis knows are
    /// irrelevant. Rejected targets count as handled; if *all* targets are
    /// rejected the call degrades to local flow.
    fn prune_call_target(&self, _cfg: &Cfg, _target: AbbId) -> bool {
        false
    }
}

/// Hookless exploration: every syscall category, no context tracking.
pub struct NoHooks;
impl ExplorationHooks for NoHooks {}

/// The worklist walker. One instance explores one entry point.
pub struct SseEngine<'c, M> {
    cfg: &'c Cfg,
    os: &'c mut M,
}

impl<'c, M: OsModel> SseEngine<'c, M> {
    pub fn new(cfg: &'c Cfg, os: &'c mut M) -> Self {
        Self { cfg, os }
    }

    /// Explore from `seed`, producing the SSTG.
    pub fn explore(
        &mut self,
        entry_point: &str,
        seed: State,
        hooks: &mut impl ExplorationHooks,
    ) -> Result<SseRun> {
        info!(entry_point, "exploring entry point");
        let mut sstg = Sstg::new();
        let root = sstg.add_node(seed);
        let mut stack = vec![root];
        let mut visited: FnvHashSet<(CallPath, AbbId)> = FnvHashSet::default();
        let mut iterations: u64 = 0;
        let mut max_call_depth = 0usize;

        while let Some(vertex) = stack.pop() {
            iterations += 1;
            let mut state = sstg[vertex].clone();
            hooks.before_step(self.cfg, &mut state);
            debug!(round = iterations, stack = stack.len() + 1, %state, "step");
            let successors = self.step(state, &mut visited, &mut max_call_depth, hooks)?;
            for succ in successors {
                let new_vertex = sstg.add_node(succ);
                sstg.add_edge(vertex, new_vertex, ());
                stack.push(new_vertex);
            }
        }

        info!(entry_point, iterations, max_call_depth, "exploration done");
        Ok(SseRun {
            sstg,
            root,
            stats: SseStats {
                entry_point: entry_point.to_string(),
                iterations,
                max_call_depth,
            },
        })
    }

    fn step(
        &mut self,
        state: State,
        visited: &mut FnvHashSet<(CallPath, AbbId)>,
        max_call_depth: &mut usize,
        hooks: &mut impl ExplorationHooks,
    ) -> Result<Vec<State>> {
        let mut out = Vec::new();
        let pending = state.next_abbs.clone();
        for abb in pending {
            if !visited.insert((state.call_path.clone(), abb)) {
                continue;
            }
            *max_call_depth = (*max_call_depth).max(state.call_path.depth());
            let block = self.cfg.block(abb);
            match block.kind {
                AbbKind::Syscall => {
                    debug!(block = %block.name, syscall = ?block.syscall, "handle syscall");
                    let mut transient = state.clone();
                    transient.next_abbs = vec![abb];
                    hooks.prepare_syscall(self.cfg, &mut transient, abb);
                    let results =
                        self.os
                            .interpret(self.cfg, abb, transient, hooks.categories())?;
                    hooks.after_syscall(self.cfg, &results, abb);
                    out.extend(results);
                }
                AbbKind::Call => {
                    debug!(block = %block.name, "handle call");
                    let targets = self.cfg.successors(abb, FlowKind::Interprocedural);
                    if targets.is_empty() {
                        return Err(ExplorationError::UnresolvedCallTarget {
                            block: block.name.clone(),
                            call_path: state.call_path.to_string(),
                        });
                    }
                    let mut handled = false;
                    for target in targets {
                        if hooks.prune_call_target(self.cfg, target) {
                            handled = true;
                            continue;
                        }
                        let site = CallSite {
                            block: abb,
                            callee: self.cfg.function_of(target),
                        };
                        if state.call_path.is_recursive_with(site) {
                            debug!(path = %state.call_path, "recursive call site, skipping");
                            continue;
                        }
                        let mut callee_state = state.fork_to(target);
                        let _ = callee_state.call_path.push(site);
                        hooks.enter_call(self.cfg, &state, &mut callee_state, abb);
                        out.push(callee_state);
                        handled = true;
                    }
                    if !handled {
                        // Only recursive targets: treat the call as a plain
                        // computation block over local flow.
                        for next in self.cfg.successors(abb, FlowKind::Local) {
                            out.push(state.fork_to(next));
                        }
                    }
                }
                AbbKind::Computation => {
                    if block.is_exit && !state.call_path.is_empty() {
                        debug!(block = %block.name, "handle exit");
                        let mut path = state.call_path.clone();
                        if let Some(site) = path.pop() {
                            for next in self.cfg.successors(site.block, FlowKind::Local) {
                                let mut resumed = state.fork_to(next);
                                resumed.call_path = path.clone();
                                out.push(resumed);
                            }
                        }
                    } else {
                        for next in self.cfg.successors(abb, FlowKind::Local) {
                            out.push(state.fork_to(next));
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Explore one entry point with no category filter and no hooks.
pub fn explore_entry_point<M: OsModel>(cfg: &Cfg, os: &mut M, entry_point: &str) -> Result<SseRun> {
    let function = cfg
        .function_by_name(entry_point)
        .ok_or_else(|| ExplorationError::MissingEntryPoint(entry_point.to_string()))?;
    let entry_abb = cfg
        .entry_block(function)
        .ok_or_else(|| ExplorationError::MissingEntryPoint(entry_point.to_string()))?;
    let mut seed = State::at(entry_abb);
    os.init(cfg, &mut seed);
    SseEngine::new(cfg, os).explore(entry_point, seed, &mut NoHooks)
}

/// Branch/loop context tracking shared by the instance-graph hooks.
///
/// A call made from a conditional or looping context taints the whole
/// callee context, keyed by the callee's call path.
#[derive(Default)]
struct FlagContext {
    cond: FnvHashMap<CallPath, bool>,
    looped: FnvHashMap<CallPath, bool>,
}

struct InstanceHooks<'a> {
    shared: &'a mut InstanceGraph,
    flags: &'a mut FlagContext,
    /// Call path under which each creation site first executed.
    creation_paths: &'a mut FnvHashMap<AbbId, CallPath>,
}

impl ExplorationHooks for InstanceHooks<'_> {
    fn categories(&self) -> CategorySet {
        CategorySet::CREATE
    }

    fn before_step(&mut self, _cfg: &Cfg, state: &mut State) {
        // Execute against the latest shared graph, not the snapshot taken
        // when this state was forked.
        state.instances = self.shared.clone();
    }

    fn prepare_syscall(&mut self, cfg: &Cfg, state: &mut State, block: AbbId) {
        // Taint is sticky: a seed inherited from a conditionally created
        // task stays conditional no matter where the syscall sits.
        let inherited_cond = *self.flags.cond.get(&state.call_path).unwrap_or(&false);
        let inherited_loop = *self.flags.looped.get(&state.call_path).unwrap_or(&false);
        state.branch = state.branch || inherited_cond || cfg.is_in_condition(block);
        state.in_loop = state.in_loop || inherited_loop || cfg.block(block).part_of_loop;
    }

    fn after_syscall(&mut self, _cfg: &Cfg, results: &[State], block: AbbId) {
        for result in results {
            self.shared.absorb(&result.instances);
        }
        // A creation site executed again under another call path creates
        // its objects more than once at run time, even though the model
        // deduplicates them in the graph.
        let Some(path) = results.first().map(|state| &state.call_path) else {
            return;
        };
        let created: Vec<InstanceId> = self
            .shared
            .iter()
            .filter(|(_, inst)| inst.created_at == Some(block))
            .map(|(id, _)| id)
            .collect();
        if created.is_empty() {
            return;
        }
        let first = self
            .creation_paths
            .entry(block)
            .or_insert_with(|| path.clone());
        if *first != *path {
            for id in created {
                self.shared.mark_non_unique_from(id);
            }
        }
    }

    fn enter_call(&mut self, cfg: &Cfg, caller: &State, callee: &mut State, block: AbbId) {
        let inherited_cond = *self.flags.cond.get(&caller.call_path).unwrap_or(&false);
        let inherited_loop = *self.flags.looped.get(&caller.call_path).unwrap_or(&false);
        callee.branch = caller.branch || inherited_cond || cfg.is_in_condition(block);
        callee.in_loop = caller.in_loop || inherited_loop || cfg.block(block).part_of_loop;
        self.flags.cond.insert(callee.call_path.clone(), callee.branch);
        self.flags
            .looped
            .insert(callee.call_path.clone(), callee.in_loop);
    }

    fn prune_call_target(&self, cfg: &Cfg, target: AbbId) -> bool {
        !cfg.reaches_create(cfg.function_of(target))
    }
}

/// Finds every kernel object the application creates.
///
/// Runs the create-filtered walker over the configured entry point, then
/// re-seeds itself over the entry function of every newly created runnable
/// entity until no new entry points appear. The instance set is bounded by
/// static creation sites, so the fixpoint converges.
pub struct InstanceGraphBuilder<'c, M: OsModel> {
    cfg: &'c Cfg,
    os: &'c mut M,
    instances: InstanceGraph,
    explored: FnvHashSet<String>,
    pending: VecDeque<FunctionId>,
    first_by_entry: FnvHashMap<String, InstanceId>,
    seen_instances: FnvHashSet<InstanceId>,
    creation_paths: FnvHashMap<AbbId, CallPath>,
    flags: FlagContext,
}

impl<'c, M: OsModel> InstanceGraphBuilder<'c, M> {
    pub fn new(cfg: &'c Cfg, os: &'c mut M) -> Self {
        Self {
            cfg,
            os,
            instances: InstanceGraph::new(),
            explored: FnvHashSet::default(),
            pending: VecDeque::new(),
            first_by_entry: FnvHashMap::default(),
            seen_instances: FnvHashSet::default(),
            creation_paths: FnvHashMap::default(),
            flags: FlagContext::default(),
        }
    }

    /// Run the fixpoint from `entry_point`; returns the per-run summaries.
    pub fn run(&mut self, entry_point: &str) -> Result<Vec<SseRun>> {
        let entry = self
            .cfg
            .function_by_name(entry_point)
            .ok_or_else(|| ExplorationError::MissingEntryPoint(entry_point.to_string()))?;
        self.pending.push_back(entry);
        self.explored.insert(entry_point.to_string());

        let mut runs = Vec::new();
        while let Some(function) = self.pending.pop_front() {
            runs.push(self.explore_one(function)?);
            self.extract_entry_points();
        }
        Ok(runs)
    }

    pub fn instances(&self) -> &InstanceGraph {
        &self.instances
    }

    pub fn into_instances(self) -> InstanceGraph {
        self.instances
    }

    fn explore_one(&mut self, function: FunctionId) -> Result<SseRun> {
        let name = self.cfg.function_name(function).to_string();
        let entry_abb = self
            .cfg
            .entry_block(function)
            .ok_or_else(|| ExplorationError::MissingEntryPoint(name.clone()))?;

        let mut seed = State::at(entry_abb);
        seed.instances = self.instances.clone();
        if let Some(running) = self.instances.find_by_entry(function) {
            // Chained analysis: we are exploring the body of a task that
            // some earlier run created, so the scheduler is already on.
            let instance = self.instances.get(running);
            seed.running = Some(running);
            seed.scheduler_on = true;
            seed.branch = instance.in_branch;
            seed.in_loop = instance.in_loop;
        }
        self.os.init(self.cfg, &mut seed);

        let mut hooks = InstanceHooks {
            shared: &mut self.instances,
            flags: &mut self.flags,
            creation_paths: &mut self.creation_paths,
        };
        SseEngine::new(self.cfg, &mut *self.os).explore(&name, seed, &mut hooks)
    }

    /// Scan the instance set for newly created runnable entities and
    /// schedule their entry functions. A creation site whose entry point
    /// was already explored elsewhere retags the original subtree
    /// non-unique.
    fn extract_entry_points(&mut self) {
        let mut retags = Vec::new();
        let mut schedule = Vec::new();
        for (id, instance) in self.instances.runnable() {
            if self.seen_instances.contains(&id) {
                continue;
            }
            let Some(function) = instance.entry else {
                continue;
            };
            let name = self.cfg.function_name(function).to_string();
            match self.first_by_entry.get(&name) {
                Some(&original) => {
                    // Second creation of the same symbol: neither the
                    // original nor the duplicate runs exactly once.
                    retags.push(original);
                    retags.push(id);
                }
                None => {
                    self.first_by_entry.insert(name.clone(), id);
                }
            }
            if !self.explored.contains(&name) {
                self.explored.insert(name.clone());
                schedule.push(function);
                debug!(entry_point = %name, "discovered new entry point");
            }
            self.seen_instances.insert(id);
        }
        for id in retags {
            self.instances.mark_non_unique_from(id);
        }
        self.pending.extend(schedule);
    }
}

struct InteractionHooks<'a> {
    shared: &'a mut InstanceGraph,
}

impl ExplorationHooks for InteractionHooks<'_> {
    fn categories(&self) -> CategorySet {
        CategorySet::COMM
    }

    fn before_step(&mut self, _cfg: &Cfg, state: &mut State) {
        state.instances = self.shared.clone();
    }

    fn after_syscall(&mut self, _cfg: &Cfg, results: &[State], _block: AbbId) {
        for result in results {
            self.shared.absorb(&result.instances);
        }
    }
}

/// Adds communication edges between already-known instances.
///
/// Assumes the instance graph is complete; never creates new instances.
/// Seeds itself over every runnable instance's entry function.
pub struct InteractionBuilder<'c, M: OsModel> {
    cfg: &'c Cfg,
    os: &'c mut M,
    instances: InstanceGraph,
}

impl<'c, M: OsModel> InteractionBuilder<'c, M> {
    pub fn new(cfg: &'c Cfg, os: &'c mut M, instances: InstanceGraph) -> Self {
        Self {
            cfg,
            os,
            instances,
        }
    }

    pub fn run(&mut self) -> Result<Vec<SseRun>> {
        if self.instances.is_empty() {
            return Err(ExplorationError::MissingInstanceGraph);
        }
        let entries: Vec<(InstanceId, FunctionId)> = self
            .instances
            .runnable()
            .filter_map(|(id, inst)| inst.entry.map(|f| (id, f)))
            .collect();

        let mut runs = Vec::new();
        let mut explored: FnvHashSet<FunctionId> = FnvHashSet::default();
        for (running, function) in entries {
            if !explored.insert(function) {
                continue;
            }
            let name = self.cfg.function_name(function).to_string();
            let entry_abb = self
                .cfg
                .entry_block(function)
                .ok_or_else(|| ExplorationError::MissingEntryPoint(name.clone()))?;
            let mut seed = State::at(entry_abb);
            seed.instances = self.instances.clone();
            seed.running = Some(running);
            seed.scheduler_on = true;
            self.os.init(self.cfg, &mut seed);

            let mut hooks = InteractionHooks {
                shared: &mut self.instances,
            };
            runs.push(SseEngine::new(self.cfg, &mut *self.os).explore(&name, seed, &mut hooks)?);
        }
        Ok(runs)
    }

    pub fn instances(&self) -> &InstanceGraph {
        &self.instances
    }

    pub fn into_instances(self) -> InstanceGraph {
        self.instances
    }
}
