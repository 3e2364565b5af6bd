//! Kernel-object instances and the instance graph
//!
//! Every kernel object an application creates at run time (task, queue,
//! mutex, ...) is modeled as one [`Instance`], created once per statically
//! discovered creation site. Instances live in an arena indexed by
//! [`InstanceId`]; "copying" an instance graph copies the arena, so forked
//! states cannot alias each other's objects.
//!
//! Edges are labeled with the syscall name that produced them and carry the
//! syscall's category. Edge insertion is idempotent: the edge set has set
//! semantics over `(source, target, label)`.

use crate::cfg::{AbbId, FunctionId, SourceLocation};
use crate::os::SyscallCategory;
use serde::Serialize;
use std::collections::VecDeque;

/// A modeled target core. The engines never spawn host threads; this is
/// purely an attribute of the analyzed system.
pub type CpuId = usize;

/// Arena index of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InstanceId(pub usize);

/// The kernel-object variants an OS model can create.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceKind {
    Task {
        priority: u32,
        autostart: bool,
        /// Regular tasks have an entry function and are runnable; special
        /// tasks (e.g. the idle hook) are bookkeeping-only.
        regular: bool,
    },
    Thread,
    Isr {
        priority: u32,
    },
    Queue {
        capacity: Option<u64>,
    },
    Mutex,
    Semaphore {
        initial: u64,
    },
    File {
        path: Option<String>,
    },
    Alarm {
        /// Activation period in abstract ticks; 0 means one-shot.
        period: u64,
    },
}

/// One created kernel object with its creation-site attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub label: String,
    pub kind: InstanceKind,
    pub cpu: CpuId,
    /// Entry function for runnable variants (tasks, threads, ISRs).
    pub entry: Option<FunctionId>,
    /// The ABB whose syscall created this instance.
    pub created_at: Option<AbbId>,
    pub source: Option<SourceLocation>,
    /// Creation happened on a conditional path.
    pub in_branch: bool,
    /// Creation happened inside a loop.
    pub in_loop: bool,
    /// Creation happened after the scheduler was enabled.
    pub after_scheduler: bool,
    /// True only if the creation site runs exactly once and the creating
    /// context is itself unique.
    pub unique: bool,
}

impl Instance {
    pub fn has_entry_point(&self) -> bool {
        self.entry.is_some()
    }

    /// Is this an entity the scheduler can run?
    pub fn is_runnable(&self) -> bool {
        match &self.kind {
            InstanceKind::Task { regular, .. } => *regular && self.entry.is_some(),
            InstanceKind::Thread | InstanceKind::Isr { .. } => self.entry.is_some(),
            _ => false,
        }
    }

    pub fn is_isr(&self) -> bool {
        matches!(self.kind, InstanceKind::Isr { .. })
    }

    pub fn is_autostart(&self) -> bool {
        matches!(self.kind, InstanceKind::Task { autostart: true, .. })
    }
}

/// A labeled interaction or creation edge between two instances.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceEdge {
    pub source: InstanceId,
    pub target: InstanceId,
    /// The syscall name that produced the edge.
    pub label: String,
    pub category: SyscallCategory,
}

/// Append-only graph over instances, cloned on state fork.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceGraph {
    nodes: Vec<Instance>,
    edges: Vec<InstanceEdge>,
}

impl InstanceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_instance(&mut self, instance: Instance) -> InstanceId {
        let id = InstanceId(self.nodes.len());
        self.nodes.push(instance);
        id
    }

    /// Insert an edge; duplicate `(source, target, label)` is suppressed.
    /// Returns whether the edge was new.
    pub fn add_edge(
        &mut self,
        source: InstanceId,
        target: InstanceId,
        label: &str,
        category: SyscallCategory,
    ) -> bool {
        let exists = self
            .edges
            .iter()
            .any(|e| e.source == source && e.target == target && e.label == label);
        if exists {
            return false;
        }
        self.edges.push(InstanceEdge {
            source,
            target,
            label: label.to_string(),
            category,
        });
        true
    }

    pub fn get(&self, id: InstanceId) -> &Instance {
        &self.nodes[id.0]
    }

    pub fn get_mut(&mut self, id: InstanceId) -> &mut Instance {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (InstanceId, &Instance)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (InstanceId(i), n))
    }

    pub fn edges(&self) -> &[InstanceEdge] {
        &self.edges
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// All runnable entities (regular tasks, threads, ISRs).
    pub fn runnable(&self) -> impl Iterator<Item = (InstanceId, &Instance)> {
        self.iter().filter(|(_, inst)| inst.is_runnable())
    }

    pub fn find_by_label(&self, label: &str) -> Option<InstanceId> {
        self.iter()
            .find(|(_, inst)| inst.label == label)
            .map(|(id, _)| id)
    }

    /// Find the runnable instance whose entry function is `function`.
    pub fn find_by_entry(&self, function: FunctionId) -> Option<InstanceId> {
        self.runnable()
            .find(|(_, inst)| inst.entry == Some(function))
            .map(|(id, _)| id)
    }

    /// Retroactively mark `root` and everything transitively created under
    /// it as non-unique, following create-category out-edges.
    pub fn mark_non_unique_from(&mut self, root: InstanceId) {
        let mut queue = VecDeque::from([root]);
        let mut seen = vec![false; self.nodes.len()];
        while let Some(id) = queue.pop_front() {
            if seen[id.0] {
                continue;
            }
            seen[id.0] = true;
            self.nodes[id.0].unique = false;
            for edge in &self.edges {
                if edge.source == id && edge.category == SyscallCategory::Create {
                    queue.push_back(edge.target);
                }
            }
        }
    }

    /// Instances merged in from a forked snapshot: the snapshot is a strict
    /// extension of this graph, so the longer arena and edge list win.
    pub fn absorb(&mut self, snapshot: &InstanceGraph) {
        if snapshot.nodes.len() > self.nodes.len() {
            self.nodes = snapshot.nodes.clone();
        } else {
            // Attribute updates (e.g. non-unique retags) still propagate.
            for (ours, theirs) in self.nodes.iter_mut().zip(&snapshot.nodes) {
                ours.unique &= theirs.unique;
            }
        }
        for edge in &snapshot.edges {
            self.add_edge(edge.source, edge.target, &edge.label, edge.category);
        }
    }
}
