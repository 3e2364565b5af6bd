//! Multi-core exploration states
//!
//! A [`MultiState`] tracks one control location per schedulable entity of
//! one modeled CPU, plus scheduling context and time windows. Fields that
//! can differ between not-yet-divergent timing alternatives are stored as
//! [`OptionMap`]s: values keyed by the [`WorldId`] of the originating
//! state. A field has a *resolved* value only while every keyed entry
//! agrees; [`compress`] unions option-maps of several alternatives into a
//! single representative without losing any keyed value, which is what
//! keeps the per-CPU graphs from exploding when many weakly-distinguished
//! alternatives coexist.
//!
//! A [`MetaState`] bundles one rooted graph of MultiStates per CPU and is
//! one vertex of the multi-core system-transition graph.

use crate::call_path::CallPath;
use crate::cfg::AbbId;
use crate::instance::{CpuId, InstanceId};
use crate::interval::IntervalList;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of an originating state, used to key option-map entries.
/// Explicit generation ids, never memory identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct WorldId(pub u64);

/// Allocator for fresh world ids, owned by the engine driving a run.
#[derive(Debug, Clone, Default)]
pub struct Worlds {
    next: u64,
}

impl Worlds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self) -> WorldId {
        let id = WorldId(self.next);
        self.next += 1;
        id
    }
}

/// A value container keyed by originating-state identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionMap<T> {
    entries: BTreeMap<WorldId, T>,
}

impl<T: Clone + PartialEq> OptionMap<T> {
    pub fn single(world: WorldId, value: T) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(world, value);
        Self { entries }
    }

    pub fn get(&self, world: WorldId) -> Option<&T> {
        self.entries.get(&world)
    }

    /// The common value, defined only when all keyed entries agree.
    pub fn resolved(&self) -> Option<&T> {
        let mut iter = self.entries.values();
        let first = iter.next()?;
        iter.all(|v| v == first).then_some(first)
    }

    /// Overwrite the value for every world. The transition applies to all
    /// alternatives this map currently represents.
    pub fn set_all(&mut self, value: T) {
        for v in self.entries.values_mut() {
            v.clone_from(&value);
        }
    }

    pub fn insert(&mut self, world: WorldId, value: T) {
        self.entries.insert(world, value);
    }

    /// Union with another map: new keys are added, existing keys are left
    /// untouched and never overwritten.
    pub fn absorb(&mut self, other: &Self) {
        for (world, value) in &other.entries {
            self.entries.entry(*world).or_insert_with(|| value.clone());
        }
    }

    /// Keep only the entry of `world`, when present.
    pub fn restricted(&self, world: WorldId) -> Self {
        match self.entries.get(&world) {
            Some(value) => Self::single(world, value.clone()),
            None => self.clone(),
        }
    }

    /// Re-key a resolved map to a single world. Unresolved maps keep their
    /// keys: collapsing them would lose alternatives.
    pub fn collapse_to(&mut self, world: WorldId) {
        if let Some(value) = self.resolved().cloned() {
            self.entries.clear();
            self.entries.insert(world, value);
        }
    }

    pub fn worlds(&self) -> impl Iterator<Item = WorldId> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Value-wise comparison: resolved values compare by content, unresolved
/// maps only match key-for-key.
fn agree<T: Clone + PartialEq>(a: &OptionMap<T>, b: &OptionMap<T>) -> bool {
    match (a.resolved(), b.resolved()) {
        (Some(x), Some(y)) => x == y,
        _ => a.entries == b.entries,
    }
}

/// One control state of one modeled CPU.
#[derive(Debug, Clone)]
pub struct MultiState {
    pub cpu: CpuId,
    /// The identity this state contributes to option-map keys.
    pub world: WorldId,
    /// Current location per schedulable entity; `None` = not started or
    /// terminated.
    pub locations: BTreeMap<InstanceId, OptionMap<Option<AbbId>>>,
    pub call_paths: BTreeMap<InstanceId, CallPath>,
    /// The task the scheduler currently runs.
    pub scheduled: OptionMap<Option<InstanceId>>,
    /// The ISR currently interrupting, if any.
    pub current_isr: OptionMap<Option<InstanceId>>,
    pub interrupts_enabled: OptionMap<bool>,
    pub activated_tasks: OptionMap<Vec<InstanceId>>,
    pub activated_isrs: OptionMap<Vec<InstanceId>>,
    /// Offsets from this MultiState's creation.
    pub local_times: IntervalList,
    /// Absolute offsets from the metastate root.
    pub global_times: IntervalList,
    /// Latest timed-event time already accounted for.
    pub last_event_time: u64,
    /// How often new time windows were merged into this state.
    pub updates: u32,
}

impl MultiState {
    pub fn new(cpu: CpuId, world: WorldId) -> Self {
        Self {
            cpu,
            world,
            locations: BTreeMap::new(),
            call_paths: BTreeMap::new(),
            scheduled: OptionMap::single(world, None),
            current_isr: OptionMap::single(world, None),
            interrupts_enabled: OptionMap::single(world, true),
            activated_tasks: OptionMap::single(world, Vec::new()),
            activated_isrs: OptionMap::single(world, Vec::new()),
            local_times: IntervalList::new(),
            global_times: IntervalList::new(),
            last_event_time: 0,
            updates: 0,
        }
    }

    /// Register a schedulable entity with its current location.
    pub fn add_entity(&mut self, entity: InstanceId, location: Option<AbbId>) {
        self.locations
            .insert(entity, OptionMap::single(self.world, location));
        self.call_paths.insert(entity, CallPath::new());
    }

    /// The entity whose code executes next: a running ISR preempts the
    /// scheduled task.
    pub fn running_entity(&self) -> Option<InstanceId> {
        if let Some(Some(isr)) = self.current_isr.resolved() {
            return Some(*isr);
        }
        self.scheduled.resolved().copied().flatten()
    }

    /// Resolved location of an entity, when all alternatives agree.
    pub fn location_of(&self, entity: InstanceId) -> Option<AbbId> {
        self.locations
            .get(&entity)
            .and_then(|map| map.resolved())
            .copied()
            .flatten()
    }

    pub fn set_location(&mut self, entity: InstanceId, location: Option<AbbId>) {
        match self.locations.get_mut(&entity) {
            Some(map) => map.set_all(location),
            None => self.add_entity(entity, location),
        }
    }

    pub fn call_path_of(&self, entity: InstanceId) -> CallPath {
        self.call_paths.get(&entity).cloned().unwrap_or_default()
    }

    pub fn set_call_path(&mut self, entity: InstanceId, path: CallPath) {
        self.call_paths.insert(entity, path);
    }

    /// Are all control fields resolved, i.e. does this state represent a
    /// single world?
    pub fn is_control_resolved(&self) -> bool {
        self.scheduled.resolved().is_some()
            && self.current_isr.resolved().is_some()
            && self.interrupts_enabled.resolved().is_some()
            && self.activated_tasks.resolved().is_some()
            && self.activated_isrs.resolved().is_some()
            && self.locations.values().all(|m| m.resolved().is_some())
    }

    /// Split a state with divergent option-map entries into one resolved
    /// state per represented world. A resolved state splits into itself.
    pub fn split(&self) -> Vec<MultiState> {
        if self.is_control_resolved() {
            return vec![self.clone()];
        }
        let mut worlds: Vec<WorldId> = self.scheduled.worlds().collect();
        for map in self.locations.values() {
            for w in map.worlds() {
                if !worlds.contains(&w) {
                    worlds.push(w);
                }
            }
        }
        worlds
            .into_iter()
            .map(|world| {
                let mut part = self.clone();
                part.world = world;
                part.scheduled = self.scheduled.restricted(world);
                part.current_isr = self.current_isr.restricted(world);
                part.interrupts_enabled = self.interrupts_enabled.restricted(world);
                part.activated_tasks = self.activated_tasks.restricted(world);
                part.activated_isrs = self.activated_isrs.restricted(world);
                for map in part.locations.values_mut() {
                    *map = map.restricted(world);
                }
                part
            })
            .collect()
    }

    /// Re-key every resolved option-map onto a fresh world. Used to give a
    /// model-produced alternative its own identity before compression.
    pub fn assign_world(&mut self, world: WorldId) {
        self.world = world;
        self.scheduled.collapse_to(world);
        self.current_isr.collapse_to(world);
        self.interrupts_enabled.collapse_to(world);
        self.activated_tasks.collapse_to(world);
        self.activated_isrs.collapse_to(world);
        for map in self.locations.values_mut() {
            map.collapse_to(world);
        }
    }

    /// Advance both time-window lists by `[bcet, wcet]`. Returns `false`
    /// when no feasible global window survives the event clamp.
    pub fn advance_time(&mut self, bcet: u64, wcet: u64, limit: Option<u64>) -> bool {
        self.local_times = self.local_times.advance(bcet, wcet, None);
        self.global_times = self.global_times.advance(bcet, wcet, limit);
        !self.global_times.is_empty()
    }

    pub fn min_global(&self) -> Option<u64> {
        self.global_times.min()
    }

    /// Scheduling-equality used for vertex deduplication: everything but
    /// the time windows and the update counter. The last accounted event
    /// time does participate, otherwise successive firings of a periodic
    /// event would collapse into one vertex.
    pub fn same_control(&self, other: &MultiState) -> bool {
        if self.cpu != other.cpu
            || self.last_event_time != other.last_event_time
            || self.call_paths != other.call_paths
            || self.locations.len() != other.locations.len()
        {
            return false;
        }
        for (entity, map) in &self.locations {
            match other.locations.get(entity) {
                Some(other_map) if agree(map, other_map) => {}
                _ => return false,
            }
        }
        agree(&self.scheduled, &other.scheduled)
            && agree(&self.current_isr, &other.current_isr)
            && agree(&self.interrupts_enabled, &other.interrupts_enabled)
            && agree(&self.activated_tasks, &other.activated_tasks)
            && agree(&self.activated_isrs, &other.activated_isrs)
    }
}

impl fmt::Display for MultiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MultiState(cpu: {}, running: {:?}, windows: {:?})",
            self.cpu,
            self.running_entity(),
            self.global_times.iter().collect::<Vec<_>>()
        )
    }
}

/// Compress alternatives into one representative (union of all option-map
/// entries and time windows). Never loses a keyed value: existing keys are
/// left untouched, so any original's value can be read back at its world.
pub fn compress(states: &[MultiState]) -> Option<MultiState> {
    let (first, rest) = states.split_first()?;
    let mut merged = first.clone();
    for state in rest {
        merged.scheduled.absorb(&state.scheduled);
        merged.current_isr.absorb(&state.current_isr);
        merged.interrupts_enabled.absorb(&state.interrupts_enabled);
        merged.activated_tasks.absorb(&state.activated_tasks);
        merged.activated_isrs.absorb(&state.activated_isrs);
        for (entity, map) in &state.locations {
            merged
                .locations
                .entry(*entity)
                .and_modify(|m| m.absorb(map))
                .or_insert_with(|| map.clone());
        }
        merged.global_times.merge(&state.global_times);
        merged.local_times.merge(&state.local_times);
        merged.last_event_time = merged.last_event_time.min(state.last_event_time);
    }
    Some(merged)
}

/// How an exploration edge came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Plain control flow (computation, call, exit).
    Flow,
    /// An interpreted on-core syscall.
    Syscall,
    /// Entry into an interrupt handler.
    IsrEntry,
    /// A timed event (e.g. alarm expiry) fired.
    TimedEvent,
    /// Cross-core synchronization.
    Sync,
}

/// Per-CPU graph of MultiStates inside one MetaState. Exactly one root:
/// the state the CPU was in when the metastate was entered.
#[derive(Debug, Clone, Default)]
pub struct CpuGraph {
    pub graph: DiGraph<MultiState, StepKind>,
    pub root: NodeIndex,
    /// Vertices scheduled for (re-)exploration.
    pub pending: Vec<NodeIndex>,
}

impl CpuGraph {
    pub fn with_root(state: MultiState) -> Self {
        let mut graph = DiGraph::new();
        let root = graph.add_node(state);
        Self {
            graph,
            root,
            pending: vec![root],
        }
    }
}

/// One vertex of the multi-core system-transition graph.
#[derive(Debug, Clone, Default)]
pub struct MetaState {
    pub cpus: Vec<CpuGraph>,
    /// Per CPU: states parked at a cross-core syscall, waiting for the
    /// CPU's local worklist to drain.
    pub sync_states: BTreeMap<CpuId, Vec<NodeIndex>>,
    /// Per CPU: the MultiState that was active when this metastate was
    /// entered, for reconstructing global-control-flow edges.
    pub entry_states: BTreeMap<CpuId, NodeIndex>,
    pub updates: u32,
}

impl MetaState {
    pub fn new(roots: Vec<MultiState>) -> Self {
        let mut cpus = Vec::with_capacity(roots.len());
        let mut entry_states = BTreeMap::new();
        for (cpu, root) in roots.into_iter().enumerate() {
            let graph = CpuGraph::with_root(root);
            entry_states.insert(cpu, graph.root);
            cpus.push(graph);
        }
        Self {
            cpus,
            sync_states: BTreeMap::new(),
            entry_states,
            updates: 0,
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn root_state(&self, cpu: CpuId) -> &MultiState {
        &self.cpus[cpu].graph[self.cpus[cpu].root]
    }

    /// Metastate equality: per-CPU roots compare by control.
    pub fn same_roots(&self, other: &MetaState) -> bool {
        self.cpus.len() == other.cpus.len()
            && (0..self.cpus.len()).all(|cpu| {
                self.root_state(cpu).same_control(other.root_state(cpu))
            })
    }
}
