//! Multi-core timing exploration
//!
//! The timing engine explores all modeled CPUs jointly. Between two
//! cross-core interactions every CPU runs independently, so each CPU gets
//! its own rooted graph of [`MultiState`]s inside the current
//! [`MetaState`]; time windows are carried along every step and advanced
//! by the executed block's BCET/WCET. When a CPU reaches a syscall the OS
//! model declares cross-core, its state is parked until all local
//! worklists have drained, then resolved jointly against a compressed
//! representative of each foreign CPU, producing the next metastate.
//!
//! State explosion is contained three ways: per-CPU vertices are
//! deduplicated by control equality (new time windows merge into the
//! existing vertex), metastates are deduplicated by root control equality,
//! and three bounds cut the exploration off (re-update limits per state
//! and per metastate, plus an absolute time horizon).

use crate::call_path::CallSite;
use crate::cfg::{AbbId, AbbKind, Cfg, FlowKind};
use crate::error::{ExplorationError, Result};
use crate::instance::{CpuId, InstanceGraph, InstanceId, InstanceKind};
use crate::interval::{IntervalList, TimeInterval};
use crate::multistate::{compress, CpuGraph, MetaState, MultiState, StepKind, Worlds};
use crate::os::TimedOsModel;
use anyhow::Context;
use fnv::FnvHashSet;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::{debug, info};

/// The metastate transition graph.
pub type Mstg = DiGraph<MetaState, StepKind>;

/// Termination bounds of the timing exploration.
///
/// `horizon` is the only bound that guarantees termination for systems
/// with unbounded periodic events; the update limits bound re-exploration
/// of cyclic control.
#[derive(Debug, Clone, Copy)]
pub struct TimingBounds {
    /// How often a deduplicated metastate may receive new root windows
    /// before it stops being re-explored.
    pub max_metastate_updates: u32,
    /// How often a deduplicated per-CPU vertex may receive new windows
    /// before it stops being re-explored.
    pub max_state_updates: u32,
    /// Absolute tick past which no successor state is created.
    pub horizon: Option<u64>,
}

impl Default for TimingBounds {
    fn default() -> Self {
        Self {
            max_metastate_updates: 16,
            max_state_updates: 64,
            horizon: None,
        }
    }
}

/// A global control-flow edge: a syscall block after which the scheduled
/// entity changed, and the block the new entity continues at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcfEdge {
    pub cpu: CpuId,
    pub source: AbbId,
    pub target: AbbId,
}

/// Summary counters of a timing exploration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MultiSseStats {
    pub metastates: usize,
    pub states: usize,
    pub sync_points: usize,
    pub timed_events: usize,
    pub isr_activations: usize,
    /// Successors dropped or re-explorations skipped because a bound hit.
    pub bounded_cutoffs: usize,
}

impl MultiSseStats {
    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        let file = File::create(path)
            .with_context(|| format!("cannot create stats file {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .with_context(|| format!("cannot write stats file {}", path.display()))?;
        Ok(())
    }
}

/// Result of a timing exploration run.
pub struct MultiRun {
    pub mstg: Mstg,
    pub root: NodeIndex,
    pub gcf_edges: Vec<GcfEdge>,
    pub stats: MultiSseStats,
}

/// The multi-core timing exploration engine.
pub struct MultiSseEngine<'c, M> {
    cfg: &'c Cfg,
    os: M,
    bounds: TimingBounds,
    worlds: Worlds,
    gcf: Vec<GcfEdge>,
}

impl<'c, M: TimedOsModel> MultiSseEngine<'c, M> {
    pub fn new(cfg: &'c Cfg, os: M) -> Self {
        Self {
            cfg,
            os,
            bounds: TimingBounds::default(),
            worlds: Worlds::new(),
            gcf: Vec::new(),
        }
    }

    pub fn with_bounds(mut self, bounds: TimingBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn os(&self) -> &M {
        &self.os
    }

    /// Explore the timed behavior of the system described by `instances`.
    pub fn explore(&mut self, instances: &InstanceGraph) -> Result<MultiRun> {
        let roots = self.initial_roots(instances)?;
        info!(cpus = roots.len(), "starting timing exploration");

        let mut mstg = Mstg::new();
        let root = mstg.add_node(MetaState::new(roots));
        let mut worklist = vec![root];
        let mut stats = MultiSseStats::default();

        while let Some(node) = worklist.pop() {
            let mut meta = std::mem::take(&mut mstg[node]);
            meta.sync_states.clear();
            debug!(metastate = node.index(), "exploring metastate");
            for cpu in 0..meta.cpu_count() {
                self.run_cpu(&mut meta, cpu, instances, &mut stats)?;
            }
            let followers = self.cross_core_sync(&meta, &mut stats)?;
            mstg[node] = meta;
            for follower in followers {
                self.intern(&mut mstg, &mut worklist, follower, node, &mut stats);
            }
        }

        stats.metastates = mstg.node_count();
        stats.states = mstg
            .node_indices()
            .map(|n| mstg[n].cpus.iter().map(|c| c.graph.node_count()).sum::<usize>())
            .sum();
        info!(
            metastates = stats.metastates,
            states = stats.states,
            sync_points = stats.sync_points,
            "timing exploration finished"
        );
        Ok(MultiRun {
            mstg,
            root,
            gcf_edges: std::mem::take(&mut self.gcf),
            stats,
        })
    }

    /// One root per CPU: autostart tasks at their entry blocks, the
    /// highest-priority one scheduled, everything else dormant.
    fn initial_roots(&mut self, instances: &InstanceGraph) -> Result<Vec<MultiState>> {
        let cpu_count = instances
            .runnable()
            .map(|(_, inst)| inst.cpu + 1)
            .max()
            .ok_or(ExplorationError::MissingInstanceGraph)?;
        let zero = IntervalList::single(TimeInterval { min: 0, max: 0 });
        let mut roots = Vec::with_capacity(cpu_count);
        for cpu in 0..cpu_count {
            let mut state = MultiState::new(cpu, self.worlds.fresh());
            state.global_times = zero.clone();
            state.local_times = zero.clone();
            let mut autostart = Vec::new();
            for (id, inst) in instances.runnable() {
                if inst.cpu != cpu {
                    continue;
                }
                let location = if inst.is_autostart() {
                    inst.entry.and_then(|f| self.cfg.entry_block(f))
                } else {
                    None
                };
                state.add_entity(id, location);
                if inst.is_autostart() {
                    autostart.push(id);
                }
            }
            autostart.sort_by_key(|&id| std::cmp::Reverse(priority_of(instances, id)));
            state.scheduled.set_all(autostart.first().copied());
            state.activated_tasks.set_all(autostart);
            roots.push(state);
        }
        Ok(roots)
    }

    /// Drain one CPU's worklist, interleaved with ISR activation passes
    /// until neither produces new work.
    fn run_cpu(
        &mut self,
        meta: &mut MetaState,
        cpu: CpuId,
        instances: &InstanceGraph,
        stats: &mut MultiSseStats,
    ) -> Result<()> {
        let mut isr_done: FnvHashSet<NodeIndex> = FnvHashSet::default();
        loop {
            while let Some(node) = meta.cpus[cpu].pending.pop() {
                self.step_state(meta, cpu, node, instances, stats)?;
            }
            let mut progressed = false;
            let candidates: Vec<NodeIndex> = meta.cpus[cpu]
                .graph
                .node_indices()
                .filter(|n| !isr_done.contains(n))
                .collect();
            for node in candidates {
                isr_done.insert(node);
                let state = meta.cpus[cpu].graph[node].clone();
                if state.current_isr.resolved() != Some(&None)
                    || state.interrupts_enabled.resolved() != Some(&true)
                {
                    continue;
                }
                let mut entries = self.os.handle_isr(self.cfg, &state, &mut self.worlds)?;
                stats.isr_activations += entries.len();
                // Weakly-distinguished activation alternatives collapse
                // into one representative per source vertex, with distinct
                // worlds so every alternative stays addressable.
                let representative = if entries.len() > 1 {
                    for entry in &mut entries {
                        let world = self.worlds.fresh();
                        entry.assign_world(world);
                    }
                    compress(&entries)
                } else {
                    entries.pop()
                };
                if let Some(entry) = representative {
                    Self::add_successor(
                        &mut meta.cpus[cpu],
                        node,
                        entry,
                        StepKind::IsrEntry,
                        &self.bounds,
                        stats,
                    );
                    progressed = true;
                }
            }
            if !progressed && meta.cpus[cpu].pending.is_empty() {
                return Ok(());
            }
        }
    }

    fn step_state(
        &mut self,
        meta: &mut MetaState,
        cpu: CpuId,
        node: NodeIndex,
        instances: &InstanceGraph,
        stats: &mut MultiSseStats,
    ) -> Result<()> {
        let state = meta.cpus[cpu].graph[node].clone();

        if !state.is_control_resolved() {
            for part in state.split() {
                Self::add_successor(
                    &mut meta.cpus[cpu],
                    node,
                    part,
                    StepKind::Flow,
                    &self.bounds,
                    stats,
                );
            }
            return Ok(());
        }

        let Some(entity) = state.running_entity() else {
            // Idle core: only a timed event can wake it.
            if let Some(event) = self.os.next_timed_event(state.last_event_time, instances, cpu) {
                let earliest = state.global_times.min().unwrap_or(0);
                if event.time >= earliest {
                    stats.timed_events += 1;
                    let mut at_event = state.clone();
                    at_event.global_times = IntervalList::single(TimeInterval {
                        min: event.time,
                        max: event.time,
                    });
                    at_event.last_event_time = event.time;
                    for next in self.os.execute_event(self.cfg, &event, at_event)? {
                        Self::add_successor(
                            &mut meta.cpus[cpu],
                            node,
                            next,
                            StepKind::TimedEvent,
                            &self.bounds,
                            stats,
                        );
                    }
                }
            }
            return Ok(());
        };
        let Some(block) = state.location_of(entity) else {
            return Ok(());
        };

        match self.cfg.block(block).kind {
            AbbKind::Syscall => {
                if self.os.is_cross_core_syscall(self.cfg, block, &state, cpu) {
                    let parked = meta.sync_states.entry(cpu).or_default();
                    if !parked.contains(&node) {
                        parked.push(node);
                    }
                    return Ok(());
                }
                let (flowing, fired) = self.advance_state(
                    &state,
                    self.os.min_time(self.cfg, block),
                    self.os.max_time(self.cfg, block),
                    cpu,
                    instances,
                    stats,
                )?;
                for next in fired {
                    Self::add_successor(
                        &mut meta.cpus[cpu],
                        node,
                        next,
                        StepKind::TimedEvent,
                        &self.bounds,
                        stats,
                    );
                }
                let Some(advanced) = flowing else {
                    return Ok(());
                };
                let results = self.os.interpret(self.cfg, block, advanced, cpu)?;
                // Alternatives produced by the model need distinct world
                // ids to survive a later compression.
                let fresh_worlds = results.len() > 1;
                for mut next in results {
                    if fresh_worlds {
                        let world = self.worlds.fresh();
                        next.assign_world(world);
                    }
                    self.record_gcf(cpu, block, &state, &next);
                    Self::add_successor(
                        &mut meta.cpus[cpu],
                        node,
                        next,
                        StepKind::Syscall,
                        &self.bounds,
                        stats,
                    );
                }
            }
            AbbKind::Call => {
                let targets = self.cfg.successors(block, FlowKind::Interprocedural);
                let mut handled = false;
                for target in targets {
                    let site = CallSite {
                        block,
                        callee: self.cfg.function_of(target),
                    };
                    let mut path = state.call_path_of(entity);
                    if !path.push(site) {
                        // Recursion: the cycle degrades to local flow below.
                        continue;
                    }
                    let mut next = state.clone();
                    next.set_call_path(entity, path);
                    next.set_location(entity, Some(target));
                    Self::add_successor(
                        &mut meta.cpus[cpu],
                        node,
                        next,
                        StepKind::Flow,
                        &self.bounds,
                        stats,
                    );
                    handled = true;
                }
                if !handled {
                    for succ in self.cfg.successors(block, FlowKind::Local) {
                        let mut next = state.clone();
                        next.set_location(entity, Some(succ));
                        Self::add_successor(
                            &mut meta.cpus[cpu],
                            node,
                            next,
                            StepKind::Flow,
                            &self.bounds,
                            stats,
                        );
                    }
                }
            }
            AbbKind::Computation => {
                let (flowing, fired) = self.advance_state(
                    &state,
                    self.os.min_time(self.cfg, block),
                    self.os.max_time(self.cfg, block),
                    cpu,
                    instances,
                    stats,
                )?;
                for next in fired {
                    Self::add_successor(
                        &mut meta.cpus[cpu],
                        node,
                        next,
                        StepKind::TimedEvent,
                        &self.bounds,
                        stats,
                    );
                }
                let Some(advanced) = flowing else {
                    return Ok(());
                };
                let path = state.call_path_of(entity);
                if self.cfg.block(block).is_exit && !path.is_empty() {
                    // Function return: resume after the popped call site.
                    let mut popped = path;
                    if let Some(site) = popped.pop() {
                        for succ in self.cfg.successors(site.block, FlowKind::Local) {
                            let mut next = advanced.clone();
                            next.set_call_path(entity, popped.clone());
                            next.set_location(entity, Some(succ));
                            Self::add_successor(
                                &mut meta.cpus[cpu],
                                node,
                                next,
                                StepKind::Flow,
                                &self.bounds,
                                stats,
                            );
                        }
                    }
                } else if self.cfg.block(block).is_exit {
                    if state.current_isr.resolved().copied().flatten() == Some(entity) {
                        for next in self.os.exit_isr(self.cfg, advanced)? {
                            Self::add_successor(
                                &mut meta.cpus[cpu],
                                node,
                                next,
                                StepKind::Flow,
                                &self.bounds,
                                stats,
                            );
                        }
                    } else {
                        // Top-level return: the entity terminates and the
                        // highest-priority remaining activated task runs.
                        let mut next = advanced;
                        next.set_location(entity, None);
                        let mut remaining = next
                            .activated_tasks
                            .resolved()
                            .cloned()
                            .unwrap_or_default();
                        remaining.retain(|&t| t != entity);
                        let successor = remaining
                            .iter()
                            .copied()
                            .max_by_key(|&t| priority_of(instances, t));
                        next.activated_tasks.set_all(remaining);
                        next.scheduled.set_all(successor);
                        Self::add_successor(
                            &mut meta.cpus[cpu],
                            node,
                            next,
                            StepKind::Flow,
                            &self.bounds,
                            stats,
                        );
                    }
                } else {
                    for succ in self.cfg.successors(block, FlowKind::Local) {
                        let mut next = advanced.clone();
                        next.set_location(entity, Some(succ));
                        Self::add_successor(
                            &mut meta.cpus[cpu],
                            node,
                            next,
                            StepKind::Flow,
                            &self.bounds,
                            stats,
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Advance a state's time windows by `[bcet, wcet]`, clamped at the
    /// next timed event. Returns the flowing successor (when any window
    /// survives the clamp) and the event successors (when the event time
    /// falls into the execution window).
    fn advance_state(
        &mut self,
        state: &MultiState,
        bcet: u64,
        wcet: u64,
        cpu: CpuId,
        instances: &InstanceGraph,
        stats: &mut MultiSseStats,
    ) -> Result<(Option<MultiState>, Vec<MultiState>)> {
        let event = self.os.next_timed_event(state.last_event_time, instances, cpu);
        let limit = event.as_ref().map(|e| e.time);
        let mut flowing = state.clone();
        let feasible = flowing.advance_time(bcet, wcet, limit);
        let mut fired = Vec::new();
        if let Some(event) = event {
            let reachable = state.global_times.min().is_some_and(|lo| lo <= event.time)
                && state
                    .global_times
                    .max()
                    .is_some_and(|hi| hi.saturating_add(wcet) >= event.time);
            if reachable {
                stats.timed_events += 1;
                let mut at_event = state.clone();
                at_event.global_times = IntervalList::single(TimeInterval {
                    min: event.time,
                    max: event.time,
                });
                at_event.last_event_time = event.time;
                fired = self.os.execute_event(self.cfg, &event, at_event)?;
                for s in &mut fired {
                    s.last_event_time = event.time;
                }
            }
        }
        Ok((feasible.then_some(flowing), fired))
    }

    /// Insert a successor state into a CPU graph, deduplicating by control
    /// equality. New time windows merge into an existing vertex and
    /// schedule it for re-exploration while its update budget lasts.
    fn add_successor(
        cpu_graph: &mut CpuGraph,
        from: NodeIndex,
        state: MultiState,
        kind: StepKind,
        bounds: &TimingBounds,
        stats: &mut MultiSseStats,
    ) {
        if let Some(horizon) = bounds.horizon {
            if state.min_global().is_some_and(|lo| lo > horizon) {
                stats.bounded_cutoffs += 1;
                return;
            }
        }
        let existing = cpu_graph
            .graph
            .node_indices()
            .find(|&n| cpu_graph.graph[n].same_control(&state));
        match existing {
            Some(n) => {
                let vertex = &mut cpu_graph.graph[n];
                let before = vertex.global_times.clone();
                vertex.global_times.merge(&state.global_times);
                vertex.local_times.merge(&state.local_times);
                if vertex.global_times != before {
                    vertex.updates += 1;
                    if vertex.updates <= bounds.max_state_updates {
                        cpu_graph.pending.push(n);
                    } else {
                        stats.bounded_cutoffs += 1;
                    }
                }
                if cpu_graph.graph.find_edge(from, n).is_none() {
                    cpu_graph.graph.add_edge(from, n, kind);
                }
            }
            None => {
                let n = cpu_graph.graph.add_node(state);
                cpu_graph.graph.add_edge(from, n, kind);
                cpu_graph.pending.push(n);
            }
        }
    }

    /// Resolve every parked cross-core syscall against a compressed,
    /// time-feasible representative of each foreign CPU. One follower
    /// metastate per feasible sync point.
    fn cross_core_sync(
        &mut self,
        meta: &MetaState,
        stats: &mut MultiSseStats,
    ) -> Result<Vec<MetaState>> {
        let mut out = Vec::new();
        for (&cpu, nodes) in &meta.sync_states {
            for &node in nodes {
                let local = &meta.cpus[cpu].graph[node];
                let Some(entity) = local.running_entity() else {
                    continue;
                };
                let Some(block) = local.location_of(entity) else {
                    continue;
                };
                let mut window = local.global_times.clone();
                let mut remote = Vec::new();
                let mut feasible = true;
                for other in 0..meta.cpu_count() {
                    if other == cpu {
                        continue;
                    }
                    let mut partners: Vec<MultiState> = meta.cpus[other]
                        .graph
                        .node_indices()
                        .map(|n| meta.cpus[other].graph[n].clone())
                        .filter(|s| s.global_times.overlaps(&window))
                        .collect();
                    // Distinct worlds per partner so compression keeps
                    // every alternative addressable.
                    for partner in &mut partners {
                        let world = self.worlds.fresh();
                        partner.assign_world(world);
                    }
                    let Some(representative) = compress(&partners) else {
                        feasible = false;
                        break;
                    };
                    window = window.intersect(&representative.global_times);
                    if window.is_empty() {
                        feasible = false;
                        break;
                    }
                    remote.push((other, representative));
                }
                if !feasible {
                    continue;
                }
                stats.sync_points += 1;
                debug!(
                    cpu,
                    block = self.cfg.block_name(block),
                    "resolving cross-core syscall"
                );
                let results = self.os.interpret_cross_core(self.cfg, block, local, &remote)?;

                let mut roots: Vec<MultiState> = (0..meta.cpu_count())
                    .map(|c| {
                        if c == cpu {
                            local.clone()
                        } else {
                            remote
                                .iter()
                                .find(|(rc, _)| *rc == c)
                                .map(|(_, r)| r.clone())
                                .unwrap_or_else(|| meta.root_state(c).clone())
                        }
                    })
                    .collect();
                for (c, s) in results {
                    roots[c] = s;
                }
                let advanced = window.advance(
                    self.os.min_time(self.cfg, block),
                    self.os.max_time(self.cfg, block),
                    None,
                );
                for root in &mut roots {
                    let world = self.worlds.fresh();
                    root.assign_world(world);
                    root.global_times = advanced.clone();
                    root.local_times = IntervalList::single(TimeInterval { min: 0, max: 0 });
                }
                out.push(MetaState::new(roots));
            }
        }
        Ok(out)
    }

    /// Intern a follower metastate: deduplicate by root control equality,
    /// merging new root windows into a known metastate and re-enqueueing
    /// it while its update budget lasts.
    fn intern(
        &mut self,
        mstg: &mut Mstg,
        worklist: &mut Vec<NodeIndex>,
        meta: MetaState,
        from: NodeIndex,
        stats: &mut MultiSseStats,
    ) {
        for n in mstg.node_indices() {
            if !mstg[n].same_roots(&meta) {
                continue;
            }
            let mut changed = false;
            for cpu in 0..meta.cpu_count() {
                let incoming = meta.root_state(cpu).global_times.clone();
                let root = mstg[n].cpus[cpu].root;
                let vertex = &mut mstg[n].cpus[cpu].graph[root];
                let before = vertex.global_times.clone();
                vertex.global_times.merge(&incoming);
                if vertex.global_times != before {
                    changed = true;
                }
            }
            if mstg.find_edge(from, n).is_none() {
                mstg.add_edge(from, n, StepKind::Sync);
            }
            if changed {
                mstg[n].updates += 1;
                if mstg[n].updates <= self.bounds.max_metastate_updates {
                    for cpu_graph in &mut mstg[n].cpus {
                        let root = cpu_graph.root;
                        cpu_graph.pending = vec![root];
                    }
                    if !worklist.contains(&n) {
                        worklist.push(n);
                    }
                } else {
                    stats.bounded_cutoffs += 1;
                }
            }
            return;
        }
        let n = mstg.add_node(meta);
        mstg.add_edge(from, n, StepKind::Sync);
        worklist.push(n);
    }

    fn record_gcf(&mut self, cpu: CpuId, source: AbbId, before: &MultiState, after: &MultiState) {
        let (Some(was), Some(now)) = (before.running_entity(), after.running_entity()) else {
            return;
        };
        if was == now {
            return;
        }
        let Some(target) = after.location_of(now) else {
            return;
        };
        let edge = GcfEdge {
            cpu,
            source,
            target,
        };
        if !self.gcf.contains(&edge) {
            self.gcf.push(edge);
        }
    }
}

fn priority_of(instances: &InstanceGraph, id: InstanceId) -> u32 {
    match &instances.get(id).kind {
        InstanceKind::Task { priority, .. } | InstanceKind::Isr { priority } => *priority,
        _ => 0,
    }
}
