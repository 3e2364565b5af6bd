//! Operating-system model contract and syscall dispatch
//!
//! The engines know nothing about any concrete RTOS. They hand every
//! syscall block to an [`OsModel`] and fold the returned states back into
//! the exploration. Models register their syscalls in a closed
//! [`SyscallRegistry`]: one record per name, resolved at model
//! construction, with an explicit stub path for names the model does not
//! know. The timing-aware engine talks to the richer [`TimedOsModel`]
//! surface.

use crate::cfg::{AbbId, Cfg, FlowKind};
use crate::error::{ExplorationError, Result};
use crate::instance::{CpuId, InstanceGraph, InstanceId};
use crate::multistate::{MultiState, Worlds};
use crate::state::State;
use fnv::FnvHashMap;
use tracing::warn;

/// The category a syscall effect belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyscallCategory {
    /// The syscall creates a kernel object.
    Create,
    /// The syscall communicates between kernel objects.
    Comm,
}

/// A set of syscall categories, used both to classify registry entries and
/// to filter which effects an analysis wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CategorySet(u8);

impl CategorySet {
    pub const NONE: CategorySet = CategorySet(0);
    pub const CREATE: CategorySet = CategorySet(0b01);
    pub const COMM: CategorySet = CategorySet(0b10);
    /// Matches every categorized and uncategorized syscall.
    pub const EVERY: CategorySet = CategorySet(0b11);

    pub fn contains(self, category: SyscallCategory) -> bool {
        match category {
            SyscallCategory::Create => self.0 & Self::CREATE.0 != 0,
            SyscallCategory::Comm => self.0 & Self::COMM.0 != 0,
        }
    }

    pub fn intersects(self, other: CategorySet) -> bool {
        self.0 & other.0 != 0
    }
}

impl From<SyscallCategory> for CategorySet {
    fn from(category: SyscallCategory) -> Self {
        match category {
            SyscallCategory::Create => CategorySet::CREATE,
            SyscallCategory::Comm => CategorySet::COMM,
        }
    }
}

impl std::ops::BitOr for CategorySet {
    type Output = CategorySet;
    fn bitor(self, rhs: CategorySet) -> CategorySet {
        CategorySet(self.0 | rhs.0)
    }
}

/// Handler signature for a registered syscall.
///
/// The handler receives the pre-syscall state by value and returns the
/// post-syscall state(s); it is responsible for advancing control past the
/// block, usually via [`advance_past`].
pub type SyscallHandler<M> = fn(&mut M, &Cfg, AbbId, State) -> Result<Vec<State>>;

/// One registry record: categories plus handler.
pub struct SyscallSpec<M> {
    pub categories: CategorySet,
    pub handler: SyscallHandler<M>,
}

/// Closed name-to-handler table, resolved once at model construction.
pub struct SyscallRegistry<M> {
    entries: FnvHashMap<String, SyscallSpec<M>>,
}

impl<M> Default for SyscallRegistry<M> {
    fn default() -> Self {
        Self {
            entries: FnvHashMap::default(),
        }
    }
}

impl<M> SyscallRegistry<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, categories: CategorySet, handler: SyscallHandler<M>) {
        self.entries.insert(
            name.to_string(),
            SyscallSpec {
                categories,
                handler,
            },
        );
    }

    pub fn categories_of(&self, name: &str) -> Option<CategorySet> {
        self.entries.get(name).map(|spec| spec.categories)
    }

    /// Dispatch a syscall block against the registry.
    ///
    /// A syscall outside the requested `filter` advances control with no
    /// model effect; an unknown syscall does the same after a warning (the
    /// explicit stub case).
    pub fn dispatch(
        &self,
        model: &mut M,
        cfg: &Cfg,
        block: AbbId,
        state: State,
        filter: CategorySet,
    ) -> Result<Vec<State>> {
        let name = cfg
            .syscall_name(block)
            .ok_or_else(|| ExplorationError::InconsistentModel {
                block: cfg.block_name(block).to_string(),
                call_path: state.call_path.to_string(),
                reason: "syscall block without a resolved syscall name".into(),
            })?;
        match self.entries.get(name) {
            Some(spec) if spec.categories.intersects(filter) => {
                (spec.handler)(model, cfg, block, state)
            }
            Some(_) => Ok(advance_past(cfg, block, &state)),
            None => {
                warn!(syscall = name, block = cfg.block_name(block), "unknown syscall, treating as no-op");
                Ok(advance_past(cfg, block, &state))
            }
        }
    }
}

/// Fork `state` onto every local successor of `block`. The standard way a
/// handler resumes control after a syscall.
pub fn advance_past(cfg: &Cfg, block: AbbId, state: &State) -> Vec<State> {
    cfg.successors(block, FlowKind::Local)
        .into_iter()
        .map(|next| state.fork_to(next))
        .collect()
}

/// Contract between the single-core engines and an OS model.
pub trait OsModel {
    /// Prepare the entry state of a fresh exploration run.
    fn init(&mut self, _cfg: &Cfg, _state: &mut State) {}

    /// Interpret a syscall block, restricted to the given category filter.
    fn interpret(
        &mut self,
        cfg: &Cfg,
        block: AbbId,
        state: State,
        filter: CategorySet,
    ) -> Result<Vec<State>>;

    /// Categories of a syscall name, for reachability pruning.
    fn syscall_categories(&self, name: &str) -> CategorySet;
}

/// A timed event produced by the OS model (e.g. a periodic alarm firing).
#[derive(Debug, Clone, PartialEq)]
pub struct TimedEvent {
    /// Absolute time of the event in abstract ticks.
    pub time: u64,
    pub name: String,
    /// The instance the event belongs to, when it has one (e.g. an alarm).
    pub instance: Option<InstanceId>,
}

/// Contract between the multi-core timing engine and an OS model.
pub trait TimedOsModel {
    /// Earliest execution time of a block in abstract ticks.
    fn min_time(&self, cfg: &Cfg, block: AbbId) -> u64 {
        cfg.block(block).bcet
    }

    /// Latest execution time of a block in abstract ticks.
    fn max_time(&self, cfg: &Cfg, block: AbbId) -> u64 {
        cfg.block(block).wcet
    }

    /// Interpret an on-core syscall block for the given CPU.
    fn interpret(
        &mut self,
        cfg: &Cfg,
        block: AbbId,
        state: MultiState,
        cpu: CpuId,
    ) -> Result<Vec<MultiState>>;

    /// Must this syscall be resolved jointly with other cores?
    fn is_cross_core_syscall(&self, cfg: &Cfg, block: AbbId, state: &MultiState, cpu: CpuId)
        -> bool;

    /// Interpret a cross-core syscall. `local` is the syscalling state;
    /// `remote` carries one compressed representative per foreign CPU.
    /// Returns the post-syscall root state for every participating CPU.
    fn interpret_cross_core(
        &mut self,
        cfg: &Cfg,
        block: AbbId,
        local: &MultiState,
        remote: &[(CpuId, MultiState)],
    ) -> Result<Vec<(CpuId, MultiState)>>;

    /// Next timed event strictly after `after` on the given CPU, if any.
    fn next_timed_event(
        &self,
        after: u64,
        instances: &InstanceGraph,
        cpu: CpuId,
    ) -> Option<TimedEvent>;

    /// Execute a timed event whose time fell into the state's window.
    fn execute_event(
        &mut self,
        cfg: &Cfg,
        event: &TimedEvent,
        state: MultiState,
    ) -> Result<Vec<MultiState>>;

    /// Produce ISR-entry states for a state with interrupts enabled. One
    /// result per ISR that could fire here; empty when none can.
    fn handle_isr(
        &mut self,
        cfg: &Cfg,
        state: &MultiState,
        worlds: &mut Worlds,
    ) -> Result<Vec<MultiState>>;

    /// Return from the currently running ISR to the interrupted context.
    fn exit_isr(&mut self, cfg: &Cfg, state: MultiState) -> Result<Vec<MultiState>>;
}
