//! Single-core exploration states
//!
//! A [`State`] is one vertex of the system-state transition graph: the
//! blocks still awaiting execution, the interprocedural context, and an
//! owned snapshot of the instance graph. States are never mutated in
//! place once stored; every exploration step clones and modifies.

use crate::call_path::CallPath;
use crate::cfg::AbbId;
use crate::instance::{InstanceGraph, InstanceId};
use std::fmt;

/// One control state of the single-core exploration.
#[derive(Debug, Clone, Default)]
pub struct State {
    /// Blocks awaiting execution. Usually a single block; entry states and
    /// OS-model results may carry several.
    pub next_abbs: Vec<AbbId>,
    pub call_path: CallPath,
    /// Owned snapshot; forking a state forks the graph (copy-on-fork).
    pub instances: InstanceGraph,
    /// This state was reached through a conditional path.
    pub branch: bool,
    /// This state was reached inside a loop.
    pub in_loop: bool,
    /// The scheduler was already enabled when this state was entered.
    pub scheduler_on: bool,
    /// The instance (task or ISR) currently running, when known.
    pub running: Option<InstanceId>,
}

impl State {
    pub fn at(entry: AbbId) -> Self {
        State {
            next_abbs: vec![entry],
            ..Default::default()
        }
    }

    /// Fork with a single pending block, keeping everything else.
    pub fn fork_to(&self, abb: AbbId) -> Self {
        let mut fork = self.clone();
        fork.next_abbs = vec![abb];
        fork
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "State(branch: {}, loop: {}, blocks: {:?}, path: {})",
            self.branch,
            self.in_loop,
            self.next_abbs.iter().map(|a| a.index()).collect::<Vec<_>>(),
            self.call_path
        )
    }
}
