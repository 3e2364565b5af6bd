//! Error taxonomy for the exploration engines
//!
//! Fatal errors always name the offending block and the call path that
//! reached it, so a failing exploration can be reproduced from the log
//! alone. Recursive call paths, infeasible timing intervals and empty
//! cross-core combinations are *not* errors; the engines narrow the
//! state space and keep going.

use thiserror::Error;

/// Errors surfaced by the exploration engines.
#[derive(Debug, Error)]
pub enum ExplorationError {
    /// The requested entry point does not exist in the control-flow graph.
    #[error("no function named '{0}' in the control-flow graph")]
    MissingEntryPoint(String),

    /// An analysis that needs a populated instance graph was started without one.
    #[error("instance graph is empty; run the instance-graph pass first")]
    MissingInstanceGraph,

    /// A call block has no call-graph edge, so no context-sensitive target exists.
    #[error("no call-graph edge for call site '{block}' (call path: {call_path})")]
    UnresolvedCallTarget { block: String, call_path: String },

    /// The OS model observed a state it cannot give a meaning to, e.g. a
    /// release syscall for an instance that was never created.
    #[error("inconsistent model at block '{block}' (call path: {call_path}): {reason}")]
    InconsistentModel {
        block: String,
        call_path: String,
        reason: String,
    },

    /// A timing-table entry does not match the control-flow graph.
    #[error("timing entry for block '{block}': {reason}")]
    BadTiming { block: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ExplorationError>;
