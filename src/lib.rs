//! Sendero - Static state-space exploration for embedded real-time systems
//!
//! This library explores every reachable system state of an RTOS
//! application without executing it: a call-path-sensitive walker over
//! atomic basic blocks, builders that recover the kernel-object instance
//! graph and the interactions between instances, and a timing-aware
//! multi-core engine that carries BCET/WCET windows through the
//! exploration. OS semantics are pluggable through the model traits in
//! [`os`].

pub mod call_path;
pub mod cfg;
pub mod error;
pub mod instance;
pub mod interval;
pub mod multisse;
pub mod multistate;
pub mod os;
pub mod sse;
pub mod state;
pub mod timing;

pub use cfg::Cfg;
pub use error::{ExplorationError, Result};
pub use instance::InstanceGraph;
pub use multisse::{MultiSseEngine, TimingBounds};
pub use os::{OsModel, TimedOsModel};
pub use sse::{InstanceGraphBuilder, InteractionBuilder, SseEngine};
