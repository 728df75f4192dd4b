//! Transition Engine
//!
//! The leader-side subsystem that executes a previously computed graph of
//! actions with synapse-level parallelism, confirming each action against
//! observed events and aborting cleanly when the cluster state changes
//! beneath it.

pub mod engine;
pub mod graph;
pub mod key;

pub use engine::{
    AbortAction, ActionDispatcher, ControlState, DispatchError, EngineNotification,
    EventMatch, LoadGovernor, NoThrottle, RunStatus, TransitionEngine, INFINITY,
};
pub use graph::{
    Action, ActionInput, ActionKind, ActionStatus, Graph, GraphError, GraphInput, Synapse,
    SynapseInput, SynapseState,
};
pub use key::{KeyParseError, TransitionKey, TransitionMagic};
