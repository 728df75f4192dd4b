pub mod agent;
pub mod cluster;
pub mod config;
pub mod executor;
pub mod fencing;
pub mod membership;
pub mod runtime;
pub mod store;
pub mod transition;

pub use config::{CorralConfig, FENCER_CONNECT_ATTEMPTS};
pub use runtime::{ControllerRuntime, FencerConnector, HandleOutcome, WireMessage};

pub use cluster::{BusError, ClusterBus, Envelope, MsgRecipient, MsgSender, MsgType, Outbox};
pub use executor::{
    AgentRc, ExecRequest, ExecutorApi, ExecutorConnection, ExecutorError, HistoryMap,
    LocalBackend, LocalExecutor, NodeExecutor, OpEvent, OpKey, OpStatus, RemoteExecutor,
    ResourceSpec,
};
pub use fencing::{
    FencingCommand, FencingCoordinator, FencingError, FencingNotification, FencingResult,
};
pub use membership::{JoinPhase, Liveness, PeerCache, PeerEvent, PeerFilter, PeerNode};
pub use store::{AttrStore, ConfigStore, StoreError, StoreOpts};
pub use transition::{
    AbortAction, ActionDispatcher, ControlState, EngineNotification, GraphInput,
    LoadGovernor, RunStatus, TransitionEngine, TransitionKey, TransitionMagic,
};
