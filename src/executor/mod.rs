//! Local Resource Executor Interface
//!
//! Per-node state tracking and the proxy that drives resource agents. One
//! connection exists per target node, either local (trusted transport) or
//! remote (authenticated, framed stream); both present the same operation
//! surface. The interface caches recurring-operation state, records history
//! to the configuration store, and synthesizes results when the executor
//! cannot be reached so the transition engine always sees a deterministic
//! completion.

pub mod history;
pub mod local;
pub mod node;
pub mod op;
pub mod pending;
pub mod remote;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

pub use history::{HistoryEntry, HistoryMap, HistoryOutcome, ResourceSpec};
pub use local::{LocalBackend, LocalExecutor};
pub use node::{NodeExecutor, NodeExecutorUpdate};
pub use op::{
    instance_params, validate_rsc_id, AgentRc, ExecRequest, OpEvent, OpKey, OpKeyError,
    OpOrigin, OpStatus,
};
pub use pending::{PendingOp, PendingTable};
pub use remote::{PskCache, RemoteExecutor, EXECUTOR_PROTOCOL_VERSION};

/// Result type for executor operations.
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Errors surfaced by an executor connection.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Connection lost or never established; retryable at the caller's
    /// discretion.
    #[error("Not connected to the executor")]
    NotConnected,

    /// Protocol-version or token mismatch; fatal for this connection.
    #[error("Executor protocol mismatch: {0}")]
    Protocol(String),

    /// The synchronous wait for a reply expired.
    #[error("Timed out waiting for executor reply to request {0}")]
    ReplyTimeout(u32),

    /// Request refused because the caller lacks privileges.
    #[error("Operation not authorized: {0}")]
    NotAuthorized(String),

    /// Bad request or malformed resource definition; not retryable.
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// The named resource is not registered.
    #[error("Resource '{0}' not found")]
    NoSuchResource(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    /// The status/rc pair a synthesized result event should carry for this
    /// failure, so the transition engine treats it appropriately.
    pub fn synth_result(&self) -> (OpStatus, AgentRc) {
        match self {
            ExecutorError::NotConnected => (OpStatus::NotConnected, AgentRc::UnknownError),
            ExecutorError::Protocol(_) => (OpStatus::NotConnected, AgentRc::UnknownError),
            ExecutorError::ReplyTimeout(_) => (OpStatus::Timeout, AgentRc::UnknownError),
            ExecutorError::NotAuthorized(_) => {
                (OpStatus::Error, AgentRc::InsufficientPriv)
            }
            ExecutorError::Invalid(_) => (OpStatus::Invalid, AgentRc::NotConfigured),
            ExecutorError::NoSuchResource(_) => (OpStatus::Invalid, AgentRc::NotConfigured),
            ExecutorError::Serialization(_) => (OpStatus::Invalid, AgentRc::NotConfigured),
            ExecutorError::Io(_) => (OpStatus::NotConnected, AgentRc::UnknownError),
        }
    }
}

/// Metadata describing a registered resource.
#[derive(Clone, Debug)]
pub struct RscInfo {
    pub id: String,
    pub spec: ResourceSpec,
}

/// The operation surface every executor transport provides.
#[async_trait]
pub trait ExecutorApi: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    fn is_connected(&self) -> bool;

    async fn register_rsc(&self, id: &str, spec: &ResourceSpec) -> Result<()>;
    async fn unregister_rsc(&self, id: &str) -> Result<()>;
    async fn rsc_info(&self, id: &str) -> Result<RscInfo>;

    async fn list_standards(&self) -> Result<Vec<String>>;
    async fn list_agents(&self, standard: &str) -> Result<Vec<String>>;
    async fn list_providers(&self, agent: &str) -> Result<Vec<String>>;
    async fn metadata(&self, spec: &ResourceSpec) -> Result<String>;

    /// Dispatch an operation; returns the executor-assigned call id.
    async fn exec(&self, request: &ExecRequest) -> Result<u32>;

    /// Ask the executor to cancel a (recurring) op by key.
    async fn cancel(&self, key: &OpKey) -> Result<()>;

    async fn list_recurring(&self, rsc_id: &str) -> Result<Vec<OpKey>>;

    /// Liveness probe.
    async fn poke(&self) -> Result<()>;

    /// Subscribe to result events from this connection.
    fn subscribe(&self) -> broadcast::Receiver<OpEvent>;
}

/// One executor connection: local trusted transport or remote
/// authenticated stream. Both variants implement [`ExecutorApi`]; the enum
/// exists so per-node state can hold either without a trait object.
pub enum ExecutorConnection {
    Local(LocalExecutor),
    Remote(RemoteExecutor),
}

impl ExecutorConnection {
    pub fn api(&self) -> &dyn ExecutorApi {
        match self {
            ExecutorConnection::Local(inner) => inner,
            ExecutorConnection::Remote(inner) => inner,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ExecutorConnection::Remote(_))
    }
}
