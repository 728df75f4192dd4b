//! Resource operation model.
//!
//! Status codes, agent exit-code mapping, the canonical operation key and
//! the result-event record that travels from the executor back to the
//! transition engine.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix of meta attributes in an operation's parameter table. Everything
/// else is an instance parameter and is captured for later stops.
pub const META_PREFIX: &str = "CRM_meta_";

/// Execution status of an operation, distinct from the agent's exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpStatus {
    Pending,
    Done,
    Cancelled,
    Timeout,
    NotSupported,
    Error,
    NotConnected,
    NotInstalled,
    Invalid,
}

impl OpStatus {
    pub fn as_i32(&self) -> i32 {
        match self {
            OpStatus::Pending => -1,
            OpStatus::Done => 0,
            OpStatus::Cancelled => 1,
            OpStatus::Timeout => 2,
            OpStatus::NotSupported => 3,
            OpStatus::Error => 4,
            OpStatus::NotConnected => 5,
            OpStatus::NotInstalled => 6,
            OpStatus::Invalid => 7,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            -1 => Some(OpStatus::Pending),
            0 => Some(OpStatus::Done),
            1 => Some(OpStatus::Cancelled),
            2 => Some(OpStatus::Timeout),
            3 => Some(OpStatus::NotSupported),
            4 => Some(OpStatus::Error),
            5 => Some(OpStatus::NotConnected),
            6 => Some(OpStatus::NotInstalled),
            7 => Some(OpStatus::Invalid),
            _ => None,
        }
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpStatus::Pending => "pending",
            OpStatus::Done => "complete",
            OpStatus::Cancelled => "cancelled",
            OpStatus::Timeout => "timed out",
            OpStatus::NotSupported => "unsupported",
            OpStatus::Error => "error",
            OpStatus::NotConnected => "not connected",
            OpStatus::NotInstalled => "not installed",
            OpStatus::Invalid => "invalid",
        };
        write!(f, "{}", name)
    }
}

/// Agent exit codes, following the OCF numbering. Unknown codes collapse to
/// [`AgentRc::UnknownError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentRc {
    Ok,
    UnknownError,
    InvalidParam,
    Unimplemented,
    InsufficientPriv,
    NotInstalled,
    NotConfigured,
    NotRunning,
    RunningPromoted,
    FailedPromoted,
}

impl AgentRc {
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => AgentRc::Ok,
            1 => AgentRc::UnknownError,
            2 => AgentRc::InvalidParam,
            3 => AgentRc::Unimplemented,
            4 => AgentRc::InsufficientPriv,
            5 => AgentRc::NotInstalled,
            6 => AgentRc::NotConfigured,
            7 => AgentRc::NotRunning,
            8 => AgentRc::RunningPromoted,
            9 => AgentRc::FailedPromoted,
            _ => AgentRc::UnknownError,
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            AgentRc::Ok => 0,
            AgentRc::UnknownError => 1,
            AgentRc::InvalidParam => 2,
            AgentRc::Unimplemented => 3,
            AgentRc::InsufficientPriv => 4,
            AgentRc::NotInstalled => 5,
            AgentRc::NotConfigured => 6,
            AgentRc::NotRunning => 7,
            AgentRc::RunningPromoted => 8,
            AgentRc::FailedPromoted => 9,
        }
    }
}

impl fmt::Display for AgentRc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

/// Errors from operation-key parsing and resource-id validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKeyError {
    /// Resource ids may not contain the key separator.
    SeparatorInResourceId(String),
    EmptyField,
    BadInterval(String),
    Malformed(String),
}

impl fmt::Display for OpKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKeyError::SeparatorInResourceId(id) => {
                write!(f, "Resource id '{}' contains the reserved separator '_'", id)
            }
            OpKeyError::EmptyField => write!(f, "Operation key has an empty field"),
            OpKeyError::BadInterval(raw) => {
                write!(f, "Operation key interval '{}' is not a number", raw)
            }
            OpKeyError::Malformed(key) => write!(f, "Malformed operation key '{}'", key),
        }
    }
}

impl std::error::Error for OpKeyError {}

/// Reject resource ids that would make operation keys ambiguous. Enforced
/// when resources are registered, so parsing can rely on it.
pub fn validate_rsc_id(rsc_id: &str) -> Result<(), OpKeyError> {
    if rsc_id.is_empty() {
        return Err(OpKeyError::EmptyField);
    }
    if rsc_id.contains('_') {
        return Err(OpKeyError::SeparatorInResourceId(rsc_id.to_string()));
    }
    Ok(())
}

/// Canonical identifier of an operation: `<resource>_<task>_<interval-ms>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpKey {
    pub rsc_id: String,
    pub task: String,
    pub interval_ms: u32,
}

impl OpKey {
    pub fn new(rsc_id: &str, task: &str, interval_ms: u32) -> Self {
        OpKey {
            rsc_id: rsc_id.to_string(),
            task: task.to_string(),
            interval_ms,
        }
    }

    /// Parse a key. The resource id is everything before the first
    /// separator (ids containing one are rejected at registration), the
    /// interval is everything after the last, and the task, which may
    /// itself contain separators (e.g. `migrate_to`), is the middle.
    pub fn parse(key: &str) -> Result<Self, OpKeyError> {
        let first = key
            .find('_')
            .ok_or_else(|| OpKeyError::Malformed(key.to_string()))?;
        let last = key.rfind('_').expect("find succeeded");
        if first == last {
            return Err(OpKeyError::Malformed(key.to_string()));
        }

        let rsc_id = &key[..first];
        let task = &key[first + 1..last];
        let interval_raw = &key[last + 1..];
        if rsc_id.is_empty() || task.is_empty() || interval_raw.is_empty() {
            return Err(OpKeyError::EmptyField);
        }
        let interval_ms = interval_raw
            .parse::<u32>()
            .map_err(|_| OpKeyError::BadInterval(interval_raw.to_string()))?;

        Ok(OpKey {
            rsc_id: rsc_id.to_string(),
            task: task.to_string(),
            interval_ms,
        })
    }

    pub fn is_recurring(&self) -> bool {
        self.interval_ms > 0
    }
}

impl fmt::Display for OpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.rsc_id, self.task, self.interval_ms)
    }
}

/// Where a result event came from. Synthesized events live in their own
/// call-id namespace and are routed on this flag, never on id magnitude.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpOrigin {
    Executor,
    Synthesized,
}

/// A request to run one operation on a resource.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecRequest {
    pub rsc_id: String,
    pub task: String,
    pub interval_ms: u32,
    pub timeout_ms: u64,
    /// Opaque caller data, carried through to the result event. The
    /// transition engine stores the transition key here.
    pub user_data: Option<String>,
    /// The rc the scheduler expects this op to return; anything else is a
    /// failure. A probe expecting "not running" sets this accordingly.
    pub target_rc: AgentRc,
    pub params: HashMap<String, String>,
    /// Shutdown-lock expiry to record if the op leaves the resource
    /// cleanly stopped on this node.
    #[serde(default)]
    pub lock_until_secs: Option<u64>,
}

impl ExecRequest {
    pub fn key(&self) -> OpKey {
        OpKey::new(&self.rsc_id, &self.task, self.interval_ms)
    }
}

/// A completed (or synthesized) operation result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpEvent {
    pub rsc_id: String,
    pub task: String,
    pub interval_ms: u32,
    pub call_id: u32,
    pub status: OpStatus,
    pub rc: AgentRc,
    pub user_data: Option<String>,
    pub params: Option<HashMap<String, String>>,
    pub origin: OpOrigin,
    /// The executor reports the resource itself is gone.
    #[serde(default)]
    pub rsc_deleted: bool,
    pub exit_reason: Option<String>,
}

impl OpEvent {
    pub fn key(&self) -> OpKey {
        OpKey::new(&self.rsc_id, &self.task, self.interval_ms)
    }

    pub fn is_recurring(&self) -> bool {
        self.interval_ms > 0
    }

    /// Did this op succeed relative to the rc the scheduler expected?
    pub fn succeeded(&self, target_rc: AgentRc) -> bool {
        self.status == OpStatus::Done && self.rc == target_rc
    }

    /// Did this op fail? Cancellations and still-pending ops are neither
    /// success nor failure.
    pub fn failed(&self, target_rc: AgentRc) -> bool {
        match self.status {
            OpStatus::Done => self.rc != target_rc,
            OpStatus::Cancelled | OpStatus::Pending => false,
            _ => true,
        }
    }
}

/// Extract the instance-scoped (non-meta) subset of an op's parameters.
pub fn instance_params(params: &HashMap<String, String>) -> HashMap<String, String> {
    params
        .iter()
        .filter(|(k, _)| !k.starts_with(META_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
