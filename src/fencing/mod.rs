//! Fencing Coordinator
//!
//! Selects a device capable of acting on a target node, schedules the
//! chosen agent (one child per device at a time), multicasts the outcome to
//! all peers, and falls back through the remaining capable devices when an
//! attempt fails. Successful fencing of a cluster node updates every peer's
//! membership view; a notification naming the local node is terminal.

pub mod coordinator;
pub mod device;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::executor::AgentRc;

pub use coordinator::{
    apply_notification, self_fence_exit, FencingCoordinator, NotificationDisposition,
};
pub use device::{
    parse_host_list, parse_host_map, FencingDevice, HostCheck, HostMapError,
    ATTR_HOST_CHECK, ATTR_HOST_LIST, ATTR_HOST_MAP, ATTR_PRIORITY,
};

/// Actions whose successful outcome is broadcast cluster-wide so every
/// peer updates its membership view.
pub const FENCE_ACTIONS: [&str; 5] = ["off", "reboot", "on", "poweroff", "poweron"];

/// Device id used for operator-injected manual confirmations.
pub const MANUAL_ACK_DEVICE: &str = "manual_ack";

/// Errors from the fencing coordinator.
#[derive(Debug, Clone)]
pub enum FencingError {
    /// No registered device can fence the target.
    NoDeviceAvailable { target: String },
    UnknownDevice(String),
    /// A host-check invocation returned something other than yes or no.
    HostCheckFailed { device: String, rc: AgentRc },
}

impl fmt::Display for FencingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FencingError::NoDeviceAvailable { target } => {
                write!(f, "No fencing device can act on '{}'", target)
            }
            FencingError::UnknownDevice(id) => write!(f, "Unknown fencing device '{}'", id),
            FencingError::HostCheckFailed { device, rc } => {
                write!(f, "Host check via '{}' failed with rc {}", device, rc)
            }
        }
    }
}

impl std::error::Error for FencingError {}

/// Where a fencing request came from, and therefore where its final
/// outcome is delivered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOrigin {
    /// A peer node, by name.
    Peer(String),
    /// A local client (the transition engine or an admin tool), by id.
    Local(String),
}

/// One fencing request.
#[derive(Clone, Debug)]
pub struct FencingCommand {
    pub action: String,
    /// Node to act on; device-level actions (monitor, list) have none.
    pub victim: Option<String>,
    pub timeout: Duration,
    pub origin: CommandOrigin,
    /// Correlation reference echoed into the outcome.
    pub reference: String,
}

/// Cluster-wide notification of a fencing outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FencingNotification {
    pub target: String,
    pub action: String,
    /// 0 on success.
    pub rc: i32,
    pub device: Option<String>,
    /// Node that ran the agent.
    pub executioner: String,
    /// Client whose request started this (the DC's engine, an admin tool,
    /// or something outside the cluster entirely).
    pub client_origin: Option<String>,
    pub reference: String,
}

impl FencingNotification {
    pub fn succeeded(&self) -> bool {
        self.rc == 0
    }
}

/// Final outcome returned directly to a request's originator when it is
/// not broadcast (device actions, and fencing that exhausted all devices).
#[derive(Clone, Debug)]
pub struct FencingResult {
    pub reference: String,
    pub target: Option<String>,
    pub rc: i32,
    pub device: Option<String>,
    pub origin: CommandOrigin,
}

impl FencingResult {
    pub fn succeeded(&self) -> bool {
        self.rc == 0
    }
}
