//! Configuration and attribute store collaborators.
//!
//! The shared configuration store (where resource operation history and
//! node states are recorded) and the attribute store (transient per-node
//! attributes such as the probed flag and fail counts) are external
//! services. The core talks to them through these traits; tests plug in
//! recording mocks.

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::executor::OpEvent;

/// Options on a configuration-store update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreOpts {
    /// Apply even without quorum. Used when recording fencing outcomes, so
    /// a node that has just lost quorum can still record that it was
    /// fenced.
    pub quorum_override: bool,
}

/// Key for optimistic history erasure: a delete naming a call id older
/// than what the store holds is a no-op.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EraseKey {
    pub node: String,
    pub rsc_id: String,
    pub op_key: String,
    pub call_id: u32,
}

/// Errors from the store collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Update rejected: {0}")]
    Rejected(String),
}

/// The shared cluster configuration store.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Record one operation result in a node's resource history, with an
    /// optional shutdown-lock time pinning the resource to the node.
    async fn record_op(
        &self,
        node: &str,
        op: &OpEvent,
        lock_until: Option<SystemTime>,
        opts: StoreOpts,
    ) -> Result<(), StoreError>;

    /// Remove all recorded history for a resource on a node.
    async fn delete_resource_history(
        &self,
        node: &str,
        rsc_id: &str,
        opts: StoreOpts,
    ) -> Result<(), StoreError>;

    /// Optimistically erase one recorded op.
    async fn erase_op(&self, key: &EraseKey, opts: StoreOpts) -> Result<(), StoreError>;

    /// Record that a node was fenced: state down, expected down, join
    /// reset. Submitted with quorum override.
    async fn stonith_update(
        &self,
        target: &str,
        target_uuid: &str,
        opts: StoreOpts,
    ) -> Result<(), StoreError>;
}

/// The transient attribute store.
#[async_trait]
pub trait AttrStore: Send + Sync {
    /// Unset the "has been probed" flag for a node, prompting the policy
    /// engine to re-emit probes. Also refreshes the legacy timestamp
    /// attribute so older peers notice.
    async fn clear_probed(&self, node: &str) -> Result<(), StoreError>;

    /// Reset the fencing fail count for a target after a successful fence.
    async fn clear_fail_count(&self, target: &str) -> Result<(), StoreError>;

    /// Read back arbitrary attributes (used by tests and status surfaces).
    async fn attributes(&self, node: &str) -> Result<HashMap<String, String>, StoreError>;
}
