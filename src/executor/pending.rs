//! In-flight operation tracking.
//!
//! One record per dispatched resource operation, kept until the matching
//! result event arrives. Cancellation is two-phase: the record is marked
//! cancelled when the request goes out and only erased when the executor
//! confirms, so a second cancel cannot race the first.

use std::collections::HashMap;
use std::time::SystemTime;

use super::op::{AgentRc, OpKey};

/// One dispatched operation awaiting its result.
#[derive(Clone, Debug)]
pub struct PendingOp {
    pub call_id: u32,
    pub key: OpKey,
    pub start: SystemTime,
    /// Caller data echoed into the result (the transition key).
    pub user_data: Option<String>,
    /// The rc the scheduler expects.
    pub target_rc: AgentRc,
    /// Shutdown-lock expiry to apply if the op ends with the resource
    /// cleanly stopped here.
    pub lock_until: Option<SystemTime>,
    /// Erase the history entry once this op completes.
    pub remove_on_complete: bool,
    /// A cancel request has been sent; awaiting confirmation.
    pub cancelled: bool,
}

/// Table of pending operations, keyed by executor call id.
#[derive(Default)]
pub struct PendingTable {
    ops: HashMap<u32, PendingOp>,
}

impl PendingTable {
    pub fn new() -> Self {
        PendingTable::default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn insert(&mut self, op: PendingOp) {
        self.ops.insert(op.call_id, op);
    }

    pub fn get(&self, call_id: u32) -> Option<&PendingOp> {
        self.ops.get(&call_id)
    }

    /// Remove the record for a completed op.
    pub fn complete(&mut self, call_id: u32) -> Option<PendingOp> {
        self.ops.remove(&call_id)
    }

    /// Locate a pending op by its operation key.
    pub fn find_by_key(&self, key: &OpKey) -> Option<&PendingOp> {
        self.ops.values().find(|op| &op.key == key)
    }

    /// Mark an op cancelled (phase one of cancellation). Returns the call
    /// id when a matching record exists; already-cancelled records are
    /// reported the same way so a double-cancel acks identically.
    pub fn mark_cancelled(&mut self, key: &OpKey) -> Option<u32> {
        let op = self.ops.values_mut().find(|op| &op.key == key)?;
        op.cancelled = true;
        Some(op.call_id)
    }

    pub fn mark_cancelled_by_id(&mut self, call_id: u32) -> Option<u32> {
        let op = self.ops.get_mut(&call_id)?;
        op.cancelled = true;
        Some(op.call_id)
    }

    /// Drop every pending op for a deleted resource, returning the records.
    pub fn remove_resource(&mut self, rsc_id: &str) -> Vec<PendingOp> {
        let ids: Vec<u32> = self
            .ops
            .values()
            .filter(|op| op.key.rsc_id == rsc_id)
            .map(|op| op.call_id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.ops.remove(&id))
            .collect()
    }

    /// Ops whose deadline (start + timeout) has passed.
    pub fn iter(&self) -> impl Iterator<Item = &PendingOp> {
        self.ops.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(call_id: u32, rsc: &str, task: &str, interval_ms: u32) -> PendingOp {
        PendingOp {
            call_id,
            key: OpKey::new(rsc, task, interval_ms),
            start: SystemTime::now(),
            user_data: None,
            target_rc: AgentRc::Ok,
            lock_until: None,
            remove_on_complete: false,
            cancelled: false,
        }
    }

    #[test]
    fn test_insert_and_complete() {
        let mut table = PendingTable::new();
        table.insert(pending(1, "db", "start", 0));

        assert!(table.get(1).is_some());
        let op = table.complete(1).unwrap();
        assert_eq!(op.key.task, "start");
        assert!(table.is_empty());
    }

    #[test]
    fn test_find_by_key() {
        let mut table = PendingTable::new();
        table.insert(pending(1, "db", "monitor", 10000));
        table.insert(pending(2, "web", "monitor", 10000));

        let found = table.find_by_key(&OpKey::new("web", "monitor", 10000)).unwrap();
        assert_eq!(found.call_id, 2);
        assert!(table.find_by_key(&OpKey::new("db", "stop", 0)).is_none());
    }

    #[test]
    fn test_double_cancel_is_idempotent() {
        let mut table = PendingTable::new();
        table.insert(pending(3, "db", "monitor", 10000));

        let key = OpKey::new("db", "monitor", 10000);
        let first = table.mark_cancelled(&key);
        let second = table.mark_cancelled(&key);
        assert_eq!(first, Some(3));
        assert_eq!(first, second);
        // Still present until the executor confirms.
        assert!(table.get(3).unwrap().cancelled);
    }

    #[test]
    fn test_remove_resource() {
        let mut table = PendingTable::new();
        table.insert(pending(1, "db", "start", 0));
        table.insert(pending(2, "db", "monitor", 10000));
        table.insert(pending(3, "web", "start", 0));

        let removed = table.remove_resource("db");
        assert_eq!(removed.len(), 2);
        assert_eq!(table.len(), 1);
        assert!(table.get(3).is_some());
    }
}
