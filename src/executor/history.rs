//! Per-resource operation history.
//!
//! One entry per resource on a node, tracking the most recent successful
//! and failed operations, the set of active recurring operations, and the
//! instance parameters the resource was last started with; a later stop
//! must use those, not whatever the configuration says by then.

use std::collections::HashMap;
use std::time::SystemTime;

use slog::{debug, info, trace, Logger};

use super::op::{instance_params, AgentRc, OpEvent, OpStatus};

/// Static identity of a resource: standard/provider/type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceSpec {
    pub standard: String,
    pub provider: Option<String>,
    pub kind: String,
}

/// History of one resource on one node.
#[derive(Clone, Debug)]
pub struct HistoryEntry {
    pub rsc: ResourceSpec,
    /// Most recent successful non-recurring op.
    pub last: Option<OpEvent>,
    /// Most recent failed op.
    pub failed: Option<OpEvent>,
    /// Active recurring ops, unique by (task, interval).
    pub recurring: Vec<OpEvent>,
    /// Instance parameters captured at the last start/reload/probe, used
    /// when the resource is eventually stopped.
    pub stop_params: HashMap<String, String>,
    pub last_call_id: u32,
    /// Shutdown lock: keep the resource pinned here until this time.
    pub lock_until: Option<SystemTime>,
}

impl HistoryEntry {
    fn new(rsc: ResourceSpec) -> Self {
        HistoryEntry {
            rsc,
            last: None,
            failed: None,
            recurring: Vec::new(),
            stop_params: HashMap::new(),
            last_call_id: 0,
            lock_until: None,
        }
    }

    fn remove_recurring(&mut self, task: &str, interval_ms: u32) -> bool {
        let before = self.recurring.len();
        self.recurring
            .retain(|op| !(op.task == task && op.interval_ms == interval_ms));
        self.recurring.len() != before
    }
}

/// What a history update asks the caller to do next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HistoryOutcome {
    Updated,
    /// Nothing recorded (notify op, unknown resource, stale cancel).
    Skipped,
    /// The resource was deleted; the caller must also purge the recorded
    /// history from the configuration store.
    Purged,
}

/// All resource history known for one node.
pub struct HistoryMap {
    entries: HashMap<String, HistoryEntry>,
    log: Logger,
}

impl HistoryMap {
    pub fn new(log: Logger) -> Self {
        HistoryMap { entries: HashMap::new(), log }
    }

    pub fn get(&self, rsc_id: &str) -> Option<&HistoryEntry> {
        self.entries.get(rsc_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn remove(&mut self, rsc_id: &str) -> Option<HistoryEntry> {
        self.entries.remove(rsc_id)
    }

    /// Drop everything; used by reprobe.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn resource_ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// The parameters a stop of this resource must be invoked with.
    pub fn stop_params(&self, rsc_id: &str) -> Option<&HashMap<String, String>> {
        self.entries.get(rsc_id).map(|e| &e.stop_params)
    }

    /// Record a shutdown lock (or clear it) on a resource's entry.
    pub fn set_lock(&mut self, rsc_id: &str, lock_until: Option<SystemTime>) {
        if let Some(entry) = self.entries.get_mut(rsc_id) {
            entry.lock_until = lock_until;
        }
    }

    /// Fold one op result into the cache. `rsc` supplies the static triple
    /// when the entry does not exist yet; `target_rc` is what the scheduler
    /// expected the op to return.
    pub fn update(
        &mut self,
        rsc: Option<&ResourceSpec>,
        op: &OpEvent,
        target_rc: AgentRc,
    ) -> HistoryOutcome {
        if op.rsc_deleted {
            debug!(self.log, "Purging history after resource deletion";
                "rsc_id" => &op.rsc_id, "task" => &op.task);
            self.entries.remove(&op.rsc_id);
            return HistoryOutcome::Purged;
        }

        if op.task == "notify" {
            return HistoryOutcome::Skipped;
        }

        if !self.entries.contains_key(&op.rsc_id) {
            match rsc {
                Some(rsc) => {
                    self.entries
                        .insert(op.rsc_id.clone(), HistoryEntry::new(rsc.clone()));
                }
                None => {
                    info!(self.log, "Resource no longer exists, not updating history";
                        "rsc_id" => &op.rsc_id);
                    return HistoryOutcome::Skipped;
                }
            }
        }
        let entry = self.entries.get_mut(&op.rsc_id).expect("entry exists");

        entry.last_call_id = op.call_id;

        if op.status == OpStatus::Cancelled {
            if op.is_recurring() {
                trace!(self.log, "Removing cancelled recurring op";
                    "key" => op.key().to_string());
                entry.remove_recurring(&op.task, op.interval_ms);
                return HistoryOutcome::Updated;
            }
            trace!(self.log, "Ignoring cancelled non-recurring op";
                "key" => op.key().to_string());
            return HistoryOutcome::Skipped;
        } else if op.failed(target_rc) {
            // Failed monitors land here so a later stop doesn't erase them.
            entry.failed = Some(op.clone());
        } else if !op.is_recurring() {
            entry.last = Some(op.clone());

            if let Some(params) = &op.params {
                if matches!(op.task.as_str(), "start" | "reload" | "monitor") {
                    entry.stop_params = instance_params(params);
                }
            }
        }

        if op.is_recurring() {
            // No duplicates by (task, interval).
            entry.remove_recurring(&op.task, op.interval_ms);
            trace!(self.log, "Adding recurring op"; "key" => op.key().to_string());
            entry.recurring.push(op.clone());
        } else if !entry.recurring.is_empty() && op.task != "monitor" {
            debug!(self.log, "Dropping recurring ops";
                "count" => entry.recurring.len(), "because" => op.key().to_string());
            entry.recurring.clear();
        }

        HistoryOutcome::Updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::op::OpOrigin;
    use slog::{o, Drain};

    fn create_test_logger() -> Logger {
        let decorator = slog_term::PlainDecorator::new(std::io::stdout());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, o!())
    }

    fn spec() -> ResourceSpec {
        ResourceSpec {
            standard: "ocf".to_string(),
            provider: Some("heartbeat".to_string()),
            kind: "Dummy".to_string(),
        }
    }

    fn op(task: &str, interval_ms: u32, status: OpStatus, rc: AgentRc) -> OpEvent {
        OpEvent {
            rsc_id: "db".to_string(),
            task: task.to_string(),
            interval_ms,
            call_id: 1,
            status,
            rc,
            user_data: None,
            params: None,
            origin: OpOrigin::Executor,
            rsc_deleted: false,
            exit_reason: None,
        }
    }

    #[test]
    fn test_successful_start_sets_last_and_stop_params() {
        let mut map = HistoryMap::new(create_test_logger());
        let mut start = op("start", 0, OpStatus::Done, AgentRc::Ok);
        let mut params = HashMap::new();
        params.insert("port".to_string(), "3306".to_string());
        params.insert("CRM_meta_timeout".to_string(), "20000".to_string());
        start.params = Some(params);

        assert_eq!(map.update(Some(&spec()), &start, AgentRc::Ok), HistoryOutcome::Updated);

        let entry = map.get("db").unwrap();
        assert_eq!(entry.last.as_ref().unwrap().task, "start");
        assert!(entry.failed.is_none());
        assert_eq!(entry.stop_params.get("port").map(String::as_str), Some("3306"));
        assert!(!entry.stop_params.contains_key("CRM_meta_timeout"));
    }

    #[test]
    fn test_stop_params_survive_config_change() {
        let mut map = HistoryMap::new(create_test_logger());
        let mut start = op("start", 0, OpStatus::Done, AgentRc::Ok);
        let mut params = HashMap::new();
        params.insert("port".to_string(), "3306".to_string());
        start.params = Some(params);
        map.update(Some(&spec()), &start, AgentRc::Ok);

        // A later monitor with no params attached must not clobber them.
        let probe = op("monitor", 0, OpStatus::Done, AgentRc::Ok);
        map.update(Some(&spec()), &probe, AgentRc::Ok);

        assert_eq!(
            map.stop_params("db").unwrap().get("port").map(String::as_str),
            Some("3306")
        );
    }

    #[test]
    fn test_failed_op_fills_failed_slot() {
        let mut map = HistoryMap::new(create_test_logger());
        let failed = op("monitor", 10000, OpStatus::Done, AgentRc::UnknownError);

        map.update(Some(&spec()), &failed, AgentRc::Ok);
        let entry = map.get("db").unwrap();
        assert!(entry.last.is_none());
        assert_eq!(entry.failed.as_ref().unwrap().rc, AgentRc::UnknownError);
    }

    #[test]
    fn test_recurring_dedup() {
        let mut map = HistoryMap::new(create_test_logger());
        let monitor = op("monitor", 10000, OpStatus::Done, AgentRc::Ok);

        map.update(Some(&spec()), &monitor, AgentRc::Ok);
        map.update(Some(&spec()), &monitor, AgentRc::Ok);

        assert_eq!(map.get("db").unwrap().recurring.len(), 1);
    }

    #[test]
    fn test_non_recurring_op_purges_recurring_list() {
        let mut map = HistoryMap::new(create_test_logger());
        let monitor = op("monitor", 10000, OpStatus::Done, AgentRc::Ok);
        map.update(Some(&spec()), &monitor, AgentRc::Ok);

        // A probe does not purge...
        let probe = op("monitor", 0, OpStatus::Done, AgentRc::Ok);
        map.update(Some(&spec()), &probe, AgentRc::Ok);
        assert_eq!(map.get("db").unwrap().recurring.len(), 1);

        // ...but a stop does.
        let stop = op("stop", 0, OpStatus::Done, AgentRc::Ok);
        map.update(Some(&spec()), &stop, AgentRc::Ok);
        assert!(map.get("db").unwrap().recurring.is_empty());
    }

    #[test]
    fn test_cancelled_recurring_removed() {
        let mut map = HistoryMap::new(create_test_logger());
        let monitor = op("monitor", 10000, OpStatus::Done, AgentRc::Ok);
        map.update(Some(&spec()), &monitor, AgentRc::Ok);

        let cancelled = op("monitor", 10000, OpStatus::Cancelled, AgentRc::Ok);
        assert_eq!(
            map.update(Some(&spec()), &cancelled, AgentRc::Ok),
            HistoryOutcome::Updated
        );
        assert!(map.get("db").unwrap().recurring.is_empty());
    }

    #[test]
    fn test_rsc_deleted_purges_entry() {
        let mut map = HistoryMap::new(create_test_logger());
        let start = op("start", 0, OpStatus::Done, AgentRc::Ok);
        map.update(Some(&spec()), &start, AgentRc::Ok);

        let mut deleted = op("stop", 0, OpStatus::Done, AgentRc::Ok);
        deleted.rsc_deleted = true;
        assert_eq!(map.update(None, &deleted, AgentRc::Ok), HistoryOutcome::Purged);
        assert!(map.get("db").is_none());
    }

    #[test]
    fn test_notify_never_recorded() {
        let mut map = HistoryMap::new(create_test_logger());
        let notify = op("notify", 0, OpStatus::Done, AgentRc::Ok);
        assert_eq!(map.update(Some(&spec()), &notify, AgentRc::Ok), HistoryOutcome::Skipped);
        assert!(map.is_empty());
    }

    #[test]
    fn test_unknown_resource_skipped() {
        let mut map = HistoryMap::new(create_test_logger());
        let start = op("start", 0, OpStatus::Done, AgentRc::Ok);
        assert_eq!(map.update(None, &start, AgentRc::Ok), HistoryOutcome::Skipped);
        assert!(map.is_empty());
    }
}
