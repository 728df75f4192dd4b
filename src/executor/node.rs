//! Per-node executor state.
//!
//! One instance per target node, wrapping that node's executor connection
//! with the pending-op table, the resource history cache and the recording
//! of results to the configuration store. When a request cannot even be
//! dispatched, a result is fabricated and processed as if the executor had
//! produced it, so the transition engine always observes a deterministic
//! completion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};

use slog::{debug, info, warn, Logger};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::store::{AttrStore, ConfigStore, StoreError, StoreOpts};

use super::history::{HistoryMap, HistoryOutcome, ResourceSpec};
use super::op::{AgentRc, ExecRequest, OpEvent, OpKey, OpOrigin, OpStatus};
use super::pending::{PendingOp, PendingTable};
use super::{ExecutorConnection, ExecutorError};

/// Updates flowing from the executor interface to the transition engine.
#[derive(Clone, Debug)]
pub enum NodeExecutorUpdate {
    /// An op completed (really or synthetically); history has been
    /// recorded.
    OpResult(OpEvent),
    /// A previously requested cancellation was confirmed and the pending
    /// record erased.
    CancelConfirmed { key: OpKey, call_id: u32 },
}

struct NodeState {
    pending: PendingTable,
    history: HistoryMap,
    resources: HashMap<String, ResourceSpec>,
}

/// Executor interface for one node.
pub struct NodeExecutor {
    node_name: String,
    conn: ExecutorConnection,
    state: StdMutex<NodeState>,
    store: Arc<dyn ConfigStore>,
    attrs: Arc<dyn AttrStore>,
    /// Synthetic results get ids from their own namespace; routing is on
    /// the origin flag, never on magnitude.
    next_synth_id: AtomicU32,
    updates: broadcast::Sender<NodeExecutorUpdate>,
    log: Logger,
}

impl NodeExecutor {
    pub fn new(
        node_name: &str,
        conn: ExecutorConnection,
        store: Arc<dyn ConfigStore>,
        attrs: Arc<dyn AttrStore>,
        log: Logger,
    ) -> Self {
        let history_log = log.new(slog::o!("node" => node_name.to_string()));
        let (updates, _) = broadcast::channel(256);
        NodeExecutor {
            node_name: node_name.to_string(),
            conn,
            state: StdMutex::new(NodeState {
                pending: PendingTable::new(),
                history: HistoryMap::new(history_log),
                resources: HashMap::new(),
            }),
            store,
            attrs,
            next_synth_id: AtomicU32::new(1),
            updates,
            log,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn connection(&self) -> &ExecutorConnection {
        &self.conn
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeExecutorUpdate> {
        self.updates.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().expect("state lock").pending.len()
    }

    /// History entry snapshot for a resource (tests and status surfaces).
    pub fn history_entry(&self, rsc_id: &str) -> Option<super::HistoryEntry> {
        self.state
            .lock()
            .expect("state lock")
            .history
            .get(rsc_id)
            .cloned()
    }

    pub fn history_len(&self) -> usize {
        self.state.lock().expect("state lock").history.len()
    }

    /// Forward result events from the underlying connection into this
    /// state tracker.
    pub fn spawn_event_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let me = self.clone();
        let mut rx = me.conn.api().subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => me.handle_op_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(me.log, "Executor event pump lagged"; "missed" => missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn register_resource(
        &self,
        id: &str,
        spec: &ResourceSpec,
    ) -> Result<(), ExecutorError> {
        self.conn.api().register_rsc(id, spec).await?;
        self.state
            .lock()
            .expect("state lock")
            .resources
            .insert(id.to_string(), spec.clone());
        Ok(())
    }

    pub async fn unregister_resource(&self, id: &str) -> Result<(), ExecutorError> {
        self.conn.api().unregister_rsc(id).await?;
        {
            let mut state = self.state.lock().expect("state lock");
            state.resources.remove(id);
            state.history.remove(id);
            state.pending.remove_resource(id);
        }
        if let Err(err) = self
            .store
            .delete_resource_history(&self.node_name, id, StoreOpts::default())
            .await
        {
            warn!(self.log, "Failed to purge recorded history";
                "rsc_id" => id, "error" => err.to_string());
        }
        Ok(())
    }

    fn synth_call_id(&self) -> u32 {
        self.next_synth_id.fetch_add(1, Ordering::SeqCst)
    }

    fn synthesize(&self, request: &ExecRequest, error: &ExecutorError) -> OpEvent {
        // Notify results are never interesting to anyone: fabricate
        // success so the graph moves on.
        let (status, rc) = if request.task == "notify" {
            (OpStatus::Done, AgentRc::Ok)
        } else {
            error.synth_result()
        };
        OpEvent {
            rsc_id: request.rsc_id.clone(),
            task: request.task.clone(),
            interval_ms: request.interval_ms,
            call_id: self.synth_call_id(),
            status,
            rc,
            user_data: request.user_data.clone(),
            params: Some(request.params.clone()),
            origin: OpOrigin::Synthesized,
            rsc_deleted: false,
            exit_reason: Some(error.to_string()),
        }
    }

    /// Dispatch one operation. Returns the call id the result will carry,
    /// real or synthetic; either way a result event is guaranteed to
    /// follow.
    pub async fn exec(&self, mut request: ExecRequest) -> u32 {
        // A stop runs with the parameters the resource was started with,
        // not whatever the configuration says by now.
        if request.task == "stop" {
            let captured = {
                let state = self.state.lock().expect("state lock");
                state.history.stop_params(&request.rsc_id).cloned()
            };
            if let Some(params) = captured {
                if !params.is_empty() {
                    request.params = params;
                }
            }
        }

        match self.conn.api().exec(&request).await {
            Ok(call_id) => {
                let lock_until = request
                    .lock_until_secs
                    .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs));
                let pending = PendingOp {
                    call_id,
                    key: request.key(),
                    start: SystemTime::now(),
                    user_data: request.user_data.clone(),
                    target_rc: request.target_rc,
                    lock_until,
                    remove_on_complete: request.interval_ms == 0,
                    cancelled: false,
                };
                debug!(self.log, "Dispatched op";
                    "key" => pending.key.to_string(), "call_id" => call_id);
                self.state
                    .lock()
                    .expect("state lock")
                    .pending
                    .insert(pending);
                call_id
            }
            Err(err) => {
                warn!(self.log, "Could not dispatch op, fabricating result";
                    "key" => request.key().to_string(), "error" => err.to_string());
                let event = self.synthesize(&request, &err);
                let call_id = event.call_id;
                self.handle_op_event(event).await;
                call_id
            }
        }
    }

    /// Request cancellation of a pending (recurring) op. Phase one marks
    /// the record; it is only erased when the executor confirms. A second
    /// cancel of the same op returns the same ack.
    pub async fn cancel(&self, key: &OpKey) -> Result<u32, ExecutorError> {
        let (call_id, already_requested) = {
            let mut state = self.state.lock().expect("state lock");
            let existing = state.pending.find_by_key(key).map(|p| (p.call_id, p.cancelled));
            match existing {
                Some((id, true)) => (Some(id), true),
                Some((_, false)) => (state.pending.mark_cancelled(key), false),
                None => (None, false),
            }
        };
        let call_id = match call_id {
            Some(id) => id,
            None => {
                return Err(ExecutorError::Invalid(format!(
                    "no pending op matches '{}'",
                    key
                )))
            }
        };
        if already_requested {
            // The first cancel is still in flight; same ack, no new request.
            return Ok(call_id);
        }
        if let Err(err) = self.conn.api().cancel(key).await {
            // Leave the pending record: shutdown must block until this op
            // is resolved one way or the other.
            warn!(self.log, "Executor could not cancel op";
                "key" => key.to_string(), "error" => err.to_string());
            return Err(err);
        }
        Ok(call_id)
    }

    pub async fn cancel_by_call_id(&self, call_id: u32) -> Result<u32, ExecutorError> {
        let key = {
            let mut state = self.state.lock().expect("state lock");
            match state.pending.mark_cancelled_by_id(call_id) {
                Some(_) => state.pending.get(call_id).map(|p| p.key.clone()),
                None => None,
            }
        };
        match key {
            Some(key) => {
                self.conn.api().cancel(&key).await?;
                Ok(call_id)
            }
            None => Err(ExecutorError::Invalid(format!(
                "no pending op with call id {}",
                call_id
            ))),
        }
    }

    /// Clear in-memory and recorded history for every resource on this
    /// node and unset the probed flag, prompting fresh probes.
    pub async fn reprobe(&self) -> Result<(), StoreError> {
        let rsc_ids = {
            let mut state = self.state.lock().expect("state lock");
            let ids = state.history.resource_ids();
            state.history.clear();
            ids
        };
        info!(self.log, "Reprobe: clearing resource history"; "resources" => rsc_ids.len());
        for rsc_id in &rsc_ids {
            self.store
                .delete_resource_history(&self.node_name, rsc_id, StoreOpts::default())
                .await?;
        }
        self.attrs.clear_probed(&self.node_name).await
    }

    /// Does this completed op pin the resource to the node? Only a clean
    /// stop or a probe finding the resource inactive carries the lock.
    fn lock_applies(event: &OpEvent, target_rc: AgentRc) -> bool {
        if event.status != OpStatus::Done {
            return false;
        }
        (event.task == "stop" && event.succeeded(target_rc))
            || (event.task == "monitor" && event.rc == AgentRc::NotRunning)
    }

    /// Fold one result event into history, record it, and forward it.
    pub async fn handle_op_event(&self, event: OpEvent) {
        let (pending, spec) = {
            let state = self.state.lock().expect("state lock");
            (
                state.pending.get(event.call_id).cloned(),
                state.resources.get(&event.rsc_id).cloned(),
            )
        };
        let target_rc = pending
            .as_ref()
            .map(|p| p.target_rc)
            .unwrap_or(AgentRc::Ok);

        if event.status == OpStatus::Cancelled {
            self.handle_cancelled(event, pending, spec, target_rc).await;
            return;
        }

        let outcome = {
            let mut state = self.state.lock().expect("state lock");
            state.history.update(spec.as_ref(), &event, target_rc)
        };

        match outcome {
            HistoryOutcome::Purged => {
                {
                    let mut state = self.state.lock().expect("state lock");
                    state.pending.remove_resource(&event.rsc_id);
                }
                if let Err(err) = self
                    .store
                    .delete_resource_history(&self.node_name, &event.rsc_id, StoreOpts::default())
                    .await
                {
                    warn!(self.log, "Failed to purge recorded history";
                        "rsc_id" => &event.rsc_id, "error" => err.to_string());
                }
            }
            HistoryOutcome::Updated => {
                let lock_until = if Self::lock_applies(&event, target_rc) {
                    pending.as_ref().and_then(|p| p.lock_until)
                } else {
                    None
                };
                {
                    let mut state = self.state.lock().expect("state lock");
                    state.history.set_lock(&event.rsc_id, lock_until);
                }
                if let Err(err) = self
                    .store
                    .record_op(&self.node_name, &event, lock_until, StoreOpts::default())
                    .await
                {
                    warn!(self.log, "Failed to record op result";
                        "key" => event.key().to_string(), "error" => err.to_string());
                }
            }
            HistoryOutcome::Skipped => {}
        }

        if pending.is_some() && !event.is_recurring() {
            let mut state = self.state.lock().expect("state lock");
            state.pending.complete(event.call_id);
        }

        let _ = self.updates.send(NodeExecutorUpdate::OpResult(event));
    }

    async fn handle_cancelled(
        &self,
        event: OpEvent,
        pending: Option<PendingOp>,
        spec: Option<ResourceSpec>,
        target_rc: AgentRc,
    ) {
        {
            let mut state = self.state.lock().expect("state lock");
            state.history.update(spec.as_ref(), &event, target_rc);
        }

        let confirmed = {
            let mut state = self.state.lock().expect("state lock");
            match pending {
                Some(ref p) if p.cancelled => state.pending.complete(event.call_id),
                // Executor-initiated cancellation (e.g. resource removal):
                // the record goes too, but nobody is waiting for an ack.
                Some(_) => {
                    state.pending.complete(event.call_id);
                    None
                }
                None => None,
            }
        };

        if let Some(p) = confirmed {
            debug!(self.log, "Cancellation confirmed"; "key" => p.key.to_string());
            // Optimistic erase of the recorded op; a stale delete is a
            // no-op on the store side.
            let erase = crate::store::EraseKey {
                node: self.node_name.clone(),
                rsc_id: p.key.rsc_id.clone(),
                op_key: p.key.to_string(),
                call_id: p.call_id,
            };
            if let Err(err) = self.store.erase_op(&erase, StoreOpts::default()).await {
                warn!(self.log, "Failed to erase cancelled op";
                    "key" => p.key.to_string(), "error" => err.to_string());
            }
            let _ = self.updates.send(NodeExecutorUpdate::CancelConfirmed {
                key: p.key,
                call_id: p.call_id,
            });
        }
        let _ = self.updates.send(NodeExecutorUpdate::OpResult(event));
    }
}
