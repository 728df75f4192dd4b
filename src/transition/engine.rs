//! Transition engine.
//!
//! Executes the current graph with synapse-level parallelism: each trigger
//! pass walks synapses in priority order, dispatches the outputs of every
//! ready synapse (bounded by the batch limit and the load governor's
//! throttle), and confirms actions against observed events. Aborts record a
//! monotonic priority and the strongest requested reaction; a restart abort
//! discards the graph on the next trigger and asks the outer state machine
//! to compute again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use slog::{debug, error, info, warn, Logger};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::executor::{AgentRc, ExecRequest, OpEvent, OpStatus};

use super::graph::{ActionKind, ActionStatus, Graph, GraphError, GraphInput, SynapseState};
use super::key::{TransitionKey, TransitionMagic};

/// Effectively unbounded priority; an abort at this priority always wins.
pub const INFINITY: i32 = 1_000_000;

/// State of the outer controller state machine, as far as the engine cares:
/// aborts and execution are suppressed unless this node is the leader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlState {
    Starting,
    Pending,
    NotDc,
    Halt,
    Stopping,
    Terminate,
    Illegal,
    Leader,
}

impl ControlState {
    pub fn suppresses_engine(&self) -> bool {
        !matches!(self, ControlState::Leader)
    }
}

/// What an abort asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortAction {
    /// Just compute a new graph when this one finishes.
    Recompute,
    /// Stop dispatching new actions, let in-flight ones finish.
    Stop,
    /// Discard the graph on the next trigger and compute again.
    Restart,
}

/// Result of one trigger pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    /// Nothing fired; waiting on events (or not leader).
    Pending,
    /// Actions were dispatched this pass.
    Active,
    Complete,
    /// The graph was discarded by an abort.
    Terminated,
}

/// How an incoming event related to the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventMatch {
    Confirmed,
    Failed,
    /// Belongs to an earlier graph or another leader.
    Stale,
    /// The named action is already terminal.
    Duplicate,
    /// No graph action matches.
    Unmatched,
}

/// Notifications to the owner of the engine (the controller FSM).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineNotification {
    TransitionComplete { graph_id: u32, failed: bool, aborted: bool },
    /// The policy engine must produce a new graph.
    ComputeAgain,
}

/// Dispatch failure; the action is marked failed locally.
#[derive(Debug, Clone)]
pub struct DispatchError(pub String);

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Dispatch failed: {}", self.0)
    }
}

impl std::error::Error for DispatchError {}

/// Sink for the engine's outbound work. The runtime routes resource ops to
/// the right node's executor interface, fencing ops to the coordinator and
/// cluster-wide ops to the outbox.
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn exec_resource(&self, node: &str, request: ExecRequest) -> Result<(), DispatchError>;

    async fn fence(
        &self,
        target: &str,
        action: &str,
        timeout_ms: u64,
        reference: &str,
    ) -> Result<(), DispatchError>;

    /// Multicast a cluster-wide op; peers acknowledge with the reference.
    async fn multicast(
        &self,
        task: &str,
        target: Option<&str>,
        reference: &str,
    ) -> Result<(), DispatchError>;
}

/// External load governor: the dynamic half of the batch limit.
pub trait LoadGovernor: Send + Sync {
    /// Combine the configured limit (0 = unlimited) with current load.
    fn total_job_limit(&self, configured: u32) -> u32;
}

/// Governor that imposes no extra limit.
pub struct NoThrottle;

impl LoadGovernor for NoThrottle {
    fn total_job_limit(&self, configured: u32) -> u32 {
        configured
    }
}

struct DispatchItem {
    action_id: u32,
    kind: ActionKind,
    node: Option<String>,
    task: String,
    timeout_ms: u64,
    rsc_id: Option<String>,
    interval_ms: u32,
    target_rc: i32,
    params: std::collections::HashMap<String, String>,
    key: TransitionKey,
}

/// The transition engine of the cluster leader.
pub struct TransitionEngine {
    log: Logger,
    dc_uuid: String,
    state: ControlState,
    graph: Option<Graph>,
    abort_action: AbortAction,
    dispatcher: Arc<dyn ActionDispatcher>,
    throttle: Arc<dyn LoadGovernor>,
    notify: mpsc::UnboundedSender<EngineNotification>,
    /// Debounce before re-planning when a complete graph is aborted.
    transition_delay: Duration,
    debounce: Option<JoinHandle<()>>,
}

impl TransitionEngine {
    pub fn new(
        dc_uuid: &str,
        dispatcher: Arc<dyn ActionDispatcher>,
        throttle: Arc<dyn LoadGovernor>,
        transition_delay: Duration,
        log: Logger,
    ) -> (Self, mpsc::UnboundedReceiver<EngineNotification>) {
        let (notify, notify_rx) = mpsc::unbounded_channel();
        (
            TransitionEngine {
                log,
                dc_uuid: dc_uuid.to_string(),
                state: ControlState::Starting,
                graph: None,
                abort_action: AbortAction::Recompute,
                dispatcher,
                throttle,
                notify,
                transition_delay,
                debounce: None,
            },
            notify_rx,
        )
    }

    pub fn set_state(&mut self, state: ControlState) {
        if self.state != state {
            debug!(self.log, "Engine state change";
                "old" => format!("{:?}", self.state), "new" => format!("{:?}", state));
        }
        self.state = state;
    }

    pub fn graph_id(&self) -> Option<u32> {
        self.graph.as_ref().map(|g| g.id)
    }

    pub fn abort_priority(&self) -> i32 {
        self.graph.as_ref().map(|g| g.abort_priority).unwrap_or(0)
    }

    pub fn abort_action(&self) -> AbortAction {
        self.abort_action
    }

    pub fn is_complete(&self) -> bool {
        self.graph.as_ref().map(|g| g.complete).unwrap_or(true)
    }

    /// Adopt a new graph, discarding any in-flight one.
    pub fn set_graph(&mut self, input: GraphInput) -> Result<(), GraphError> {
        if let Some(old) = self.graph.take() {
            if !old.complete {
                info!(self.log, "Discarding in-flight transition for a newer one";
                    "old" => old.id, "new" => input.id);
            }
        }
        let graph = Graph::from_input(input)?;
        info!(self.log, "Adopted transition graph";
            "graph_id" => graph.id, "synapses" => graph.synapses.len());
        self.graph = Some(graph);
        self.abort_action = AbortAction::Recompute;
        Ok(())
    }

    /// One execution pass over the current graph.
    pub async fn trigger(&mut self) -> RunStatus {
        if self.state.suppresses_engine() {
            return RunStatus::Pending;
        }
        let graph_id = match &self.graph {
            Some(graph) => graph.id,
            None => {
                debug!(self.log, "Nothing to do");
                return RunStatus::Pending;
            }
        };

        // A restart abort discards the graph now.
        let (abort_priority, complete) = {
            let graph = self.graph.as_ref().expect("graph present");
            (graph.abort_priority, graph.complete)
        };
        if abort_priority > 0 && self.abort_action == AbortAction::Restart && !complete {
            let graph = self.graph.take().expect("graph present");
            info!(self.log, "Transition discarded by abort"; "graph_id" => graph.id);
            let _ = self.notify.send(EngineNotification::TransitionComplete {
                graph_id: graph.id,
                failed: true,
                aborted: true,
            });
            let _ = self.notify.send(EngineNotification::ComputeAgain);
            return RunStatus::Terminated;
        }
        if complete {
            return RunStatus::Complete;
        }

        let stop_new_work =
            abort_priority > 0 && self.abort_action == AbortAction::Stop;

        // Fire ready synapses, bounded by the batch limit and throttle.
        let dc_uuid = self.dc_uuid.clone();
        let mut fired: Vec<DispatchItem> = Vec::new();
        {
            let configured = self.graph.as_ref().expect("graph present").batch_limit;
            let limit = self.throttle.total_job_limit(configured);
            let graph = self.graph.as_mut().expect("graph present");
            let mut budget = if limit == 0 {
                u32::MAX
            } else {
                limit.saturating_sub(graph.in_flight_count() as u32)
            };

            for i in 0..graph.synapses.len() {
                let (is_pending, input_failed, ready, tolerated) = {
                    let synapse = &graph.synapses[i];
                    (
                        synapse.state == SynapseState::Pending,
                        graph.synapse_input_failed(synapse),
                        graph.synapse_ready(synapse),
                        synapse.failure_tolerated,
                    )
                };
                if !is_pending {
                    continue;
                }
                if input_failed && !tolerated {
                    // Inputs failed: outputs are skipped, and the failure
                    // propagates to anything gated on them.
                    let ids: Vec<u32> =
                        graph.synapses[i].actions.iter().map(|a| a.id).collect();
                    for id in ids {
                        graph.fail_action(id);
                    }
                    graph.synapses[i].state = SynapseState::Confirmed;
                    graph.synapses[i].failed = true;
                    continue;
                }
                if !ready || stop_new_work {
                    continue;
                }
                if budget == 0 {
                    break;
                }

                graph.synapses[i].state = SynapseState::Ready;
                let synapse_id = graph.synapses[i].id;
                debug!(self.log, "Firing synapse"; "synapse" => synapse_id);
                for action in &mut graph.synapses[i].actions {
                    budget = budget.saturating_sub(1);
                    if action.kind == ActionKind::Pseudo {
                        action.status = ActionStatus::Confirmed;
                        continue;
                    }
                    action.status = ActionStatus::InFlight;
                    action.deadline =
                        Some(Instant::now() + Duration::from_millis(action.timeout_ms));
                    fired.push(DispatchItem {
                        action_id: action.id,
                        kind: action.kind,
                        node: action.target.clone(),
                        task: action.task.clone(),
                        timeout_ms: action.timeout_ms,
                        rsc_id: action.rsc_id.clone(),
                        interval_ms: action.interval_ms,
                        target_rc: action.target_rc,
                        params: action.params.clone(),
                        key: TransitionKey::new(action.id, graph_id, action.target_rc, &dc_uuid),
                    });
                }
            }
        }

        let fired_count = fired.len();
        let mut dispatch_failures: Vec<u32> = Vec::new();
        for item in fired {
            if let Err(err) = self.dispatch(item).await {
                dispatch_failures.push(err.0);
            }
        }
        for action_id in &dispatch_failures {
            warn!(self.log, "Failing undispatchable action"; "action_id" => *action_id);
            if let Some(graph) = self.graph.as_mut() {
                graph.fail_action(*action_id);
            }
        }
        if !dispatch_failures.is_empty() {
            self.record_abort(INFINITY, AbortAction::Restart, "Dispatch failure");
        }

        let became_complete = self
            .graph
            .as_mut()
            .map(|g| g.update())
            .unwrap_or(false);
        if became_complete {
            self.notify_complete();
            return RunStatus::Complete;
        }
        if fired_count > 0 {
            RunStatus::Active
        } else {
            RunStatus::Pending
        }
    }

    async fn dispatch(&self, item: DispatchItem) -> Result<(), DispatchErrorWithId> {
        let action_id = item.action_id;
        let result = match item.kind {
            ActionKind::Resource => {
                let node = item.node.as_deref().unwrap_or_default().to_string();
                let rsc_id = match item.rsc_id {
                    Some(rsc_id) => rsc_id,
                    None => {
                        return Err(DispatchErrorWithId(action_id));
                    }
                };
                let request = ExecRequest {
                    rsc_id,
                    task: item.task,
                    interval_ms: item.interval_ms,
                    timeout_ms: item.timeout_ms,
                    user_data: Some(item.key.to_string()),
                    target_rc: AgentRc::from_exit_code(item.target_rc),
                    params: item.params,
                    lock_until_secs: None,
                };
                self.dispatcher.exec_resource(&node, request).await
            }
            ActionKind::Fencing => {
                let target = item.node.as_deref().unwrap_or_default().to_string();
                self.dispatcher
                    .fence(&target, &item.task, item.timeout_ms, &item.key.to_string())
                    .await
            }
            ActionKind::ClusterWide => {
                self.dispatcher
                    .multicast(&item.task, item.node.as_deref(), &item.key.to_string())
                    .await
            }
            ActionKind::Pseudo => Ok(()),
        };
        result.map_err(|err| {
            warn!(self.log, "Dispatch error";
                "action_id" => action_id, "error" => err.to_string());
            DispatchErrorWithId(action_id)
        })
    }

    /// Extract the transition key from an event's caller data, accepting
    /// either the bare key or the full recorded magic.
    fn parse_event_key(user_data: &str) -> Option<TransitionKey> {
        if user_data.contains(';') {
            TransitionMagic::parse(user_data).ok().map(|m| m.key)
        } else {
            TransitionKey::parse(user_data).ok()
        }
    }

    /// Match one executor result event against the graph.
    pub fn on_op_event(&mut self, event: &OpEvent) -> EventMatch {
        let user_data = match event.user_data.as_deref() {
            Some(user_data) => user_data,
            None => return EventMatch::Unmatched,
        };
        let key = match Self::parse_event_key(user_data) {
            Some(key) => key,
            None => {
                debug!(self.log, "Event carries unparseable caller data";
                    "user_data" => user_data.to_string());
                return EventMatch::Unmatched;
            }
        };

        let (matched, synapse_priority) = {
            let graph = match self.graph.as_mut() {
                Some(graph) => graph,
                None => return EventMatch::Stale,
            };
            if key.dc_uuid != self.dc_uuid || key.graph_id != graph.id {
                debug!(self.log, "Ignoring event for another transition";
                    "event_graph" => key.graph_id, "current_graph" => graph.id);
                return EventMatch::Stale;
            }
            let status = match graph.action(key.action_id) {
                Some(action) => action.status,
                None => {
                    error!(self.log, "Event names an unknown action";
                        "action_id" => key.action_id);
                    return EventMatch::Unmatched;
                }
            };
            if status.is_terminal() {
                return EventMatch::Duplicate;
            }

            let ok = event.status == OpStatus::Done && event.rc.as_i32() == key.target_rc;
            if ok {
                graph.confirm_action(key.action_id);
            } else {
                graph.fail_action(key.action_id);
            }
            (ok, graph.synapse_priority(key.action_id))
        };

        if matched {
            info!(self.log, "Action confirmed";
                "action_id" => key.action_id, "key" => event.key().to_string());
        } else {
            warn!(self.log, "Action failed";
                "action_id" => key.action_id, "key" => event.key().to_string(),
                "status" => event.status.to_string(), "rc" => event.rc.as_i32());
            self.record_abort(synapse_priority + 1, AbortAction::Restart, "Event failed");
        }

        if self.graph.as_mut().map(|g| g.update()).unwrap_or(false) {
            self.notify_complete();
        }
        if matched {
            EventMatch::Confirmed
        } else {
            EventMatch::Failed
        }
    }

    /// Confirm a cluster-wide op on acknowledgement from its target.
    pub fn on_cluster_ack(&mut self, graph_id: u32, action_id: u32) {
        let confirmed = match self.graph.as_mut() {
            Some(graph) if graph.id == graph_id => graph.confirm_action(action_id),
            _ => false,
        };
        if confirmed && self.graph.as_mut().map(|g| g.update()).unwrap_or(false) {
            self.notify_complete();
        }
    }

    /// Confirm or fail the pending fencing action for a target when its
    /// outcome notification arrives.
    pub fn on_fence_result(&mut self, target: &str, succeeded: bool) -> bool {
        let (found, priority) = {
            let graph = match self.graph.as_mut() {
                Some(graph) => graph,
                None => return false,
            };
            let action_id = graph
                .synapses
                .iter()
                .flat_map(|s| s.actions.iter())
                .find(|a| {
                    a.kind == ActionKind::Fencing
                        && a.status == ActionStatus::InFlight
                        && a.target.as_deref() == Some(target)
                })
                .map(|a| a.id);
            match action_id {
                Some(id) => {
                    if succeeded {
                        graph.confirm_action(id);
                    } else {
                        graph.fail_action(id);
                    }
                    (true, graph.synapse_priority(id))
                }
                None => (false, 0),
            }
        };

        if found && !succeeded {
            self.record_abort(priority + 1, AbortAction::Restart, "Fencing failed");
        }
        if found && self.graph.as_mut().map(|g| g.update()).unwrap_or(false) {
            self.notify_complete();
        }
        found
    }

    /// The fencing daemon connection dropped: every unconfirmed fencing
    /// action is unachievable now.
    pub fn fencer_lost(&mut self) -> usize {
        let failed = {
            let graph = match self.graph.as_mut() {
                Some(graph) => graph,
                None => return 0,
            };
            let ids = graph.unconfirmed_of_kind(ActionKind::Fencing);
            for id in &ids {
                info!(self.log, "Failing fencing action: fencer terminated"; "action_id" => *id);
                graph.fail_action(*id);
            }
            ids.len()
        };
        if failed > 0 {
            warn!(self.log, "Fencer failure left un-runnable actions"; "count" => failed);
            self.abort(INFINITY, AbortAction::Restart, "Fencer failure");
        }
        failed
    }

    /// Expire in-flight actions whose deadline passed, synthesizing a
    /// timeout outcome. Returns how many expired.
    pub fn tick(&mut self, now: Instant) -> usize {
        let expired: Vec<(u32, bool, i32)> = {
            let graph = match self.graph.as_ref() {
                Some(graph) => graph,
                None => return 0,
            };
            graph
                .synapses
                .iter()
                .flat_map(|s| s.actions.iter())
                .filter(|a| {
                    a.status == ActionStatus::InFlight
                        && a.deadline.map(|d| d <= now).unwrap_or(false)
                })
                .map(|a| (a.id, a.confirm_on_timeout, graph.synapse_priority(a.id)))
                .collect()
        };

        for (action_id, confirm, priority) in &expired {
            let graph = self.graph.as_mut().expect("graph present");
            if *confirm {
                info!(self.log, "Confirming action on ack timeout"; "action_id" => *action_id);
                graph.confirm_action(*action_id);
            } else {
                warn!(self.log, "Action timed out"; "action_id" => *action_id);
                graph.fail_action(*action_id);
                self.record_abort(priority + 1, AbortAction::Restart, "Action timeout");
            }
        }

        if !expired.is_empty() && self.graph.as_mut().map(|g| g.update()).unwrap_or(false) {
            self.notify_complete();
        }
        expired.len()
    }

    /// Abort the transition. Priority is monotonic: a lower-priority abort
    /// never downgrades a recorded one. Suppressed entirely while this
    /// node is not leader.
    pub fn abort(&mut self, priority: i32, action: AbortAction, text: &str) {
        if self.state.suppresses_engine() {
            info!(self.log, "Abort suppressed";
                "state" => format!("{:?}", self.state), "reason" => text.to_string());
            return;
        }

        let complete = match &self.graph {
            None => {
                let _ = self.notify.send(EngineNotification::ComputeAgain);
                return;
            }
            Some(graph) => graph.complete,
        };

        if complete {
            // The graph is already done; schedule a re-plan, debounced
            // when configured.
            if self.transition_delay > Duration::ZERO {
                if let Some(handle) = self.debounce.take() {
                    handle.abort();
                }
                let notify = self.notify.clone();
                let delay = self.transition_delay;
                self.debounce = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = notify.send(EngineNotification::ComputeAgain);
                }));
            } else {
                let _ = self.notify.send(EngineNotification::ComputeAgain);
            }
            return;
        }

        info!(self.log, "Transition abort";
            "priority" => priority, "action" => format!("{:?}", action),
            "reason" => text.to_string());
        self.record_abort(priority, action, text);
    }

    fn record_abort(&mut self, priority: i32, action: AbortAction, text: &str) {
        let graph = match self.graph.as_mut() {
            Some(graph) => graph,
            None => return,
        };
        if priority > graph.abort_priority {
            graph.abort_priority = priority;
            self.abort_action = action;
        } else {
            debug!(self.log, "Abort already recorded at higher priority";
                "recorded" => graph.abort_priority, "requested" => priority,
                "reason" => text.to_string());
        }
    }

    fn notify_complete(&mut self) {
        let (graph_id, failed) = match self.graph.as_ref() {
            Some(graph) => (graph.id, graph.any_failures()),
            None => return,
        };
        info!(self.log, "Transition complete"; "graph_id" => graph_id, "failed" => failed);
        let _ = self.notify.send(EngineNotification::TransitionComplete {
            graph_id,
            failed,
            aborted: false,
        });
        if self.abort_priority() > 0 {
            let _ = self.notify.send(EngineNotification::ComputeAgain);
        }
    }
}

struct DispatchErrorWithId(u32);
