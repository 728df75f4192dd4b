//! Controller runtime.
//!
//! The context object the outer event loop owns: peer cache, outbox,
//! executor connections, fencing coordinator and transition engine, wired
//! together. The embedding daemon drives it by handing every input (bus
//! envelopes, executor updates, timer ticks, new graphs) to the matching
//! handler; nothing here runs outside those calls apart from the small
//! forwarder tasks that pump subsystem channels back into the engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use slog::{debug, info, warn, Logger};
use tokio::sync::{mpsc, Mutex};

use crate::cluster::{
    BusError, ClusterBus, Envelope, FlushOutcome, MsgRecipient, MsgSender, MsgType, Outbox,
};
use crate::config::{CorralConfig, FENCER_CONNECT_ATTEMPTS};
use crate::executor::{ExecRequest, NodeExecutor, NodeExecutorUpdate};
use crate::fencing::{
    apply_notification, CommandOrigin, FencingCommand, FencingCoordinator,
    FencingNotification, NotificationDisposition,
};
use crate::membership::{PeerCache, PeerFilter};
use crate::store::{AttrStore, ConfigStore, StoreOpts};
use crate::transition::{
    AbortAction, ActionDispatcher, ControlState, DispatchError, EngineNotification,
    GraphError, GraphInput, LoadGovernor, RunStatus, TransitionEngine, TransitionKey,
    INFINITY,
};

/// Payloads carried inside cluster envelopes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    FencingNotification(FencingNotification),
    /// A cluster-wide op requested by the leader; addressed peers ack
    /// with the reference.
    ClusterOp {
        task: String,
        target: Option<String>,
        reference: String,
    },
    ClusterOpAck { reference: String },
}

/// What handling one input amounted to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Not for us, malformed, or nothing to do.
    Ignored,
    Processed,
    /// This node itself was fenced; the process must halt and stay down.
    SelfFenced,
}

/// One attempt to sign in to the fencing daemon. The embedding daemon
/// supplies the real transport; the runtime owns the retry policy.
#[async_trait]
pub trait FencerConnector: Send + Sync {
    async fn attempt(&self) -> bool;
}

/// Routes the engine's outbound work to the owning subsystems.
struct Router {
    log: Logger,
    sender: MsgSender,
    client_id: String,
    executors: StdMutex<HashMap<String, Arc<NodeExecutor>>>,
    fencing: Arc<FencingCoordinator>,
    outbox: Mutex<Outbox>,
    bus: Arc<dyn ClusterBus>,
}

impl Router {
    async fn send_wire(&self, msg: &WireMessage, host: MsgRecipient) -> Result<(), BusError> {
        let payload =
            serde_json::to_vec(msg).map_err(|e| BusError::Other(e.to_string()))?;
        let envelope = Envelope::new(self.sender.clone(), host, 0, &payload)
            .map_err(|e| BusError::Other(e.to_string()))?;
        let mut outbox = self.outbox.lock().await;
        outbox.enqueue(envelope);
        // Push-back leaves the message queued; the next flush retries.
        let _ = outbox.flush(self.bus.as_ref()).await?;
        Ok(())
    }
}

#[async_trait]
impl ActionDispatcher for Router {
    async fn exec_resource(&self, node: &str, request: ExecRequest) -> Result<(), DispatchError> {
        let executor = {
            let executors = self.executors.lock().expect("executors lock");
            executors.get(node).cloned()
        };
        match executor {
            Some(executor) => {
                // The executor interface guarantees a result event, real or
                // synthesized, so dispatch itself cannot fail.
                executor.exec(request).await;
                Ok(())
            }
            None => Err(DispatchError(format!(
                "no executor connection for node '{}'",
                node
            ))),
        }
    }

    async fn fence(
        &self,
        target: &str,
        action: &str,
        timeout_ms: u64,
        reference: &str,
    ) -> Result<(), DispatchError> {
        self.fencing
            .fence(FencingCommand {
                action: action.to_string(),
                victim: Some(target.to_string()),
                timeout: Duration::from_millis(timeout_ms),
                origin: CommandOrigin::Local(self.client_id.clone()),
                reference: reference.to_string(),
            })
            .await
            .map_err(|e| DispatchError(e.to_string()))
    }

    async fn multicast(
        &self,
        task: &str,
        target: Option<&str>,
        reference: &str,
    ) -> Result<(), DispatchError> {
        debug!(self.log, "Multicasting cluster op";
            "task" => task.to_string(), "target" => target.map(str::to_string));
        self.send_wire(
            &WireMessage::ClusterOp {
                task: task.to_string(),
                target: target.map(str::to_string),
                reference: reference.to_string(),
            },
            MsgRecipient::broadcast(MsgType::Controller),
        )
        .await
        .map_err(|e| DispatchError(e.to_string()))
    }
}

/// Everything one controller process owns.
pub struct ControllerRuntime {
    log: Logger,
    config: CorralConfig,
    client_id: String,
    peers: StdMutex<PeerCache>,
    router: Arc<Router>,
    fencing: Arc<FencingCoordinator>,
    engine: Mutex<TransitionEngine>,
    store: Arc<dyn ConfigStore>,
    attrs: Arc<dyn AttrStore>,
    is_leader: AtomicBool,
    fatal_tx: mpsc::UnboundedSender<()>,
}

impl ControllerRuntime {
    /// Build a runtime. Returns the engine's notification stream (the
    /// policy-engine poke channel) and a terminal-signal stream that fires
    /// if this node learns it was fenced.
    pub fn new(
        config: CorralConfig,
        bus: Arc<dyn ClusterBus>,
        store: Arc<dyn ConfigStore>,
        attrs: Arc<dyn AttrStore>,
        throttle: Arc<dyn LoadGovernor>,
        log: Logger,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<EngineNotification>,
        mpsc::UnboundedReceiver<()>,
    ) {
        let client_id = config.client_id();

        let mut peers = PeerCache::new(log.new(slog::o!("subsys" => "peers")));
        peers.set_autoreap(config.autoreap);

        let (fencing, fence_notify_rx) = FencingCoordinator::new(
            &config.node_name,
            log.new(slog::o!("subsys" => "fencing")),
        );
        let fencing = Arc::new(fencing);

        let sender = MsgSender {
            id: config.node_id,
            uname: config.node_name.clone(),
            pid: std::process::id(),
            kind: MsgType::Controller,
        };
        let router = Arc::new(Router {
            log: log.new(slog::o!("subsys" => "router")),
            sender,
            client_id: client_id.clone(),
            executors: StdMutex::new(HashMap::new()),
            fencing: fencing.clone(),
            outbox: Mutex::new(Outbox::new(log.new(slog::o!("subsys" => "outbox")))),
            bus,
        });

        let (engine, engine_rx) = TransitionEngine::new(
            &config.dc_uuid,
            router.clone(),
            throttle,
            Duration::from_millis(config.transition_delay_ms),
            log.new(slog::o!("subsys" => "engine")),
        );

        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let runtime = Arc::new(ControllerRuntime {
            log,
            config,
            client_id,
            peers: StdMutex::new(peers),
            router,
            fencing,
            engine: Mutex::new(engine),
            store,
            attrs,
            is_leader: AtomicBool::new(false),
            fatal_tx,
        });

        runtime.spawn_fencing_forwarders(fence_notify_rx);
        (runtime, engine_rx, fatal_rx)
    }

    fn spawn_fencing_forwarders(
        self: &Arc<Self>,
        mut notify_rx: mpsc::UnboundedReceiver<FencingNotification>,
    ) {
        // Successful outcomes: broadcast to the cluster, then apply
        // locally like any other peer would.
        let me = self.clone();
        tokio::spawn(async move {
            while let Some(note) = notify_rx.recv().await {
                if let Err(err) = me
                    .router
                    .send_wire(
                        &WireMessage::FencingNotification(note.clone()),
                        MsgRecipient::broadcast(MsgType::Fencer),
                    )
                    .await
                {
                    warn!(me.log, "Could not broadcast fencing outcome";
                        "error" => err.to_string());
                }
                if me.apply_fencing_notification(&note).await == HandleOutcome::SelfFenced {
                    let _ = me.fatal_tx.send(());
                    return;
                }
            }
        });

        // Final failures come back directly; the engine fails the action.
        let me = self.clone();
        let mut results = self.fencing.subscribe_results();
        tokio::spawn(async move {
            loop {
                match results.recv().await {
                    Ok(result) => {
                        if let (CommandOrigin::Local(client), Some(target)) =
                            (&result.origin, &result.target)
                        {
                            if client == &me.client_id && !result.succeeded() {
                                let mut engine = me.engine.lock().await;
                                engine.on_fence_result(target, false);
                                engine.trigger().await;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => return,
                }
            }
        });
    }

    pub fn fencing(&self) -> &Arc<FencingCoordinator> {
        &self.fencing
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Run a closure against the peer cache.
    pub fn with_peers<R>(&self, f: impl FnOnce(&mut PeerCache) -> R) -> R {
        let mut peers = self.peers.lock().expect("peers lock");
        f(&mut peers)
    }

    /// Attach (or replace) the executor connection for a node and start
    /// pumping its results into the engine.
    pub fn add_executor(self: &Arc<Self>, executor: Arc<NodeExecutor>) {
        executor.spawn_event_pump();
        let mut rx = executor.subscribe();
        {
            let mut executors = self.router.executors.lock().expect("executors lock");
            executors.insert(executor.node_name().to_string(), executor.clone());
        }

        let me = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(NodeExecutorUpdate::OpResult(event)) => {
                        let mut engine = me.engine.lock().await;
                        engine.on_op_event(&event);
                        engine.trigger().await;
                    }
                    Ok(NodeExecutorUpdate::CancelConfirmed { key, .. }) => {
                        debug!(me.log, "Cancellation confirmed"; "key" => key.to_string());
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(me.log, "Executor update stream lagged"; "missed" => missed);
                    }
                    Err(_) => return,
                }
            }
        });
    }

    pub fn executor_for(&self, node: &str) -> Option<Arc<NodeExecutor>> {
        let executors = self.router.executors.lock().expect("executors lock");
        executors.get(node).cloned()
    }

    /// Become (or stop being) the leader that runs transitions.
    pub async fn set_leader(&self, leader: bool) {
        self.is_leader.store(leader, Ordering::SeqCst);
        let mut engine = self.engine.lock().await;
        engine.set_state(if leader {
            ControlState::Leader
        } else {
            ControlState::NotDc
        });
        info!(self.log, "Leadership change"; "leader" => leader);
    }

    /// Adopt a new graph from the policy engine and start executing it.
    pub async fn submit_graph(&self, input: GraphInput) -> Result<RunStatus, GraphError> {
        let mut engine = self.engine.lock().await;
        engine.set_graph(input)?;
        Ok(engine.trigger().await)
    }

    pub async fn abort_transition(&self, priority: i32, action: AbortAction, reason: &str) {
        let mut engine = self.engine.lock().await;
        engine.abort(priority, action, reason);
        engine.trigger().await;
    }

    /// The fencing daemon connection dropped. The daemon should follow up
    /// with [`ControllerRuntime::connect_fencer`] to re-establish it.
    pub async fn on_fencer_lost(&self) {
        let mut engine = self.engine.lock().await;
        if engine.fencer_lost() > 0 {
            engine.trigger().await;
        }
    }

    /// (Re)connect to the fencing daemon: up to
    /// [`FENCER_CONNECT_ATTEMPTS`] sign-in attempts, one second apart.
    /// Returns whether the link came up; after the last failure the
    /// caller escalates.
    pub async fn connect_fencer(&self, connector: &dyn FencerConnector) -> bool {
        for attempt in 1..=FENCER_CONNECT_ATTEMPTS {
            debug!(self.log, "Attempting connection to fencing daemon"; "attempt" => attempt);
            tokio::time::sleep(Duration::from_secs(1)).await;
            if connector.attempt().await {
                info!(self.log, "Connected to fencing daemon"; "attempt" => attempt);
                return true;
            }
            warn!(self.log, "Fencer sign-in failed, pausing before retry"; "attempt" => attempt);
        }
        warn!(self.log, "Giving up on the fencing daemon";
            "attempts" => FENCER_CONNECT_ATTEMPTS);
        false
    }

    /// Periodic housekeeping: expire action deadlines, flush the outbox.
    pub async fn tick(&self) -> Result<FlushOutcome, BusError> {
        {
            let mut engine = self.engine.lock().await;
            if engine.tick(Instant::now()) > 0 {
                engine.trigger().await;
            }
        }
        let mut outbox = self.router.outbox.lock().await;
        outbox.flush(self.router.bus.as_ref()).await
    }

    /// Process one envelope delivered by the messaging bus.
    pub async fn handle_envelope(&self, envelope: &Envelope) -> HandleOutcome {
        if !envelope.accepted_by(self.config.node_id, &self.config.node_name) {
            return HandleOutcome::Ignored;
        }

        // Heal the sender's cache entry while we have both id and name.
        if envelope.sender.id != 0 {
            let uname = if envelope.sender.uname.is_empty() {
                None
            } else {
                Some(envelope.sender.uname.as_str())
            };
            let mut peers = self.peers.lock().expect("peers lock");
            peers.find(Some(envelope.sender.id), uname, PeerFilter::Cluster);
        }

        let payload = match envelope.payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(self.log, "Dropping malformed cluster message";
                    "from" => &envelope.sender.uname, "error" => err.to_string());
                return HandleOutcome::Ignored;
            }
        };
        let msg: WireMessage = match serde_json::from_slice(&payload) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(self.log, "Dropping unparseable cluster message";
                    "from" => &envelope.sender.uname, "error" => err.to_string());
                return HandleOutcome::Ignored;
            }
        };

        match msg {
            WireMessage::FencingNotification(note) => {
                let outcome = self.apply_fencing_notification(&note).await;
                if outcome == HandleOutcome::SelfFenced {
                    let _ = self.fatal_tx.send(());
                }
                outcome
            }
            WireMessage::ClusterOp { task, target, reference } => {
                let for_us = target
                    .as_deref()
                    .map(|t| t == self.config.node_name)
                    .unwrap_or(true);
                if !for_us {
                    return HandleOutcome::Ignored;
                }
                info!(self.log, "Cluster-wide op requested";
                    "task" => &task, "from" => &envelope.sender.uname);
                if let Err(err) = self
                    .router
                    .send_wire(
                        &WireMessage::ClusterOpAck { reference },
                        MsgRecipient::broadcast(MsgType::TransitionEngine),
                    )
                    .await
                {
                    warn!(self.log, "Could not ack cluster op"; "error" => err.to_string());
                }
                HandleOutcome::Processed
            }
            WireMessage::ClusterOpAck { reference } => {
                if let Ok(key) = TransitionKey::parse(&reference) {
                    if key.dc_uuid == self.config.dc_uuid {
                        let mut engine = self.engine.lock().await;
                        engine.on_cluster_ack(key.graph_id, key.action_id);
                        engine.trigger().await;
                    }
                }
                HandleOutcome::Processed
            }
        }
    }

    /// Fold a fencing outcome into the local view: peer state, engine
    /// confirmation and, on the leader, the configuration-store update.
    pub async fn apply_fencing_notification(&self, note: &FencingNotification) -> HandleOutcome {
        let disposition = {
            let mut peers = self.peers.lock().expect("peers lock");
            // Keep the sweep away from the entry until the stonith
            // bookkeeping below has been recorded.
            peers.set_autoreap(false);
            apply_notification(
                note,
                &self.config.node_name,
                &self.client_id,
                &mut peers,
                &self.log,
            )
        };

        let outcome = match disposition {
            NotificationDisposition::SelfFenced => return HandleOutcome::SelfFenced,
            NotificationDisposition::PeerFenced { target, external } => {
                if self.is_leader() {
                    let target_uuid = self.with_peers(|peers| {
                        peers
                            .find(None, Some(&target), PeerFilter::Any)
                            .and_then(|p| p.uuid.clone())
                            .unwrap_or_else(|| target.clone())
                    });
                    if let Err(err) = self
                        .store
                        .stonith_update(&target, &target_uuid, StoreOpts { quorum_override: true })
                        .await
                    {
                        warn!(self.log, "Could not record fencing outcome";
                            "target" => &target, "error" => err.to_string());
                    }
                    if let Err(err) = self.attrs.clear_fail_count(&target).await {
                        warn!(self.log, "Could not reset fencing fail count";
                            "target" => &target, "error" => err.to_string());
                    }

                    let mut engine = self.engine.lock().await;
                    if external {
                        info!(self.log, "External fencing operation";
                            "target" => &target,
                            "client" => note.client_origin.clone());
                        engine.abort(
                            INFINITY,
                            AbortAction::Restart,
                            "External fencing operation",
                        );
                    }
                    engine.on_fence_result(&target, true);
                    engine.trigger().await;
                }
                HandleOutcome::Processed
            }
            NotificationDisposition::Ignored => HandleOutcome::Ignored,
        };

        {
            let mut peers = self.peers.lock().expect("peers lock");
            peers.set_autoreap(self.config.autoreap);
            peers.sweep();
        }
        outcome
    }
}
