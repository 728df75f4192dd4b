//! Fencing coordinator.
//!
//! Owns the device registry and the per-device command queues. Each device
//! runs at most one agent child at a time; a failed attempt re-enqueues the
//! command on the next capable device. Successful fencing actions are
//! handed to the caller for cluster-wide broadcast; everything else is
//! answered directly to the originator.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use slog::{crit, info, trace, warn, Logger};
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;

use crate::agent::{run_agent, AgentOutcome};
use crate::membership::{JoinPhase, Liveness, PeerCache, PeerFilter};

use super::device::FencingDevice;
use super::{
    CommandOrigin, FencingCommand, FencingError, FencingNotification, FencingResult,
    HostMapError, FENCE_ACTIONS, MANUAL_ACK_DEVICE,
};

struct QueuedCommand {
    cmd: FencingCommand,
    /// Remaining capable devices to try on failure, best first.
    fallback: VecDeque<String>,
}

struct DeviceEntry {
    device: FencingDevice,
    queue: VecDeque<QueuedCommand>,
    /// An agent child is currently running for this device.
    busy: bool,
}

struct CoordInner {
    log: Logger,
    local_uname: String,
    devices: StdMutex<HashMap<String, Arc<Mutex<DeviceEntry>>>>,
    /// Successful fencing outcomes, for the runtime to multicast.
    notify_tx: mpsc::UnboundedSender<FencingNotification>,
    /// Direct outcomes for originators.
    results: broadcast::Sender<FencingResult>,
}

/// The fencing subsystem of one node.
pub struct FencingCoordinator {
    inner: Arc<CoordInner>,
}

impl FencingCoordinator {
    /// Returns the coordinator plus the stream of outcomes that must be
    /// broadcast to the cluster.
    pub fn new(
        local_uname: &str,
        log: Logger,
    ) -> (Self, mpsc::UnboundedReceiver<FencingNotification>) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (results, _) = broadcast::channel(64);
        (
            FencingCoordinator {
                inner: Arc::new(CoordInner {
                    log,
                    local_uname: local_uname.to_string(),
                    devices: StdMutex::new(HashMap::new()),
                    notify_tx,
                    results,
                }),
            },
            notify_rx,
        )
    }

    pub fn subscribe_results(&self) -> broadcast::Receiver<FencingResult> {
        self.inner.results.subscribe()
    }

    pub fn device_count(&self) -> usize {
        self.inner.devices.lock().expect("devices lock").len()
    }

    /// Register (or replace) a fencing device.
    pub fn register_device(
        &self,
        id: &str,
        agent: &str,
        namespace: Option<&str>,
        params: HashMap<String, String>,
    ) -> Result<(), HostMapError> {
        let device = FencingDevice::from_params(id, agent, namespace, params)?;
        let mut devices = self.inner.devices.lock().expect("devices lock");
        devices.insert(
            id.to_string(),
            Arc::new(Mutex::new(DeviceEntry {
                device,
                queue: VecDeque::new(),
                busy: false,
            })),
        );
        info!(self.inner.log, "Added device to the device list";
            "device" => id, "active_devices" => devices.len());
        Ok(())
    }

    /// Remove a device. Commands still queued on it are failed over to
    /// their next fallback device, or answered as failures.
    pub async fn remove_device(&self, id: &str) -> Result<(), FencingError> {
        let entry = {
            let mut devices = self.inner.devices.lock().expect("devices lock");
            let entry = devices.remove(id);
            info!(self.inner.log, "Removed device from the device list";
                "device" => id, "active_devices" => devices.len());
            entry
        };
        let entry = match entry {
            Some(entry) => entry,
            None => return Err(FencingError::UnknownDevice(id.to_string())),
        };

        let purged: Vec<QueuedCommand> = {
            let mut entry = entry.lock().await;
            entry.queue.drain(..).collect()
        };
        for mut qcmd in purged {
            warn!(self.inner.log, "Device removal purged queued operation";
                "device" => id, "action" => &qcmd.cmd.action);
            match qcmd.fallback.pop_front() {
                Some(next) => schedule(&self.inner, next, qcmd).await,
                None => finalize_failure(&self.inner, qcmd, 1),
            }
        }
        Ok(())
    }

    /// Which devices can fence the target, best priority first.
    pub async fn query(&self, target: &str) -> Vec<String> {
        let snapshot: Vec<(String, Arc<Mutex<DeviceEntry>>)> = {
            let devices = self.inner.devices.lock().expect("devices lock");
            devices.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut capable: Vec<(String, i32)> = Vec::new();
        for (id, entry) in snapshot {
            let mut entry = entry.lock().await;
            match entry.device.can_fence(target, &self.inner.log).await {
                Ok(true) => capable.push((id, entry.device.priority)),
                Ok(false) => {}
                Err(err) => {
                    warn!(self.inner.log, "Host check errored";
                        "device" => &id, "error" => err.to_string());
                }
            }
        }
        capable.sort_by(|a, b| b.1.cmp(&a.1));
        capable.into_iter().map(|(id, _)| id).collect()
    }

    /// Fence a node: select capable devices, try them in priority order.
    pub async fn fence(&self, cmd: FencingCommand) -> Result<(), FencingError> {
        let target = match &cmd.victim {
            Some(target) => target.clone(),
            None => {
                return Err(FencingError::NoDeviceAvailable {
                    target: "<unspecified>".to_string(),
                })
            }
        };

        let capable = self.query(&target).await;
        info!(self.inner.log, "Device query";
            "target" => &target, "matching_devices" => capable.len());
        if capable.is_empty() {
            return Err(FencingError::NoDeviceAvailable { target });
        }

        let mut fallback: VecDeque<String> = capable.into_iter().collect();
        let first = fallback.pop_front().expect("non-empty");
        schedule(&self.inner, first, QueuedCommand { cmd, fallback }).await;
        Ok(())
    }

    /// Run a device-level action (monitor, list, ...) on a named device.
    pub async fn device_action(
        &self,
        device_id: &str,
        cmd: FencingCommand,
    ) -> Result<(), FencingError> {
        let known = {
            let devices = self.inner.devices.lock().expect("devices lock");
            devices.contains_key(device_id)
        };
        if !known {
            return Err(FencingError::UnknownDevice(device_id.to_string()));
        }
        schedule(
            &self.inner,
            device_id.to_string(),
            QueuedCommand { cmd, fallback: VecDeque::new() },
        )
        .await;
        Ok(())
    }

    /// Operator-injected confirmation that a target is safely down.
    pub fn confirm_manual(&self, target: &str, client: &str) {
        info!(self.inner.log, "Injecting manual confirmation that target is safely down";
            "target" => target, "client" => client);
        let _ = self.inner.notify_tx.send(FencingNotification {
            target: target.to_string(),
            action: "off".to_string(),
            rc: 0,
            device: Some(MANUAL_ACK_DEVICE.to_string()),
            executioner: self.inner.local_uname.clone(),
            client_origin: Some(client.to_string()),
            reference: Uuid::new_v4().to_string(),
        });
    }
}

fn schedule<'a>(
    inner: &'a Arc<CoordInner>,
    first_device: String,
    qcmd: QueuedCommand,
) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        let mut device_id = first_device;
        let mut qcmd = qcmd;
        loop {
            let entry = {
                let devices = inner.devices.lock().expect("devices lock");
                devices.get(&device_id).cloned()
            };
            match entry {
                Some(entry) => {
                    trace!(inner.log, "Scheduling fencing action";
                        "action" => &qcmd.cmd.action, "device" => &device_id);
                    let mut entry = entry.lock().await;
                    entry.queue.push_back(qcmd);
                    if !entry.busy {
                        entry.busy = true;
                        let inner = inner.clone();
                        let device_id = device_id.clone();
                        tokio::spawn(run_queue(inner, device_id));
                    }
                    return;
                }
                None => {
                    warn!(inner.log, "Selected device disappeared before execution";
                        "device" => &device_id);
                    match qcmd.fallback.pop_front() {
                        Some(next) => device_id = next,
                        None => {
                            finalize_failure(inner, qcmd, 1);
                            return;
                        }
                    }
                }
            }
        }
    })
}

/// Process one device's queue, one child at a time.
async fn run_queue(inner: Arc<CoordInner>, device_id: String) {
    loop {
        let entry = {
            let devices = inner.devices.lock().expect("devices lock");
            devices.get(&device_id).cloned()
        };
        let entry = match entry {
            Some(entry) => entry,
            None => return,
        };

        let next = {
            let mut entry = entry.lock().await;
            match entry.queue.pop_front() {
                Some(qcmd) => {
                    let invocation = entry.device.invocation_for(
                        &qcmd.cmd.action,
                        qcmd.cmd.victim.as_deref(),
                        qcmd.cmd.timeout,
                    );
                    Some((qcmd, invocation))
                }
                None => {
                    entry.busy = false;
                    None
                }
            }
        };
        let (mut qcmd, invocation) = match next {
            Some(next) => next,
            None => return,
        };

        let outcome = run_agent(&invocation, &inner.log).await;
        log_operation(
            &inner.log,
            &device_id,
            &qcmd.cmd,
            &outcome,
            qcmd.fallback.front().map(String::as_str),
        );

        if !outcome.succeeded() {
            if let Some(next_device) = qcmd.fallback.pop_front() {
                schedule(&inner, next_device, qcmd).await;
                continue;
            }
        }
        finalize(&inner, &device_id, qcmd, &outcome);
    }
}

fn outcome_rc(outcome: &AgentOutcome) -> i32 {
    if outcome.succeeded() {
        0
    } else {
        let rc = outcome.rc.as_i32();
        if rc == 0 {
            1
        } else {
            rc
        }
    }
}

fn finalize(inner: &Arc<CoordInner>, device_id: &str, qcmd: QueuedCommand, outcome: &AgentOutcome) {
    let success = outcome.succeeded();
    let is_fence_action = FENCE_ACTIONS.contains(&qcmd.cmd.action.as_str());

    if success && is_fence_action {
        if let Some(target) = &qcmd.cmd.victim {
            let client_origin = match &qcmd.cmd.origin {
                CommandOrigin::Local(client) => Some(client.clone()),
                CommandOrigin::Peer(peer) => Some(peer.clone()),
            };
            let _ = inner.notify_tx.send(FencingNotification {
                target: target.clone(),
                action: qcmd.cmd.action.clone(),
                rc: 0,
                device: Some(device_id.to_string()),
                executioner: inner.local_uname.clone(),
                client_origin,
                reference: qcmd.cmd.reference.clone(),
            });
            return;
        }
    }

    let _ = inner.results.send(FencingResult {
        reference: qcmd.cmd.reference.clone(),
        target: qcmd.cmd.victim.clone(),
        rc: outcome_rc(outcome),
        device: Some(device_id.to_string()),
        origin: qcmd.cmd.origin,
    });
}

fn finalize_failure(inner: &Arc<CoordInner>, qcmd: QueuedCommand, rc: i32) {
    let _ = inner.results.send(FencingResult {
        reference: qcmd.cmd.reference.clone(),
        target: qcmd.cmd.victim.clone(),
        rc,
        device: None,
        origin: qcmd.cmd.origin,
    });
}

fn log_operation(
    log: &Logger,
    device_id: &str,
    cmd: &FencingCommand,
    outcome: &AgentOutcome,
    next: Option<&str>,
) {
    let next = if outcome.succeeded() { None } else { next };
    if outcome.succeeded() {
        info!(log, "Fencing operation finished";
            "action" => &cmd.action, "device" => device_id,
            "target" => cmd.victim.clone(), "rc" => outcome.rc.as_i32());
    } else {
        warn!(log, "Fencing operation failed";
            "action" => &cmd.action, "device" => device_id,
            "target" => cmd.victim.clone(), "rc" => outcome.rc.as_i32(),
            "trying" => next.map(str::to_string));
    }

    // Agent output, line by line; metadata output is too verbose to log.
    if cmd.action != "metadata" {
        for line in outcome.stdout.lines().filter(|l| !l.is_empty()) {
            info!(log, "Agent output"; "device" => device_id, "line" => line.to_string());
        }
    }
}

/// What an incoming fencing notification means for this node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotificationDisposition {
    /// The local node itself was fenced. Terminal: the caller must halt
    /// (or exit with a distinctive code) and not come back.
    SelfFenced,
    /// Some peer was fenced and the local view was updated. `external` is
    /// set when the request did not come from this node's own engine.
    PeerFenced { target: String, external: bool },
    /// Failed outcome or unknown peer; nothing changed.
    Ignored,
}

/// Fold a fencing notification into the local membership view.
pub fn apply_notification(
    note: &FencingNotification,
    local_uname: &str,
    local_client_id: &str,
    peers: &mut PeerCache,
    log: &Logger,
) -> NotificationDisposition {
    if note.succeeded() && note.target == local_uname {
        crit!(log, "We were allegedly just fenced";
            "executioner" => &note.executioner,
            "device" => note.device.clone());
        return NotificationDisposition::SelfFenced;
    }

    info!(log, "Peer fencing outcome";
        "target" => &note.target, "action" => &note.action,
        "succeeded" => note.succeeded(), "executioner" => &note.executioner,
        "client" => note.client_origin.clone(), "ref" => &note.reference);

    if !note.succeeded() {
        return NotificationDisposition::Ignored;
    }

    if peers
        .find(None, Some(&note.target), PeerFilter::Any)
        .is_none()
    {
        return NotificationDisposition::Ignored;
    }
    peers.update_liveness(None, Some(&note.target), Liveness::Lost);
    peers.update_join(&note.target, JoinPhase::None);
    peers.update_expected(&note.target, "down");

    let external = note.client_origin.as_deref() != Some(local_client_id);
    NotificationDisposition::PeerFenced { target: note.target.clone(), external }
}

/// Terminal reaction to being fenced: halt if the platform supports it,
/// otherwise exit with a distinctive code and stay down; the rest of the
/// cluster already considers this node dead and would reject its votes.
pub fn self_fence_exit() -> ! {
    #[cfg(target_os = "linux")]
    {
        let _ = nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_HALT_SYSTEM);
    }
    std::process::exit(100);
}
