//! Remote executor transport.
//!
//! An authenticated, mutually-keyed stream carrying line-oriented framed
//! messages: each frame has a monotonic id, a type (request/reply/notify)
//! and a JSON payload. The client registers with a hello naming itself and
//! its protocol version; the server answers with its version and a
//! registration token that must accompany every later request. Replies are
//! matched to requests through a typed correlation table; fire-and-forget
//! requests leave a drop-token behind so the reply the framing still
//! produces is absorbed silently.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use slog::{debug, error, info, trace, warn, Logger};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

use super::op::{ExecRequest, OpEvent, OpKey};
use super::{ExecutorApi, ExecutorError, Result, ResourceSpec, RscInfo};
use async_trait::async_trait;

/// Protocol version spoken by this client. A server answering with a
/// different version is a hard error.
pub const EXECUTOR_PROTOCOL_VERSION: &str = "1.1";

/// Hard ceiling on any synchronous wait for a reply.
const MAX_REMOTE_WAIT: Duration = Duration::from_secs(10);

/// How long a loaded pre-shared key stays cached in memory.
const PSK_TTL: Duration = Duration::from_secs(60);

type HmacSha256 = Hmac<Sha256>;

/// Pre-shared key loaded from a configurable path with a fallback,
/// cached in memory for [`PSK_TTL`].
pub struct PskCache {
    path: PathBuf,
    fallback: Option<PathBuf>,
    cached: StdMutex<Option<(Vec<u8>, Instant)>>,
}

impl PskCache {
    pub fn new(path: PathBuf, fallback: Option<PathBuf>) -> Self {
        PskCache { path, fallback, cached: StdMutex::new(None) }
    }

    pub fn load(&self) -> Result<Vec<u8>> {
        let mut cached = self.cached.lock().expect("psk lock");
        if let Some((key, at)) = cached.as_ref() {
            if at.elapsed() < PSK_TTL {
                return Ok(key.clone());
            }
        }

        let key = match std::fs::read(&self.path) {
            Ok(key) => key,
            Err(primary) => match &self.fallback {
                Some(fallback) => std::fs::read(fallback).map_err(|_| primary)?,
                None => return Err(primary.into()),
            },
        };
        *cached = Some((key.clone(), Instant::now()));
        Ok(key)
    }
}

/// Registration digest proving knowledge of the key without sending it.
fn auth_digest(psk: &[u8], client_name: &str, version: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(psk).expect("HMAC accepts any key length");
    mac.update(client_name.as_bytes());
    mac.update(b"\n");
    mac.update(version.as_bytes());
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FrameKind {
    Request,
    Reply,
    Notify,
}

/// One line on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Frame {
    id: u32,
    #[serde(rename = "type")]
    kind: FrameKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    payload: serde_json::Value,
}

/// What is waiting on a given request id.
enum Waiter {
    /// A caller blocked on the reply.
    Reply(oneshot::Sender<Frame>),
    /// Fire-and-forget: absorb the reply silently when it shows up.
    Discard,
}

#[derive(Default)]
struct Correlation {
    next_id: u32,
    waiters: HashMap<u32, Waiter>,
    /// Notifications that arrived while a synchronous wait was active.
    pending_notify: VecDeque<serde_json::Value>,
    awaiting_sync: bool,
}

impl Correlation {
    fn assign_id(&mut self) -> u32 {
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
        self.next_id
    }
}

struct ConnState {
    write: OwnedWriteHalf,
    reader: JoinHandle<()>,
    peer_version: String,
}

struct RemoteShared {
    log: Logger,
    addr: String,
    client_name: String,
    psk: PskCache,
    conn: Mutex<Option<ConnState>>,
    /// Registration token expected on every reply once the handshake is
    /// complete.
    token: StdMutex<Option<String>>,
    corr: StdMutex<Correlation>,
    connected: AtomicBool,
    events: broadcast::Sender<OpEvent>,
}

/// Client side of the remote executor connection.
pub struct RemoteExecutor {
    shared: Arc<RemoteShared>,
}

impl RemoteExecutor {
    pub fn new(
        addr: &str,
        client_name: &str,
        psk_path: PathBuf,
        psk_fallback: Option<PathBuf>,
        log: Logger,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        RemoteExecutor {
            shared: Arc::new(RemoteShared {
                log,
                addr: addr.to_string(),
                client_name: client_name.to_string(),
                psk: PskCache::new(psk_path, psk_fallback),
                conn: Mutex::new(None),
                token: StdMutex::new(None),
                corr: StdMutex::new(Correlation::default()),
                connected: AtomicBool::new(false),
                events,
            }),
        }
    }

    /// Peer protocol version negotiated at handshake, when connected.
    pub async fn peer_version(&self) -> Option<String> {
        self.shared
            .conn
            .lock()
            .await
            .as_ref()
            .map(|c| c.peer_version.clone())
    }

    /// Outstanding fire-and-forget replies not yet absorbed.
    pub fn expected_late_replies(&self) -> usize {
        let corr = self.shared.corr.lock().expect("corr lock");
        corr.waiters
            .values()
            .filter(|w| matches!(w, Waiter::Discard))
            .count()
    }

    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');
        let mut conn = self.shared.conn.lock().await;
        match conn.as_mut() {
            Some(state) => {
                state.write.write_all(line.as_bytes()).await?;
                Ok(())
            }
            None => Err(ExecutorError::NotConnected),
        }
    }

    fn register_waiter(&self, waiter: Waiter, sync: bool) -> u32 {
        let mut corr = self.shared.corr.lock().expect("corr lock");
        let id = corr.assign_id();
        corr.waiters.insert(id, waiter);
        if sync {
            corr.awaiting_sync = true;
        }
        id
    }

    fn finish_sync_wait(&self) {
        let queued: Vec<serde_json::Value> = {
            let mut corr = self.shared.corr.lock().expect("corr lock");
            corr.awaiting_sync = false;
            corr.pending_notify.drain(..).collect()
        };
        for payload in queued {
            dispatch_notify(&self.shared, payload);
        }
    }

    /// Send a request and wait for the matching reply, bounded by the
    /// given timeout clamped to [`MAX_REMOTE_WAIT`]. A timeout declares
    /// the connection dead.
    async fn send_request(
        &self,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<Frame> {
        if !self.is_connected() {
            return Err(ExecutorError::NotConnected);
        }
        let (tx, rx) = oneshot::channel();
        let id = self.register_waiter(Waiter::Reply(tx), true);
        let token = self.shared.token.lock().expect("token lock").clone();
        let frame = Frame { id, kind: FrameKind::Request, token, payload };

        if let Err(err) = self.write_frame(&frame).await {
            self.shared.corr.lock().expect("corr lock").waiters.remove(&id);
            self.finish_sync_wait();
            return Err(err);
        }

        let wait = match timeout {
            Some(t) if t > Duration::ZERO && t < MAX_REMOTE_WAIT => t,
            _ => MAX_REMOTE_WAIT,
        };
        let reply = tokio::time::timeout(wait, rx).await;
        self.finish_sync_wait();

        match reply {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(ExecutorError::NotConnected),
            Err(_) => {
                error!(self.shared.log, "No reply within the timeout period, disconnecting";
                    "request_id" => id, "timeout_ms" => wait.as_millis() as u64);
                self.shared.corr.lock().expect("corr lock").waiters.remove(&id);
                self.disconnect_internal().await;
                Err(ExecutorError::ReplyTimeout(id))
            }
        }
    }

    /// Send a request without waiting. The framing still produces a reply
    /// eventually; the drop-token left in the correlation table absorbs it.
    async fn send_no_reply(&self, payload: serde_json::Value) -> Result<()> {
        if !self.is_connected() {
            return Err(ExecutorError::NotConnected);
        }
        let id = self.register_waiter(Waiter::Discard, false);
        let token = self.shared.token.lock().expect("token lock").clone();
        let frame = Frame { id, kind: FrameKind::Request, token, payload };
        if let Err(err) = self.write_frame(&frame).await {
            self.shared.corr.lock().expect("corr lock").waiters.remove(&id);
            return Err(err);
        }
        Ok(())
    }

    async fn disconnect_internal(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        let mut conn = self.shared.conn.lock().await;
        if let Some(state) = conn.take() {
            state.reader.abort();
        }
        *self.shared.token.lock().expect("token lock") = None;
        // In-flight synchronous waits fail with "not connected" as their
        // oneshot senders are dropped here. Drop-tokens go too; after a
        // reconnect the id space restarts anyway.
        let mut corr = self.shared.corr.lock().expect("corr lock");
        corr.waiters.clear();
        corr.pending_notify.clear();
        corr.awaiting_sync = false;
    }

    fn check_reply_rc(&self, frame: &Frame) -> Result<()> {
        let rc = frame.payload.get("rc").and_then(|v| v.as_i64()).unwrap_or(0);
        if rc == 0 {
            return Ok(());
        }
        let reason = frame
            .payload
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("unspecified")
            .to_string();
        match frame.payload.get("not_authorized").and_then(|v| v.as_bool()) {
            Some(true) => Err(ExecutorError::NotAuthorized(reason)),
            _ => Err(ExecutorError::Invalid(reason)),
        }
    }
}

fn dispatch_notify(shared: &Arc<RemoteShared>, payload: serde_json::Value) {
    match serde_json::from_value::<OpEvent>(payload) {
        Ok(event) => {
            trace!(shared.log, "Executor notification";
                "key" => event.key().to_string(), "call_id" => event.call_id);
            let _ = shared.events.send(event);
        }
        Err(err) => {
            warn!(shared.log, "Discarding unparseable executor notification";
                "error" => err.to_string());
        }
    }
}

/// Reader task: drains frames off the stream, routing replies through the
/// correlation table and notifications to subscribers.
async fn read_loop(shared: Arc<RemoteShared>, read: OwnedReadHalf) {
    let mut lines = BufReader::new(read).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!(shared.log, "Executor connection closed by peer"; "addr" => &shared.addr);
                break;
            }
            Err(err) => {
                info!(shared.log, "Lost executor connection while reading";
                    "addr" => &shared.addr, "error" => err.to_string());
                break;
            }
        };
        if line.is_empty() {
            continue;
        }

        let frame: Frame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(err) => {
                error!(shared.log, "Malformed frame from executor, dropping connection";
                    "error" => err.to_string());
                break;
            }
        };

        match frame.kind {
            FrameKind::Reply => {
                // A reply carrying the wrong registration token means the
                // peer is confused about who we are: tear down.
                let expected = shared.token.lock().expect("token lock").clone();
                if let Some(expected) = expected {
                    if frame.token.as_deref() != Some(expected.as_str()) {
                        error!(shared.log, "Reply carried a mismatched registration token";
                            "request_id" => frame.id);
                        break;
                    }
                }

                let waiter = shared
                    .corr
                    .lock()
                    .expect("corr lock")
                    .waiters
                    .remove(&frame.id);
                match waiter {
                    Some(Waiter::Reply(tx)) => {
                        let _ = tx.send(frame);
                    }
                    Some(Waiter::Discard) => {
                        debug!(shared.log, "Absorbed expected late reply"; "request_id" => frame.id);
                    }
                    None => {
                        error!(shared.log, "Got outdated executor reply"; "request_id" => frame.id);
                    }
                }
            }
            FrameKind::Notify => {
                let mut corr = shared.corr.lock().expect("corr lock");
                if corr.awaiting_sync {
                    corr.pending_notify.push_back(frame.payload);
                } else {
                    drop(corr);
                    dispatch_notify(&shared, frame.payload);
                }
            }
            FrameKind::Request => {
                error!(shared.log, "Unexpected request frame from executor, dropping connection";
                    "request_id" => frame.id);
                break;
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    let mut corr = shared.corr.lock().expect("corr lock");
    corr.waiters.clear();
}

#[async_trait]
impl ExecutorApi for RemoteExecutor {
    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let psk = self.shared.psk.load()?;
        let stream = TcpStream::connect(&self.shared.addr).await?;
        let (read, write) = stream.into_split();

        {
            let mut conn = self.shared.conn.lock().await;
            let reader = tokio::spawn(read_loop(self.shared.clone(), read));
            *conn = Some(ConnState {
                write,
                reader,
                peer_version: String::new(),
            });
        }
        self.shared.connected.store(true, Ordering::SeqCst);

        let hello = json!({
            "op": "register",
            "client_name": self.shared.client_name,
            "protocol_version": EXECUTOR_PROTOCOL_VERSION,
            "auth": auth_digest(&psk, &self.shared.client_name, EXECUTOR_PROTOCOL_VERSION),
        });
        let reply = match self.send_request(hello, None).await {
            Ok(reply) => reply,
            Err(err) => {
                self.disconnect_internal().await;
                return Err(err);
            }
        };

        let version = reply
            .payload
            .get("protocol_version")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        if version != EXECUTOR_PROTOCOL_VERSION {
            error!(self.shared.log, "Executor protocol version mismatch";
                "client" => EXECUTOR_PROTOCOL_VERSION, "server" => &version);
            self.disconnect_internal().await;
            return Err(ExecutorError::Protocol(format!(
                "client speaks {}, server speaks {}",
                EXECUTOR_PROTOCOL_VERSION, version
            )));
        }
        let ticket = match reply.payload.get("token").and_then(|v| v.as_str()) {
            Some(ticket) if !ticket.is_empty() => ticket.to_string(),
            _ => {
                self.disconnect_internal().await;
                return Err(ExecutorError::Protocol(
                    "no registration token provided".to_string(),
                ));
            }
        };

        trace!(self.shared.log, "Obtained registration token");
        *self.shared.token.lock().expect("token lock") = Some(ticket);
        if let Some(state) = self.shared.conn.lock().await.as_mut() {
            state.peer_version = version;
        }
        info!(self.shared.log, "Connected to remote executor"; "addr" => &self.shared.addr);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect_internal().await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn register_rsc(&self, id: &str, spec: &ResourceSpec) -> Result<()> {
        let reply = self
            .send_request(
                json!({
                    "op": "register_rsc",
                    "rsc_id": id,
                    "standard": spec.standard,
                    "provider": spec.provider,
                    "kind": spec.kind,
                }),
                None,
            )
            .await?;
        self.check_reply_rc(&reply)
    }

    async fn unregister_rsc(&self, id: &str) -> Result<()> {
        let reply = self
            .send_request(json!({ "op": "unregister_rsc", "rsc_id": id }), None)
            .await?;
        self.check_reply_rc(&reply)
    }

    async fn rsc_info(&self, id: &str) -> Result<RscInfo> {
        let reply = self
            .send_request(json!({ "op": "rsc_info", "rsc_id": id }), None)
            .await?;
        self.check_reply_rc(&reply)?;
        let payload = &reply.payload;
        let get = |field: &str| {
            payload
                .get(field)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        match (get("standard"), get("kind")) {
            (Some(standard), Some(kind)) => Ok(RscInfo {
                id: id.to_string(),
                spec: ResourceSpec { standard, provider: get("provider"), kind },
            }),
            _ => Err(ExecutorError::NoSuchResource(id.to_string())),
        }
    }

    async fn list_standards(&self) -> Result<Vec<String>> {
        let reply = self
            .send_request(json!({ "op": "list_standards" }), None)
            .await?;
        self.check_reply_rc(&reply)?;
        Ok(string_list(&reply.payload, "items"))
    }

    async fn list_agents(&self, standard: &str) -> Result<Vec<String>> {
        let reply = self
            .send_request(json!({ "op": "list_agents", "standard": standard }), None)
            .await?;
        self.check_reply_rc(&reply)?;
        Ok(string_list(&reply.payload, "items"))
    }

    async fn list_providers(&self, agent: &str) -> Result<Vec<String>> {
        let reply = self
            .send_request(json!({ "op": "list_providers", "agent": agent }), None)
            .await?;
        self.check_reply_rc(&reply)?;
        Ok(string_list(&reply.payload, "items"))
    }

    async fn metadata(&self, spec: &ResourceSpec) -> Result<String> {
        let reply = self
            .send_request(
                json!({
                    "op": "metadata",
                    "standard": spec.standard,
                    "provider": spec.provider,
                    "kind": spec.kind,
                }),
                None,
            )
            .await?;
        self.check_reply_rc(&reply)?;
        Ok(reply
            .payload
            .get("metadata")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string())
    }

    async fn exec(&self, request: &ExecRequest) -> Result<u32> {
        let reply = self
            .send_request(
                json!({ "op": "exec", "request": request }),
                Some(Duration::from_millis(request.timeout_ms)),
            )
            .await?;
        self.check_reply_rc(&reply)?;
        reply
            .payload
            .get("call_id")
            .and_then(|v| v.as_u64())
            .map(|id| id as u32)
            .ok_or_else(|| ExecutorError::Invalid("reply without call id".to_string()))
    }

    async fn cancel(&self, key: &OpKey) -> Result<()> {
        let reply = self
            .send_request(json!({ "op": "cancel", "key": key.to_string() }), None)
            .await?;
        self.check_reply_rc(&reply)
    }

    async fn list_recurring(&self, rsc_id: &str) -> Result<Vec<OpKey>> {
        let reply = self
            .send_request(json!({ "op": "list_recurring", "rsc_id": rsc_id }), None)
            .await?;
        self.check_reply_rc(&reply)?;
        let mut keys = Vec::new();
        for raw in string_list(&reply.payload, "ops") {
            keys.push(OpKey::parse(&raw).map_err(|e| ExecutorError::Invalid(e.to_string()))?);
        }
        Ok(keys)
    }

    async fn poke(&self) -> Result<()> {
        // Liveness probe; nobody waits on the answer.
        self.send_no_reply(json!({ "op": "poke" })).await
    }

    fn subscribe(&self) -> broadcast::Receiver<OpEvent> {
        self.shared.events.subscribe()
    }
}

fn string_list(payload: &serde_json::Value, field: &str) -> Vec<String> {
    payload
        .get(field)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
