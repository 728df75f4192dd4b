//! Shared fixtures for the integration tests: a capturing bus, recording
//! store mocks, and a controller runtime wired to a local executor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use slog::{o, Drain, Logger};
use tokio::sync::mpsc;

use corral::cluster::{BusError, ClusterBus, Envelope};
use corral::executor::{
    AgentRc, ExecRequest, ExecutorApi, ExecutorConnection, LocalBackend, LocalExecutor,
    NodeExecutor, OpEvent, OpStatus, ResourceSpec,
};
use corral::store::{AttrStore, ConfigStore, EraseKey, StoreError, StoreOpts};
use corral::transition::{EngineNotification, NoThrottle};
use corral::{ControllerRuntime, CorralConfig};

pub fn create_test_logger() -> Logger {
    let decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, o!())
}

pub fn dummy_spec() -> ResourceSpec {
    ResourceSpec {
        standard: "ocf".to_string(),
        provider: Some("heartbeat".to_string()),
        kind: "Dummy".to_string(),
    }
}

/// Bus that records everything published on it.
pub struct CapturingBus {
    pub sent: Mutex<Vec<Envelope>>,
}

#[async_trait]
impl ClusterBus for CapturingBus {
    async fn publish(&self, envelope: &Envelope) -> Result<(), BusError> {
        self.sent.lock().unwrap().push(envelope.clone());
        Ok(())
    }

    fn local_node_id(&self) -> u32 {
        1
    }
}

/// Configuration store recording every call.
#[derive(Default)]
pub struct RecordingStore {
    pub recorded: Mutex<Vec<(String, String, Option<SystemTime>)>>,
    pub deleted: Mutex<Vec<String>>,
    pub stonith_updates: Mutex<Vec<String>>,
}

#[async_trait]
impl ConfigStore for RecordingStore {
    async fn record_op(
        &self,
        node: &str,
        op: &OpEvent,
        lock_until: Option<SystemTime>,
        _opts: StoreOpts,
    ) -> Result<(), StoreError> {
        self.recorded
            .lock()
            .unwrap()
            .push((node.to_string(), op.key().to_string(), lock_until));
        Ok(())
    }

    async fn delete_resource_history(
        &self,
        _node: &str,
        rsc_id: &str,
        _opts: StoreOpts,
    ) -> Result<(), StoreError> {
        self.deleted.lock().unwrap().push(rsc_id.to_string());
        Ok(())
    }

    async fn erase_op(&self, _key: &EraseKey, _opts: StoreOpts) -> Result<(), StoreError> {
        Ok(())
    }

    async fn stonith_update(
        &self,
        target: &str,
        _target_uuid: &str,
        opts: StoreOpts,
    ) -> Result<(), StoreError> {
        assert!(opts.quorum_override, "fencing outcomes must override quorum");
        self.stonith_updates.lock().unwrap().push(target.to_string());
        Ok(())
    }
}

/// Attribute store recording probe-flag clears.
#[derive(Default)]
pub struct RecordingAttrs {
    pub probed_cleared: Mutex<Vec<String>>,
    pub fail_counts_cleared: Mutex<Vec<String>>,
}

#[async_trait]
impl AttrStore for RecordingAttrs {
    async fn clear_probed(&self, node: &str) -> Result<(), StoreError> {
        self.probed_cleared.lock().unwrap().push(node.to_string());
        Ok(())
    }

    async fn clear_fail_count(&self, target: &str) -> Result<(), StoreError> {
        self.fail_counts_cleared.lock().unwrap().push(target.to_string());
        Ok(())
    }

    async fn attributes(&self, _node: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(HashMap::new())
    }
}

/// Local backend recording the parameters each op ran with.
#[derive(Default)]
pub struct RecordingBackend {
    pub invocations: Mutex<Vec<(String, HashMap<String, String>)>>,
}

#[async_trait]
impl LocalBackend for RecordingBackend {
    async fn run(
        &self,
        _spec: &ResourceSpec,
        request: &ExecRequest,
    ) -> Result<(OpStatus, AgentRc), String> {
        self.invocations
            .lock()
            .unwrap()
            .push((request.task.clone(), request.params.clone()));
        Ok((OpStatus::Done, AgentRc::Ok))
    }

    async fn list_standards(&self) -> Vec<String> {
        vec!["ocf".to_string()]
    }

    async fn list_agents(&self, _standard: &str) -> Vec<String> {
        vec!["Dummy".to_string()]
    }

    async fn list_providers(&self, _agent: &str) -> Vec<String> {
        vec!["heartbeat".to_string()]
    }

    async fn metadata(&self, _spec: &ResourceSpec) -> Option<String> {
        Some("<resource-agent/>".to_string())
    }
}

pub struct Cluster {
    pub runtime: Arc<ControllerRuntime>,
    pub bus: Arc<CapturingBus>,
    pub store: Arc<RecordingStore>,
    pub attrs: Arc<RecordingAttrs>,
    pub backend: Arc<RecordingBackend>,
    pub node: Arc<NodeExecutor>,
    pub engine_rx: mpsc::UnboundedReceiver<EngineNotification>,
    pub fatal_rx: mpsc::UnboundedReceiver<()>,
}

/// A single-node controller with one registered dummy resource.
pub async fn leader_fixture() -> Cluster {
    let log = create_test_logger();
    let bus = Arc::new(CapturingBus { sent: Mutex::new(Vec::new()) });
    let store = Arc::new(RecordingStore::default());
    let attrs = Arc::new(RecordingAttrs::default());
    let config = CorralConfig::new("node1", 1).with_dc_uuid("dc-uuid-1");

    let (runtime, engine_rx, fatal_rx) = ControllerRuntime::new(
        config,
        bus.clone(),
        store.clone(),
        attrs.clone(),
        Arc::new(NoThrottle),
        log.clone(),
    );
    runtime.set_leader(true).await;

    let backend = Arc::new(RecordingBackend::default());
    let local = LocalExecutor::new(backend.clone(), log.clone());
    local.connect().await.unwrap();
    local.register_rsc("db", &dummy_spec()).await.unwrap();

    let node = Arc::new(NodeExecutor::new(
        "node1",
        ExecutorConnection::Local(local),
        store.clone(),
        attrs.clone(),
        log,
    ));
    runtime.add_executor(node.clone());

    Cluster {
        runtime,
        bus,
        store,
        attrs,
        backend,
        node,
        engine_rx,
        fatal_rx,
    }
}
