//! Local executor transport.
//!
//! The trusted in-process variant of the executor connection. Agent
//! execution itself is behind the [`LocalBackend`] trait so the embedding
//! daemon supplies the real agent runner and tests supply mocks; this layer
//! owns call-id assignment, the registered-resource table, recurring-op
//! scheduling and result-event fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use slog::{debug, info, Logger};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::op::{AgentRc, ExecRequest, OpEvent, OpKey, OpOrigin, OpStatus};
use super::{ExecutorApi, ExecutorError, Result, ResourceSpec, RscInfo};

/// What actually runs agents for the local executor.
#[async_trait]
pub trait LocalBackend: Send + Sync {
    /// Run one operation to completion, returning the observed outcome.
    async fn run(
        &self,
        spec: &ResourceSpec,
        request: &ExecRequest,
    ) -> std::result::Result<(OpStatus, AgentRc), String>;

    async fn list_standards(&self) -> Vec<String>;
    async fn list_agents(&self, standard: &str) -> Vec<String>;
    async fn list_providers(&self, agent: &str) -> Vec<String>;
    async fn metadata(&self, spec: &ResourceSpec) -> Option<String>;
}

struct LocalInner {
    log: Logger,
    backend: Arc<dyn LocalBackend>,
    resources: StdMutex<HashMap<String, ResourceSpec>>,
    recurring: StdMutex<HashMap<OpKey, (u32, JoinHandle<()>)>>,
    next_call_id: AtomicU32,
    connected: AtomicBool,
    events: broadcast::Sender<OpEvent>,
}

impl LocalInner {
    fn emit(&self, event: OpEvent) {
        let _ = self.events.send(event);
    }
}

/// Trusted local executor connection.
pub struct LocalExecutor {
    inner: Arc<LocalInner>,
}

impl LocalExecutor {
    pub fn new(backend: Arc<dyn LocalBackend>, log: Logger) -> Self {
        let (events, _) = broadcast::channel(256);
        LocalExecutor {
            inner: Arc::new(LocalInner {
                log,
                backend,
                resources: StdMutex::new(HashMap::new()),
                recurring: StdMutex::new(HashMap::new()),
                next_call_id: AtomicU32::new(1),
                connected: AtomicBool::new(false),
                events,
            }),
        }
    }

    fn assign_call_id(&self) -> u32 {
        let id = self.inner.next_call_id.fetch_add(1, Ordering::SeqCst);
        if id == 0 {
            self.inner.next_call_id.store(2, Ordering::SeqCst);
            return 1;
        }
        id
    }

    fn lookup_spec(&self, rsc_id: &str) -> Result<ResourceSpec> {
        self.inner
            .resources
            .lock()
            .expect("resources lock")
            .get(rsc_id)
            .cloned()
            .ok_or_else(|| ExecutorError::NoSuchResource(rsc_id.to_string()))
    }

    async fn run_once(
        inner: &Arc<LocalInner>,
        spec: &ResourceSpec,
        request: &ExecRequest,
        call_id: u32,
    ) {
        let outcome = inner.backend.run(spec, request).await;
        let (status, rc, exit_reason) = match outcome {
            Ok((status, rc)) => (status, rc, None),
            Err(reason) => (OpStatus::Error, AgentRc::UnknownError, Some(reason)),
        };
        inner.emit(OpEvent {
            rsc_id: request.rsc_id.clone(),
            task: request.task.clone(),
            interval_ms: request.interval_ms,
            call_id,
            status,
            rc,
            user_data: request.user_data.clone(),
            params: Some(request.params.clone()),
            origin: OpOrigin::Executor,
            rsc_deleted: false,
            exit_reason,
        });
    }
}

#[async_trait]
impl ExecutorApi for LocalExecutor {
    async fn connect(&self) -> Result<()> {
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.connected.store(false, Ordering::SeqCst);
        let handles: Vec<(u32, JoinHandle<()>)> = self
            .inner
            .recurring
            .lock()
            .expect("recurring lock")
            .drain()
            .map(|(_, v)| v)
            .collect();
        for (_, handle) in handles {
            handle.abort();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn register_rsc(&self, id: &str, spec: &ResourceSpec) -> Result<()> {
        super::op::validate_rsc_id(id).map_err(|e| ExecutorError::Invalid(e.to_string()))?;
        debug!(self.inner.log, "Registered resource";
            "rsc_id" => id, "standard" => &spec.standard, "kind" => &spec.kind);
        self.inner
            .resources
            .lock()
            .expect("resources lock")
            .insert(id.to_string(), spec.clone());
        Ok(())
    }

    async fn unregister_rsc(&self, id: &str) -> Result<()> {
        self.inner
            .resources
            .lock()
            .expect("resources lock")
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ExecutorError::NoSuchResource(id.to_string()))
    }

    async fn rsc_info(&self, id: &str) -> Result<RscInfo> {
        let spec = self.lookup_spec(id)?;
        Ok(RscInfo { id: id.to_string(), spec })
    }

    async fn list_standards(&self) -> Result<Vec<String>> {
        Ok(self.inner.backend.list_standards().await)
    }

    async fn list_agents(&self, standard: &str) -> Result<Vec<String>> {
        Ok(self.inner.backend.list_agents(standard).await)
    }

    async fn list_providers(&self, agent: &str) -> Result<Vec<String>> {
        Ok(self.inner.backend.list_providers(agent).await)
    }

    async fn metadata(&self, spec: &ResourceSpec) -> Result<String> {
        self.inner
            .backend
            .metadata(spec)
            .await
            .ok_or_else(|| ExecutorError::Invalid("no metadata for agent".to_string()))
    }

    async fn exec(&self, request: &ExecRequest) -> Result<u32> {
        if !self.is_connected() {
            return Err(ExecutorError::NotConnected);
        }
        let spec = self.lookup_spec(&request.rsc_id)?;
        let call_id = self.assign_call_id();
        let key = request.key();

        if request.interval_ms > 0 {
            // Recurring: re-issued on schedule until cancelled. A re-exec of
            // the same key replaces the existing schedule.
            let inner = self.inner.clone();
            let request = request.clone();
            let interval = Duration::from_millis(request.interval_ms as u64);
            let handle = tokio::spawn(async move {
                loop {
                    LocalExecutor::run_once(&inner, &spec, &request, call_id).await;
                    tokio::time::sleep(interval).await;
                }
            });
            let mut recurring = self.inner.recurring.lock().expect("recurring lock");
            if let Some((_, old)) = recurring.insert(key, (call_id, handle)) {
                old.abort();
            }
        } else {
            let inner = self.inner.clone();
            let request = request.clone();
            tokio::spawn(async move {
                LocalExecutor::run_once(&inner, &spec, &request, call_id).await;
            });
        }
        Ok(call_id)
    }

    async fn cancel(&self, key: &OpKey) -> Result<()> {
        let removed = self
            .inner
            .recurring
            .lock()
            .expect("recurring lock")
            .remove(key);
        match removed {
            Some((call_id, handle)) => {
                handle.abort();
                info!(self.inner.log, "Cancelled recurring op"; "key" => key.to_string());
                self.inner.emit(OpEvent {
                    rsc_id: key.rsc_id.clone(),
                    task: key.task.clone(),
                    interval_ms: key.interval_ms,
                    call_id,
                    status: OpStatus::Cancelled,
                    rc: AgentRc::Ok,
                    user_data: None,
                    params: None,
                    origin: OpOrigin::Executor,
                    rsc_deleted: false,
                    exit_reason: None,
                });
                Ok(())
            }
            None => Err(ExecutorError::Invalid(format!(
                "no recurring op matches '{}'",
                key
            ))),
        }
    }

    async fn list_recurring(&self, rsc_id: &str) -> Result<Vec<OpKey>> {
        Ok(self
            .inner
            .recurring
            .lock()
            .expect("recurring lock")
            .keys()
            .filter(|key| key.rsc_id == rsc_id)
            .cloned()
            .collect())
    }

    async fn poke(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ExecutorError::NotConnected)
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<OpEvent> {
        self.inner.events.subscribe()
    }
}
