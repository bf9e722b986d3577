use crate::backend::{ExecutionBackend, SpawnedWorker, StartupProgress};
use crate::command_protocol::{
    CommandMethod, ExecuteSnapParams, SnapRpcParams, WorkerNotification, OK_RESULT,
};
use crate::config::ExecutionServiceConfig;
use crate::dispatcher::{CommandDispatcher, CommandError, NotificationHandler};
use crate::error::ExecutionError;
use crate::events::{ActivityObserver, EventBus, ExecutionEvent, SnapStatus};
use crate::stream_mux::{StreamMultiplexer, COMMAND_CHANNEL, JSON_RPC_CHANNEL};
use crate::timeout::{with_timeout, with_timer, TimedOut, Timer};
use crate::transport::MessageStream;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

pub type ProviderSetup = Arc<dyn Fn(&str, MessageStream) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapExecutionData {
    pub snap_id: String,
    pub source_code: String,
    pub endowments: Vec<String>,
}

impl SnapExecutionData {
    pub fn new(
        snap_id: impl Into<String>,
        source_code: impl Into<String>,
        endowments: Vec<String>,
    ) -> Self {
        Self {
            snap_id: snap_id.into(),
            source_code: source_code.into(),
            endowments,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SnapRpcRequest {
    pub origin: String,
    pub handler: String,
    pub request: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ExecutionTelemetrySnapshot {
    pub spawn_count: u64,
    pub ping_count: u64,
    pub execute_count: u64,
    pub rpc_request_count: u64,
    pub init_timeout_count: u64,
    pub termination_timeout_count: u64,
    pub unhandled_error_count: u64,
    pub malformed_notification_count: u64,
    pub unknown_notification_count: u64,
}

#[derive(Default)]
struct Telemetry {
    spawn: AtomicU64,
    ping: AtomicU64,
    execute: AtomicU64,
    rpc_request: AtomicU64,
    init_timeout: AtomicU64,
    termination_timeout: AtomicU64,
    unhandled_error: AtomicU64,
    malformed_notification: AtomicU64,
    unknown_notification: AtomicU64,
}

impl Telemetry {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ExecutionTelemetrySnapshot {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ExecutionTelemetrySnapshot {
            spawn_count: read(&self.spawn),
            ping_count: read(&self.ping),
            execute_count: read(&self.execute),
            rpc_request_count: read(&self.rpc_request),
            init_timeout_count: read(&self.init_timeout),
            termination_timeout_count: read(&self.termination_timeout),
            unhandled_error_count: read(&self.unhandled_error),
            malformed_notification_count: read(&self.malformed_notification),
            unknown_notification_count: read(&self.unknown_notification),
        }
    }
}

struct Job<W> {
    id: String,
    mux: StreamMultiplexer,
    dispatcher: CommandDispatcher,
    worker: W,
}

struct Tables<W> {
    jobs: HashMap<String, Arc<Job<W>>>,
    statuses: HashMap<String, SnapStatus>,
}

impl<W> Default for Tables<W> {
    fn default() -> Self {
        Self {
            jobs: HashMap::new(),
            statuses: HashMap::new(),
        }
    }
}

struct Inner<B: ExecutionBackend> {
    backend: B,
    config: ExecutionServiceConfig,
    tables: Mutex<Tables<B::Worker>>,
    events: EventBus,
    telemetry: Arc<Telemetry>,
    provider_setup: Option<ProviderSetup>,
}

pub struct ExecutionService<B: ExecutionBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: ExecutionBackend> Clone for ExecutionService<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: ExecutionBackend> ExecutionService<B> {
    pub fn new(backend: B, config: ExecutionServiceConfig) -> Self {
        Self::build(backend, config, None)
    }

    pub fn with_provider_setup(
        backend: B,
        config: ExecutionServiceConfig,
        provider_setup: ProviderSetup,
    ) -> Self {
        Self::build(backend, config, Some(provider_setup))
    }

    fn build(
        backend: B,
        config: ExecutionServiceConfig,
        provider_setup: Option<ProviderSetup>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                tables: Mutex::new(Tables::default()),
                events: EventBus::new(),
                telemetry: Arc::new(Telemetry::default()),
                provider_setup,
            }),
        }
    }

    pub fn config(&self) -> &ExecutionServiceConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Starts `data.snap_id` and returns the worker's answer to `executeSnap`.
    ///
    /// Any failure leaves neither a job nor a status entry behind.
    pub async fn execute_snap(&self, data: SnapExecutionData) -> Result<Value, ExecutionError> {
        let snap_id = data.snap_id.clone();
        self.reserve(&snap_id)?;
        self.set_status(&snap_id, SnapStatus::Initializing);

        let config = &self.inner.config;
        let mut timer = Timer::new(config.init_timeout());
        let progress = StartupProgress::new();
        Telemetry::bump(&self.inner.telemetry.spawn);

        let startup = with_timer(self.inner.backend.spawn(&snap_id, &progress), &mut timer).await;
        let spawned = match startup {
            Ok(Ok(spawned)) => spawned,
            Ok(Err(source)) => {
                tracing::warn!(snap_id = %snap_id, error = %source, "worker spawn failed");
                self.inner.backend.teardown(&snap_id, None).await;
                self.forget(&snap_id);
                return Err(ExecutionError::Spawn { snap_id, source });
            }
            Err(TimedOut) => {
                Telemetry::bump(&self.inner.telemetry.init_timeout);
                let started = progress.is_started();
                tracing::warn!(snap_id = %snap_id, started, "worker startup timed out");
                self.inner.backend.teardown(&snap_id, None).await;
                self.forget(&snap_id);
                return Err(if started {
                    ExecutionError::NeverReady { snap_id }
                } else {
                    ExecutionError::NeverStarted { snap_id }
                });
            }
        };

        let job = Arc::new(self.assemble_job(&snap_id, spawned));
        let data_channel = job.mux.create_observed_channel(
            JSON_RPC_CHANNEL,
            Arc::new(ActivityObserver::new(
                snap_id.clone(),
                self.inner.events.clone(),
            )),
        );

        if config.use_ping {
            if let Err(err) = self.ping(&job).await {
                self.abort_startup(&job).await;
                return Err(err);
            }
        }

        match &self.inner.provider_setup {
            Some(setup) => setup(&snap_id, data_channel),
            None => drop(data_channel),
        }

        let budget = timer.remaining().max(config.min_execution_budget());
        timer.clear();

        self.inner
            .tables()
            .jobs
            .insert(snap_id.clone(), Arc::clone(&job));
        self.set_status(&snap_id, SnapStatus::Initialized);
        self.set_status(&snap_id, SnapStatus::Executing);

        Telemetry::bump(&self.inner.telemetry.execute);
        let params = ExecuteSnapParams {
            snap_id: snap_id.clone(),
            source_code: data.source_code,
            endowments: data.endowments,
        }
        .to_value();
        let outcome = with_timeout(
            job.dispatcher
                .request(CommandMethod::ExecuteSnap.as_str(), Some(params)),
            budget,
        )
        .await;

        let err = match outcome {
            Ok(Ok(result)) => {
                self.set_status(&snap_id, SnapStatus::Running);
                tracing::info!(snap_id = %snap_id, "snap running");
                return Ok(result);
            }
            Ok(Err(CommandError::Rpc(error))) => ExecutionError::ExecutionFailed {
                snap_id: snap_id.clone(),
                error,
            },
            Ok(Err(CommandError::Closed)) => ExecutionError::ChannelClosed {
                snap_id: snap_id.clone(),
                phase: "executeSnap",
            },
            Err(TimedOut) => ExecutionError::ExecutionTimeout {
                snap_id: snap_id.clone(),
            },
        };
        tracing::warn!(snap_id = %snap_id, error = %err, "snap execution failed");
        self.terminate_snap(&snap_id).await;
        Err(err)
    }

    /// Forwards an RPC call to a running snap. No host-side timeout applies.
    pub async fn handle_rpc_request(
        &self,
        snap_id: &str,
        request: SnapRpcRequest,
    ) -> Result<Value, ExecutionError> {
        let job = self.inner.tables().jobs.get(snap_id).cloned();
        let Some(job) = job else {
            return Err(ExecutionError::NotRunning {
                snap_id: snap_id.to_string(),
            });
        };

        Telemetry::bump(&self.inner.telemetry.rpc_request);
        let params = SnapRpcParams {
            snap_id: snap_id.to_string(),
            origin: request.origin,
            handler: request.handler,
            request: request.request,
        }
        .to_value();

        job.dispatcher
            .request(CommandMethod::SnapRpc.as_str(), Some(params))
            .await
            .map_err(|err| match err {
                CommandError::Rpc(error) => ExecutionError::Rpc {
                    snap_id: snap_id.to_string(),
                    error,
                },
                CommandError::Closed => ExecutionError::ChannelClosed {
                    snap_id: snap_id.to_string(),
                    phase: "snapRpc",
                },
            })
    }

    /// Best-effort shutdown: asks nicely, then tears down regardless. Unknown
    /// ids are ignored.
    pub async fn terminate_snap(&self, snap_id: &str) {
        let job = self.inner.tables().jobs.get(snap_id).cloned();
        let Some(job) = job else {
            tracing::debug!(snap_id, "terminate requested for unknown snap");
            return;
        };

        let outcome = with_timeout(
            job.dispatcher
                .request(CommandMethod::Terminate.as_str(), None),
            self.inner.config.termination_timeout(),
        )
        .await;
        match outcome {
            Ok(Ok(result)) if result == OK_RESULT => {
                tracing::debug!(snap_id, "worker acknowledged terminate");
            }
            Ok(Ok(result)) => {
                tracing::warn!(snap_id, result = %result, "worker answered terminate unexpectedly");
            }
            Ok(Err(err)) => {
                tracing::warn!(snap_id, error = %err, "cooperative terminate failed");
            }
            Err(TimedOut) => {
                Telemetry::bump(&self.inner.telemetry.termination_timeout);
                tracing::warn!(snap_id, "cooperative terminate timed out");
            }
        }

        self.teardown_job(&job).await;

        let removed = {
            let mut tables = self.inner.tables();
            let current = tables
                .jobs
                .get(snap_id)
                .is_some_and(|entry| Arc::ptr_eq(entry, &job));
            if current {
                tables.jobs.remove(snap_id);
                tables.statuses.remove(snap_id);
            }
            current
        };
        if removed {
            self.publish_status(snap_id, None);
            tracing::info!(snap_id, "snap terminated");
        }
    }

    pub async fn terminate_all_snaps(&self) {
        let snap_ids: Vec<String> = self.inner.tables().jobs.keys().cloned().collect();
        let tasks = snap_ids.into_iter().map(|snap_id| {
            let service = self.clone();
            tokio::spawn(async move { service.terminate_snap(&snap_id).await })
        });
        for outcome in join_all(tasks).await {
            if let Err(err) = outcome {
                tracing::error!(error = %err, "terminate task failed");
            }
        }
    }

    pub fn status(&self, snap_id: &str) -> Option<SnapStatus> {
        self.inner.tables().statuses.get(snap_id).copied()
    }

    pub fn is_running(&self, snap_id: &str) -> bool {
        self.status(snap_id) == Some(SnapStatus::Running)
    }

    pub fn running_snaps(&self) -> Vec<String> {
        let mut snap_ids: Vec<String> = self.inner.tables().jobs.keys().cloned().collect();
        snap_ids.sort();
        snap_ids
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }

    pub fn telemetry_snapshot(&self) -> ExecutionTelemetrySnapshot {
        self.inner.telemetry.snapshot()
    }

    fn reserve(&self, snap_id: &str) -> Result<(), ExecutionError> {
        {
            let mut tables = self.inner.tables();
            if tables.jobs.contains_key(snap_id) || tables.statuses.contains_key(snap_id) {
                return Err(ExecutionError::AlreadyRunning {
                    snap_id: snap_id.to_string(),
                });
            }
            tables
                .statuses
                .insert(snap_id.to_string(), SnapStatus::Created);
        }
        self.publish_status(snap_id, Some(SnapStatus::Created));
        Ok(())
    }

    fn set_status(&self, snap_id: &str, status: SnapStatus) {
        let updated = match self.inner.tables().statuses.get_mut(snap_id) {
            Some(entry) => {
                *entry = status;
                true
            }
            None => false,
        };
        if updated {
            tracing::debug!(snap_id, status = status.as_tag(), "snap status changed");
            self.publish_status(snap_id, Some(status));
        }
    }

    fn forget(&self, snap_id: &str) {
        let removed = {
            let mut tables = self.inner.tables();
            let job = tables.jobs.remove(snap_id);
            let status = tables.statuses.remove(snap_id);
            job.is_some() || status.is_some()
        };
        if removed {
            self.publish_status(snap_id, None);
        }
    }

    fn publish_status(&self, snap_id: &str, status: Option<SnapStatus>) {
        self.inner.events.publish(ExecutionEvent::StatusChanged {
            snap_id: snap_id.to_string(),
            status,
        });
    }

    fn assemble_job(&self, snap_id: &str, spawned: SpawnedWorker<B::Worker>) -> Job<B::Worker> {
        let SpawnedWorker { worker, transport } = spawned;
        let mux = StreamMultiplexer::new(transport);
        let command = mux.create_channel(COMMAND_CHANNEL);
        let dispatcher =
            CommandDispatcher::spawn(snap_id, command, self.notification_handler(snap_id));
        Job {
            id: snap_id.to_string(),
            mux,
            dispatcher,
            worker,
        }
    }

    async fn ping(&self, job: &Job<B::Worker>) -> Result<(), ExecutionError> {
        Telemetry::bump(&self.inner.telemetry.ping);
        let outcome = with_timeout(
            job.dispatcher.request(CommandMethod::Ping.as_str(), None),
            self.inner.config.ping_timeout(),
        )
        .await;
        let snap_id = job.id.clone();
        match outcome {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(CommandError::Rpc(error))) => Err(ExecutionError::PingRejected { snap_id, error }),
            Ok(Err(CommandError::Closed)) => Err(ExecutionError::ChannelClosed {
                snap_id,
                phase: "ping",
            }),
            Err(TimedOut) => {
                tracing::warn!(snap_id = %snap_id, "worker did not answer ping");
                Err(ExecutionError::Unreachable { snap_id })
            }
        }
    }

    async fn abort_startup(&self, job: &Job<B::Worker>) {
        self.teardown_job(job).await;
        self.forget(&job.id);
    }

    async fn teardown_job(&self, job: &Job<B::Worker>) {
        job.dispatcher.close();
        job.mux.destroy();
        self.inner.backend.teardown(&job.id, Some(&job.worker)).await;
    }

    fn notification_handler(&self, snap_id: &str) -> NotificationHandler {
        let snap_id = snap_id.to_string();
        let events = self.inner.events.clone();
        let telemetry = Arc::clone(&self.inner.telemetry);
        Arc::new(move |notification: WorkerNotification| match notification {
            WorkerNotification::OutboundRequest { source } => {
                events.publish(ExecutionEvent::OutboundRequest {
                    snap_id: snap_id.clone(),
                    source,
                });
            }
            WorkerNotification::OutboundResponse { source } => {
                events.publish(ExecutionEvent::OutboundResponse {
                    snap_id: snap_id.clone(),
                    source,
                });
            }
            WorkerNotification::UnhandledError { error } => {
                Telemetry::bump(&telemetry.unhandled_error);
                tracing::error!(
                    snap_id = %snap_id,
                    code = error.code,
                    message = %error.message,
                    "unhandled snap error"
                );
                events.publish(ExecutionEvent::UnhandledError {
                    snap_id: snap_id.clone(),
                    error,
                });
            }
            WorkerNotification::Malformed { method, reason } => {
                Telemetry::bump(&telemetry.malformed_notification);
                tracing::error!(snap_id = %snap_id, method = %method, reason = %reason, "malformed worker notification");
            }
            WorkerNotification::Unknown { method } => {
                Telemetry::bump(&telemetry.unknown_notification);
                tracing::error!(snap_id = %snap_id, method = %method, "unknown worker notification");
            }
        })
    }
}

impl<B: ExecutionBackend> Inner<B> {
    fn tables(&self) -> MutexGuard<'_, Tables<B::Worker>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TaskBackend;
    use crate::command_protocol::{CommandFrame, JsonRpcResponse};
    use serde_json::json;

    async fn answer_everything_ok(_snap_id: String, mut stream: MessageStream) {
        while let Some(frame) = stream.recv().await {
            let Some(data) = frame.get("data").cloned() else {
                continue;
            };
            if let CommandFrame::Request { id, .. } = CommandFrame::classify(data) {
                let reply = JsonRpcResponse::success(id, json!(OK_RESULT)).into_value();
                if stream.send(json!({"name": COMMAND_CHANNEL, "data": reply})).is_err() {
                    break;
                }
            }
        }
    }

    fn fast_config() -> ExecutionServiceConfig {
        ExecutionServiceConfig {
            init_timeout_ms: 500,
            ping_timeout_ms: 200,
            termination_timeout_ms: 100,
            use_ping: true,
        }
    }

    #[tokio::test]
    async fn status_walks_the_lifecycle_and_clears_on_terminate() {
        let service = ExecutionService::new(TaskBackend::new(answer_everything_ok), fast_config());
        let mut events = service.subscribe();

        let result = service
            .execute_snap(SnapExecutionData::new("npm:a", "code", Vec::new()))
            .await
            .expect("execute snap");
        assert_eq!(result, json!("OK"));
        assert!(service.is_running("npm:a"));
        assert_eq!(service.running_snaps(), vec!["npm:a".to_string()]);

        service.terminate_snap("npm:a").await;
        assert_eq!(service.status("npm:a"), None);
        assert!(service.running_snaps().is_empty());

        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ExecutionEvent::StatusChanged { status, .. } = event {
                statuses.push(status);
            }
        }
        assert_eq!(
            statuses,
            vec![
                Some(SnapStatus::Created),
                Some(SnapStatus::Initializing),
                Some(SnapStatus::Initialized),
                Some(SnapStatus::Executing),
                Some(SnapStatus::Running),
                None,
            ]
        );
    }

    #[tokio::test]
    async fn telemetry_counts_handshake_steps() {
        let service = ExecutionService::new(TaskBackend::new(answer_everything_ok), fast_config());
        service
            .execute_snap(SnapExecutionData::new("npm:a", "code", Vec::new()))
            .await
            .expect("execute snap");
        service
            .handle_rpc_request(
                "npm:a",
                SnapRpcRequest {
                    origin: "x".to_string(),
                    handler: "onRpcRequest".to_string(),
                    request: json!({"method": "ping"}),
                },
            )
            .await
            .expect("rpc");

        let telemetry = service.telemetry_snapshot();
        assert_eq!(telemetry.spawn_count, 1);
        assert_eq!(telemetry.ping_count, 1);
        assert_eq!(telemetry.execute_count, 1);
        assert_eq!(telemetry.rpc_request_count, 1);
        assert_eq!(telemetry.init_timeout_count, 0);
    }

    #[tokio::test]
    async fn ping_can_be_skipped() {
        let config = ExecutionServiceConfig {
            use_ping: false,
            ..fast_config()
        };
        let service = ExecutionService::new(TaskBackend::new(answer_everything_ok), config);
        service
            .execute_snap(SnapExecutionData::new("npm:a", "code", Vec::new()))
            .await
            .expect("execute snap");
        assert_eq!(service.telemetry_snapshot().ping_count, 0);
    }

    #[tokio::test]
    async fn provider_setup_receives_data_channel() {
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let setup: ProviderSetup = Arc::new(move |snap_id: &str, _channel: MessageStream| {
            let _ = seen_tx.send(snap_id.to_string());
        });
        let service = ExecutionService::with_provider_setup(
            TaskBackend::new(answer_everything_ok),
            fast_config(),
            setup,
        );
        service
            .execute_snap(SnapExecutionData::new("npm:a", "code", Vec::new()))
            .await
            .expect("execute snap");
        assert_eq!(seen_rx.recv().await, Some("npm:a".to_string()));
    }
}
