use crate::command_protocol::{JsonRpcNotification, TERMINATE_JOB_METHOD};
use crate::job_router::{JobEnvelope, JobRouter, RouterHandle, SharedTransport};
use crate::stream_mux::COMMAND_CHANNEL;
use crate::transport::{MessageStream, StdioTransport, StreamError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

pub const WORKER_BIN_ENV: &str = "SNAPVISOR_WORKER_BIN";
pub const SNAP_ID_ENV: &str = "SNAPVISOR_SNAP_ID";

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("spawn worker failed: {0}")]
    Spawn(String),
    #[error("worker transport unavailable: {0}")]
    Transport(#[from] StreamError),
    #[error("backend is closed")]
    Closed,
}

/// Set by a backend once the worker environment exists, before it is ready.
#[derive(Clone, Debug, Default)]
pub struct StartupProgress {
    started: Arc<AtomicBool>,
}

impl StartupProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

pub struct SpawnedWorker<W> {
    pub worker: W,
    pub transport: MessageStream,
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync + 'static {
    type Worker: Send + Sync + 'static;

    async fn spawn(
        &self,
        snap_id: &str,
        progress: &StartupProgress,
    ) -> Result<SpawnedWorker<Self::Worker>, BackendError>;

    /// Forced teardown. `worker` is `None` when startup never produced a
    /// handle. Must tolerate workers that are already gone.
    async fn teardown(&self, snap_id: &str, worker: Option<&Self::Worker>);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessBackendConfig {
    pub command: String,
    pub args: Vec<String>,
    pub extra_env: HashMap<String, String>,
    pub inherit_stderr: bool,
}

impl Default for ProcessBackendConfig {
    fn default() -> Self {
        #[cfg(target_os = "windows")]
        let worker_binary = "snapvisor-worker.exe";
        #[cfg(not(target_os = "windows"))]
        let worker_binary = "snapvisor-worker";

        let worker_path = std::env::var(WORKER_BIN_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| worker_binary.to_string());

        Self {
            command: worker_path,
            args: Vec::new(),
            extra_env: HashMap::new(),
            inherit_stderr: true,
        }
    }
}

impl ProcessBackendConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ..Self::default()
        }
    }
}

pub struct ProcessWorker {
    pid: Option<u32>,
    child: tokio::sync::Mutex<Child>,
    io: StdioTransport,
}

impl ProcessWorker {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

pub struct ProcessBackend {
    config: ProcessBackendConfig,
}

impl ProcessBackend {
    pub fn new(config: ProcessBackendConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessBackendConfig {
        &self.config
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    type Worker = ProcessWorker;

    async fn spawn(
        &self,
        snap_id: &str,
        progress: &StartupProgress,
    ) -> Result<SpawnedWorker<ProcessWorker>, BackendError> {
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .env(SNAP_ID_ENV, snap_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if self.config.inherit_stderr {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        for (key, value) in &self.config.extra_env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|err| BackendError::Spawn(format!("{}: {err}", self.config.command)))?;
        progress.mark_started();

        let pid = child.id();
        let (io, transport) = match StdioTransport::attach(&mut child) {
            Ok(attached) => attached,
            Err(err) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(err.into());
            }
        };
        tracing::info!(snap_id, pid, "worker process started");

        Ok(SpawnedWorker {
            worker: ProcessWorker {
                pid,
                child: tokio::sync::Mutex::new(child),
                io,
            },
            transport,
        })
    }

    async fn teardown(&self, snap_id: &str, worker: Option<&ProcessWorker>) {
        let Some(worker) = worker else {
            return;
        };
        worker.io.close();

        let mut child = worker.child.lock().await;
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(snap_id, %status, "worker process already exited");
                return;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(snap_id, error = %err, "poll worker process failed");
            }
        }
        if let Err(err) = child.start_kill() {
            tracing::debug!(snap_id, error = %err, "kill worker process failed");
        }
        match child.wait().await {
            Ok(status) => tracing::debug!(snap_id, %status, "worker process reaped"),
            Err(err) => tracing::warn!(snap_id, error = %err, "reap worker process failed"),
        }
    }
}

pub struct ProxyWorker {
    router: RouterHandle,
    terminate_sent: AtomicBool,
}

impl ProxyWorker {
    pub fn job_id(&self) -> &str {
        self.router.job_id()
    }
}

pub struct ProxyBackend {
    shared: SharedTransport,
}

impl ProxyBackend {
    pub fn new(shared: SharedTransport) -> Self {
        Self { shared }
    }

    pub fn shared(&self) -> &SharedTransport {
        &self.shared
    }
}

#[async_trait]
impl ExecutionBackend for ProxyBackend {
    type Worker = ProxyWorker;

    async fn spawn(
        &self,
        snap_id: &str,
        progress: &StartupProgress,
    ) -> Result<SpawnedWorker<ProxyWorker>, BackendError> {
        if self.shared.is_closed() {
            return Err(BackendError::Closed);
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let (router, transport) =
            JobRouter::attach(&self.shared, job_id.clone(), Some(json!({ "snapId": snap_id })));
        progress.mark_started();
        tracing::debug!(snap_id, job_id = %job_id, "attached job to shared transport");

        Ok(SpawnedWorker {
            worker: ProxyWorker {
                router,
                terminate_sent: AtomicBool::new(false),
            },
            transport,
        })
    }

    async fn teardown(&self, snap_id: &str, worker: Option<&ProxyWorker>) {
        let Some(worker) = worker else {
            return;
        };
        if !worker.terminate_sent.swap(true, Ordering::SeqCst) {
            let notification = JsonRpcNotification::new(
                TERMINATE_JOB_METHOD,
                Some(json!({ "jobId": worker.job_id() })),
            );
            let envelope = JobEnvelope {
                job_id: worker.job_id().to_string(),
                data: json!({ "name": COMMAND_CHANNEL, "data": notification.into_value() }),
                extra: Some(json!({ "snapId": snap_id })),
            };
            if self.shared.sink().send(envelope.into_value()).is_err() {
                tracing::debug!(snap_id, job_id = worker.job_id(), "shared transport gone before terminateJob");
            }
        }
        worker.router.close();
    }
}

pub struct TaskBackend<F> {
    run: F,
    startup_delay: Duration,
}

impl<F, Fut> TaskBackend<F>
where
    F: Fn(String, MessageStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(run: F) -> Self {
        Self {
            run,
            startup_delay: Duration::ZERO,
        }
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }
}

pub struct TaskWorker {
    task: JoinHandle<()>,
}

impl TaskWorker {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[async_trait]
impl<F, Fut> ExecutionBackend for TaskBackend<F>
where
    F: Fn(String, MessageStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    type Worker = TaskWorker;

    async fn spawn(
        &self,
        snap_id: &str,
        progress: &StartupProgress,
    ) -> Result<SpawnedWorker<TaskWorker>, BackendError> {
        if !self.startup_delay.is_zero() {
            tokio::time::sleep(self.startup_delay).await;
        }
        progress.mark_started();

        let (host, worker) = MessageStream::pair();
        let task = tokio::spawn((self.run)(snap_id.to_string(), worker));
        Ok(SpawnedWorker {
            worker: TaskWorker { task },
            transport: host,
        })
    }

    async fn teardown(&self, _snap_id: &str, worker: Option<&TaskWorker>) {
        if let Some(worker) = worker {
            worker.task.abort();
        }
    }
}

pub fn terminate_job_target(frame: &Value) -> Option<&str> {
    let data = frame.get("data")?;
    if data.get("name").and_then(Value::as_str) != Some(COMMAND_CHANNEL) {
        return None;
    }
    let command = data.get("data")?;
    if command.get("method").and_then(Value::as_str) != Some(TERMINATE_JOB_METHOD) {
        return None;
    }
    frame.get("jobId").and_then(Value::as_str)
}
