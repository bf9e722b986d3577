use crate::command_protocol::{
    request_id_key, CommandFrame, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    WorkerNotification,
};
use crate::transport::{MessageSink, MessageStream};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("worker returned error {0}")]
    Rpc(JsonRpcError),
    #[error("command channel closed")]
    Closed,
}

pub type NotificationHandler = Arc<dyn Fn(WorkerNotification) + Send + Sync>;

type PendingMap = HashMap<String, oneshot::Sender<Result<Value, JsonRpcError>>>;

#[derive(Default)]
struct DispatcherState {
    pending: Mutex<PendingMap>,
    closed: AtomicBool,
}

impl DispatcherState {
    fn pending(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shut(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let drained = std::mem::take(&mut *self.pending());
        // Dropping the senders wakes each waiter with `Closed`.
        drained.len()
    }
}

pub struct CommandDispatcher {
    snap_id: String,
    sink: MessageSink,
    state: Arc<DispatcherState>,
    next_seq: AtomicU64,
    reader: JoinHandle<()>,
}

impl CommandDispatcher {
    pub fn spawn(
        snap_id: impl Into<String>,
        channel: MessageStream,
        on_notification: NotificationHandler,
    ) -> Self {
        let snap_id = snap_id.into();
        let (sink, source) = channel.split();
        let state = Arc::new(DispatcherState::default());
        let reader = tokio::spawn(read_loop(
            snap_id.clone(),
            source,
            sink.clone(),
            Arc::clone(&state),
            on_notification,
        ));
        Self {
            snap_id,
            sink,
            state,
            next_seq: AtomicU64::new(1),
            reader,
        }
    }

    pub fn snap_id(&self) -> &str {
        &self.snap_id
    }

    /// Sends `method` and waits for the correlated response.
    ///
    /// Dropping the returned future forgets the request, so a response that
    /// arrives afterwards is ignored.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, CommandError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(CommandError::Closed);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let id = format!("{method}:{}:{seq}", self.snap_id);
        let (tx, rx) = oneshot::channel();
        self.state.pending().insert(id.clone(), tx);
        let _guard = PendingGuard {
            state: &self.state,
            id: id.clone(),
        };
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(CommandError::Closed);
        }

        let frame = JsonRpcRequest::new(id, method, params).into_value();
        if self.sink.send(frame).is_err() {
            return Err(CommandError::Closed);
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(CommandError::Rpc(error)),
            Err(_) => Err(CommandError::Closed),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state.pending().len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.reader.abort();
        let failed = self.state.shut();
        if failed > 0 {
            tracing::debug!(snap_id = %self.snap_id, failed, "dispatcher closed with pending requests");
        }
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

struct PendingGuard<'a> {
    state: &'a DispatcherState,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.state.pending().remove(&self.id);
    }
}

async fn read_loop(
    snap_id: String,
    mut source: mpsc::UnboundedReceiver<Value>,
    sink: MessageSink,
    state: Arc<DispatcherState>,
    on_notification: NotificationHandler,
) {
    while let Some(frame) = source.recv().await {
        match CommandFrame::classify(frame) {
            CommandFrame::Response { id, outcome } => {
                let key = request_id_key(&id);
                let waiter = state.pending().remove(&key);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(outcome);
                    }
                    None => {
                        tracing::debug!(snap_id = %snap_id, id = %key, "ignoring response for unknown request");
                    }
                }
            }
            CommandFrame::Notification { method, params } => {
                on_notification(WorkerNotification::from_parts(&method, params));
            }
            CommandFrame::Request { id, method, .. } => {
                tracing::warn!(snap_id = %snap_id, method = %method, "worker sent an unsupported request");
                let reply =
                    JsonRpcResponse::failure(id, JsonRpcError::method_not_found(&method)).into_value();
                if sink.send(reply).is_err() {
                    break;
                }
            }
            CommandFrame::Invalid { reason } => {
                tracing::warn!(snap_id = %snap_id, reason = %reason, "dropping invalid command frame");
            }
        }
    }

    let failed = state.shut();
    tracing::debug!(snap_id = %snap_id, failed, "command channel ended");
}
