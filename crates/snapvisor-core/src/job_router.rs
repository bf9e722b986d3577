use crate::transport::{message_channel, MessageSink, MessageStream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const FAN_OUT_CAPACITY: usize = 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub job_id: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl JobEnvelope {
    pub fn into_value(self) -> Value {
        let mut envelope = json!({ "jobId": self.job_id, "data": self.data });
        if let Some(extra) = self.extra {
            envelope["extra"] = extra;
        }
        envelope
    }
}

type FanOut = Arc<Mutex<Option<broadcast::Sender<Value>>>>;

#[derive(Clone)]
pub struct SharedTransport {
    sink: MessageSink,
    fan_out: FanOut,
    reader: Arc<JoinHandle<()>>,
}

impl SharedTransport {
    pub fn new(transport: MessageStream) -> Self {
        let (sink, source) = transport.split();
        let (tx, _) = broadcast::channel(FAN_OUT_CAPACITY);
        let fan_out: FanOut = Arc::new(Mutex::new(Some(tx)));
        let reader = tokio::spawn(fan_out_inbound(source, Arc::clone(&fan_out)));
        Self {
            sink,
            fan_out,
            reader: Arc::new(reader),
        }
    }

    pub fn sink(&self) -> MessageSink {
        self.sink.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        let fan_out = self.fan_out.lock().unwrap_or_else(PoisonError::into_inner);
        match fan_out.as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.fan_out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn close(&self) {
        self.reader.abort();
        self.fan_out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

async fn fan_out_inbound(mut source: mpsc::UnboundedReceiver<Value>, fan_out: FanOut) {
    while let Some(frame) = source.recv().await {
        let tx = fan_out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(tx) = tx else {
            break;
        };
        // No receivers means no job is attached right now.
        let _ = tx.send(frame);
    }
    fan_out
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    tracing::debug!("shared transport ended");
}

pub struct RouterHandle {
    job_id: String,
    closed: AtomicBool,
    filter: JoinHandle<()>,
    pump: JoinHandle<()>,
}

impl RouterHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn close(&self) -> bool {
        let was_open = !self.closed.swap(true, Ordering::SeqCst);
        self.filter.abort();
        self.pump.abort();
        was_open
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        self.filter.abort();
        self.pump.abort();
    }
}

pub struct JobRouter;

impl JobRouter {
    pub fn attach(
        shared: &SharedTransport,
        job_id: impl Into<String>,
        extra: Option<Value>,
    ) -> (RouterHandle, MessageStream) {
        let job_id = job_id.into();
        let (inbound, job_source) = message_channel();
        let (job_sink, outbound) = message_channel();

        let filter = tokio::spawn(filter_inbound(
            job_id.clone(),
            shared.subscribe(),
            inbound,
        ));
        let pump = tokio::spawn(wrap_outbound(job_id.clone(), extra, outbound, shared.sink()));

        (
            RouterHandle {
                job_id,
                closed: AtomicBool::new(false),
                filter,
                pump,
            },
            MessageStream::from_parts(job_sink, job_source),
        )
    }
}

async fn filter_inbound(
    job_id: String,
    mut frames: broadcast::Receiver<Value>,
    inbound: MessageSink,
) {
    loop {
        let frame = match frames.recv().await {
            Ok(frame) => frame,
            // Frames were lost; end the job stream so pending requests fail.
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(job_id = %job_id, skipped, "job router lagged; closing job stream");
                break;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if frame.get("jobId").and_then(Value::as_str) != Some(job_id.as_str()) {
            continue;
        }
        let data = match frame {
            Value::Object(mut envelope) => envelope.remove("data").unwrap_or(Value::Null),
            _ => continue,
        };
        if inbound.send(data).is_err() {
            break;
        }
    }
}

async fn wrap_outbound(
    job_id: String,
    extra: Option<Value>,
    mut outbound: mpsc::UnboundedReceiver<Value>,
    transport: MessageSink,
) {
    while let Some(data) = outbound.recv().await {
        let envelope = JobEnvelope {
            job_id: job_id.clone(),
            data,
            extra: extra.clone(),
        };
        if transport.send(envelope.into_value()).is_err() {
            tracing::debug!(job_id = %job_id, "shared transport closed; dropping outbound frame");
            break;
        }
    }
}
