use crate::command_protocol::JsonRpcError;
use crate::stream_mux::{ChannelObserver, JSON_RPC_CHANNEL};
use serde_json::Value;
use tokio::sync::broadcast;

const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SnapStatus {
    Created,
    Initializing,
    Initialized,
    Executing,
    Running,
}

impl SnapStatus {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::Executing => "executing",
            Self::Running => "running",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionEvent {
    /// `None` means the snap is no longer tracked.
    StatusChanged {
        snap_id: String,
        status: Option<SnapStatus>,
    },
    OutboundRequest {
        snap_id: String,
        source: Option<String>,
    },
    OutboundResponse {
        snap_id: String,
        source: Option<String>,
    },
    UnhandledError {
        snap_id: String,
        error: JsonRpcError,
    },
}

impl ExecutionEvent {
    pub fn snap_id(&self) -> &str {
        match self {
            Self::StatusChanged { snap_id, .. }
            | Self::OutboundRequest { snap_id, .. }
            | Self::OutboundResponse { snap_id, .. }
            | Self::UnhandledError { snap_id, .. } => snap_id,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: ExecutionEvent) {
        // Nobody listening is not an error.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }
}

pub struct ActivityObserver {
    snap_id: String,
    events: EventBus,
}

impl ActivityObserver {
    pub fn new(snap_id: impl Into<String>, events: EventBus) -> Self {
        Self {
            snap_id: snap_id.into(),
            events,
        }
    }
}

impl ChannelObserver for ActivityObserver {
    fn on_inbound(&self, frame: &Value) {
        if frame.get("method").is_some() && frame.get("id").is_some_and(|id| !id.is_null()) {
            self.events.publish(ExecutionEvent::OutboundRequest {
                snap_id: self.snap_id.clone(),
                source: Some(JSON_RPC_CHANNEL.to_string()),
            });
        }
    }

    fn on_outbound(&self, frame: &Value) {
        let is_response = frame.get("method").is_none()
            && (frame.get("result").is_some() || frame.get("error").is_some());
        if is_response {
            self.events.publish(ExecutionEvent::OutboundResponse {
                snap_id: self.snap_id.clone(),
                source: Some(JSON_RPC_CHANNEL.to_string()),
            });
        }
    }
}
