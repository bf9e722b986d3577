use crate::backend::BackendError;
use crate::command_protocol::JsonRpcError;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("snap {snap_id} is already running")]
    AlreadyRunning { snap_id: String },
    #[error("snap {snap_id} is not currently running")]
    NotRunning { snap_id: String },
    #[error("snap {snap_id} failed to initialize: worker never started")]
    NeverStarted { snap_id: String },
    #[error("snap {snap_id} failed to initialize: worker started but never became ready")]
    NeverReady { snap_id: String },
    #[error("snap {snap_id} failed to spawn: {source}")]
    Spawn {
        snap_id: String,
        #[source]
        source: BackendError,
    },
    #[error("snap {snap_id} worker is unreachable")]
    Unreachable { snap_id: String },
    #[error("snap {snap_id} worker rejected ping: {error}")]
    PingRejected { snap_id: String, error: JsonRpcError },
    #[error("snap {snap_id} timed out while executing")]
    ExecutionTimeout { snap_id: String },
    #[error("snap {snap_id} failed to execute: {error}")]
    ExecutionFailed { snap_id: String, error: JsonRpcError },
    #[error("snap {snap_id} rpc failed: {error}")]
    Rpc { snap_id: String, error: JsonRpcError },
    #[error("snap {snap_id} command channel closed during {phase}")]
    ChannelClosed { snap_id: String, phase: &'static str },
}

impl ExecutionError {
    pub const fn as_tag(&self) -> &'static str {
        match self {
            Self::AlreadyRunning { .. } => "already_running",
            Self::NotRunning { .. } => "not_running",
            Self::NeverStarted { .. } => "init_never_started",
            Self::NeverReady { .. } => "init_never_ready",
            Self::Spawn { .. } => "spawn_failed",
            Self::Unreachable { .. } => "unreachable",
            Self::PingRejected { .. } => "ping_rejected",
            Self::ExecutionTimeout { .. } => "execution_timeout",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::Rpc { .. } => "rpc_error",
            Self::ChannelClosed { .. } => "channel_closed",
        }
    }

    pub fn snap_id(&self) -> &str {
        match self {
            Self::AlreadyRunning { snap_id }
            | Self::NotRunning { snap_id }
            | Self::NeverStarted { snap_id }
            | Self::NeverReady { snap_id }
            | Self::Spawn { snap_id, .. }
            | Self::Unreachable { snap_id }
            | Self::PingRejected { snap_id, .. }
            | Self::ExecutionTimeout { snap_id }
            | Self::ExecutionFailed { snap_id, .. }
            | Self::Rpc { snap_id, .. }
            | Self::ChannelClosed { snap_id, .. } => snap_id,
        }
    }

    pub fn rpc_error(&self) -> Option<&JsonRpcError> {
        match self {
            Self::PingRejected { error, .. }
            | Self::ExecutionFailed { error, .. }
            | Self::Rpc { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn is_init_timeout(&self) -> bool {
        matches!(self, Self::NeverStarted { .. } | Self::NeverReady { .. })
    }
}
