pub mod backend;
pub mod command_protocol;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod execution_service;
pub mod job_router;
pub mod stream_mux;
pub mod timeout;
pub mod transport;

pub use backend::{
    ExecutionBackend, ProcessBackend, ProcessBackendConfig, ProxyBackend, StartupProgress,
    TaskBackend,
};
pub use config::ExecutionServiceConfig;
pub use error::ExecutionError;
pub use events::{ExecutionEvent, SnapStatus};
pub use execution_service::{ExecutionService, SnapExecutionData, SnapRpcRequest};
pub use transport::MessageStream;
