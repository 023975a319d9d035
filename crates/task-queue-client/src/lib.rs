mod async_client;
mod dispatcher;
mod envelope;
mod transport;

pub use async_client::TaskQueueAsyncClient;
pub use dispatcher::{DispatchedTask, Dispatcher, ORCHESTRATION_TASK_TYPE};
pub use envelope::TaskEnvelope;
pub use transport::{DispatchTransport, EmbeddedTransport, RemoteTransport};

use task_queue_core::TaskError;
use task_queue_persistence::PersistenceError;
use task_queue_protocol::{ProtocolError, RpcStatus, StatusCode};
use thiserror::Error;

/// Failures surfaced to callers, identical for remote and embedded dispatch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout")]
    Timeout,

    #[error("Server error: {0}")]
    Server(String),
}

impl From<TaskError> for ClientError {
    fn from(err: TaskError) -> Self {
        let message = err.to_string();
        match err {
            TaskError::NotFound(_) => ClientError::NotFound(message),
            TaskError::InvalidArgument(_) => ClientError::InvalidArgument(message),
            TaskError::InvalidState { .. } => ClientError::InvalidState(message),
            TaskError::Unavailable(_) => ClientError::Unavailable(message),
            TaskError::Corrupted(_) => ClientError::Server(message),
        }
    }
}

impl From<PersistenceError> for ClientError {
    fn from(err: PersistenceError) -> Self {
        ClientError::from(TaskError::from(err))
    }
}

impl From<RpcStatus> for ClientError {
    fn from(status: RpcStatus) -> Self {
        match status.code {
            StatusCode::NotFound => ClientError::NotFound(status.message),
            StatusCode::InvalidArgument => ClientError::InvalidArgument(status.message),
            StatusCode::FailedPrecondition => ClientError::InvalidState(status.message),
            StatusCode::Unavailable => ClientError::Unavailable(status.message),
            StatusCode::Internal | StatusCode::Unimplemented => ClientError::Server(status.message),
        }
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::IoError(e) => ClientError::Connection(e.to_string()),
            other => ClientError::Protocol(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
