use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::job::JobStatus;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Resource not found: {0}")]
    ResourceNotFound(Uuid),

    #[error("Job {id} is {status}, expected {expected}")]
    InvalidJobState {
        id: Uuid,
        status: JobStatus,
        expected: &'static str,
    },

    #[error("Resource {id} is {status}, expected {expected}")]
    InvalidResourceState {
        id: Uuid,
        status: String,
        expected: &'static str,
    },

    #[error("Queue is {0}, operation not allowed")]
    InvalidQueueState(String),

    #[error("Reorder list does not match the queue: {0}")]
    ReorderMismatch(String),

    #[error("Job {0} is already queued")]
    DuplicateJob(Uuid),

    #[error("A resource named {0} already exists")]
    DuplicateResource(String),

    #[error("Resource manager already registered: {0}")]
    DuplicateManager(String),

    #[error("Resource manager not found: {0}")]
    ManagerNotFound(String),

    #[error("Tool {0} is not offered by the assigned resource")]
    ToolMismatch(Uuid),

    #[error("gRPC error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Resource {0} has no live connection")]
    Disconnected(Uuid),

    #[error("Ping check failed for resource {0}")]
    PingMismatch(Uuid),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Job store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] crate::tls::TlsError),
}

impl QueueError {
    /// Errors raised by local checks before any state was touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            QueueError::JobNotFound(_)
                | QueueError::ResourceNotFound(_)
                | QueueError::InvalidJobState { .. }
                | QueueError::InvalidResourceState { .. }
                | QueueError::InvalidQueueState(_)
                | QueueError::ReorderMismatch(_)
                | QueueError::DuplicateJob(_)
                | QueueError::DuplicateResource(_)
                | QueueError::DuplicateManager(_)
                | QueueError::ManagerNotFound(_)
                | QueueError::ToolMismatch(_)
        )
    }
}

/// A per-job failure collected by a bulk operation.
#[derive(Debug)]
pub struct JobError {
    pub job_id: Uuid,
    pub error: QueueError,
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job {}: {}", self.job_id, self.error)
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
