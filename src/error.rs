use thiserror::Error;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("grid worker not found: {0}")]
    GridWorkerNotFound(String),

    #[error("tasks can no longer be added to grid job {0}")]
    GridJobClosed(String),

    #[error("credentials error: {0}")]
    Credentials(String),

    #[error("deployment error: {0}")]
    Deployment(String),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GridError>;
