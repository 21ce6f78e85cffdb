use thiserror::Error;

#[derive(Error, Debug)]
pub enum PyplnError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Manager replied with error: {0}")]
    Manager(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Process supervision failed: {0}")]
    Supervision(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PyplnError>;
