use thiserror::Error;

/// Central error type for the stem-worker crate.
///
/// The `Display` output of each job-level variant is exactly what ends up in
/// the `error` field of a job response.
#[derive(Debug, Error)]
pub enum WorkerError {
    // Job-level failures, reported to the caller
    #[error("{0}")]
    Validation(String),

    #[error("Failed to download audio: {0}")]
    Fetch(String),

    #[error("{0}")]
    Separation(String),

    #[error("Demucs processing timed out (>{} minutes)", .0.as_secs() / 60)]
    SeparationTimeout(std::time::Duration),

    #[error("Out of memory during separation: {0}")]
    ResourceExhausted(String),

    #[error("Failed to upload {key}: {reason}")]
    Publish { key: String, reason: String },

    #[error("Missing storage credentials: {0}")]
    MissingCredentials(String),

    // Startup and plumbing
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Checksum mismatch for {path}")]
    Checksum { path: String },

    #[error("Cache dir not available")]
    CacheDirUnavailable,

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Scratch space unavailable: {0}")]
    Scratch(std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        WorkerError::Validation(msg.into())
    }

    pub fn separation(msg: impl Into<String>) -> Self {
        WorkerError::Separation(msg.into())
    }

    pub fn publish(key: impl Into<String>, reason: impl ToString) -> Self {
        WorkerError::Publish {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// True for failures that were detected before any side effect.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            WorkerError::Validation(_) | WorkerError::MissingCredentials(_)
        )
    }
}

// --- From conversions for common errors ---
impl From<serde_json::Error> for WorkerError {
    fn from(e: serde_json::Error) -> Self {
        WorkerError::Validation(format!("invalid job payload: {e}"))
    }
}

impl From<reqwest::Error> for WorkerError {
    fn from(e: reqwest::Error) -> Self {
        WorkerError::Fetch(e.to_string())
    }
}

impl From<hound::Error> for WorkerError {
    fn from(e: hound::Error) -> Self {
        WorkerError::Audio(e.to_string())
    }
}

impl From<symphonia::core::errors::Error> for WorkerError {
    fn from(e: symphonia::core::errors::Error) -> Self {
        WorkerError::Audio(e.to_string())
    }
}

impl From<hex::FromHexError> for WorkerError {
    fn from(e: hex::FromHexError) -> Self {
        WorkerError::Model(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
