use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Dump tool not found in PATH (tried: {0})")]
    DumpToolNotFound(String),

    #[error("Failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} failed ({status}){}", excerpt_suffix(.excerpt))]
    DumpFailed {
        tool: String,
        status: String,
        excerpt: String,
    },

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Retry gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: usize, last: Box<BackupError> },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

fn excerpt_suffix(excerpt: &str) -> String {
    if excerpt.is_empty() {
        String::new()
    } else {
        format!(" (stderr: {})", excerpt)
    }
}

impl BackupError {
    /// True for cancellation, including cancellation wrapped by the retry loop.
    pub fn is_cancelled(&self) -> bool {
        match self {
            BackupError::Cancelled(_) => true,
            BackupError::RetryExhausted { last, .. } => last.is_cancelled(),
            _ => false,
        }
    }
}

/// Walks an anyhow chain looking for a cancelled `BackupError`.
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<BackupError>())
        .any(BackupError::is_cancelled)
}

pub type Result<T> = std::result::Result<T, BackupError>;
