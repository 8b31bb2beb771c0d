use thiserror::Error;

pub type Result<T> = std::result::Result<T, TapeVaultError>;

#[derive(Error, Debug)]
pub enum TapeVaultError {
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Device timeout: {0}")]
    DeviceTimeout(String),

    #[error("Media error on tape {tape}: {detail}")]
    MediaError { tape: String, detail: String },

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Catalog corruption: {0}")]
    CatalogCorruption(String),

    #[error("Consistency conflict: {0}")]
    ConsistencyConflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("State conflict on {path}: expected {expected}, found {actual}")]
    StateConflict {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for TapeVaultError {
    fn from(err: serde_json::Error) -> Self {
        TapeVaultError::Json(err.to_string())
    }
}

impl TapeVaultError {
    /// Transient errors are retried by the drive scheduler before being
    /// escalated to `DeviceUnavailable`.
    pub fn is_transient(&self) -> bool {
        matches!(self, TapeVaultError::DeviceTimeout(_))
    }
}
