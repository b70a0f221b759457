use thiserror::Error;

/// Coarse classification of a [`BuilderError`], used in logs, metrics and
/// when deciding whether a failure happened before any resource was acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Storage,
    Build,
    Timeout,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::Storage => write!(f, "storage"),
            ErrorKind::Build => write!(f, "build"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

#[derive(Error, Debug)]
pub enum BuilderError {
    // Configuration errors
    #[error("invalid configuration for '{field}': {reason}")]
    Configuration { field: String, reason: String },

    #[error("invalid build parameters: {0}")]
    InvalidParameters(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    // Storage errors
    #[error("unsupported repository type: {repository_type}")]
    UnsupportedRepositoryType { repository_type: String },

    #[error("object not found: {path}")]
    NotFound { path: String },

    #[error("storage error: {0}")]
    Storage(#[from] object_store::Error),

    #[error("storage path error: {0}")]
    StoragePath(#[from] object_store::path::Error),

    #[error("error downloading blob {path}: {reason}")]
    BlobRead { path: String, reason: String },

    #[error("error uploading blob {path}: {reason}")]
    BlobWrite { path: String, reason: String },

    // Dataset errors
    #[error("vectors dataset error: {0}")]
    Dataset(String),

    // Index engine errors
    #[error("failed to build GPU index: {0}")]
    Build(String),

    #[error("failed to convert GPU index to CPU index: {0}")]
    Conversion(String),

    #[error("failed to persist CPU index: {0}")]
    Persist(String),

    #[error("native handle error: {0}")]
    Ownership(String),

    // Deadlines
    #[error("timed out: {0}")]
    Timeout(String),

    // Serialization errors
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bincode serialization error: {0}")]
    Bincode(String),

    // IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // Job-status client errors
    #[error("job status request failed: {0}")]
    JobStatus(String),

    // Internal
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<Box<bincode::ErrorKind>> for BuilderError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        BuilderError::Bincode(e.to_string())
    }
}

impl From<reqwest::Error> for BuilderError {
    fn from(e: reqwest::Error) -> Self {
        BuilderError::JobStatus(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BuilderError>;

impl BuilderError {
    /// Shorthand for a configuration error naming the offending field.
    pub fn config_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        BuilderError::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BuilderError::Configuration { .. }
            | BuilderError::InvalidParameters(_)
            | BuilderError::Config(_)
            | BuilderError::Toml(_) => ErrorKind::Configuration,

            BuilderError::UnsupportedRepositoryType { .. }
            | BuilderError::NotFound { .. }
            | BuilderError::Storage(_)
            | BuilderError::StoragePath(_)
            | BuilderError::BlobRead { .. }
            | BuilderError::BlobWrite { .. }
            | BuilderError::Dataset(_) => ErrorKind::Storage,

            BuilderError::Build(_)
            | BuilderError::Conversion(_)
            | BuilderError::Persist(_)
            | BuilderError::Ownership(_) => ErrorKind::Build,

            BuilderError::Timeout(_) => ErrorKind::Timeout,

            _ => ErrorKind::Internal,
        }
    }
}
