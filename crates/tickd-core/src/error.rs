use thiserror::Error;

#[derive(Debug, Error)]
pub enum TickdError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An id that cannot be used as a single path component.
    #[error("Invalid path component: {0:?}")]
    InvalidPathComponent(String),
}

impl TickdError {
    /// Short error code string for callers that surface errors to clients.
    pub fn code(&self) -> &'static str {
        match self {
            TickdError::Config(_) => "config_error",
            TickdError::Serialization(_) => "serialization_error",
            TickdError::Io(_) => "io_error",
            TickdError::InvalidPathComponent(_) => "invalid_path_component",
        }
    }
}

pub type Result<T> = std::result::Result<T, TickdError>;
