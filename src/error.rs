use thiserror::Error;

/// Main error type for the service map crate
#[derive(Error, Debug)]
pub enum ServicemapError {
    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Search backend request failed (network, HTTP status, unknown data source)
    #[error("Search gateway error: {0}")]
    Gateway(String),

    /// Response did not have the expected aggregation shape
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid input (bad date math, bad interval, unknown mode)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Chat upstream failure, carrying the status code to surface
    #[error("Chat upstream error ({status}): {message}")]
    Chat { status: u16, message: String },

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ServicemapError {
    /// HTTP status to report to clients for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServicemapError::Chat { status, .. } => *status,
            ServicemapError::InvalidInput(_) => 400,
            _ => 500,
        }
    }
}

/// Convenient Result type using ServicemapError
pub type Result<T> = std::result::Result<T, ServicemapError>;
