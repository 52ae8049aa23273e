//! Error types for bgdl core

use thiserror::Error;

/// Errors that can occur in bgdl core
#[derive(Debug, Error)]
pub enum BgdlError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Property list error: {0}")]
    Plist(#[from] plist::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid resume data: {0}")]
    InvalidResumeData(String),

    #[error("Download manager is already initialized")]
    AlreadyInitialized,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<BgdlError> for String {
    fn from(error: BgdlError) -> Self {
        error.to_string()
    }
}
