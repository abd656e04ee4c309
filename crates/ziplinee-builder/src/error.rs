//! Error types for the builder engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Fatal before any reporting
    #[error("Configuration error: {0}")]
    Config(String),

    // Fatal, reported through the end-of-life helper
    #[error("Setup failed: {0}")]
    Setup(String),

    // Contained in the stage's build log step
    #[error("Stage {stage} failed: {message}")]
    Stage { stage: String, message: String },

    #[error("Image {image} is not trusted to {capability}")]
    TrustedImageViolation { image: String, capability: String },

    #[error("Service {service} was not ready within {timeout_seconds}s")]
    ReadinessTimeout {
        service: String,
        timeout_seconds: u64,
    },

    #[error("When expression error: {0}")]
    When(#[from] crate::when::WhenError),

    #[error("Run canceled")]
    Canceled,

    // Wrapped infrastructure errors
    #[error("Container runtime error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Crypt(#[from] ziplinee_crypt::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
