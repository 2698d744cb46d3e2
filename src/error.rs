//! Error types for the Gatekeeper service.

use thiserror::Error;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Invalid limiter or service configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A key generator could not derive a rate limit key from the request
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Errors raised while loading layered settings
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
