//! Errors reported by transfer gateways.

use std::io;
use thiserror::Error;

/// Errors that can occur while talking to a transfer gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The requested path does not exist on the endpoint.
    #[error("{path} not found on endpoint {endpoint}")]
    NotFound { endpoint: String, path: String },

    /// The remote answered with a non-success status.
    #[error("remote call failed with status {code}: {message}")]
    Status { code: u16, message: String },

    /// Endpoint activation did not succeed.
    #[error("activation of endpoint {endpoint} failed with status {code}: {message}")]
    Activation {
        endpoint: String,
        code: u16,
        message: String,
    },

    /// Unknown endpoint name.
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// Unknown task ID.
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// Network or protocol level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote answered with a body we could not decode.
    #[error("could not decode response: {0}")]
    Decode(String),

    /// Local IO error (directory gateway).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl GatewayError {
    /// Whether this error means the path does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            GatewayError::NotFound { .. } => true,
            GatewayError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            GatewayError::Decode(e.to_string())
        } else {
            GatewayError::Transport(e.to_string())
        }
    }
}

/// Result type for gateway calls.
pub type GatewayResult<T> = Result<T, GatewayError>;
