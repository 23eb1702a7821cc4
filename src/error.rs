//! Error types for Focus Drive

use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur anywhere in the scoring and distribution pipeline
#[derive(Debug, Error)]
pub enum FocusError {
    /// A sample could not be scored (non-finite or negative band power).
    /// The sample is dropped and the stream continues.
    #[error("Invalid sample: {0}")]
    InvalidSample(String),

    /// Startup configuration is unusable. Fatal.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The upstream source stopped producing samples.
    #[error("Upstream source disconnected: {0}")]
    UpstreamDisconnected(String),

    /// A single datagram could not be delivered to an endpoint.
    #[error("Endpoint {endpoint} unreachable: {reason}")]
    EndpointUnreachable { endpoint: SocketAddr, reason: String },

    /// The calibration window closed before enough scores arrived.
    #[error("Insufficient calibration samples: collected {collected}, need {required}")]
    InsufficientSamples { collected: usize, required: usize },

    /// A wire message could not be decoded by a consumer.
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// The upstream source could not be opened at startup. Fatal.
    #[error("Failed to initialize source: {0}")]
    SourceInit(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl FocusError {
    /// Whether this error should terminate the process.
    ///
    /// Failures local to one sample or one endpoint never escalate; only
    /// startup configuration and source initialization are fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FocusError::InvalidConfig(_) | FocusError::SourceInit(_))
    }

    /// Stable machine-readable code for diagnostics
    pub fn code(&self) -> &'static str {
        match self {
            FocusError::InvalidSample(_) => "INVALID_SAMPLE",
            FocusError::InvalidConfig(_) => "INVALID_CONFIG",
            FocusError::UpstreamDisconnected(_) => "UPSTREAM_DISCONNECTED",
            FocusError::EndpointUnreachable { .. } => "ENDPOINT_UNREACHABLE",
            FocusError::InsufficientSamples { .. } => "INSUFFICIENT_SAMPLES",
            FocusError::DecodeError(_) => "DECODE_ERROR",
            FocusError::SourceInit(_) => "SOURCE_INIT_FAILED",
            FocusError::Io(_) => "IO_ERROR",
            FocusError::Json(_) => "JSON_ERROR",
        }
    }
}

/// Result alias used throughout the crate
pub type FocusResult<T> = Result<T, FocusError>;
