//! Error types for the monitoring core.
//!
//! Only configuration problems and worker-capacity exhaustion ever surface to
//! callers as hard failures. Probe failures are isolated per segment by the
//! scheduler and reported through logs.

use crate::config::SegmentId;
use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout the core library
pub type Result<T> = std::result::Result<T, MonitorError>;

#[derive(Debug, Error)]
pub enum MonitorError {
    /// A configuration value is outside its accepted bounds
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    /// A configuration file could not be read, parsed or written
    #[error("Configuration file {path:?}: {message}")]
    ConfigFile { path: PathBuf, message: String },

    /// One segment's sweep failed
    #[error("Probe failed for segment {segment}: {message}")]
    ProbeFailure { segment: SegmentId, message: String },

    /// Worker capacity could not be allocated
    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MonitorError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        MonitorError::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
