//! Error taxonomy for the detection pipeline.
//!
//! None of these terminate the detection loop. Each is recovered where it
//! happens and surfaced through `Statistics` counters or the stream status.

use thiserror::Error;

/// Recoverable failures observed by the pipeline.
#[derive(Debug, Error)]
pub enum WatchError {
    /// Camera could not be opened or stopped producing frames.
    #[error("camera '{camera}' unavailable: {reason}")]
    SourceUnavailable { camera: String, reason: String },

    /// The detector adapter returned an error; the frame is skipped.
    #[error("detector '{backend}' failed: {reason}")]
    DetectorFailure { backend: String, reason: String },

    /// The buzzer peer could not be reached.
    #[error("alert delivery to {target} failed: {reason}")]
    AlertDeliveryFailure { target: String, reason: String },

    /// Evidence could not be written; detection continues without persistence.
    #[error("storage write to {path} failed: {reason}")]
    StorageWriteFailure { path: String, reason: String },
}

impl WatchError {
    /// Short machine-readable kind, used in logs and status payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            WatchError::SourceUnavailable { .. } => "source_unavailable",
            WatchError::DetectorFailure { .. } => "detector_failure",
            WatchError::AlertDeliveryFailure { .. } => "alert_delivery_failure",
            WatchError::StorageWriteFailure { .. } => "storage_write_failure",
        }
    }
}

/// Result of reading from the stream multiplexer.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The camera is open but no frame has been decoded yet.
    #[error("no frame available yet")]
    Unavailable,
    /// The handle refers to a connection that has since been replaced.
    #[error("stream handle is stale (camera switched)")]
    Stale,
    /// No camera is open.
    #[error("stream is closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_are_stable() {
        let err = WatchError::StorageWriteFailure {
            path: "security_images".to_string(),
            reason: "disk full".to_string(),
        };
        assert_eq!(err.kind(), "storage_write_failure");
        assert!(err.to_string().contains("disk full"));
    }
}
