use thiserror::Error;

/// Errors surfaced by the capture engine.
///
/// Sequencing and setup errors reach the caller. `EncodeFailed` and
/// `TeardownPartialFailure` are produced internally and only ever logged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Screen capture permission denied")]
    PermissionDenied,

    #[error("Capture grant request failed: {reason}")]
    GrantRequestFailed { reason: String },

    /// `stop()` arrived while the permission request was still open.
    #[error("Screen capture start was cancelled")]
    StartCancelled,

    #[error("Screen capture is already active")]
    AlreadyActive,

    #[error("Screen capture is not active")]
    NotCapturing,

    #[error("Live streaming is already active")]
    AlreadyStreaming,

    #[error("Default display unavailable: {reason}")]
    DisplayUnavailable { reason: String },

    #[error("Virtual display setup failed: {reason}")]
    SetupFailed { reason: String },

    #[error("Failed to capture frame: {reason}")]
    CaptureFailed { reason: String },

    #[error("Failed to encode frame: {reason}")]
    EncodeFailed { reason: String },

    #[error("Teardown finished with {failed} failed step(s): {steps}")]
    TeardownPartialFailure { failed: usize, steps: String },

    #[error("Configuration invalid: {reason}")]
    ConfigurationInvalid { reason: String },
}

/// Errors returned by the platform seams (display service, frame source,
/// grant subsystem, foreground service).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Resource unavailable: {0}")]
    Unavailable(String),

    #[error("{op} failed: {reason}")]
    Failed { op: &'static str, reason: String },

    #[error("Resource already closed")]
    Closed,
}

impl BackendError {
    pub fn failed(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Failed { op, reason: reason.into() }
    }
}
