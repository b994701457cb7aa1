//! Notifications published by the capture engine.

use crate::types::EncodedFrame;

// MARK: - CaptureEvent

/// The only notification type that crosses the engine boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Capture was authorized and the mirrored display is live.
    Started,
    /// Capture ended, by request or because the grant was revoked.
    Stopped,
    /// The frame source has a new frame buffered.
    FrameAvailable,
    LiveStreamingStarted,
    LiveStreamingStopped,
    /// One encoded frame from the live-stream loop.
    LiveFrame(EncodedFrame),
}

impl CaptureEvent {
    pub fn kind(&self) -> CaptureEventKind {
        match self {
            Self::Started              => CaptureEventKind::Started,
            Self::Stopped              => CaptureEventKind::Stopped,
            Self::FrameAvailable       => CaptureEventKind::FrameAvailable,
            Self::LiveStreamingStarted => CaptureEventKind::LiveStreamingStarted,
            Self::LiveStreamingStopped => CaptureEventKind::LiveStreamingStopped,
            Self::LiveFrame(_)         => CaptureEventKind::LiveFrame,
        }
    }
}

// MARK: - CaptureEventKind

/// Payload-free discriminant of [`CaptureEvent`], used to filter subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureEventKind {
    Started,
    Stopped,
    FrameAvailable,
    LiveStreamingStarted,
    LiveStreamingStopped,
    LiveFrame,
}

impl CaptureEventKind {
    pub const ALL: [CaptureEventKind; 6] = [
        Self::Started,
        Self::Stopped,
        Self::FrameAvailable,
        Self::LiveStreamingStarted,
        Self::LiveStreamingStopped,
        Self::LiveFrame,
    ];

    /// Event name as seen by a bridge layer.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started              => "ScreenCaptureStarted",
            Self::Stopped              => "ScreenCaptureStopped",
            Self::FrameAvailable       => "ScreenFrameAvailable",
            Self::LiveStreamingStarted => "LiveStreamingStarted",
            Self::LiveStreamingStopped => "LiveStreamingStopped",
            Self::LiveFrame            => "LiveFrameCapture",
        }
    }
}

impl std::fmt::Display for CaptureEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
