use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

// MARK: - DisplayMetrics

/// Real metrics of the display being mirrored, captured once at setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisplayMetrics {
    pub width: u32,
    pub height: u32,
    #[serde(alias = "densityDpi")]
    pub density_dpi: u32,
}

impl DisplayMetrics {
    pub const fn new(width: u32, height: u32, density_dpi: u32) -> Self {
        Self { width, height, density_dpi }
    }

    /// A display that reports a zero dimension cannot back a render target.
    pub fn is_usable(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

impl std::fmt::Display for DisplayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}×{} @{}dpi", self.width, self.height, self.density_dpi)
    }
}

// MARK: - PixelFormat

/// Layout of a raw frame as delivered by the frame source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8888,
    /// 4 bytes per pixel: Blue, Green, Red, Alpha.
    Bgra8888,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> u32 {
        4
    }
}

// MARK: - FrameLease

/// Returns a leased buffer to its frame source when dropped.
///
/// A [`RawFrame`] owns the buffer only for the duration of one encode; the
/// lease makes the hand-back happen at the exact point the frame goes out of
/// scope.
pub struct FrameLease {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl FrameLease {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self { release: Some(Box::new(release)) }
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for FrameLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameLease")
            .field("held", &self.release.is_some())
            .finish()
    }
}

// MARK: - RawFrame

/// A raw frame pulled from the frame source.
#[derive(Debug)]
pub struct RawFrame {
    /// Pixel data for plane 0, including any row padding.
    pub data:         bytes::Bytes,
    pub width:        u32,
    pub height:       u32,
    /// Bytes between the start of consecutive rows.
    pub row_stride:   u32,
    /// Bytes between consecutive pixels in a row.
    pub pixel_stride: u32,
    pub format:       PixelFormat,
    /// Acquisition timestamp (ms since UNIX epoch).
    pub timestamp_ms: u64,
    pub lease:        Option<FrameLease>,
}

impl RawFrame {
    /// Padding bytes at the end of every row.
    pub fn row_padding(&self) -> u32 {
        self.row_stride.saturating_sub(self.pixel_stride * self.width)
    }

    /// Minimum buffer length needed to address every visible pixel.
    pub fn required_len(&self) -> usize {
        if self.height == 0 {
            return 0;
        }
        self.row_stride as usize * (self.height as usize - 1)
            + self.pixel_stride as usize * self.width as usize
    }

    /// Hand the buffer back to the frame source now.
    pub fn release(self) {
        drop(self);
    }
}

// MARK: - ImageFormat

/// Compressed still-image format of an [`EncodedFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Jpeg,
    Png,
}

impl ImageFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Jpeg => write!(f, "JPEG"),
            Self::Png => write!(f, "PNG"),
        }
    }
}

// MARK: - EncodedFrame

/// A compressed still frame ready for delivery to listeners.
///
/// Immutable once produced; `data` is shared read-only between listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub data:         bytes::Bytes,
    pub format:       ImageFormat,
    /// Strictly increasing within one capture session, starting at 1.
    pub sequence:     u64,
    /// Acquisition timestamp of the source frame (ms since UNIX epoch).
    pub timestamp_ms: u64,
    pub width:        u32,
    pub height:       u32,
}

impl EncodedFrame {
    /// Payload as standard base64 without line wrapping.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.data)
    }

    /// Payload as a `data:` URI, directly renderable by an image view.
    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.format.mime_type(), self.to_base64())
    }
}

// MARK: - GrantToken

/// Opaque identifier of a capture grant. Present on the session only while
/// capture is authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GrantToken(u64);

impl GrantToken {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for GrantToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "grant#{}", self.0)
    }
}

// MARK: - CaptureState

/// Lifecycle state of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    #[default]
    Idle,
    PermissionPending,
    Capturing,
    LiveStreaming,
    Stopping,
}

impl CaptureState {
    /// Capture is authorized and the mirror is live.
    pub fn is_capturing(&self) -> bool {
        matches!(self, Self::Capturing | Self::LiveStreaming)
    }

    pub fn is_live_streaming(&self) -> bool {
        matches!(self, Self::LiveStreaming)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle              => "idle",
            Self::PermissionPending => "permission pending",
            Self::Capturing         => "capturing",
            Self::LiveStreaming     => "live streaming",
            Self::Stopping          => "stopping",
        }
    }
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
