//! Seams between the engine and the OS capture stack.
//!
//! ```text
//! GrantProvider ──► CaptureGrant ──────────────┐ (authority)
//!                                              ▼
//! DisplayBackend ─► FrameSource ◄── surface ── RenderTarget (virtual display)
//!                       │
//!                       └─► acquire_latest() ─► RawFrame (leased)
//! ```
//!
//! Everything here is object-safe so a session can hold `Arc<dyn …>` handles
//! for whatever platform it was built against.

use std::sync::Arc;

use async_trait::async_trait;
use sharecast_core::{BackendError, DisplayMetrics, GrantToken, RawFrame};

/// Invoked by the OS when the user revokes the capture grant out of band.
/// May be called from any thread.
pub type RevocationCallback = Box<dyn Fn() + Send + Sync>;

/// Invoked whenever the frame source has a new frame buffered.
pub type FrameListener = Arc<dyn Fn() + Send + Sync>;

// ── Grant ─────────────────────────────────────────────────────────────────────

/// Outcome of a capture-permission request.
pub enum GrantDecision {
    Granted(Arc<dyn CaptureGrant>),
    Denied,
}

impl std::fmt::Debug for GrantDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Granted(grant) => write!(f, "Granted({})", grant.token()),
            Self::Denied => write!(f, "Denied"),
        }
    }
}

/// Asks the OS (and, through it, the user) for permission to capture.
#[async_trait]
pub trait GrantProvider: Send + Sync {
    /// Resolves once the user has answered the permission prompt.
    async fn request_grant(&self) -> Result<GrantDecision, BackendError>;
}

/// A live capture authorization. Keeps the virtual display alive on
/// platforms that tie the two together.
pub trait CaptureGrant: Send + Sync {
    fn token(&self) -> GrantToken;

    /// Register the callback fired on out-of-band revocation. Replaces any
    /// previously registered callback.
    fn register_revocation(&self, callback: RevocationCallback);

    fn unregister_revocation(&self);

    /// Stop the grant. Errors if it was already released.
    fn release(&self) -> Result<(), BackendError>;
}

// ── Display ───────────────────────────────────────────────────────────────────

/// Identifies the surface a frame source exposes for a producer to render into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

/// Buffered consumer side of the mirrored display (an image reader).
pub trait FrameSource: Send + Sync {
    fn surface(&self) -> SurfaceId;

    /// Latest buffered frame; older buffered frames are discarded.
    /// `Ok(None)` when nothing new has been rendered.
    fn acquire_latest(&self) -> Result<Option<RawFrame>, BackendError>;

    /// Install or clear the frame-available listener.
    fn set_frame_listener(&self, listener: Option<FrameListener>);

    fn close(&self) -> Result<(), BackendError>;
}

/// Off-screen render target mirroring the device display (a virtual display).
pub trait RenderTarget: Send + Sync {
    fn name(&self) -> &str;

    fn release(&self) -> Result<(), BackendError>;
}

/// The OS display service.
pub trait DisplayBackend: Send + Sync {
    /// Real metrics of the default display.
    fn default_display_metrics(&self) -> Result<DisplayMetrics, BackendError>;

    fn create_frame_source(
        &self,
        metrics: DisplayMetrics,
        max_images: u32,
    ) -> Result<Arc<dyn FrameSource>, BackendError>;

    /// Create an auto-mirroring virtual display rendering into `surface`.
    fn create_virtual_display(
        &self,
        grant: &dyn CaptureGrant,
        name: &str,
        metrics: DisplayMetrics,
        surface: SurfaceId,
    ) -> Result<Box<dyn RenderTarget>, BackendError>;
}

// ── Foreground service ────────────────────────────────────────────────────────

/// The foreground/notification collaborator that must be active while capture
/// runs. Both calls are fire-and-forget from the engine's point of view.
pub trait ForegroundService: Send + Sync {
    fn notify_active(&self) -> Result<(), BackendError>;

    fn notify_inactive(&self) -> Result<(), BackendError>;
}

/// Foreground service for platforms that do not need one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoForegroundService;

impl ForegroundService for NoForegroundService {
    fn notify_active(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn notify_inactive(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
