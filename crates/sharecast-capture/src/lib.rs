//! sharecast-capture — display mirroring for the ShareCast capture engine.
//!
//! # Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`platform`]  | seams to the OS: grant provider, display service, frame source, foreground service |
//! | [`mirror`]    | [`DisplayMirror`]: paired setup and ordered teardown of the mirrored display |
//! | [`synthetic`] | in-process backend for tests, CI and the demo binary (feature `synthetic`) |
//!
//! # Usage
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use sharecast_capture::{CaptureGrant, DisplayBackend};
//! # fn example(display: Arc<dyn DisplayBackend>, grant: Arc<dyn CaptureGrant>) -> Result<(), sharecast_core::CaptureError> {
//! use sharecast_capture::DisplayMirror;
//! let mut mirror = DisplayMirror::new(display, 3);
//! let metrics = mirror.query_metrics()?;
//! mirror.setup(grant, metrics, None)?;
//! // … pull frames from mirror.frame_source() …
//! mirror.teardown().into_result()?;
//! # Ok(())
//! # }
//! ```

pub mod mirror;
pub mod platform;

#[cfg(any(test, feature = "synthetic"))]
pub mod synthetic;

pub use mirror::{
    release_unused_grant, DetachedMirror, DisplayMirror, MirrorHandles, TeardownReport, TeardownStep,
    VIRTUAL_DISPLAY_NAME,
};
pub use platform::{
    CaptureGrant, DisplayBackend, ForegroundService, FrameListener, FrameSource, GrantDecision,
    GrantProvider, NoForegroundService, RenderTarget, RevocationCallback, SurfaceId,
};
