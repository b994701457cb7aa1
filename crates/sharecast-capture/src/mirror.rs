//! `DisplayMirror` — the mirrored render target and its frame source.
//!
//! # Setup
//!
//! ```text
//! create_frame_source(metrics, max_images)      ── RGBA buffers
//!   │
//!   ▼
//! create_virtual_display("ScreenCapture", surface)  ── auto-mirror, bound to source
//!   │
//!   ▼
//! set_frame_listener(on_frame)
//! ```
//!
//! # Teardown
//!
//! Frame source first (it is the consumer bound to the target's surface),
//! then the render target, then the grant. Each step is attempted even if an
//! earlier one failed.

use std::sync::Arc;

use sharecast_core::{BackendError, CaptureError, DisplayMetrics, GrantToken};
use tracing::{debug, info, warn};

use crate::platform::{CaptureGrant, DisplayBackend, FrameListener, FrameSource, RenderTarget};

/// Name given to the mirrored virtual display.
pub const VIRTUAL_DISPLAY_NAME: &str = "ScreenCapture";

// ── Handles ───────────────────────────────────────────────────────────────────

/// Which OS handles the mirror currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MirrorHandles {
    pub render_target: bool,
    pub frame_source:  bool,
}

impl MirrorHandles {
    /// Both handles live or both absent.
    pub fn is_paired(&self) -> bool {
        self.render_target == self.frame_source
    }
}

// ── Teardown report ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    FrameSource,
    RenderTarget,
    Grant,
}

impl std::fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FrameSource  => write!(f, "frame source"),
            Self::RenderTarget => write!(f, "render target"),
            Self::Grant        => write!(f, "grant"),
        }
    }
}

/// Outcome of each release step, in the order they ran.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub steps: Vec<(TeardownStep, Result<(), BackendError>)>,
}

impl TeardownReport {
    /// Nothing was live, nothing was released.
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn failures(&self) -> impl Iterator<Item = (TeardownStep, &BackendError)> {
        self.steps
            .iter()
            .filter_map(|(step, res)| res.as_ref().err().map(|e| (*step, e)))
    }

    /// Collapse into `TeardownPartialFailure` when any step failed.
    pub fn into_result(self) -> Result<(), CaptureError> {
        let failed: Vec<String> = self
            .failures()
            .map(|(step, err)| format!("{step}: {err}"))
            .collect();
        if failed.is_empty() {
            return Ok(());
        }
        Err(CaptureError::TeardownPartialFailure {
            failed: failed.len(),
            steps:  failed.join("; "),
        })
    }
}

// ── DisplayMirror ─────────────────────────────────────────────────────────────

struct LiveMirror {
    metrics:       DisplayMetrics,
    frame_source:  Arc<dyn FrameSource>,
    render_target: Box<dyn RenderTarget>,
    grant:         Arc<dyn CaptureGrant>,
}

/// Owns the grant, the virtual display and the frame source of one capture
/// session. The three are acquired and released as a unit.
pub struct DisplayMirror {
    backend:    Arc<dyn DisplayBackend>,
    max_images: u32,
    live:       Option<LiveMirror>,
}

impl DisplayMirror {
    pub fn new(backend: Arc<dyn DisplayBackend>, max_images: u32) -> Self {
        Self { backend, max_images, live: None }
    }

    /// Query the default display's real metrics.
    pub fn query_metrics(&self) -> Result<DisplayMetrics, CaptureError> {
        let metrics = self
            .backend
            .default_display_metrics()
            .map_err(|e| CaptureError::DisplayUnavailable { reason: e.to_string() })?;
        if !metrics.is_usable() {
            return Err(CaptureError::DisplayUnavailable {
                reason: format!("display reports {metrics}"),
            });
        }
        Ok(metrics)
    }

    /// Stand up the frame source and the virtual display bound to it.
    ///
    /// Takes ownership of `grant`. On failure nothing stays acquired: any
    /// partially created handle is released and the grant is stopped.
    pub fn setup(
        &mut self,
        grant: Arc<dyn CaptureGrant>,
        metrics: DisplayMetrics,
        on_frame: Option<FrameListener>,
    ) -> Result<(), CaptureError> {
        if self.live.is_some() {
            release_unused_grant(grant.as_ref());
            return Err(CaptureError::SetupFailed {
                reason: "virtual display already live".into(),
            });
        }
        if !metrics.is_usable() {
            release_unused_grant(grant.as_ref());
            return Err(CaptureError::DisplayUnavailable {
                reason: format!("display reports {metrics}"),
            });
        }

        info!("Setting up virtual display: {}", metrics);

        let frame_source = match self.backend.create_frame_source(metrics, self.max_images) {
            Ok(source) => source,
            Err(e) => {
                warn!("Frame source creation failed: {}", e);
                release_unused_grant(grant.as_ref());
                return Err(CaptureError::SetupFailed { reason: e.to_string() });
            }
        };

        let render_target = match self.backend.create_virtual_display(
            grant.as_ref(),
            VIRTUAL_DISPLAY_NAME,
            metrics,
            frame_source.surface(),
        ) {
            Ok(target) => target,
            Err(e) => {
                warn!("Virtual display creation failed: {} — rolling back", e);
                if let Err(close_err) = frame_source.close() {
                    warn!("Rollback: frame source close failed: {}", close_err);
                }
                release_unused_grant(grant.as_ref());
                return Err(CaptureError::SetupFailed { reason: e.to_string() });
            }
        };

        frame_source.set_frame_listener(on_frame);

        info!(
            "Virtual display '{}' live ({}, {} buffers)",
            render_target.name(),
            grant.token(),
            self.max_images
        );
        self.live = Some(LiveMirror { metrics, frame_source, render_target, grant });
        Ok(())
    }

    /// Release frame source, render target and grant, in that order.
    ///
    /// Safe to call when already torn down; returns an empty report then.
    pub fn teardown(&mut self) -> TeardownReport {
        match self.detach() {
            Some(detached) => detached.release(),
            None => {
                debug!("DisplayMirror::teardown: nothing live");
                TeardownReport::default()
            }
        }
    }

    /// Take the live handles out of the mirror without releasing them. The
    /// mirror reads as torn down from here on; the caller must finish with
    /// [`DetachedMirror::release`], typically on a blocking thread.
    pub fn detach(&mut self) -> Option<DetachedMirror> {
        self.live.take().map(DetachedMirror)
    }

    pub fn handles(&self) -> MirrorHandles {
        let live = self.live.is_some();
        MirrorHandles { render_target: live, frame_source: live }
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// Shared handle to the live frame source, for the capture loop.
    pub fn frame_source(&self) -> Option<Arc<dyn FrameSource>> {
        self.live.as_ref().map(|l| Arc::clone(&l.frame_source))
    }

    pub fn metrics(&self) -> Option<DisplayMetrics> {
        self.live.as_ref().map(|l| l.metrics)
    }

    pub fn grant_token(&self) -> Option<GrantToken> {
        self.live.as_ref().map(|l| l.grant.token())
    }
}

impl Drop for DisplayMirror {
    fn drop(&mut self) {
        if self.live.is_some() {
            let _ = self.teardown();
        }
    }
}

/// Handles taken out of a [`DisplayMirror`], awaiting release.
pub struct DetachedMirror(LiveMirror);

impl DetachedMirror {
    pub fn grant_token(&self) -> GrantToken {
        self.0.grant.token()
    }

    /// Release frame source, render target and grant, in that order. May
    /// block on the platform.
    pub fn release(self) -> TeardownReport {
        let live = self.0;
        let mut report = TeardownReport::default();
        info!("Tearing down virtual display ({})", live.grant.token());

        live.frame_source.set_frame_listener(None);
        report.steps.push((TeardownStep::FrameSource, live.frame_source.close()));
        report.steps.push((TeardownStep::RenderTarget, live.render_target.release()));

        live.grant.unregister_revocation();
        report.steps.push((TeardownStep::Grant, live.grant.release()));

        for (step, err) in report.failures() {
            warn!("Teardown step '{}' failed: {}", step, err);
        }
        report
    }
}

/// Release a grant that never made it into a live mirror.
pub fn release_unused_grant(grant: &dyn CaptureGrant) {
    grant.unregister_revocation();
    if let Err(e) = grant.release() {
        warn!("Releasing {} failed: {}", grant.token(), e);
    }
}
