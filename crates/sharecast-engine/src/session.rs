//! `CaptureSession`: the one authoritative capture state machine.
//!
//! ```text
//! Idle ──request_permission_and_start──► PermissionPending ──granted──► Capturing
//!  ▲                                          │ denied / error                 ▲ │
//!  │                                          ▼                                │ │ start_live_streaming
//!  │◄─────────────────────────────────────── Idle          stop_live_streaming │ ▼
//!  │                                                                     LiveStreaming
//!  └──── Stopping ◄──── stop() / grant revoked (from Capturing or LiveStreaming)
//! ```
//!
//! Every transition runs under one async mutex. The mutex is not held while
//! the user answers the permission prompt, so `stop()` can cancel a pending
//! request. Queries (`state`, `is_capturing`, `is_live_streaming`) read a
//! `watch` channel and never wait on that mutex.

use std::sync::{Arc, Weak};
use std::time::Duration;

use sharecast_capture::{
    release_unused_grant, DisplayBackend, DisplayMirror, ForegroundService, FrameListener,
    GrantDecision, GrantProvider, MirrorHandles, RevocationCallback,
};
use sharecast_core::{
    CaptureError, CaptureEvent, CaptureEventKind, CaptureState, DisplayMetrics, EncodedFrame,
    EngineConfig, GrantToken,
};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::encoder::FrameEncoder;
use crate::events::{EventBus, EventSink, Subscription};
use crate::pipeline::{FrameCapturePipeline, FrameGrabber, GrabOutcome, PipelineStats};

// ── Backends ──────────────────────────────────────────────────────────────────

/// Platform collaborators a session is built against.
#[derive(Clone)]
pub struct SessionBackends {
    pub display:    Arc<dyn DisplayBackend>,
    pub grants:     Arc<dyn GrantProvider>,
    pub foreground: Arc<dyn ForegroundService>,
}

impl SessionBackends {
    pub fn new(
        display: Arc<dyn DisplayBackend>,
        grants: Arc<dyn GrantProvider>,
        foreground: Arc<dyn ForegroundService>,
    ) -> Self {
        Self { display, grants, foreground }
    }
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

/// Consistent view of the session, taken under the transition lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state:       CaptureState,
    pub grant_token: Option<GrantToken>,
    pub handles:     MirrorHandles,
    pub metrics:     Option<DisplayMetrics>,
    /// Last sequence number handed out in this capture run.
    pub sequence:    u64,
    pub pipeline:    Option<PipelineStats>,
}

// ── CaptureSession ────────────────────────────────────────────────────────────

/// A permission request still waiting on the user.
struct PendingStart {
    attempt: u64,
    cancel:  oneshot::Sender<()>,
}

struct Control {
    mirror:       DisplayMirror,
    grant_token:  Option<GrantToken>,
    grabber:      Option<FrameGrabber>,
    pipeline:     Option<FrameCapturePipeline>,
    pending:      Option<PendingStart>,
    next_attempt: u64,
}

struct SessionInner {
    config:     EngineConfig,
    encoder:    FrameEncoder,
    grants:     Arc<dyn GrantProvider>,
    foreground: Arc<dyn ForegroundService>,
    events:     EventBus,
    state_tx:   watch::Sender<CaptureState>,
    control:    Mutex<Control>,
}

/// Screen-capture session. Cheap to clone; clones share one state machine.
///
/// Intended to be created once and kept for the life of the process. It can
/// be cycled through start and stop any number of times.
#[derive(Clone)]
pub struct CaptureSession {
    inner: Arc<SessionInner>,
}

impl CaptureSession {
    pub fn new(config: EngineConfig, backends: SessionBackends) -> Result<Self, CaptureError> {
        config.validate()?;

        let (state_tx, _) = watch::channel(CaptureState::Idle);
        let mirror = DisplayMirror::new(backends.display, config.max_images);

        Ok(Self {
            inner: Arc::new(SessionInner {
                encoder:    FrameEncoder::from_config(&config),
                events:     EventBus::new(config.event_capacity),
                grants:     backends.grants,
                foreground: backends.foreground,
                state_tx,
                control:    Mutex::new(Control {
                    mirror,
                    grant_token:  None,
                    grabber:      None,
                    pipeline:     None,
                    pending:      None,
                    next_attempt: 0,
                }),
                config,
            }),
        })
    }

    // MARK: - Lifecycle

    /// Ask for capture permission and, once granted, bring up the mirrored
    /// display. Resolves after the user has answered, or with
    /// [`CaptureError::StartCancelled`] if `stop()` ran first.
    pub async fn request_permission_and_start(&self) -> Result<(), CaptureError> {
        let inner = &self.inner;
        if inner.state() != CaptureState::Idle {
            return Err(CaptureError::AlreadyActive);
        }
        let runtime = Handle::try_current().map_err(|e| CaptureError::SetupFailed {
            reason: format!("no async runtime: {e}"),
        })?;

        let (attempt, mut cancelled) = {
            let mut control = inner.control.lock().await;
            if inner.state() != CaptureState::Idle {
                return Err(CaptureError::AlreadyActive);
            }
            control.next_attempt += 1;
            let attempt = control.next_attempt;
            let (cancel, cancelled) = oneshot::channel();
            control.pending = Some(PendingStart { attempt, cancel });
            inner.set_state(CaptureState::PermissionPending);
            (attempt, cancelled)
        };
        info!("Requesting screen capture permission");

        let decision = tokio::select! {
            decision = inner.grants.request_grant() => decision,
            _ = &mut cancelled => {
                info!("Permission request abandoned: stop requested");
                return Err(CaptureError::StartCancelled);
            }
        };

        let mut control = inner.control.lock().await;
        if control.pending.as_ref().map(|p| p.attempt) != Some(attempt) {
            // stop() won the race after the decision arrived.
            if let Ok(GrantDecision::Granted(grant)) = decision {
                release_unused_grant(grant.as_ref());
            }
            info!("Permission request abandoned: stop requested");
            return Err(CaptureError::StartCancelled);
        }
        control.pending = None;

        let grant = match decision {
            Ok(GrantDecision::Granted(grant)) => grant,
            Ok(GrantDecision::Denied) => {
                inner.set_state(CaptureState::Idle);
                info!("Screen capture permission denied");
                return Err(CaptureError::PermissionDenied);
            }
            Err(e) => {
                inner.set_state(CaptureState::Idle);
                warn!("Permission request failed: {}", e);
                return Err(CaptureError::GrantRequestFailed { reason: e.to_string() });
            }
        };
        let token = grant.token();
        info!("Screen capture permission granted ({})", token);

        if let Err(e) = inner.foreground.notify_active() {
            warn!("Foreground service activation failed: {}", e);
        }

        let metrics = match control.mirror.query_metrics() {
            Ok(metrics) => metrics,
            Err(e) => {
                release_unused_grant(grant.as_ref());
                inner.abort_start(&e);
                return Err(e);
            }
        };

        grant.register_revocation(self.revocation_callback(runtime, token));

        let events = inner.events.clone();
        let on_frame: FrameListener = Arc::new(move || events.emit(CaptureEvent::FrameAvailable));
        if let Err(e) = control.mirror.setup(grant, metrics, Some(on_frame)) {
            inner.abort_start(&e);
            return Err(e);
        }

        let Some(source) = control.mirror.frame_source() else {
            let e = CaptureError::SetupFailed { reason: "frame source missing after setup".into() };
            if let Err(te) = control.mirror.teardown().into_result() {
                warn!("Rollback incomplete: {}", te);
            }
            inner.abort_start(&e);
            return Err(e);
        };

        control.grabber = Some(FrameGrabber::new(source, inner.encoder));
        control.grant_token = Some(token);
        inner.set_state(CaptureState::Capturing);
        inner.events.emit(CaptureEvent::Started);
        info!("Screen capture started: {} ({})", metrics, token);
        Ok(())
    }

    /// Start the live-stream loop at the configured interval.
    pub async fn start_live_streaming(&self) -> Result<(), CaptureError> {
        self.start_live_streaming_with(self.inner.config.capture_interval()).await
    }

    /// Start the live-stream loop with an explicit tick interval.
    pub async fn start_live_streaming_with(&self, interval: Duration) -> Result<(), CaptureError> {
        let inner = &self.inner;
        let mut control = inner.control.lock().await;
        match inner.state() {
            CaptureState::Capturing => {}
            CaptureState::LiveStreaming => return Err(CaptureError::AlreadyStreaming),
            _ => return Err(CaptureError::NotCapturing),
        }
        if interval.is_zero() {
            return Err(CaptureError::ConfigurationInvalid {
                reason: "capture interval must be greater than zero".into(),
            });
        }
        let grabber = control.grabber.clone().ok_or(CaptureError::NotCapturing)?;

        // Announce before the first tick can fire.
        inner.set_state(CaptureState::LiveStreaming);
        inner.events.emit(CaptureEvent::LiveStreamingStarted);

        let sink: Arc<dyn EventSink> = Arc::new(inner.events.clone());
        match FrameCapturePipeline::start(grabber, interval, inner.config.stop_grace(), sink) {
            Ok(pipeline) => {
                control.pipeline = Some(pipeline);
                info!(
                    "Live streaming started: {:?} interval (~{:.1} fps)",
                    interval,
                    1.0 / interval.as_secs_f64()
                );
                Ok(())
            }
            Err(e) => {
                inner.set_state(CaptureState::Capturing);
                inner.events.emit(CaptureEvent::LiveStreamingStopped);
                Err(e)
            }
        }
    }

    /// Stop the live-stream loop and return to `Capturing`. A no-op when not
    /// streaming.
    pub async fn stop_live_streaming(&self) -> Result<(), CaptureError> {
        let inner = &self.inner;
        let mut control = inner.control.lock().await;
        if inner.state() != CaptureState::LiveStreaming {
            debug!("stop_live_streaming: not streaming ({})", inner.state());
            return Ok(());
        }

        if let Some(mut pipeline) = control.pipeline.take() {
            pipeline.stop().await;
        }
        inner.set_state(CaptureState::Capturing);
        inner.events.emit(CaptureEvent::LiveStreamingStopped);
        info!("Live streaming stopped");
        Ok(())
    }

    /// Full teardown back to `Idle`. A no-op when already idle. While the
    /// permission prompt is open this abandons the request instead.
    pub async fn stop(&self) -> Result<(), CaptureError> {
        let mut control = self.inner.control.lock().await;
        match self.inner.state() {
            CaptureState::Idle => {
                debug!("stop: already idle");
            }
            CaptureState::PermissionPending => self.inner.cancel_pending(&mut control),
            _ => self.inner.teardown(&mut control, "stop requested").await,
        }
        Ok(())
    }

    /// Grab and encode one frame outside the live loop.
    pub async fn capture_single_frame(&self) -> Result<EncodedFrame, CaptureError> {
        let control = self.inner.control.lock().await;
        if !self.inner.state().is_capturing() {
            return Err(CaptureError::NotCapturing);
        }
        let grabber = control.grabber.clone().ok_or(CaptureError::NotCapturing)?;
        let guard = grabber.try_begin().ok_or_else(|| CaptureError::CaptureFailed {
            reason: "another frame is still being processed".into(),
        })?;

        let outcome = tokio::task::spawn_blocking(move || grabber.grab(&guard, None))
            .await
            .map_err(|e| CaptureError::CaptureFailed { reason: format!("capture task failed: {e}") })?;
        drop(control);

        match outcome {
            Ok(GrabOutcome::Frame(frame)) => {
                debug!("Single frame #{} captured ({} bytes)", frame.sequence, frame.data.len());
                Ok(frame)
            }
            Ok(GrabOutcome::Empty | GrabOutcome::Cancelled) => Err(CaptureError::CaptureFailed {
                reason: "no frame available".into(),
            }),
            Err(CaptureError::EncodeFailed { reason }) => Err(CaptureError::CaptureFailed { reason }),
            Err(e) => Err(e),
        }
    }

    // MARK: - Queries

    pub fn state(&self) -> CaptureState {
        self.inner.state()
    }

    pub fn is_capturing(&self) -> bool {
        self.inner.state().is_capturing()
    }

    pub fn is_live_streaming(&self) -> bool {
        self.inner.state().is_live_streaming()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<CaptureState> {
        self.inner.state_tx.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let control = self.inner.control.lock().await;
        SessionSnapshot {
            state:       self.inner.state(),
            grant_token: control.grant_token,
            handles:     control.mirror.handles(),
            metrics:     control.mirror.metrics(),
            sequence:    control.grabber.as_ref().map_or(0, FrameGrabber::sequence),
            pipeline:    control.pipeline.as_ref().map(FrameCapturePipeline::stats),
        }
    }

    // MARK: - Events

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self, kind: CaptureEventKind) -> Subscription {
        self.inner.events.subscribe(kind)
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.inner.events.subscribe_all()
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.inner.events.unsubscribe(subscription);
    }

    // MARK: - Private

    fn revocation_callback(&self, runtime: Handle, token: GrantToken) -> RevocationCallback {
        let session: Weak<SessionInner> = Arc::downgrade(&self.inner);
        Box::new(move || {
            let Some(inner) = session.upgrade() else {
                return;
            };
            info!("{} revoked by the system", token);
            runtime.spawn(async move {
                inner.handle_revocation(token).await;
            });
        })
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("state", &self.inner.state())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl SessionInner {
    fn state(&self) -> CaptureState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: CaptureState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Capture state: {} → {}", previous, state);
        }
    }

    /// Undo a start that got past the grant: foreground off, back to `Idle`.
    fn abort_start(&self, error: &CaptureError) {
        warn!("Screen capture start failed: {}", error);
        if let Err(e) = self.foreground.notify_inactive() {
            warn!("Foreground service deactivation failed: {}", e);
        }
        self.set_state(CaptureState::Idle);
    }

    /// Caller holds the transition lock and state is `PermissionPending`.
    /// Nothing has been acquired yet, so no events are emitted.
    fn cancel_pending(&self, control: &mut Control) {
        self.set_state(CaptureState::Stopping);
        if let Some(pending) = control.pending.take() {
            let _ = pending.cancel.send(());
        }
        self.set_state(CaptureState::Idle);
        info!("Screen capture permission request cancelled");
    }

    async fn handle_revocation(&self, token: GrantToken) {
        let mut control = self.control.lock().await;
        if control.grant_token != Some(token) {
            debug!("Ignoring revocation of stale {}", token);
            return;
        }
        self.teardown(&mut control, "grant revoked").await;
    }

    /// Caller holds the transition lock and state is not `Idle`.
    async fn teardown(&self, control: &mut Control, cause: &str) {
        let was_streaming = self.state() == CaptureState::LiveStreaming;

        control.grant_token = None;
        self.set_state(CaptureState::Stopping);
        info!("Stopping screen capture: {}", cause);

        if let Some(mut pipeline) = control.pipeline.take() {
            pipeline.stop().await;
        }
        control.grabber = None;

        if let Some(detached) = control.mirror.detach() {
            // Releasing native handles may block.
            match tokio::task::spawn_blocking(move || detached.release()).await {
                Ok(report) => {
                    if let Err(e) = report.into_result() {
                        warn!("Screen capture teardown incomplete: {}", e);
                    }
                }
                Err(e) => warn!("Screen capture teardown task failed: {}", e),
            }
        }
        if let Err(e) = self.foreground.notify_inactive() {
            warn!("Foreground service deactivation failed: {}", e);
        }

        self.set_state(CaptureState::Idle);
        if was_streaming {
            self.events.emit(CaptureEvent::LiveStreamingStopped);
        }
        self.events.emit(CaptureEvent::Stopped);
        info!("Screen capture stopped");
    }
}
