//! In-process capture backend.
//!
//! Stands in for the OS display service, grant subsystem and foreground
//! service so the engine can run in CI, in tests and in the demo binary.
//! Every acquisition and release is appended to a shared [`ResourceLog`], and
//! each failure mode the engine must survive can be switched on at runtime.
//!
//! # Frame production
//!
//! | Mode | Behaviour |
//! |------|-----------|
//! | [`FrameProduction::OnDemand`] | every `acquire_latest` renders a fresh frame |
//! | [`FrameProduction::Refresh`]  | a render thread fills the source at a fixed rate and fires the frame listener |

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sharecast_core::{now_ms, BackendError, DisplayMetrics, FrameLease, GrantToken, PixelFormat, RawFrame};
use tracing::{debug, info, trace};

use crate::platform::{
    CaptureGrant, DisplayBackend, ForegroundService, FrameListener, FrameSource, GrantDecision,
    GrantProvider, RenderTarget, RevocationCallback, SurfaceId,
};

/// Row alignment used when laying out synthetic frames.
const ROW_ALIGN: u32 = 64;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── ResourceLog ───────────────────────────────────────────────────────────────

/// Acquisition and release of synthetic resources, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceEvent {
    GrantIssued,
    FrameSourceCreated,
    VirtualDisplayCreated,
    FrameSourceClosed,
    VirtualDisplayReleased,
    GrantReleased,
    ForegroundActive,
    ForegroundInactive,
}

impl ResourceEvent {
    pub fn is_release(&self) -> bool {
        matches!(
            self,
            Self::FrameSourceClosed | Self::VirtualDisplayReleased | Self::GrantReleased
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceLog {
    events: Arc<Mutex<Vec<ResourceEvent>>>,
}

impl ResourceLog {
    pub fn push(&self, event: ResourceEvent) {
        lock(&self.events).push(event);
    }

    pub fn events(&self) -> Vec<ResourceEvent> {
        lock(&self.events).clone()
    }

    pub fn count(&self, event: ResourceEvent) -> usize {
        lock(&self.events).iter().filter(|e| **e == event).count()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

// ── Source controls ───────────────────────────────────────────────────────────

/// Knobs shared by a display and every frame source it creates.
#[derive(Debug, Default)]
struct SourceControls {
    acquire_delay_ms: AtomicU64,
    paused:           AtomicBool,
    fail_acquire:     AtomicBool,
    fail_close:       AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameProduction {
    OnDemand,
    Refresh(Duration),
}

// ── SyntheticFrameSource ──────────────────────────────────────────────────────

pub struct SyntheticFrameSource {
    surface:     SurfaceId,
    metrics:     DisplayMetrics,
    max_images:  u32,
    production:  FrameProduction,
    controls:    Arc<SourceControls>,
    log:         ResourceLog,
    bound:       AtomicBool,
    closed:      AtomicBool,
    /// Rendered but not yet acquired.
    pending:     AtomicU32,
    /// Acquired and not yet released.
    outstanding: Arc<AtomicU32>,
    rendered:    AtomicU64,
    listener:    Mutex<Option<FrameListener>>,
}

impl SyntheticFrameSource {
    /// Render one frame into the source, as the virtual display would.
    pub fn render(&self) {
        if self.closed.load(Ordering::Acquire) || self.controls.paused.load(Ordering::Acquire) {
            return;
        }
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some((n + 1).min(self.max_images)));
        self.rendered.fetch_add(1, Ordering::Relaxed);

        let listener = lock(&self.listener).clone();
        if let Some(listener) = listener {
            listener();
        }
    }

    /// Frames currently leased out to consumers.
    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn frame(&self, index: u64) -> Result<RawFrame, BackendError> {
        let acquired = self.outstanding.fetch_add(1, Ordering::AcqRel);
        if acquired >= self.max_images {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            return Err(BackendError::failed(
                "acquireLatestImage",
                format!("maxImages ({}) has already been acquired", self.max_images),
            ));
        }

        let width = self.metrics.width;
        let height = self.metrics.height;
        let pixel_stride = PixelFormat::Rgba8888.bytes_per_pixel();
        let row_bytes = width * pixel_stride;
        let row_stride = row_bytes.div_ceil(ROW_ALIGN) * ROW_ALIGN;

        let shift = (index % 256) as u8;
        let mut data = vec![0u8; (row_stride * height) as usize];
        for y in 0..height {
            let row = &mut data[(y * row_stride) as usize..(y * row_stride + row_bytes) as usize];
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                px[0] = (x as u32 * 255 / width.max(1)) as u8;
                px[1] = (y * 255 / height.max(1)) as u8;
                px[2] = shift;
                px[3] = 0xFF;
            }
        }

        let outstanding = Arc::clone(&self.outstanding);
        Ok(RawFrame {
            data: Bytes::from(data),
            width,
            height,
            row_stride,
            pixel_stride,
            format: PixelFormat::Rgba8888,
            timestamp_ms: now_ms(),
            lease: Some(FrameLease::new(move || {
                outstanding.fetch_sub(1, Ordering::AcqRel);
            })),
        })
    }
}

impl FrameSource for SyntheticFrameSource {
    fn surface(&self) -> SurfaceId {
        self.surface
    }

    fn acquire_latest(&self) -> Result<Option<RawFrame>, BackendError> {
        if self.is_closed() {
            return Err(BackendError::Closed);
        }
        let delay = self.controls.acquire_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.controls.fail_acquire.load(Ordering::Relaxed) {
            return Err(BackendError::failed("acquireLatestImage", "injected failure"));
        }
        if self.is_closed() {
            return Err(BackendError::Closed);
        }
        if !self.bound.load(Ordering::Acquire) || self.controls.paused.load(Ordering::Acquire) {
            return Ok(None);
        }

        match self.production {
            FrameProduction::OnDemand => {
                let index = self.rendered.fetch_add(1, Ordering::Relaxed);
                self.frame(index).map(Some)
            }
            FrameProduction::Refresh(_) => {
                // Latest wins: everything older than the newest render is dropped.
                if self.pending.swap(0, Ordering::AcqRel) == 0 {
                    return Ok(None);
                }
                let index = self.rendered.load(Ordering::Relaxed);
                self.frame(index).map(Some)
            }
        }
    }

    fn set_frame_listener(&self, listener: Option<FrameListener>) {
        *lock(&self.listener) = listener;
    }

    fn close(&self) -> Result<(), BackendError> {
        if self.controls.fail_close.load(Ordering::Relaxed) {
            return Err(BackendError::failed("ImageReader.close", "injected failure"));
        }
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(BackendError::Closed);
        }
        *lock(&self.listener) = None;
        self.log.push(ResourceEvent::FrameSourceClosed);
        debug!("Synthetic frame source {:?} closed", self.surface);
        Ok(())
    }
}

// ── SyntheticVirtualDisplay ───────────────────────────────────────────────────

pub struct SyntheticVirtualDisplay {
    name:         String,
    source:       Arc<SyntheticFrameSource>,
    log:          ResourceLog,
    fail_release: bool,
    released:     AtomicBool,
    /// Tells the render thread to exit after its current sleep. The thread
    /// is detached and never joined, so release never waits on a refresh.
    stop:         Arc<AtomicBool>,
}

impl RenderTarget for SyntheticVirtualDisplay {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&self) -> Result<(), BackendError> {
        if self.fail_release {
            return Err(BackendError::failed("VirtualDisplay.release", "injected failure"));
        }
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(BackendError::Closed);
        }
        self.stop.store(true, Ordering::Release);
        self.source.bound.store(false, Ordering::Release);
        self.log.push(ResourceEvent::VirtualDisplayReleased);
        debug!("Synthetic virtual display '{}' released", self.name);
        Ok(())
    }
}

impl Drop for SyntheticVirtualDisplay {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

// ── SyntheticDisplay ──────────────────────────────────────────────────────────

/// Synthetic display service.
pub struct SyntheticDisplay {
    log:                  ResourceLog,
    metrics:              Mutex<Option<DisplayMetrics>>,
    production:           Mutex<FrameProduction>,
    controls:             Arc<SourceControls>,
    fail_frame_source:    AtomicBool,
    fail_virtual_display: AtomicBool,
    fail_display_release: AtomicBool,
    next_surface:         AtomicU64,
    current_source:       Mutex<Option<Arc<SyntheticFrameSource>>>,
}

impl SyntheticDisplay {
    pub fn new(metrics: DisplayMetrics, log: ResourceLog) -> Self {
        Self {
            log,
            metrics:              Mutex::new(Some(metrics)),
            production:           Mutex::new(FrameProduction::OnDemand),
            controls:             Arc::new(SourceControls::default()),
            fail_frame_source:    AtomicBool::new(false),
            fail_virtual_display: AtomicBool::new(false),
            fail_display_release: AtomicBool::new(false),
            next_surface:         AtomicU64::new(1),
            current_source:       Mutex::new(None),
        }
    }

    /// Applies to frame sources created after the call.
    pub fn set_production(&self, production: FrameProduction) {
        *lock(&self.production) = production;
    }

    pub fn set_display_present(&self, present: bool) {
        let mut metrics = lock(&self.metrics);
        match (present, metrics.is_some()) {
            (false, _) => *metrics = None,
            (true, false) => *metrics = Some(DisplayMetrics::new(720, 1280, 320)),
            (true, true) => {}
        }
    }

    /// Block every `acquire_latest` for `delay`, simulating a slow consumer.
    pub fn set_acquire_delay(&self, delay: Duration) {
        self.controls.acquire_delay_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// While paused the display renders nothing new.
    pub fn set_frames_paused(&self, paused: bool) {
        self.controls.paused.store(paused, Ordering::Release);
    }

    pub fn fail_acquire(&self, fail: bool) {
        self.controls.fail_acquire.store(fail, Ordering::Relaxed);
    }

    pub fn fail_frame_source(&self, fail: bool) {
        self.fail_frame_source.store(fail, Ordering::Relaxed);
    }

    pub fn fail_virtual_display(&self, fail: bool) {
        self.fail_virtual_display.store(fail, Ordering::Relaxed);
    }

    pub fn fail_frame_source_close(&self, fail: bool) {
        self.controls.fail_close.store(fail, Ordering::Relaxed);
    }

    pub fn fail_virtual_display_release(&self, fail: bool) {
        self.fail_display_release.store(fail, Ordering::Relaxed);
    }

    /// Most recently created frame source, if any.
    pub fn current_source(&self) -> Option<Arc<SyntheticFrameSource>> {
        lock(&self.current_source).clone()
    }
}

impl DisplayBackend for SyntheticDisplay {
    fn default_display_metrics(&self) -> Result<DisplayMetrics, BackendError> {
        (*lock(&self.metrics)).ok_or_else(|| BackendError::Unavailable("default display is null".into()))
    }

    fn create_frame_source(
        &self,
        metrics: DisplayMetrics,
        max_images: u32,
    ) -> Result<Arc<dyn FrameSource>, BackendError> {
        if self.fail_frame_source.load(Ordering::Relaxed) {
            return Err(BackendError::failed("ImageReader.newInstance", "injected failure"));
        }
        let surface = SurfaceId(self.next_surface.fetch_add(1, Ordering::Relaxed));
        let source = Arc::new(SyntheticFrameSource {
            surface,
            metrics,
            max_images,
            production:  *lock(&self.production),
            controls:    Arc::clone(&self.controls),
            log:         self.log.clone(),
            bound:       AtomicBool::new(false),
            closed:      AtomicBool::new(false),
            pending:     AtomicU32::new(0),
            outstanding: Arc::new(AtomicU32::new(0)),
            rendered:    AtomicU64::new(0),
            listener:    Mutex::new(None),
        });
        *lock(&self.current_source) = Some(Arc::clone(&source));
        self.log.push(ResourceEvent::FrameSourceCreated);
        debug!("Synthetic frame source {:?} created ({}, {} buffers)", surface, metrics, max_images);
        Ok(source)
    }

    fn create_virtual_display(
        &self,
        grant: &dyn CaptureGrant,
        name: &str,
        metrics: DisplayMetrics,
        surface: SurfaceId,
    ) -> Result<Box<dyn RenderTarget>, BackendError> {
        if self.fail_virtual_display.load(Ordering::Relaxed) {
            return Err(BackendError::failed("createVirtualDisplay", "injected failure"));
        }
        let source = self
            .current_source()
            .filter(|s| s.surface == surface && !s.is_closed())
            .ok_or_else(|| BackendError::Unavailable(format!("surface {:?} not found", surface)))?;

        let stop = Arc::new(AtomicBool::new(false));
        if let FrameProduction::Refresh(period) = source.production {
            let source = Arc::clone(&source);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("synthetic-display".into())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        std::thread::sleep(period);
                        if stop.load(Ordering::Acquire) {
                            break;
                        }
                        trace!("Synthetic display rendered frame");
                        source.render();
                    }
                })
                .map_err(|e| BackendError::failed("createVirtualDisplay", e.to_string()))?;
        }
        source.bound.store(true, Ordering::Release);

        self.log.push(ResourceEvent::VirtualDisplayCreated);
        info!("Synthetic virtual display '{}' {} ({})", name, metrics, grant.token());
        Ok(Box::new(SyntheticVirtualDisplay {
            name: name.to_owned(),
            source,
            log: self.log.clone(),
            fail_release: self.fail_display_release.load(Ordering::Relaxed),
            released: AtomicBool::new(false),
            stop,
        }))
    }
}

// ── SyntheticGrant ────────────────────────────────────────────────────────────

pub struct SyntheticGrant {
    token:      GrantToken,
    log:        ResourceLog,
    revocation: Mutex<Option<RevocationCallback>>,
    released:   AtomicBool,
}

impl SyntheticGrant {
    /// Revoke the grant out of band, as the user would from the system UI.
    /// Fires the registered callback on the calling thread.
    pub fn revoke(&self) {
        let callback = lock(&self.revocation).take();
        match callback {
            Some(cb) => {
                info!("{} revoked", self.token);
                cb();
            }
            None => debug!("{} revoked with no callback registered", self.token),
        }
    }

    pub fn has_revocation_callback(&self) -> bool {
        lock(&self.revocation).is_some()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl CaptureGrant for SyntheticGrant {
    fn token(&self) -> GrantToken {
        self.token
    }

    fn register_revocation(&self, callback: RevocationCallback) {
        *lock(&self.revocation) = Some(callback);
    }

    fn unregister_revocation(&self) {
        lock(&self.revocation).take();
    }

    fn release(&self) -> Result<(), BackendError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(BackendError::Closed);
        }
        self.log.push(ResourceEvent::GrantReleased);
        debug!("{} released", self.token);
        Ok(())
    }
}

// ── StaticGrantProvider ───────────────────────────────────────────────────────

/// How the synthetic user answers the permission prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantPolicy {
    Grant,
    Deny,
    /// The prompt could not be shown at all.
    Fail(String),
}

pub struct StaticGrantProvider {
    log:     ResourceLog,
    policy:  Mutex<GrantPolicy>,
    delay:   Mutex<Duration>,
    next_id: AtomicU64,
    issued:  Mutex<Vec<Arc<SyntheticGrant>>>,
}

impl StaticGrantProvider {
    pub fn new(policy: GrantPolicy, log: ResourceLog) -> Self {
        Self {
            log,
            policy:  Mutex::new(policy),
            delay:   Mutex::new(Duration::ZERO),
            next_id: AtomicU64::new(1),
            issued:  Mutex::new(Vec::new()),
        }
    }

    pub fn set_policy(&self, policy: GrantPolicy) {
        *lock(&self.policy) = policy;
    }

    /// Time the synthetic user takes to answer.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    /// Issue a grant without going through the prompt.
    pub fn issue(&self) -> Arc<dyn CaptureGrant> {
        self.issue_synthetic()
    }

    fn issue_synthetic(&self) -> Arc<SyntheticGrant> {
        let grant = Arc::new(SyntheticGrant {
            token:      GrantToken::new(self.next_id.fetch_add(1, Ordering::Relaxed)),
            log:        self.log.clone(),
            revocation: Mutex::new(None),
            released:   AtomicBool::new(false),
        });
        lock(&self.issued).push(Arc::clone(&grant));
        self.log.push(ResourceEvent::GrantIssued);
        grant
    }

    pub fn last_grant(&self) -> Option<Arc<SyntheticGrant>> {
        lock(&self.issued).last().cloned()
    }

    pub fn issued_count(&self) -> usize {
        lock(&self.issued).len()
    }
}

#[async_trait]
impl GrantProvider for StaticGrantProvider {
    async fn request_grant(&self) -> Result<GrantDecision, BackendError> {
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let policy = lock(&self.policy).clone();
        match policy {
            GrantPolicy::Grant => Ok(GrantDecision::Granted(self.issue_synthetic())),
            GrantPolicy::Deny => Ok(GrantDecision::Denied),
            GrantPolicy::Fail(reason) => Err(BackendError::Unavailable(reason)),
        }
    }
}

// ── LoggingForeground ─────────────────────────────────────────────────────────

/// Foreground service that records its notifications.
pub struct LoggingForeground {
    log:  ResourceLog,
    fail: AtomicBool,
}

impl LoggingForeground {
    pub fn new(log: ResourceLog) -> Self {
        Self { log, fail: AtomicBool::new(false) }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }
}

impl ForegroundService for LoggingForeground {
    fn notify_active(&self) -> Result<(), BackendError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(BackendError::failed("startForeground", "injected failure"));
        }
        self.log.push(ResourceEvent::ForegroundActive);
        Ok(())
    }

    fn notify_inactive(&self) -> Result<(), BackendError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(BackendError::failed("stopForeground", "injected failure"));
        }
        self.log.push(ResourceEvent::ForegroundInactive);
        Ok(())
    }
}

// ── SyntheticPlatform ─────────────────────────────────────────────────────────

/// Display, grant provider and foreground service sharing one resource log.
#[derive(Clone)]
pub struct SyntheticPlatform {
    pub log:        ResourceLog,
    pub display:    Arc<SyntheticDisplay>,
    pub grants:     Arc<StaticGrantProvider>,
    pub foreground: Arc<LoggingForeground>,
}

impl SyntheticPlatform {
    /// A small display that always grants.
    pub fn new() -> Self {
        Self::with_metrics(DisplayMetrics::new(64, 48, 160))
    }

    pub fn with_metrics(metrics: DisplayMetrics) -> Self {
        let log = ResourceLog::default();
        Self {
            display:    Arc::new(SyntheticDisplay::new(metrics, log.clone())),
            grants:     Arc::new(StaticGrantProvider::new(GrantPolicy::Grant, log.clone())),
            foreground: Arc::new(LoggingForeground::new(log.clone())),
            log,
        }
    }
}

impl Default for SyntheticPlatform {
    fn default() -> Self {
        Self::new()
    }
}
