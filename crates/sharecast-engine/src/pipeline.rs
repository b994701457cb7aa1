//! Periodic live-frame capture loop.
//!
//! # Per tick
//!
//! ```text
//! timer tick
//!   ├─ processing flag already held? → drop the tick (backpressure)
//!   └─ spawn_blocking:
//!        acquire_latest()  ── none buffered → skip
//!        encode (downscale + JPEG/PNG)
//!        release raw buffer
//!        stamp next sequence number
//!        emit LiveFrame (unless cancelled)
//! ```
//!
//! The timer never queues work: at most one frame is being acquired or
//! encoded at any instant, whether it was started by a tick or by a
//! single-shot capture.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sharecast_capture::FrameSource;
use sharecast_core::{CaptureError, CaptureEvent, EncodedFrame};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::encoder::FrameEncoder;
use crate::events::EventSink;

/// How often `stop` re-checks the processing flag while waiting out an
/// in-flight frame.
const FLAG_POLL: Duration = Duration::from_millis(2);

// ── Processing flag ───────────────────────────────────────────────────────────

#[derive(Default)]
struct FlagState {
    /// Epoch of the current holder; 0 when free.
    holder:     AtomicU64,
    next_epoch: AtomicU64,
}

/// Non-reentrant "a frame is being processed" flag.
///
/// Every claim gets its own epoch, so a guard only ever releases the claim
/// it made. A guard that outlives a forced [`clear`](Self::clear) cannot
/// free a later holder's claim.
#[derive(Clone, Default)]
pub(crate) struct ProcessingFlag(Arc<FlagState>);

impl ProcessingFlag {
    /// Claim the flag. `None` if another frame is already in flight.
    pub(crate) fn try_begin(&self) -> Option<ProcessingGuard> {
        let epoch = self.0.next_epoch.fetch_add(1, Ordering::Relaxed) + 1;
        self.0
            .holder
            .compare_exchange(0, epoch, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ProcessingGuard { state: Arc::clone(&self.0), epoch })
    }

    pub(crate) fn is_set(&self) -> bool {
        self.0.holder.load(Ordering::Acquire) != 0
    }

    /// Force the flag clear, abandoning whichever claim holds it.
    pub(crate) fn clear(&self) {
        self.0.holder.store(0, Ordering::Release);
    }
}

/// Holding this is the only way to run [`FrameGrabber::grab`]. Releases its
/// own claim on drop.
pub(crate) struct ProcessingGuard {
    state: Arc<FlagState>,
    epoch: u64,
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        let _ = self.state.holder.compare_exchange(
            self.epoch,
            0,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }
}

// ── Cancellation gate ─────────────────────────────────────────────────────────

/// Once `cancel` returns, no further `LiveFrame` gets past the gate.
#[derive(Default)]
pub(crate) struct CancelGate {
    cancelled: AtomicBool,
    emit_lock: Mutex<()>,
}

impl CancelGate {
    pub(crate) fn cancel(&self) {
        let _held = self.emit_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Run `emit` unless cancelled. Returns whether it ran.
    pub(crate) fn emit_if_open(&self, emit: impl FnOnce()) -> bool {
        let _held = self.emit_lock.lock().unwrap_or_else(|p| p.into_inner());
        if self.is_cancelled() {
            return false;
        }
        emit();
        true
    }
}

// ── FrameGrabber ──────────────────────────────────────────────────────────────

pub(crate) enum GrabOutcome {
    Frame(EncodedFrame),
    /// Nothing new was buffered.
    Empty,
    Cancelled,
}

/// Acquire-encode-stamp for one frame. Shared by the live loop and
/// single-shot capture so both draw from the same sequence and flag.
#[derive(Clone)]
pub(crate) struct FrameGrabber {
    source:   Arc<dyn FrameSource>,
    encoder:  FrameEncoder,
    flag:     ProcessingFlag,
    sequence: Arc<AtomicU64>,
}

impl FrameGrabber {
    /// Fresh grabber for a new session: sequence restarts at zero.
    pub(crate) fn new(source: Arc<dyn FrameSource>, encoder: FrameEncoder) -> Self {
        Self {
            source,
            encoder,
            flag:     ProcessingFlag::default(),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn try_begin(&self) -> Option<ProcessingGuard> {
        self.flag.try_begin()
    }

    pub(crate) fn flag(&self) -> ProcessingFlag {
        self.flag.clone()
    }

    /// Last sequence number handed out.
    pub(crate) fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Blocking. The raw buffer goes back to the source before this returns,
    /// whether or not encoding succeeded.
    pub(crate) fn grab(
        &self,
        _guard: &ProcessingGuard,
        gate: Option<&CancelGate>,
    ) -> Result<GrabOutcome, CaptureError> {
        let cancelled = || gate.map_or(false, CancelGate::is_cancelled);

        if cancelled() {
            return Ok(GrabOutcome::Cancelled);
        }

        let raw = self
            .source
            .acquire_latest()
            .map_err(|e| CaptureError::CaptureFailed { reason: e.to_string() })?;
        let Some(raw) = raw else {
            return Ok(GrabOutcome::Empty);
        };

        let timestamp_ms = raw.timestamp_ms;
        let encoded = self.encoder.encode(&raw);
        raw.release();
        let image = encoded?;

        if cancelled() {
            return Ok(GrabOutcome::Cancelled);
        }

        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(GrabOutcome::Frame(EncodedFrame {
            data: image.data,
            format: image.format,
            sequence,
            timestamp_ms,
            width: image.width,
            height: image.height,
        }))
    }
}

// ── Stats ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct PipelineCounters {
    ticks:         AtomicU64,
    emitted:       AtomicU64,
    dropped:       AtomicU64,
    skipped_empty: AtomicU64,
    failures:      AtomicU64,
}

/// Counters for one live-streaming run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub ticks:                u64,
    pub frames_emitted:       u64,
    /// Ticks dropped because the previous frame was still in flight.
    pub frames_dropped:       u64,
    pub frames_skipped_empty: u64,
    /// Acquire or encode failures; each one is logged and skipped.
    pub failures:             u64,
}

impl std::fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ticks, {} emitted, {} dropped, {} empty, {} failed",
            self.ticks,
            self.frames_emitted,
            self.frames_dropped,
            self.frames_skipped_empty,
            self.failures
        )
    }
}

// ── FrameCapturePipeline ──────────────────────────────────────────────────────

/// A running live-stream loop. Dropping it cancels the loop without waiting.
pub struct FrameCapturePipeline {
    interval: Duration,
    grace:    Duration,
    gate:     Arc<CancelGate>,
    flag:     ProcessingFlag,
    counters: Arc<PipelineCounters>,
    stop_tx:  Option<oneshot::Sender<()>>,
    timer:    Option<JoinHandle<()>>,
}

impl FrameCapturePipeline {
    /// Spawn the timer task. The first tick fires one `interval` from now.
    pub(crate) fn start(
        grabber: FrameGrabber,
        interval: Duration,
        grace: Duration,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, CaptureError> {
        if interval.is_zero() {
            return Err(CaptureError::ConfigurationInvalid {
                reason: "capture interval must be greater than zero".into(),
            });
        }

        let gate = Arc::new(CancelGate::default());
        let counters = Arc::new(PipelineCounters::default());
        let flag = grabber.flag();
        let (stop_tx, stop_rx) = oneshot::channel();

        let timer = tokio::spawn(run_timer(
            grabber,
            interval,
            Arc::clone(&gate),
            Arc::clone(&counters),
            sink,
            stop_rx,
        ));

        info!("Live capture loop started ({:?} interval)", interval);
        Ok(Self {
            interval,
            grace,
            gate,
            flag,
            counters,
            stop_tx: Some(stop_tx),
            timer: Some(timer),
        })
    }

    /// Cancel future ticks, then wait up to the grace period for an
    /// in-flight frame to finish. Idempotent.
    pub async fn stop(&mut self) {
        self.gate.cancel();
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let Some(timer) = self.timer.take() else {
            return;
        };
        if let Err(e) = timer.await {
            if !e.is_cancelled() {
                warn!("Capture timer task ended abnormally: {}", e);
            }
        }

        if self.flag.is_set() {
            debug!("Waiting up to {:?} for in-flight frame", self.grace);
            let flag = self.flag.clone();
            let drained = tokio::time::timeout(self.grace, async move {
                while flag.is_set() {
                    tokio::time::sleep(FLAG_POLL).await;
                }
            })
            .await;
            if drained.is_err() {
                warn!(
                    "In-flight frame still processing after {:?} — clearing flag, its result will be discarded",
                    self.grace
                );
                self.flag.clear();
            }
        }

        info!("Live capture loop stopped ({})", self.stats());
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_some() && !self.gate.is_cancelled()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            ticks:                c.ticks.load(Ordering::Relaxed),
            frames_emitted:       c.emitted.load(Ordering::Relaxed),
            frames_dropped:       c.dropped.load(Ordering::Relaxed),
            frames_skipped_empty: c.skipped_empty.load(Ordering::Relaxed),
            failures:             c.failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for FrameCapturePipeline {
    fn drop(&mut self) {
        self.gate.cancel();
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

async fn run_timer(
    grabber: FrameGrabber,
    interval: Duration,
    gate: Arc<CancelGate>,
    counters: Arc<PipelineCounters>,
    sink: Arc<dyn EventSink>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            _ = ticker.tick() => {}
        }
        if gate.is_cancelled() {
            break;
        }
        counters.ticks.fetch_add(1, Ordering::Relaxed);

        let Some(guard) = grabber.try_begin() else {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("Tick dropped: previous frame still in flight");
            continue;
        };

        let grabber = grabber.clone();
        let gate = Arc::clone(&gate);
        let counters = Arc::clone(&counters);
        let sink = Arc::clone(&sink);
        tokio::task::spawn_blocking(move || run_tick(&grabber, guard, &gate, &counters, sink.as_ref()));
    }
    debug!("Capture timer exited");
}

fn run_tick(
    grabber: &FrameGrabber,
    guard: ProcessingGuard,
    gate: &CancelGate,
    counters: &PipelineCounters,
    sink: &dyn EventSink,
) {
    match grabber.grab(&guard, Some(gate)) {
        Ok(GrabOutcome::Frame(frame)) => {
            let sequence = frame.sequence;
            let bytes = frame.data.len();
            if gate.emit_if_open(|| sink.emit(CaptureEvent::LiveFrame(frame))) {
                counters.emitted.fetch_add(1, Ordering::Relaxed);
                trace!("LiveFrame #{} emitted ({} bytes)", sequence, bytes);
            } else {
                debug!("LiveFrame #{} discarded: loop cancelled", sequence);
            }
        }
        Ok(GrabOutcome::Empty) => {
            counters.skipped_empty.fetch_add(1, Ordering::Relaxed);
        }
        Ok(GrabOutcome::Cancelled) => {}
        Err(e) => {
            counters.failures.fetch_add(1, Ordering::Relaxed);
            warn!("Live frame failed, stream continues: {}", e);
        }
    }
    drop(guard);
}
