use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sharecast_capture::synthetic::{FrameProduction, SyntheticPlatform};
use sharecast_core::{CaptureEvent, CaptureEventKind, DisplayMetrics, EngineConfig};
use sharecast_engine::{CaptureSession, SessionBackends, Subscription};
use tracing::{debug, info, warn};

/// Simulated display refresh period (~60 Hz).
const REFRESH: Duration = Duration::from_millis(16);

/// Demo driver on the synthetic platform.
///
/// # Environment
/// - `SHARECAST_CONFIG`: path to a JSON `EngineConfig` (snake_case or camelCase keys)
/// - `SHARECAST_INTERVAL_MS`: live-stream tick interval override
/// - `SHARECAST_DURATION_MS`: how long each cycle streams (default 2000)
/// - `SHARECAST_CYCLES`: start/stop cycles to run (default 2, max 10)
///
/// # Flow (per cycle)
/// 1. Request permission and start capture
/// 2. Live-stream for the configured duration, logging each frame
/// 3. Stop streaming, take one single-shot frame
/// 4. Full stop
pub async fn run() -> Result<()> {
    let config = load_config()?;
    let duration = Duration::from_millis(env_u64("SHARECAST_DURATION_MS").unwrap_or(2_000));
    let cycles = env_u64("SHARECAST_CYCLES").unwrap_or(2).clamp(1, 10);

    info!(
        "Engine config: {} ms interval (~{:.1} fps), 1/{} scale, {} q{}",
        config.capture_interval_ms,
        config.frames_per_second(),
        config.scale_divisor,
        config.image_format,
        config.jpeg_quality
    );

    let platform = SyntheticPlatform::with_metrics(DisplayMetrics::new(720, 1280, 320));
    platform.display.set_production(FrameProduction::Refresh(REFRESH));

    let backends = SessionBackends::new(
        platform.display.clone(),
        platform.grants.clone(),
        platform.foreground.clone(),
    );
    let session = CaptureSession::new(config, backends).context("invalid engine configuration")?;

    let frames_seen = Arc::new(AtomicU64::new(0));
    let consumer = tokio::spawn(consume_events(
        session.events().subscribe_kinds(&[
            CaptureEventKind::Started,
            CaptureEventKind::Stopped,
            CaptureEventKind::LiveStreamingStarted,
            CaptureEventKind::LiveStreamingStopped,
            CaptureEventKind::LiveFrame,
        ]),
        Arc::clone(&frames_seen),
    ));

    for cycle in 1..=cycles {
        info!("── Cycle {}/{} ──", cycle, cycles);
        let interrupted = run_cycle(&session, duration).await?;
        if interrupted {
            info!("Interrupted — stopping");
            session.stop().await?;
            break;
        }
    }

    consumer.abort();
    info!(
        "Done: {} live frames received, {} grants issued",
        frames_seen.load(Ordering::Relaxed),
        platform.grants.issued_count()
    );
    Ok(())
}

/// One start → stream → single-shot → stop cycle. Returns `true` on Ctrl-C.
async fn run_cycle(session: &CaptureSession, duration: Duration) -> Result<bool> {
    session
        .request_permission_and_start()
        .await
        .context("failed to start capture")?;
    session
        .start_live_streaming()
        .await
        .context("failed to start live streaming")?;

    let interrupted = tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        return Ok(true);
    }

    if let Some(stats) = session.snapshot().await.pipeline {
        info!("Capture loop: {}", stats);
    }
    session.stop_live_streaming().await?;

    match session.capture_single_frame().await {
        Ok(frame) => info!(
            "Single frame #{}: {}x{} {} ({} bytes, data URI {} chars)",
            frame.sequence,
            frame.width,
            frame.height,
            frame.format,
            frame.data.len(),
            frame.to_data_uri().len()
        ),
        Err(e) => warn!("Single-frame capture failed: {}", e),
    }

    session.stop().await?;
    Ok(false)
}

async fn consume_events(mut events: Subscription, frames_seen: Arc<AtomicU64>) {
    while let Some(event) = events.recv().await {
        match event {
            CaptureEvent::LiveFrame(frame) => {
                frames_seen.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "LiveFrame #{} {}x{} {} bytes (base64 {} chars)",
                    frame.sequence,
                    frame.width,
                    frame.height,
                    frame.data.len(),
                    frame.to_base64().len()
                );
            }
            other => info!("Event: {}", other.kind()),
        }
    }
}

fn load_config() -> Result<EngineConfig> {
    let mut config = match std::env::var("SHARECAST_CONFIG") {
        Ok(path) => read_config(Path::new(&path))?,
        Err(_) => EngineConfig::default(),
    };
    if let Some(ms) = env_u64("SHARECAST_INTERVAL_MS") {
        config.capture_interval_ms = ms;
    }
    config.validate().context("invalid engine configuration")?;
    Ok(config)
}

fn read_config(path: &Path) -> Result<EngineConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = serde_json::from_str(&raw)
        .with_context(|| format!("parsing config {}", path.display()))?;
    info!("Loaded engine config from {}", path.display());
    Ok(config)
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a number", key, raw);
            None
        }
    }
}
