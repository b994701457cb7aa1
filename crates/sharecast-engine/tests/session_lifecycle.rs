//! End-to-end lifecycle tests against the synthetic platform.

use std::time::Duration;

use sharecast_capture::synthetic::{FrameProduction, GrantPolicy, ResourceEvent, SyntheticPlatform};
use sharecast_core::{CaptureError, CaptureEvent, CaptureEventKind, CaptureState, EngineConfig};
use sharecast_engine::{CaptureSession, SessionBackends, Subscription};

const WAIT: Duration = Duration::from_secs(3);

fn backends(platform: &SyntheticPlatform) -> SessionBackends {
    SessionBackends::new(
        platform.display.clone(),
        platform.grants.clone(),
        platform.foreground.clone(),
    )
}

fn session_with(platform: &SyntheticPlatform, config: EngineConfig) -> CaptureSession {
    CaptureSession::new(config, backends(platform)).unwrap()
}

fn session(platform: &SyntheticPlatform) -> CaptureSession {
    session_with(platform, EngineConfig::default())
}

fn live_sequences(events: &[CaptureEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            CaptureEvent::LiveFrame(f) => Some(f.sequence),
            _ => None,
        })
        .collect()
}

fn kinds(events: &[CaptureEvent]) -> Vec<CaptureEventKind> {
    events.iter().map(CaptureEvent::kind).filter(|k| *k != CaptureEventKind::FrameAvailable).collect()
}

/// grant token present iff capturing, mirror handles paired and matching.
async fn assert_invariants(session: &CaptureSession) {
    let snap = session.snapshot().await;
    assert_eq!(snap.grant_token.is_some(), snap.state.is_capturing(), "{snap:?}");
    assert!(snap.handles.is_paired(), "{snap:?}");
    assert_eq!(snap.handles.frame_source, snap.state.is_capturing(), "{snap:?}");
}

async fn wait_for_state(session: &CaptureSession, target: CaptureState) {
    let mut rx = session.watch_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == target))
        .await
        .expect("state transition timed out")
        .expect("session dropped");
}

async fn next_live_frame(sub: &mut Subscription) -> u64 {
    loop {
        match tokio::time::timeout(WAIT, sub.recv()).await.expect("no live frame in time") {
            Some(CaptureEvent::LiveFrame(frame)) => return frame.sequence,
            Some(_) => continue,
            None => panic!("subscription closed"),
        }
    }
}

// ── Permission ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn denied_grant_returns_to_idle_without_started() {
    let platform = SyntheticPlatform::new();
    platform.grants.set_policy(GrantPolicy::Deny);
    let session = session(&platform);
    let mut events = session.subscribe_all();

    assert_eq!(session.request_permission_and_start().await, Err(CaptureError::PermissionDenied));
    assert_eq!(session.state(), CaptureState::Idle);
    assert!(events.drain().is_empty());
    assert_invariants(&session).await;
    assert!(platform.log.events().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn state_is_permission_pending_while_user_decides() {
    let platform = SyntheticPlatform::new();
    platform.grants.set_delay(Duration::from_millis(150));
    let session = session(&platform);
    let mut events = session.subscribe_all();

    let starter = {
        let session = session.clone();
        tokio::spawn(async move { session.request_permission_and_start().await })
    };
    wait_for_state(&session, CaptureState::PermissionPending).await;
    assert!(!session.is_capturing());
    assert_eq!(session.request_permission_and_start().await, Err(CaptureError::AlreadyActive));
    assert_eq!(session.capture_single_frame().await, Err(CaptureError::NotCapturing));
    assert_invariants(&session).await;

    assert_eq!(starter.await.unwrap(), Ok(()));
    assert_eq!(kinds(&events.drain()), vec![CaptureEventKind::Started]);
    session.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_cancels_an_unanswered_permission_prompt() {
    let platform = SyntheticPlatform::new();
    platform.grants.set_delay(Duration::from_secs(10));
    let session = session(&platform);
    let mut events = session.subscribe_all();

    let starter = {
        let session = session.clone();
        tokio::spawn(async move { session.request_permission_and_start().await })
    };
    wait_for_state(&session, CaptureState::PermissionPending).await;

    tokio::time::timeout(Duration::from_millis(500), session.stop())
        .await
        .expect("stop() blocked behind the permission prompt")
        .unwrap();
    assert_eq!(session.state(), CaptureState::Idle);

    let outcome = tokio::time::timeout(WAIT, starter).await.expect("start never returned").unwrap();
    assert_eq!(outcome, Err(CaptureError::StartCancelled));
    assert!(events.drain().is_empty());
    assert_eq!(platform.grants.issued_count(), 0);
    assert!(platform.log.events().is_empty());
    assert_invariants(&session).await;

    // the session is usable again straight away
    platform.grants.set_delay(Duration::ZERO);
    session.request_permission_and_start().await.unwrap();
    assert!(session.is_capturing());
    session.stop().await.unwrap();
}

// ── Stop ──────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn double_stop_is_a_silent_noop() {
    let platform = SyntheticPlatform::new();
    let session = session(&platform);
    session.request_permission_and_start().await.unwrap();

    let mut events = session.subscribe_all();
    session.stop().await.unwrap();
    assert_eq!(kinds(&events.drain()), vec![CaptureEventKind::Stopped]);

    session.stop().await.unwrap();
    assert!(events.drain().is_empty());
    assert_eq!(session.state(), CaptureState::Idle);
    assert_eq!(platform.log.count(ResourceEvent::GrantReleased), 1);
}

#[tokio::test]
async fn stop_when_never_started_is_ok() {
    let session = session(&SyntheticPlatform::new());
    assert_eq!(session.stop().await, Ok(()));
    assert_eq!(session.state(), CaptureState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_releases_source_then_target_then_grant() {
    let platform = SyntheticPlatform::new();
    let session = session_with(&platform, EngineConfig { capture_interval_ms: 10, ..Default::default() });
    session.request_permission_and_start().await.unwrap();
    session.start_live_streaming().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut events = session.subscribe_all();
    session.stop().await.unwrap();

    let released: Vec<_> = platform.log.events().into_iter().filter(ResourceEvent::is_release).collect();
    assert_eq!(
        released,
        vec![
            ResourceEvent::FrameSourceClosed,
            ResourceEvent::VirtualDisplayReleased,
            ResourceEvent::GrantReleased,
        ]
    );
    assert_eq!(platform.log.events().last(), Some(&ResourceEvent::ForegroundInactive));

    let tail: Vec<_> = kinds(&events.drain())
        .into_iter()
        .filter(|k| *k != CaptureEventKind::LiveFrame)
        .collect();
    assert_eq!(tail, vec![CaptureEventKind::LiveStreamingStopped, CaptureEventKind::Stopped]);

    let snap = session.snapshot().await;
    assert!(!snap.handles.render_target && !snap.handles.frame_source);
    assert_eq!(platform.display.current_source().unwrap().outstanding(), 0);
}

#[tokio::test]
async fn failing_release_step_still_reaches_idle() {
    let platform = SyntheticPlatform::new();
    let session = session(&platform);
    session.request_permission_and_start().await.unwrap();

    platform.display.fail_frame_source_close(true);
    assert_eq!(session.stop().await, Ok(()));
    assert_eq!(session.state(), CaptureState::Idle);

    let events = platform.log.events();
    assert!(!events.contains(&ResourceEvent::FrameSourceClosed));
    assert!(events.contains(&ResourceEvent::VirtualDisplayReleased));
    assert!(events.contains(&ResourceEvent::GrantReleased));
    assert_invariants(&session).await;
}

// ── Setup failures ────────────────────────────────────────────────────────────

#[tokio::test]
async fn setup_failure_leaves_nothing_acquired() {
    let platform = SyntheticPlatform::new();
    platform.display.fail_virtual_display(true);
    let session = session(&platform);
    let mut events = session.subscribe_all();

    assert!(matches!(
        session.request_permission_and_start().await,
        Err(CaptureError::SetupFailed { .. })
    ));
    assert_eq!(session.state(), CaptureState::Idle);
    assert!(events.drain().is_empty());
    assert_invariants(&session).await;

    let log = platform.log.events();
    assert_eq!(
        platform.log.count(ResourceEvent::FrameSourceCreated),
        platform.log.count(ResourceEvent::FrameSourceClosed)
    );
    assert!(log.contains(&ResourceEvent::GrantReleased));
    assert_eq!(log.last(), Some(&ResourceEvent::ForegroundInactive));
    assert!(!platform.grants.last_grant().unwrap().has_revocation_callback());

    // recovers once the display works again
    platform.display.fail_virtual_display(false);
    session.request_permission_and_start().await.unwrap();
    assert!(session.is_capturing());
    session.stop().await.unwrap();
}

#[tokio::test]
async fn missing_display_is_unavailable_and_releases_grant() {
    let platform = SyntheticPlatform::new();
    platform.display.set_display_present(false);
    let session = session(&platform);

    assert!(matches!(
        session.request_permission_and_start().await,
        Err(CaptureError::DisplayUnavailable { .. })
    ));
    assert_eq!(session.state(), CaptureState::Idle);
    assert!(platform.grants.last_grant().unwrap().is_released());
    assert_eq!(platform.log.count(ResourceEvent::FrameSourceCreated), 0);
}

#[tokio::test]
async fn foreground_failure_is_not_fatal() {
    let platform = SyntheticPlatform::new();
    platform.foreground.set_failing(true);
    let session = session(&platform);

    session.request_permission_and_start().await.unwrap();
    assert!(session.is_capturing());
    session.stop().await.unwrap();
    assert_eq!(session.state(), CaptureState::Idle);
}

// ── Live streaming ────────────────────────────────────────────────────────────

#[tokio::test]
async fn second_start_live_streaming_is_rejected_and_state_kept() {
    let platform = SyntheticPlatform::new();
    let session = session(&platform);
    session.request_permission_and_start().await.unwrap();
    session.start_live_streaming().await.unwrap();

    assert_eq!(session.start_live_streaming().await, Err(CaptureError::AlreadyStreaming));
    assert_eq!(session.state(), CaptureState::LiveStreaming);
    assert!(session.is_live_streaming());
    assert_invariants(&session).await;

    session.stop_live_streaming().await.unwrap();
    session.stop_live_streaming().await.unwrap();
    assert_eq!(session.state(), CaptureState::Capturing);
    session.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ten_ticks_yield_at_most_ten_frames_numbered_from_one() {
    let platform = SyntheticPlatform::new();
    let session = session(&platform);
    let mut frames = session.subscribe(CaptureEventKind::LiveFrame);

    session.request_permission_and_start().await.unwrap();
    session.start_live_streaming().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_050)).await;
    session.stop_live_streaming().await.unwrap();

    let seqs = live_sequences(&frames.drain());
    assert!(!seqs.is_empty());
    assert!(seqs.len() <= 10, "{} frames", seqs.len());
    assert_eq!(seqs[0], 1);
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));

    session.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_frames_are_dropped_not_queued() {
    let platform = SyntheticPlatform::new();
    platform.display.set_acquire_delay(Duration::from_millis(40));
    let session = session_with(&platform, EngineConfig { capture_interval_ms: 10, ..Default::default() });
    let mut frames = session.subscribe(CaptureEventKind::LiveFrame);

    session.request_permission_and_start().await.unwrap();
    session.start_live_streaming().await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let stats = session.snapshot().await.pipeline.expect("pipeline running");
    assert!(stats.frames_dropped > 0, "{stats}");
    session.stop().await.unwrap();

    let seqs = live_sequences(&frames.drain());
    assert!(!seqs.is_empty());
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{seqs:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn per_frame_failures_do_not_halt_the_stream() {
    let platform = SyntheticPlatform::new();
    let session = session_with(&platform, EngineConfig { capture_interval_ms: 10, ..Default::default() });
    let mut frames = session.subscribe(CaptureEventKind::LiveFrame);

    session.request_permission_and_start().await.unwrap();
    platform.display.fail_acquire(true);
    session.start_live_streaming().await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(session.is_live_streaming());
    assert!(frames.drain().is_empty());

    platform.display.fail_acquire(false);
    next_live_frame(&mut frames).await;

    let stats = session.snapshot().await.pipeline.unwrap();
    assert!(stats.failures > 0, "{stats}");
    session.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_frames_decode_as_jpeg_at_half_size() {
    let platform = SyntheticPlatform::new();
    let session = session_with(&platform, EngineConfig { capture_interval_ms: 10, ..Default::default() });
    let mut frames = session.subscribe(CaptureEventKind::LiveFrame);

    session.request_permission_and_start().await.unwrap();
    session.start_live_streaming().await.unwrap();

    let frame = loop {
        match tokio::time::timeout(WAIT, frames.recv()).await.unwrap() {
            Some(CaptureEvent::LiveFrame(frame)) => break frame,
            other => panic!("unexpected {other:?}"),
        }
    };
    session.stop().await.unwrap();

    assert_eq!((frame.width, frame.height), (32, 24));
    assert_eq!(&frame.data[..2], &[0xFF, 0xD8]);
    assert!(frame.to_data_uri().starts_with("data:image/jpeg;base64,/9j/"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_frame_while_streaming_shares_the_sequence() {
    let platform = SyntheticPlatform::new();
    let session = session_with(&platform, EngineConfig { capture_interval_ms: 10, ..Default::default() });
    let mut frames = session.subscribe(CaptureEventKind::LiveFrame);

    session.request_permission_and_start().await.unwrap();
    session.start_live_streaming().await.unwrap();
    let live = next_live_frame(&mut frames).await;

    // a tick may hold the frame slot at any instant
    let mut single = None;
    for _ in 0..200 {
        match session.capture_single_frame().await {
            Ok(frame) => {
                single = Some(frame);
                break;
            }
            Err(CaptureError::CaptureFailed { .. }) => tokio::time::sleep(Duration::from_millis(1)).await,
            Err(e) => panic!("unexpected {e:?}"),
        }
    }
    let single = single.expect("single frame never got a turn").sequence;
    assert!(single > live, "single #{single} after live #{live}");
    assert!(session.is_live_streaming());

    loop {
        let next = next_live_frame(&mut frames).await;
        assert_ne!(next, single, "single-shot frame leaked into the stream");
        if next > single {
            break;
        }
    }
    session.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_frame_fails_while_a_tick_is_in_flight() {
    let platform = SyntheticPlatform::new();
    platform.display.set_acquire_delay(Duration::from_millis(300));
    let session = session_with(&platform, EngineConfig { capture_interval_ms: 10, ..Default::default() });

    session.request_permission_and_start().await.unwrap();
    session.start_live_streaming().await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let started = std::time::Instant::now();
    assert!(matches!(
        session.capture_single_frame().await,
        Err(CaptureError::CaptureFailed { .. })
    ));
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(session.state(), CaptureState::LiveStreaming);
    assert_invariants(&session).await;

    session.stop().await.unwrap();
    assert_eq!(session.state(), CaptureState::Idle);
}

// ── Revocation ────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn revocation_while_streaming_stops_everything() {
    let platform = SyntheticPlatform::new();
    let session = session_with(&platform, EngineConfig { capture_interval_ms: 10, ..Default::default() });
    let mut events = session.subscribe_all();

    session.request_permission_and_start().await.unwrap();
    session.start_live_streaming().await.unwrap();
    next_live_frame(&mut events).await;

    platform.grants.last_grant().unwrap().revoke();
    wait_for_state(&session, CaptureState::Idle).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let after: Vec<_> = events.drain();
    let stopped_at = after
        .iter()
        .position(|e| *e == CaptureEvent::Stopped)
        .expect("Stopped emitted");
    assert!(after[stopped_at + 1..].iter().all(|e| e.kind() != CaptureEventKind::LiveFrame));
    assert_eq!(after[..stopped_at].last(), Some(&CaptureEvent::LiveStreamingStopped));

    assert_invariants(&session).await;
    assert_eq!(platform.log.count(ResourceEvent::GrantReleased), 1);
    assert!(session.capture_single_frame().await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn revocation_racing_stop_tears_down_once() {
    let platform = SyntheticPlatform::new();
    let session = session(&platform);
    let mut stopped = session.subscribe(CaptureEventKind::Stopped);
    session.request_permission_and_start().await.unwrap();

    let grant = platform.grants.last_grant().unwrap();
    let revoker = std::thread::spawn(move || grant.revoke());
    session.stop().await.unwrap();
    revoker.join().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(session.state(), CaptureState::Idle);
    assert_eq!(stopped.drain().len(), 1);
    assert_eq!(platform.log.count(ResourceEvent::FrameSourceClosed), 1);
    assert_eq!(platform.log.count(ResourceEvent::GrantReleased), 1);
}

#[tokio::test]
async fn stale_revocation_does_not_stop_the_next_session() {
    let platform = SyntheticPlatform::new();
    let session = session(&platform);

    session.request_permission_and_start().await.unwrap();
    let first = platform.grants.last_grant().unwrap();
    session.stop().await.unwrap();

    session.request_permission_and_start().await.unwrap();
    first.revoke();
    tokio::task::yield_now().await;
    assert!(session.is_capturing());
    session.stop().await.unwrap();
}

// ── Cycling ───────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_stop_cycles_do_not_leak() {
    const CYCLES: usize = 5;
    let platform = SyntheticPlatform::new();
    platform.display.set_production(FrameProduction::Refresh(Duration::from_millis(5)));
    let session = session_with(&platform, EngineConfig { capture_interval_ms: 10, ..Default::default() });
    let mut frames = session.subscribe(CaptureEventKind::LiveFrame);

    for _ in 0..CYCLES {
        session.request_permission_and_start().await.unwrap();
        assert_invariants(&session).await;
        session.start_live_streaming().await.unwrap();
        assert_eq!(next_live_frame(&mut frames).await, 1);
        session.stop().await.unwrap();
        assert_invariants(&session).await;
        frames.drain();
    }

    assert_eq!(platform.grants.issued_count(), CYCLES);
    for event in [
        ResourceEvent::FrameSourceCreated,
        ResourceEvent::FrameSourceClosed,
        ResourceEvent::VirtualDisplayCreated,
        ResourceEvent::VirtualDisplayReleased,
        ResourceEvent::GrantReleased,
    ] {
        assert_eq!(platform.log.count(event), CYCLES, "{event:?}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refresh_display_reports_frame_available() {
    let platform = SyntheticPlatform::new();
    platform.display.set_production(FrameProduction::Refresh(Duration::from_millis(5)));
    let session = session(&platform);
    let mut available = session.subscribe(CaptureEventKind::FrameAvailable);

    session.request_permission_and_start().await.unwrap();
    let event = tokio::time::timeout(WAIT, available.recv()).await.unwrap();
    assert_eq!(event, Some(CaptureEvent::FrameAvailable));
    session.stop().await.unwrap();

    available.drain();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(available.drain().is_empty());
}

// ── Call sequences ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Op {
    Start,
    Stop,
    StartLive,
    StopLive,
}

const OPS: [Op; 4] = [Op::Start, Op::Stop, Op::StartLive, Op::StopLive];
const SEQUENCE_LEN: u32 = 4;

/// Result and resulting state of `op` from a settled `state`.
fn expected(state: CaptureState, op: Op) -> (Result<(), CaptureError>, CaptureState) {
    use CaptureState::*;
    match (op, state) {
        (Op::Start, Idle) => (Ok(()), Capturing),
        (Op::Start, s) => (Err(CaptureError::AlreadyActive), s),
        (Op::Stop, _) => (Ok(()), Idle),
        (Op::StartLive, Capturing) => (Ok(()), LiveStreaming),
        (Op::StartLive, LiveStreaming) => (Err(CaptureError::AlreadyStreaming), LiveStreaming),
        (Op::StartLive, s) => (Err(CaptureError::NotCapturing), s),
        (Op::StopLive, LiveStreaming) => (Ok(()), Capturing),
        (Op::StopLive, s) => (Ok(()), s),
    }
}

async fn apply(session: &CaptureSession, op: Op) -> Result<(), CaptureError> {
    match op {
        Op::Start => session.request_permission_and_start().await,
        Op::Stop => session.stop().await,
        Op::StartLive => session.start_live_streaming().await,
        Op::StopLive => session.stop_live_streaming().await,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_call_sequence_keeps_state_and_token_consistent() {
    let ops = OPS.len();
    for index in 0..ops.pow(SEQUENCE_LEN) {
        let sequence: Vec<Op> = (0..SEQUENCE_LEN)
            .map(|digit| OPS[index / ops.pow(digit) % ops])
            .collect();

        let platform = SyntheticPlatform::new();
        let session = session_with(&platform, EngineConfig { capture_interval_ms: 5, ..Default::default() });
        let mut state = CaptureState::Idle;

        for (step, op) in sequence.iter().enumerate() {
            let (want, next) = expected(state, *op);
            let got = apply(&session, *op).await;
            assert_eq!(got, want, "{sequence:?} step {step}");
            assert_eq!(session.state(), next, "{sequence:?} step {step}");
            assert_invariants(&session).await;
            state = next;
        }

        session.stop().await.unwrap();
        assert_invariants(&session).await;
        assert_eq!(
            platform.log.count(ResourceEvent::GrantReleased),
            platform.grants.issued_count(),
            "{sequence:?}"
        );
        assert_eq!(
            platform.log.count(ResourceEvent::FrameSourceCreated),
            platform.log.count(ResourceEvent::FrameSourceClosed),
            "{sequence:?}"
        );
    }
}
