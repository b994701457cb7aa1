//! sharecast-engine — screen-capture session engine.
//!
//! # Pipeline
//!
//! ```text
//! GrantProvider ──► CaptureSession ──► DisplayMirror (virtual display + frame source)
//!                        │
//!                        ├─► FrameCapturePipeline ─► FrameEncoder ─► LiveFrame
//!                        └─► EventBus ─► Subscription (per consumer, filtered by kind)
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), sharecast_core::CaptureError> {
//! use sharecast_capture::synthetic::SyntheticPlatform;
//! use sharecast_core::{CaptureEvent, CaptureEventKind, EngineConfig};
//! use sharecast_engine::{CaptureSession, SessionBackends};
//!
//! let platform = SyntheticPlatform::new();
//! let backends = SessionBackends::new(
//!     platform.display.clone(),
//!     platform.grants.clone(),
//!     platform.foreground.clone(),
//! );
//! let session = CaptureSession::new(EngineConfig::default(), backends)?;
//! let mut frames = session.subscribe(CaptureEventKind::LiveFrame);
//!
//! session.request_permission_and_start().await?;
//! session.start_live_streaming().await?;
//! if let Some(CaptureEvent::LiveFrame(frame)) = frames.recv().await {
//!     println!("frame #{}: {}", frame.sequence, frame.to_data_uri().len());
//! }
//! session.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod encoder;
pub mod events;
pub mod pipeline;
pub mod session;

pub use encoder::{EncodedImage, FrameEncoder};
pub use events::{EventBus, Subscription};
pub use pipeline::{FrameCapturePipeline, PipelineStats};
pub use session::{CaptureSession, SessionBackends, SessionSnapshot};
