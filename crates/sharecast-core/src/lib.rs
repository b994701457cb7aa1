pub mod config;
pub mod errors;
pub mod events;
pub mod types;

pub use config::EngineConfig;
pub use errors::{BackendError, CaptureError};
pub use events::{CaptureEvent, CaptureEventKind};
pub use types::*;
