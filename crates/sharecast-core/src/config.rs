use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::CaptureError;
use crate::types::ImageFormat;

/// Tuning for one capture engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Live-stream tick interval. 100 ms is 10 frames per second.
    #[serde(alias = "captureIntervalMs")]
    pub capture_interval_ms: u64,
    /// Each output dimension is divided by this before encoding.
    #[serde(alias = "scaleDivisor")]
    pub scale_divisor: u32,
    /// JPEG quality, 1–100. Ignored for PNG.
    #[serde(alias = "jpegQuality")]
    pub jpeg_quality: u8,
    #[serde(alias = "imageFormat")]
    pub image_format: ImageFormat,
    /// Buffers the frame source may hand out at once.
    #[serde(alias = "maxImages")]
    pub max_images: u32,
    /// How long teardown waits for an in-flight frame before releasing the
    /// frame source anyway.
    #[serde(alias = "stopGraceMs")]
    pub stop_grace_ms: u64,
    /// Per-subscriber event queue depth.
    #[serde(alias = "eventCapacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capture_interval_ms: 100,
            scale_divisor:       2,
            jpeg_quality:        70,
            image_format:        ImageFormat::Jpeg,
            max_images:          3,
            stop_grace_ms:       500,
            event_capacity:      64,
        }
    }
}

impl EngineConfig {
    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Target frame rate implied by the tick interval.
    pub fn frames_per_second(&self) -> f64 {
        if self.capture_interval_ms == 0 {
            return 0.0;
        }
        1_000.0 / self.capture_interval_ms as f64
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        let invalid = |reason: &str| {
            Err(CaptureError::ConfigurationInvalid { reason: reason.to_owned() })
        };
        if self.capture_interval_ms == 0 {
            return invalid("capture_interval_ms must be greater than zero");
        }
        if self.scale_divisor == 0 {
            return invalid("scale_divisor must be greater than zero");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return invalid("jpeg_quality must be within 1..=100");
        }
        if self.max_images == 0 {
            return invalid("max_images must be greater than zero");
        }
        if self.event_capacity == 0 {
            return invalid("event_capacity must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_policy() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.capture_interval(), Duration::from_millis(100));
        assert_eq!(cfg.frames_per_second(), 10.0);
        assert_eq!(cfg.scale_divisor, 2);
        assert_eq!(cfg.jpeg_quality, 70);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserializes_camel_case_fields() {
        let json = r#"{
            "captureIntervalMs": 50,
            "imageFormat": "png",
            "stopGraceMs": 250
        }"#;

        let cfg: EngineConfig = serde_json::from_str(json).expect("valid camelCase config");
        assert_eq!(cfg.capture_interval_ms, 50);
        assert_eq!(cfg.image_format, ImageFormat::Png);
        assert_eq!(cfg.stop_grace_ms, 250);
        assert_eq!(cfg.scale_divisor, 2);
    }

    #[test]
    fn deserializes_snake_case_fields() {
        let json = r#"{ "capture_interval_ms": 200, "jpeg_quality": 90 }"#;

        let cfg: EngineConfig = serde_json::from_str(json).expect("valid snake_case config");
        assert_eq!(cfg.capture_interval_ms, 200);
        assert_eq!(cfg.jpeg_quality, 90);
    }

    #[test]
    fn rejects_zero_interval_and_bad_quality() {
        let cfg = EngineConfig { capture_interval_ms: 0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(CaptureError::ConfigurationInvalid { .. })));

        let cfg = EngineConfig { jpeg_quality: 0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(CaptureError::ConfigurationInvalid { .. })));
    }
}
