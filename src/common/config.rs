use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::error::{FaceLinkError, Result};
use crate::service::face_api::Engine;

pub const LOGIN_ENV: &str = "HOMEFACE_LOGIN";
pub const PASSWORD_ENV: &str = "HOMEFACE_PASSWORD";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub models: ModelConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub engine: Engine,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Key of the shared credential slot.
    #[serde(default = "default_tokens_key")]
    pub tokens_key: String,
    #[serde(default = "default_store_poll")]
    pub store_poll_ms: u64,
}

fn default_base_url() -> String { "https://face.iobroker.in/".to_string() }
fn default_request_timeout() -> u64 { 30 }
fn default_tokens_key() -> String { "info.tokens".to_string() }
fn default_store_poll() -> u64 { 1000 }

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            engine: Engine::default(),
            login: String::new(),
            password: String::new(),
            request_timeout_secs: default_request_timeout(),
            tokens_key: default_tokens_key(),
            store_poll_ms: default_store_poll(),
        }
    }
}

impl ServiceConfig {
    /// Login and password, or `None` when either is blank.
    pub fn credentials(&self) -> Option<(String, String)> {
        if self.login.trim().is_empty() || self.password.is_empty() {
            None
        } else {
            Some((self.login.clone(), self.password.clone()))
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CameraConfig {
    /// 999 selects the first camera that reports video capture.
    #[serde(default)]
    pub device_index: u32,
    #[serde(default = "default_camera_width")]
    pub width: u32,
    #[serde(default = "default_camera_height")]
    pub height: u32,
    #[serde(default = "default_warmup_frames")]
    pub warmup_frames: u32,
    #[serde(default = "default_warmup_delay")]
    pub warmup_delay_ms: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_camera_width() -> u32 { 640 }
fn default_camera_height() -> u32 { 480 }
fn default_warmup_frames() -> u32 { 3 }
fn default_warmup_delay() -> u64 { 50 }
fn default_jpeg_quality() -> u8 { 90 }

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: default_camera_width(),
            height: default_camera_height(),
            warmup_frames: default_warmup_frames(),
            warmup_delay_ms: default_warmup_delay(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_detector_path")]
    pub detector_path: PathBuf,
}

fn default_detector_path() -> PathBuf { PathBuf::from("models/yolov8n-face.onnx") }

impl Default for ModelConfig {
    fn default() -> Self {
        Self { detector_path: default_detector_path() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_input")]
    pub input_width: u32,
    #[serde(default = "default_detector_input")]
    pub input_height: u32,
    /// Raw confidence floor applied after NMS. The acquisition gate is stricter.
    #[serde(default = "default_detection_confidence")]
    pub detection_confidence: f32,
}

fn default_detector_input() -> u32 { 640 }
fn default_detection_confidence() -> f32 { 0.5 }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_width: default_detector_input(),
            input_height: default_detector_input(),
            detection_confidence: default_detection_confidence(),
        }
    }
}

/// Tuning knobs of the pose acquisition gate and capture trigger.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AcquisitionConfig {
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
    #[serde(default = "default_angle_threshold")]
    pub angle_threshold: f32,
    #[serde(default = "default_min_box_height")]
    pub min_box_height: f32,
    /// Minimum change of the rounded angle, in hundredths, between captures.
    #[serde(default = "default_movement_delta")]
    pub movement_delta: i32,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_target_count")]
    pub target_count: usize,
}

fn default_score_threshold() -> f32 { 0.7 }
fn default_angle_threshold() -> f32 { 0.04 }
fn default_min_box_height() -> f32 { 150.0 }
fn default_movement_delta() -> i32 { 1 }
fn default_idle_timeout() -> u64 { 10_000 }
fn default_sample_interval() -> u64 { 100 }
fn default_target_count() -> usize { 4 }

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            score_threshold: default_score_threshold(),
            angle_threshold: default_angle_threshold(),
            min_box_height: default_min_box_height(),
            movement_delta: default_movement_delta(),
            idle_timeout_ms: default_idle_timeout(),
            sample_interval_ms: default_sample_interval(),
            target_count: default_target_count(),
        }
    }
}

impl AcquisitionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BufferConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// TTL of images ingested by the agent.
    #[serde(default = "default_ingest_ttl")]
    pub ingest_ttl_secs: u64,
}

fn default_capacity() -> usize { 4 }
fn default_ingest_ttl() -> u64 { 15 }

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            ingest_ttl_secs: default_ingest_ttl(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PerformanceConfig {
    #[serde(default = "default_optimization_level")]
    pub optimization_level: u32,
}

fn default_optimization_level() -> u32 { 3 }

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self { optimization_level: default_optimization_level() }
    }
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FaceLinkError::Other(anyhow::anyhow!(
                "Config file not found: {}. Please create it from the example.", path.display()
            )));
        }

        tracing::info!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&contents)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| FaceLinkError::Other(anyhow::anyhow!("Config parse error: {}", e)))
    }

    /// Credentials from the environment take precedence over the file.
    pub fn apply_env(&mut self) {
        if let Ok(login) = std::env::var(LOGIN_ENV) {
            if !login.trim().is_empty() {
                self.service.login = login;
            }
        }
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            if !password.is_empty() {
                self.service.password = password;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.service.base_url.starts_with("http://") && !self.service.base_url.starts_with("https://") {
            return Err(FaceLinkError::Other(anyhow::anyhow!(
                "Service base_url must be an http(s) URL, got {}", self.service.base_url
            )));
        }
        if self.service.tokens_key.trim().is_empty() {
            return Err(FaceLinkError::Other(anyhow::anyhow!("Service tokens_key must not be empty")));
        }

        if self.camera.width == 0 || self.camera.width > 4096 {
            return Err(FaceLinkError::Other(anyhow::anyhow!(
                "Camera width must be between 1 and 4096, got {}", self.camera.width
            )));
        }
        if self.camera.height == 0 || self.camera.height > 4096 {
            return Err(FaceLinkError::Other(anyhow::anyhow!(
                "Camera height must be between 1 and 4096, got {}", self.camera.height
            )));
        }
        if self.camera.jpeg_quality == 0 || self.camera.jpeg_quality > 100 {
            return Err(FaceLinkError::Other(anyhow::anyhow!(
                "JPEG quality must be between 1 and 100, got {}", self.camera.jpeg_quality
            )));
        }

        if self.detector.input_width == 0 || self.detector.input_width > 4096 {
            return Err(FaceLinkError::Other(anyhow::anyhow!(
                "Detector input width must be between 1 and 4096, got {}",
                self.detector.input_width
            )));
        }
        if self.detector.input_height == 0 || self.detector.input_height > 4096 {
            return Err(FaceLinkError::Other(anyhow::anyhow!(
                "Detector input height must be between 1 and 4096, got {}",
                self.detector.input_height
            )));
        }
        if !(0.0..=1.0).contains(&self.detector.detection_confidence) {
            return Err(FaceLinkError::Other(anyhow::anyhow!(
                "Detection confidence must be between 0.0 and 1.0, got {}",
                self.detector.detection_confidence
            )));
        }

        let acq = &self.acquisition;
        if !(0.0..=1.0).contains(&acq.score_threshold) {
            return Err(FaceLinkError::Other(anyhow::anyhow!(
                "Score threshold must be between 0.0 and 1.0, got {}", acq.score_threshold
            )));
        }
        if acq.angle_threshold < 0.0 || acq.angle_threshold > 1.0 {
            return Err(FaceLinkError::Other(anyhow::anyhow!(
                "Angle threshold must be between 0.0 and 1.0, got {}", acq.angle_threshold
            )));
        }
        if acq.movement_delta < 0 {
            return Err(FaceLinkError::Other(anyhow::anyhow!(
                "Movement delta must not be negative, got {}", acq.movement_delta
            )));
        }
        if acq.sample_interval_ms == 0 || acq.sample_interval_ms >= acq.idle_timeout_ms {
            return Err(FaceLinkError::Other(anyhow::anyhow!(
                "Sample interval must be positive and shorter than the idle timeout ({} ms / {} ms)",
                acq.sample_interval_ms, acq.idle_timeout_ms
            )));
        }
        if acq.target_count == 0 || acq.target_count > self.buffer.capacity {
            return Err(FaceLinkError::Other(anyhow::anyhow!(
                "Target count must be between 1 and the buffer capacity ({}), got {}",
                self.buffer.capacity, acq.target_count
            )));
        }

        if self.buffer.capacity == 0 || self.buffer.capacity > 32 {
            return Err(FaceLinkError::Other(anyhow::anyhow!(
                "Buffer capacity must be between 1 and 32, got {}", self.buffer.capacity
            )));
        }
        if self.buffer.ingest_ttl_secs < 3 {
            return Err(FaceLinkError::Other(anyhow::anyhow!(
                "Ingest TTL must be at least 3 seconds, got {}", self.buffer.ingest_ttl_secs
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_documented_defaults() {
        let config = Config::from_toml("").unwrap();
        config.validate().unwrap();

        assert_eq!(config.acquisition.score_threshold, 0.7);
        assert_eq!(config.acquisition.angle_threshold, 0.04);
        assert_eq!(config.acquisition.min_box_height, 150.0);
        assert_eq!(config.acquisition.movement_delta, 1);
        assert_eq!(config.acquisition.idle_timeout(), Duration::from_secs(10));
        assert_eq!(config.acquisition.sample_interval(), Duration::from_millis(100));
        assert_eq!(config.acquisition.target_count, 4);
        assert_eq!(config.buffer.capacity, 4);
        assert_eq!(config.buffer.ingest_ttl_secs, 15);
        assert_eq!(config.service.tokens_key, "info.tokens");
        assert_eq!(config.service.engine, Engine::Iobroker);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [service]
            login = "user@example.com"
            password = "Secret123"
            engine = "advanced"

            [acquisition]
            target_count = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.service.engine, Engine::Advanced);
        assert_eq!(
            config.service.credentials(),
            Some(("user@example.com".to_string(), "Secret123".to_string()))
        );
        assert_eq!(config.acquisition.target_count, 3);
        assert_eq!(config.acquisition.sample_interval_ms, 100);
    }

    #[test]
    fn blank_login_means_no_credentials() {
        let mut config = Config::default();
        config.service.password = "Secret123".to_string();
        assert_eq!(config.service.credentials(), None);
    }

    #[test]
    fn target_above_capacity_is_rejected() {
        let mut config = Config::default();
        config.acquisition.target_count = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_http_base_url_is_rejected() {
        let mut config = Config::default();
        config.service.base_url = "ftp://face.example".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn shipped_config_is_valid() {
        let config = Config::from_toml(include_str!("../../configs/homeface.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.camera.device_index, 999);
    }
}
