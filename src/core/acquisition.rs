use std::fmt;

use tokio::time::Instant;

use crate::common::config::AcquisitionConfig;
use crate::common::{FaceLinkError, Result};
use crate::core::quality::{assess, DetectionSample, Guidance};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    Sampling,
    /// Sampling with automatic capture armed.
    Capturing,
    Complete,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AcquisitionState::Idle => "idle",
            AcquisitionState::Sampling => "sampling",
            AcquisitionState::Capturing => "capturing",
            AcquisitionState::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Outcome of one detection pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// The sample failed the gate.
    Guide(Guidance),
    /// Qualifies, but capture is not armed.
    Ready,
    /// Qualifies, but the head has not moved enough since the last capture.
    AwaitingMovement,
    /// Take a snapshot. `angle` is the rounded angle in hundredths.
    Capture { angle: i32 },
    /// Armed too long without a capture; capture was disarmed.
    TimedOut,
}

impl Decision {
    pub fn message(&self) -> &'static str {
        match self {
            Decision::Guide(guidance) => guidance.message(),
            Decision::Ready => "Hold still, ready to capture",
            Decision::AwaitingMovement => "Move head slightly",
            Decision::Capture { .. } => "Captured",
            Decision::TimedOut => "No movement detected, capture stopped",
        }
    }
}

/// Pose acquisition state machine.
///
/// Holds no timers or I/O. The driver feeds it samples with the time they
/// were taken and reports back how many images the buffer holds.
#[derive(Debug)]
pub struct PoseAcquisition {
    config: AcquisitionConfig,
    state: AcquisitionState,
    last_angle: Option<i32>,
    last_attempt: Option<Instant>,
}

impl PoseAcquisition {
    pub fn new(config: AcquisitionConfig) -> Self {
        Self {
            config,
            state: AcquisitionState::Idle,
            last_angle: None,
            last_attempt: None,
        }
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        self.state == AcquisitionState::Capturing
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// The frame source is live.
    pub fn on_stream_ready(&mut self) {
        if self.state == AcquisitionState::Idle {
            self.state = AcquisitionState::Sampling;
        }
    }

    /// Starts automatic capture. Re-arming after completion starts a new
    /// round; the caller is expected to have cleared the buffer.
    pub fn arm(&mut self, now: Instant) -> Result<()> {
        match self.state {
            AcquisitionState::Sampling | AcquisitionState::Complete => {
                self.state = AcquisitionState::Capturing;
                self.last_angle = None;
                self.last_attempt = Some(now);
                Ok(())
            }
            AcquisitionState::Capturing => Ok(()),
            AcquisitionState::Idle => Err(FaceLinkError::Acquisition(
                "cannot arm capture before the camera is ready".into(),
            )),
        }
    }

    pub fn disarm(&mut self) {
        if self.state == AcquisitionState::Capturing {
            self.state = AcquisitionState::Sampling;
        }
        self.last_attempt = None;
    }

    /// Teardown.
    pub fn reset(&mut self) {
        self.state = AcquisitionState::Idle;
        self.last_angle = None;
        self.last_attempt = None;
    }

    /// Evaluates one sample. `None` means no usable face in the frame.
    pub fn observe(&mut self, sample: Option<&DetectionSample>, now: Instant) -> Decision {
        if self.is_armed() {
            if let Some(since) = self.last_attempt {
                if now.saturating_duration_since(since) >= self.config.idle_timeout() {
                    tracing::info!("No capture for {:?}, disarming", self.config.idle_timeout());
                    self.disarm();
                    return Decision::TimedOut;
                }
            }
        }

        let Some(sample) = sample else {
            return Decision::Guide(Guidance::NoFace);
        };
        if let Err(guidance) = assess(sample, &self.config) {
            return Decision::Guide(guidance);
        }
        if !self.is_armed() {
            return Decision::Ready;
        }

        let angle = (sample.horizontal_angle_ratio * 100.0).round() as i32;
        let moved = match self.last_angle {
            None => true,
            Some(last) => (angle - last).abs() > self.config.movement_delta,
        };
        if !moved {
            return Decision::AwaitingMovement;
        }

        Decision::Capture { angle }
    }

    /// Marks a `Capture` decision as stored. Until then the same angle keeps
    /// qualifying and the idle timer keeps running.
    pub fn commit_capture(&mut self, angle: i32, now: Instant) {
        if self.is_armed() {
            self.last_angle = Some(angle);
            self.last_attempt = Some(now);
        }
    }

    /// Reports the buffer size after a capture. Returns `true` once the
    /// target is reached, which also disarms.
    pub fn record_capture(&mut self, count: usize) -> bool {
        if count >= self.config.target_count && self.state != AcquisitionState::Idle {
            self.state = AcquisitionState::Complete;
            self.last_attempt = None;
            return true;
        }
        false
    }
}
