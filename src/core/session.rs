use std::sync::{Arc, Mutex, PoisonError};

use image::DynamicImage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::camera::snapshot::encode_portrait_data_uri;
use crate::camera::FrameSource;
use crate::common::config::AcquisitionConfig;
use crate::common::{FaceLinkError, Result};
use crate::core::acquisition::{AcquisitionState, Decision, PoseAcquisition};
use crate::core::buffer::CaptureBuffer;
use crate::core::detector::{DetectFaces, FaceBox};
use crate::core::quality::DetectionSample;

const EVENT_QUEUE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Arm,
    Disarm,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(AcquisitionState),
    /// One detection pass. `frame` is missing when the source failed.
    Sampled {
        frame: Option<Arc<DynamicImage>>,
        face: Option<FaceBox>,
        decision: Decision,
        captured: usize,
    },
    Captured { count: usize },
    TimedOut,
    Complete { count: usize },
    /// The source never became ready.
    Failed(String),
    Stopped,
}

struct Inputs {
    source: Box<dyn FrameSource>,
    detector: Box<dyn DetectFaces>,
}

/// Control side of a running acquisition loop. Dropping it stops the loop.
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    events: mpsc::Receiver<SessionEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    _guard: DropGuard,
}

impl SessionHandle {
    pub async fn arm(&self) -> Result<()> {
        self.send(SessionCommand::Arm).await
    }

    pub async fn disarm(&self) -> Result<()> {
        self.send(SessionCommand::Disarm).await
    }

    async fn send(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| FaceLinkError::Acquisition("acquisition loop has stopped".into()))
    }

    /// `None` once the loop has exited and every event was read.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Cancels the loop and waits until the source is released. Events not
    /// read yet are discarded.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        self.events.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Acquisition task ended abnormally: {}", e);
            }
        }
    }
}

/// Drives [`PoseAcquisition`] from a frame source and a detector.
pub struct AcquisitionSession {
    machine: PoseAcquisition,
    inputs: Arc<Mutex<Inputs>>,
    buffer: CaptureBuffer,
    jpeg_quality: u8,
    commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
}

impl AcquisitionSession {
    pub fn spawn(
        source: Box<dyn FrameSource>,
        detector: Box<dyn DetectFaces>,
        buffer: CaptureBuffer,
        config: AcquisitionConfig,
        jpeg_quality: u8,
    ) -> SessionHandle {
        let (command_tx, command_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let cancel = CancellationToken::new();

        let session = Self {
            machine: PoseAcquisition::new(config),
            inputs: Arc::new(Mutex::new(Inputs { source, detector })),
            buffer,
            jpeg_quality,
            commands: command_rx,
            events: event_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(session.run());

        SessionHandle {
            commands: command_tx,
            events: event_rx,
            cancel: cancel.clone(),
            task: Some(task),
            _guard: cancel.drop_guard(),
        }
    }

    /// Per-frame samples are dropped when the consumer lags behind. State
    /// and lifecycle events wait for room in the queue.
    async fn emit(&mut self, event: SessionEvent) {
        if matches!(event, SessionEvent::Sampled { .. }) {
            if let Err(e) = self.events.try_send(event) {
                tracing::trace!("Dropped acquisition sample: {}", e);
            }
        } else if self.events.send(event).await.is_err() {
            tracing::trace!("Acquisition events no longer read");
        }
    }

    async fn run(mut self) {
        let inputs = Arc::clone(&self.inputs);
        let ready = tokio::select! {
            _ = self.cancel.cancelled() => None,
            ready = tokio::task::spawn_blocking(move || lock(&inputs).source.wait_ready()) => Some(ready),
        };

        match ready {
            Some(Ok(Ok(()))) => {
                self.machine.on_stream_ready();
                self.emit(SessionEvent::StateChanged(self.machine.state())).await;
                self.sample_loop().await;
            }
            Some(Ok(Err(e))) => {
                tracing::error!("Camera not ready: {}", e);
                self.emit(SessionEvent::Failed(e.to_string())).await;
            }
            Some(Err(e)) => self.emit(SessionEvent::Failed(e.to_string())).await,
            None => {}
        }

        self.teardown().await;
    }

    async fn sample_loop(&mut self) {
        let interval = self.machine.config().sample_interval();
        let sleep = tokio::time::sleep(interval);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                _ = &mut sleep => {
                    self.pass().await;
                    // Next pass is scheduled only after this one finished.
                    sleep.as_mut().reset(Instant::now() + interval);
                }
            }
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        let before = self.machine.state();
        match command {
            SessionCommand::Arm => {
                if before == AcquisitionState::Complete {
                    self.buffer.clear();
                }
                if let Err(e) = self.machine.arm(Instant::now()) {
                    tracing::warn!("{}", e);
                }
            }
            SessionCommand::Disarm => self.machine.disarm(),
        }
        if self.machine.state() != before {
            self.emit(SessionEvent::StateChanged(self.machine.state())).await;
        }
    }

    async fn pass(&mut self) {
        let inputs = Arc::clone(&self.inputs);
        let detected = tokio::task::spawn_blocking(move || -> Result<(DynamicImage, Vec<FaceBox>)> {
            let mut inputs = lock(&inputs);
            let frame = inputs.source.current_frame()?;
            let faces = inputs.detector.detect(&frame)?;
            Ok((frame, faces))
        })
        .await;

        let (frame, face) = match detected {
            Ok(Ok((frame, faces))) => (Some(Arc::new(frame)), faces.into_iter().next()),
            Ok(Err(e)) => {
                tracing::debug!("Detection pass failed: {}", e);
                (None, None)
            }
            Err(e) => {
                tracing::warn!("Detection task failed: {}", e);
                (None, None)
            }
        };

        let sample = face.as_ref().and_then(DetectionSample::from_face);
        let decision = self.machine.observe(sample.as_ref(), Instant::now());

        match decision {
            Decision::Capture { angle } => {
                if let Some(frame) = &frame {
                    self.capture(Arc::clone(frame), angle).await;
                }
            }
            Decision::TimedOut => {
                self.emit(SessionEvent::TimedOut).await;
                self.emit(SessionEvent::StateChanged(self.machine.state())).await;
            }
            _ => {}
        }

        self.emit(SessionEvent::Sampled {
            frame,
            face,
            decision,
            captured: self.buffer.len(),
        })
        .await;
    }

    async fn capture(&mut self, frame: Arc<DynamicImage>, angle: i32) {
        let quality = self.jpeg_quality;
        let encoded = tokio::task::spawn_blocking(move || encode_portrait_data_uri(&frame, quality)).await;

        let uri = match encoded {
            Ok(Ok(uri)) => uri,
            Ok(Err(e)) => {
                tracing::warn!("Cannot encode snapshot: {}", e);
                return;
            }
            Err(e) => {
                tracing::warn!("Snapshot task failed: {}", e);
                return;
            }
        };

        let count = self.buffer.push(uri);
        self.machine.commit_capture(angle, Instant::now());
        tracing::info!("Captured image {} at angle {}", count, angle);
        self.emit(SessionEvent::Captured { count }).await;

        if self.machine.record_capture(count) {
            self.emit(SessionEvent::Complete { count }).await;
            self.emit(SessionEvent::StateChanged(self.machine.state())).await;
        }
    }

    async fn teardown(&mut self) {
        self.machine.reset();
        self.emit(SessionEvent::StateChanged(AcquisitionState::Idle)).await;

        let inputs = Arc::clone(&self.inputs);
        if let Err(e) = tokio::task::spawn_blocking(move || lock(&inputs).source.release()).await {
            tracing::warn!("Releasing the frame source failed: {}", e);
        }
        self.emit(SessionEvent::Stopped).await;
    }
}

fn lock(inputs: &Mutex<Inputs>) -> std::sync::MutexGuard<'_, Inputs> {
    inputs.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::detector::{FaceLandmarks, Point};
    use image::{GrayImage, Luma};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct StillSource {
        released: Arc<AtomicBool>,
    }

    impl FrameSource for StillSource {
        fn wait_ready(&mut self) -> Result<()> {
            Ok(())
        }

        fn current_frame(&mut self) -> Result<DynamicImage> {
            Ok(DynamicImage::ImageLuma8(GrayImage::from_pixel(64, 48, Luma([128]))))
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    /// Returns one face per pass with the nose shifted by the scripted offsets.
    struct ScriptedDetector {
        offsets: Mutex<VecDeque<f32>>,
    }

    impl DetectFaces for ScriptedDetector {
        fn detect(&self, _image: &DynamicImage) -> Result<Vec<FaceBox>> {
            let Some(dx) = self.offsets.lock().unwrap().pop_front() else {
                return Ok(Vec::new());
            };
            Ok(vec![FaceBox {
                x1: 200.0,
                y1: 100.0,
                x2: 400.0,
                y2: 360.0,
                confidence: 0.9,
                landmarks: Some(FaceLandmarks {
                    left_eye: Point { x: 260.0, y: 180.0 },
                    right_eye: Point { x: 340.0, y: 180.0 },
                    nose: Point { x: 300.0 + dx, y: 230.0 },
                    mouth_left: Point { x: 270.0, y: 290.0 },
                    mouth_right: Point { x: 330.0, y: 290.0 },
                }),
            }])
        }
    }

    #[tokio::test]
    async fn armed_session_captures_on_movement_until_complete() {
        let released = Arc::new(AtomicBool::new(false));
        let source = StillSource { released: released.clone() };
        // Offset -5.5 px yields a rounded angle of -6 hundredths.
        let detector = ScriptedDetector {
            offsets: Mutex::new(VecDeque::from(vec![0.0, 0.0, 0.0, -5.5, 0.0])),
        };
        let config = AcquisitionConfig {
            angle_threshold: 0.1,
            sample_interval_ms: 5,
            target_count: 3,
            ..Default::default()
        };
        let buffer = CaptureBuffer::new(4, None);

        let mut handle = AcquisitionSession::spawn(Box::new(source), Box::new(detector), buffer.clone(), config, 80);
        handle.arm().await.unwrap();

        let mut decisions = Vec::new();
        let mut completed = None;
        while completed.is_none() {
            let event = tokio::time::timeout(Duration::from_secs(5), handle.next_event())
                .await
                .expect("session stalled")
                .expect("session ended early");
            match event {
                SessionEvent::Sampled { decision, .. } => decisions.push(decision),
                SessionEvent::Complete { count } => completed = Some(count),
                _ => {}
            }
        }

        assert_eq!(completed, Some(3));
        assert_eq!(buffer.len(), 3);
        assert!(buffer.snapshot().iter().all(|img| img.data.starts_with("data:image/jpeg;base64,")));
        assert_eq!(
            decisions[..4],
            [
                Decision::Capture { angle: 0 },
                Decision::AwaitingMovement,
                Decision::AwaitingMovement,
                Decision::Capture { angle: -6 },
            ]
        );

        handle.stop().await;
        assert!(released.load(Ordering::SeqCst));
    }

    /// Sees nothing for a number of passes, then a frontal face.
    struct LateFaceDetector {
        blank_passes: AtomicUsize,
    }

    impl DetectFaces for LateFaceDetector {
        fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
            let remaining = self.blank_passes.load(Ordering::SeqCst);
            if remaining > 0 {
                self.blank_passes.store(remaining - 1, Ordering::SeqCst);
                return Ok(Vec::new());
            }
            ScriptedDetector { offsets: Mutex::new(VecDeque::from(vec![0.0])) }.detect(image)
        }
    }

    #[tokio::test]
    async fn completion_reaches_a_consumer_that_fell_behind() {
        let released = Arc::new(AtomicBool::new(false));
        let source = StillSource { released: released.clone() };
        let detector = LateFaceDetector { blank_passes: AtomicUsize::new(60) };
        let config = AcquisitionConfig { sample_interval_ms: 1, target_count: 1, ..Default::default() };
        let buffer = CaptureBuffer::new(4, None);

        let mut handle = AcquisitionSession::spawn(Box::new(source), Box::new(detector), buffer.clone(), config, 80);
        handle.arm().await.unwrap();

        // Far more passes than the event queue holds go by unread.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let mut completed = None;
        for _ in 0..500 {
            let event = tokio::time::timeout(Duration::from_secs(5), handle.next_event())
                .await
                .expect("session stalled")
                .expect("session ended early");
            if let SessionEvent::Complete { count } = event {
                completed = Some(count);
                break;
            }
        }

        assert_eq!(buffer.len(), 1);
        assert_eq!(completed, Some(1));
        handle.stop().await;
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unarmed_session_never_captures() {
        let released = Arc::new(AtomicBool::new(false));
        let source = StillSource { released: released.clone() };
        let detector = ScriptedDetector { offsets: Mutex::new(VecDeque::from(vec![0.0; 3])) };
        let config = AcquisitionConfig { sample_interval_ms: 5, ..Default::default() };
        let buffer = CaptureBuffer::new(4, None);

        let mut handle = AcquisitionSession::spawn(Box::new(source), Box::new(detector), buffer.clone(), config, 80);

        let mut seen = Vec::new();
        while seen.len() < 4 {
            if let Some(SessionEvent::Sampled { decision, .. }) = handle.next_event().await {
                seen.push(decision);
            }
        }
        assert_eq!(seen[..3], [Decision::Ready, Decision::Ready, Decision::Ready]);
        assert_eq!(seen[3], Decision::Guide(crate::core::quality::Guidance::NoFace));
        assert!(buffer.is_empty());

        drop(handle);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !released.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("source not released after drop");
    }
}
