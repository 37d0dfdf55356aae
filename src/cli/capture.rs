use std::io;
use std::sync::Arc;
use std::time::Duration;

use crossterm::{cursor, terminal};
use image::DynamicImage;

use crate::camera::snapshot::decode_data_uri;
use crate::camera::Camera;
use crate::cli::ascii_preview::{check_for_escape, clear_screen, draw_at_top, AsciiRenderer};
use crate::common::{system_models_dir, Config, DevMode, FaceLinkError, Result};
use crate::core::buffer::CaptureBuffer;
use crate::core::detector::{FaceBox, FaceDetector};
use crate::core::acquisition::AcquisitionState;
use crate::core::session::{AcquisitionSession, SessionEvent, SessionHandle};

const ESCAPE_POLL: Duration = Duration::from_millis(50);

/// Runs the acquisition loop on the configured camera until the target
/// number of snapshots was taken. Returns the snapshots as data URIs.
pub async fn capture_from_camera(config: &Config, dev_mode: &DevMode, preview: bool) -> Result<Vec<String>> {
    let camera = Camera::new(&config.camera)?;
    let models_base = if dev_mode.is_enabled() { ".".into() } else { system_models_dir() };
    let detector = FaceDetector::new_with_model_path(config, &models_base)?;

    let buffer = CaptureBuffer::new(config.buffer.capacity, None);
    let handle = AcquisitionSession::spawn(
        Box::new(camera),
        Box::new(detector),
        buffer.clone(),
        config.acquisition.clone(),
        config.camera.jpeg_quality,
    );

    let mut preview = if preview { Some(Preview::start()?) } else { None };
    let target = config.acquisition.target_count;
    let result = drive(handle, &mut preview, target).await;
    if let Some(preview) = preview.take() {
        preview.finish();
    }
    result?;

    let images: Vec<String> = buffer.take().into_iter().map(|img| img.data).collect();
    if dev_mode.is_enabled() {
        save_captures(dev_mode, &images);
    }
    Ok(images)
}

async fn drive(
    mut handle: SessionHandle,
    preview: &mut Option<Preview>,
    target: usize,
) -> Result<()> {
    let mut escape_poll = tokio::time::interval(ESCAPE_POLL);
    let mut outcome: Result<()> = Err(FaceLinkError::Acquisition("acquisition stopped early".into()));

    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(SessionEvent::StateChanged(state)) => {
                    tracing::debug!("Acquisition state: {}", state);
                    if state == AcquisitionState::Sampling {
                        handle.arm().await?;
                    }
                }
                Some(SessionEvent::Sampled { frame, face, decision, captured }) => {
                    if let (Some(preview), Some(frame)) = (preview.as_mut(), frame) {
                        preview.draw(&frame, face.as_ref(), decision.message(), captured, target);
                    }
                }
                Some(SessionEvent::Captured { count }) => {
                    if preview.is_none() {
                        println!("Captured {}/{}", count, target);
                    }
                }
                Some(SessionEvent::TimedOut) => {
                    outcome = Err(FaceLinkError::Acquisition("no head movement detected, capture timed out".into()));
                    break;
                }
                Some(SessionEvent::Complete { count }) => {
                    tracing::info!("Captured {} image(s)", count);
                    outcome = Ok(());
                    break;
                }
                Some(SessionEvent::Failed(reason)) => {
                    outcome = Err(FaceLinkError::Camera(reason));
                    break;
                }
                Some(SessionEvent::Stopped) | None => break,
            },
            _ = escape_poll.tick(), if preview.is_some() => {
                if check_for_escape().unwrap_or(false) {
                    outcome = Err(FaceLinkError::Acquisition("capture cancelled by user".into()));
                    break;
                }
            }
        }
    }

    handle.stop().await;
    outcome
}

/// Raw-mode terminal preview. Restores the terminal in [`Preview::finish`].
struct Preview {
    renderer: AsciiRenderer,
}

impl Preview {
    fn start() -> Result<Self> {
        terminal::enable_raw_mode()
            .map_err(|e| FaceLinkError::Other(anyhow::anyhow!("Failed to enable raw mode: {}", e)))?;
        clear_screen().ok();
        crossterm::execute!(io::stdout(), cursor::Hide).ok();
        Ok(Self { renderer: AsciiRenderer::new(None, None) })
    }

    fn draw(&mut self, frame: &Arc<DynamicImage>, face: Option<&FaceBox>, message: &str, captured: usize, target: usize) {
        let rendered = self.renderer.render(frame, face, message, captured, target);
        draw_at_top(&rendered).ok();
    }

    fn finish(self) {
        clear_screen().ok();
        crossterm::execute!(io::stdout(), cursor::Show).ok();
        if let Err(e) = terminal::disable_raw_mode() {
            tracing::warn!("Failed to disable raw mode: {}", e);
        }
    }
}

fn save_captures(dev_mode: &DevMode, images: &[String]) {
    for (i, image) in images.iter().enumerate() {
        let path = dev_mode.get_capture_path("capture", i);
        match decode_data_uri(image).and_then(|img| img.save(&path).map_err(Into::into)) {
            Ok(()) => tracing::debug!("Saved capture to {}", path.display()),
            Err(e) => tracing::warn!("Cannot save capture {}: {}", path.display(), e),
        }
    }
}
