use crate::camera::FrameSource;
use crate::common::config::CameraConfig;
use crate::common::{FaceLinkError, Result};
use image::{DynamicImage, ImageBuffer, Luma, Rgb};
use std::fs;
use std::time::Duration;
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

/// Value of `camera.device_index` that picks the first capture device.
pub const AUTO_DETECT_INDEX: u32 = 999;

#[derive(Debug, Clone)]
pub struct CameraInfo {
    pub index: u32,
    pub name: String,
    pub formats: Vec<String>,
    pub can_capture: bool,
}

/// V4L2 camera producing grayscale (GREY), YUYV or MJPG frames.
pub struct Camera {
    device: Device,
    index: u32,
    config: CameraConfig,
    format: Option<v4l::Format>,
    stream: Option<v4l::io::mmap::Stream<'static>>,
}

impl Camera {
    pub fn new(config: &CameraConfig) -> Result<Self> {
        let index = if config.device_index == AUTO_DETECT_INDEX {
            Self::detect_camera()?
        } else {
            config.device_index
        };
        Self::new_with_device(index, config.clone())
    }

    /// Every `/dev/video*` node that answers a capability query.
    pub fn list_all_cameras() -> Result<Vec<CameraInfo>> {
        let mut cameras = Vec::new();

        for entry in fs::read_dir("/dev")? {
            let entry = entry?;
            let path = entry.path();
            let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

            let Some(index) = filename.strip_prefix("video").and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let Ok(device) = Device::new(index as usize) else {
                continue;
            };
            let Ok(caps) = device.query_caps() else {
                continue;
            };

            let formats = device
                .enum_formats()
                .unwrap_or_default()
                .iter()
                .map(|fmt| fmt.fourcc.str().unwrap_or("UNKNOWN").to_string())
                .collect();

            cameras.push(CameraInfo {
                index,
                name: caps.card.clone(),
                formats,
                can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            });
        }

        cameras.sort_by_key(|c| c.index);
        Ok(cameras)
    }

    /// First device with video capture, preferring colour formats.
    pub fn detect_camera() -> Result<u32> {
        let cameras = Self::list_all_cameras()?;
        let is_color = |c: &CameraInfo| c.formats.iter().any(|f| f == "MJPG" || f == "YUYV");

        let chosen = cameras
            .iter()
            .filter(|c| c.can_capture)
            .find(|c| is_color(c))
            .or_else(|| cameras.iter().find(|c| c.can_capture));

        match chosen {
            Some(camera) => {
                tracing::info!("Selected camera /dev/video{} ({})", camera.index, camera.name);
                Ok(camera.index)
            }
            None => {
                tracing::warn!("No capture device detected, falling back to /dev/video0");
                Ok(0)
            }
        }
    }

    pub fn new_with_device(index: u32, config: CameraConfig) -> Result<Self> {
        tracing::debug!("Opening camera device {}", index);

        let device = Device::new(index as usize)
            .map_err(|e| FaceLinkError::Camera(format!("Failed to open camera {}: {}", index, e)))?;

        let caps = device
            .query_caps()
            .map_err(|e| FaceLinkError::Camera(format!("Failed to query capabilities: {}", e)))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            tracing::warn!("Device {} may not support standard video capture", index);
        }

        Ok(Self { device, index, config, format: None, stream: None })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    fn negotiate_format(&self) -> Result<v4l::Format> {
        let mut fmt = self
            .device
            .format()
            .map_err(|e| FaceLinkError::Camera(format!("Failed to get format: {}", e)))?;

        fmt.width = self.config.width;
        fmt.height = self.config.height;
        if fmt.fourcc.repr != *b"GREY" && fmt.fourcc.repr != *b"YUYV" {
            fmt.fourcc = FourCC::new(b"MJPG");
        }

        if let Err(e) = self.device.set_format(&fmt) {
            tracing::warn!("Could not set exact format: {}. Using device defaults.", e);
        }

        let actual = self
            .device
            .format()
            .map_err(|e| FaceLinkError::Camera(format!("Failed to get final format: {}", e)))?;
        if actual.width != self.config.width || actual.height != self.config.height {
            tracing::warn!(
                "Camera resolution {}x{} differs from requested {}x{}",
                actual.width, actual.height, self.config.width, self.config.height
            );
        }
        tracing::info!(
            "Camera format: {}x{} {}",
            actual.width, actual.height, actual.fourcc.str().unwrap_or("????")
        );
        Ok(actual)
    }
}

impl FrameSource for Camera {
    fn wait_ready(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let format = self.negotiate_format()?;
        let mut stream = v4l::io::mmap::Stream::with_buffers(&self.device, Type::VideoCapture, 4)
            .map_err(|e| FaceLinkError::Camera(format!("Failed to create stream: {}", e)))?;

        for i in 0..self.config.warmup_frames {
            stream
                .next()
                .map_err(|e| FaceLinkError::Camera(format!("Failed to capture warmup frame {}: {}", i, e)))?;
            std::thread::sleep(Duration::from_millis(self.config.warmup_delay_ms));
        }

        tracing::debug!("Camera {} ready", self.index);
        self.format = Some(format);
        self.stream = Some(stream);
        Ok(())
    }

    fn current_frame(&mut self) -> Result<DynamicImage> {
        let (Some(stream), Some(format)) = (self.stream.as_mut(), self.format.as_ref()) else {
            return Err(FaceLinkError::Camera("camera stream not started".into()));
        };

        let (buf, meta) = stream
            .next()
            .map_err(|e| FaceLinkError::Camera(format!("Failed to capture: {}", e)))?;
        let used = (meta.bytesused as usize).min(buf.len());
        let data = if used > 0 { &buf[..used] } else { buf };

        decode_frame(&format.fourcc.repr, data, format.width, format.height)
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("Released camera {}", self.index);
        }
        self.format = None;
    }
}

/// Converts one raw buffer into an image.
pub fn decode_frame(fourcc: &[u8; 4], data: &[u8], width: u32, height: u32) -> Result<DynamicImage> {
    match fourcc {
        b"GREY" => grey_to_image(data, width, height),
        b"YUYV" => yuyv_to_image(data, width, height),
        b"MJPG" => Ok(image::load_from_memory(data)?),
        other => Err(FaceLinkError::Camera(format!(
            "Unsupported format {}",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn grey_to_image(data: &[u8], width: u32, height: u32) -> Result<DynamicImage> {
    let needed = (width * height) as usize;
    let pixels = data.get(..needed).map(|d| d.to_vec()).unwrap_or_default();
    let img_buffer = ImageBuffer::<Luma<u8>, _>::from_raw(width, height, pixels)
        .ok_or_else(|| FaceLinkError::Camera("Failed to create grayscale image buffer".into()))?;

    Ok(DynamicImage::ImageLuma8(img_buffer))
}

fn yuyv_to_image(data: &[u8], width: u32, height: u32) -> Result<DynamicImage> {
    let needed = (width * height * 2) as usize;
    if data.len() < needed {
        return Err(FaceLinkError::Camera(format!(
            "YUYV frame too short: {} of {} bytes",
            data.len(),
            needed
        )));
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in data[..needed].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0] as f32, chunk[1] as f32 - 128.0, chunk[2] as f32, chunk[3] as f32 - 128.0);
        for y in [y0, y1] {
            rgb.push((y + 1.402 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y + 1.772 * u).clamp(0.0, 255.0) as u8);
        }
    }

    let img_buffer = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, rgb)
        .ok_or_else(|| FaceLinkError::Camera("Failed to create RGB image buffer".into()))?;
    Ok(DynamicImage::ImageRgb8(img_buffer))
}
