pub mod snapshot;
pub mod v4l2;

use image::DynamicImage;

use crate::common::Result;

pub use v4l2::{Camera, CameraInfo};

/// Live video feeding the acquisition loop. Calls may block.
pub trait FrameSource: Send {
    /// Starts streaming. Returns once frames are available.
    fn wait_ready(&mut self) -> Result<()>;

    fn current_frame(&mut self) -> Result<DynamicImage>;

    /// Stops streaming. Safe to call more than once.
    fn release(&mut self);
}
