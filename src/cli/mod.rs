pub mod ascii_preview;
pub mod capture;

pub use ascii_preview::{check_for_escape, clear_screen, AsciiRenderer};
pub use capture::capture_from_camera;
