pub mod acquisition;
pub mod buffer;
pub mod detector;
pub mod quality;
pub mod session;
pub mod token;
pub mod token_manager;
pub mod workflow;

pub use acquisition::{AcquisitionState, Decision, PoseAcquisition};
pub use buffer::{CaptureBuffer, CapturedImage, ImageRing};
pub use detector::{DetectFaces, FaceBox, FaceDetector, FaceLandmarks};
pub use quality::{DetectionSample, Guidance};
pub use session::{AcquisitionSession, SessionCommand, SessionEvent, SessionHandle};
pub use token::TokenPair;
pub use token_manager::TokenManager;
pub use workflow::{EnrollReport, FaceWorkflow, VerifyReport};
