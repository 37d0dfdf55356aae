pub mod camera;
pub mod cli;
pub mod common;
pub mod core;
pub mod service;
pub mod storage;

pub use camera::Camera;
pub use common::{Config, DevMode, FaceLinkError, Result};
pub use core::{
    AcquisitionSession, CaptureBuffer, FaceDetector, FaceWorkflow, PoseAcquisition, TokenManager,
    TokenPair,
};
pub use service::{protocol, AgentClient, Engine, FaceAgent, FaceService, HttpFaceService};
pub use storage::{CredentialStore, FileCredentialStore, PersonMirror};
