pub mod agent;
pub mod client;
pub mod face_api;
pub mod http;
pub mod protocol;

pub use agent::FaceAgent;
pub use client::AgentClient;
pub use face_api::{Engine, FaceService};
pub use http::HttpFaceService;
pub use protocol::{Request, Response};
