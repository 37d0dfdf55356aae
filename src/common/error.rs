use thiserror::Error;

#[derive(Error, Debug)]
pub enum FaceLinkError {
    /// Credentials missing, refresh and login both failed, or the service
    /// rejected the token. Recoverable by re-entering credentials.
    #[error("Cannot authenticate: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Invalid data: {0}")]
    Validation(String),

    #[error("No images to submit")]
    NoImages,

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Acquisition error: {0}")]
    Acquisition(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("ORT error: {0}")]
    Ort(#[from] ort::OrtError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<reqwest::Error> for FaceLinkError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
                return FaceLinkError::Auth(format!("service rejected credentials ({})", status));
            }
            return FaceLinkError::Service(format!("HTTP {}: {}", status, err));
        }
        if err.is_decode() {
            return FaceLinkError::Validation(format!("malformed service response: {}", err));
        }
        FaceLinkError::Network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FaceLinkError>;
