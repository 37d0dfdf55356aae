use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::{FaceLinkError, Result};

/// Largest frame accepted in either direction. Four JPEG data URIs fit
/// comfortably.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

// Request types
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Request {
    /// Adds one data URI to the agent's buffer.
    Ingest { image: String },
    /// Submits the buffered images. `None` matches against all persons.
    Verify { person: Option<String> },
    Enroll { person: String },
    /// Refreshes the person mirror from the service.
    Sync,
    Status,
    Clear,
}

// Response types
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Response {
    Ingested { count: usize },
    Verified(VerifyResponse),
    Enrolled(EnrollResponse),
    Synced(SyncResponse),
    Status(StatusResponse),
    Cleared,
    Error(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VerifyResponse {
    pub matched: Option<String>,
    pub images: usize,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EnrollResponse {
    pub enrolled: bool,
    pub images: usize,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SyncResponse {
    pub added: Vec<String>,
    pub renamed: Vec<String>,
    pub removed: Vec<String>,
    pub persons: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PersonStatus {
    pub id: String,
    pub name: String,
    pub detected: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusResponse {
    pub buffered: usize,
    pub capacity: usize,
    pub credentials_configured: bool,
    /// Seconds since epoch.
    pub token_expires_at: Option<i64>,
    pub persons: Vec<PersonStatus>,
}

/// Writes one length-prefixed (u32 little endian) bincode frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = bincode::serialize(message)
        .map_err(|e| FaceLinkError::Other(anyhow::anyhow!("Failed to serialize message: {}", e)))?;
    if data.len() > MAX_FRAME_LEN {
        return Err(FaceLinkError::Validation(format!("Message too large: {} bytes", data.len())));
    }

    writer.write_all(&(data.len() as u32).to_le_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. A peer that hung up before the prefix yields `Ok(None)`.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FaceLinkError::Validation(format!("Message too large: {} bytes", len)));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let message = bincode::deserialize(&buf)
        .map_err(|e| FaceLinkError::Validation(format!("Failed to deserialize message: {}", e)))?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &Request::Verify { person: Some("anna".into()) }).await.unwrap();
        write_frame(&mut a, &Request::Status).await.unwrap();
        drop(a);

        let first: Option<Request> = read_frame(&mut b).await.unwrap();
        assert_eq!(first, Some(Request::Verify { person: Some("anna".into()) }));
        let second: Option<Request> = read_frame(&mut b).await.unwrap();
        assert_eq!(second, Some(Request::Status));
        let end: Option<Request> = read_frame(&mut b).await.unwrap();
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn oversized_prefix_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&((MAX_FRAME_LEN as u32) + 1).to_le_bytes()).await.unwrap();

        let result: Result<Option<Response>> = read_frame(&mut b).await;
        assert!(matches!(result, Err(FaceLinkError::Validation(_))));
    }
}
