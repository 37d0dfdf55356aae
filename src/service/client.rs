use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use tokio::net::UnixStream;

use crate::common::{FaceLinkError, Result};
use crate::service::protocol::{read_frame, write_frame, Request, Response};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(120);

/// Talks to a running `homeface-agent` over its Unix socket.
pub struct AgentClient {
    socket_path: PathBuf,
    dev_mode: bool,
}

impl AgentClient {
    pub fn new(socket_path: impl Into<PathBuf>, dev_mode: bool) -> Self {
        Self { socket_path: socket_path.into(), dev_mode }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Sends one request and waits for its response. Agent-side failures
    /// come back as errors, not as [`Response::Error`].
    pub async fn request(&self, request: &Request) -> Result<Response> {
        self.ensure_agent_running().await?;
        let mut stream = self.connect_with_retry(3).await?;

        write_frame(&mut stream, request).await?;
        let response = tokio::time::timeout(RESPONSE_TIMEOUT, read_frame(&mut stream))
            .await
            .map_err(|_| FaceLinkError::Network("agent did not answer in time".into()))??;

        match response {
            Some(Response::Error(msg)) => Err(FaceLinkError::Service(msg)),
            Some(response) => Ok(response),
            None => Err(FaceLinkError::Network("agent closed the connection".into())),
        }
    }

    /// Pushes several images, returning the buffer size after the last one.
    pub async fn ingest_all(&self, images: Vec<String>) -> Result<usize> {
        let mut count = 0;
        for image in images {
            match self.request(&Request::Ingest { image }).await? {
                Response::Ingested { count: c } => count = c,
                other => return Err(unexpected(&other)),
            }
        }
        Ok(count)
    }

    pub async fn ensure_agent_running(&self) -> Result<()> {
        if self.socket_path.exists() && UnixStream::connect(&self.socket_path).await.is_ok() {
            return Ok(());
        }

        // Only auto-start in dev mode
        if !self.dev_mode {
            return Err(FaceLinkError::Other(anyhow::anyhow!(
                "Agent is not running. Please start it with: sudo systemctl start homeface-agent"
            )));
        }

        tracing::info!("Starting agent in development mode...");

        let agent_binary = std::env::current_exe()?
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Failed to get binary directory"))?
            .join("homeface-agent");

        if !agent_binary.exists() {
            return Err(FaceLinkError::Other(anyhow::anyhow!(
                "Agent binary not found at {:?}. Please build the project first.",
                agent_binary
            )));
        }

        Command::new(&agent_binary)
            .arg("--dev")
            .arg("--dev-socket")
            .arg(&self.socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| FaceLinkError::Other(anyhow::anyhow!("Failed to start agent: {}", e)))?;

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            if self.socket_path.exists() {
                tracing::info!("Agent started successfully");
                return Ok(());
            }
        }

        Err(FaceLinkError::Other(anyhow::anyhow!("Agent failed to start within timeout")))
    }

    async fn connect_with_retry(&self, max_retries: u32) -> Result<UnixStream> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match UnixStream::connect(&self.socket_path).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt < max_retries => {
                    tracing::warn!("Failed to connect (attempt {}): {}", attempt, e);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => {
                    return Err(FaceLinkError::Network(format!("Failed to connect to agent: {}", e)));
                }
            }
        }
    }
}

pub fn unexpected(response: &Response) -> FaceLinkError {
    FaceLinkError::Other(anyhow::anyhow!("Unexpected response: {:?}", response))
}
