use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::common::{FaceLinkError, Result};
use crate::core::buffer::{CaptureBuffer, CapturedImage};
use crate::core::workflow::FaceWorkflow;
use crate::service::protocol::{
    read_frame, write_frame, EnrollResponse, PersonStatus, Request, Response, StatusResponse,
    SyncResponse, VerifyResponse,
};
use crate::storage::PersonMirror;

/// Backend side: buffers pushed images and submits them on request.
pub struct FaceAgent {
    workflow: FaceWorkflow,
    buffer: CaptureBuffer,
    persons: Mutex<PersonMirror>,
}

impl FaceAgent {
    pub fn new(workflow: FaceWorkflow, buffer: CaptureBuffer, persons: PersonMirror) -> Self {
        Self { workflow, buffer, persons: Mutex::new(persons) }
    }

    pub fn buffer(&self) -> &CaptureBuffer {
        &self.buffer
    }

    pub fn workflow(&self) -> &FaceWorkflow {
        &self.workflow
    }

    /// Teardown: transient images and tokens go, including the shared slot.
    pub async fn shutdown(&self) {
        self.buffer.clear();
        if let Err(e) = self.workflow.tokens().discard().await {
            tracing::warn!("Cannot clear stored tokens: {}", e);
        }
    }

    /// Never fails; errors become [`Response::Error`].
    pub async fn handle(&self, request: Request) -> Response {
        let result = match request {
            Request::Ingest { image } => self.ingest(image),
            Request::Verify { person } => self.verify(person).await,
            Request::Enroll { person } => self.enroll(person).await,
            Request::Sync => self.sync().await,
            Request::Status => Ok(self.status().await),
            Request::Clear => {
                self.buffer.clear();
                Ok(Response::Cleared)
            }
        };

        result.unwrap_or_else(|e| {
            tracing::warn!("Request failed: {}", e);
            Response::Error(e.to_string())
        })
    }

    fn ingest(&self, image: String) -> Result<Response> {
        if !image.starts_with("data:image/") || !image.contains(";base64,") {
            return Err(FaceLinkError::Validation("expected an image data URI".into()));
        }
        let count = self.buffer.push(image);
        Ok(Response::Ingested { count })
    }

    /// The buffered images stay until the submission succeeded, so a failed
    /// call can be retried with them.
    fn buffered_images(&self) -> Result<(Vec<CapturedImage>, Vec<String>)> {
        let pending = self.buffer.snapshot();
        if pending.is_empty() {
            return Err(FaceLinkError::NoImages);
        }
        let images = pending.iter().map(|img| img.data.clone()).collect();
        Ok((pending, images))
    }

    async fn verify(&self, person: Option<String>) -> Result<Response> {
        let (pending, images) = self.buffered_images()?;
        let report = self.workflow.verify(person.as_deref(), &images).await?;
        self.buffer.discard(&pending);

        if let Err(e) = self.persons.lock().await.apply_match(report.matched()) {
            tracing::warn!("Cannot update detection flags: {}", e);
        }

        Ok(Response::Verified(VerifyResponse {
            matched: report.matched().map(str::to_string),
            images: images.len(),
            message: report.summary(),
        }))
    }

    async fn enroll(&self, person: String) -> Result<Response> {
        let (pending, images) = self.buffered_images()?;
        let report = self.workflow.enroll(&person, &images).await?;
        self.buffer.discard(&pending);

        if report.enrolled {
            if let Err(e) = self.sync().await {
                tracing::warn!("Person sync after enrollment failed: {}", e);
            }
        }

        Ok(Response::Enrolled(EnrollResponse {
            enrolled: report.enrolled,
            images: report.images,
            message: report.summary(),
        }))
    }

    async fn sync(&self) -> Result<Response> {
        let list = self.workflow.list_persons().await?;
        let mut persons = self.persons.lock().await;
        let report = persons.sync(&list.persons)?;

        Ok(Response::Synced(SyncResponse {
            added: report.added,
            renamed: report.renamed,
            removed: report.removed,
            persons: persons.len(),
        }))
    }

    async fn status(&self) -> Response {
        let persons = self
            .persons
            .lock()
            .await
            .persons()
            .map(|p| PersonStatus { id: p.id.clone(), name: p.name.clone(), detected: p.detected })
            .collect();

        Response::Status(StatusResponse {
            buffered: self.buffer.len(),
            capacity: self.buffer.capacity(),
            credentials_configured: self.workflow.tokens().has_credentials(),
            token_expires_at: self.workflow.tokens().access_token_expiry().await,
            persons,
        })
    }

    /// Accepts connections until `cancel` fires.
    pub async fn serve(self: Arc<Self>, listener: UnixListener, cancel: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let agent = Arc::clone(&self);
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = agent.handle_connection(stream, cancel).await {
                                tracing::error!("Client error: {}", e);
                            }
                        });
                    }
                    Err(e) => tracing::error!("Connection error: {}", e),
                },
            }
        }
        Ok(())
    }

    async fn handle_connection(&self, mut stream: UnixStream, cancel: CancellationToken) -> Result<()> {
        loop {
            let request: Request = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                request = read_frame(&mut stream) => match request? {
                    Some(request) => request,
                    None => return Ok(()),
                },
            };

            tracing::debug!("Processing request: {}", describe(&request));
            let response = self.handle(request).await;
            write_frame(&mut stream, &response).await?;
        }
    }
}

/// Log line without the image payload.
fn describe(request: &Request) -> String {
    match request {
        Request::Ingest { image } => format!("ingest ({} bytes)", image.len()),
        Request::Verify { person } => format!("verify {}", person.as_deref().unwrap_or("all")),
        Request::Enroll { person } => format!("enroll {}", person),
        Request::Sync => "sync".into(),
        Request::Status => "status".into(),
        Request::Clear => "clear".into(),
    }
}
