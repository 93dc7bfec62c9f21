//! Request client for the worker's local API.
//!
//! Calls are only issued while the lifecycle state is `Ready`; anything else
//! fails fast with [`SupervisorError::NotReady`] and no I/O.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::error::{SupervisorError, SupervisorResult};
use crate::models::{DownloadOptions, JobRecord, StartedJob, VideoInfo};
use crate::state::LifecycleState;
use crate::transport::{Method, Transport, WorkerRequest};

/// Worker API endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Health,
    VideoInfo,
    StartDownload,
    CancelDownload,
    ListProgress,
    JobProgress(String),
    ClearJob(String),
}

impl Endpoint {
    pub fn method(&self) -> Method {
        match self {
            Endpoint::Health | Endpoint::ListProgress | Endpoint::JobProgress(_) => Method::GET,
            Endpoint::VideoInfo | Endpoint::StartDownload | Endpoint::CancelDownload => {
                Method::POST
            }
            Endpoint::ClearJob(_) => Method::DELETE,
        }
    }

    pub fn path(&self) -> String {
        match self {
            Endpoint::Health => "/api/health".to_string(),
            Endpoint::VideoInfo => "/api/video/info".to_string(),
            Endpoint::StartDownload => "/api/download/start".to_string(),
            Endpoint::CancelDownload => "/api/download/cancel".to_string(),
            Endpoint::ListProgress => "/api/download/progress".to_string(),
            Endpoint::JobProgress(id) => format!("/api/download/progress/{}", encode_segment(id)),
            Endpoint::ClearJob(id) => format!("/api/download/clear/{}", encode_segment(id)),
        }
    }
}

/// Job ids are opaque; keep them from escaping their path segment.
fn encode_segment(id: &str) -> String {
    url::form_urlencoded::byte_serialize(id.as_bytes()).collect()
}

#[derive(Clone)]
pub struct RequestClient {
    transport: Arc<dyn Transport>,
    state: watch::Receiver<LifecycleState>,
    timeout: Duration,
}

impl RequestClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        state: watch::Receiver<LifecycleState>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            state,
            timeout,
        }
    }

    /// Port of the ready worker, or `NotReady`.
    fn ready_port(&self) -> SupervisorResult<u16> {
        self.state.borrow().port().ok_or(SupervisorError::NotReady)
    }

    /// One request/response round trip. No retries at this layer.
    pub async fn call(&self, endpoint: Endpoint, payload: Option<Value>) -> SupervisorResult<Value> {
        let port = self.ready_port()?;

        let mut request = WorkerRequest::new(endpoint.method(), port, endpoint.path(), self.timeout);
        if let Some(body) = payload {
            request = request.with_body(body);
        }

        let response = self.transport.send(request).await.map_err(|e| {
            SupervisorError::WorkerRequest {
                status: None,
                message: e.to_string(),
            }
        })?;

        if !response.is_success() {
            let message = response
                .error_message()
                .unwrap_or_else(|| format!("worker returned HTTP {}", response.status));
            log::debug!("{} {} -> {}: {}", endpoint.method(), endpoint.path(), response.status, message);
            return Err(SupervisorError::WorkerRequest {
                status: Some(response.status),
                message,
            });
        }

        Ok(response.body)
    }

    async fn call_as<T: DeserializeOwned>(
        &self,
        endpoint: Endpoint,
        payload: Option<Value>,
    ) -> SupervisorResult<T> {
        let path = endpoint.path();
        let body = self.call(endpoint, payload).await?;
        serde_json::from_value(body).map_err(|e| SupervisorError::WorkerRequest {
            status: None,
            message: format!("unexpected response from {path}: {e}"),
        })
    }

    pub async fn health(&self) -> SupervisorResult<()> {
        self.call(Endpoint::Health, None).await.map(|_| ())
    }

    pub async fn get_video_info(&self, url: &str) -> SupervisorResult<VideoInfo> {
        self.call_as(Endpoint::VideoInfo, Some(json!({ "url": url })))
            .await
    }

    /// Returns the worker-assigned job id.
    pub async fn start_download(&self, options: &DownloadOptions) -> SupervisorResult<String> {
        let started: StartedJob = self
            .call_as(Endpoint::StartDownload, Some(options.to_request_body()))
            .await?;
        Ok(started.job_id)
    }

    pub async fn cancel_download(&self, job_id: &str) -> SupervisorResult<()> {
        self.call(
            Endpoint::CancelDownload,
            Some(json!({ "downloadId": job_id })),
        )
        .await
        .map(|_| ())
    }

    pub async fn list_progress(&self) -> SupervisorResult<Vec<JobRecord>> {
        self.call_as(Endpoint::ListProgress, None).await
    }

    pub async fn job_progress(&self, job_id: &str) -> SupervisorResult<JobRecord> {
        self.call_as(Endpoint::JobProgress(job_id.to_string()), None)
            .await
    }

    pub async fn clear_download(&self, job_id: &str) -> SupervisorResult<()> {
        self.call(Endpoint::ClearJob(job_id.to_string()), None)
            .await
            .map(|_| ())
    }
}
