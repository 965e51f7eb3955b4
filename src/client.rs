use std::future::Future;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde_json::Value;
use tracing::debug;

use crate::bridge::{resolve_backend_url, DesktopBridge};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::sse::{decode_event, EventStream};
use crate::types::*;

fn normalize(endpoint: String) -> String {
    endpoint.trim_end_matches('/').to_string()
}

/// The backend operations the task lifecycle layer depends on.
///
/// [`ApiClient`] is the HTTP implementation; tests and embedders can supply
/// their own (an in-memory backend, a recorded session, ...).
pub trait GenerationBackend: Send + Sync + 'static {
    /// Submit a generation (`POST /generate`) and classify the JSON reply.
    fn submit(
        &self,
        request: &GenerateRequest,
    ) -> impl Future<Output = Result<GenerateResponse>> + Send;

    /// Fetch one task's status (`GET /tasks/{id}`).
    fn task_status(&self, task_id: &str) -> impl Future<Output = Result<GenerationTask>> + Send;

    /// List tasks of `generation_type` still processing on the backend.
    fn processing_tasks(
        &self,
        generation_type: GenerationType,
    ) -> impl Future<Output = Result<Vec<GenerationTask>>> + Send;

    /// Fetch one page of persisted history, newest first.
    fn history(
        &self,
        page: u32,
        page_size: u32,
    ) -> impl Future<Output = Result<Vec<GenerationHistory>>> + Send;
}

/// Async HTTP client for the generation backend.
///
/// # Example
/// ```no_run
/// use imagegen_sync::{ApiClient, GenerationBackend};
///
/// # async fn example() -> imagegen_sync::Result<()> {
/// let client = ApiClient::new("http://127.0.0.1:8080");
/// let task = client.task_status("3f1c...").await?;
/// println!("{:?}", task.status);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    endpoint: String,
    request_timeout: Duration,
    status_timeout: Duration,
}

impl ApiClient {
    /// Create a new client pointing at the given backend endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        let defaults = SyncConfig::default();
        Self {
            http: Client::new(),
            endpoint: normalize(endpoint.into()),
            request_timeout: defaults.request_timeout,
            status_timeout: defaults.status_timeout,
        }
    }

    /// Create a client from config, resolving the endpoint through the
    /// desktop bridge when one is present.
    pub fn from_config(config: &SyncConfig, bridge: Option<&dyn DesktopBridge>) -> Self {
        let endpoint = resolve_backend_url(config.backend_url.as_deref(), bridge);
        Self {
            http: Client::new(),
            endpoint: normalize(endpoint),
            request_timeout: config.request_timeout,
            status_timeout: config.status_timeout,
        }
    }

    /// Use a custom `reqwest::Client` (for connection pooling, TLS).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// Returns the configured endpoint URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn network(&self, context: impl Into<String>) -> impl FnOnce(reqwest::Error) -> SyncError {
        let context = context.into();
        move |source| SyncError::Network { context, source }
    }

    fn connect_context(&self) -> String {
        format!(
            "Cannot connect to backend at {}. Is the service running?",
            self.endpoint
        )
    }

    async fn check_status(resp: Response) -> Result<Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(SyncError::Http { status, body })
    }

    fn build_form(request: &GenerateRequest) -> Result<Form> {
        let mut form = Form::new()
            .text("prompt", request.prompt.clone())
            .text("aspectRatio", request.aspect_ratio.clone())
            .text("imageSize", request.image_size.clone())
            .text("count", request.count.to_string())
            .text("type", request.generation_type.as_str().to_string());
        for image in &request.images {
            let part = Part::bytes(image.bytes.clone())
                .file_name(image.file_name.clone())
                .mime_str(&image.mime)
                .map_err(|e| SyncError::InvalidResponse(format!("Bad image mime type: {}", e)))?;
            form = form.part("images", part);
        }
        Ok(form)
    }

    async fn post_generate(&self, request: &GenerateRequest) -> Result<Response> {
        let url = format!("{}/generate", self.endpoint);
        let form = Self::build_form(request)?;
        let resp = self
            .http
            .post(&url)
            .timeout(self.request_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(self.network(self.connect_context()))?;
        Self::check_status(resp).await
    }

    // ── Generation ──────────────────────────────────────────────────

    /// Submit a multi-image generation and open its SSE event stream.
    ///
    /// The request has no overall timeout; the stream ends after the
    /// backend's `complete` event or on a transport error.
    pub async fn generate_stream(&self, request: &GenerateRequest) -> Result<EventStream> {
        let url = format!("{}/generate", self.endpoint);
        let form = Self::build_form(request)?;
        let resp = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(self.network(self.connect_context()))?;
        let resp = Self::check_status(resp).await?;

        let is_sse = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);
        if !is_sse {
            return Err(SyncError::InvalidResponse(
                "Expected an event stream from /generate".into(),
            ));
        }

        let events = resp
            .bytes_stream()
            .eventsource()
            .filter_map(|event| async move {
                match event {
                    Ok(event) => decode_event(&event.data),
                    Err(e) => Some(Err(SyncError::Stream(e.to_string()))),
                }
            });
        Ok(Box::pin(events))
    }

    // ── Images ──────────────────────────────────────────────────────

    /// Download a generated image. Returns raw bytes.
    pub async fn download_image(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(self.network(format!("Failed to fetch image {}", url)))?;
        let resp = Self::check_status(resp).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(self.network("Failed to read image bytes"))?;
        Ok(bytes.to_vec())
    }
}

impl GenerationBackend for ApiClient {
    async fn submit(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        let resp = self.post_generate(request).await?;
        let json: Value = resp
            .json()
            .await
            .map_err(self.network("Failed to parse /generate response"))?;
        GenerateResponse::from_json(&json)
    }

    async fn task_status(&self, task_id: &str) -> Result<GenerationTask> {
        let url = format!("{}/tasks/{}", self.endpoint, task_id);
        debug!(task_id = %task_id, "fetching task status");
        let resp = self
            .http
            .get(&url)
            .timeout(self.status_timeout)
            .send()
            .await
            .map_err(self.network("Failed to fetch task status"))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(task_id.to_string()));
        }
        let resp = Self::check_status(resp).await?;
        resp.json()
            .await
            .map_err(self.network("Failed to parse task status response"))
    }

    async fn processing_tasks(&self, generation_type: GenerationType) -> Result<Vec<GenerationTask>> {
        let url = format!("{}/tasks", self.endpoint);
        let resp = self
            .http
            .get(&url)
            .query(&[("type", generation_type.as_str()), ("status", "processing")])
            .timeout(self.status_timeout)
            .send()
            .await
            .map_err(self.network("Failed to fetch processing tasks"))?;
        let resp = Self::check_status(resp).await?;
        let tasks: Vec<GenerationTask> = resp
            .json()
            .await
            .map_err(self.network("Failed to parse processing tasks response"))?;
        Ok(tasks
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .collect())
    }

    async fn history(&self, page: u32, page_size: u32) -> Result<Vec<GenerationHistory>> {
        let url = format!("{}/history", self.endpoint);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("page", page.max(1).to_string()),
                ("pageSize", page_size.to_string()),
            ])
            .timeout(self.status_timeout)
            .send()
            .await
            .map_err(self.network("Failed to fetch history"))?;
        let resp = Self::check_status(resp).await?;
        resp.json()
            .await
            .map_err(self.network("Failed to parse history response"))
    }
}
