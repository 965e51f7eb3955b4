//! Server-Sent-Events batches.
//!
//! A multi-image request streams `start`, any number of `image`, and one
//! `complete` event over a single connection. [`BatchHandler`] folds those
//! events into a [`BatchResult`] whose slots are filled in place by index.
//!
//! ```text
//! Idle --start--> Streaming --complete--> Completed | Failed
//!                     |
//!                     +------error------> Failed (filled slots kept)
//! ```

use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::sanitize::{user_error, GENERIC_FAILURE_MESSAGE};
use crate::types::{slots_from_wire, BatchResult, BatchStatus, ImageSlot, WireImage};

/// Decoded events of one SSE generation.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Batch metadata, sent first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartEvent {
    #[serde(default)]
    pub task_id: Option<String>,
    pub batch_id: String,
    pub count: usize,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub ref_images: Vec<String>,
}

/// Result for one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEvent {
    #[serde(default)]
    pub batch_id: Option<String>,
    pub index: usize,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub completed: Option<usize>,
    #[serde(default)]
    pub total: Option<usize>,
}

/// Overall outcome reported by the backend's `complete` event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompleteStatus {
    #[default]
    Success,
    Partial,
    Failed,
}

/// Final, authoritative image list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteEvent {
    #[serde(default)]
    pub status: CompleteStatus,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub images: Vec<WireImage>,
    #[serde(default)]
    pub ref_images: Option<Vec<String>>,
    #[serde(default)]
    pub success_count: Option<usize>,
    #[serde(default)]
    pub total_count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Start(StartEvent),
    Image(ImageEvent),
    Complete(CompleteEvent),
    #[serde(other)]
    Unknown,
}

/// Decode one SSE `data` payload. Blank payloads and unknown event types
/// yield `None`.
pub fn decode_event(data: &str) -> Option<Result<StreamEvent>> {
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    match serde_json::from_str::<StreamEvent>(data) {
        Ok(StreamEvent::Unknown) => {
            debug!("skipping unknown SSE event");
            None
        }
        Ok(event) => Some(Ok(event)),
        Err(e) => Some(Err(SyncError::Json(e))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    Completed,
    Failed,
}

/// What the caller must do once a batch reaches a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub batch: BatchResult,
    /// Caller-supplied id of the pending placeholder to remove. `None` means
    /// remove by `batch.batch_id` instead.
    pub correlation_id: Option<String>,
    /// At least one slot failed because the quota is exhausted.
    pub quota_error: bool,
    /// Newly persisted records exist; history should be reloaded.
    pub reload_history: bool,
}

/// State machine for a single streaming session.
#[derive(Debug)]
pub struct BatchHandler {
    correlation_id: Option<String>,
    state: SessionState,
    batch: Option<BatchResult>,
}

impl BatchHandler {
    /// `correlation_id` is the local id of the pending placeholder for this
    /// request; it is known before the backend assigns a batch id.
    pub fn new(correlation_id: Option<String>) -> Self {
        Self {
            correlation_id,
            state: SessionState::Idle,
            batch: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// The in-progress batch while streaming.
    pub fn streaming_batch(&self) -> Option<&BatchResult> {
        match self.state {
            SessionState::Streaming => self.batch.as_ref(),
            _ => None,
        }
    }

    /// Dispatch one event. Returns the outcome once the batch is terminal.
    pub fn apply(&mut self, event: StreamEvent) -> Option<BatchOutcome> {
        match event {
            StreamEvent::Start(start) => {
                self.handle_start(start);
                None
            }
            StreamEvent::Image(image) => {
                self.handle_image(image);
                None
            }
            StreamEvent::Complete(complete) => self.handle_complete(complete),
            StreamEvent::Unknown => None,
        }
    }

    /// Open the batch with `count` loading slots. Ignored unless idle.
    pub fn handle_start(&mut self, event: StartEvent) -> bool {
        if self.state != SessionState::Idle {
            warn!(batch_id = %event.batch_id, "start event on an active session ignored");
            return false;
        }
        info!(batch_id = %event.batch_id, count = event.count, "batch streaming");
        self.batch = Some(BatchResult::streaming(
            event.batch_id,
            event.prompt,
            event.count,
            event.ref_images,
        ));
        self.state = SessionState::Streaming;
        true
    }

    /// Fill the targeted slot. Other slots are untouched.
    pub fn handle_image(&mut self, event: ImageEvent) -> bool {
        let batch = match (self.state, self.batch.as_mut()) {
            (SessionState::Streaming, Some(batch)) => batch,
            _ => {
                warn!(index = event.index, "image event outside a streaming batch ignored");
                return false;
            }
        };
        let slot = match (event.image_url, event.error) {
            (_, Some(error)) if !error.is_empty() => ImageSlot::Failed {
                error: user_error(&error).message,
            },
            (Some(url), _) if !url.is_empty() => ImageSlot::Ready { url },
            _ => ImageSlot::Failed {
                error: GENERIC_FAILURE_MESSAGE.to_string(),
            },
        };
        let updated = batch.set_slot(event.index, slot);
        if !updated {
            warn!(
                batch_id = %batch.batch_id,
                index = event.index,
                count = batch.image_count,
                "image index out of range"
            );
        }
        updated
    }

    /// Finalize from the authoritative image list.
    pub fn handle_complete(&mut self, event: CompleteEvent) -> Option<BatchOutcome> {
        if matches!(self.state, SessionState::Completed | SessionState::Failed) {
            return None;
        }
        let current = self.batch.take();
        let (batch_id, prompt, current_refs) = match &current {
            Some(b) => (b.batch_id.clone(), b.prompt.clone(), b.ref_images.clone()),
            None => {
                warn!("complete event without a start event");
                (
                    event.batch_id.clone().unwrap_or_default(),
                    String::new(),
                    Vec::new(),
                )
            }
        };

        let (slots, quota_error) = slots_from_wire(&event.images);

        let refs = event.ref_images.unwrap_or(current_refs);
        let mut batch = BatchResult::completed(batch_id, prompt, slots, refs);
        if let Some(b) = &current {
            batch.timestamp = b.timestamp;
        }
        if event.status == CompleteStatus::Failed {
            batch.status = BatchStatus::Failed;
            self.state = SessionState::Failed;
        } else {
            self.state = SessionState::Completed;
        }
        info!(
            batch_id = %batch.batch_id,
            status = ?batch.status,
            "batch finished"
        );

        Some(BatchOutcome {
            batch,
            correlation_id: self.correlation_id.clone(),
            quota_error,
            reload_history: true,
        })
    }

    /// Transport failure mid-stream. Filled slots are kept; loading slots
    /// become failures carrying `message`.
    pub fn handle_error(&mut self, message: &str) -> Option<BatchOutcome> {
        if matches!(self.state, SessionState::Completed | SessionState::Failed) {
            return None;
        }
        self.state = SessionState::Failed;
        let sanitized = user_error(message);
        let mut batch = self.batch.take()?;
        warn!(batch_id = %batch.batch_id, error = %message, "batch stream failed");
        batch.fail_remaining(&sanitized.message);
        batch.status = BatchStatus::Failed;
        let reload_history = batch.has_success();
        Some(BatchOutcome {
            batch,
            correlation_id: self.correlation_id.clone(),
            quota_error: sanitized.is_quota_error,
            reload_history,
        })
    }

    /// Consume `events` until a terminal outcome, calling `on_update` with
    /// the in-progress batch after every `start` and `image` event.
    ///
    /// A stream that ends or errors before `complete` is treated as a
    /// transport failure. Returns `None` only if no batch was ever started.
    pub async fn drive<F>(&mut self, mut events: EventStream, mut on_update: F) -> Option<BatchOutcome>
    where
        F: FnMut(&BatchResult),
    {
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    if let Some(outcome) = self.apply(event) {
                        return Some(outcome);
                    }
                    if let Some(batch) = self.streaming_batch() {
                        on_update(batch);
                    }
                }
                Err(e) => return self.handle_error(&e.to_string()),
            }
        }
        self.handle_error("Connection closed before the batch completed")
    }
}
