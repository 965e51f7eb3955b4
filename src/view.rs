//! Per-view reconciliation state.
//!
//! [`GenerationView`] is the single owner of what one generation page shows.
//! It applies events from the initiator, recovery, and SSE sessions, and
//! renders them through [`merge_history`]. Methods that return `bool` report
//! whether persisted history should now be reloaded.

use tracing::{debug, info};

use crate::client::GenerationBackend;
use crate::error::Result;
use crate::events::{GenerationEvent, GenerationResult, RecoveryEvent};
use crate::history::{merge_history, HistoryDisplayItem, HistorySources};
use crate::sanitize::{user_error, UserError, QUOTA_MESSAGE};
use crate::sse::{BatchHandler, BatchOutcome, EventStream};
use crate::types::{
    now_millis, BatchResult, FailedGeneration, GenerationHistory, GenerationItem, GenerationTask, GenerationType,
    ImageSlot,
};

#[derive(Debug, Clone)]
pub struct GenerationView {
    generation_type: GenerationType,
    history: Vec<GenerationHistory>,
    failed: Vec<FailedGeneration>,
    session_batches: Vec<BatchResult>,
    streaming: Vec<BatchResult>,
    pending: Vec<GenerationItem>,
    recovering: Vec<GenerationTask>,
    is_recovering: bool,
    last_error: Option<UserError>,
}

impl GenerationView {
    pub fn new(generation_type: GenerationType) -> Self {
        Self {
            generation_type,
            history: Vec::new(),
            failed: Vec::new(),
            session_batches: Vec::new(),
            streaming: Vec::new(),
            pending: Vec::new(),
            recovering: Vec::new(),
            is_recovering: false,
            last_error: None,
        }
    }

    pub fn generation_type(&self) -> GenerationType {
        self.generation_type
    }

    // ── History ─────────────────────────────────────────────────────

    /// Replace persisted history. Records of other generation types are
    /// dropped, and session batches are cleared since they are now persisted.
    pub fn set_history(&mut self, records: Vec<GenerationHistory>) {
        let generation_type = self.generation_type;
        self.history = records
            .into_iter()
            .filter(|r| r.matches_type(generation_type))
            .collect();
        self.session_batches.clear();
        debug!(count = self.history.len(), "history replaced");
    }

    /// Fetch the first history page from `backend` and apply it.
    pub async fn reload_history<B: GenerationBackend>(&mut self, backend: &B, page_size: u32) -> Result<()> {
        let records = backend.history(1, page_size).await?;
        self.set_history(records);
        Ok(())
    }

    pub fn history(&self) -> &[GenerationHistory] {
        &self.history
    }

    pub fn failed_generations(&self) -> &[FailedGeneration] {
        &self.failed
    }

    pub fn session_batches(&self) -> &[BatchResult] {
        &self.session_batches
    }

    pub fn streaming_batches(&self) -> &[BatchResult] {
        &self.streaming
    }

    pub fn pending(&self) -> &[GenerationItem] {
        &self.pending
    }

    pub fn recovering_tasks(&self) -> &[GenerationTask] {
        &self.recovering
    }

    pub fn is_recovering(&self) -> bool {
        self.is_recovering
    }

    /// Most recent error surfaced to the user, with the quota flag.
    pub fn last_error(&self) -> Option<&UserError> {
        self.last_error.as_ref()
    }

    pub fn dismiss_error(&mut self) {
        self.last_error = None;
    }

    /// The merged, oldest-first display list.
    pub fn display_items(&self) -> Vec<HistoryDisplayItem> {
        merge_history(HistorySources {
            history: &self.history,
            failed: &self.failed,
            session_batches: &self.session_batches,
            recovering: &self.recovering,
            pending: &self.pending,
            streaming: &self.streaming,
        })
    }

    // ── Placeholders ────────────────────────────────────────────────

    pub fn add_pending(&mut self, item: GenerationItem) {
        if !self.pending.iter().any(|p| p.id == item.id) {
            self.pending.push(item);
        }
    }

    pub fn remove_pending(&mut self, local_id: &str) -> Option<GenerationItem> {
        let index = self.pending.iter().position(|p| p.id == local_id)?;
        Some(self.pending.remove(index))
    }

    fn remove_pending_by_batch(&mut self, batch_id: &str) -> Option<GenerationItem> {
        let index = self
            .pending
            .iter()
            .position(|p| p.batch_id.as_deref() == Some(batch_id))?;
        Some(self.pending.remove(index))
    }

    // ── Initiator events ────────────────────────────────────────────

    pub fn apply_generation_event(&mut self, event: GenerationEvent) -> bool {
        debug!(local_id = %event.local_id(), "applying generation event");
        match event {
            GenerationEvent::Processing { local_id, task_id } => {
                if let Some(item) = self.pending.iter_mut().find(|p| p.id == local_id) {
                    item.mark_processing(task_id);
                }
                false
            }
            GenerationEvent::Completed { local_id, result } => {
                let placeholder = self.remove_pending(&local_id);
                match result {
                    GenerationResult::Single {
                        image_url,
                        prompt,
                        ref_images,
                    } => {
                        let mut batch = BatchResult::completed(
                            format!("single-{}", local_id),
                            prompt,
                            vec![ImageSlot::Ready { url: image_url }],
                            ref_images,
                        );
                        if let Some(item) = placeholder {
                            batch.timestamp = item.timestamp;
                        }
                        self.session_batches.push(batch);
                        true
                    }
                    GenerationResult::Batch { mut batch, quota_error } => {
                        if let Some(item) = placeholder {
                            batch.timestamp = item.timestamp;
                        }
                        if quota_error {
                            self.last_error = Some(UserError::new(QUOTA_MESSAGE, true));
                        }
                        self.session_batches.push(batch);
                        true
                    }
                    GenerationResult::Task { task } => self.on_task_completed(&task),
                }
            }
            GenerationEvent::Failed { local_id, task, error } => {
                let placeholder = self.remove_pending(&local_id);
                match task {
                    Some(task) => self.on_task_failed(&task),
                    None => {
                        let (prompt, timestamp) = placeholder
                            .map(|p| (p.prompt, p.timestamp))
                            .unwrap_or_else(|| (String::new(), now_millis()));
                        self.failed.push(FailedGeneration {
                            id: format!("failed-{}", local_id),
                            prompt,
                            error_message: error.message.clone(),
                            timestamp,
                        });
                        self.last_error = Some(error);
                        false
                    }
                }
            }
            GenerationEvent::Cancelled { local_id } => {
                self.remove_pending(&local_id);
                false
            }
        }
    }

    // ── Task outcomes (monitored or recovered) ──────────────────────

    /// Whether a terminal outcome for `task_id` has already been applied.
    /// The initiator and recovery can both report the same task.
    fn has_task_outcome(&self, task_id: &str) -> bool {
        let done = format!("task-{}", task_id);
        let failed = format!("failed-task-{}", task_id);
        self.session_batches
            .iter()
            .any(|b| b.batch_id == done || b.batch_id == failed)
            || self.failed.iter().any(|f| f.id == failed)
    }

    /// A task finished. Its image is shown at once; the persisted record
    /// replaces it on the next history reload. Repeat reports of the same
    /// task are ignored.
    pub fn on_task_completed(&mut self, task: &GenerationTask) -> bool {
        self.recovering.retain(|t| t.task_id != task.task_id);
        if self.has_task_outcome(&task.task_id) {
            debug!(task_id = %task.task_id, "task result already applied");
            return false;
        }
        if !task.image_url.is_empty() {
            let mut batch = BatchResult::completed(
                format!("task-{}", task.task_id),
                task.prompt.as_str(),
                vec![ImageSlot::Ready {
                    url: task.image_url.clone(),
                }],
                task.ref_image_list(),
            );
            batch.timestamp = task.timestamp_or(batch.timestamp);
            self.session_batches.push(batch);
        }
        info!(task_id = %task.task_id, "task result applied");
        true
    }

    /// A task failed. Multi-image tasks become a failed batch, others a
    /// failure record; both carry the sanitized error. Repeat reports of the
    /// same task are ignored.
    pub fn on_task_failed(&mut self, task: &GenerationTask) -> bool {
        self.recovering.retain(|t| t.task_id != task.task_id);
        if self.has_task_outcome(&task.task_id) {
            debug!(task_id = %task.task_id, "task failure already applied");
            return false;
        }
        let error = user_error(&task.error_msg);
        let id = format!("failed-task-{}", task.task_id);
        let timestamp = task.timestamp_or(now_millis());
        if task.image_count > 1 {
            let mut batch = BatchResult::failed(id, task.prompt.as_str(), task.image_count as usize, error.message.as_str());
            batch.ref_images = task.ref_image_list();
            batch.timestamp = timestamp;
            self.session_batches.push(batch);
        } else {
            self.failed.push(FailedGeneration {
                id,
                prompt: task.prompt.clone(),
                error_message: error.message.clone(),
                timestamp,
            });
        }
        self.last_error = Some(error);
        false
    }

    // ── Recovery events ─────────────────────────────────────────────

    /// Call once when recovery is mounted.
    pub fn begin_recovery(&mut self) {
        self.is_recovering = true;
    }

    pub fn apply_recovery_event(&mut self, event: RecoveryEvent) -> bool {
        match event {
            RecoveryEvent::Recovered { tasks } => {
                self.is_recovering = false;
                self.recovering = tasks;
                false
            }
            RecoveryEvent::RecoveryFailed { .. } => {
                self.is_recovering = false;
                false
            }
            RecoveryEvent::Completed { task } => self.on_task_completed(&task),
            RecoveryEvent::Failed { task, .. } => self.on_task_failed(&task),
        }
    }

    // ── SSE sessions ────────────────────────────────────────────────

    /// Mirror an in-progress batch. The placeholder identified by
    /// `correlation_id` learns the batch id, which hides it from the merged
    /// list while the batch streams.
    pub fn update_stream(&mut self, batch: &BatchResult, correlation_id: Option<&str>) {
        if let Some(local_id) = correlation_id {
            if let Some(item) = self.pending.iter_mut().find(|p| p.id == local_id) {
                item.batch_id = Some(batch.batch_id.clone());
            }
        }
        match self.streaming.iter_mut().find(|b| b.batch_id == batch.batch_id) {
            Some(existing) => *existing = batch.clone(),
            None => self.streaming.push(batch.clone()),
        }
    }

    /// Apply a terminal batch outcome.
    pub fn finish_stream(&mut self, outcome: &BatchOutcome) -> bool {
        let batch_id = outcome.batch.batch_id.as_str();
        self.streaming.retain(|b| b.batch_id != batch_id);
        let removed = match outcome.correlation_id.as_deref() {
            Some(local_id) => self.remove_pending(local_id),
            None => self.remove_pending_by_batch(batch_id),
        };
        if removed.is_none() {
            debug!(batch_id = %batch_id, "no placeholder for finished batch");
        }
        if outcome.quota_error {
            self.last_error = Some(UserError::new(QUOTA_MESSAGE, true));
        }
        self.session_batches.push(outcome.batch.clone());
        outcome.reload_history
    }

    /// Run one SSE session to its end, mirroring progress into this view.
    /// `correlation_id` is the local id of the session's pending placeholder.
    pub async fn run_stream(&mut self, events: EventStream, correlation_id: Option<String>) -> Option<BatchOutcome> {
        let mut handler = BatchHandler::new(correlation_id.clone());
        let outcome = handler
            .drive(events, |batch| self.update_stream(batch, correlation_id.as_deref()))
            .await;
        match &outcome {
            Some(outcome) => {
                self.finish_stream(outcome);
            }
            None => {
                // The connection ended before the backend opened a batch.
                if let Some(local_id) = correlation_id.as_deref() {
                    let placeholder = self.remove_pending(local_id);
                    let error = user_error("");
                    self.failed.push(FailedGeneration {
                        id: format!("failed-{}", local_id),
                        prompt: placeholder.map(|p| p.prompt).unwrap_or_default(),
                        error_message: error.message.clone(),
                        timestamp: now_millis(),
                    });
                    self.last_error = Some(error);
                }
            }
        }
        outcome
    }
}
