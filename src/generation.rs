//! Fire-and-forget generation requests.
//!
//! [`AsyncGenerator::start_generation`] returns a pending placeholder at once
//! and submits in the background. Every later effect is matched to the
//! placeholder by its local id, captured when the request was created, so
//! responses may resolve in any order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::GenerationBackend;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::events::{GenerationEvent, GenerationResult};
use crate::registry::TaskRegistry;
use crate::sanitize::{user_error, user_error_from};
use crate::types::{slots_from_wire, BatchResult, GenerateRequest, GenerateResponse, GenerationItem, GenerationStatus};

struct Submission {
    item: GenerationItem,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct GeneratorState {
    /// In submission order.
    submissions: Vec<Submission>,
    monitor: Option<JoinHandle<()>>,
}

impl GeneratorState {
    fn position(&self, local_id: &str) -> Option<usize> {
        self.submissions.iter().position(|s| s.item.id == local_id)
    }

    fn remove(&mut self, local_id: &str) -> Option<Submission> {
        let index = self.position(local_id)?;
        Some(self.submissions.remove(index))
    }
}

struct Inner<B: GenerationBackend> {
    backend: Arc<B>,
    registry: TaskRegistry<B>,
    monitor_interval: Duration,
    events: mpsc::UnboundedSender<GenerationEvent>,
    state: Mutex<GeneratorState>,
}

impl<B: GenerationBackend> Inner<B> {
    fn lock(&self) -> MutexGuard<'_, GeneratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: GenerationEvent) {
        let _ = self.events.send(event);
    }

    fn on_submitted(&self, local_id: &str, result: Result<GenerateResponse>) {
        let mut state = self.lock();
        let Some(index) = state.position(local_id) else {
            debug!(local_id = %local_id, "response for a cancelled generation dropped");
            return;
        };
        state.submissions[index].handle = None;

        match result {
            Err(e) => {
                state.submissions.remove(index);
                drop(state);
                let error = user_error_from(&e);
                warn!(local_id = %local_id, error = %e, "generation request failed");
                self.emit(GenerationEvent::Failed {
                    local_id: local_id.to_string(),
                    task: None,
                    error,
                });
            }
            Ok(GenerateResponse::Task { task_id }) => {
                let item = &mut state.submissions[index].item;
                item.mark_processing(task_id.as_str());
                let generation_type = item.generation_type;
                // Registered under the generator lock so a concurrent cancel
                // either sees no submission or finds the task registered.
                // The registry never takes this lock.
                self.registry.register_task(&task_id, generation_type);
                info!(local_id = %local_id, task_id = %task_id, "generation accepted");
                self.emit(GenerationEvent::Processing {
                    local_id: local_id.to_string(),
                    task_id,
                });
                drop(state);
            }
            Ok(GenerateResponse::Single { image_url, ref_images }) => {
                let submission = state.submissions.remove(index);
                drop(state);
                self.emit(GenerationEvent::Completed {
                    local_id: local_id.to_string(),
                    result: GenerationResult::Single {
                        image_url,
                        prompt: submission.item.prompt,
                        ref_images,
                    },
                });
            }
            Ok(GenerateResponse::Multi {
                batch_id,
                images,
                ref_images,
            }) => {
                let submission = state.submissions.remove(index);
                drop(state);
                let (slots, quota_error) = slots_from_wire(&images);
                let batch = BatchResult::completed(batch_id, submission.item.prompt, slots, ref_images);
                self.emit(GenerationEvent::Completed {
                    local_id: local_id.to_string(),
                    result: GenerationResult::Batch { batch, quota_error },
                });
            }
        }
    }

    /// Resolve placeholders whose task has reached the registry's caches.
    fn check_registry(&self) {
        let watched: Vec<(String, String)> = self
            .lock()
            .submissions
            .iter()
            .filter(|s| s.item.status == GenerationStatus::Processing)
            .filter_map(|s| Some((s.item.id.clone(), s.item.task_id.clone()?)))
            .collect();

        for (local_id, task_id) in watched {
            if let Some(task) = self.registry.take_completed(&task_id) {
                if self.lock().remove(&local_id).is_none() {
                    continue;
                }
                self.emit(GenerationEvent::Completed {
                    local_id,
                    result: GenerationResult::Task { task },
                });
            } else if let Some(task) = self.registry.take_failed(&task_id) {
                if self.lock().remove(&local_id).is_none() {
                    continue;
                }
                let error = user_error(&task.error_msg);
                self.emit(GenerationEvent::Failed {
                    local_id,
                    task: Some(task),
                    error,
                });
            }
        }
    }
}

impl<B: GenerationBackend> Drop for Inner<B> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(monitor) = state.monitor.take() {
            monitor.abort();
        }
        for submission in state.submissions.drain(..) {
            if let Some(handle) = submission.handle {
                handle.abort();
            }
        }
    }
}

/// Submits generations and follows them to a terminal state.
pub struct AsyncGenerator<B: GenerationBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: GenerationBackend> AsyncGenerator<B> {
    /// Create a generator that hands async tasks to `registry`. Lifecycle
    /// events arrive on the returned receiver.
    pub fn new(
        backend: Arc<B>,
        registry: TaskRegistry<B>,
        config: &SyncConfig,
    ) -> (Self, mpsc::UnboundedReceiver<GenerationEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            backend,
            registry,
            monitor_interval: config.monitor_interval,
            events,
            state: Mutex::new(GeneratorState::default()),
        });
        (Self { inner }, rx)
    }

    /// Insert a pending placeholder and submit `request` in the background.
    /// Returns a copy of the placeholder; its `id` identifies every event
    /// about this request.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_generation(&self, request: GenerateRequest) -> GenerationItem {
        let item = GenerationItem::pending(request.prompt.as_str(), request.count, request.generation_type);
        let local_id = item.id.clone();

        let weak = Arc::downgrade(&self.inner);
        let backend = Arc::clone(&self.inner.backend);
        let id = local_id.clone();
        let mut state = self.inner.lock();
        let handle = tokio::spawn(async move {
            let result = backend.submit(&request).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_submitted(&id, result);
            }
        });
        state.submissions.push(Submission {
            item: item.clone(),
            handle: Some(handle),
        });
        if state.monitor.is_none() {
            state.monitor = Some(spawn_monitor(Arc::downgrade(&self.inner), self.inner.monitor_interval));
        }
        info!(local_id = %local_id, count = item.image_count, "generation started");
        item
    }

    /// Abandon a generation: stop its submission or polling and drop the
    /// placeholder. Returns whether it was still in flight.
    pub fn cancel_generation(&self, local_id: &str) -> bool {
        let Some(submission) = self.inner.lock().remove(local_id) else {
            return false;
        };
        if let Some(handle) = submission.handle {
            handle.abort();
        }
        if let Some(task_id) = &submission.item.task_id {
            self.inner.registry.unregister_task(task_id);
        }
        info!(local_id = %local_id, "generation cancelled");
        self.inner.emit(GenerationEvent::Cancelled {
            local_id: local_id.to_string(),
        });
        true
    }

    /// Placeholders not yet resolved, in submission order.
    pub fn pending_items(&self) -> Vec<GenerationItem> {
        self.inner
            .lock()
            .submissions
            .iter()
            .map(|s| s.item.clone())
            .collect()
    }

    pub fn is_generating(&self) -> bool {
        !self.inner.lock().submissions.is_empty()
    }

    pub fn registry(&self) -> &TaskRegistry<B> {
        &self.inner.registry
    }
}

fn spawn_monitor<B: GenerationBackend>(weak: Weak<Inner<B>>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.check_registry();
        }
    })
}
