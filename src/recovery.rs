//! On-mount recovery of tasks still processing on the backend.
//!
//! After a reload the registry is empty, but the backend may still be working
//! on tasks this view submitted. [`TaskRecovery::mount`] asks for them and
//! polls each on its own loop, owned by the view rather than the registry.
//! Unmounting (or dropping the handle) stops every loop, and no event is sent
//! after that point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::client::GenerationBackend;
use crate::config::SyncConfig;
use crate::events::RecoveryEvent;
use crate::registry::{poll_until_terminal, PollOutcome};
use crate::sanitize::{user_error, user_error_from};
use crate::types::{GenerationTask, GenerationType, TaskStatus};

struct RecoveryState {
    processing: Vec<GenerationTask>,
    is_recovering: bool,
    query: Option<JoinHandle<()>>,
    loops: HashMap<String, JoinHandle<()>>,
}

struct Shared {
    mounted: AtomicBool,
    state: Mutex<RecoveryState>,
    events: mpsc::UnboundedSender<RecoveryEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RecoveryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    fn emit(&self, event: RecoveryEvent) {
        if self.is_mounted() {
            let _ = self.events.send(event);
        }
    }
}

#[derive(Clone, Copy)]
struct PollSettings {
    generation_type: GenerationType,
    interval: Duration,
    max_attempts: Option<u32>,
}

/// Handle to one view's recovery. Dropping it unmounts.
pub struct TaskRecovery {
    shared: Arc<Shared>,
}

impl TaskRecovery {
    /// Query the backend for processing tasks of `config.generation_type` and
    /// start polling each. `is_recovering()` is true until the query resolves.
    ///
    /// Must be called from within a tokio runtime.
    pub fn mount<B: GenerationBackend>(
        backend: Arc<B>,
        config: &SyncConfig,
    ) -> (Self, mpsc::UnboundedReceiver<RecoveryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            mounted: AtomicBool::new(true),
            state: Mutex::new(RecoveryState {
                processing: Vec::new(),
                is_recovering: true,
                query: None,
                loops: HashMap::new(),
            }),
            events,
        });
        let settings = PollSettings {
            generation_type: config.generation_type,
            interval: config.poll_interval,
            max_attempts: config.max_poll_attempts,
        };

        let mut state = shared.lock();
        state.query = Some(tokio::spawn(recover(Arc::clone(&shared), backend, settings)));
        drop(state);

        (Self { shared }, rx)
    }

    /// Tasks recovered and not yet terminal.
    pub fn processing_tasks(&self) -> Vec<GenerationTask> {
        self.shared.lock().processing.clone()
    }

    /// True until the initial query has resolved, successfully or not.
    pub fn is_recovering(&self) -> bool {
        self.shared.lock().is_recovering
    }

    pub fn is_mounted(&self) -> bool {
        self.shared.is_mounted()
    }

    /// Stop the query and every poll loop. Idempotent.
    pub fn unmount(&self) {
        if !self.shared.mounted.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut state = self.shared.lock();
        if let Some(query) = state.query.take() {
            query.abort();
        }
        for (_, handle) in state.loops.drain() {
            handle.abort();
        }
    }
}

impl Drop for TaskRecovery {
    fn drop(&mut self) {
        self.unmount();
    }
}

async fn recover<B: GenerationBackend>(shared: Arc<Shared>, backend: Arc<B>, settings: PollSettings) {
    let kind = settings.generation_type.as_str();
    info!(kind, "recovering processing tasks");
    let result = backend.processing_tasks(settings.generation_type).await;
    if !shared.is_mounted() {
        return;
    }

    match result {
        Ok(tasks) => {
            info!(kind, count = tasks.len(), "found processing tasks");
            let mut state = shared.lock();
            for task in &tasks {
                if state.loops.contains_key(&task.task_id) {
                    continue;
                }
                let handle = tokio::spawn(watch_task(
                    Arc::clone(&shared),
                    Arc::clone(&backend),
                    task.task_id.clone(),
                    settings,
                ));
                state.loops.insert(task.task_id.clone(), handle);
            }
            state.processing = tasks.clone();
            state.is_recovering = false;
            // Sent under the lock so it precedes any per-task event.
            shared.emit(RecoveryEvent::Recovered { tasks });
        }
        Err(e) => {
            warn!(kind, error = %e, "task recovery query failed");
            shared.lock().is_recovering = false;
            shared.emit(RecoveryEvent::RecoveryFailed {
                error: user_error_from(&e),
            });
        }
    }
}

async fn watch_task<B: GenerationBackend>(
    shared: Arc<Shared>,
    backend: Arc<B>,
    task_id: String,
    settings: PollSettings,
) {
    let outcome = poll_until_terminal(
        backend.as_ref(),
        &task_id,
        settings.interval,
        settings.max_attempts,
        || shared.is_mounted(),
    )
    .await;

    let task = match outcome {
        PollOutcome::Terminal(task) => task,
        PollOutcome::Exhausted { attempts } => {
            warn!(task_id = %task_id, attempts, "giving up on recovered task");
            GenerationTask::abandoned(
                task_id.as_str(),
                settings.generation_type,
                format!("Task did not finish after {} status checks", attempts),
            )
        }
        PollOutcome::Cancelled => return,
    };

    {
        let mut state = shared.lock();
        if !shared.is_mounted() {
            return;
        }
        state.loops.remove(&task_id);
        state.processing.retain(|t| t.task_id != task_id);
    }

    if task.status == TaskStatus::Completed {
        info!(task_id = %task_id, "recovered task completed");
        shared.emit(RecoveryEvent::Completed { task });
    } else {
        info!(task_id = %task_id, error = %task.error_msg, "recovered task failed");
        let error = user_error(&task.error_msg);
        shared.emit(RecoveryEvent::Failed { task, error });
    }
}
