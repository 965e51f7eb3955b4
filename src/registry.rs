//! Global task registry.
//!
//! Holds every in-flight backend task the application has submitted and polls
//! each one on its own tokio task until it reaches a terminal status. Terminal
//! results land in short-lived `completed`/`failed` caches from which a view
//! takes them exactly once.
//!
//! Cloning a [`TaskRegistry`] is cheap and shares the same state. Poll loops
//! hold only a weak reference, so dropping the last handle stops all of them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::GenerationBackend;
use crate::config::SyncConfig;
use crate::events::{Notification, NotificationSink, RegistryEvent};
use crate::sanitize::user_error;
use crate::types::{GenerationTask, GenerationType, TaskStatus};

/// How a single task's poll loop ended.
#[derive(Debug)]
pub(crate) enum PollOutcome {
    Terminal(GenerationTask),
    /// `max_poll_attempts` polls without a terminal status.
    Exhausted { attempts: u32 },
    /// The owner dropped the registration while a poll was in flight.
    Cancelled,
}

/// Poll `task_id` immediately and then every `interval` until terminal.
///
/// Polls are strictly sequential: the next sleep starts only after the
/// previous response has been handled. `is_live` is consulted after every
/// response; once it returns false the loop ends without reporting anything.
/// Transport and parse errors are logged and polling continues.
pub(crate) async fn poll_until_terminal<B, F>(
    backend: &B,
    task_id: &str,
    interval: Duration,
    max_attempts: Option<u32>,
    is_live: F,
) -> PollOutcome
where
    B: GenerationBackend,
    F: Fn() -> bool,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let result = backend.task_status(task_id).await;
        if !is_live() {
            return PollOutcome::Cancelled;
        }
        match result {
            Ok(task) if task.status.is_terminal() => return PollOutcome::Terminal(task),
            Ok(task) => debug!(task_id = %task_id, status = ?task.status, attempts, "task still running"),
            Err(e) => warn!(task_id = %task_id, error = %e, "task status poll failed"),
        }
        if max_attempts.is_some_and(|max| attempts >= max) {
            return PollOutcome::Exhausted { attempts };
        }
        tokio::time::sleep(interval).await;
    }
}

struct Registration {
    generation_type: GenerationType,
    token: u64,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct RegistryState {
    tasks: HashMap<String, Registration>,
    completed: HashMap<String, GenerationTask>,
    failed: HashMap<String, GenerationTask>,
    listeners: Vec<mpsc::UnboundedSender<RegistryEvent>>,
    next_token: u64,
}

struct Inner<B: GenerationBackend> {
    backend: Arc<B>,
    sink: Arc<dyn NotificationSink>,
    poll_interval: Duration,
    max_poll_attempts: Option<u32>,
    state: Mutex<RegistryState>,
}

impl<B: GenerationBackend> Inner<B> {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_live(&self, task_id: &str, token: u64) -> bool {
        self.lock()
            .tasks
            .get(task_id)
            .is_some_and(|r| r.token == token)
    }

    /// Record a terminal task, provided the registration that produced it is
    /// still current.
    fn finish(&self, task_id: &str, token: u64, task: GenerationTask) {
        let (generation_type, listeners) = {
            let mut state = self.lock();
            match state.tasks.get(task_id) {
                Some(r) if r.token == token => {}
                _ => return,
            }
            let registration = state.tasks.remove(task_id);
            let generation_type = registration
                .map(|r| r.generation_type)
                .unwrap_or(GenerationType::Create);
            if task.status == TaskStatus::Completed {
                state.completed.insert(task_id.to_string(), task.clone());
            } else {
                state.failed.insert(task_id.to_string(), task.clone());
            }
            state.listeners.retain(|tx| !tx.is_closed());
            (generation_type, state.listeners.clone())
        };

        let name = generation_type.display_name();
        let (notification, event) = if task.status == TaskStatus::Completed {
            info!(task_id = %task_id, "task completed");
            (
                Notification::success(format!("{} generation completed", name)),
                RegistryEvent::Completed { task },
            )
        } else {
            let error = user_error(&task.error_msg);
            info!(task_id = %task_id, error = %task.error_msg, "task failed");
            (
                Notification::error(format!("{} generation failed: {}", name, error.message)),
                RegistryEvent::Failed { task },
            )
        };
        self.sink.notify(notification.with_task(task_id));
        for tx in listeners {
            let _ = tx.send(event.clone());
        }
    }

    fn abort_all(state: &mut RegistryState) {
        for (_, registration) in state.tasks.drain() {
            if let Some(handle) = registration.handle {
                handle.abort();
            }
        }
    }
}

impl<B: GenerationBackend> Drop for Inner<B> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        Self::abort_all(state);
    }
}

/// Process-wide registry of backend tasks being polled.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use imagegen_sync::{ApiClient, GenerationType, LogSink, SyncConfig, TaskRegistry};
///
/// # async fn example() {
/// let config = SyncConfig::default();
/// let client = Arc::new(ApiClient::from_config(&config, None));
/// let registry = TaskRegistry::new(client, &config, Arc::new(LogSink));
/// registry.register_task("3f1c...", GenerationType::Create);
/// # }
/// ```
pub struct TaskRegistry<B: GenerationBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: GenerationBackend> Clone for TaskRegistry<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: GenerationBackend> TaskRegistry<B> {
    pub fn new(backend: Arc<B>, config: &SyncConfig, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                sink,
                poll_interval: config.poll_interval,
                max_poll_attempts: config.max_poll_attempts,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    /// Start polling `task_id`. Polls once immediately, then every
    /// `poll_interval`. Returns `false` if the task is already registered.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register_task(&self, task_id: &str, generation_type: GenerationType) -> bool {
        let mut state = self.inner.lock();
        if state.tasks.contains_key(task_id) {
            debug!(task_id = %task_id, "task already registered");
            return false;
        }
        state.next_token += 1;
        let token = state.next_token;

        let weak = Arc::downgrade(&self.inner);
        let backend = Arc::clone(&self.inner.backend);
        let interval = self.inner.poll_interval;
        let max_attempts = self.inner.max_poll_attempts;
        let id = task_id.to_string();
        let handle = tokio::spawn(async move {
            run_poll_loop(weak, backend, id, token, interval, max_attempts).await;
        });

        state.tasks.insert(
            task_id.to_string(),
            Registration {
                generation_type,
                token,
                handle: Some(handle),
            },
        );
        info!(task_id = %task_id, kind = generation_type.as_str(), "task registered");
        true
    }

    /// Stop polling `task_id` and forget it. Returns whether it was registered.
    pub fn unregister_task(&self, task_id: &str) -> bool {
        let registration = self.inner.lock().tasks.remove(task_id);
        match registration {
            Some(r) => {
                if let Some(handle) = r.handle {
                    handle.abort();
                }
                debug!(task_id = %task_id, "task unregistered");
                true
            }
            None => false,
        }
    }

    pub fn is_task_polling(&self, task_id: &str) -> bool {
        self.inner.lock().tasks.contains_key(task_id)
    }

    /// Ids of every task currently being polled.
    pub fn registered_tasks(&self) -> Vec<String> {
        self.inner.lock().tasks.keys().cloned().collect()
    }

    pub fn get_completed_task(&self, task_id: &str) -> Option<GenerationTask> {
        self.inner.lock().completed.get(task_id).cloned()
    }

    pub fn clear_completed_task(&self, task_id: &str) {
        self.inner.lock().completed.remove(task_id);
    }

    pub fn get_failed_task(&self, task_id: &str) -> Option<GenerationTask> {
        self.inner.lock().failed.get(task_id).cloned()
    }

    pub fn clear_failed_task(&self, task_id: &str) {
        self.inner.lock().failed.remove(task_id);
    }

    /// Get and evict a completed result in one step. Of several concurrent
    /// callers, exactly one receives the task.
    pub fn take_completed(&self, task_id: &str) -> Option<GenerationTask> {
        self.inner.lock().completed.remove(task_id)
    }

    /// Failed counterpart of [`take_completed`](Self::take_completed).
    pub fn take_failed(&self, task_id: &str) -> Option<GenerationTask> {
        self.inner.lock().failed.remove(task_id)
    }

    /// Receive every terminal transition from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RegistryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().listeners.push(tx);
        rx
    }

    /// Cancel every poll loop and forget all registrations. Cached terminal
    /// results are kept.
    pub fn shutdown(&self) {
        let mut state = self.inner.lock();
        let count = state.tasks.len();
        Inner::<B>::abort_all(&mut state);
        if count > 0 {
            info!(count, "task registry shut down");
        }
    }
}

async fn run_poll_loop<B: GenerationBackend>(
    inner: Weak<Inner<B>>,
    backend: Arc<B>,
    task_id: String,
    token: u64,
    interval: Duration,
    max_attempts: Option<u32>,
) {
    let is_live = || {
        inner
            .upgrade()
            .is_some_and(|inner| inner.is_live(&task_id, token))
    };
    let outcome = poll_until_terminal(backend.as_ref(), &task_id, interval, max_attempts, is_live).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    match outcome {
        PollOutcome::Terminal(task) => inner.finish(&task_id, token, task),
        PollOutcome::Exhausted { attempts } => {
            warn!(task_id = %task_id, attempts, "giving up on task");
            let generation_type = inner
                .lock()
                .tasks
                .get(&task_id)
                .map(|r| r.generation_type)
                .unwrap_or(GenerationType::Create);
            let task = GenerationTask::abandoned(
                task_id.as_str(),
                generation_type,
                format!("Task did not finish after {} status checks", attempts),
            );
            inner.finish(&task_id, token, task);
        }
        PollOutcome::Cancelled => debug!(task_id = %task_id, "poll loop cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, SyncError};
    use crate::types::{GenerateRequest, GenerateResponse, GenerationHistory};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replies with scripted statuses; the last one repeats.
    struct Scripted {
        replies: Mutex<VecDeque<Result<TaskStatus>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(replies: Vec<Result<TaskStatus>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    fn task(id: &str, status: TaskStatus) -> GenerationTask {
        let mut t = GenerationTask::abandoned(id, GenerationType::Create, "");
        t.status = status;
        t
    }

    impl GenerationBackend for Scripted {
        async fn submit(&self, _: &GenerateRequest) -> Result<GenerateResponse> {
            Err(SyncError::Other("unused".into()))
        }

        async fn task_status(&self, task_id: &str) -> Result<GenerationTask> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().unwrap();
            let reply = if replies.len() > 1 {
                replies.pop_front().unwrap()
            } else {
                match replies.front().unwrap() {
                    Ok(s) => Ok(*s),
                    Err(_) => Err(SyncError::Other("offline".into())),
                }
            };
            reply.map(|s| task(task_id, s))
        }

        async fn processing_tasks(&self, _: GenerationType) -> Result<Vec<GenerationTask>> {
            Ok(Vec::new())
        }

        async fn history(&self, _: u32, _: u32) -> Result<Vec<GenerationHistory>> {
            Ok(Vec::new())
        }
    }

    fn registry(backend: Arc<Scripted>, config: SyncConfig) -> TaskRegistry<Scripted> {
        TaskRegistry::new(backend, &config, Arc::new(crate::events::LogSink))
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_errors_are_swallowed() {
        let backend = Scripted::new(vec![
            Err(SyncError::Other("offline".into())),
            Ok(TaskStatus::Processing),
            Ok(TaskStatus::Completed),
        ]);
        let registry = registry(backend.clone(), SyncConfig::default());
        assert!(registry.register_task("t1", GenerationType::Create));
        assert!(!registry.register_task("t1", GenerationType::Create));

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert!(!registry.is_task_polling("t1"));
        assert!(registry.get_completed_task("t1").is_some());
        assert!(registry.get_failed_task("t1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_attempts_gives_up() {
        let backend = Scripted::new(vec![Ok(TaskStatus::Processing)]);
        let config = SyncConfig::builder().with_max_poll_attempts(3).build();
        let registry = registry(backend.clone(), config);
        registry.register_task("t2", GenerationType::LightShadow);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        let failed = registry.take_failed("t2").unwrap();
        assert_eq!(failed.generation_type(), Some(GenerationType::LightShadow));
        assert!(failed.error_msg.contains("3 status checks"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_polling() {
        let backend = Scripted::new(vec![Ok(TaskStatus::Processing)]);
        let registry = registry(backend.clone(), SyncConfig::default());
        registry.register_task("a", GenerationType::Create);
        registry.register_task("b", GenerationType::Create);
        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.shutdown();
        let calls = backend.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), calls);
        assert!(registry.registered_tasks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_polling() {
        let backend = Scripted::new(vec![Ok(TaskStatus::Processing)]);
        let registry = registry(backend.clone(), SyncConfig::default());
        registry.register_task("a", GenerationType::Create);
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(registry);
        let calls = backend.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), calls);
    }
}
