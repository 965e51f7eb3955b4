use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::sanitize::UserError;
use crate::types::{BatchResult, GenerationTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Success,
    Error,
}

/// A user-facing toast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    pub task_id: Option<String>,
}

impl Notification {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Success,
            message: message.into(),
            task_id: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Error,
            message: message.into(),
            task_id: None,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// Receives toasts on terminal events. Rendering is the implementor's
/// business; closures `Fn(Notification)` work directly.
pub trait NotificationSink: Send + Sync + 'static {
    fn notify(&self, notification: Notification);
}

impl<F> NotificationSink for F
where
    F: Fn(Notification) + Send + Sync + 'static,
{
    fn notify(&self, notification: Notification) {
        self(notification)
    }
}

/// Forwards notifications into a channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, notification: Notification) {
        // A closed receiver means the UI went away.
        let _ = self.tx.send(notification);
    }
}

/// Writes notifications to the log only. Used when no UI is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, notification: Notification) {
        match notification.level {
            NotificationLevel::Success => info!(message = %notification.message, "notification"),
            NotificationLevel::Error => warn!(message = %notification.message, "notification"),
        }
    }
}

/// Terminal transitions observed by the task registry.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RegistryEvent {
    Completed { task: GenerationTask },
    Failed { task: GenerationTask },
}

/// Progress of on-mount task recovery.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RecoveryEvent {
    /// The initial query resolved with these in-flight tasks.
    Recovered { tasks: Vec<GenerationTask> },
    /// The initial query failed; nothing is being recovered.
    RecoveryFailed { error: UserError },
    Completed { task: GenerationTask },
    Failed { task: GenerationTask, error: UserError },
}

/// What a submitted generation resolved to.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum GenerationResult {
    /// An async task finished; its record is now in persisted history.
    Task { task: GenerationTask },
    /// Synchronous single image.
    Single {
        image_url: String,
        prompt: String,
        ref_images: Vec<String>,
    },
    /// Synchronous multi-image batch. `quota_error` is set when any slot
    /// failed for lack of quota.
    #[serde(rename_all = "camelCase")]
    Batch { batch: BatchResult, quota_error: bool },
}

/// Lifecycle of requests started through the generation initiator. Every
/// event carries the local id the request was started with.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum GenerationEvent {
    /// The backend accepted the request as an async task.
    Processing { local_id: String, task_id: String },
    Completed {
        local_id: String,
        result: GenerationResult,
    },
    Failed {
        local_id: String,
        /// Backend task, when the failure came from polling.
        task: Option<GenerationTask>,
        error: UserError,
    },
    Cancelled { local_id: String },
}

impl GenerationEvent {
    pub fn local_id(&self) -> &str {
        match self {
            GenerationEvent::Processing { local_id, .. }
            | GenerationEvent::Completed { local_id, .. }
            | GenerationEvent::Failed { local_id, .. }
            | GenerationEvent::Cancelled { local_id } => local_id,
        }
    }
}
