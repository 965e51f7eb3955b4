//! # imagegen-sync
//!
//! Async task lifecycle and history reconciliation for an AI image-generation
//! backend.
//!
//! A generation page has several kinds of in-flight work at once: requests
//! waiting for the backend to answer, async tasks being polled, multi-image
//! batches streaming over SSE, and tasks left running across a restart. This
//! crate tracks each of them and merges them with persisted history into one
//! ordered list, without duplicates or lost results.
//!
//! - [`TaskRegistry`]: global polling of backend tasks (2 s cadence)
//! - [`TaskRecovery`]: per-view recovery of tasks still processing on mount
//! - [`AsyncGenerator`]: fire-and-forget submission keyed by local ids
//! - [`BatchHandler`]: the SSE batch state machine
//! - [`merge_history`]: the five-source history merge
//! - [`GenerationView`]: per-view state applying all of the above
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use imagegen_sync::{
//!     ApiClient, AsyncGenerator, GenerateRequest, GenerationView, LogSink, SyncConfig,
//!     TaskRegistry,
//! };
//!
//! # async fn example() -> imagegen_sync::Result<()> {
//! imagegen_sync::logging::init_tracing();
//!
//! let config = SyncConfig::default();
//! let client = Arc::new(ApiClient::from_config(&config, None));
//! let registry = TaskRegistry::new(client.clone(), &config, Arc::new(LogSink));
//! let (generator, mut events) = AsyncGenerator::new(client.clone(), registry, &config);
//!
//! let mut view = GenerationView::new(config.generation_type);
//! view.reload_history(client.as_ref(), config.history_page_size).await?;
//!
//! view.add_pending(generator.start_generation(GenerateRequest::new("a red fox").count(1)));
//! while let Some(event) = events.recv().await {
//!     if view.apply_generation_event(event) {
//!         view.reload_history(client.as_ref(), config.history_page_size).await?;
//!     }
//!     if !generator.is_generating() {
//!         break;
//!     }
//! }
//! println!("{} items", view.display_items().len());
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod generation;
pub mod history;
pub mod logging;
pub mod recovery;
pub mod registry;
pub mod sanitize;
pub mod sse;
pub mod types;
pub mod view;

pub use bridge::{resolve_backend_url, save_remote_image, DesktopBridge};
pub use client::{ApiClient, GenerationBackend};
pub use config::{SyncConfig, SyncConfigBuilder};
pub use error::{Result, SyncError};
pub use events::{
    ChannelSink, GenerationEvent, GenerationResult, LogSink, Notification, NotificationLevel, NotificationSink,
    RecoveryEvent, RegistryEvent,
};
pub use generation::AsyncGenerator;
pub use history::{is_batch_complete, merge_history, DisplayContent, HistoryDisplayItem, HistorySources};
pub use recovery::TaskRecovery;
pub use registry::TaskRegistry;
pub use sanitize::{user_error, user_error_from, UserError};
pub use sse::{BatchHandler, BatchOutcome, EventStream, SessionState, StreamEvent};
pub use types::{
    BatchResult, BatchStatus, FailedGeneration, GenerateRequest, GenerateResponse, GenerationHistory, GenerationItem,
    GenerationStatus, GenerationTask, GenerationType, ImageSlot, RefImage, TaskStatus, WireImage,
};
pub use view::GenerationView;
