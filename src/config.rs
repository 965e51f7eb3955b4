use std::time::Duration;

use crate::types::GenerationType;

/// Backend used when neither the desktop bridge nor the environment names one.
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8080";

/// Environment variable consulted for the backend URL outside the desktop shell.
pub const BACKEND_URL_ENV: &str = "IMAGEGEN_BACKEND_URL";

/// Configuration for the task lifecycle layer.
///
/// Use [`SyncConfig::builder()`] for ergonomic construction, or
/// [`SyncConfig::default()`] for the stock 2 s polling cadence against a
/// local backend.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the generation backend. `None` = resolve at client creation.
    pub backend_url: Option<String>,

    /// Interval between status polls of a single task.
    pub poll_interval: Duration,

    /// Interval at which the generation initiator checks the registry caches.
    pub monitor_interval: Duration,

    /// Timeout for generation submissions (the request may block until a
    /// synchronous result is ready).
    pub request_timeout: Duration,

    /// Timeout for status, recovery, and history queries.
    pub status_timeout: Duration,

    /// Page size used when loading persisted history.
    pub history_page_size: u32,

    /// Give up on a task after this many polls. `None` = poll until terminal.
    pub max_poll_attempts: Option<u32>,

    /// Generation type this view submits and recovers.
    pub generation_type: GenerationType,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backend_url: None,
            poll_interval: Duration::from_millis(2000),
            monitor_interval: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
            status_timeout: Duration::from_secs(10),
            history_page_size: 100,
            max_poll_attempts: None,
            generation_type: GenerationType::Create,
        }
    }
}

impl SyncConfig {
    /// Start building a config with the builder pattern.
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }
}

/// Builder for [`SyncConfig`].
#[derive(Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    /// Use a fixed backend URL instead of bridge/environment resolution.
    pub fn with_backend_url(mut self, url: impl Into<String>) -> Self {
        self.config.backend_url = Some(url.into());
        self
    }

    /// Set the per-task status polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the interval of the initiator's completion monitor.
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.config.monitor_interval = interval;
        self
    }

    /// Set the timeout for generation submissions.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the timeout for status, recovery, and history queries.
    pub fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.config.status_timeout = timeout;
        self
    }

    /// Set the history page size.
    pub fn with_history_page_size(mut self, size: u32) -> Self {
        self.config.history_page_size = size.max(1);
        self
    }

    /// Bound the number of polls per task.
    pub fn with_max_poll_attempts(mut self, attempts: u32) -> Self {
        self.config.max_poll_attempts = Some(attempts);
        self
    }

    /// Set the generation type this view works with.
    pub fn with_generation_type(mut self, generation_type: GenerationType) -> Self {
        self.config.generation_type = generation_type;
        self
    }

    /// Build the final [`SyncConfig`].
    pub fn build(self) -> SyncConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(2000));
        assert_eq!(config.monitor_interval, Duration::from_millis(500));
        assert!(config.max_poll_attempts.is_none());
        assert!(config.backend_url.is_none());
        assert_eq!(config.generation_type, GenerationType::Create);
    }

    #[test]
    fn test_builder() {
        let config = SyncConfig::builder()
            .with_backend_url("http://127.0.0.1:9000")
            .with_poll_interval(Duration::from_millis(100))
            .with_max_poll_attempts(5)
            .with_history_page_size(0)
            .with_generation_type(GenerationType::WhiteBackground)
            .build();
        assert_eq!(config.backend_url.as_deref(), Some("http://127.0.0.1:9000"));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.max_poll_attempts, Some(5));
        assert_eq!(config.history_page_size, 1);
        assert_eq!(config.generation_type, GenerationType::WhiteBackground);
    }
}
