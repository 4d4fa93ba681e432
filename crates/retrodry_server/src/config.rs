//! Coordinator configuration.

use retrodry_core::DEFAULT_LANGUAGE;
use std::time::Duration;

/// Configuration for a [`Coordinator`](crate::Coordinator).
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Name used in logs to tell instances apart.
    pub instance_name: String,
    /// Longest time a long-poll request is held, whatever the client asks.
    pub long_poll_cap: Duration,
    /// Sessions idle for longer than this are reaped.
    pub session_idle_timeout: Duration,
    /// How often the reaper runs.
    pub reap_interval: Duration,
    /// How often the change pump checks the shared change log.
    pub propagation_interval: Duration,
    /// Language used when a session does not ask for one.
    pub default_language: String,
    /// Maximum items in one get, save or subscribe request.
    pub max_batch: usize,
    /// Maximum change records read per long-poll check.
    pub max_changes_per_poll: usize,
    /// Reject unknown members in incoming diff JSON.
    pub strict_decoding: bool,
}

impl CoordinatorConfig {
    /// Creates a configuration with defaults.
    pub fn new(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            long_poll_cap: Duration::from_secs(30),
            session_idle_timeout: Duration::from_secs(5 * 60),
            reap_interval: Duration::from_secs(30),
            propagation_interval: Duration::from_millis(250),
            default_language: DEFAULT_LANGUAGE.to_string(),
            max_batch: 100,
            max_changes_per_poll: 1000,
            strict_decoding: false,
        }
    }

    /// Sets the long-poll cap.
    pub fn with_long_poll_cap(mut self, cap: Duration) -> Self {
        self.long_poll_cap = cap;
        self
    }

    /// Sets the idle timeout after which sessions are reaped.
    pub fn with_session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.session_idle_timeout = timeout;
        self
    }

    /// Sets the reaper interval.
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Sets the change pump interval.
    pub fn with_propagation_interval(mut self, interval: Duration) -> Self {
        self.propagation_interval = interval;
        self
    }

    /// Sets the default language.
    pub fn with_default_language(mut self, language: impl Into<String>) -> Self {
        self.default_language = language.into();
        self
    }

    /// Sets the maximum batch size.
    pub fn with_max_batch(mut self, max: usize) -> Self {
        self.max_batch = max;
        self
    }

    /// Sets how many change records one long-poll check reads.
    pub fn with_max_changes_per_poll(mut self, max: usize) -> Self {
        self.max_changes_per_poll = max;
        self
    }

    /// Enables strict decoding of diff JSON.
    pub fn with_strict_decoding(mut self, strict: bool) -> Self {
        self.strict_decoding = strict;
        self
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::new("retrodry")
    }
}
