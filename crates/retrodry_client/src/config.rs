//! Configuration for client sessions.

use std::time::Duration;

/// Configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server base URLs, tried in order on transport failure.
    pub servers: Vec<String>,
    /// How long the server may hold each long-poll open.
    pub long_poll_timeout: Duration,
    /// Extra time allowed on top of the long-poll timeout before the client
    /// gives up on a request.
    pub request_timeout: Duration,
    /// Prompt language requested at session start.
    pub language: Option<String>,
    /// Ask the server for dense daton encoding.
    pub dense: bool,
    /// Backoff for the long-poll loop after transport failures.
    pub retry: RetryConfig,
}

impl SessionConfig {
    /// Creates a configuration for a list of servers.
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            long_poll_timeout: Duration::from_secs(20),
            request_timeout: Duration::from_secs(30),
            language: None,
            dense: false,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the long-poll timeout.
    pub fn with_long_poll_timeout(mut self, timeout: Duration) -> Self {
        self.long_poll_timeout = timeout;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the prompt language.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Requests dense encoding.
    pub fn with_dense(mut self, dense: bool) -> Self {
        self.dense = dense;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

/// Exponential backoff for retried requests.
///
/// The long-poll loop never gives up; `max_attempts` caps how far the
/// delay grows.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempt count after which the delay stops growing.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Retries immediately, without backoff.
    pub fn no_backoff() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (0 means the first try).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.min(self.max_attempts.max(1)).saturating_sub(1);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent as i32);
        let delay = base.min(self.max_delay.as_secs_f64());
        if self.add_jitter {
            // Up to 25% extra.
            Duration::from_secs_f64(delay + delay * 0.25 * jitter_fraction())
        } else {
            Duration::from_secs_f64(delay)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(6)
    }
}

/// A value in `[0, 1)` taken from the clock; good enough to spread retries.
fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}
