//! Configuration for the sync engine.

use docsync_protocol::IndexMode;
use rand::Rng;
use std::time::Duration;

/// Configuration for a client engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the docsync server.
    pub server_url: String,
    /// Name of this client, used in log fields only.
    pub client_id: String,
    /// Page size requested from `GET /changes`.
    pub pull_batch_size: usize,
    /// Interval between background pulls.
    pub poll_interval: Duration,
    /// Backoff for submissions and pulls.
    pub retry: RetryConfig,
    /// Request timeout.
    pub timeout: Duration,
    /// Index mode the client expects the store to use.
    ///
    /// When set, a pull reporting a different mode forces a resync from the
    /// snapshot instead of merging the page.
    pub expected_index_mode: Option<IndexMode>,
    /// Quiet interval before a debounced backup is flushed.
    pub backup_debounce: Duration,
}

impl SyncConfig {
    /// Creates a configuration for the server at `server_url`.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            client_id: "docsync-client".into(),
            pull_batch_size: 200,
            poll_interval: Duration::from_secs(5),
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(30),
            expected_index_mode: None,
            backup_debounce: Duration::from_secs(2),
        }
    }

    /// Sets the client name.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Sets the pull page size.
    pub fn with_pull_batch_size(mut self, size: usize) -> Self {
        self.pull_batch_size = size.max(1);
        self
    }

    /// Sets the background pull interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the index mode the client expects.
    pub fn with_expected_index_mode(mut self, mode: IndexMode) -> Self {
        self.expected_index_mode = Some(mode);
        self
    }

    /// Sets the backup debounce interval.
    pub fn with_backup_debounce(mut self, debounce: Duration) -> Self {
        self.backup_debounce = debounce;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("http://127.0.0.1:7070")
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts made by bounded operations (bootstrap, pull, draining
    /// submissions at shutdown). Live submissions retry until they succeed.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
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
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay before `attempt` (0-indexed; the first attempt
    /// has no delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            // Up to 25% on top.
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen_range(0.0..1.0);
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
