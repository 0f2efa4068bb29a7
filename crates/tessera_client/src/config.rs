//! Configuration for the sync loop.

use std::time::Duration;

/// Options controlling the sync loop.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// How long the server may hold a sync request open.
    pub timeout: Duration,
    /// Backoff applied between consecutive failed iterations.
    pub retry: RetryConfig,
}

impl SyncOptions {
    /// Creates sync options with the default 5 minute long-poll timeout.
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the long-poll timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for backoff between failed sync iterations.
///
/// The loop itself never gives up; this only paces how quickly it re-issues
/// a request after a failure. The delay resets after any success.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound for the delay.
    pub max_delay: Duration,
    /// Multiplier applied for each further consecutive failure.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_multiplier: 2.0,
        }
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay after `failures` consecutive failed iterations
    /// (1-indexed; zero failures means no delay).
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(failures.saturating_sub(1).min(20) as i32);

        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}
