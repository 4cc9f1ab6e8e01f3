use tracing::warn;

/// Decision returned by the retry policy after a failed status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Query failed but attempts remain; wait one interval and query again
    /// (includes the 1-based count of consecutive failures so far).
    Retry { attempt: u32 },
    /// Consecutive failures reached the limit; give up polling.
    Exhausted,
}

/// Retry policy for transient status-query failures.
///
/// Counts consecutive failures of the status query for one work item.
/// A successful query resets the counter, so only an unbroken run of
/// `max_attempts` failures exhausts the policy.
pub struct RetryPolicy {
    max_attempts: u32,
    consecutive_failures: u32,
}

impl RetryPolicy {
    /// Create a new retry policy allowing `max_attempts` consecutive failures.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            consecutive_failures: 0,
        }
    }

    /// Record a failed query and decide what to do next.
    pub fn record_failure(&mut self, error: &str) -> RetryDecision {
        self.consecutive_failures += 1;

        if self.consecutive_failures < self.max_attempts {
            warn!(
                error,
                attempt = self.consecutive_failures,
                max_attempts = self.max_attempts,
                "status query failed, retrying"
            );
            RetryDecision::Retry {
                attempt: self.consecutive_failures,
            }
        } else {
            warn!(
                error,
                max_attempts = self.max_attempts,
                "status query failures exhausted"
            );
            RetryDecision::Exhausted
        }
    }

    /// Reset the failure counter after a successful query.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Current run of consecutive failures (0 = last query succeeded).
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
