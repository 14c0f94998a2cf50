use std::time::Duration;

use super::StoreError;

/// Retry policy for store access
///
/// An operation is attempted until it succeeds, fails with a non-transient error, or `max_tries`
/// attempts have been made. A negative `max_tries` retries forever. There is no backoff between
/// attempts: each attempt already blocks for up to `timeout` inside SQLite while another writer
/// holds the lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_tries: i64,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: -1,
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn unbounded(timeout: Duration) -> Self {
        Self {
            max_tries: -1,
            timeout,
        }
    }

    pub fn bounded(max_tries: i64, timeout: Duration) -> Self {
        Self {
            max_tries: max_tries.max(1),
            timeout,
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.max_tries >= 0
    }

    /// Run `attempt` under this policy
    ///
    /// `operation` names the call site in logs and in [StoreError::RetriesExhausted].
    pub fn run<T, F>(&self, operation: &str, mut attempt: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Result<T, StoreError>,
    {
        let mut tries: i64 = 0;
        loop {
            tries += 1;
            match attempt() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    if self.is_bounded() && tries >= self.max_tries.max(1) {
                        tracing::error!(
                            "Maximum SQLite tries exceeded for {} ({}/{})",
                            operation,
                            tries,
                            self.max_tries
                        );
                        return Err(StoreError::RetriesExhausted {
                            operation: operation.to_string(),
                            attempts: tries,
                            source: Box::new(err),
                        });
                    }
                    tracing::trace!("{} attempt {} hit a busy database: {}", operation, tries, err);
                }
                Err(err) => return Err(err),
            }
        }
    }
}
