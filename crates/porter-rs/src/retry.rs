//! Bounded retry with exponential backoff for driver calls.
//!
//! Retries rate limits (429), a fixed set of transient statuses (408, 5xx),
//! and network-level failures with a strictly doubling delay. Never retries
//! other definite statuses such as 400 or 401. The backoff has no upper cap
//! and no jitter; the attempt cap bounds the total wait.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (1 = no retries, just fail immediately).
    pub max_attempts: u32,
    /// Delay before the first retry; doubles after every further retry.
    pub initial_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryConfig {
    /// Create a config with the given attempt cap. Uses the default delay.
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Whether an error string reports a rate-limited exchange.
pub fn is_rate_limited(error: &str) -> bool {
    error.contains("HTTP 429")
}

/// Whether an error is worth another attempt.
///
/// Errors carrying no HTTP status are network-level failures and always
/// qualify; otherwise only a fixed set of statuses does.
pub fn is_retryable(error: &str) -> bool {
    let transient_statuses = ["408", "429", "500", "502", "503", "504"];
    if transient_statuses
        .iter()
        .any(|s| error.contains(&format!("HTTP {s}")))
    {
        return true;
    }
    // Any other definite status: the backend answered, and retrying won't
    // change its mind.
    !error.contains("HTTP ")
}

/// Run `call` with bounded retries and doubling backoff.
///
/// Rate limits get their own branch: they back off while attempts remain and
/// fail hard with the captured error on the last attempt, never falling
/// through to the generic classification. Each retry logs the attempt number
/// and the delay about to be slept.
pub async fn retry_call<T, F, Fut>(config: &RetryConfig, mut call: F) -> Result<T, String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let mut delay = config.initial_delay;
    // Placeholder so a zero-attempt config never reports an empty failure.
    let mut last_error = String::from("driver call was never attempted");

    for attempt in 1..=config.max_attempts {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let last = attempt == config.max_attempts;
                if is_rate_limited(&e) {
                    if last {
                        return Err(e);
                    }
                    warn!(
                        "Rate limited (attempt {attempt}/{}), retrying in {delay:?}",
                        config.max_attempts,
                    );
                } else if !last && is_retryable(&e) {
                    warn!(
                        "Transient driver error (attempt {attempt}/{}): {e}. Retrying in {delay:?}",
                        config.max_attempts,
                    );
                } else {
                    return Err(e);
                }
                tokio::time::sleep(delay).await;
                delay *= 2;
                last_error = e;
            }
        }
    }

    Err(last_error)
}
