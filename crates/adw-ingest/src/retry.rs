//! Bounded retry with linear backoff for extraction calls

use crate::extract::ExtractError;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of attempts per extraction
pub const MAX_RETRIES: u32 = 3;

/// Base delay between attempts; attempt N waits N times this
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay: RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            base_delay,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ExtractError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExtractError>>,
    {
        let attempts = self.max_retries.max(1);
        let mut attempt = 1;
        loop {
            debug!("Extraction attempt {}/{} for {}", attempt, attempts, label);
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.base_delay * attempt;
                    warn!(
                        "Extraction attempt {}/{} for {} failed: {}. Retrying in {:?}...",
                        attempt, attempts, label, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) if e.is_transient() => {
                    return Err(ExtractError::Transient(format!(
                        "{} after {} attempts",
                        e.message(),
                        attempts
                    )))
                },
                Err(e) => return Err(e),
            }
        }
    }
}
