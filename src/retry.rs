use crate::errors::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy as data: how many attempts, how long between them, and
/// whether the delay doubles after each failure.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub exponential: bool,
}

impl RetryPolicy {
    /// Queue publishes: 3 attempts, fixed 1s backoff.
    pub fn publish() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            exponential: false,
        }
    }

    /// Dependency calls: 3 attempts, exponential 1s/2s/4s.
    pub fn dependency() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            exponential: true,
        }
    }

    /// Connection establishment: 5 attempts, exponential from 1s.
    pub fn connect() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            exponential: true,
        }
    }
}

/// Run `op` until it succeeds or the policy is exhausted. The last error is
/// returned unchanged.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = policy.initial_backoff;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts => {
                tracing::warn!(
                    "Attempt {}/{} failed, retrying in {:?}: {}",
                    attempt,
                    policy.max_attempts,
                    backoff,
                    e
                );
                sleep(backoff).await;
                if policy.exponential {
                    backoff *= 2;
                }
            }
            Err(e) => return Err(e),
        }
    }
}
