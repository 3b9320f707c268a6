//! Bounded polling against an eventually-consistent backend.

use std::future::Future;
use std::time::Duration;

use snapback_common::Result;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

/// Result of a bounded poll: either the value turned up, or the attempt
/// budget ran out. Exhaustion is an explicit outcome, not a null object.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Ready { value: T, attempts: u32 },
    Exhausted { attempts: u32 },
}

impl<T> RetryOutcome<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            RetryOutcome::Ready { value, .. } => Some(value),
            RetryOutcome::Exhausted { .. } => None,
        }
    }
}

/// Polls `probe` up to `policy.attempts` times. `Ok(None)` means "not there
/// yet"; probe errors are reported and consume an attempt, never propagate.
pub async fn bounded_poll<T, F, Fut>(policy: RetryPolicy, mut probe: F) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let mut attempts = 0;
    while attempts < policy.attempts {
        attempts += 1;
        match probe().await {
            Ok(Some(value)) => return RetryOutcome::Ready { value, attempts },
            Ok(None) => debug!(attempt = attempts, "probe found nothing yet"),
            Err(e) => warn!(attempt = attempts, error = %e, "probe attempt failed"),
        }
        if attempts < policy.attempts && !policy.delay.is_zero() {
            sleep(policy.delay).await;
        }
    }
    RetryOutcome::Exhausted { attempts }
}
