//! Health verification by polling
//!
//! [`wait_until`] is the retry controller specialized to a fixed backoff equal
//! to the poll interval, with `timeout / poll_interval` attempts. The probe is
//! expected to be read-only; it is called once per attempt.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::retry::{run_attempts, RetryPolicy};

/// Default timeout for verification polling (5 minutes)
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(300);

/// Default poll interval for verification (5 seconds)
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// A verification condition never became true
#[derive(Debug, Clone, Error, PartialEq)]
#[error("timed out after {timeout:?} waiting for {description} ({probes} probes)")]
pub struct VerifyError {
    /// What was being waited for
    pub description: String,
    /// The configured timeout
    pub timeout: Duration,
    /// How many times the condition was probed
    pub probes: u32,
    /// The last probe error, when the final probe errored rather than returned false
    pub last_error: Option<String>,
}

/// Outcome of a single probe that did not satisfy the condition
enum Observation {
    NotMet,
    ProbeFailed(String),
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Observation::NotMet => write!(f, "condition not met"),
            Observation::ProbeFailed(e) => write!(f, "probe failed: {}", e),
        }
    }
}

/// Number of probes made for a timeout / poll interval pair
pub fn probe_budget(timeout: Duration, poll_interval: Duration) -> u32 {
    if poll_interval.is_zero() {
        return 1;
    }
    let probes = timeout.as_millis() / poll_interval.as_millis().max(1);
    u32::try_from(probes).unwrap_or(u32::MAX).max(1)
}

/// Poll `condition` until it returns `Ok(true)` or the probe budget runs out.
///
/// Probe errors are treated like "not yet": the external state may simply not
/// be answering yet. If the last probe errored, its message is kept in the
/// returned [`VerifyError`].
pub async fn wait_until<F, Fut, E>(
    description: &str,
    timeout: Duration,
    poll_interval: Duration,
    mut condition: F,
) -> Result<(), VerifyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: fmt::Display,
{
    let probes = probe_budget(timeout, poll_interval);
    let policy = RetryPolicy::fixed(probes, poll_interval);

    let result = run_attempts(&policy, description, None, |_: &Observation| true, true, || {
        let probe = condition();
        async move {
            match probe.await {
                Ok(true) => Ok(()),
                Ok(false) => Err(Observation::NotMet),
                Err(e) => Err(Observation::ProbeFailed(e.to_string())),
            }
        }
    })
    .await;

    match result {
        Ok(()) => {
            debug!(condition = %description, "condition satisfied");
            Ok(())
        }
        Err(e) => {
            let probes = e.attempts();
            let last_error = match e.into_inner() {
                Observation::NotMet => None,
                Observation::ProbeFailed(msg) => Some(msg),
            };
            Err(VerifyError {
                description: description.to_string(),
                timeout,
                probes,
                last_error,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn test_probe_budget() {
        assert_eq!(probe_budget(Duration::from_secs(10), Duration::from_secs(2)), 5);
        assert_eq!(probe_budget(Duration::from_secs(1), Duration::from_secs(5)), 1);
        assert_eq!(probe_budget(Duration::from_secs(10), Duration::ZERO), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_condition_becomes_true() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = wait_until(
            "members ready",
            Duration::from_secs(30),
            Duration::from_secs(5),
            || {
                let c = c.clone();
                async move { Ok::<_, String>(c.fetch_add(1, Ordering::SeqCst) >= 2) }
            },
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_uses_whole_budget() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let start = Instant::now();

        let err = wait_until(
            "crd ippools",
            Duration::from_secs(10),
            Duration::from_secs(2),
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(false)
                }
            },
        )
        .await
        .unwrap_err();

        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert_eq!(err.probes, 5);
        assert_eq!(err.last_error, None);
        assert_eq!(start.elapsed(), Duration::from_secs(8));
        assert!(err.to_string().contains("crd ippools"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_errors_are_retried_and_last_one_kept() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let err = wait_until(
            "api server",
            Duration::from_secs(3),
            Duration::from_secs(1),
            || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    Err::<bool, _>(format!("connection refused #{}", n))
                }
            },
        )
        .await
        .unwrap_err();

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(err.last_error.as_deref(), Some("connection refused #3"));
    }
}
