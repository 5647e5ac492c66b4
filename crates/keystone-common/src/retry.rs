//! Retry utilities with bounded backoff.
//!
//! Every network- or eventually-consistent operation goes through
//! [`retry_with_backoff`] or [`retry_classified`] instead of hand-rolled
//! sleep loops. Attempts are always bounded, and on exhaustion the caller
//! gets the last observed error back unchanged.
//!
//! # Example
//!
//! ```ignore
//! use keystone_common::retry::{retry_with_backoff, RetryPolicy};
//!
//! let packages = retry_with_backoff(
//!     &RetryPolicy::with_max_attempts(3),
//!     "download_packages",
//!     || async { fetch_packages().await },
//! )
//! .await
//! .map_err(|e| e.into_inner())?;
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, trace, warn};

/// How the wait between attempts grows
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Constant delay
    Fixed,
    /// `initial_delay * attempt`
    Linear,
    /// `initial_delay * 2^(attempt - 1)`
    Exponential,
}

impl fmt::Display for BackoffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffKind::Fixed => write!(f, "fixed"),
            BackoffKind::Linear => write!(f, "linear"),
            BackoffKind::Exponential => write!(f, "exponential"),
        }
    }
}

impl FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" => Ok(BackoffKind::Fixed),
            "linear" => Ok(BackoffKind::Linear),
            "exponential" => Ok(BackoffKind::Exponential),
            _ => Err(format!(
                "invalid backoff '{}', must be 'fixed', 'linear' or 'exponential'",
                s
            )),
        }
    }
}

/// Retry policy for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts; at least one attempt is always made
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Growth of the delay between attempts
    pub backoff: BackoffKind,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Scale each delay by a random factor in 0.5..1.5 (still capped at `max_delay`)
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            backoff: BackoffKind::Exponential,
            max_delay: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a constant-delay policy
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            backoff: BackoffKind::Fixed,
            max_delay: delay,
            jitter: false,
        }
    }

    /// Attempts actually made (zero is treated as one)
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Un-jittered delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let raw = match self.backoff {
            BackoffKind::Fixed => self.initial_delay,
            BackoffKind::Linear => self.initial_delay.saturating_mul(attempt),
            BackoffKind::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.initial_delay.saturating_mul(factor)
            }
        };
        raw.min(self.max_delay)
    }

    /// Sum of every sleep the policy can perform before giving up
    pub fn total_delay(&self) -> Duration {
        (1..self.attempts())
            .map(|attempt| self.delay_for(attempt))
            .fold(Duration::ZERO, |acc, d| acc.saturating_add(d))
    }

    fn sleep_for(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if !self.jitter {
            return delay;
        }
        // 0.5x to 1.5x of the delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(delay.as_secs_f64() * jitter).min(self.max_delay)
    }
}

/// Failure of a retried operation.
///
/// Every variant carries the last error returned by the operation; nothing is
/// summarized away.
#[derive(Debug, PartialEq)]
pub enum RetryError<E> {
    /// All attempts failed
    Exhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error from the final attempt
        last: E,
    },
    /// The operation returned an error classified as not retryable
    NonRetryable {
        /// Number of attempts made
        attempts: u32,
        /// The non-retryable error
        last: E,
    },
    /// Sleeping before the next attempt would overrun the deadline
    DeadlineExceeded {
        /// Number of attempts made
        attempts: u32,
        /// Error from the final attempt
        last: E,
    },
}

impl<E> RetryError<E> {
    /// The last underlying error
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. }
            | RetryError::NonRetryable { last, .. }
            | RetryError::DeadlineExceeded { last, .. } => last,
        }
    }

    /// Borrow the last underlying error
    pub fn last(&self) -> &E {
        match self {
            RetryError::Exhausted { last, .. }
            | RetryError::NonRetryable { last, .. }
            | RetryError::DeadlineExceeded { last, .. } => last,
        }
    }

    /// Number of attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::NonRetryable { attempts, .. }
            | RetryError::DeadlineExceeded { attempts, .. } => *attempts,
        }
    }

    /// Whether the deadline, rather than the attempt budget, stopped the retries
    pub fn is_deadline(&self) -> bool {
        matches!(self, RetryError::DeadlineExceeded { .. })
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "{} (after {} attempts)", last, attempts)
            }
            RetryError::NonRetryable { attempts, last } => {
                write!(f, "{} (not retryable, attempt {})", last, attempts)
            }
            RetryError::DeadlineExceeded { attempts, last } => {
                write!(
                    f,
                    "{} (deadline reached after {} attempts)",
                    last, attempts
                )
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Execute an async operation, retrying every error per `policy`.
///
/// # Returns
/// The result of the operation, or the last error once `max_attempts` is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    retry_classified(policy, operation_name, None, |_| true, operation).await
}

/// Execute an async operation with error classification and an optional deadline.
///
/// Errors for which `is_retryable` returns false stop immediately. If sleeping
/// before the next attempt would pass `deadline`, returns
/// [`RetryError::DeadlineExceeded`] without sleeping.
pub async fn retry_classified<F, Fut, T, E, R>(
    policy: &RetryPolicy,
    operation_name: &str,
    deadline: Option<Instant>,
    is_retryable: R,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: fmt::Display,
    R: Fn(&E) -> bool,
{
    run_attempts(
        policy,
        operation_name,
        deadline,
        is_retryable,
        false,
        operation,
    )
    .await
}

/// Shared attempt loop. `quiet` drops per-attempt logging to trace, which
/// polling callers use since "not yet" is the expected outcome there.
pub(crate) async fn run_attempts<F, Fut, T, E, R>(
    policy: &RetryPolicy,
    operation_name: &str,
    deadline: Option<Instant>,
    is_retryable: R,
    quiet: bool,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: fmt::Display,
    R: Fn(&E) -> bool,
{
    let max_attempts = policy.attempts();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !is_retryable(&e) {
            warn!(
                operation = %operation_name,
                attempt,
                error = %e,
                "Operation failed with non-retryable error"
            );
            return Err(RetryError::NonRetryable { attempts: attempt, last: e });
        }

        if attempt >= max_attempts {
            if !quiet {
                error!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "Operation failed after max attempts"
                );
            }
            return Err(RetryError::Exhausted { attempts: attempt, last: e });
        }

        let delay = policy.sleep_for(attempt);

        if let Some(deadline) = deadline {
            if Instant::now() + delay > deadline {
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Next retry would overrun deadline"
                );
                return Err(RetryError::DeadlineExceeded { attempts: attempt, last: e });
            }
        }

        if quiet {
            trace!(
                operation = %operation_name,
                attempt,
                error = %e,
                delay_ms = delay.as_millis() as u64,
                "Condition not met, polling again"
            );
        } else {
            warn!(
                operation = %operation_name,
                attempt,
                error = %e,
                delay_ms = delay.as_millis() as u64,
                "Operation failed, retrying"
            );
        }

        tokio::time::sleep(delay).await;
    }
}
