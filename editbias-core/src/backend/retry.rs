//! Bounded retry with exponential backoff.
//!
//! Each attempt reports itself as [`Attempt::Success`], [`Attempt::Retryable`]
//! or [`Attempt::Terminal`]; the combinator turns the sequence into a
//! [`RetryOutcome`] that keeps "gave up after N tries" apart from "failed for
//! good".

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::BackendError;

/// Result of one attempt.
#[derive(Debug)]
pub enum Attempt<T, E> {
    Success(T),
    Retryable(E),
    Terminal(E),
}

impl<T> From<Result<T, BackendError>> for Attempt<T, BackendError> {
    fn from(result: Result<T, BackendError>) -> Self {
        match result {
            Ok(value) => Attempt::Success(value),
            Err(e) if e.is_transient() => Attempt::Retryable(e),
            Err(e) => Attempt::Terminal(e),
        }
    }
}

/// Final result of a retried operation.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T, E> {
    Completed { value: T, attempts: u32 },
    /// Every attempt failed transiently.
    Exhausted { error: E, attempts: u32 },
    /// An attempt failed terminally.
    Failed { error: E, attempts: u32 },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Completed { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Failed { attempts, .. } => *attempts,
        }
    }
}

/// Server-provided wait hint carried by an error.
pub trait RetryAfter {
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl RetryAfter for BackendError {
    fn retry_after(&self) -> Option<Duration> {
        match self {
            BackendError::RateLimited { retry_after_secs } => {
                Some(Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }
}

/// Run `operation` up to `1 + max_retries` times.
///
/// The closure receives the 1-based attempt number.
pub async fn retry_bounded<F, Fut, T, E>(
    policy: &RetryConfig,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
    E: RetryAfter + Display,
{
    let max_attempts = policy.max_retries + 1;
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Attempt::Success(value) => {
                return RetryOutcome::Completed {
                    value,
                    attempts: attempt,
                };
            }
            Attempt::Terminal(error) => {
                return RetryOutcome::Failed {
                    error,
                    attempts: attempt,
                };
            }
            Attempt::Retryable(error) => {
                if attempt >= max_attempts {
                    return RetryOutcome::Exhausted {
                        error,
                        attempts: attempt,
                    };
                }
                let backoff = compute_backoff(policy, attempt - 1, error.retry_after());
                tracing::warn!(
                    attempt,
                    max = max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "Retrying after transient error"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Backoff before retry number `retry` (0-based), never shorter than the server hint.
pub fn compute_backoff(
    policy: &RetryConfig,
    retry: u32,
    server_hint: Option<Duration>,
) -> Duration {
    let computed = Duration::from_millis(compute_exponential_backoff(policy, retry));
    match server_hint {
        Some(hint) => hint.max(computed),
        None => computed,
    }
}

fn compute_exponential_backoff(policy: &RetryConfig, retry: u32) -> u64 {
    let base = policy.initial_backoff_ms as f64 * policy.backoff_multiplier.powi(retry as i32);
    let capped = base.min(policy.max_backoff_ms as f64) as u64;
    if policy.jitter {
        // Up to 25% jitter.
        let jitter = (capped as f64 * rand::thread_rng().gen_range(0.0..0.25)) as u64;
        capped + jitter
    } else {
        capped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1000,
            max_backoff_ms: 3000,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let p = policy(3);
        assert_eq!(compute_backoff(&p, 0, None), Duration::from_millis(1000));
        assert_eq!(compute_backoff(&p, 1, None), Duration::from_millis(2000));
        assert_eq!(compute_backoff(&p, 2, None), Duration::from_millis(3000));
    }

    #[test]
    fn test_backoff_honors_server_hint() {
        let p = policy(3);
        assert_eq!(
            compute_backoff(&p, 0, Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_jitter_bounded() {
        let p = RetryConfig {
            jitter: true,
            ..policy(3)
        };
        for _ in 0..50 {
            let ms = compute_backoff(&p, 0, None).as_millis();
            assert!((1000..1250).contains(&ms));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let outcome = retry_bounded(&policy(3), move |_| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Attempt::Retryable(BackendError::Timeout { timeout_secs: 5 })
                } else {
                    Attempt::Success("ok")
                }
            }
        })
        .await;
        assert!(matches!(
            outcome,
            RetryOutcome::Completed {
                value: "ok",
                attempts: 3
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_after_max_attempts() {
        let outcome: RetryOutcome<(), BackendError> = retry_bounded(&policy(2), |_| async {
            Attempt::Retryable(BackendError::Connection {
                message: "reset".into(),
            })
        })
        .await;
        assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_terminal_stops_immediately() {
        let outcome: RetryOutcome<(), BackendError> = retry_bounded(&policy(5), |_| async {
            Attempt::from(Err(BackendError::Terminal {
                message: "bad request".into(),
            }))
        })
        .await;
        assert!(matches!(outcome, RetryOutcome::Failed { attempts: 1, .. }));
    }
}
