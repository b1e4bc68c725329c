use std::future::Future;
use std::time::Duration;

use crate::models::attempt::{AttemptResult, DispatchFailure};
use crate::services::stop::StopSignal;

/// Attempt budget and exponential backoff schedule for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Next state after attempt `attempt` failed. `previous_delay` is the wait
    /// before that attempt (zero for the first); the next wait never drops below it.
    pub fn on_failure(
        &self,
        attempt: u32,
        previous_delay: Duration,
        failure: DispatchFailure,
    ) -> RetryState {
        if !failure.kind.is_transient() {
            return RetryState::Failed {
                attempts: attempt,
                failure,
            };
        }
        if attempt >= self.max_attempts {
            return RetryState::Exhausted {
                attempts: attempt,
                failure,
            };
        }

        let delay = self
            .delay_after(attempt)
            .max(failure.retry_after.unwrap_or_default())
            .max(previous_delay)
            .min(self.max_delay);
        RetryState::Backoff {
            attempt,
            delay,
            failure,
        }
    }
}

/// States of one retry cycle.
///
/// `Idle -> Attempting -> (Succeeded | Backoff -> Attempting | Exhausted | Failed)`,
/// with `Cancelled` reachable from `Idle` and `Backoff` when a stop is requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Attempting {
        attempt: u32,
        /// Backoff waited before this attempt.
        waited: Duration,
    },
    Backoff {
        attempt: u32,
        delay: Duration,
        failure: DispatchFailure,
    },
    Succeeded {
        attempts: u32,
        captions: Vec<String>,
    },
    /// Permanent failure; no retry budget was spent on it.
    Failed {
        attempts: u32,
        failure: DispatchFailure,
    },
    Exhausted {
        attempts: u32,
        failure: DispatchFailure,
    },
    Cancelled {
        attempts: u32,
    },
}

/// Drives a dispatch call through [`RetryState`] until a terminal state.
#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `call` (given the 1-based attempt number) until it succeeds, fails
    /// permanently, runs out of attempts, or `stop` is raised between attempts.
    pub async fn run<F, Fut>(&self, stop: &StopSignal, mut call: F) -> AttemptResult
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Vec<String>, DispatchFailure>>,
    {
        let mut state = RetryState::Idle;
        loop {
            state = match state {
                RetryState::Idle if stop.is_stopped() => RetryState::Cancelled { attempts: 0 },
                RetryState::Idle => RetryState::Attempting {
                    attempt: 1,
                    waited: Duration::ZERO,
                },

                RetryState::Attempting { attempt, waited } => match call(attempt).await {
                    Ok(captions) => RetryState::Succeeded {
                        attempts: attempt,
                        captions,
                    },
                    Err(failure) => self.policy.on_failure(attempt, waited, failure),
                },

                RetryState::Backoff {
                    attempt,
                    delay,
                    failure,
                } => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        kind = %failure.kind,
                        error = %failure.message,
                        "Attempt failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => RetryState::Attempting {
                            attempt: attempt + 1,
                            waited: delay,
                        },
                        _ = stop.stopped() => RetryState::Cancelled { attempts: attempt },
                    }
                }

                RetryState::Succeeded { attempts, captions } => {
                    return AttemptResult::captioned(attempts, captions);
                }
                RetryState::Failed { attempts, failure } => {
                    tracing::warn!(attempts, kind = %failure.kind, error = %failure.message, "Permanent failure, not retrying");
                    return AttemptResult::failed(attempts, failure);
                }
                RetryState::Exhausted { attempts, failure } => {
                    tracing::error!(attempts, kind = %failure.kind, error = %failure.message, "Retries exhausted");
                    return AttemptResult::failed(attempts, failure);
                }
                RetryState::Cancelled { attempts } => {
                    tracing::info!(attempts, "Retry cycle cancelled");
                    return AttemptResult::cancelled(attempts);
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::attempt::{AttemptOutcome, FailureKind};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }

    fn transient() -> DispatchFailure {
        DispatchFailure::new(FailureKind::RateLimited, "429 Too Many Requests")
    }

    #[test]
    fn test_delay_schedule_is_capped() {
        let p = policy(10);
        let delays: Vec<u64> = (1..=6).map(|a| p.delay_after(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);
        assert_eq!(p.delay_after(200), Duration::from_secs(8));
    }

    #[test]
    fn test_retry_after_hint_raises_delay() {
        let p = policy(3);
        let failure = transient().with_retry_after(Some(Duration::from_secs(5)));
        match p.on_failure(1, Duration::ZERO, failure) {
            RetryState::Backoff { delay, .. } => assert_eq!(delay, Duration::from_secs(5)),
            other => panic!("unexpected state {other:?}"),
        }

        let huge = transient().with_retry_after(Some(Duration::from_secs(600)));
        match p.on_failure(1, Duration::ZERO, huge) {
            RetryState::Backoff { delay, .. } => assert_eq!(delay, Duration::from_secs(8)),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn test_delay_does_not_shrink_after_hint() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        };
        let hinted = transient().with_retry_after(Some(Duration::from_secs(30)));
        let first = match p.on_failure(1, Duration::ZERO, hinted) {
            RetryState::Backoff { delay, .. } => delay,
            other => panic!("unexpected state {other:?}"),
        };
        assert_eq!(first, Duration::from_secs(30));

        match p.on_failure(2, first, transient()) {
            RetryState::Backoff { delay, .. } => assert_eq!(delay, Duration::from_secs(30)),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn test_permanent_failure_skips_backoff() {
        let failure = DispatchFailure::new(FailureKind::InvalidRequest, "bad");
        assert!(matches!(
            policy(3).on_failure(1, Duration::ZERO, failure),
            RetryState::Failed { attempts: 1, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_transient_makes_exactly_n_attempts() {
        let controller = RetryController::new(policy(4));
        let calls: Arc<Mutex<Vec<Instant>>> = Arc::default();

        let result = controller
            .run(&StopSignal::new(), |_| {
                let calls = calls.clone();
                async move {
                    calls.lock().unwrap().push(Instant::now());
                    Err(transient())
                }
            })
            .await;

        assert_eq!(result.attempts, 4);
        assert_eq!(result.failure().unwrap().kind, FailureKind::RateLimited);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.windows(2).all(|g| g[0] <= g[1]), "gaps shrank: {gaps:?}");
        assert!(gaps[0] >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gaps_stay_non_decreasing_after_retry_after() {
        let controller = RetryController::new(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        });
        let calls: Arc<Mutex<Vec<Instant>>> = Arc::default();

        let result = controller
            .run(&StopSignal::new(), |attempt| {
                let calls = calls.clone();
                async move {
                    calls.lock().unwrap().push(Instant::now());
                    match attempt {
                        1 => Err(transient().with_retry_after(Some(Duration::from_secs(30)))),
                        2 => Err(transient()),
                        _ => Ok(vec!["a heron".to_string()]),
                    }
                }
            })
            .await;

        assert!(result.is_success());
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert!(calls[1] - calls[0] >= Duration::from_secs(30));
        assert!(calls[2] - calls[1] >= calls[1] - calls[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_short_circuits() {
        let controller = RetryController::new(policy(5));
        let mut count = 0;
        let result = controller
            .run(&StopSignal::new(), |_| {
                count += 1;
                async { Err(DispatchFailure::new(FailureKind::PayloadTooLarge, "413")) }
            })
            .await;

        assert_eq!(count, 1);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.failure().unwrap().kind, FailureKind::PayloadTooLarge);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_is_not_retried() {
        let controller = RetryController::new(policy(3));
        let result = controller
            .run(&StopSignal::new(), |_| async {
                Err(DispatchFailure::new(FailureKind::Auth, "401"))
            })
            .await;
        assert_eq!(result.attempts, 1);
        assert!(result.failure().unwrap().kind.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let controller = RetryController::new(policy(3));
        let result = controller
            .run(&StopSignal::new(), |attempt| async move {
                if attempt < 3 {
                    Err(DispatchFailure::new(FailureKind::ServerError, "502"))
                } else {
                    Ok(vec!["a red fox".to_string()])
                }
            })
            .await;

        assert_eq!(result.attempts, 3);
        assert_eq!(
            result.outcome,
            AttemptOutcome::Captioned(vec!["a red fox".to_string()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_backoff_cancels() {
        let controller = RetryController::new(RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60),
        });
        let stop = StopSignal::new();
        let stopper = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                stop.stop();
            })
        };

        let result = controller.run(&stop, |_| async { Err(transient()) }).await;
        stopper.await.unwrap();

        assert_eq!(result.attempts, 1);
        assert_eq!(result.outcome, AttemptOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_stopped_before_start_makes_no_call() {
        let controller = RetryController::new(policy(3));
        let stop = StopSignal::new();
        stop.stop();
        let mut called = false;
        let result = controller
            .run(&stop, |_| {
                called = true;
                async { Ok(vec![]) }
            })
            .await;
        assert!(!called);
        assert_eq!(result.attempts, 0);
        assert_eq!(result.outcome, AttemptOutcome::Cancelled);
    }
}
