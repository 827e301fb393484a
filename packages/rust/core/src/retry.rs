//! Bounded retries with exponential backoff.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use leadenrich_shared::Contact;

use crate::worker::WorkerFailure;

/// Largest exponent applied to the base delay.
const MAX_BACKOFF_EXPONENT: u32 = 5;

/// How a row's attempt chain ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// At least one contact was found.
    Contacts { contacts: Vec<Contact>, attempts: u32 },
    /// A clean run found nobody. Not retried.
    NoContact { attempts: u32 },
    /// Every attempt failed; `last` is the final failure.
    Exhausted { last: WorkerFailure, attempts: u32 },
}

impl RetryOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Contacts { attempts, .. }
            | Self::NoContact { attempts }
            | Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total calls allowed, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    /// Call `call(attempt)` until it yields contacts, reports no results, or
    /// the attempt budget runs out.
    pub async fn run<F, Fut>(&self, domain: &str, mut call: F) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Vec<Contact>, WorkerFailure>>,
    {
        let mut attempt = 1;
        loop {
            match call(attempt).await {
                Ok(contacts) => {
                    return RetryOutcome::Contacts {
                        contacts,
                        attempts: attempt,
                    };
                }
                Err(WorkerFailure::NoResultsFound) => {
                    return RetryOutcome::NoContact { attempts: attempt };
                }
                Err(failure) if attempt >= self.max_attempts => {
                    warn!(
                        domain,
                        attempts = attempt,
                        error = %failure,
                        "giving up on domain"
                    );
                    return RetryOutcome::Exhausted {
                        last: failure,
                        attempts: attempt,
                    };
                }
                Err(failure) => {
                    let delay = self.backoff(attempt);
                    info!(
                        domain,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max: u32) -> RetryPolicy {
        RetryPolicy::new(max, Duration::from_millis(1))
    }

    fn contact() -> Contact {
        Contact {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            ..Contact::default()
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy::new(10, Duration::from_secs(1));
        assert_eq!(p.backoff(1), Duration::from_secs(1));
        assert_eq!(p.backoff(2), Duration::from_secs(2));
        assert_eq!(p.backoff(3), Duration::from_secs(4));
        assert_eq!(p.backoff(6), Duration::from_secs(32));
        assert_eq!(p.backoff(9), Duration::from_secs(32));
    }

    #[tokio::test]
    async fn fails_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = policy(3)
            .run("acme.io", |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(WorkerFailure::ProcessFailure("exit 1".into()))
                    } else {
                        Ok(vec![contact()])
                    }
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(outcome, RetryOutcome::Contacts { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn always_failing_exhausts_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = policy(4)
            .run("down.io", |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(WorkerFailure::Timeout {
                        after: Duration::from_secs(120),
                    })
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match outcome {
            RetryOutcome::Exhausted { last, attempts } => {
                assert_eq!(attempts, 4);
                assert!(last.to_string().contains("timed out"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_results_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = policy(3)
            .run("quiet.io", |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(WorkerFailure::NoResultsFound) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome, RetryOutcome::NoContact { attempts: 1 });
    }

    #[tokio::test]
    async fn attempt_numbers_are_passed_through() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = seen.clone();
        policy(3)
            .run("acme.io", |attempt| {
                log.lock().unwrap().push(attempt);
                async { Err(WorkerFailure::ProcessFailure("boom".into())) }
            })
            .await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }
}
