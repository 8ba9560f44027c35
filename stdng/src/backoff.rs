/*
Copyright 2025 The Skylet Authors.
Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at
    http://www.apache.org/licenses/LICENSE-2.0
Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_DELAY_MILLIS: u64 = 200;
const DEFAULT_MAX_DELAY_SECS: u64 = 10;

/// Exponential backoff with full jitter and a hard attempt ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base: Duration::from_millis(DEFAULT_BASE_DELAY_MILLIS),
            cap: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
        }
    }
}

impl Backoff {
    /// The upper bound of the delay after the given attempt (1-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << shift).min(self.cap)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }

        Duration::from_millis(rand::rng().random_range(0..=ceiling))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    Cancelled,
    Exhausted { attempts: u32, last: E },
    Fatal(E),
}

impl<E: Display> Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryError::Cancelled => write!(f, "cancelled"),
            RetryError::Exhausted { attempts, last } => {
                write!(f, "{last} (gave up after {attempts} attempts)")
            }
            RetryError::Fatal(e) => write!(f, "{e}"),
        }
    }
}

/// Sleeps for `duration` unless `cancel` fires first; returns false when cancelled.
pub async fn sleep(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// attempt ceiling is reached. Each attempt races `cancel`; the in-flight
/// future is dropped on cancellation.
pub async fn retry<T, E, F, Fut, C>(
    backoff: &Backoff,
    cancel: &CancellationToken,
    is_transient: C,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: Display,
{
    let max_attempts = backoff.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            res = op(attempt) => res,
        };

        match res {
            Ok(v) => return Ok(v),
            Err(e) if !is_transient(&e) => return Err(RetryError::Fatal(e)),
            Err(e) if attempt >= max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: e,
                });
            }
            Err(e) => {
                let delay = backoff.delay(attempt);
                tracing::warn!(
                    "Attempt {}/{} failed: {}; retrying in {:?}",
                    attempt,
                    max_attempts,
                    e,
                    delay
                );
                if !sleep(cancel, delay).await {
                    return Err(RetryError::Cancelled);
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> Backoff {
        Backoff {
            max_attempts: 5,
            base: Duration::ZERO,
            cap: Duration::ZERO,
        }
    }

    #[test]
    fn test_ceiling_grows_and_caps() {
        let backoff = Backoff {
            max_attempts: 5,
            base: Duration::from_millis(100),
            cap: Duration::from_millis(500),
        };

        assert_eq!(backoff.ceiling(1), Duration::from_millis(100));
        assert_eq!(backoff.ceiling(2), Duration::from_millis(200));
        assert_eq!(backoff.ceiling(3), Duration::from_millis(400));
        assert_eq!(backoff.ceiling(4), Duration::from_millis(500));
        assert_eq!(backoff.ceiling(40), Duration::from_millis(500));

        for attempt in 1..10 {
            assert!(backoff.delay(attempt) <= backoff.ceiling(attempt));
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let res: Result<u32, RetryError<String>> = retry(
            &fast(),
            &cancel,
            |e: &String| e == "transient",
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err("transient".to_string())
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;

        assert_eq!(res, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_fatal() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let res: Result<(), RetryError<String>> = retry(
            &fast(),
            &cancel,
            |e: &String| e == "transient",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("permanent".to_string()) }
            },
        )
        .await;

        assert_eq!(res, Err(RetryError::Fatal("permanent".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let res: Result<(), RetryError<String>> = retry(
            &fast(),
            &cancel,
            |_: &String| true,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("transient".to_string()) }
            },
        )
        .await;

        assert_eq!(
            res,
            Err(RetryError::Exhausted {
                attempts: 5,
                last: "transient".to_string()
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_retry_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let res: Result<(), RetryError<String>> =
            retry(&fast(), &cancel, |_: &String| true, |_| async { Ok(()) }).await;

        assert_eq!(res, Err(RetryError::Cancelled));
    }

    #[tokio::test]
    async fn test_retry_cancelled_during_backoff() {
        let backoff = Backoff {
            max_attempts: 5,
            base: Duration::from_secs(60),
            cap: Duration::from_secs(60),
        };
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            child.cancel();
        });

        let res: Result<(), RetryError<String>> = retry(
            &backoff,
            &cancel,
            |_: &String| true,
            |_| async { Err("transient".to_string()) },
        )
        .await;

        assert_eq!(res, Err(RetryError::Cancelled));
    }
}
