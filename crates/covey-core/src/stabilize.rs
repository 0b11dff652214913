//! Bounded retry-until-predicate primitive.
//!
//! Every distributed readiness check in this harness reduces to the same
//! shape: try a predicate, sleep, try again, give up after a window. This
//! module is the single implementation of that shape; ad hoc sleep loops
//! elsewhere are a bug.

use covey_proto::{Error, Result};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What a successful stabilization took.
#[derive(Debug, Clone, Copy)]
pub struct StabilizeOutcome {
    pub retries: u32,
    pub elapsed: Duration,
}

/// Repeatedly invokes `predicate` until it returns `Ok(true)`.
///
/// `Ok(false)` and [`Error::NotReady`] both mean "not yet" and are retried
/// after `retry_delay`; any other error is fatal and propagates
/// immediately. When `timeout` elapses without success, the returned
/// [`Error::Timeout`] names `label`, the bound, the elapsed time, the retry
/// count, and the last observed state, so a misconfigured window is
/// distinguishable from a genuine hang.
pub async fn stabilize<F, Fut>(
    label: &str,
    timeout: Duration,
    retry_delay: Duration,
    mut predicate: F,
) -> Result<StabilizeOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    let mut retries = 0u32;
    let mut last_state = String::from("never attempted");

    loop {
        match predicate().await {
            Ok(true) => {
                let outcome = StabilizeOutcome {
                    retries,
                    elapsed: start.elapsed(),
                };
                debug!(
                    label,
                    retries,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "Stabilized"
                );
                return Ok(outcome);
            }
            Ok(false) => {
                last_state = "predicate false".to_string();
            }
            Err(e) if e.is_retryable() => {
                last_state = e.to_string();
            }
            Err(e) => return Err(e),
        }

        if start.elapsed() >= timeout {
            warn!(label, retries, last_state, "Stabilization window exhausted");
            return Err(Error::Timeout {
                label: label.to_string(),
                bound_secs: timeout.as_secs(),
                elapsed_secs: start.elapsed().as_secs(),
                retries,
                last_state,
            });
        }

        retries += 1;
        tokio::time::sleep(retry_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_true_after_k_retries_takes_k_intervals() {
        let k = 3u32;
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let delay = Duration::from_millis(20);

        let start = Instant::now();
        let outcome = stabilize("k retries", Duration::from_secs(5), delay, move || {
            let calls = calls2.clone();
            async move { Ok(calls.fetch_add(1, Ordering::SeqCst) >= k) }
        })
        .await
        .unwrap();

        assert_eq!(outcome.retries, k);
        // At least k sleep intervals passed; well under k+1 plus slack.
        assert!(start.elapsed() >= delay * k);
        assert!(start.elapsed() < delay * (k + 1) + Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_never_true_times_out_within_window() {
        let window = Duration::from_millis(100);
        let start = Instant::now();
        let err = stabilize(
            "hopeless",
            window,
            Duration::from_millis(10),
            || async { Ok(false) },
        )
        .await
        .unwrap_err();

        assert!(start.elapsed() >= window);
        assert!(start.elapsed() < window + Duration::from_millis(500));
        match err {
            Error::Timeout {
                label,
                bound_secs,
                retries,
                ..
            } => {
                assert_eq!(label, "hopeless");
                assert_eq!(bound_secs, 0); // sub-second window reports 0s bound
                assert!(retries > 0);
            }
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_not_ready_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let outcome = stabilize(
            "refused then up",
            Duration::from_secs(5),
            Duration::from_millis(5),
            move || {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::NotReady {
                            node: "127.0.0.1:54321".into(),
                            detail: "connection refused".into(),
                        })
                    } else {
                        Ok(true)
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.retries, 2);
    }

    #[tokio::test]
    async fn test_fatal_errors_propagate_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let err = stabilize(
            "protocol violation",
            Duration::from_secs(5),
            Duration::from_millis(5),
            move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<bool, _>(Error::Protocol {
                        node: "127.0.0.1:54321".into(),
                        detail: "missing cloud_size".into(),
                    })
                }
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Protocol { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_embeds_last_not_ready_state() {
        let err = stabilize(
            "always refused",
            Duration::from_millis(30),
            Duration::from_millis(10),
            || async {
                Err::<bool, _>(Error::NotReady {
                    node: "10.0.0.5:54321".into(),
                    detail: "connection refused".into(),
                })
            },
        )
        .await
        .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("always refused"));
        assert!(msg.contains("connection refused"));
    }
}
