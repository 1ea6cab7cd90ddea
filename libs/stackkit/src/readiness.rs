//! Bounded readiness waits.
//!
//! A wait is a retry loop with a fixed initial delay, a fixed inter-call
//! delay and a bounded attempt count, cancellable from the outside. The two
//! exhaustion modes are distinct failures: a fired cancellation token yields
//! [`StackError::Cancelled`], a spent retry budget yields
//! [`StackError::RetriesExhausted`].

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::StackError;

/// Retry budget for one readiness wait.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay before the first probe.
    pub initial_delay: Duration,
    /// Delay between probes.
    pub interval: Duration,
    /// Upper bound on probe calls.
    pub max_attempts: u32,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(initial_delay: Duration, interval: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            interval,
            max_attempts,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(1), 30)
    }
}

/// Outcome of one readiness probe call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Pending,
    /// The service reported an unrecoverable startup condition; retrying is
    /// pointless.
    Fatal(String),
}

/// Drive `probe` under `policy` until it reports ready, the budget runs out,
/// or `cancel` fires.
///
/// # Errors
/// [`StackError::Cancelled`] when the token fires first,
/// [`StackError::RetriesExhausted`] when the budget is spent,
/// [`StackError::StartupFailed`] when a probe reports a fatal condition.
pub async fn wait_until<F, Fut>(
    service: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<(), StackError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Readiness>,
{
    sleep_or_cancel(service, policy.initial_delay, cancel).await?;

    for attempt in 1..=policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(StackError::Cancelled {
                service: service.to_owned(),
            });
        }

        match probe().await {
            Readiness::Ready => {
                debug!(service, attempt, "readiness probe succeeded");
                return Ok(());
            }
            Readiness::Fatal(reason) => {
                return Err(StackError::StartupFailed {
                    service: service.to_owned(),
                    reason,
                });
            }
            Readiness::Pending => {
                debug!(service, attempt, "readiness probe still pending");
            }
        }

        if attempt < policy.max_attempts {
            sleep_or_cancel(service, policy.interval, cancel).await?;
        }
    }

    Err(StackError::RetriesExhausted {
        service: service.to_owned(),
        attempts: policy.max_attempts,
    })
}

async fn sleep_or_cancel(
    service: &str,
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), StackError> {
    tokio::select! {
        () = tokio::time::sleep(delay) => Ok(()),
        () = cancel.cancelled() => Err(StackError::Cancelled {
            service: service.to_owned(),
        }),
    }
}

/// Log-scan readiness probe over a plain-text, append-only log file.
///
/// The file may still be written while scanned. A line matching any failure
/// marker turns the scan fatal unless an exclude pattern also matches the
/// line; the scan is ready once every success marker has appeared somewhere
/// in the log.
#[derive(Debug, Clone)]
pub struct LogWatch {
    pub path: PathBuf,
    /// ANDed: all of these must appear for the scan to report ready.
    pub success: Vec<String>,
    /// Any of these marks the startup as failed.
    pub failure: Vec<String>,
    /// Lines matching one of these are ignored even if a failure marker hits.
    pub exclude: Vec<String>,
}

impl LogWatch {
    #[must_use]
    pub fn new(path: PathBuf, success: Vec<String>) -> Self {
        Self {
            path,
            success,
            failure: Vec::new(),
            exclude: Vec::new(),
        }
    }

    #[must_use]
    pub fn failing_on(mut self, failure: Vec<String>) -> Self {
        self.failure = failure;
        self
    }

    #[must_use]
    pub fn excluding(mut self, exclude: Vec<String>) -> Self {
        self.exclude = exclude;
        self
    }

    /// Scan the current log contents once.
    pub async fn scan(&self) -> Readiness {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            // The log appears only once the process has started writing.
            Err(_) => return Readiness::Pending,
        };

        for line in contents.lines() {
            let failed = self.failure.iter().any(|m| line.contains(m));
            if failed && !self.exclude.iter().any(|m| line.contains(m)) {
                return Readiness::Fatal(line.trim().to_owned());
            }
        }

        let ready = self.success.iter().all(|m| contents.contains(m));
        if ready {
            Readiness::Ready
        } else {
            Readiness::Pending
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(Duration::ZERO, Duration::from_millis(1), max_attempts)
    }

    // -------------------------
    // wait_until tests
    // -------------------------

    #[tokio::test]
    async fn ready_after_a_few_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_probe = Arc::clone(&calls);

        let result = wait_until(
            "svc",
            &fast_policy(10),
            &CancellationToken::new(),
            move || {
                let calls = Arc::clone(&calls_in_probe);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) >= 2 {
                        Readiness::Ready
                    } else {
                        Readiness::Pending
                    }
                }
            },
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn budget_exhaustion_is_distinct_from_cancellation() {
        let exhausted = wait_until("svc", &fast_policy(3), &CancellationToken::new(), || async {
            Readiness::Pending
        })
        .await
        .unwrap_err();
        assert!(matches!(
            exhausted,
            StackError::RetriesExhausted { attempts: 3, .. }
        ));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let cancelled = wait_until("svc", &fast_policy(3), &cancel, || async {
            Readiness::Pending
        })
        .await
        .unwrap_err();
        assert!(matches!(cancelled, StackError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn fatal_probe_short_circuits() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_probe = Arc::clone(&calls);

        let err = wait_until(
            "svc",
            &fast_policy(10),
            &CancellationToken::new(),
            move || {
                calls_in_probe.fetch_add(1, Ordering::SeqCst);
                async { Readiness::Fatal("bind failed".to_owned()) }
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, StackError::StartupFailed { ref reason, .. } if reason == "bind failed"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // -------------------------
    // LogWatch tests
    // -------------------------

    #[tokio::test]
    async fn missing_log_is_pending() {
        let watch = LogWatch::new(PathBuf::from("/nonexistent/log"), vec!["up".to_owned()]);
        assert_eq!(watch.scan().await, Readiness::Pending);
    }

    #[tokio::test]
    async fn success_markers_are_anded() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("svc.log");

        let watch = LogWatch::new(log.clone(), vec!["Started".to_owned(), "listening".to_owned()]);

        std::fs::write(&log, "Started Application in 3.2s\n").unwrap();
        assert_eq!(watch.scan().await, Readiness::Pending);

        std::fs::write(&log, "Started Application in 3.2s\nlistening on 8080\n").unwrap();
        assert_eq!(watch.scan().await, Readiness::Ready);
    }

    #[tokio::test]
    async fn failure_markers_respect_excludes() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("svc.log");

        let watch = LogWatch::new(log.clone(), vec!["Started".to_owned()])
            .failing_on(vec!["ERROR".to_owned()])
            .excluding(vec!["benign handshake retry".to_owned()]);

        std::fs::write(&log, "ERROR benign handshake retry, continuing\n").unwrap();
        assert_eq!(watch.scan().await, Readiness::Pending);

        std::fs::write(&log, "ERROR bind: address already in use\n").unwrap();
        assert!(matches!(watch.scan().await, Readiness::Fatal(_)));
    }
}
