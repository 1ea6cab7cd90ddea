//! Group lifecycle operations.
//!
//! Group start/stop never aborts on the first failure: every member
//! operation runs, every failure is collected, and one aggregate outcome is
//! reported. The caller decides fatality.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::contracts::{Service, StartOptions, StopOptions};
use crate::deps::{start_waves, stop_waves};
use crate::error::StackError;

/// Aggregate result of one group operation.
#[derive(Debug, Default)]
pub struct GroupOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, StackError)>,
}

impl GroupOutcome {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn absorb(&mut self, other: Self) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }

    /// Collapse into a single result, summarizing every failure.
    ///
    /// # Errors
    /// [`StackError::Aggregate`] when any member operation failed.
    pub fn into_result(self) -> Result<(), StackError> {
        if self.failed.is_empty() {
            return Ok(());
        }
        let total = self.succeeded.len() + self.failed.len();
        let summary = self
            .failed
            .iter()
            .map(|(label, err)| format!("{label}: {err}"))
            .collect::<Vec<_>>()
            .join("; ");
        Err(StackError::Aggregate {
            failed: self.failed.len(),
            total,
            summary,
        })
    }
}

/// Start every service, dependency waves first, members of a wave in
/// parallel.
pub async fn start_group(services: &[Arc<dyn Service>], opts: &StartOptions) -> GroupOutcome {
    let kinds: Vec<_> = services.iter().map(|s| s.kind()).collect();
    let mut outcome = GroupOutcome::default();

    for wave in start_waves(&kinds) {
        let members: Vec<&Arc<dyn Service>> = services
            .iter()
            .filter(|s| wave.contains(&s.kind()))
            .collect();
        if members.is_empty() {
            continue;
        }

        info!(
            wave = ?wave.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
            "starting service wave"
        );
        let results = join_all(members.iter().map(|svc| async move {
            let label = svc.label();
            (label, svc.start(opts).await)
        }))
        .await;

        collect(&mut outcome, results);
    }
    outcome
}

/// Stop every service, reverse dependency order, members of a wave in
/// parallel.
pub async fn stop_group(services: &[Arc<dyn Service>], opts: &StopOptions) -> GroupOutcome {
    let kinds: Vec<_> = services.iter().map(|s| s.kind()).collect();
    let mut outcome = GroupOutcome::default();

    for wave in stop_waves(&kinds) {
        let members: Vec<&Arc<dyn Service>> = services
            .iter()
            .filter(|s| wave.contains(&s.kind()))
            .collect();
        if members.is_empty() {
            continue;
        }

        let results = join_all(members.iter().map(|svc| async move {
            let label = svc.label();
            (label, svc.stop(opts).await)
        }))
        .await;

        collect(&mut outcome, results);
    }
    outcome
}

fn collect(outcome: &mut GroupOutcome, results: Vec<(String, Result<(), StackError>)>) {
    for (label, result) in results {
        match result {
            Ok(()) => outcome.succeeded.push(label),
            Err(err) => {
                warn!(service = %label, error = %err, "group member operation failed");
                outcome.failed.push((label, err));
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::contracts::ServiceKind;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeService {
        kind: ServiceKind,
        name: &'static str,
        fail_start: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Service for FakeService {
        fn kind(&self) -> ServiceKind {
            self.kind
        }

        fn label(&self) -> String {
            self.name.to_owned()
        }

        fn can_start(&self) -> bool {
            true
        }

        async fn start(&self, _opts: &StartOptions) -> Result<(), StackError> {
            self.log.lock().unwrap().push(self.name);
            if self.fail_start {
                Err(StackError::NotFound("binary".to_owned()))
            } else {
                Ok(())
            }
        }

        async fn stop(&self, _opts: &StopOptions) -> Result<(), StackError> {
            self.log.lock().unwrap().push(self.name);
            Ok(())
        }

        async fn pid(&self) -> Result<Option<u32>, StackError> {
            Ok(None)
        }

        async fn is_ready(&self) -> Result<bool, StackError> {
            Ok(false)
        }
    }

    fn fake(
        kind: ServiceKind,
        name: &'static str,
        fail_start: bool,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Arc<dyn Service> {
        Arc::new(FakeService {
            kind,
            name,
            fail_start,
            log: Arc::clone(log),
        })
    }

    #[tokio::test]
    async fn failures_are_collected_not_aborting() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let services = vec![
            fake(ServiceKind::Simulator, "sim", true, &log),
            fake(ServiceKind::DocumentStore, "doc", false, &log),
            fake(ServiceKind::CoreApi, "api", false, &log),
        ];

        let outcome = start_group(&services, &StartOptions::default()).await;

        // Every member ran, even though the first wave had a failure.
        assert_eq!(log.lock().unwrap().len(), 3);
        assert_eq!(outcome.succeeded, vec!["doc".to_owned(), "api".to_owned()]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "sim");
        assert!(outcome.into_result().is_err());
    }

    #[tokio::test]
    async fn start_orders_dependencies_before_dependents() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let services = vec![
            fake(ServiceKind::CoreApi, "api", false, &log),
            fake(ServiceKind::Simulator, "sim", false, &log),
        ];

        start_group(&services, &StartOptions::default()).await;

        assert_eq!(*log.lock().unwrap(), vec!["sim", "api"]);
    }

    #[tokio::test]
    async fn stop_reverses_the_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let services = vec![
            fake(ServiceKind::CoreApi, "api", false, &log),
            fake(ServiceKind::Simulator, "sim", false, &log),
        ];

        stop_group(&services, &StopOptions::default()).await;

        assert_eq!(*log.lock().unwrap(), vec!["api", "sim"]);
    }

    #[tokio::test]
    async fn empty_group_is_ok() {
        let outcome = start_group(&[], &StartOptions::default()).await;
        assert!(outcome.is_ok());
        assert!(outcome.into_result().is_ok());
    }
}
