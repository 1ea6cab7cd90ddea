//! Framework-service lifecycle.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use stackkit::contracts::{Service, ServiceKind, StartOptions, StopOptions};
use stackkit::error::StackError;
use stackkit::launcher::{LaunchPlan, stop_pid_with_grace};
use stackkit::probe::{ProcessProbe, ProcessRecord};
use stackkit::readiness::{LogWatch, RetryPolicy, wait_until};

use crate::descriptor::{FrameworkDescriptor, FrameworkEnv, config_hash, parse_environ};

/// Framework backends boot a JVM or Node runtime before they log anything
/// useful; the budget is sized accordingly.
pub const READY_POLICY: RetryPolicy =
    RetryPolicy::new(Duration::from_secs(3), Duration::from_secs(2), 60);

const STOP_GRACE: Duration = Duration::from_secs(10);

/// One manageable framework backend (JVM/Node process).
#[derive(Debug)]
pub struct FrameworkService {
    descriptor: FrameworkDescriptor,
}

impl FrameworkService {
    #[must_use]
    pub fn new(descriptor: FrameworkDescriptor) -> Self {
        Self { descriptor }
    }

    #[must_use]
    pub fn descriptor(&self) -> &FrameworkDescriptor {
        &self.descriptor
    }

    fn log_watch(&self) -> LogWatch {
        let cfg = self.descriptor.cfg();
        LogWatch::new(cfg.log_file.clone(), cfg.success_markers.clone())
            .failing_on(cfg.failure_markers.clone())
            .excluding(cfg.exclude_markers.clone())
    }

    /// Whether a discovered process belongs to this descriptor.
    ///
    /// The hash recorded in the process environment must equal a freshly
    /// recomputed hash of the on-disk config file; a process whose config has
    /// since changed on disk is no longer ours. Binding fields, when
    /// configured, are additional filters layered on the base match.
    fn is_ours(&self, env: &FrameworkEnv) -> bool {
        let cfg = self.descriptor.cfg();
        if env.host != cfg.host || env.port != cfg.port || env.config_file != cfg.config_file {
            return false;
        }
        match config_hash(&cfg.config_file) {
            Ok(current) if current == env.config_hash => {}
            _ => return false,
        }
        match self.descriptor.binding() {
            None => true,
            Some(binding) => {
                env.chain_id == Some(binding.chain_id)
                    && (binding.contract.is_none() || env.contract == binding.contract)
                    && (binding.store_id.is_none() || env.store_id == binding.store_id)
            }
        }
    }

    fn classify(&self, record: &ProcessRecord) -> Option<u32> {
        match parse_environ(record) {
            Ok(env) if self.is_ours(&env) => Some(record.pid),
            Ok(_) => None,
            Err(reason) => {
                debug!(pid = record.pid, %reason, "discovery match did not parse");
                None
            }
        }
    }
}

#[async_trait]
impl Service for FrameworkService {
    fn kind(&self) -> ServiceKind {
        self.descriptor.kind()
    }

    fn label(&self) -> String {
        format!(
            "{}@{}:{}",
            self.descriptor.service_name(),
            self.descriptor.host(),
            self.descriptor.port()
        )
    }

    fn can_start(&self) -> bool {
        let cfg = self.descriptor.cfg();
        cfg.program.is_file() && cfg.config_file.is_file() && cfg.home_dir.is_dir()
    }

    #[instrument(skip_all, fields(service = %self.label()))]
    async fn start(&self, opts: &StartOptions) -> Result<(), StackError> {
        if let Some(pid) = self.pid().await? {
            return Err(StackError::AlreadyBusy {
                service: self.label(),
                pid,
            });
        }

        let cfg = self.descriptor.cfg();
        let plan = LaunchPlan {
            service: cfg.service_name.clone(),
            program: cfg.program.clone(),
            args: self.descriptor.launch_args(),
            env: self.descriptor.launch_env()?,
            working_dir: cfg.home_dir.clone(),
            log_file: Some(cfg.log_file.clone()),
            pid_file: cfg.pid_file.clone(),
        };
        let pid = plan.spawn_detached().await?;
        info!(pid, "framework service spawned");

        if !opts.wait_ready {
            return Ok(());
        }

        let policy = opts.retry.unwrap_or(READY_POLICY);
        let watch = self.log_watch();
        wait_until(&self.label(), &policy, &opts.cancel, move || {
            let watch = watch.clone();
            async move { watch.scan().await }
        })
        .await
    }

    #[instrument(skip_all, fields(service = %self.label()))]
    async fn stop(&self, opts: &StopOptions) -> Result<(), StackError> {
        if !opts.ignore_cancel && opts.cancel.is_cancelled() {
            return Err(StackError::Cancelled {
                service: self.label(),
            });
        }

        match self.pid().await? {
            Some(pid) => {
                stop_pid_with_grace(pid, STOP_GRACE).await;
                info!(pid, "framework service stopped");
            }
            None => debug!("nothing to stop"),
        }

        let cfg = self.descriptor.cfg();
        match tokio::fs::remove_file(&cfg.pid_file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if opts.reset {
            match tokio::fs::remove_file(&cfg.log_file).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn pid(&self) -> Result<Option<u32>, StackError> {
        let probe = ProcessProbe::snapshot();
        let survivors: Vec<u32> = probe
            .matching(&self.descriptor.discovery_pattern())
            .into_iter()
            .filter_map(|record| self.classify(record))
            .collect();

        match survivors.as_slice() {
            [] => Ok(None),
            [pid] => Ok(Some(*pid)),
            many => Err(StackError::AmbiguousDiscovery(format!(
                "{} live framework services match {}: {:?}",
                many.len(),
                self.label(),
                many
            ))),
        }
    }

    async fn is_ready(&self) -> Result<bool, StackError> {
        Ok(self.log_watch().scan().await == stackkit::readiness::Readiness::Ready)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::descriptor::{
        CHAIN_ID_ENV, CONFIG_FILE_ENV, CONFIG_HASH_ENV, ChainBinding, FrameworkConfig, HOST_ENV,
        PORT_ENV,
    };
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};

    fn config(tmp: &Path) -> FrameworkConfig {
        FrameworkConfig {
            kind: ServiceKind::CoreApi,
            service_name: "core-api".to_owned(),
            entry_point: "com.acme.core.Application".to_owned(),
            host: "127.0.0.1".to_owned(),
            port: 13000,
            program: PathBuf::from("/usr/bin/java"),
            runtime_args: vec![],
            config_file: tmp.join("core.yml"),
            home_dir: tmp.to_path_buf(),
            log_file: tmp.join("core.log"),
            pid_file: tmp.join("core.pid"),
            success_markers: vec!["Started Application".to_owned()],
            failure_markers: vec!["ERROR".to_owned()],
            exclude_markers: vec![],
            extra_env: BTreeMap::new(),
            binding: None,
        }
    }

    fn record_for(service: &FrameworkService) -> ProcessRecord {
        let env = service.descriptor().launch_env().unwrap();
        ProcessRecord {
            pid: 4242,
            command: "java com.acme.core.Application".to_owned(),
            environ: env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            cwd: None,
        }
    }

    #[test]
    fn stale_config_hash_excludes_the_process() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("core.yml"), "profile: v1\n").unwrap();

        let service = FrameworkService::new(FrameworkDescriptor::new(config(tmp.path())).unwrap());
        let record = record_for(&service);

        // Hash matches the on-disk file: ours.
        assert_eq!(service.classify(&record), Some(4242));

        // The file changes after launch: the recorded hash is stale, the
        // process is no longer ours.
        std::fs::write(tmp.path().join("core.yml"), "profile: v2\n").unwrap();
        assert_eq!(service.classify(&record), None);
    }

    #[test]
    fn binding_filters_layer_on_the_base_match() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("core.yml"), "profile: v1\n").unwrap();

        let mut bound_cfg = config(tmp.path());
        bound_cfg.kind = ServiceKind::MarketWatcher;
        bound_cfg.binding = Some(ChainBinding {
            chain_id: 1337,
            contract: None,
            store_id: None,
        });
        let bound =
            FrameworkService::new(FrameworkDescriptor::new(bound_cfg).unwrap());

        // The live process carries a different chain binding.
        let mut record = record_for(&bound);
        for entry in &mut record.environ {
            if entry.starts_with(CHAIN_ID_ENV) {
                *entry = format!("{CHAIN_ID_ENV}=31337");
            }
        }
        assert_eq!(bound.classify(&record), None);

        let matching = record_for(&bound);
        assert_eq!(bound.classify(&matching), Some(4242));
    }

    #[test]
    fn foreign_identity_is_not_ours() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("core.yml"), "profile: v1\n").unwrap();

        let service = FrameworkService::new(FrameworkDescriptor::new(config(tmp.path())).unwrap());
        let hash = config_hash(&tmp.path().join("core.yml")).unwrap();
        let record = ProcessRecord {
            pid: 7,
            command: "java com.acme.core.Application".to_owned(),
            environ: vec![
                format!("{HOST_ENV}=127.0.0.1"),
                format!("{PORT_ENV}=9999"),
                format!("{CONFIG_FILE_ENV}={}", tmp.path().join("core.yml").display()),
                format!("{CONFIG_HASH_ENV}={hash}"),
            ],
            cwd: None,
        };

        assert_eq!(service.classify(&record), None);
    }
}
