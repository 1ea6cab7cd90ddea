//! The simulator service: lifecycle, discovery and grouping.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use stackkit::contracts::{RuntimeHandle, Service, ServiceKind, StartOptions, StopOptions};
use stackkit::error::StackError;
use stackkit::launcher::{LaunchPlan, stop_pid_with_grace};
use stackkit::probe::ProcessProbe;
use stackkit::readiness::{Readiness, RetryPolicy, wait_until};
use stackkit_store::{InstallOptions, LoadOptions, SignedDirectory};

use crate::descriptor::{
    SimulatorCmdline, SimulatorDescriptor, any_simulator_pattern, parse_command,
};
use crate::rpc::RpcClient;

/// Readiness budget of the simulator exemplar: fixed initial delay, fixed
/// inter-call delay, bounded call count.
pub const READY_POLICY: RetryPolicy =
    RetryPolicy::new(Duration::from_millis(1500), Duration::from_secs(1), 30);

const STOP_GRACE: Duration = Duration::from_secs(5);

/// One manageable chain-simulator instance.
pub struct Simulator {
    descriptor: SimulatorDescriptor,
}

impl Simulator {
    #[must_use]
    pub fn new(descriptor: SimulatorDescriptor) -> Self {
        Self { descriptor }
    }

    #[must_use]
    pub fn descriptor(&self) -> &SimulatorDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn rpc(&self) -> RpcClient {
        RpcClient::new(self.descriptor.endpoint(), self.descriptor.chain_id())
    }

    /// Install the chain-data store when it does not exist yet.
    ///
    /// # Errors
    /// Propagates store installation failures.
    pub fn ensure_store(&self) -> Result<SignedDirectory, StackError> {
        let root = self.descriptor.store_root();
        if let Some(store) =
            SignedDirectory::load(ServiceKind::Simulator.as_str(), root, LoadOptions::default())?
        {
            return Ok(store);
        }
        Ok(SignedDirectory::install(
            ServiceKind::Simulator.as_str(),
            root,
            InstallOptions::default(),
        )?)
    }

    fn load_store(&self) -> Result<Option<SignedDirectory>, StackError> {
        Ok(SignedDirectory::load(
            ServiceKind::Simulator.as_str(),
            self.descriptor.store_root(),
            LoadOptions::default(),
        )?)
    }

    /// Identity check of one parsed command line against this descriptor.
    fn is_ours(&self, parsed: &SimulatorCmdline, payload_dir: Option<&PathBuf>) -> bool {
        parsed.chain_id == self.descriptor.chain_id()
            && parsed.host == self.descriptor.host()
            && parsed.port == self.descriptor.port()
            && payload_dir.is_none_or(|dir| parsed.data_dir == *dir)
    }
}

#[async_trait]
impl Service for Simulator {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Simulator
    }

    fn label(&self) -> String {
        format!(
            "simulator@{}:{}#{}",
            self.descriptor.host(),
            self.descriptor.port(),
            self.descriptor.chain_id()
        )
    }

    fn can_start(&self) -> bool {
        self.descriptor.program().is_file()
            && matches!(self.load_store(), Ok(Some(_)))
    }

    #[instrument(skip_all, fields(service = %self.label()))]
    async fn start(&self, opts: &StartOptions) -> Result<(), StackError> {
        // Re-check discovery immediately before declaring busy; this narrows
        // (but cannot close) the race between two concurrent invocations.
        if let Some(pid) = self.pid().await? {
            return Err(StackError::AlreadyBusy {
                service: self.label(),
                pid,
            });
        }

        let store = SignedDirectory::load(
            ServiceKind::Simulator.as_str(),
            self.descriptor.store_root(),
            LoadOptions {
                strict: true,
                ..LoadOptions::default()
            },
        )?
        .ok_or_else(|| StackError::NotFound("simulator chain store".to_owned()))?;

        let plan = LaunchPlan {
            service: format!("simulator-{}", self.descriptor.chain_id()),
            program: self.descriptor.program().to_path_buf(),
            args: self.descriptor.launch_args(&store.payload_dir()),
            env: BTreeMap::new(),
            working_dir: self.descriptor.store_root().to_path_buf(),
            log_file: Some(self.descriptor.log_file().to_path_buf()),
            pid_file: self.descriptor.pid_file().to_path_buf(),
        };
        let pid = plan.spawn_detached().await?;
        info!(pid, "simulator spawned");

        if !opts.wait_ready {
            return Ok(());
        }

        let policy = opts.retry.unwrap_or(READY_POLICY);
        let rpc = self.rpc();
        let expected = self.descriptor.chain_id();
        wait_until(&self.label(), &policy, &opts.cancel, move || {
            let rpc = rpc.clone();
            async move {
                // Any outcome other than the configured chain id means "not
                // ready yet".
                match rpc.chain_id().await {
                    Ok(id) if id == expected => Readiness::Ready,
                    Ok(_) | Err(_) => Readiness::Pending,
                }
            }
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
                info!(pid, "simulator stopped");
            }
            None => debug!("nothing to stop"),
        }

        // The pid file is stale either way.
        match tokio::fs::remove_file(self.descriptor.pid_file()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if opts.reset && self.descriptor.store_root().exists() {
            info!(store = %self.descriptor.store_root().display(), "resetting chain store");
            tokio::fs::remove_dir_all(self.descriptor.store_root()).await?;
        }
        Ok(())
    }

    async fn pid(&self) -> Result<Option<u32>, StackError> {
        let payload_dir = self.load_store()?.map(|s| s.payload_dir());
        let probe = ProcessProbe::snapshot();

        let mut survivors = Vec::new();
        for record in probe.matching(&self.descriptor.identity_pattern()) {
            match parse_command(&record.command) {
                Ok(parsed) if self.is_ours(&parsed, payload_dir.as_ref()) => {
                    survivors.push(record.pid);
                }
                Ok(_) => {}
                Err(reason) => {
                    // Malformed matches are "not ours", never a crash.
                    debug!(pid = record.pid, %reason, "discovery match did not parse");
                }
            }
        }

        match survivors.as_slice() {
            [] => Ok(None),
            [pid] => Ok(Some(*pid)),
            many => Err(StackError::AmbiguousDiscovery(format!(
                "{} live simulators match {}: {:?}",
                many.len(),
                self.label(),
                many
            ))),
        }
    }

    async fn is_ready(&self) -> Result<bool, StackError> {
        match self.rpc().chain_id().await {
            Ok(id) => Ok(id == self.descriptor.chain_id()),
            Err(_) => Ok(false),
        }
    }
}

/// Enumerate every running simulator the probe can see.
///
/// Matched processes that fail to parse are skipped (they are not ours);
/// parse successes are returned as transient runtime handles.
#[must_use]
pub fn discover_all(probe: &ProcessProbe) -> Vec<RuntimeHandle<SimulatorCmdline>> {
    probe
        .matching(&any_simulator_pattern())
        .into_iter()
        .filter_map(|record| match parse_command(&record.command) {
            Ok(parsed) => Some(RuntimeHandle::new(record.pid, Some(parsed))),
            Err(reason) => {
                debug!(pid = record.pid, %reason, "simulator candidate did not parse");
                None
            }
        })
        .collect()
}

/// Group running simulators by chain id.
///
/// # Errors
/// [`StackError::AmbiguousDiscovery`] when two simulators claim the same
/// chain id — a hard error, never resolved by picking one.
pub fn group_by_chain(
    handles: Vec<RuntimeHandle<SimulatorCmdline>>,
) -> Result<BTreeMap<u64, RuntimeHandle<SimulatorCmdline>>, StackError> {
    let mut by_chain: BTreeMap<u64, RuntimeHandle<SimulatorCmdline>> = BTreeMap::new();
    for handle in handles {
        let Some(parsed) = handle.descriptor.as_ref() else {
            continue;
        };
        let chain_id = parsed.chain_id;
        if let Some(previous) = by_chain.get(&chain_id) {
            return Err(StackError::AmbiguousDiscovery(format!(
                "chain id {chain_id} is claimed by two running simulators (pids {} and {})",
                previous.pid, handle.pid
            )));
        }
        by_chain.insert(chain_id, handle);
    }
    Ok(by_chain)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use stackkit::probe::ProcessRecord;

    fn handle(pid: u32, chain_id: u64) -> RuntimeHandle<SimulatorCmdline> {
        RuntimeHandle::new(
            pid,
            Some(SimulatorCmdline {
                chain_id,
                host: "127.0.0.1".to_owned(),
                port: 8545,
                block_time: None,
                data_dir: PathBuf::from("/data"),
            }),
        )
    }

    #[test]
    fn grouping_rejects_duplicate_chain_ids() {
        let err = group_by_chain(vec![handle(1, 1337), handle(2, 1337)]).unwrap_err();
        assert!(matches!(err, StackError::AmbiguousDiscovery(_)));
    }

    #[test]
    fn grouping_maps_chain_ids() {
        let grouped = group_by_chain(vec![handle(1, 1337), handle(2, 31337)]).unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped.get(&1337).unwrap().pid, 1);
        assert_eq!(grouped.get(&31337).unwrap().pid, 2);
    }

    #[test]
    fn discover_all_skips_unparsable_matches() {
        let probe = ProcessProbe::from_records(vec![
            ProcessRecord {
                pid: 1,
                command: "simd --chain-id 1337 --host 127.0.0.1 --port 8545 /data".to_owned(),
                environ: vec![],
                cwd: None,
            },
            ProcessRecord {
                pid: 2,
                command: "simd --chain-id 9 --host h --port 1 --weird-flag x /data".to_owned(),
                environ: vec![],
                cwd: None,
            },
        ]);

        let handles = discover_all(&probe);
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].pid, 1);
    }
}
