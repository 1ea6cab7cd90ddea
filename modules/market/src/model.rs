//! Market model types: watcher keys and chain resolution.

use std::collections::BTreeMap;

use tracing::warn;

use chain_sim::SimulatorCmdline;
use stackkit::contracts::RuntimeHandle;

/// Composite key identifying one watcher: target chain plus deployment name.
/// Watchers are unique per key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct WatcherKey {
    pub chain_id: u64,
    pub deployment: String,
}

impl WatcherKey {
    #[must_use]
    pub fn new(chain_id: u64, deployment: impl Into<String>) -> Self {
        Self {
            chain_id,
            deployment: deployment.into(),
        }
    }
}

impl std::fmt::Display for WatcherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.chain_id, self.deployment)
    }
}

/// One requested chain resolved against a running simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedChain {
    pub chain_id: u64,
    /// Pid of the simulator owning the chain.
    pub simulator_pid: u32,
    pub endpoint: String,
    /// Store identifier of the simulator's chain data; market signatures
    /// bind chain ids to this value.
    pub store_id: String,
}

/// Resolve requested chain ids against the running simulator set.
///
/// Unresolvable references are skipped (with a warning) rather than failing
/// the whole operation; duplicates collapse to one resolution per chain id.
#[must_use]
pub fn resolve_chains(
    requested: &[u64],
    running: &BTreeMap<u64, RuntimeHandle<SimulatorCmdline>>,
) -> BTreeMap<u64, ResolvedChain> {
    let mut resolved = BTreeMap::new();
    for &chain_id in requested {
        if resolved.contains_key(&chain_id) {
            continue;
        }
        let Some(handle) = running.get(&chain_id) else {
            warn!(chain_id, "no running simulator for requested chain, skipping");
            continue;
        };
        let Some(parsed) = handle.descriptor.as_ref() else {
            continue;
        };
        let Some(store_id) = parsed
            .data_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
        else {
            warn!(chain_id, "simulator data path has no identifier component, skipping");
            continue;
        };
        resolved.insert(
            chain_id,
            ResolvedChain {
                chain_id,
                simulator_pid: handle.pid,
                endpoint: format!("http://{}:{}", parsed.host, parsed.port),
                store_id,
            },
        );
    }
    resolved
}
