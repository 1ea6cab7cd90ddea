//! The market composite service.
//!
//! A market bundles a document store, a key-value store, at most one API
//! process and a set of watcher processes keyed by `(chain id, deployment)`.
//! The container itself owns no OS process; lifecycle operations fan out to
//! the sub-services, stores first.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use tracing::{info, instrument, warn};

use backend::{ChainBinding, FrameworkConfig, FrameworkDescriptor, FrameworkService};
use chain_sim::SimulatorCmdline;
use stackkit::contracts::{
    RuntimeHandle, Service, ServiceKind, ServiceState, StartOptions, StopOptions,
};
use stackkit::correlate::PidRow;
use stackkit::error::StackError;
use stackkit::group::GroupOutcome;
use stackkit_store::{Signature, StoreError};
use stores::{StoreDaemon, StoreDaemonConfig};

use crate::model::{ResolvedChain, WatcherKey, resolve_chains};

/// Ledger consumer type market signatures are registered under.
const MARKET_SIGNER: &str = "market";

/// Requested shape of a market before reconstruction.
#[derive(Debug, Clone)]
pub struct MarketSpec {
    pub name: String,
    pub doc_store: StoreDaemonConfig,
    pub kv_store: StoreDaemonConfig,
    /// API process template; kind is forced to [`ServiceKind::MarketApi`].
    pub api: Option<FrameworkConfig>,
    /// Chain references the API should bind; de-duplicated, unresolvable
    /// entries skipped.
    pub api_chains: Vec<u64>,
    /// Watcher process template; kind is forced to
    /// [`ServiceKind::MarketWatcher`].
    pub watcher_template: Option<FrameworkConfig>,
    pub explicit_watchers: Vec<WatcherKey>,
    /// Also build one watcher per chain used by the API.
    pub mirror_api_chains: bool,
    /// Deployment name for mirrored watchers.
    pub deployment: String,
}

/// Reconstructed market: sub-services plus the accumulated signature set.
#[derive(Debug)]
pub struct Market {
    name: String,
    doc: StoreDaemon,
    kv: StoreDaemon,
    api: Option<FrameworkService>,
    watchers: BTreeMap<WatcherKey, FrameworkService>,
    /// `chain id → simulator store identifier`, registered in both stores'
    /// ledgers so incompatible sharing is caught before any process starts.
    signatures: BTreeMap<String, Signature>,
}

impl Market {
    /// Reconstruct a market from its spec and the currently running
    /// simulator set.
    ///
    /// Chain references that resolve to no running simulator are skipped
    /// rather than failing the whole operation. At most one API binding
    /// exists per chain id, and watchers are unique per
    /// `(chain id, deployment)` key.
    ///
    /// # Errors
    /// [`StackError::InvalidDescriptor`] when the assembled market would own
    /// neither an API nor a watcher, when watcher keys exist without a
    /// template, or when a sub-descriptor fails validation.
    pub fn assemble(
        spec: MarketSpec,
        running: &BTreeMap<u64, RuntimeHandle<SimulatorCmdline>>,
    ) -> Result<Self, StackError> {
        let api_bindings = if spec.api.is_some() {
            resolve_chains(&spec.api_chains, running)
        } else {
            BTreeMap::new()
        };

        let mut watcher_keys: BTreeSet<WatcherKey> = spec.explicit_watchers.into_iter().collect();
        if spec.mirror_api_chains {
            for &chain_id in api_bindings.keys() {
                watcher_keys.insert(WatcherKey::new(chain_id, spec.deployment.clone()));
            }
        }

        let watcher_chain_ids: Vec<u64> = watcher_keys.iter().map(|k| k.chain_id).collect();
        let watcher_chains = resolve_chains(&watcher_chain_ids, running);

        let mut watchers = BTreeMap::new();
        if !watcher_keys.is_empty() {
            let template = spec.watcher_template.as_ref().ok_or_else(|| {
                StackError::InvalidDescriptor(
                    "market watchers requested without a watcher template".to_owned(),
                )
            })?;
            for (index, key) in watcher_keys.into_iter().enumerate() {
                let Some(chain) = watcher_chains.get(&key.chain_id) else {
                    warn!(key = %key, "watcher chain has no running simulator, skipping");
                    continue;
                };
                let service =
                    build_watcher(&spec.name, template, &key, chain, index)?;
                watchers.insert(key, service);
            }
        }

        let api = spec
            .api
            .map(|mut cfg| {
                cfg.kind = ServiceKind::MarketApi;
                FrameworkDescriptor::new(cfg).map(FrameworkService::new)
            })
            .transpose()?;

        if api.is_none() && watchers.is_empty() {
            return Err(StackError::InvalidDescriptor(
                "a market owning neither an API nor a watcher is meaningless".to_owned(),
            ));
        }

        let mut signatures = BTreeMap::new();
        for chain in api_bindings.values().chain(watcher_chains.values()) {
            signatures.insert(
                chain.chain_id.to_string(),
                chain_signature(chain),
            );
        }

        let mut doc_cfg = spec.doc_store;
        doc_cfg.signature = None;
        let mut kv_cfg = spec.kv_store;
        kv_cfg.signature = None;

        Ok(Self {
            name: spec.name,
            doc: StoreDaemon::document(doc_cfg)?,
            kv: StoreDaemon::key_value(kv_cfg)?,
            api,
            watchers,
            signatures,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn doc_store(&self) -> &StoreDaemon {
        &self.doc
    }

    #[must_use]
    pub fn kv_store(&self) -> &StoreDaemon {
        &self.kv
    }

    #[must_use]
    pub fn api(&self) -> Option<&FrameworkService> {
        self.api.as_ref()
    }

    #[must_use]
    pub fn watchers(&self) -> &BTreeMap<WatcherKey, FrameworkService> {
        &self.watchers
    }

    #[must_use]
    pub fn signatures(&self) -> &BTreeMap<String, Signature> {
        &self.signatures
    }

    /// Install both store directories when missing, then register the
    /// accumulated signatures.
    ///
    /// # Errors
    /// Propagates installation failures and signature conflicts.
    pub fn ensure_stores(&self) -> Result<(), StackError> {
        self.doc.ensure_store()?;
        self.kv.ensure_store()?;
        self.apply_signatures()
    }

    /// Pre-flight every signature against both store ledgers, then register
    /// them. No ledger is mutated unless all entries are compatible with
    /// both stores.
    ///
    /// # Errors
    /// [`StoreError::SignatureConflict`] (wrapped) when any entry clashes;
    /// `NotFound` when a store directory is not installed.
    pub fn apply_signatures(&self) -> Result<(), StackError> {
        let mut doc_dir = self.doc.load_store()?.ok_or_else(|| {
            StackError::NotFound(format!("{} document store directory", self.name))
        })?;
        let mut kv_dir = self.kv.load_store()?.ok_or_else(|| {
            StackError::NotFound(format!("{} key-value store directory", self.name))
        })?;

        for (name, sig) in &self.signatures {
            for dir in [&doc_dir, &kv_dir] {
                if !dir.is_sig_compatible(name, sig) {
                    return Err(StackError::Store(StoreError::SignatureConflict {
                        dir: dir.root().to_path_buf(),
                        name: name.clone(),
                    }));
                }
            }
        }
        for (name, sig) in &self.signatures {
            doc_dir.add_sig(name, sig.clone())?;
            kv_dir.add_sig(name, sig.clone())?;
        }
        Ok(())
    }

    fn sub_processes(&self) -> Vec<&FrameworkService> {
        self.api.iter().chain(self.watchers.values()).collect()
    }
}

fn chain_signature(chain: &ResolvedChain) -> Signature {
    Signature::new(MARKET_SIGNER, json!(chain.store_id))
}

fn build_watcher(
    market: &str,
    template: &FrameworkConfig,
    key: &WatcherKey,
    chain: &ResolvedChain,
    index: usize,
) -> Result<FrameworkService, StackError> {
    let offset = u16::try_from(index)
        .ok()
        .and_then(|i| template.port.checked_add(i))
        .ok_or_else(|| {
            StackError::InvalidDescriptor(format!(
                "watcher port range overflows starting at {}",
                template.port
            ))
        })?;

    let suffix = format!("{}-{}", key.chain_id, key.deployment);
    let mut cfg = template.clone();
    cfg.kind = ServiceKind::MarketWatcher;
    cfg.service_name = format!("{market}-watcher-{suffix}");
    cfg.port = offset;
    cfg.log_file = suffixed(&template.log_file, &suffix);
    cfg.pid_file = suffixed(&template.pid_file, &suffix);
    cfg.binding = Some(ChainBinding {
        chain_id: key.chain_id,
        contract: template.binding.as_ref().and_then(|b| b.contract.clone()),
        store_id: Some(chain.store_id.clone()),
    });

    Ok(FrameworkService::new(FrameworkDescriptor::new(cfg)?))
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map_or_else(String::new, |s| s.to_string_lossy().into_owned());
    let ext = path
        .extension()
        .map_or_else(String::new, |e| format!(".{}", e.to_string_lossy()));
    path.with_file_name(format!("{stem}-{suffix}{ext}"))
}

#[async_trait]
impl Service for Market {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Market
    }

    fn label(&self) -> String {
        format!("market:{}", self.name)
    }

    fn can_start(&self) -> bool {
        self.doc.can_start()
            && self.kv.can_start()
            && self.sub_processes().iter().all(|s| s.can_start())
    }

    /// Stores first (parallel), then API and watchers in parallel.
    /// Sub-failures are collected and reported; they never roll back the
    /// stores.
    #[instrument(skip_all, fields(service = %self.label()))]
    async fn start(&self, opts: &StartOptions) -> Result<(), StackError> {
        self.apply_signatures()?;

        let mut outcome = GroupOutcome::default();

        let (doc_res, kv_res) = tokio::join!(self.doc.start(opts), self.kv.start(opts));
        for (service, result) in [(&self.doc, doc_res), (&self.kv, kv_res)] {
            match result {
                Ok(()) => outcome.succeeded.push(service.label()),
                Err(e) => outcome.failed.push((service.label(), e)),
            }
        }

        let subs = self.sub_processes();
        let results = join_all(subs.iter().map(|svc| async move {
            let label = svc.label();
            (label, svc.start(opts).await)
        }))
        .await;
        for (label, result) in results {
            match result {
                Ok(()) => outcome.succeeded.push(label),
                Err(e) => outcome.failed.push((label, e)),
            }
        }

        info!(
            started = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "market start completed"
        );
        outcome.into_result()
    }

    /// Reverse order of start: API and watchers first, stores last.
    #[instrument(skip_all, fields(service = %self.label()))]
    async fn stop(&self, opts: &StopOptions) -> Result<(), StackError> {
        let mut outcome = GroupOutcome::default();

        let subs = self.sub_processes();
        let results = join_all(subs.iter().map(|svc| async move {
            let label = svc.label();
            (label, svc.stop(opts).await)
        }))
        .await;
        for (label, result) in results {
            match result {
                Ok(()) => outcome.succeeded.push(label),
                Err(e) => outcome.failed.push((label, e)),
            }
        }

        let (doc_res, kv_res) = tokio::join!(self.doc.stop(opts), self.kv.stop(opts));
        for (service, result) in [(&self.doc, doc_res), (&self.kv, kv_res)] {
            match result {
                Ok(()) => outcome.succeeded.push(service.label()),
                Err(e) => outcome.failed.push((service.label(), e)),
            }
        }

        outcome.into_result()
    }

    /// The container owns no process of its own.
    async fn pid(&self) -> Result<Option<u32>, StackError> {
        Ok(None)
    }

    async fn state(&self) -> Result<ServiceState, StackError> {
        for sub in self.sub_processes() {
            if sub.pid().await?.is_some() {
                return Ok(ServiceState::Running);
            }
        }
        if self.doc.pid().await?.is_some() || self.kv.pid().await?.is_some() {
            return Ok(ServiceState::Running);
        }
        Ok(ServiceState::Absent)
    }

    async fn is_ready(&self) -> Result<bool, StackError> {
        if !self.doc.is_ready().await? || !self.kv.is_ready().await? {
            return Ok(false);
        }
        for sub in self.sub_processes() {
            if !sub.is_ready().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// One row per API/watcher sub-process, each seeded as sharing the
    /// stores' pids; no row for the container itself.
    async fn pid_rows(&self) -> Result<Vec<PidRow>, StackError> {
        let doc_pid = self.doc.pid().await?;
        let kv_pid = self.kv.pid().await?;

        let mut rows = Vec::new();
        for sub in self.sub_processes() {
            if let Some(pid) = sub.pid().await? {
                let mut row = PidRow::new(pid, sub.kind(), sub.label());
                if let Some(p) = doc_pid {
                    row = row.sharing(p);
                }
                if let Some(p) = kv_pid {
                    row = row.sharing(p);
                }
                rows.push(row);
            }
        }
        Ok(rows)
    }
}
