//! Build service instances from configuration sections.
//!
//! Optional paths in the config default to conventional locations under the
//! supervisor home directory (`chains/`, `stores/`, `logs/`, `run/`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use backend::FrameworkConfig;
use chain_sim::{Simulator, SimulatorConfig, SimulatorDescriptor};
use content_store::{ContentStore, ContentStoreConfig, ContentStoreDescriptor};
use market::{MarketSpec, WatcherKey};
use stackkit::contracts::{Service, ServiceKind};
use stores::{StoreDaemonConfig, StoreFlavor};

use crate::config::{
    AppConfig, BackendSection, ContentStoreSection, MarketSection, SimulatorSection, StoreSection,
};

/// The base (non-composite) services of one stack invocation.
pub struct BaseServices {
    pub simulators: Vec<Arc<Simulator>>,
    pub content_store: Option<Arc<ContentStore>>,
}

impl BaseServices {
    /// Flattened trait-object view for group operations.
    #[must_use]
    pub fn as_services(&self) -> Vec<Arc<dyn Service>> {
        let mut services: Vec<Arc<dyn Service>> = Vec::new();
        for sim in &self.simulators {
            services.push(Arc::clone(sim) as Arc<dyn Service>);
        }
        if let Some(store) = &self.content_store {
            services.push(Arc::clone(store) as Arc<dyn Service>);
        }
        services
    }
}

/// Build every configured base service.
///
/// # Errors
/// Propagates descriptor validation failures.
pub fn build_base_services(config: &AppConfig) -> Result<BaseServices> {
    let home = config.home_dir();

    let mut simulators = Vec::new();
    for section in &config.simulators {
        simulators.push(Arc::new(build_simulator(&home, section)?));
    }

    let content_store = config
        .content_store
        .as_ref()
        .map(|section| build_content_store(&home, section))
        .transpose()?
        .map(Arc::new);

    Ok(BaseServices {
        simulators,
        content_store,
    })
}

fn build_simulator(home: &PathBuf, section: &SimulatorSection) -> Result<Simulator> {
    let stem = format!("simulator-{}", section.chain_id);
    let descriptor = SimulatorDescriptor::new(SimulatorConfig {
        chain_id: section.chain_id,
        host: section.host.clone(),
        port: section.port,
        block_time: section.block_time,
        program: section.program.clone(),
        store_root: section
            .data_dir
            .clone()
            .unwrap_or_else(|| home.join("chains").join(format!("chain-{}", section.chain_id))),
        log_file: section
            .log_file
            .clone()
            .unwrap_or_else(|| home.join("logs").join(format!("{stem}.log"))),
        pid_file: section
            .pid_file
            .clone()
            .unwrap_or_else(|| home.join("run").join(format!("{stem}.pid"))),
    })?;
    Ok(Simulator::new(descriptor))
}

fn build_content_store(home: &PathBuf, section: &ContentStoreSection) -> Result<ContentStore> {
    let descriptor = ContentStoreDescriptor::new(ContentStoreConfig {
        host: section.host.clone(),
        api_port: section.api_port,
        gateway_port: section.gateway_port,
        program: section.program.clone(),
        repo_dir: section
            .repo_dir
            .clone()
            .unwrap_or_else(|| home.join("content")),
        log_file: section
            .log_file
            .clone()
            .unwrap_or_else(|| home.join("logs").join("content-store.log")),
        pid_file: section
            .pid_file
            .clone()
            .unwrap_or_else(|| home.join("run").join("content-store.pid")),
    })?;
    Ok(ContentStore::new(descriptor))
}

fn build_store_config(
    home: &PathBuf,
    flavor: StoreFlavor,
    section: &StoreSection,
) -> StoreDaemonConfig {
    StoreDaemonConfig {
        flavor,
        name: section.name.clone(),
        host: section.host.clone(),
        port: section.port,
        program: section.program.clone(),
        store_root: section
            .store_root
            .clone()
            .unwrap_or_else(|| home.join("stores").join(&section.name)),
        log_file: section
            .log_file
            .clone()
            .unwrap_or_else(|| home.join("logs").join(format!("{}.log", section.name))),
        pid_file: section
            .pid_file
            .clone()
            .unwrap_or_else(|| home.join("run").join(format!("{}.pid", section.name))),
        signature: None,
    }
}

fn build_backend_config(
    home: &PathBuf,
    kind: ServiceKind,
    section: &BackendSection,
) -> FrameworkConfig {
    FrameworkConfig {
        kind,
        service_name: section.service_name.clone(),
        entry_point: section.entry_point.clone(),
        host: section.host.clone(),
        port: section.port,
        program: section.program.clone(),
        runtime_args: section.runtime_args.clone(),
        config_file: section.config_file.clone(),
        home_dir: section.home_dir.clone().unwrap_or_else(|| home.clone()),
        log_file: section
            .log_file
            .clone()
            .unwrap_or_else(|| home.join("logs").join(format!("{}.log", section.service_name))),
        pid_file: section
            .pid_file
            .clone()
            .unwrap_or_else(|| home.join("run").join(format!("{}.pid", section.service_name))),
        success_markers: section.success_markers.clone(),
        failure_markers: section.failure_markers.clone(),
        exclude_markers: section.exclude_markers.clone(),
        extra_env: std::collections::BTreeMap::new(),
        binding: None,
    }
}

/// Translate the market section into an assembly spec.
#[must_use]
pub fn build_market_spec(config: &AppConfig, section: &MarketSection) -> MarketSpec {
    let home = config.home_dir();
    MarketSpec {
        name: section.name.clone(),
        doc_store: build_store_config(&home, StoreFlavor::Document, &section.doc_store),
        kv_store: build_store_config(&home, StoreFlavor::KeyValue, &section.kv_store),
        api: section
            .api
            .as_ref()
            .map(|api| build_backend_config(&home, ServiceKind::MarketApi, api)),
        api_chains: section.api_chains.clone(),
        watcher_template: section
            .watcher
            .as_ref()
            .map(|w| build_backend_config(&home, ServiceKind::MarketWatcher, w)),
        explicit_watchers: section
            .watchers
            .iter()
            .map(|w| WatcherKey::new(w.chain_id, w.deployment.clone()))
            .collect(),
        mirror_api_chains: section.mirror_api_chains,
        deployment: section.deployment.clone(),
    }
}
