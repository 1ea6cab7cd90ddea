#![allow(clippy::unwrap_used)]

//! Market reconstruction and signature-accumulation scenarios.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use backend::FrameworkConfig;
use chain_sim::SimulatorCmdline;
use market::{Market, MarketSpec, WatcherKey};
use stackkit::contracts::{RuntimeHandle, ServiceKind};
use stackkit::error::StackError;
use stackkit_store::StoreError;
use stores::{StoreDaemonConfig, StoreFlavor};

fn running_sims(
    entries: &[(u64, u32, &str)],
) -> BTreeMap<u64, RuntimeHandle<SimulatorCmdline>> {
    entries
        .iter()
        .map(|&(chain_id, pid, store_id)| {
            (
                chain_id,
                RuntimeHandle::new(
                    pid,
                    Some(SimulatorCmdline {
                        chain_id,
                        host: "127.0.0.1".to_owned(),
                        port: 8545,
                        block_time: None,
                        data_dir: PathBuf::from("/var/lib/sim").join(store_id),
                    }),
                ),
            )
        })
        .collect()
}

fn store_cfg(flavor: StoreFlavor, root: &Path, port: u16) -> StoreDaemonConfig {
    StoreDaemonConfig {
        flavor,
        name: format!("market-{}", port),
        host: "127.0.0.1".to_owned(),
        port,
        program: PathBuf::from("/opt/stored/bin/stored"),
        store_root: root.to_path_buf(),
        log_file: root.with_extension("log"),
        pid_file: root.with_extension("pid"),
        signature: None,
    }
}

fn framework_cfg(tmp: &Path, kind: ServiceKind, port: u16) -> FrameworkConfig {
    FrameworkConfig {
        kind,
        service_name: "market-api".to_owned(),
        entry_point: "com.acme.market.Application".to_owned(),
        host: "127.0.0.1".to_owned(),
        port,
        program: PathBuf::from("/usr/bin/java"),
        runtime_args: vec![],
        config_file: tmp.join("market.yml"),
        home_dir: tmp.to_path_buf(),
        log_file: tmp.join("market.log"),
        pid_file: tmp.join("market.pid"),
        success_markers: vec!["Started".to_owned()],
        failure_markers: vec!["ERROR".to_owned()],
        exclude_markers: vec![],
        extra_env: BTreeMap::new(),
        binding: None,
    }
}

fn spec(tmp: &Path, api_chains: Vec<u64>, mirror: bool) -> MarketSpec {
    MarketSpec {
        name: "main".to_owned(),
        doc_store: store_cfg(StoreFlavor::Document, &tmp.join("doc"), 27017),
        kv_store: store_cfg(StoreFlavor::KeyValue, &tmp.join("kv"), 6379),
        api: Some(framework_cfg(tmp, ServiceKind::MarketApi, 3000)),
        api_chains,
        watcher_template: Some(framework_cfg(tmp, ServiceKind::MarketWatcher, 3100)),
        explicit_watchers: vec![],
        mirror_api_chains: mirror,
        deployment: "main".to_owned(),
    }
}

#[test]
fn market_without_api_or_watchers_is_invalid() {
    let tmp = tempfile::tempdir().unwrap();
    let mut spec = spec(tmp.path(), vec![], false);
    spec.api = None;

    let err = Market::assemble(spec, &running_sims(&[])).unwrap_err();
    assert!(matches!(err, StackError::InvalidDescriptor(_)));
}

#[test]
fn mirrored_watchers_follow_resolved_api_chains() {
    let tmp = tempfile::tempdir().unwrap();
    let running = running_sims(&[(1337, 10, "aaaa"), (31337, 11, "bbbb")]);

    // 99999 has no running simulator and is skipped everywhere.
    let market = Market::assemble(spec(tmp.path(), vec![1337, 31337, 99999], true), &running)
        .unwrap();

    let keys: Vec<&WatcherKey> = market.watchers().keys().collect();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0], &WatcherKey::new(1337, "main"));
    assert_eq!(keys[1], &WatcherKey::new(31337, "main"));

    // One ledger entry per resolved chain id, bound to the simulator store.
    assert_eq!(market.signatures().len(), 2);
    assert_eq!(
        market.signatures().get("1337").unwrap().payload,
        serde_json::json!("aaaa")
    );
    assert_eq!(
        market.signatures().get("31337").unwrap().payload,
        serde_json::json!("bbbb")
    );
}

#[test]
fn explicit_watcher_keys_deduplicate_with_mirrored_ones() {
    let tmp = tempfile::tempdir().unwrap();
    let running = running_sims(&[(1337, 10, "aaaa")]);

    let mut spec = spec(tmp.path(), vec![1337], true);
    spec.explicit_watchers = vec![
        WatcherKey::new(1337, "main"),
        WatcherKey::new(1337, "backup"),
    ];

    let market = Market::assemble(spec, &running).unwrap();
    let keys: Vec<String> = market.watchers().keys().map(ToString::to_string).collect();
    assert_eq!(keys, vec!["1337/backup".to_owned(), "1337/main".to_owned()]);
}

#[test]
fn watcher_ports_are_distinct() {
    let tmp = tempfile::tempdir().unwrap();
    let running = running_sims(&[(1337, 10, "aaaa"), (31337, 11, "bbbb")]);

    let market =
        Market::assemble(spec(tmp.path(), vec![1337, 31337], true), &running).unwrap();

    let ports: Vec<u16> = market
        .watchers()
        .values()
        .map(|w| w.descriptor().port())
        .collect();
    assert_eq!(ports.len(), 2);
    assert_ne!(ports[0], ports[1]);
}

#[test]
fn signature_roundtrip_and_conflict_across_markets() {
    let tmp = tempfile::tempdir().unwrap();
    let running_a = running_sims(&[(1337, 10, "sim-data-a")]);

    let market_a = Market::assemble(spec(tmp.path(), vec![1337], false), &running_a).unwrap();
    market_a.ensure_stores().unwrap();
    // Re-applying identical signatures is idempotent.
    market_a.apply_signatures().unwrap();

    // A second market over the same store directories, but whose chain 1337
    // now resolves to different simulator data.
    let running_b = running_sims(&[(1337, 20, "sim-data-b")]);
    let market_b = Market::assemble(spec(tmp.path(), vec![1337], false), &running_b).unwrap();

    let err = market_b.apply_signatures().unwrap_err();
    assert!(matches!(
        err,
        StackError::Store(StoreError::SignatureConflict { .. })
    ));
}

#[test]
fn api_without_resolved_chains_still_assembles() {
    let tmp = tempfile::tempdir().unwrap();

    let market = Market::assemble(spec(tmp.path(), vec![99999], false), &running_sims(&[]))
        .unwrap();

    assert!(market.api().is_some());
    assert!(market.watchers().is_empty());
    assert!(market.signatures().is_empty());
}
