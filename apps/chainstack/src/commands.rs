//! Subcommand implementations.
//!
//! Each command is one short-lived invocation: build descriptors from the
//! configuration, rediscover what is running, act, report.

use anyhow::{Result, bail};
use tracing::{info, warn};

use chain_sim::{discover_all, group_by_chain};
use market::Market;
use stackkit::contracts::{Service, StartOptions, StopOptions};
use stackkit::correlate::PidTable;
use stackkit::group::{GroupOutcome, start_group, stop_group};
use stackkit::probe::ProcessProbe;

use crate::config::AppConfig;
use crate::stack::{build_base_services, build_market_spec};

/// Reconstruct the market against the currently running simulator set.
fn assemble_market(config: &AppConfig) -> Result<Option<Market>> {
    let Some(section) = &config.market else {
        return Ok(None);
    };
    let probe = ProcessProbe::snapshot();
    let running = group_by_chain(discover_all(&probe))?;
    let market = Market::assemble(build_market_spec(config, section), &running)?;
    Ok(Some(market))
}

fn report(operation: &str, outcome: &GroupOutcome) {
    for label in &outcome.succeeded {
        info!(service = %label, "{operation} succeeded");
    }
    for (label, err) in &outcome.failed {
        warn!(service = %label, error = %err, "{operation} failed");
    }
}

/// `chainstack up`: prepare on-disk state, then start everything in
/// dependency order. Base services first; the market is reconstructed
/// against the simulators that are running once the first phase settles.
pub async fn up(config: &AppConfig, no_wait: bool) -> Result<()> {
    let base = build_base_services(config)?;
    for sim in &base.simulators {
        sim.ensure_store()?;
    }
    if let Some(store) = &base.content_store {
        store.ensure_repo()?;
    }

    let opts = if no_wait {
        StartOptions::no_wait()
    } else {
        StartOptions::default()
    };

    let mut outcome = start_group(&base.as_services(), &opts).await;

    if let Some(market) = assemble_market(config)? {
        market.ensure_stores()?;
        match market.start(&opts).await {
            Ok(()) => outcome.succeeded.push(market.label()),
            Err(e) => outcome.failed.push((market.label(), e)),
        }
    }

    report("start", &outcome);
    if !outcome.is_ok() {
        bail!("{} service(s) failed to start", outcome.failed.len());
    }
    println!("stack is up");
    Ok(())
}

/// `chainstack down`: market sub-processes first, then the base services in
/// reverse dependency order. Optionally resets on-disk state.
pub async fn down(config: &AppConfig, reset: bool) -> Result<()> {
    let opts = if reset {
        StopOptions::with_reset()
    } else {
        StopOptions::default()
    };

    let mut outcome = GroupOutcome::default();
    match assemble_market(config) {
        Ok(Some(market)) => match market.stop(&opts).await {
            Ok(()) => outcome.succeeded.push(market.label()),
            Err(e) => outcome.failed.push((market.label(), e)),
        },
        Ok(None) => {}
        // A market that cannot be reconstructed (e.g. simulators already
        // gone) must not block taking the rest of the stack down.
        Err(e) => warn!(error = %e, "skipping market during shutdown"),
    }

    let base = build_base_services(config)?;
    outcome.absorb(stop_group(&base.as_services(), &opts).await);

    report("stop", &outcome);
    if !outcome.is_ok() {
        bail!("{} service(s) failed to stop", outcome.failed.len());
    }
    println!("stack is down");
    Ok(())
}

/// `chainstack status`: recompute and print the observed state of every
/// configured service.
pub async fn status(config: &AppConfig) -> Result<()> {
    let base = build_base_services(config)?;
    for service in base.as_services() {
        let state = service.state().await?;
        println!("{:<40} {:?}", service.label(), state);
    }
    if let Some(market) = assemble_market(config)? {
        let state = market.state().await?;
        println!("{:<40} {:?}", market.label(), state);
    }
    Ok(())
}

/// `chainstack pids`: correlate every discovered process into one table.
pub async fn pids(config: &AppConfig) -> Result<()> {
    let mut table = PidTable::new();

    let base = build_base_services(config)?;
    for service in base.as_services() {
        for row in service.pid_rows().await? {
            table.insert(row)?;
        }
    }

    if let Some(market) = assemble_market(config)? {
        for row in market.doc_store().pid_rows().await? {
            table.insert(row)?;
        }
        for row in market.kv_store().pid_rows().await? {
            table.insert(row)?;
        }
        for row in market.pid_rows().await? {
            table.insert(row)?;
        }
    }

    table.close_reflexive();
    print!("{}", table.render());
    Ok(())
}

/// `chainstack check`: configuration is already validated by loading it.
pub fn check(config: &AppConfig) -> Result<()> {
    println!("configuration is valid");
    println!("{}", config.render()?);
    Ok(())
}
