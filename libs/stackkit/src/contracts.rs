//! The service contract.
//!
//! Every manageable process family implements [`Service`]: identity plus
//! OS-level lifecycle operations. Observed state is recomputed from the
//! process table on demand and never stored; the only state shape is
//! `UNKNOWN →discover→ {ABSENT|RUNNING}`, `ABSENT →start→ STARTING →
//! {RUNNING|FAILED}`, `RUNNING →stop→ {ABSENT|FAILED}`.
//!
//! Dispatch across service families goes through the closed [`ServiceKind`]
//! tag; cross-cutting consumers (the correlator, group operations) match on
//! the tag instead of chaining downcasts.

use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::correlate::PidRow;
use crate::error::StackError;
use crate::readiness::RetryPolicy;

/// Closed tag over every service family the supervisor manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServiceKind {
    Simulator,
    ContentStore,
    DocumentStore,
    KeyValueStore,
    CoreApi,
    Worker,
    MarketApi,
    MarketWatcher,
    /// The composite container itself; it owns sub-processes but no process
    /// of its own.
    Market,
}

impl ServiceKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Simulator => "simulator",
            Self::ContentStore => "content-store",
            Self::DocumentStore => "document-store",
            Self::KeyValueStore => "key-value-store",
            Self::CoreApi => "core-api",
            Self::Worker => "worker",
            Self::MarketApi => "market-api",
            Self::MarketWatcher => "market-watcher",
            Self::Market => "market",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed lifecycle state, recomputed on every query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Unknown,
    Absent,
    Starting,
    Running,
    Failed,
}

/// A live pid paired with the descriptor reconstructed from its command
/// line/environment, or `None` when reconstruction failed. Created
/// transiently by discovery and never persisted.
#[derive(Debug, Clone)]
pub struct RuntimeHandle<D> {
    pub pid: u32,
    pub descriptor: Option<D>,
}

impl<D> RuntimeHandle<D> {
    #[must_use]
    pub const fn new(pid: u32, descriptor: Option<D>) -> Self {
        Self { pid, descriptor }
    }
}

/// Options for [`Service::start`].
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Block until the service reports ready (default) or return right after
    /// the spawn.
    pub wait_ready: bool,
    /// Override of the service's own retry budget.
    pub retry: Option<RetryPolicy>,
    pub cancel: CancellationToken,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            wait_ready: true,
            retry: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl StartOptions {
    #[must_use]
    pub fn no_wait() -> Self {
        Self {
            wait_ready: false,
            ..Self::default()
        }
    }
}

/// Options for [`Service::stop`].
#[derive(Debug, Clone)]
pub struct StopOptions {
    /// Also reset on-disk state after the process is gone.
    pub reset: bool,
    /// Stop should normally run to completion even when the invocation is
    /// being cancelled; set to `false` to honor `cancel`.
    pub ignore_cancel: bool,
    pub cancel: CancellationToken,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            reset: false,
            ignore_cancel: true,
            cancel: CancellationToken::new(),
        }
    }
}

impl StopOptions {
    #[must_use]
    pub fn with_reset() -> Self {
        Self {
            reset: true,
            ..Self::default()
        }
    }
}

/// Identity + configuration + OS-level lifecycle of one manageable service.
#[async_trait]
pub trait Service: Send + Sync {
    fn kind(&self) -> ServiceKind;

    /// Display identity, e.g. `simulator@127.0.0.1:8545`.
    fn label(&self) -> String;

    /// Pure predicate over the descriptor: required paths/data present.
    /// Never touches the OS process table.
    fn can_start(&self) -> bool;

    /// Launch the service.
    ///
    /// Re-runs discovery first and refuses with [`StackError::AlreadyBusy`]
    /// when a live instance with the same identity exists.
    async fn start(&self, opts: &StartOptions) -> Result<(), StackError>;

    /// Discover the live pid and signal termination. Never fails when there
    /// is nothing to stop.
    async fn stop(&self, opts: &StopOptions) -> Result<(), StackError>;

    /// Discover the live instance's pid, disambiguated by identity fields.
    ///
    /// More than one surviving match is an internal invariant violation
    /// ([`StackError::AmbiguousDiscovery`]), not a normal outcome.
    async fn pid(&self) -> Result<Option<u32>, StackError>;

    async fn is_ready(&self) -> Result<bool, StackError>;

    /// Recompute the observed state from the process table.
    async fn state(&self) -> Result<ServiceState, StackError> {
        Ok(match self.pid().await? {
            Some(_) => ServiceState::Running,
            None => ServiceState::Absent,
        })
    }

    /// Correlator rows for this service's live processes.
    ///
    /// The default is one unshared row per discovered pid; composite
    /// services override this to contribute one row per sub-process.
    async fn pid_rows(&self) -> Result<Vec<PidRow>, StackError> {
        Ok(self
            .pid()
            .await?
            .map(|pid| vec![PidRow::new(pid, self.kind(), self.label())])
            .unwrap_or_default())
    }
}
