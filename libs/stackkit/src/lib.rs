//! Service supervision core for the chainstack development stack.
//!
//! Every CLI invocation is short-lived and stateless: liveness is recomputed
//! on demand by pattern-matching the OS process table, never read from a
//! supervisor database. This crate carries the pieces every service family
//! builds on:
//!
//! - [`probe`]: process-table snapshots and ANDed marker matching,
//! - [`readiness`]: bounded, cancellable retry loops and log scanning,
//! - [`launcher`]: generated launch scripts, detached spawning, signals,
//! - [`contracts`]: the [`Service`](contracts::Service) trait and options,
//! - [`deps`] / [`group`]: dependency-ordered group start/stop,
//! - [`correlate`]: the cross-service PID relationship table,
//! - [`http`]: the minimal HTTP client readiness probes share.

pub mod contracts;
pub mod correlate;
pub mod deps;
pub mod error;
pub mod group;
pub mod http;
pub mod launcher;
pub mod probe;
pub mod readiness;

pub use contracts::{
    RuntimeHandle, Service, ServiceKind, ServiceState, StartOptions, StopOptions,
};
pub use correlate::{PidRow, PidTable};
pub use error::{StackError, allow_absent};
pub use group::{GroupOutcome, start_group, stop_group};
pub use launcher::LaunchPlan;
pub use probe::{ProcessPattern, ProcessProbe, ProcessRecord};
pub use readiness::{LogWatch, Readiness, RetryPolicy, wait_until};
