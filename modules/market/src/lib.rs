//! Composite market service.
//!
//! One market owns a database pair, at most one API process and a watcher
//! set keyed by `(chain id, deployment)`. Reconstruction resolves chain
//! references against the running simulator set and accumulates one
//! signature-ledger entry per chain id, shared by both stores, so two
//! markets bound to different simulator data under the same chain id are
//! caught as a conflict before anything starts.

mod model;
mod service;

pub use model::{ResolvedChain, WatcherKey, resolve_chains};
pub use service::{Market, MarketSpec};
