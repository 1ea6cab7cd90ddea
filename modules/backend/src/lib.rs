//! Framework backend services.
//!
//! JVM/Node backends whose identity travels in the process environment and
//! whose readiness is read from their log output. The chain-bound
//! specialization (one target chain/contract, one shared store) is expressed
//! as an optional [`ChainBinding`] that discovery layers on top of the base
//! match.

mod descriptor;
mod service;

pub use descriptor::{
    CHAIN_ID_ENV, CONFIG_FILE_ENV, CONFIG_HASH_ENV, CONTRACT_ENV, ChainBinding, FrameworkConfig,
    FrameworkDescriptor, FrameworkEnv, HOME_ENV, HOST_ENV, PORT_ENV, STORE_ID_ENV, config_hash,
    parse_environ,
};
pub use service::{FrameworkService, READY_POLICY};
