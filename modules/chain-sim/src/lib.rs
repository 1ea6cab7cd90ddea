//! Chain-simulator service.
//!
//! The simulator is the discovery exemplar of the stack: launch arguments
//! are deterministic and order-fixed so a fixed-anchor pattern finds running
//! instances, and the command-line parser is the exact inverse of the
//! argument builder. Readiness polls JSON-RPC `eth_chainId` until it equals
//! the configured chain id.

mod descriptor;
mod rpc;
mod service;

pub use descriptor::{
    SimulatorCmdline, SimulatorConfig, SimulatorDescriptor, any_simulator_pattern, parse_command,
};
pub use rpc::{RpcClient, parse_hex_quantity};
pub use service::{READY_POLICY, Simulator, discover_all, group_by_chain};
