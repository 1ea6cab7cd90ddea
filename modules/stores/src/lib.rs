//! Database services of the stack.
//!
//! Both store flavors (document and key-value) run as daemons whose data
//! path is the payload subdirectory of a signed store directory; the store
//! identifier therefore appears in the daemon command line and discovery
//! uses it to tell two instances on the same host:port history apart.

mod daemon;

pub use daemon::{
    READY_POLICY, StoreDaemon, StoreDaemonCmdline, StoreDaemonConfig, StoreDaemonDescriptor,
    StoreFlavor, parse_command,
};
