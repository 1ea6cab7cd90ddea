//! Signed persistent-store directories.
//!
//! Several independent backends may point at the same on-disk store (for
//! example, two services sharing one chain's database directory). If one of
//! them is later reconfigured against a different chain while still sharing
//! the directory, silently continuing risks corrupting the store. A
//! [`SignedDirectory`] turns that situation into an explicit, caught error:
//! every logical consumer registers a named signature in a ledger next to the
//! data, and an incompatible re-registration fails as a conflict.
//!
//! Layout of a signed directory:
//!
//! ```text
//! <root>/
//!   store.id          opaque random-hex identifier, written once at install
//!   signatures.json   name -> { service_type, payload }
//!   <identifier>/     the store payload itself
//! ```

mod error;
mod signed_dir;

pub use error::StoreError;
pub use signed_dir::{
    DEFAULT_MARKER_FILE, InstallOptions, LoadOptions, SignedDirectory, Signature,
};
