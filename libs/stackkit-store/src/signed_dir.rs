use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreError;

/// Default name of the identifier marker file.
pub const DEFAULT_MARKER_FILE: &str = "store.id";

/// Name of the signature ledger file.
const LEDGER_FILE: &str = "signatures.json";

/// One ledger entry: the consumer's service type plus an arbitrary
/// comparison payload. Two signatures are compatible iff they are deep-equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub service_type: String,
    pub payload: serde_json::Value,
}

impl Signature {
    pub fn new(service_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            service_type: service_type.into(),
            payload,
        }
    }
}

/// Options for [`SignedDirectory::install`].
#[derive(Debug, Default)]
pub struct InstallOptions {
    /// Marker file name override; [`DEFAULT_MARKER_FILE`] when `None`.
    pub marker_file: Option<String>,
    /// Ledger entry to seed at install time.
    pub seed: Option<(String, Signature)>,
}

/// Options for [`SignedDirectory::load`].
#[derive(Debug, Default)]
pub struct LoadOptions {
    /// Marker file name override; [`DEFAULT_MARKER_FILE`] when `None`.
    pub marker_file: Option<String>,
    /// Signature to register (or verify against an existing entry).
    pub signature: Option<(String, Signature)>,
    /// Strict mode turns a missing marker into an error instead of `Ok(None)`.
    pub strict: bool,
}

/// Handle over an installed store directory.
///
/// The identifier is immutable after creation; ledger entries are append-only
/// and must be exactly equal on re-submission.
#[derive(Debug)]
pub struct SignedDirectory {
    root: PathBuf,
    marker_file: String,
    id: String,
    ledger: BTreeMap<String, Signature>,
}

impl SignedDirectory {
    /// Install a fresh store directory.
    ///
    /// Fails with [`StoreError::AlreadyInstalled`] if `root` already exists.
    /// Creates the directory, writes a fresh random identifier to the marker
    /// file, creates the identifier-named payload subdirectory and optionally
    /// seeds the ledger.
    ///
    /// # Errors
    /// Returns an error when the directory exists or any file write fails.
    pub fn install(
        service_type: &str,
        root: &Path,
        opts: InstallOptions,
    ) -> Result<Self, StoreError> {
        if root.exists() {
            return Err(StoreError::AlreadyInstalled(root.to_path_buf()));
        }

        let marker_file = opts
            .marker_file
            .unwrap_or_else(|| DEFAULT_MARKER_FILE.to_owned());
        let id = fresh_identifier();

        fs::create_dir_all(root)?;
        fs::write(root.join(&marker_file), &id)?;
        fs::create_dir_all(root.join(&id))?;

        let mut dir = Self {
            root: root.to_path_buf(),
            marker_file,
            id,
            ledger: BTreeMap::new(),
        };

        if let Some((name, sig)) = opts.seed {
            dir.ledger.insert(name, sig);
            dir.persist_ledger()?;
        }

        info!(
            service_type,
            root = %dir.root.display(),
            id = %dir.id,
            "installed signed store directory"
        );
        Ok(dir)
    }

    /// Load an installed store directory.
    ///
    /// A missing marker file yields `Ok(None)` in lenient mode and
    /// [`StoreError::NotInstalled`] in strict mode. When a signature is
    /// requested and the ledger already holds an entry under that name, the
    /// two must be deep-equal or the call fails with
    /// [`StoreError::SignatureConflict`]; otherwise the entry is added and
    /// persisted.
    ///
    /// # Errors
    /// Returns an error on marker/ledger corruption, signature conflict, or
    /// (in strict mode) a missing installation.
    pub fn load(
        service_type: &str,
        root: &Path,
        opts: LoadOptions,
    ) -> Result<Option<Self>, StoreError> {
        let marker_file = opts
            .marker_file
            .unwrap_or_else(|| DEFAULT_MARKER_FILE.to_owned());
        let marker_path = root.join(&marker_file);

        if !marker_path.is_file() {
            if opts.strict {
                return Err(StoreError::NotInstalled(root.to_path_buf()));
            }
            return Ok(None);
        }

        let id = fs::read_to_string(&marker_path)?.trim().to_owned();
        if id.is_empty() {
            return Err(StoreError::CorruptMarker(root.to_path_buf()));
        }

        let ledger_path = root.join(LEDGER_FILE);
        let ledger: BTreeMap<String, Signature> = if ledger_path.is_file() {
            serde_json::from_slice(&fs::read(&ledger_path)?)?
        } else {
            BTreeMap::new()
        };

        let mut dir = Self {
            root: root.to_path_buf(),
            marker_file,
            id,
            ledger,
        };

        if let Some((name, sig)) = opts.signature {
            dir.add_sig(&name, sig)?;
        }

        debug!(
            service_type,
            root = %dir.root.display(),
            id = %dir.id,
            entries = dir.ledger.len(),
            "loaded signed store directory"
        );
        Ok(Some(dir))
    }

    /// The stable store identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Root of the signed directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The identifier-named subdirectory holding the store payload.
    #[must_use]
    pub fn payload_dir(&self) -> PathBuf {
        self.root.join(&self.id)
    }

    /// Marker file name in use for this directory.
    #[must_use]
    pub fn marker_file(&self) -> &str {
        &self.marker_file
    }

    /// Registered ledger entry under `name`, if any.
    #[must_use]
    pub fn signature(&self, name: &str) -> Option<&Signature> {
        self.ledger.get(name)
    }

    /// Whether `sig` can be registered under `name` without conflict.
    ///
    /// True when no entry exists yet or the existing entry is deep-equal.
    #[must_use]
    pub fn is_sig_compatible(&self, name: &str, sig: &Signature) -> bool {
        self.ledger.get(name).is_none_or(|existing| existing == sig)
    }

    /// Register `sig` under `name` and persist the ledger.
    ///
    /// Returns `Ok(true)` when a new entry was written, `Ok(false)` when an
    /// identical entry already existed (the ledger file is left untouched).
    ///
    /// # Errors
    /// Fails with [`StoreError::SignatureConflict`] when an incompatible entry
    /// is already registered under `name`.
    pub fn add_sig(&mut self, name: &str, sig: Signature) -> Result<bool, StoreError> {
        match self.ledger.get(name) {
            Some(existing) if *existing == sig => Ok(false),
            Some(_) => Err(StoreError::SignatureConflict {
                dir: self.root.clone(),
                name: name.to_owned(),
            }),
            None => {
                self.ledger.insert(name.to_owned(), sig);
                self.persist_ledger()?;
                Ok(true)
            }
        }
    }

    fn persist_ledger(&self) -> Result<(), StoreError> {
        let mut bytes = serde_json::to_vec_pretty(&self.ledger)?;
        bytes.push(b'\n');
        fs::write(self.root.join(LEDGER_FILE), bytes)?;
        Ok(())
    }
}

fn fresh_identifier() -> String {
    let raw: [u8; 16] = rand::rng().random();
    hex::encode(raw)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn sig(payload: serde_json::Value) -> Signature {
        Signature::new("tester", payload)
    }

    // -------------------------
    // install tests
    // -------------------------

    #[test]
    fn install_creates_marker_and_payload_dir() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("db");

        let dir = SignedDirectory::install("tester", &root, InstallOptions::default()).unwrap();

        assert_eq!(dir.id().len(), 32);
        assert!(root.join(DEFAULT_MARKER_FILE).is_file());
        assert!(dir.payload_dir().is_dir());
    }

    #[test]
    fn install_refuses_existing_directory() {
        let tmp = tempdir().unwrap();

        let err = SignedDirectory::install("tester", tmp.path(), InstallOptions::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyInstalled(_)));
    }

    #[test]
    fn install_with_seed_persists_ledger() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("db");

        let opts = InstallOptions {
            seed: Some(("core".to_owned(), sig(json!({"chain": 1337})))),
            ..InstallOptions::default()
        };
        SignedDirectory::install("tester", &root, opts).unwrap();

        let loaded = SignedDirectory::load("tester", &root, LoadOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(loaded.signature("core"), Some(&sig(json!({"chain": 1337}))));
    }

    // -------------------------
    // load tests
    // -------------------------

    #[test]
    fn load_missing_is_none_in_lenient_mode() {
        let tmp = tempdir().unwrap();

        let loaded =
            SignedDirectory::load("tester", &tmp.path().join("nope"), LoadOptions::default())
                .unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn load_missing_errors_in_strict_mode() {
        let tmp = tempdir().unwrap();

        let err = SignedDirectory::load(
            "tester",
            &tmp.path().join("nope"),
            LoadOptions {
                strict: true,
                ..LoadOptions::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::NotInstalled(_)));
    }

    #[test]
    fn load_keeps_identifier_stable() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("db");

        let installed =
            SignedDirectory::install("tester", &root, InstallOptions::default()).unwrap();
        let loaded = SignedDirectory::load("tester", &root, LoadOptions::default())
            .unwrap()
            .unwrap();

        assert_eq!(installed.id(), loaded.id());
    }

    #[test]
    fn load_with_custom_marker_file() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("db");

        SignedDirectory::install(
            "tester",
            &root,
            InstallOptions {
                marker_file: Some("chain.id".to_owned()),
                seed: None,
            },
        )
        .unwrap();

        // Default marker name must not match.
        assert!(
            SignedDirectory::load("tester", &root, LoadOptions::default())
                .unwrap()
                .is_none()
        );

        let loaded = SignedDirectory::load(
            "tester",
            &root,
            LoadOptions {
                marker_file: Some("chain.id".to_owned()),
                ..LoadOptions::default()
            },
        )
        .unwrap();
        assert!(loaded.is_some());
    }

    // -------------------------
    // signature ledger tests
    // -------------------------

    #[test]
    fn conflicting_signature_is_rejected_deterministically() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("db");

        let mut dir = SignedDirectory::install("tester", &root, InstallOptions::default()).unwrap();
        assert!(dir.add_sig("x", sig(json!("s1"))).unwrap());

        let err = dir.add_sig("x", sig(json!("s2"))).unwrap_err();
        assert!(matches!(err, StoreError::SignatureConflict { ref name, .. } if name == "x"));

        // The original entry survives and identical repeats stay accepted.
        assert!(!dir.add_sig("x", sig(json!("s1"))).unwrap());
    }

    #[test]
    fn identical_reload_leaves_ledger_byte_identical() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("db");
        let requested = ("core".to_owned(), sig(json!({"chain": 65535})));

        SignedDirectory::install("tester", &root, InstallOptions::default()).unwrap();
        SignedDirectory::load(
            "tester",
            &root,
            LoadOptions {
                signature: Some(requested.clone()),
                ..LoadOptions::default()
            },
        )
        .unwrap()
        .unwrap();

        let before = std::fs::read(root.join("signatures.json")).unwrap();

        SignedDirectory::load(
            "tester",
            &root,
            LoadOptions {
                signature: Some(requested),
                ..LoadOptions::default()
            },
        )
        .unwrap()
        .unwrap();

        let after = std::fs::read(root.join("signatures.json")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn load_with_conflicting_signature_fails() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("db");

        SignedDirectory::install(
            "tester",
            &root,
            InstallOptions {
                seed: Some(("core".to_owned(), sig(json!("a")))),
                ..InstallOptions::default()
            },
        )
        .unwrap();

        let err = SignedDirectory::load(
            "tester",
            &root,
            LoadOptions {
                signature: Some(("core".to_owned(), sig(json!("b")))),
                ..LoadOptions::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::SignatureConflict { .. }));
    }

    #[test]
    fn is_sig_compatible_preflight() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("db");

        let mut dir = SignedDirectory::install("tester", &root, InstallOptions::default()).unwrap();
        dir.add_sig("1337", sig(json!("id-a"))).unwrap();

        assert!(dir.is_sig_compatible("1337", &sig(json!("id-a"))));
        assert!(!dir.is_sig_compatible("1337", &sig(json!("id-b"))));
        assert!(dir.is_sig_compatible("31337", &sig(json!("anything"))));
    }
}
