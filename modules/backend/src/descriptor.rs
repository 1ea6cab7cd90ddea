//! Framework-service descriptors.
//!
//! Framework backends split their configuration in two: identity travels in
//! the process environment (host:port, a hash of the active structured
//! config file, paths), business parameters live in the generated config
//! file itself. Discovery matches the fully-qualified entry-point name plus
//! the constant marker naming the config-hash environment variable, then
//! compares the discovered hash against a freshly recomputed hash of the
//! on-disk file — a mismatch means the process is not ours.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use stackkit::contracts::ServiceKind;
use stackkit::error::StackError;
use stackkit::probe::{ProcessPattern, ProcessRecord};

/// Environment variable carrying the config-file hash; its name is the
/// constant discovery marker for every framework service.
pub const CONFIG_HASH_ENV: &str = "CS_CONFIG_SHA256";

pub const HOST_ENV: &str = "CS_HOST";
pub const PORT_ENV: &str = "CS_PORT";
pub const CONFIG_FILE_ENV: &str = "CS_CONFIG_FILE";
pub const HOME_ENV: &str = "CS_HOME";
pub const CHAIN_ID_ENV: &str = "CS_CHAIN_ID";
pub const CONTRACT_ENV: &str = "CS_CONTRACT_ADDRESS";
pub const STORE_ID_ENV: &str = "CS_STORE_ID";

/// SHA-256 of a config file, hex-encoded.
///
/// # Errors
/// Propagates read failures; a missing file is a read failure here, the
/// lenient discovery paths handle it before calling.
pub fn config_hash(path: &Path) -> Result<String, StackError> {
    let bytes = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Binding of a framework service to one target chain, contract and shared
/// store; layered onto discovery as additional filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBinding {
    pub chain_id: u64,
    pub contract: Option<String>,
    pub store_id: Option<String>,
}

/// Raw configuration for one framework service.
#[derive(Debug, Clone)]
pub struct FrameworkConfig {
    /// Must be one of the framework kinds (core API, worker, market API,
    /// market watcher).
    pub kind: ServiceKind,
    pub service_name: String,
    /// Fully-qualified entry point, e.g. `com.acme.core.Application`.
    pub entry_point: String,
    pub host: String,
    pub port: u16,
    /// Runtime binary (JVM or Node launcher).
    pub program: PathBuf,
    /// Runtime arguments placed before the entry point (classpath etc.).
    pub runtime_args: Vec<String>,
    pub config_file: PathBuf,
    pub home_dir: PathBuf,
    pub log_file: PathBuf,
    pub pid_file: PathBuf,
    /// ANDed success markers for the log-based readiness scan.
    pub success_markers: Vec<String>,
    pub failure_markers: Vec<String>,
    /// Known benign lines suppressed even when a failure marker hits.
    pub exclude_markers: Vec<String>,
    pub extra_env: BTreeMap<String, String>,
    pub binding: Option<ChainBinding>,
}

/// Validated framework-service identity.
#[derive(Debug, Clone)]
pub struct FrameworkDescriptor {
    cfg: FrameworkConfig,
}

impl FrameworkDescriptor {
    /// Validate `cfg` into a descriptor.
    ///
    /// # Errors
    /// [`StackError::InvalidDescriptor`] on inconsistent fields or a
    /// non-framework kind.
    pub fn new(cfg: FrameworkConfig) -> Result<Self, StackError> {
        if !matches!(
            cfg.kind,
            ServiceKind::CoreApi
                | ServiceKind::Worker
                | ServiceKind::MarketApi
                | ServiceKind::MarketWatcher
        ) {
            return Err(StackError::InvalidDescriptor(format!(
                "{} is not a framework service kind",
                cfg.kind
            )));
        }
        if cfg.entry_point.is_empty() || cfg.entry_point.chars().any(char::is_whitespace) {
            return Err(StackError::InvalidDescriptor(format!(
                "entry point {:?} is not usable as a discovery anchor",
                cfg.entry_point
            )));
        }
        if cfg.host.is_empty() || cfg.host.chars().any(char::is_whitespace) {
            return Err(StackError::InvalidDescriptor(format!(
                "framework host {:?} is not a valid host name",
                cfg.host
            )));
        }
        if cfg.port == 0 {
            return Err(StackError::InvalidDescriptor(
                "framework port must be non-zero".to_owned(),
            ));
        }
        if cfg.success_markers.is_empty() {
            return Err(StackError::InvalidDescriptor(
                "framework services need at least one readiness log marker".to_owned(),
            ));
        }
        Ok(Self { cfg })
    }

    #[must_use]
    pub fn cfg(&self) -> &FrameworkConfig {
        &self.cfg
    }

    #[must_use]
    pub fn kind(&self) -> ServiceKind {
        self.cfg.kind
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.cfg.service_name
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.cfg.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.cfg.port
    }

    #[must_use]
    pub fn binding(&self) -> Option<&ChainBinding> {
        self.cfg.binding.as_ref()
    }

    /// Launch arguments: runtime args first, the entry point always last.
    #[must_use]
    pub fn launch_args(&self) -> Vec<String> {
        let mut args = self.cfg.runtime_args.clone();
        args.push(self.cfg.entry_point.clone());
        args
    }

    /// Identity environment, including a freshly computed config hash.
    ///
    /// This is the serialization half of the discovery round trip; it and
    /// [`parse_environ`] must stay exact inverses.
    ///
    /// # Errors
    /// Fails when the config file cannot be hashed.
    pub fn launch_env(&self) -> Result<BTreeMap<String, String>, StackError> {
        let mut env = self.cfg.extra_env.clone();
        env.insert(HOST_ENV.to_owned(), self.cfg.host.clone());
        env.insert(PORT_ENV.to_owned(), self.cfg.port.to_string());
        env.insert(
            CONFIG_FILE_ENV.to_owned(),
            self.cfg.config_file.to_string_lossy().into_owned(),
        );
        env.insert(CONFIG_HASH_ENV.to_owned(), config_hash(&self.cfg.config_file)?);
        env.insert(
            HOME_ENV.to_owned(),
            self.cfg.home_dir.to_string_lossy().into_owned(),
        );
        if let Some(binding) = &self.cfg.binding {
            env.insert(CHAIN_ID_ENV.to_owned(), binding.chain_id.to_string());
            if let Some(contract) = &binding.contract {
                env.insert(CONTRACT_ENV.to_owned(), contract.clone());
            }
            if let Some(store_id) = &binding.store_id {
                env.insert(STORE_ID_ENV.to_owned(), store_id.clone());
            }
        }
        Ok(env)
    }

    /// Discovery pattern: the entry-point anchor on the command line plus
    /// the constant config-hash marker in the environment.
    #[must_use]
    pub fn discovery_pattern(&self) -> ProcessPattern {
        ProcessPattern::markers([self.cfg.entry_point.clone()])
            .env_marker(format!("{CONFIG_HASH_ENV}="))
    }
}

/// Identity fields reconstructed from a live process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameworkEnv {
    pub host: String,
    pub port: u16,
    pub config_file: PathBuf,
    pub config_hash: String,
    pub chain_id: Option<u64>,
    pub contract: Option<String>,
    pub store_id: Option<String>,
}

/// Parse the identity environment of a matched process.
///
/// # Errors
/// A human-readable rejection reason; the caller treats it as "not ours".
pub fn parse_environ(record: &ProcessRecord) -> Result<FrameworkEnv, String> {
    let required = |key: &str| {
        record
            .env_value(key)
            .map(str::to_owned)
            .ok_or_else(|| format!("environment is missing {key}"))
    };

    let port = required(PORT_ENV)?
        .parse::<u16>()
        .map_err(|_| format!("{PORT_ENV} is not a port"))?;
    let chain_id = match record.env_value(CHAIN_ID_ENV) {
        Some(raw) => Some(
            raw.parse::<u64>()
                .map_err(|_| format!("{CHAIN_ID_ENV} is not an integer"))?,
        ),
        None => None,
    };

    Ok(FrameworkEnv {
        host: required(HOST_ENV)?,
        port,
        config_file: PathBuf::from(required(CONFIG_FILE_ENV)?),
        config_hash: required(CONFIG_HASH_ENV)?,
        chain_id,
        contract: record.env_value(CONTRACT_ENV).map(str::to_owned),
        store_id: record.env_value(STORE_ID_ENV).map(str::to_owned),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(tmp: &Path) -> FrameworkConfig {
        FrameworkConfig {
            kind: ServiceKind::CoreApi,
            service_name: "core-api".to_owned(),
            entry_point: "com.acme.core.Application".to_owned(),
            host: "127.0.0.1".to_owned(),
            port: 13000,
            program: PathBuf::from("/usr/bin/java"),
            runtime_args: vec!["-cp".to_owned(), "/opt/core/lib/*".to_owned()],
            config_file: tmp.join("core.yml"),
            home_dir: tmp.to_path_buf(),
            log_file: tmp.join("core.log"),
            pid_file: tmp.join("core.pid"),
            success_markers: vec!["Started Application".to_owned()],
            failure_markers: vec!["ERROR".to_owned()],
            exclude_markers: vec![],
            extra_env: BTreeMap::new(),
            binding: None,
        }
    }

    #[test]
    fn env_serialization_and_parse_are_inverses() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("core.yml"), "profile: dev\n").unwrap();

        let mut cfg = config(tmp.path());
        cfg.binding = Some(ChainBinding {
            chain_id: 1337,
            contract: Some("0xabc".to_owned()),
            store_id: Some("deadbeef".to_owned()),
        });
        let desc = FrameworkDescriptor::new(cfg).unwrap();

        let env = desc.launch_env().unwrap();
        let record = ProcessRecord {
            pid: 1,
            command: "java -cp /opt/core/lib/* com.acme.core.Application".to_owned(),
            environ: env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            cwd: None,
        };

        let parsed = parse_environ(&record).unwrap();
        assert_eq!(parsed.host, desc.host());
        assert_eq!(parsed.port, desc.port());
        assert_eq!(parsed.config_file, desc.cfg().config_file);
        assert_eq!(
            parsed.config_hash,
            config_hash(&desc.cfg().config_file).unwrap()
        );
        assert_eq!(parsed.chain_id, Some(1337));
        assert_eq!(parsed.contract.as_deref(), Some("0xabc"));
        assert_eq!(parsed.store_id.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn entry_point_is_always_last_launch_arg() {
        let tmp = tempfile::tempdir().unwrap();
        let desc = FrameworkDescriptor::new(config(tmp.path())).unwrap();
        assert_eq!(
            desc.launch_args().last().map(String::as_str),
            Some("com.acme.core.Application")
        );
    }

    #[test]
    fn non_framework_kinds_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(tmp.path());
        cfg.kind = ServiceKind::Simulator;
        assert!(FrameworkDescriptor::new(cfg).is_err());
    }

    #[test]
    fn config_hash_tracks_file_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("core.yml");

        std::fs::write(&file, "a: 1\n").unwrap();
        let first = config_hash(&file).unwrap();
        std::fs::write(&file, "a: 2\n").unwrap();
        let second = config_hash(&file).unwrap();

        assert_ne!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn missing_identity_env_is_rejected() {
        let record = ProcessRecord {
            pid: 1,
            command: "java com.acme.core.Application".to_owned(),
            environ: vec![format!("{HOST_ENV}=127.0.0.1")],
            cwd: None,
        };
        assert!(parse_environ(&record).is_err());
    }
}
