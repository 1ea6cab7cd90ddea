//! Store daemons.
//!
//! Document and key-value stores share one lifecycle: their data lives in
//! the payload subdirectory of a signed directory, so the store identifier
//! rides in the daemon's command line and doubles as the discovery
//! disambiguator. Callers pass a requested ledger signature through the
//! configuration; it is verified (or registered) every time the store
//! directory is loaded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use stackkit::contracts::{Service, ServiceKind, StartOptions, StopOptions};
use stackkit::error::StackError;
use stackkit::launcher::{LaunchPlan, stop_pid_with_grace};
use stackkit::probe::{ProcessPattern, ProcessProbe};
use stackkit::readiness::{LogWatch, RetryPolicy, wait_until};
use stackkit_store::{InstallOptions, LoadOptions, SignedDirectory, Signature};

/// Readiness budget shared by both store flavors.
pub const READY_POLICY: RetryPolicy =
    RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(1), 30);

const STOP_GRACE: Duration = Duration::from_secs(10);

/// The two database flavors of the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFlavor {
    Document,
    KeyValue,
}

impl StoreFlavor {
    #[must_use]
    pub const fn kind(self) -> ServiceKind {
        match self {
            Self::Document => ServiceKind::DocumentStore,
            Self::KeyValue => ServiceKind::KeyValueStore,
        }
    }

    /// Flag carrying the payload directory in the daemon's argument list.
    #[must_use]
    const fn data_flag(self) -> &'static str {
        match self {
            Self::Document => "--dbpath",
            Self::KeyValue => "--dir",
        }
    }

    /// Log line that marks the daemon as accepting connections.
    #[must_use]
    const fn ready_marker(self) -> &'static str {
        match self {
            Self::Document => "waiting for connections",
            Self::KeyValue => "Ready to accept connections",
        }
    }
}

/// Raw configuration for one store daemon.
#[derive(Debug, Clone)]
pub struct StoreDaemonConfig {
    pub flavor: StoreFlavor,
    /// Logical name, used for labels and launch-script naming.
    pub name: String,
    pub host: String,
    pub port: u16,
    pub program: PathBuf,
    /// Signed-directory root holding the database payload.
    pub store_root: PathBuf,
    pub log_file: PathBuf,
    pub pid_file: PathBuf,
    /// Ledger signature to verify or register on every load.
    pub signature: Option<(String, Signature)>,
}

/// Validated store-daemon identity.
#[derive(Debug, Clone)]
pub struct StoreDaemonDescriptor {
    cfg: StoreDaemonConfig,
}

impl StoreDaemonDescriptor {
    /// Validate `cfg` into a descriptor.
    ///
    /// # Errors
    /// [`StackError::InvalidDescriptor`] on inconsistent fields.
    pub fn new(cfg: StoreDaemonConfig) -> Result<Self, StackError> {
        if cfg.name.is_empty() || cfg.name.chars().any(char::is_whitespace) {
            return Err(StackError::InvalidDescriptor(format!(
                "store name {:?} is not usable",
                cfg.name
            )));
        }
        if cfg.host.is_empty() || cfg.host.chars().any(char::is_whitespace) {
            return Err(StackError::InvalidDescriptor(format!(
                "store host {:?} is not a valid host name",
                cfg.host
            )));
        }
        if cfg.port == 0 {
            return Err(StackError::InvalidDescriptor(
                "store port must be non-zero".to_owned(),
            ));
        }
        if !cfg.store_root.is_absolute() {
            return Err(StackError::InvalidDescriptor(format!(
                "store root {} must be absolute",
                cfg.store_root.display()
            )));
        }
        Ok(Self { cfg })
    }

    #[must_use]
    pub fn flavor(&self) -> StoreFlavor {
        self.cfg.flavor
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.cfg.name
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
    pub fn store_root(&self) -> &Path {
        &self.cfg.store_root
    }

    /// Fixed-order launch arguments around the payload directory.
    #[must_use]
    pub fn launch_args(&self, payload_dir: &Path) -> Vec<String> {
        vec![
            "--bind".to_owned(),
            self.cfg.host.clone(),
            "--port".to_owned(),
            self.cfg.port.to_string(),
            self.cfg.flavor.data_flag().to_owned(),
            payload_dir.to_string_lossy().into_owned(),
        ]
    }

    /// Identity pattern anchored on host, port and the store identifier
    /// embedded in the payload path.
    #[must_use]
    pub fn identity_pattern(&self, payload_dir: &Path) -> ProcessPattern {
        ProcessPattern::markers([
            format!("--bind {}", self.cfg.host),
            format!("--port {}", self.cfg.port),
            format!(
                "{} {}",
                self.cfg.flavor.data_flag(),
                payload_dir.to_string_lossy()
            ),
        ])
    }
}

/// Discovery-relevant fields reconstructed from a live command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDaemonCmdline {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
}

/// Inverse of [`StoreDaemonDescriptor::launch_args`] for the given flavor.
///
/// # Errors
/// A human-readable rejection reason.
pub fn parse_command(flavor: StoreFlavor, command: &str) -> Result<StoreDaemonCmdline, String> {
    if command.contains('\'') || command.contains('"') || command.contains('\\') {
        return Err("quoted or escaped command lines are not parsed".to_owned());
    }

    let tokens: Vec<&str> = command.split_whitespace().collect();
    let anchor = tokens
        .iter()
        .position(|t| *t == "--bind")
        .ok_or_else(|| "missing --bind anchor".to_owned())?;

    let mut host = None;
    let mut port = None;
    let mut data_dir = None;

    let mut i = anchor;
    while i < tokens.len() {
        let token = tokens[i];
        if token == "--bind" || token == "--port" || token == flavor.data_flag() {
            let value = tokens
                .get(i + 1)
                .ok_or_else(|| format!("flag {token} has no value"))?;
            if token == "--bind" {
                host = Some((*value).to_owned());
            } else if token == "--port" {
                port = Some(
                    value
                        .parse::<u16>()
                        .map_err(|_| format!("port {value:?} is not a port"))?,
                );
            } else {
                data_dir = Some(PathBuf::from(value));
            }
            i += 2;
        } else {
            return Err(format!("unrecognized token {token}"));
        }
    }

    Ok(StoreDaemonCmdline {
        host: host.ok_or_else(|| "missing --bind".to_owned())?,
        port: port.ok_or_else(|| "missing --port".to_owned())?,
        data_dir: data_dir.ok_or_else(|| format!("missing {}", flavor.data_flag()))?,
    })
}

/// One manageable store daemon.
#[derive(Debug)]
pub struct StoreDaemon {
    descriptor: StoreDaemonDescriptor,
}

impl StoreDaemon {
    #[must_use]
    pub fn new(descriptor: StoreDaemonDescriptor) -> Self {
        Self { descriptor }
    }

    /// Document-store daemon from raw configuration.
    ///
    /// # Errors
    /// See [`StoreDaemonDescriptor::new`].
    pub fn document(mut cfg: StoreDaemonConfig) -> Result<Self, StackError> {
        cfg.flavor = StoreFlavor::Document;
        Ok(Self::new(StoreDaemonDescriptor::new(cfg)?))
    }

    /// Key-value daemon from raw configuration.
    ///
    /// # Errors
    /// See [`StoreDaemonDescriptor::new`].
    pub fn key_value(mut cfg: StoreDaemonConfig) -> Result<Self, StackError> {
        cfg.flavor = StoreFlavor::KeyValue;
        Ok(Self::new(StoreDaemonDescriptor::new(cfg)?))
    }

    #[must_use]
    pub fn descriptor(&self) -> &StoreDaemonDescriptor {
        &self.descriptor
    }

    /// Install the signed store directory when missing.
    ///
    /// # Errors
    /// Propagates installation failures and signature conflicts.
    pub fn ensure_store(&self) -> Result<SignedDirectory, StackError> {
        if let Some(store) = self.load_store()? {
            return Ok(store);
        }
        Ok(SignedDirectory::install(
            self.kind().as_str(),
            self.descriptor.store_root(),
            InstallOptions {
                seed: self.descriptor.cfg.signature.clone(),
                ..InstallOptions::default()
            },
        )?)
    }

    /// Load the signed store directory, verifying or registering the
    /// configured signature.
    ///
    /// # Errors
    /// Propagates load failures; a signature conflict is fatal.
    pub fn load_store(&self) -> Result<Option<SignedDirectory>, StackError> {
        Ok(SignedDirectory::load(
            self.kind().as_str(),
            self.descriptor.store_root(),
            LoadOptions {
                signature: self.descriptor.cfg.signature.clone(),
                ..LoadOptions::default()
            },
        )?)
    }

    fn log_watch(&self) -> LogWatch {
        LogWatch::new(
            self.descriptor.cfg.log_file.clone(),
            vec![self.descriptor.flavor().ready_marker().to_owned()],
        )
    }
}

#[async_trait]
impl Service for StoreDaemon {
    fn kind(&self) -> ServiceKind {
        self.descriptor.flavor().kind()
    }

    fn label(&self) -> String {
        format!(
            "{}@{}:{}",
            self.descriptor.name(),
            self.descriptor.host(),
            self.descriptor.port()
        )
    }

    fn can_start(&self) -> bool {
        self.descriptor.cfg.program.is_file()
            && matches!(self.load_store(), Ok(Some(_)))
    }

    #[instrument(skip_all, fields(service = %self.label()))]
    async fn start(&self, opts: &StartOptions) -> Result<(), StackError> {
        if let Some(pid) = self.pid().await? {
            return Err(StackError::AlreadyBusy {
                service: self.label(),
                pid,
            });
        }

        let store = self.load_store()?.ok_or_else(|| {
            StackError::NotFound(format!("{} store directory", self.descriptor.name()))
        })?;

        let plan = LaunchPlan {
            service: self.descriptor.name().to_owned(),
            program: self.descriptor.cfg.program.clone(),
            args: self.descriptor.launch_args(&store.payload_dir()),
            env: BTreeMap::new(),
            working_dir: self.descriptor.store_root().to_path_buf(),
            log_file: Some(self.descriptor.cfg.log_file.clone()),
            pid_file: self.descriptor.cfg.pid_file.clone(),
        };
        let pid = plan.spawn_detached().await?;
        info!(pid, "store daemon spawned");

        if !opts.wait_ready {
            return Ok(());
        }

        let policy = opts.retry.unwrap_or(READY_POLICY);
        let watch = self.log_watch();
        wait_until(&self.label(), &policy, &opts.cancel, move || {
            let watch = watch.clone();
            async move { watch.scan().await }
        })
        .await
    }

    #[instrument(skip_all, fields(service = %self.label()))]
    async fn stop(&self, opts: &StopOptions) -> Result<(), StackError> {
        if !opts.ignore_cancel && opts.cancel.is_cancelled() {
            return Err(StackError::Cancelled {
                service: self.label(),
            });
        }

        match self.pid().await? {
            Some(pid) => {
                stop_pid_with_grace(pid, STOP_GRACE).await;
                info!(pid, "store daemon stopped");
            }
            None => debug!("nothing to stop"),
        }

        match tokio::fs::remove_file(&self.descriptor.cfg.pid_file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if opts.reset && self.descriptor.store_root().exists() {
            info!(store = %self.descriptor.store_root().display(), "resetting store directory");
            tokio::fs::remove_dir_all(self.descriptor.store_root()).await?;
        }
        Ok(())
    }

    async fn pid(&self) -> Result<Option<u32>, StackError> {
        // Without an installed store there is no identifier to match, hence
        // no process can be "ours".
        let Some(store) = self.load_store()? else {
            return Ok(None);
        };
        let payload_dir = store.payload_dir();
        let probe = ProcessProbe::snapshot();

        let mut survivors = Vec::new();
        for record in probe.matching(&self.descriptor.identity_pattern(&payload_dir)) {
            match parse_command(self.descriptor.flavor(), &record.command) {
                Ok(parsed)
                    if parsed.host == self.descriptor.host()
                        && parsed.port == self.descriptor.port()
                        && parsed.data_dir == payload_dir =>
                {
                    survivors.push(record.pid);
                }
                Ok(_) => {}
                Err(reason) => {
                    debug!(pid = record.pid, %reason, "discovery match did not parse");
                }
            }
        }

        match survivors.as_slice() {
            [] => Ok(None),
            [pid] => Ok(Some(*pid)),
            many => Err(StackError::AmbiguousDiscovery(format!(
                "{} live store daemons match {}: {:?}",
                many.len(),
                self.label(),
                many
            ))),
        }
    }

    async fn is_ready(&self) -> Result<bool, StackError> {
        Ok(self.log_watch().scan().await == stackkit::readiness::Readiness::Ready)
    }
}
