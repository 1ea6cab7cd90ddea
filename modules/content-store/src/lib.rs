//! Content-store daemon service.
//!
//! The second standalone exemplar next to the chain simulator: a repo-rooted
//! daemon with fixed-order launch arguments and an HTTP API probe for
//! readiness.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use stackkit::contracts::{Service, ServiceKind, StartOptions, StopOptions};
use stackkit::error::StackError;
use stackkit::http::HttpClient;
use stackkit::launcher::{LaunchPlan, stop_pid_with_grace};
use stackkit::probe::{ProcessPattern, ProcessProbe};
use stackkit::readiness::{Readiness, RetryPolicy, wait_until};

/// Readiness budget: the daemon builds its repo index before answering.
pub const READY_POLICY: RetryPolicy =
    RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(1), 45);

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Raw configuration for one content-store daemon.
#[derive(Debug, Clone)]
pub struct ContentStoreConfig {
    pub host: String,
    pub api_port: u16,
    pub gateway_port: u16,
    pub program: PathBuf,
    pub repo_dir: PathBuf,
    pub log_file: PathBuf,
    pub pid_file: PathBuf,
}

/// Validated content-store identity.
#[derive(Debug, Clone)]
pub struct ContentStoreDescriptor {
    cfg: ContentStoreConfig,
}

impl ContentStoreDescriptor {
    /// Validate `cfg` into a descriptor.
    ///
    /// # Errors
    /// [`StackError::InvalidDescriptor`] on inconsistent fields.
    pub fn new(cfg: ContentStoreConfig) -> Result<Self, StackError> {
        if cfg.host.is_empty() || cfg.host.chars().any(char::is_whitespace) {
            return Err(StackError::InvalidDescriptor(format!(
                "content store host {:?} is not a valid host name",
                cfg.host
            )));
        }
        if cfg.api_port == 0 || cfg.gateway_port == 0 || cfg.api_port == cfg.gateway_port {
            return Err(StackError::InvalidDescriptor(
                "content store api and gateway ports must be distinct and non-zero".to_owned(),
            ));
        }
        if !cfg.repo_dir.is_absolute() {
            return Err(StackError::InvalidDescriptor(format!(
                "content store repo {} must be absolute",
                cfg.repo_dir.display()
            )));
        }
        Ok(Self { cfg })
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.cfg.host
    }

    #[must_use]
    pub fn api_port(&self) -> u16 {
        self.cfg.api_port
    }

    #[must_use]
    pub fn gateway_port(&self) -> u16 {
        self.cfg.gateway_port
    }

    #[must_use]
    pub fn repo_dir(&self) -> &Path {
        &self.cfg.repo_dir
    }

    /// Fixed-order launch arguments; the repo path is always the last token.
    #[must_use]
    pub fn launch_args(&self) -> Vec<String> {
        vec![
            "daemon".to_owned(),
            "--api-host".to_owned(),
            self.cfg.host.clone(),
            "--api-port".to_owned(),
            self.cfg.api_port.to_string(),
            "--gateway-port".to_owned(),
            self.cfg.gateway_port.to_string(),
            self.cfg.repo_dir.to_string_lossy().into_owned(),
        ]
    }

    #[must_use]
    pub fn identity_pattern(&self) -> ProcessPattern {
        ProcessPattern::markers([
            "daemon".to_owned(),
            format!("--api-host {}", self.cfg.host),
            format!("--api-port {}", self.cfg.api_port),
            self.cfg.repo_dir.to_string_lossy().into_owned(),
        ])
    }

    /// API endpoint used by the readiness probe.
    #[must_use]
    pub fn version_endpoint(&self) -> String {
        format!(
            "http://{}:{}/api/v0/version",
            self.cfg.host, self.cfg.api_port
        )
    }
}

/// Discovery-relevant fields reconstructed from a live command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentStoreCmdline {
    pub host: String,
    pub api_port: u16,
    pub gateway_port: u16,
    pub repo_dir: PathBuf,
}

/// Inverse of [`ContentStoreDescriptor::launch_args`]; quoted layouts are
/// rejected.
///
/// # Errors
/// A human-readable rejection reason.
pub fn parse_command(command: &str) -> Result<ContentStoreCmdline, String> {
    if command.contains('\'') || command.contains('"') || command.contains('\\') {
        return Err("quoted or escaped command lines are not parsed".to_owned());
    }

    let tokens: Vec<&str> = command.split_whitespace().collect();
    let anchor = tokens
        .iter()
        .position(|t| *t == "daemon")
        .ok_or_else(|| "missing daemon subcommand".to_owned())?;

    let mut host = None;
    let mut api_port = None;
    let mut gateway_port = None;
    let mut repo_dir = None;

    let mut i = anchor + 1;
    while i < tokens.len() {
        let token = tokens[i];
        match token {
            "--api-host" | "--api-port" | "--gateway-port" => {
                let value = tokens
                    .get(i + 1)
                    .ok_or_else(|| format!("flag {token} has no value"))?;
                match token {
                    "--api-host" => host = Some((*value).to_owned()),
                    "--api-port" => {
                        api_port = Some(
                            value
                                .parse::<u16>()
                                .map_err(|_| format!("api port {value:?} is not a port"))?,
                        );
                    }
                    _ => {
                        gateway_port = Some(
                            value
                                .parse::<u16>()
                                .map_err(|_| format!("gateway port {value:?} is not a port"))?,
                        );
                    }
                }
                i += 2;
            }
            _ if token.starts_with("--") => return Err(format!("unrecognized flag {token}")),
            _ => {
                if i + 1 != tokens.len() {
                    return Err(format!("unexpected tokens after repo path {token:?}"));
                }
                repo_dir = Some(PathBuf::from(token));
                i += 1;
            }
        }
    }

    Ok(ContentStoreCmdline {
        host: host.ok_or_else(|| "missing --api-host".to_owned())?,
        api_port: api_port.ok_or_else(|| "missing --api-port".to_owned())?,
        gateway_port: gateway_port.ok_or_else(|| "missing --gateway-port".to_owned())?,
        repo_dir: repo_dir.ok_or_else(|| "missing repo path".to_owned())?,
    })
}

/// One manageable content-store daemon.
pub struct ContentStore {
    descriptor: ContentStoreDescriptor,
    http: HttpClient,
}

impl ContentStore {
    #[must_use]
    pub fn new(descriptor: ContentStoreDescriptor) -> Self {
        Self {
            descriptor,
            http: HttpClient::new(),
        }
    }

    #[must_use]
    pub fn descriptor(&self) -> &ContentStoreDescriptor {
        &self.descriptor
    }

    /// Create the repo directory when missing.
    ///
    /// # Errors
    /// Propagates directory-creation failures.
    pub fn ensure_repo(&self) -> Result<(), StackError> {
        std::fs::create_dir_all(self.descriptor.repo_dir())?;
        Ok(())
    }

    fn is_ours(&self, parsed: &ContentStoreCmdline) -> bool {
        parsed.host == self.descriptor.host()
            && parsed.api_port == self.descriptor.api_port()
            && parsed.gateway_port == self.descriptor.gateway_port()
            && parsed.repo_dir == self.descriptor.repo_dir()
    }
}

#[async_trait]
impl Service for ContentStore {
    fn kind(&self) -> ServiceKind {
        ServiceKind::ContentStore
    }

    fn label(&self) -> String {
        format!(
            "content-store@{}:{}",
            self.descriptor.host(),
            self.descriptor.api_port()
        )
    }

    fn can_start(&self) -> bool {
        self.descriptor.cfg.program.is_file() && self.descriptor.repo_dir().is_dir()
    }

    #[instrument(skip_all, fields(service = %self.label()))]
    async fn start(&self, opts: &StartOptions) -> Result<(), StackError> {
        if let Some(pid) = self.pid().await? {
            return Err(StackError::AlreadyBusy {
                service: self.label(),
                pid,
            });
        }

        let plan = LaunchPlan {
            service: format!("content-store-{}", self.descriptor.api_port()),
            program: self.descriptor.cfg.program.clone(),
            args: self.descriptor.launch_args(),
            env: BTreeMap::new(),
            working_dir: self.descriptor.repo_dir().to_path_buf(),
            log_file: Some(self.descriptor.cfg.log_file.clone()),
            pid_file: self.descriptor.cfg.pid_file.clone(),
        };
        let pid = plan.spawn_detached().await?;
        info!(pid, "content store spawned");

        if !opts.wait_ready {
            return Ok(());
        }

        let policy = opts.retry.unwrap_or(READY_POLICY);
        let endpoint = self.descriptor.version_endpoint();
        let http = self.http.clone();
        wait_until(&self.label(), &policy, &opts.cancel, move || {
            let http = http.clone();
            let endpoint = endpoint.clone();
            async move {
                match http.get(&endpoint).await {
                    Ok((200, _)) => Readiness::Ready,
                    Ok(_) | Err(_) => Readiness::Pending,
                }
            }
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
                info!(pid, "content store stopped");
            }
            None => debug!("nothing to stop"),
        }

        match tokio::fs::remove_file(&self.descriptor.cfg.pid_file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if opts.reset && self.descriptor.repo_dir().exists() {
            info!(repo = %self.descriptor.repo_dir().display(), "resetting content repo");
            tokio::fs::remove_dir_all(self.descriptor.repo_dir()).await?;
        }
        Ok(())
    }

    async fn pid(&self) -> Result<Option<u32>, StackError> {
        let probe = ProcessProbe::snapshot();

        let mut survivors = Vec::new();
        for record in probe.matching(&self.descriptor.identity_pattern()) {
            match parse_command(&record.command) {
                Ok(parsed) if self.is_ours(&parsed) => survivors.push(record.pid),
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
                "{} live content stores match {}: {:?}",
                many.len(),
                self.label(),
                many
            ))),
        }
    }

    async fn is_ready(&self) -> Result<bool, StackError> {
        match self.http.get(&self.descriptor.version_endpoint()).await {
            Ok((status, _)) => Ok(status == 200),
            Err(_) => Ok(false),
        }
    }
}
