//! Simulator descriptors and their command-line round trip.
//!
//! Launch-argument construction is deterministic and order-fixed (chain id
//! and host flags at fixed positions, the data path always last) so that a
//! fixed-anchor discovery pattern matches reliably. The reverse direction,
//! [`parse_command`], parses every recognized flag of a matched command line
//! back into a structured value; the two functions must stay exact inverses.

use std::path::{Path, PathBuf};

use stackkit::error::StackError;
use stackkit::probe::ProcessPattern;

/// Raw configuration for one simulator instance.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub chain_id: u64,
    pub host: String,
    pub port: u16,
    /// Seconds between mined blocks; instant mining when absent.
    pub block_time: Option<u64>,
    pub program: PathBuf,
    /// Signed-directory root holding the chain data.
    pub store_root: PathBuf,
    pub log_file: PathBuf,
    pub pid_file: PathBuf,
}

/// Validated, immutable simulator identity. Built only through
/// [`SimulatorDescriptor::new`]; no unvalidated descriptor can exist.
#[derive(Debug, Clone)]
pub struct SimulatorDescriptor {
    cfg: SimulatorConfig,
}

impl SimulatorDescriptor {
    /// Validate `cfg` into a descriptor.
    ///
    /// # Errors
    /// [`StackError::InvalidDescriptor`] when any discovery-relevant field is
    /// inconsistent.
    pub fn new(cfg: SimulatorConfig) -> Result<Self, StackError> {
        if cfg.chain_id == 0 {
            return Err(StackError::InvalidDescriptor(
                "simulator chain id must be non-zero".to_owned(),
            ));
        }
        if cfg.host.is_empty() || cfg.host.chars().any(char::is_whitespace) {
            return Err(StackError::InvalidDescriptor(format!(
                "simulator host {:?} is not a valid host name",
                cfg.host
            )));
        }
        if cfg.port == 0 {
            return Err(StackError::InvalidDescriptor(
                "simulator port must be non-zero".to_owned(),
            ));
        }
        if !cfg.store_root.is_absolute() {
            return Err(StackError::InvalidDescriptor(format!(
                "simulator store root {} must be absolute",
                cfg.store_root.display()
            )));
        }
        Ok(Self { cfg })
    }

    #[must_use]
    pub fn chain_id(&self) -> u64 {
        self.cfg.chain_id
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
    pub fn block_time(&self) -> Option<u64> {
        self.cfg.block_time
    }

    #[must_use]
    pub fn program(&self) -> &Path {
        &self.cfg.program
    }

    #[must_use]
    pub fn store_root(&self) -> &Path {
        &self.cfg.store_root
    }

    #[must_use]
    pub fn log_file(&self) -> &Path {
        &self.cfg.log_file
    }

    #[must_use]
    pub fn pid_file(&self) -> &Path {
        &self.cfg.pid_file
    }

    /// JSON-RPC endpoint of this instance.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.cfg.host, self.cfg.port)
    }

    /// Fixed-order launch arguments; `data_dir` is always the last token.
    #[must_use]
    pub fn launch_args(&self, data_dir: &Path) -> Vec<String> {
        let mut args = vec![
            "--chain-id".to_owned(),
            self.cfg.chain_id.to_string(),
            "--host".to_owned(),
            self.cfg.host.clone(),
            "--port".to_owned(),
            self.cfg.port.to_string(),
        ];
        if let Some(block_time) = self.cfg.block_time {
            args.push("--block-time".to_owned());
            args.push(block_time.to_string());
        }
        args.push(data_dir.to_string_lossy().into_owned());
        args
    }

    /// Identity-anchored discovery pattern for this instance.
    #[must_use]
    pub fn identity_pattern(&self) -> ProcessPattern {
        ProcessPattern::markers([
            format!("--chain-id {}", self.cfg.chain_id),
            format!("--host {}", self.cfg.host),
            format!("--port {}", self.cfg.port),
        ])
    }
}

/// Base pattern matching any simulator instance, used when enumerating the
/// running set.
#[must_use]
pub fn any_simulator_pattern() -> ProcessPattern {
    ProcessPattern::markers(["--chain-id ", "--host ", "--port "])
}

/// Discovery-relevant fields reconstructed from a live command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorCmdline {
    pub chain_id: u64,
    pub host: String,
    pub port: u16,
    pub block_time: Option<u64>,
    pub data_dir: PathBuf,
}

/// Parse a matched command line back into its structured options.
///
/// Quoted or escaped token layouts are rejected outright rather than guessed
/// at; the caller treats the rejection as "not ours".
///
/// # Errors
/// A human-readable rejection reason.
pub fn parse_command(command: &str) -> Result<SimulatorCmdline, String> {
    if command.contains('\'') || command.contains('"') || command.contains('\\') {
        return Err("quoted or escaped command lines are not parsed".to_owned());
    }

    let tokens: Vec<&str> = command.split_whitespace().collect();
    let anchor = tokens
        .iter()
        .position(|t| *t == "--chain-id")
        .ok_or_else(|| "missing --chain-id anchor".to_owned())?;

    let mut chain_id = None;
    let mut host = None;
    let mut port = None;
    let mut block_time = None;
    let mut data_dir = None;

    let mut i = anchor;
    while i < tokens.len() {
        let token = tokens[i];
        match token {
            "--chain-id" | "--host" | "--port" | "--block-time" => {
                let value = tokens
                    .get(i + 1)
                    .ok_or_else(|| format!("flag {token} has no value"))?;
                match token {
                    "--chain-id" => {
                        chain_id =
                            Some(value.parse::<u64>().map_err(|_| {
                                format!("chain id {value:?} is not an integer")
                            })?);
                    }
                    "--host" => host = Some((*value).to_owned()),
                    "--port" => {
                        port = Some(
                            value
                                .parse::<u16>()
                                .map_err(|_| format!("port {value:?} is not a port"))?,
                        );
                    }
                    _ => {
                        block_time =
                            Some(value.parse::<u64>().map_err(|_| {
                                format!("block time {value:?} is not an integer")
                            })?);
                    }
                }
                i += 2;
            }
            _ if token.starts_with("--") => {
                return Err(format!("unrecognized flag {token}"));
            }
            _ => {
                // The first positional token is the data path and must be the
                // final token.
                if i + 1 != tokens.len() {
                    return Err(format!("unexpected tokens after data path {token:?}"));
                }
                data_dir = Some(PathBuf::from(token));
                i += 1;
            }
        }
    }

    Ok(SimulatorCmdline {
        chain_id: chain_id.ok_or_else(|| "missing --chain-id".to_owned())?,
        host: host.ok_or_else(|| "missing --host".to_owned())?,
        port: port.ok_or_else(|| "missing --port".to_owned())?,
        block_time,
        data_dir: data_dir.ok_or_else(|| "missing data path".to_owned())?,
    })
}
