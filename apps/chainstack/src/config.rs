//! Layered application configuration.
//!
//! Merge order: built-in defaults → YAML file (if provided) → `CS__*`
//! environment variables → CLI overrides. `server.home_dir` is normalized
//! (tilde-expanded, created) after the merge; every optional path in the
//! service sections defaults to a location under it.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};

/// CLI arguments that flow into the config merge.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config: Option<String>,
    pub print_config: bool,
    pub verbose: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub home_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            home_dir: "~/.chainstack".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorSection {
    pub chain_id: u64,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub block_time: Option<u64>,
    pub program: PathBuf,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentStoreSection {
    #[serde(default = "default_host")]
    pub host: String,
    pub api_port: u16,
    pub gateway_port: u16,
    pub program: PathBuf,
    #[serde(default)]
    pub repo_dir: Option<PathBuf>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    pub program: PathBuf,
    #[serde(default)]
    pub store_root: Option<PathBuf>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSection {
    pub service_name: String,
    pub entry_point: String,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    pub program: PathBuf,
    #[serde(default)]
    pub runtime_args: Vec<String>,
    pub config_file: PathBuf,
    #[serde(default)]
    pub home_dir: Option<PathBuf>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    #[serde(default = "default_success_markers")]
    pub success_markers: Vec<String>,
    #[serde(default = "default_failure_markers")]
    pub failure_markers: Vec<String>,
    #[serde(default)]
    pub exclude_markers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherSection {
    pub chain_id: u64,
    pub deployment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSection {
    pub name: String,
    pub doc_store: StoreSection,
    pub kv_store: StoreSection,
    #[serde(default)]
    pub api: Option<BackendSection>,
    #[serde(default)]
    pub api_chains: Vec<u64>,
    #[serde(default)]
    pub watcher: Option<BackendSection>,
    #[serde(default)]
    pub watchers: Vec<WatcherSection>,
    #[serde(default)]
    pub mirror_api_chains: bool,
    #[serde(default = "default_deployment")]
    pub deployment: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub simulators: Vec<SimulatorSection>,
    #[serde(default)]
    pub content_store: Option<ContentStoreSection>,
    #[serde(default)]
    pub market: Option<MarketSection>,
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_deployment() -> String {
    "main".to_owned()
}

fn default_success_markers() -> Vec<String> {
    vec!["Started".to_owned()]
}

fn default_failure_markers() -> Vec<String> {
    vec!["ERROR".to_owned(), "Exception".to_owned()]
}

impl AppConfig {
    /// Load the layered configuration.
    ///
    /// # Errors
    /// Fails on unreadable/invalid YAML, malformed environment overrides or
    /// an unusable home directory.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed("CS__").split("__"));

        let mut config: Self = figment
            .extract()
            .context("failed to assemble configuration")?;
        config.normalize_home()?;
        Ok(config)
    }

    /// Apply CLI overrides on top of the merged configuration.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        match args.verbose {
            0 => {}
            1 => self.logging.level = "debug".to_owned(),
            _ => self.logging.level = "trace".to_owned(),
        }
    }

    /// Absolute, existing home directory.
    #[must_use]
    pub fn home_dir(&self) -> PathBuf {
        PathBuf::from(&self.server.home_dir)
    }

    /// Render the effective configuration for `--print-config`.
    ///
    /// # Errors
    /// Serialization failures only.
    pub fn render(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn normalize_home(&mut self) -> Result<()> {
        let expanded = expand_tilde(&self.server.home_dir)?;
        std::fs::create_dir_all(&expanded)
            .with_context(|| format!("cannot create home dir {}", expanded.display()))?;
        self.server.home_dir = expanded.to_string_lossy().into_owned();
        Ok(())
    }
}

/// Expand a `~` prefix to the user home directory; other paths pass through.
fn expand_tilde(raw: &str) -> Result<PathBuf> {
    if raw == "~" {
        return env::home_dir().context("HOME is not set");
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        let home = env::home_dir().context("HOME is not set")?;
        return Ok(home.join(rest));
    }
    Ok(PathBuf::from(raw))
}
