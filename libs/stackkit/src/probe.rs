//! Process-table discovery.
//!
//! A probe takes one snapshot of the OS process table and matches command
//! lines and environments against patterns of ANDed markers. False negatives
//! are expected (unmanaged processes); false positives are mitigated by
//! requiring several independent markers (host, port, store id, config path)
//! in one pattern rather than one loose substring.

use std::path::PathBuf;

use regex::Regex;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::trace;

/// One process observed in the snapshot.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: u32,
    /// Full command line, arguments joined with single spaces.
    pub command: String,
    /// Environment as `KEY=VALUE` strings, where available.
    pub environ: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl ProcessRecord {
    /// Value of `key` in the recorded environment, if present.
    #[must_use]
    pub fn env_value(&self, key: &str) -> Option<&str> {
        let prefix_len = key.len();
        self.environ
            .iter()
            .find(|kv| kv.starts_with(key) && kv.as_bytes().get(prefix_len) == Some(&b'='))
            .map(|kv| &kv[prefix_len + 1..])
    }
}

/// ANDed match over one process record.
///
/// Every command-line marker must be a substring of the command line, every
/// environment marker a substring of at least one `KEY=VALUE` entry, and the
/// optional regex must match the command line.
#[derive(Debug, Default, Clone)]
pub struct ProcessPattern {
    markers: Vec<String>,
    env_markers: Vec<String>,
    regex: Option<Regex>,
}

impl ProcessPattern {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pattern from a set of command-line markers.
    pub fn markers<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn marker(mut self, marker: impl Into<String>) -> Self {
        self.markers.push(marker.into());
        self
    }

    #[must_use]
    pub fn env_marker(mut self, marker: impl Into<String>) -> Self {
        self.env_markers.push(marker.into());
        self
    }

    #[must_use]
    pub fn regex(mut self, regex: Regex) -> Self {
        self.regex = Some(regex);
        self
    }

    #[must_use]
    pub fn matches(&self, record: &ProcessRecord) -> bool {
        if !self.markers.iter().all(|m| record.command.contains(m)) {
            return false;
        }
        if !self
            .env_markers
            .iter()
            .all(|m| record.environ.iter().any(|kv| kv.contains(m)))
        {
            return false;
        }
        self.regex
            .as_ref()
            .is_none_or(|re| re.is_match(&record.command))
    }
}

/// One snapshot of the live process table.
///
/// The snapshot excludes the probing process itself: the supervisor's own
/// command line routinely carries the very markers it searches for.
#[derive(Debug)]
pub struct ProcessProbe {
    records: Vec<ProcessRecord>,
}

impl ProcessProbe {
    /// Take a fresh snapshot of the process table.
    #[must_use]
    pub fn snapshot() -> Self {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing()
                .with_cmd(UpdateKind::Always)
                .with_environ(UpdateKind::Always)
                .with_cwd(UpdateKind::Always),
        );

        let own_pid = std::process::id();
        let records = system
            .processes()
            .iter()
            .filter(|(pid, _)| pid.as_u32() != own_pid)
            .map(|(pid, process)| ProcessRecord {
                pid: pid.as_u32(),
                command: join_os_strings(process.cmd()),
                environ: process
                    .environ()
                    .iter()
                    .map(|kv| kv.to_string_lossy().into_owned())
                    .collect(),
                cwd: process.cwd().map(std::path::Path::to_path_buf),
            })
            .collect();

        Self { records }
    }

    /// Build a probe over a fixed record set. Intended for tests and for
    /// re-correlating already-captured snapshots.
    #[must_use]
    pub fn from_records(records: Vec<ProcessRecord>) -> Self {
        Self { records }
    }

    /// All records matching `pattern`.
    #[must_use]
    pub fn matching(&self, pattern: &ProcessPattern) -> Vec<&ProcessRecord> {
        let matched: Vec<&ProcessRecord> = self
            .records
            .iter()
            .filter(|r| pattern.matches(r))
            .collect();
        trace!(matches = matched.len(), ?pattern, "probe pattern evaluated");
        matched
    }

    /// Whether a process with `pid` is alive in this snapshot.
    #[must_use]
    pub fn contains_pid(&self, pid: u32) -> bool {
        self.records.iter().any(|r| r.pid == pid)
    }

    #[must_use]
    pub fn record(&self, pid: u32) -> Option<&ProcessRecord> {
        self.records.iter().find(|r| r.pid == pid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn join_os_strings(parts: &[std::ffi::OsString]) -> String {
    parts
        .iter()
        .map(|p| p.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}
