//! Detached process launching.
//!
//! A [`LaunchPlan`] is rendered to a POSIX shell script that exports the
//! environment, changes into the working directory, backgrounds the real
//! binary with its constructed argument list, redirects output to a log file
//! and records the spawned pid to a pid file. The supervisor itself exits
//! between invocations, so the pid file plus process-table discovery are the
//! only links back to the launched process.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::StackError;

/// Everything needed to launch one service process.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    /// Display name, used for the script file name and error reporting.
    pub service: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    /// stdout/stderr redirect target; `/dev/null` when absent.
    pub log_file: Option<PathBuf>,
    pub pid_file: PathBuf,
}

impl LaunchPlan {
    /// Render the generated launch script.
    #[must_use]
    pub fn render_script(&self) -> String {
        let mut script = String::from("#!/bin/sh\nset -eu\n");
        let _ = writeln!(script, "cd {}", sh_quote(&self.working_dir.to_string_lossy()));
        for (key, value) in &self.env {
            let _ = writeln!(script, "export {key}={}", sh_quote(value));
        }

        let log = self
            .log_file
            .as_ref()
            .map_or_else(|| "/dev/null".to_owned(), |p| p.to_string_lossy().into_owned());

        let mut cmd = sh_quote(&self.program.to_string_lossy());
        for arg in &self.args {
            let _ = write!(cmd, " {}", sh_quote(arg));
        }
        let _ = writeln!(script, "nohup {cmd} >> {} 2>&1 &", sh_quote(&log));
        let _ = writeln!(
            script,
            "echo $! > {}",
            sh_quote(&self.pid_file.to_string_lossy())
        );
        script
    }

    /// Write the script next to the pid file and run it, returning the pid it
    /// recorded.
    ///
    /// # Errors
    /// [`StackError::ExternalTool`] when the script exits non-zero (stderr is
    /// captured into the error), [`StackError::MissingPidFile`] when it exits
    /// cleanly without recording a pid.
    pub async fn spawn_detached(&self) -> Result<u32, StackError> {
        let script_dir = self
            .pid_file
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        tokio::fs::create_dir_all(&script_dir).await?;
        if let Some(log) = &self.log_file {
            if let Some(log_dir) = log.parent() {
                tokio::fs::create_dir_all(log_dir).await?;
            }
        }

        let script_path = script_dir.join(format!(".{}.launch.sh", self.service));
        tokio::fs::write(&script_path, self.render_script()).await?;
        set_executable(&script_path).await?;

        debug!(
            service = %self.service,
            script = %script_path.display(),
            "running launch script"
        );

        let output = Command::new("/bin/sh")
            .arg(&script_path)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(StackError::ExternalTool {
                tool: self.program.to_string_lossy().into_owned(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let pid = read_pid_file(&self.pid_file).await?.ok_or_else(|| {
            StackError::MissingPidFile {
                service: self.service.clone(),
                path: self.pid_file.clone(),
            }
        })?;

        info!(service = %self.service, pid, "spawned detached process");
        Ok(pid)
    }
}

/// Read a pid file, returning `None` when it is missing or unparsable.
///
/// # Errors
/// Propagates I/O errors other than absence.
pub async fn read_pid_file(path: &Path) -> Result<Option<u32>, StackError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(contents.trim().parse::<u32>().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Send a graceful termination signal to `pid`.
///
/// Returns `true` when the signal was delivered. On non-Unix platforms no
/// graceful termination is available and this returns `false`.
#[cfg(unix)]
#[must_use]
pub fn send_terminate_signal(pid: u32) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(pid_i32) = i32::try_from(pid) else {
        warn!(pid, "pid exceeds i32::MAX, cannot send SIGTERM");
        return false;
    };
    kill(Pid::from_raw(pid_i32), Signal::SIGTERM).is_ok()
}

#[cfg(not(unix))]
#[must_use]
pub fn send_terminate_signal(_pid: u32) -> bool {
    false
}

/// Force-kill `pid`. Returns `true` when the signal was delivered.
#[cfg(unix)]
#[must_use]
pub fn send_kill_signal(pid: u32) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(pid_i32), Signal::SIGKILL).is_ok()
}

#[cfg(not(unix))]
#[must_use]
pub fn send_kill_signal(_pid: u32) -> bool {
    false
}

/// Whether `pid` is still alive.
#[cfg(unix)]
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    i32::try_from(pid).is_ok_and(|p| kill(Pid::from_raw(p), None).is_ok())
}

#[cfg(not(unix))]
#[must_use]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

/// Stop `pid` with a grace period: SIGTERM first, SIGKILL when it survives.
///
/// Returns `true` when the process is gone afterwards.
pub async fn stop_pid_with_grace(pid: u32, grace: Duration) -> bool {
    if !pid_alive(pid) {
        return true;
    }

    let sent = send_terminate_signal(pid);
    if !sent {
        debug!(pid, "graceful termination not available, force killing");
    }

    let poll = Duration::from_millis(50);
    let deadline = tokio::time::Instant::now() + grace;
    while sent && tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            debug!(pid, "process exited gracefully");
            return true;
        }
        tokio::time::sleep(poll).await;
    }

    if pid_alive(pid) {
        warn!(pid, "grace period expired, force killing");
        let _ = send_kill_signal(pid);
        tokio::time::sleep(poll).await;
    }
    !pid_alive(pid)
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> Result<(), StackError> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o755);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> Result<(), StackError> {
    Ok(())
}

/// Quote one word for POSIX sh.
fn sh_quote(raw: &str) -> String {
    if !raw.is_empty()
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b':'))
    {
        return raw.to_owned();
    }
    format!("'{}'", raw.replace('\'', r"'\''"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn plan(tmp: &Path) -> LaunchPlan {
        LaunchPlan {
            service: "test-svc".to_owned(),
            program: PathBuf::from("/bin/sleep"),
            args: vec!["30".to_owned()],
            env: BTreeMap::from([("CS_MARKER".to_owned(), "x y".to_owned())]),
            working_dir: tmp.to_path_buf(),
            log_file: Some(tmp.join("svc.log")),
            pid_file: tmp.join("svc.pid"),
        }
    }

    #[test]
    fn script_shape() {
        let tmp = PathBuf::from("/tmp/work");
        let script = plan(&tmp).render_script();

        assert!(script.starts_with("#!/bin/sh\nset -eu\n"));
        assert!(script.contains("cd /tmp/work\n"));
        assert!(script.contains("export CS_MARKER='x y'\n"));
        assert!(script.contains("nohup /bin/sleep 30 >> /tmp/work/svc.log 2>&1 &\n"));
        assert!(script.contains("echo $! > /tmp/work/svc.pid\n"));
    }

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(sh_quote("plain/path-1.2:3"), "plain/path-1.2:3");
        assert_eq!(sh_quote("has space"), "'has space'");
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
        assert_eq!(sh_quote(""), "''");
    }

    #[tokio::test]
    async fn spawn_records_pid_and_signals_stop_it() {
        let tmp = tempfile::tempdir().unwrap();
        let plan = plan(tmp.path());

        let pid = plan.spawn_detached().await.unwrap();
        assert!(pid_alive(pid));
        assert_eq!(read_pid_file(&plan.pid_file).await.unwrap(), Some(pid));

        assert!(stop_pid_with_grace(pid, Duration::from_secs(2)).await);
        assert!(!pid_alive(pid));
    }

    #[tokio::test]
    async fn failing_program_surfaces_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let mut plan = plan(tmp.path());
        // A working directory that cannot exist makes the script itself fail.
        plan.working_dir = tmp.path().join("does/not/exist");

        let err = plan.spawn_detached().await.unwrap_err();
        assert!(matches!(err, StackError::ExternalTool { .. }));
    }

    #[tokio::test]
    async fn read_pid_file_absent_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(
            read_pid_file(&tmp.path().join("nope.pid")).await.unwrap(),
            None
        );
    }
}
