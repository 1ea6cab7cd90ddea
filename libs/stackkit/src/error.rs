use std::path::PathBuf;

/// Supervision failure taxonomy.
///
/// `NotFound` is the only recoverable variant: lenient callers map it to an
/// empty result via [`allow_absent`]. `SignatureConflict` is fatal and never
/// auto-resolved. `MalformedDiscovery` means a process matched a discovery
/// pattern but could not be parsed back into a descriptor; discovery treats
/// such processes as "not ours" and callers never crash on them.
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{service} is already running with pid {pid}")]
    AlreadyBusy { service: String, pid: u32 },

    #[error("process {pid} matched the {service} pattern but could not be parsed: {reason}")]
    MalformedDiscovery {
        service: String,
        pid: u32,
        reason: String,
    },

    #[error("{tool} exited with status {status}: {stderr}")]
    ExternalTool {
        tool: String,
        status: i32,
        stderr: String,
    },

    #[error("wait for {service} was cancelled")]
    Cancelled { service: String },

    #[error("{service} did not become ready within {attempts} probe attempts")]
    RetriesExhausted { service: String, attempts: u32 },

    #[error("startup of {service} failed: {reason}")]
    StartupFailed { service: String, reason: String },

    #[error("discovery invariant violated: {0}")]
    AmbiguousDiscovery(String),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("launch script for {service} is missing a pid file at {path}")]
    MissingPidFile { service: String, path: PathBuf },

    #[error("http request failed: {0}")]
    Http(String),

    #[error("{failed} of {total} group operations failed: {summary}")]
    Aggregate {
        failed: usize,
        total: usize,
        summary: String,
    },

    #[error(transparent)]
    Store(#[from] stackkit_store::StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StackError {
    /// Whether this error represents an absent resource rather than a fault.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Store(stackkit_store::StoreError::NotInstalled(_))
        )
    }
}

/// Lenient-mode adapter: maps absence to `Ok(None)`, keeps every other error.
///
/// # Errors
/// Propagates any error that is not an absence.
pub fn allow_absent<T>(res: Result<T, StackError>) -> Result<Option<T>, StackError> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_absent() => Ok(None),
        Err(e) => Err(e),
    }
}
