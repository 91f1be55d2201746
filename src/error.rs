//! Error types for edgevpn

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum EdgeError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Storage layer failure
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// No free, non-reserved address left in the group's pool
    #[error("IP pool exhausted for group {group}")]
    PoolExhausted { group: i64 },
    /// Group has no pool or the pool is not a usable IPv4 CIDR
    #[error("IP pool misconfigured: {0}")]
    PoolMisconfigured(String),
    /// Another writer took the address between scan and insert
    #[error("Lease conflict in group {group} for {address}")]
    LeaseConflict { group: i64, address: String },
    /// Bad credentials, unknown or disabled user, missing prior authentication
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    /// The control tool could not be queried
    #[error("Daemon unavailable: {0}")]
    DaemonUnavailable(String),
    /// Start requested while the daemon is already up
    #[error("Daemon already running")]
    AlreadyRunning,
    /// Stop requested while the daemon is down
    #[error("Daemon not running")]
    NotRunning,
    /// The daemon binary could not be spawned
    #[error("Failed to launch daemon: {0}")]
    SubprocessLaunchFailed(String),
    /// Command execution failed
    #[error("Command '{cmd}' failed{}: {stderr}", exit_suffix(.code))]
    CommandFailed { cmd: String, code: Option<i32>, stderr: String },
    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with code {}", code),
        None => String::new(),
    }
}

impl EdgeError {
    /// True for failures a caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            EdgeError::LeaseConflict { .. } | EdgeError::DaemonUnavailable(_) => true,
            EdgeError::Database(sqlx::Error::PoolTimedOut) => true,
            // SQLITE_BUSY / SQLITE_LOCKED, including their extended codes
            EdgeError::Database(sqlx::Error::Database(e)) => e
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map_or(false, |code| matches!(code & 0xff, 5 | 6)),
            _ => false,
        }
    }
}

pub type EdgeResult<T> = Result<T, EdgeError>;
