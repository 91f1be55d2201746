//! The VPN daemon's control tool (`occtl`).

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{EdgeError, EdgeResult};
use crate::validation::{sanitize_error_message, validate_username};

/// One user line of `show users`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedUser {
    pub username: String,
    pub virtual_ip: String,
    pub remote_ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub active_users: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Operations against the running daemon.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DaemonControl: Send + Sync {
    /// Users the daemon currently reports as connected.
    ///
    /// Fails with [`EdgeError::DaemonUnavailable`] when the report cannot be
    /// obtained.
    async fn show_users(&self) -> EdgeResult<Vec<ReportedUser>>;

    /// Never fails; an unreachable daemon is reported as not running.
    async fn show_status(&self) -> DaemonStatus;

    async fn disconnect_user(&self, username: &str) -> EdgeResult<()>;
}

/// [`DaemonControl`] backed by the `occtl` binary.
#[derive(Debug, Clone)]
pub struct Occtl {
    binary: String,
}

impl Occtl {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> EdgeResult<String> {
        let cmd = format!("{} {}", self.binary, args.join(" "));
        debug!("Running {}", cmd);

        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| EdgeError::DaemonUnavailable(format!("failed to run {}: {}", cmd, e)))?;

        if !output.status.success() {
            return Err(EdgeError::CommandFailed {
                cmd,
                code: output.status.code(),
                stderr: sanitize_error_message(&String::from_utf8_lossy(&output.stderr)),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl DaemonControl for Occtl {
    async fn show_users(&self) -> EdgeResult<Vec<ReportedUser>> {
        let report = self.run(&["show", "users"]).await.map_err(|e| match e {
            EdgeError::DaemonUnavailable(_) => e,
            other => EdgeError::DaemonUnavailable(other.to_string()),
        })?;
        Ok(parse_user_report(&report))
    }

    async fn show_status(&self) -> DaemonStatus {
        match self.run(&["show", "status"]).await {
            Ok(report) => DaemonStatus {
                running: true,
                active_users: parse_active_users(&report),
                error: None,
            },
            Err(e) => DaemonStatus {
                running: false,
                active_users: None,
                error: Some(e.to_string()),
            },
        }
    }

    async fn disconnect_user(&self, username: &str) -> EdgeResult<()> {
        validate_username(username)?;
        self.run(&["disconnect", "user", username]).await?;
        info!("Daemon disconnected {}", username);
        Ok(())
    }
}

/// Header token the report uses in place of a username.
const HEADER_TOKEN: &str = "id";

/// Parse a `show users` report.
///
/// The first whitespace-separated field is the username, the third and fourth
/// the virtual and remote address. Lines with fewer than five fields and the
/// header line are skipped.
pub fn parse_user_report(report: &str) -> Vec<ReportedUser> {
    report
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 || fields[0] == HEADER_TOKEN {
                return None;
            }
            Some(ReportedUser {
                username: fields[0].to_string(),
                virtual_ip: fields[2].to_string(),
                remote_ip: fields[3].to_string(),
            })
        })
        .collect()
}

/// Extract the `Active users:` count from a `show status` report.
pub fn parse_active_users(report: &str) -> Option<u32> {
    report.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() == "Active users" {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}
