use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::daemon::DaemonStatus;
use crate::error::{EdgeError, EdgeResult};
use crate::session::{OpenedSession, Session, SessionManager};
use crate::store::{AuditAction, NewAuditRecord, Store};
use crate::validation::validate_username;

/// How long a successful authentication may wait for its connect.
pub const DEFAULT_AUTH_TTL: Duration = Duration::from_secs(240);

/// Well-formed bcrypt hash used to keep unknown-user checks as slow as real ones.
const DUMMY_HASH: &str = "$2a$10$N9qo8uLOickgx2ZMRZoMyeIjZAgcfl7p92ldGxad68LJZdL17lhWy";

const STATUS_OK: &str = "ok";
const STATUS_IGNORED: &str = "ignored";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthReply {
    pub status: &'static str,
}

/// Per-session configuration returned on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectReply {
    pub status: &'static str,
    pub address: String,
    pub netmask: String,
    pub dns: Vec<String>,
    pub mtu: u32,
}

/// Daemon health plus the sessions this process tracks.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub daemon: DaemonStatus,
    pub sessions: Vec<Session>,
}

/// Callbacks the VPN daemon makes while a client authenticates and connects.
pub struct AuthCallbackHandler {
    store: Store,
    sessions: Arc<SessionManager>,
    dns: Vec<String>,
    mtu: u32,
    auth_ttl: Duration,
    /// Usernames with a successful authentication not yet used by a connect
    authenticated: Mutex<HashMap<String, Instant>>,
}

impl AuthCallbackHandler {
    pub fn new(store: Store, sessions: Arc<SessionManager>, dns: Vec<String>, mtu: u32) -> Self {
        Self {
            store,
            sessions,
            dns,
            mtu,
            auth_ttl: DEFAULT_AUTH_TTL,
            authenticated: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_auth_ttl(mut self, ttl: Duration) -> Self {
        self.auth_ttl = ttl;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Check a password against the stored hash. Every attempt is audited.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
        remote_ip: &str,
    ) -> EdgeResult<AuthReply> {
        let outcome = self.verify(username, password).await;

        let message = match &outcome {
            Ok(()) => "authenticated".to_string(),
            Err(e) => e.to_string(),
        };
        self.audit(username, remote_ip, AuditAction::Login, outcome.is_ok(), message)
            .await?;

        match outcome {
            Ok(()) => {
                let mut authenticated = self.authenticated.lock().await;
                let ttl = self.auth_ttl;
                authenticated.retain(|_, at| at.elapsed() < ttl);
                authenticated.insert(username.to_string(), Instant::now());
                info!("Authenticated {} from {}", username, remote_ip);
                Ok(AuthReply { status: STATUS_OK })
            }
            Err(e) => {
                warn!("Authentication of {} from {} failed: {}", username, remote_ip, e);
                Err(e)
            }
        }
    }

    /// Open the session for a user authenticated moments ago.
    pub async fn connect(&self, username: &str, remote_ip: &str) -> EdgeResult<ConnectReply> {
        let outcome = match self.take_authentication(username).await {
            Some(issued_at) => {
                let opened = self.sessions.open_session(username, remote_ip).await;
                self.settle_authentication(username, issued_at, &opened).await;
                opened
            }
            None => Err(EdgeError::Unauthorized(format!("{} has not authenticated", username))),
        };

        let (success, message) = match &outcome {
            Ok(opened) => (true, format!("assigned {}", opened.session.virtual_ip)),
            Err(e) => (false, e.to_string()),
        };
        self.audit(username, remote_ip, AuditAction::Connect, success, message)
            .await?;

        let opened = outcome.map_err(|e| {
            warn!("Connect of {} from {} failed: {}", username, remote_ip, e);
            e
        })?;

        Ok(ConnectReply {
            status: STATUS_OK,
            address: opened.session.virtual_ip,
            netmask: opened.pool.netmask().to_string(),
            dns: self.dns.clone(),
            mtu: self.mtu,
        })
    }

    pub async fn disconnect(&self, username: &str) -> EdgeResult<AuthReply> {
        validate_username(username)?;
        if self.sessions.close_session(username).await? {
            Ok(AuthReply { status: STATUS_OK })
        } else {
            Ok(AuthReply { status: STATUS_IGNORED })
        }
    }

    pub async fn activity(&self, username: &str, upload: u64, download: u64) -> EdgeResult<AuthReply> {
        match self.sessions.record_activity(username, upload, download).await? {
            Some(_) => Ok(AuthReply { status: STATUS_OK }),
            None => Ok(AuthReply { status: STATUS_IGNORED }),
        }
    }

    /// Daemon status and a snapshot of in-memory sessions.
    pub async fn status(&self) -> StatusReport {
        StatusReport {
            daemon: self.sessions.control().show_status().await,
            sessions: self.sessions.registry().snapshot().await,
        }
    }

    async fn verify(&self, username: &str, password: &str) -> EdgeResult<()> {
        if validate_username(username).is_err() {
            return Err(EdgeError::Unauthorized("malformed username".to_string()));
        }

        let credential = self.store.credential(username).await?;
        let (hash, reason) = match &credential {
            None => (DUMMY_HASH.to_string(), Some("unknown user")),
            Some(c) if !c.enabled => (c.password_hash.clone(), Some("user disabled")),
            Some(c) => (c.password_hash.clone(), None),
        };

        let password = password.to_string();
        let matched = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .map_err(|e| EdgeError::Unauthorized(format!("verification aborted: {}", e)))?;

        if let Some(reason) = reason {
            return Err(EdgeError::Unauthorized(reason.to_string()));
        }
        match matched {
            Ok(true) => Ok(()),
            Ok(false) => Err(EdgeError::Unauthorized("invalid password".to_string())),
            Err(e) => {
                warn!("Stored credential of {} is unusable: {}", username, e);
                Err(EdgeError::Unauthorized("invalid password".to_string()))
            }
        }
    }

    /// Consume a fresh authentication for `username`, returning when it was issued.
    async fn take_authentication(&self, username: &str) -> Option<Instant> {
        let mut authenticated = self.authenticated.lock().await;
        authenticated
            .remove(username)
            .filter(|at| at.elapsed() < self.auth_ttl)
    }

    /// Hand the authentication back when the connect failed transiently, so
    /// the daemon can retry without a new login. Its age is kept.
    async fn settle_authentication(
        &self,
        username: &str,
        issued_at: Instant,
        outcome: &EdgeResult<OpenedSession>,
    ) {
        if let Err(e) = outcome {
            if e.is_retryable() {
                self.authenticated
                    .lock()
                    .await
                    .insert(username.to_string(), issued_at);
            }
        }
    }

    async fn audit(
        &self,
        username: &str,
        remote_ip: &str,
        action: AuditAction,
        success: bool,
        message: String,
    ) -> EdgeResult<()> {
        self.store
            .append_audit(&NewAuditRecord {
                username: username.to_string(),
                remote_ip: remote_ip.to_string(),
                action,
                success,
                message,
            })
            .await
    }
}
