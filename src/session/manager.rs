use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::registry::{Session, SessionRegistry};
use crate::daemon::{DaemonControl, ReportedUser};
use crate::error::{EdgeError, EdgeResult};
use crate::lease::{Allocator, Pool};
use crate::locks::KeyedMutex;
use crate::store::{NewOnlineRecord, OnlineRecord, Store};

/// Protocol recorded for sessions; the daemon prefers DTLS.
pub const DEFAULT_PROTOCOL: &str = "DTLS";

/// Per-session parameters handed out on connect.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub device: String,
    pub mtu: u32,
}

/// A freshly opened session and the pool its address came from.
#[derive(Debug, Clone)]
pub struct OpenedSession {
    pub session: Session,
    pub pool: Pool,
}

/// Keeps the registry, the persisted online table and the lease table in
/// step for every session lifecycle event.
///
/// Work on one username is serialised by a per-user lock held across the
/// storage calls; the registry lock itself is only taken for the in-memory
/// step of each operation.
pub struct SessionManager {
    store: Store,
    allocator: Arc<Allocator>,
    registry: Arc<SessionRegistry>,
    control: Arc<dyn DaemonControl>,
    user_locks: KeyedMutex<String>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(
        store: Store,
        allocator: Arc<Allocator>,
        registry: Arc<SessionRegistry>,
        control: Arc<dyn DaemonControl>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            store,
            allocator,
            registry,
            control,
            user_locks: KeyedMutex::new(),
            settings,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    pub fn control(&self) -> &Arc<dyn DaemonControl> {
        &self.control
    }

    /// Open a session for an authenticated user: clear any stale session,
    /// lease an address, then record the session in memory and in storage.
    pub async fn open_session(&self, username: &str, remote_ip: &str) -> EdgeResult<OpenedSession> {
        let membership = self
            .store
            .user_group(username)
            .await?
            .ok_or_else(|| EdgeError::NotFound(format!("user {}", username)))?;
        let group_id = membership.group_id.ok_or_else(|| {
            EdgeError::PoolMisconfigured(format!("user {} has no group", username))
        })?;

        let _guard = self.user_locks.lock(&username.to_string()).await;

        if let Some(stale) = self.registry.remove(username).await {
            debug!("Replacing stale session of {} ({})", username, stale.virtual_ip);
            if let Some(old_group) = stale.group_id.filter(|g| *g != group_id) {
                self.allocator.release(username, old_group).await?;
            }
        }
        self.store.delete_online(username).await?;

        let pool = self.allocator.pool(group_id).await?;
        let address = self.allocator.allocate(username, group_id).await?;

        let now = Utc::now();
        let mut session = Session::new(username, Some(group_id), now);
        session.group_name = membership.group_name;
        session.virtual_ip = address.to_string();
        session.remote_ip = remote_ip.to_string();
        session.mac = generate_mac();
        session.protocol = DEFAULT_PROTOCOL.to_string();
        session.device = self.settings.device.clone();
        session.mtu = self.settings.mtu;

        self.store.insert_online(&online_record(&session)).await?;
        self.registry.upsert(session.clone()).await;

        info!(
            "Connected {} from {} as {} (group {})",
            username, remote_ip, address, session.group_name
        );
        Ok(OpenedSession { session, pool })
    }

    /// Explicit disconnect. Returns whether anything was open.
    pub async fn close_session(&self, username: &str) -> EdgeResult<bool> {
        let _guard = self.user_locks.lock(&username.to_string()).await;

        let removed = self.registry.remove(username).await;
        let rows = self.store.delete_online(username).await?;

        let group_id = match &removed {
            Some(session) => session.group_id,
            None => self.group_of(username).await?,
        };
        if let Some(group_id) = group_id {
            self.allocator.release(username, group_id).await?;
        }

        let was_open = removed.is_some() || rows > 0;
        if was_open {
            info!("Disconnected {}", username);
        }
        Ok(was_open)
    }

    /// Ask the daemon to drop the user, then close the session locally.
    ///
    /// Local state is cleared even when the daemon command fails; the failure
    /// is still returned.
    pub async fn force_disconnect(&self, username: &str) -> EdgeResult<bool> {
        let daemon_result = self.control.disconnect_user(username).await;
        if let Err(e) = &daemon_result {
            warn!("Daemon disconnect of {} failed: {}", username, e);
        }

        let was_open = self.close_session(username).await?;
        daemon_result.map(|_| was_open)
    }

    /// Record traffic for an open session and persist the new counters.
    pub async fn record_activity(
        &self,
        username: &str,
        upload: u64,
        download: u64,
    ) -> EdgeResult<Option<Session>> {
        let Some(session) = self
            .registry
            .record_activity(username, upload, download, Utc::now())
            .await
        else {
            return Ok(None);
        };

        self.store
            .update_traffic(
                username,
                session.total_upload,
                session.total_download,
                session.upload_speed,
                session.download_speed,
            )
            .await?;
        Ok(Some(session))
    }

    /// Persisted online sessions, newest first.
    pub async fn online(&self) -> EdgeResult<Vec<OnlineRecord>> {
        self.store.online().await
    }

    /// Persist a user the daemon reports but storage does not know about.
    /// Returns `false` when the user was already online.
    pub(crate) async fn adopt_reported(&self, reported: &ReportedUser) -> EdgeResult<bool> {
        let username = reported.username.as_str();
        let _guard = self.user_locks.lock(&reported.username).await;

        if self.store.is_online(username).await? {
            return Ok(false);
        }

        let group_name = self
            .store
            .user_group(username)
            .await?
            .map(|m| m.group_name)
            .unwrap_or_default();

        self.store
            .insert_online(&NewOnlineRecord {
                username: username.to_string(),
                group_name,
                virtual_ip: reported.virtual_ip.clone(),
                remote_ip: reported.remote_ip.clone(),
                protocol: DEFAULT_PROTOCOL.to_string(),
                connected_at: Utc::now(),
                ..Default::default()
            })
            .await?;

        info!(
            "Detected connection of {} ({} -> {})",
            username, reported.remote_ip, reported.virtual_ip
        );
        Ok(true)
    }

    /// Drop an online row the daemon no longer reports, releasing the lease.
    ///
    /// A session opened at or after `cycle_start` belongs to a newer connection
    /// and is left alone.
    pub(crate) async fn retire_unreported(
        &self,
        record: &OnlineRecord,
        cycle_start: DateTime<Utc>,
    ) -> EdgeResult<()> {
        let username = record.username.as_str();
        let _guard = self.user_locks.lock(&record.username).await;

        self.store.delete_online_by_id(record.id).await?;

        if let Some(current) = self.registry.get(username).await {
            if current.connected_at >= cycle_start {
                debug!("{} reconnected during reconciliation, keeping lease", username);
                return Ok(());
            }
            self.registry.remove_if_connected_at(username, current.connected_at).await;
        }

        if let Some(group_id) = self.group_of(username).await? {
            self.allocator.release(username, group_id).await?;
        }

        info!("User disconnected: {}", username);
        Ok(())
    }

    /// Drop a registry entry that has neither a daemon report nor an online
    /// row. Returns `false` when the user reconnected in the meantime.
    pub(crate) async fn retire_orphaned(&self, session: &Session) -> EdgeResult<bool> {
        let username = session.username.as_str();
        let _guard = self.user_locks.lock(&session.username).await;

        if self.store.is_online(username).await? {
            return Ok(false);
        }
        if self
            .registry
            .remove_if_connected_at(username, session.connected_at)
            .await
            .is_none()
        {
            return Ok(false);
        }

        if let Some(group_id) = session.group_id {
            self.allocator.release(username, group_id).await?;
        }

        info!("User disconnected: {} (no online record)", username);
        Ok(true)
    }

    /// Clean up storage for a session already evicted from the registry.
    pub(crate) async fn finish_eviction(&self, session: &Session) -> EdgeResult<()> {
        let _guard = self.user_locks.lock(&session.username).await;

        if self.registry.contains(&session.username).await {
            debug!("{} reconnected after eviction, keeping state", session.username);
            return Ok(());
        }

        self.store.delete_online(&session.username).await?;
        if let Some(group_id) = session.group_id {
            self.allocator.release(&session.username, group_id).await?;
        }
        Ok(())
    }

    async fn group_of(&self, username: &str) -> EdgeResult<Option<i64>> {
        Ok(self
            .store
            .user_group(username)
            .await?
            .and_then(|m| m.group_id))
    }
}

fn online_record(session: &Session) -> NewOnlineRecord {
    NewOnlineRecord {
        username: session.username.clone(),
        group_name: session.group_name.clone(),
        mac: session.mac.clone(),
        virtual_ip: session.virtual_ip.clone(),
        remote_ip: session.remote_ip.clone(),
        protocol: session.protocol.clone(),
        virtual_dev: session.device.clone(),
        mtu: session.mtu,
        connected_at: session.connected_at,
    }
}

/// Session-scoped hardware address in the 00:50:56 range.
pub fn generate_mac() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "00:50:56:{:02x}:{:02x}:{:02x}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}
