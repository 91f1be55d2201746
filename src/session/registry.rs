use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::warn;

/// In-memory view of one connected user.
///
/// Authoritative for `last_activity` and the speed counters; the persisted
/// online row mirrors the rest for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub username: String,
    /// `None` for users without a group
    pub group_id: Option<i64>,
    pub group_name: String,
    pub virtual_ip: String,
    pub remote_ip: String,
    pub mac: String,
    pub protocol: String,
    pub device: String,
    pub mtu: u32,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub total_upload: u64,
    pub total_download: u64,
    pub upload_speed: u64,
    pub download_speed: u64,
}

impl Session {
    pub fn new(username: impl Into<String>, group_id: Option<i64>, now: DateTime<Utc>) -> Self {
        Self {
            username: username.into(),
            group_id,
            group_name: String::new(),
            virtual_ip: String::new(),
            remote_ip: String::new(),
            mac: String::new(),
            protocol: String::new(),
            device: String::new(),
            mtu: 0,
            connected_at: now,
            last_activity: now,
            total_upload: 0,
            total_download: 0,
            upload_speed: 0,
            download_speed: 0,
        }
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_activity
    }
}

/// Volatile table of active sessions, at most one per username.
///
/// Every operation takes the single registry lock for its own critical
/// section only; no lock is held across storage or process I/O.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, returning the replaced entry. Its lease is left alone.
    pub async fn upsert(&self, session: Session) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session.username.clone(), session)
    }

    /// Bump last activity and add traffic deltas, returning the updated entry.
    pub async fn record_activity(
        &self,
        username: &str,
        upload: u64,
        download: u64,
        now: DateTime<Utc>,
    ) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(username) else {
            warn!("Activity for {} without an active session, ignoring", username);
            return None;
        };

        session.last_activity = now;
        session.total_upload = session.total_upload.saturating_add(upload);
        session.total_download = session.total_download.saturating_add(download);
        session.upload_speed = upload;
        session.download_speed = download;
        Some(session.clone())
    }

    pub async fn remove(&self, username: &str) -> Option<Session> {
        self.sessions.lock().await.remove(username)
    }

    /// Remove only if the entry is still the one that connected at `connected_at`.
    pub async fn remove_if_connected_at(
        &self,
        username: &str,
        connected_at: DateTime<Utc>,
    ) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(username) {
            Some(s) if s.connected_at == connected_at => sessions.remove(username),
            _ => None,
        }
    }

    pub async fn get(&self, username: &str) -> Option<Session> {
        self.sessions.lock().await.get(username).cloned()
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.sessions.lock().await.contains_key(username)
    }

    /// Point-in-time copy, sorted by username.
    pub async fn snapshot(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.lock().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.username.cmp(&b.username));
        sessions
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove every session idle for longer than `timeout` in one locked pass.
    pub async fn evict_idle(&self, timeout: Duration, now: DateTime<Utc>) -> Vec<Session> {
        let mut sessions = self.sessions.lock().await;
        let idle: Vec<String> = sessions
            .values()
            .filter(|s| s.idle_for(now) > timeout)
            .map(|s| s.username.clone())
            .collect();

        idle.iter().filter_map(|name| sessions.remove(name)).collect()
    }
}
