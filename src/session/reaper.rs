use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use super::manager::SessionManager;
use super::registry::Session;
use crate::error::EdgeResult;
use crate::scheduler::PeriodicJob;

/// Evicts sessions whose last activity is older than the idle timeout.
pub struct IdleReaper {
    manager: Arc<SessionManager>,
    idle_timeout: Duration,
}

impl IdleReaper {
    pub fn new(manager: Arc<SessionManager>, idle_timeout_secs: u64) -> Self {
        let secs = i64::try_from(idle_timeout_secs).unwrap_or(i64::MAX);
        Self {
            manager,
            idle_timeout: Duration::try_seconds(secs).unwrap_or(Duration::MAX),
        }
    }

    /// One pass as of `now`; returns the evicted sessions.
    pub async fn reap(&self, now: DateTime<Utc>) -> Vec<Session> {
        let evicted = self
            .manager
            .registry()
            .evict_idle(self.idle_timeout, now)
            .await;

        for session in &evicted {
            info!(
                "Session idle timeout, evicting {} (idle {}s)",
                session.username,
                session.idle_for(now).num_seconds()
            );
            if let Err(e) = self.manager.finish_eviction(session).await {
                warn!("Cleanup after evicting {} failed: {}", session.username, e);
            }
        }

        evicted
    }
}

#[async_trait]
impl PeriodicJob for IdleReaper {
    fn name(&self) -> &str {
        "idle-reaper"
    }

    async fn run_once(&self) -> EdgeResult<()> {
        self.reap(Utc::now()).await;
        Ok(())
    }
}
