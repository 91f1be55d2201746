use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::manager::SessionManager;
use crate::error::{EdgeError, EdgeResult};
use crate::scheduler::PeriodicJob;

/// What one reconciliation cycle changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub connected: Vec<String>,
    pub disconnected: Vec<String>,
}

/// Diffs the daemon's live user list against persisted online rows.
///
/// Every cycle processes the whole state, so a missed or failed cycle is
/// repaired by the next successful one.
pub struct ExternalStatePoller {
    manager: Arc<SessionManager>,
}

impl ExternalStatePoller {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    /// Run one cycle. Fails only when the daemon cannot be queried, in which
    /// case nothing is changed.
    pub async fn reconcile(&self) -> EdgeResult<ReconcileReport> {
        let cycle_start = Utc::now();
        let reported = self.manager.control().show_users().await?;
        let active: HashSet<&str> = reported.iter().map(|u| u.username.as_str()).collect();

        let mut report = ReconcileReport::default();

        for user in &reported {
            match self.manager.adopt_reported(user).await {
                Ok(true) => report.connected.push(user.username.clone()),
                Ok(false) => {}
                Err(e) => warn!("Failed to record {} as online: {}", user.username, e),
            }
        }

        // Rows created after the report was taken are not judged against it
        let records = self.manager.store().online().await?;
        let persisted: HashSet<String> = records.iter().map(|r| r.username.clone()).collect();
        for record in records {
            if active.contains(record.username.as_str()) || record.connected_at >= cycle_start {
                continue;
            }
            match self.manager.retire_unreported(&record, cycle_start).await {
                Ok(()) => report.disconnected.push(record.username),
                Err(e) => warn!("Failed to retire {}: {}", record.username, e),
            }
        }

        // In-memory sessions whose row was removed elsewhere, e.g. by an
        // admin disconnect run from another process
        for session in self.manager.registry().snapshot().await {
            let username = session.username.as_str();
            if active.contains(username)
                || persisted.contains(username)
                || session.connected_at >= cycle_start
            {
                continue;
            }
            match self.manager.retire_orphaned(&session).await {
                Ok(true) => report.disconnected.push(session.username),
                Ok(false) => {}
                Err(e) => warn!("Failed to retire {}: {}", session.username, e),
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl PeriodicJob for ExternalStatePoller {
    fn name(&self) -> &str {
        "external-state-poller"
    }

    async fn run_once(&self) -> EdgeResult<()> {
        match self.reconcile().await {
            Ok(report) => {
                if !report.connected.is_empty() || !report.disconnected.is_empty() {
                    debug!(
                        "Reconciled: {} connected, {} disconnected",
                        report.connected.len(),
                        report.disconnected.len()
                    );
                }
                Ok(())
            }
            Err(EdgeError::DaemonUnavailable(reason)) => {
                debug!("Daemon unavailable, skipping reconciliation: {}", reason);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{MockDaemonControl, ReportedUser};
    use crate::lease::Allocator;
    use crate::session::{Session, SessionRegistry, SessionSettings};
    use crate::store::{NewOnlineRecord, Store};
    use chrono::Duration;

    fn reported(names: &[&str]) -> Vec<ReportedUser> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| ReportedUser {
                username: name.to_string(),
                virtual_ip: format!("192.168.100.{}", i + 10),
                remote_ip: "203.0.113.1".to_string(),
            })
            .collect()
    }

    async fn setup(control: MockDaemonControl) -> (Arc<SessionManager>, Store) {
        let store = Store::in_memory().await.unwrap();
        for name in ["alice", "bob", "carol"] {
            store.create_user(name, "hash", Some(1), true).await.unwrap();
        }
        let manager = SessionManager::new(
            store.clone(),
            Arc::new(Allocator::new(store.clone())),
            Arc::new(SessionRegistry::new()),
            Arc::new(control),
            SessionSettings {
                device: "vpns".to_string(),
                mtu: 1400,
            },
        );
        (Arc::new(manager), store)
    }

    async fn persist_online(store: &Store, username: &str) {
        store
            .insert_online(&NewOnlineRecord {
                username: username.to_string(),
                group_name: "default".to_string(),
                connected_at: Utc::now() - Duration::seconds(60),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    async fn online_names(store: &Store) -> HashSet<String> {
        store.online().await.unwrap().into_iter().map(|r| r.username).collect()
    }

    #[tokio::test]
    async fn test_cycle_converges_to_daemon_report() {
        let mut control = MockDaemonControl::new();
        control
            .expect_show_users()
            .returning(|| Ok(reported(&["alice", "bob"])));
        let (manager, store) = setup(control).await;

        persist_online(&store, "bob").await;
        persist_online(&store, "carol").await;
        let carol_ip = manager.allocator().allocate("carol", 1).await.unwrap();
        let mut carol = Session::new("carol", Some(1), Utc::now() - Duration::seconds(60));
        carol.virtual_ip = carol_ip.to_string();
        manager.registry().upsert(carol).await;

        let poller = ExternalStatePoller::new(manager.clone());
        let report = poller.reconcile().await.unwrap();

        assert_eq!(report.connected, vec!["alice"]);
        assert_eq!(report.disconnected, vec!["carol"]);

        let expected: HashSet<String> = ["alice", "bob"].iter().map(|s| s.to_string()).collect();
        assert_eq!(online_names(&store).await, expected);
        assert!(store.lease_for("carol", 1).await.unwrap().is_none());
        assert!(!manager.registry().contains("carol").await);

        let alice = store
            .online()
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.username == "alice")
            .unwrap();
        assert_eq!(alice.virtual_ip, "192.168.100.10");
        assert_eq!(alice.group_name, "default");
        assert_eq!(alice.protocol, "DTLS");
    }

    #[tokio::test]
    async fn test_second_cycle_is_a_no_op() {
        let mut control = MockDaemonControl::new();
        control
            .expect_show_users()
            .times(2)
            .returning(|| Ok(reported(&["alice"])));
        let (manager, store) = setup(control).await;

        let poller = ExternalStatePoller::new(manager);
        poller.reconcile().await.unwrap();
        let report = poller.reconcile().await.unwrap();

        assert_eq!(report, ReconcileReport::default());
        assert_eq!(store.online().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_daemon_changes_nothing() {
        let mut control = MockDaemonControl::new();
        control
            .expect_show_users()
            .returning(|| Err(EdgeError::DaemonUnavailable("no socket".to_string())));
        let (manager, store) = setup(control).await;
        persist_online(&store, "bob").await;
        manager.allocator().allocate("bob", 1).await.unwrap();

        let poller = ExternalStatePoller::new(manager);
        assert!(matches!(
            poller.reconcile().await,
            Err(EdgeError::DaemonUnavailable(_))
        ));
        assert!(poller.run_once().await.is_ok());

        assert_eq!(store.online().await.unwrap().len(), 1);
        assert!(store.lease_for("bob", 1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_user_is_recorded_without_group() {
        let mut control = MockDaemonControl::new();
        control
            .expect_show_users()
            .returning(|| Ok(reported(&["stranger"])));
        let (manager, store) = setup(control).await;

        ExternalStatePoller::new(manager).reconcile().await.unwrap();
        let rows = store.online().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].group_name, "");
    }

    #[tokio::test]
    async fn test_session_without_row_is_dropped() {
        let mut control = MockDaemonControl::new();
        control.expect_show_users().returning(|| Ok(Vec::new()));
        let (manager, store) = setup(control).await;

        let opened = manager.open_session("alice", "203.0.113.9").await.unwrap();
        // Session opened a moment before the cycle
        let mut session = opened.session;
        session.connected_at = Utc::now() - Duration::seconds(30);
        manager.registry().upsert(session).await;

        // Admin disconnect from a separate process sharing the database
        let mut admin_control = MockDaemonControl::new();
        admin_control.expect_disconnect_user().returning(|_| Ok(()));
        let admin = SessionManager::new(
            store.clone(),
            Arc::new(Allocator::new(store.clone())),
            Arc::new(SessionRegistry::new()),
            Arc::new(admin_control),
            SessionSettings {
                device: "vpns".to_string(),
                mtu: 1400,
            },
        );
        admin.force_disconnect("alice").await.unwrap();
        assert!(store.online().await.unwrap().is_empty());
        assert!(manager.registry().contains("alice").await);

        let report = ExternalStatePoller::new(manager.clone()).reconcile().await.unwrap();

        assert_eq!(report.disconnected, vec!["alice"]);
        assert!(!manager.registry().contains("alice").await);
        assert!(manager.registry().snapshot().await.is_empty());
        assert!(store.lease_for("alice", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reconnected_user_keeps_lease() {
        let mut control = MockDaemonControl::new();
        control.expect_show_users().returning(|| Ok(Vec::new()));
        let (manager, store) = setup(control).await;

        persist_online(&store, "bob").await;
        manager.allocator().allocate("bob", 1).await.unwrap();
        // A connect that lands after the cycle started
        let mut fresh = Session::new("bob", Some(1), Utc::now() + Duration::seconds(5));
        fresh.virtual_ip = "192.168.100.1".to_string();
        manager.registry().upsert(fresh).await;

        ExternalStatePoller::new(manager.clone()).reconcile().await.unwrap();

        assert!(store.online().await.unwrap().is_empty());
        assert!(store.lease_for("bob", 1).await.unwrap().is_some());
        assert!(manager.registry().contains("bob").await);
    }
}
