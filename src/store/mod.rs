//! Persistent state: groups, users, leases, online sessions, audit trail and
//! runtime settings, kept in a single SQLite database.
//!
//! Every operation is a single statement, so row-level atomicity comes from
//! SQLite itself. Lease uniqueness is enforced by table constraints, which turn
//! a concurrent double-assignment into [`EdgeError::LeaseConflict`].

mod audit;
mod leases;
mod online;
mod settings;
mod users;

pub use audit::{AuditAction, AuditRecord, NewAuditRecord};
pub use leases::LeaseRecord;
pub use online::{NewOnlineRecord, OnlineRecord};
pub use users::{Credential, Group, UserGroup};

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::EdgeResult;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS user_groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        ip_pool TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        password TEXT NOT NULL,
        group_id INTEGER REFERENCES user_groups(id),
        enabled INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS ip_allocations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        group_id INTEGER NOT NULL,
        ip_address TEXT NOT NULL,
        username TEXT NOT NULL,
        allocated_at TEXT NOT NULL,
        UNIQUE(group_id, ip_address),
        UNIQUE(group_id, username)
    )",
    "CREATE TABLE IF NOT EXISTS online_users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL,
        group_name TEXT NOT NULL DEFAULT '',
        mac TEXT NOT NULL DEFAULT '',
        virtual_ip TEXT NOT NULL DEFAULT '',
        remote_ip TEXT NOT NULL DEFAULT '',
        protocol TEXT NOT NULL DEFAULT '',
        virtual_dev TEXT NOT NULL DEFAULT '',
        mtu INTEGER NOT NULL DEFAULT 0,
        upload_speed INTEGER NOT NULL DEFAULT 0,
        download_speed INTEGER NOT NULL DEFAULT 0,
        total_upload INTEGER NOT NULL DEFAULT 0,
        total_download INTEGER NOT NULL DEFAULT 0,
        connected_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS auth_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL,
        remote_ip TEXT NOT NULL DEFAULT '',
        action TEXT NOT NULL,
        success INTEGER NOT NULL,
        message TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS system_config (
        config_key TEXT PRIMARY KEY,
        config_value TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_ip_allocations_username ON ip_allocations(username)",
    "CREATE INDEX IF NOT EXISTS idx_online_users_username ON online_users(username)",
    "CREATE INDEX IF NOT EXISTS idx_auth_logs_username ON auth_logs(username)",
];

const DEFAULT_SETTINGS: &[(&str, &str, &str)] = &[
    ("default_ip_pool", "192.168.100.0/24", "Default VPN address pool"),
    ("default_dns1", "8.8.8.8", "Primary DNS pushed to clients"),
    ("default_dns2", "8.8.4.4", "Secondary DNS pushed to clients"),
    ("default_mtu", "1400", "Tunnel MTU"),
    ("max_clients", "100", "Maximum concurrent clients"),
    ("idle_timeout", "3600", "Idle timeout in seconds"),
];

/// Handle to the database; cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database file and bring the schema up.
    pub async fn open(path: &Path) -> EdgeResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        info!("Opened database {:?}", path);
        Self::init(pool).await
    }

    /// Private in-memory database, used by tests and dry runs.
    pub async fn in_memory() -> EdgeResult<Self> {
        // Every connection to :memory: is a separate database, so pin exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> EdgeResult<Self> {
        let store = Self { pool };
        store.migrate().await?;
        store.seed_defaults().await?;
        Ok(store)
    }

    async fn migrate(&self) -> EdgeResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Schema ready");
        Ok(())
    }

    async fn seed_defaults(&self) -> EdgeResult<()> {
        let groups: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_groups")
            .fetch_one(&self.pool)
            .await?;
        if groups == 0 {
            self.create_group("default", "192.168.100.0/24").await?;
            info!("Seeded default group");
        }

        let now = Utc::now();
        for (key, value, description) in DEFAULT_SETTINGS {
            sqlx::query(
                "INSERT OR IGNORE INTO system_config (config_key, config_value, description, updated_at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(*key)
            .bind(*value)
            .bind(*description)
            .bind(now)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// True when an insert tripped a UNIQUE constraint.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}
