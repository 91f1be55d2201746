use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use super::Store;
use crate::error::EdgeResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Login,
    Connect,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditAction::Login => write!(f, "login"),
            AuditAction::Connect => write!(f, "connect"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewAuditRecord {
    pub username: String,
    pub remote_ip: String,
    pub action: AuditAction,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuditRecord {
    pub id: i64,
    pub username: String,
    pub remote_ip: String,
    pub action: String,
    pub success: bool,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Append-only; rows are never updated.
    pub async fn append_audit(&self, record: &NewAuditRecord) -> EdgeResult<()> {
        sqlx::query(
            "INSERT INTO auth_logs (username, remote_ip, action, success, message, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.username)
        .bind(&record.remote_ip)
        .bind(record.action.to_string())
        .bind(record.success)
        .bind(&record.message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_audit(&self, limit: u32) -> EdgeResult<Vec<AuditRecord>> {
        let rows = sqlx::query_as(
            "SELECT id, username, remote_ip, action, success, message, created_at
             FROM auth_logs ORDER BY id DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn audit_for(&self, username: &str) -> EdgeResult<Vec<AuditRecord>> {
        let rows = sqlx::query_as(
            "SELECT id, username, remote_ip, action, success, message, created_at
             FROM auth_logs WHERE username = ? ORDER BY id",
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
