use chrono::Utc;

use super::Store;
use crate::error::{EdgeError, EdgeResult};

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub ip_pool: String,
}

/// Stored credential; `password_hash` is already hashed (bcrypt).
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Credential {
    pub username: String,
    pub password_hash: String,
    pub enabled: bool,
}

/// A user's group membership with the group's pool.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UserGroup {
    pub username: String,
    pub group_id: Option<i64>,
    pub group_name: String,
    pub ip_pool: String,
}

impl Store {
    pub async fn create_group(&self, name: &str, ip_pool: &str) -> EdgeResult<i64> {
        let result = sqlx::query("INSERT INTO user_groups (name, ip_pool, created_at) VALUES (?, ?, ?)")
            .bind(name)
            .bind(ip_pool)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn group(&self, id: i64) -> EdgeResult<Option<Group>> {
        let group = sqlx::query_as("SELECT id, name, ip_pool FROM user_groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(group)
    }

    pub async fn group_by_name(&self, name: &str) -> EdgeResult<Option<Group>> {
        let group = sqlx::query_as("SELECT id, name, ip_pool FROM user_groups WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(group)
    }

    pub async fn groups(&self) -> EdgeResult<Vec<Group>> {
        let groups = sqlx::query_as("SELECT id, name, ip_pool FROM user_groups ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(groups)
    }

    /// Create a user from an already-hashed credential.
    pub async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        group_id: Option<i64>,
        enabled: bool,
    ) -> EdgeResult<i64> {
        let result = sqlx::query(
            "INSERT INTO users (username, password, group_id, enabled, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(username)
        .bind(password_hash)
        .bind(group_id)
        .bind(enabled)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn set_user_enabled(&self, username: &str, enabled: bool) -> EdgeResult<()> {
        let result = sqlx::query("UPDATE users SET enabled = ? WHERE username = ?")
            .bind(enabled)
            .bind(username)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EdgeError::NotFound(format!("user {}", username)));
        }
        Ok(())
    }

    pub async fn credential(&self, username: &str) -> EdgeResult<Option<Credential>> {
        let credential = sqlx::query_as(
            "SELECT username, password AS password_hash, enabled FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(credential)
    }

    /// Credentials of every enabled user, in username order.
    pub async fn enabled_credentials(&self) -> EdgeResult<Vec<Credential>> {
        let credentials = sqlx::query_as(
            "SELECT username, password AS password_hash, enabled FROM users
             WHERE enabled = 1 ORDER BY username",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(credentials)
    }

    /// `None` when the user does not exist; a user without a group yields an
    /// empty name and pool.
    pub async fn user_group(&self, username: &str) -> EdgeResult<Option<UserGroup>> {
        let membership = sqlx::query_as(
            "SELECT u.username, g.id AS group_id,
                    COALESCE(g.name, '') AS group_name, COALESCE(g.ip_pool, '') AS ip_pool
             FROM users u LEFT JOIN user_groups g ON u.group_id = g.id
             WHERE u.username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(membership)
    }
}
