use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::net::Ipv4Addr;

use super::{is_unique_violation, Store};
use crate::error::{EdgeError, EdgeResult};

/// A persisted (group, address, username) assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub group_id: i64,
    pub address: Ipv4Addr,
    pub username: String,
    pub allocated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct LeaseRow {
    group_id: i64,
    ip_address: String,
    username: String,
    allocated_at: DateTime<Utc>,
}

impl TryFrom<LeaseRow> for LeaseRecord {
    type Error = EdgeError;

    fn try_from(row: LeaseRow) -> EdgeResult<Self> {
        let address = row.ip_address.parse().map_err(|_| {
            EdgeError::InvalidParameter(format!("stored lease address is malformed: {}", row.ip_address))
        })?;
        Ok(Self {
            group_id: row.group_id,
            address,
            username: row.username,
            allocated_at: row.allocated_at,
        })
    }
}

impl Store {
    pub async fn lease_for(&self, username: &str, group_id: i64) -> EdgeResult<Option<LeaseRecord>> {
        let row: Option<LeaseRow> = sqlx::query_as(
            "SELECT group_id, ip_address, username, allocated_at
             FROM ip_allocations WHERE username = ? AND group_id = ?",
        )
        .bind(username)
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(LeaseRecord::try_from).transpose()
    }

    /// Addresses currently leased in a group.
    pub async fn leased_addresses(&self, group_id: i64) -> EdgeResult<HashSet<Ipv4Addr>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT ip_address FROM ip_allocations WHERE group_id = ?")
                .bind(group_id)
                .fetch_all(&self.pool)
                .await?;

        // Unparsable rows cannot collide with a generated address.
        Ok(rows.iter().filter_map(|ip| ip.parse().ok()).collect())
    }

    /// Insert a lease, failing with [`EdgeError::LeaseConflict`] when the
    /// address or the user already holds a row in this group.
    pub async fn insert_lease(&self, lease: &LeaseRecord) -> EdgeResult<()> {
        let result = sqlx::query(
            "INSERT INTO ip_allocations (group_id, ip_address, username, allocated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(lease.group_id)
        .bind(lease.address.to_string())
        .bind(&lease.username)
        .bind(lease.allocated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(EdgeError::LeaseConflict {
                group: lease.group_id,
                address: lease.address.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the number of rows removed (0 or 1).
    pub async fn delete_lease(&self, username: &str, group_id: i64) -> EdgeResult<u64> {
        let result = sqlx::query("DELETE FROM ip_allocations WHERE username = ? AND group_id = ?")
            .bind(username)
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// All leases of a group in address order.
    pub async fn leases(&self, group_id: i64) -> EdgeResult<Vec<LeaseRecord>> {
        let rows: Vec<LeaseRow> = sqlx::query_as(
            "SELECT group_id, ip_address, username, allocated_at
             FROM ip_allocations WHERE group_id = ?",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        let mut leases = rows
            .into_iter()
            .map(LeaseRecord::try_from)
            .collect::<EdgeResult<Vec<_>>>()?;
        leases.sort_by_key(|l| u32::from(l.address));
        Ok(leases)
    }
}
