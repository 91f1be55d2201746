use chrono::{DateTime, Utc};
use serde::Serialize;

use super::Store;
use crate::error::EdgeResult;

/// A persisted "online" row, as shown to administrators.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct OnlineRecord {
    pub id: i64,
    pub username: String,
    pub group_name: String,
    pub mac: String,
    pub virtual_ip: String,
    pub remote_ip: String,
    pub protocol: String,
    pub virtual_dev: String,
    pub mtu: i64,
    pub upload_speed: i64,
    pub download_speed: i64,
    pub total_upload: i64,
    pub total_download: i64,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewOnlineRecord {
    pub username: String,
    pub group_name: String,
    pub mac: String,
    pub virtual_ip: String,
    pub remote_ip: String,
    pub protocol: String,
    pub virtual_dev: String,
    pub mtu: u32,
    pub connected_at: DateTime<Utc>,
}

impl Store {
    pub async fn insert_online(&self, record: &NewOnlineRecord) -> EdgeResult<i64> {
        let result = sqlx::query(
            "INSERT INTO online_users
                (username, group_name, mac, virtual_ip, remote_ip, protocol, virtual_dev, mtu, connected_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.username)
        .bind(&record.group_name)
        .bind(&record.mac)
        .bind(&record.virtual_ip)
        .bind(&record.remote_ip)
        .bind(&record.protocol)
        .bind(&record.virtual_dev)
        .bind(i64::from(record.mtu))
        .bind(record.connected_at)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Every online row, newest connection first.
    pub async fn online(&self) -> EdgeResult<Vec<OnlineRecord>> {
        let rows: Vec<OnlineRecord> = sqlx::query_as(
            "SELECT id, username, group_name, mac, virtual_ip, remote_ip, protocol, virtual_dev, mtu,
                    upload_speed, download_speed, total_upload, total_download, connected_at
             FROM online_users ORDER BY id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn is_online(&self, username: &str) -> EdgeResult<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM online_users WHERE username = ?")
            .bind(username)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn delete_online_by_id(&self, id: i64) -> EdgeResult<u64> {
        let result = sqlx::query("DELETE FROM online_users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_online(&self, username: &str) -> EdgeResult<u64> {
        let result = sqlx::query("DELETE FROM online_users WHERE username = ?")
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Store cumulative totals and the most recent per-interval deltas.
    pub async fn update_traffic(
        &self,
        username: &str,
        total_upload: u64,
        total_download: u64,
        upload_speed: u64,
        download_speed: u64,
    ) -> EdgeResult<u64> {
        let result = sqlx::query(
            "UPDATE online_users
             SET total_upload = ?, total_download = ?, upload_speed = ?, download_speed = ?
             WHERE username = ?",
        )
        .bind(saturating_i64(total_upload))
        .bind(saturating_i64(total_download))
        .bind(saturating_i64(upload_speed))
        .bind(saturating_i64(download_speed))
        .bind(username)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(username: &str) -> NewOnlineRecord {
        NewOnlineRecord {
            username: username.to_string(),
            group_name: "default".to_string(),
            virtual_ip: "192.168.100.1".to_string(),
            remote_ip: "203.0.113.7".to_string(),
            protocol: "DTLS".to_string(),
            mtu: 1400,
            connected_at: Utc::now(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_insert_list_delete() {
        let store = Store::in_memory().await.unwrap();
        let alice = store.insert_online(&record("alice")).await.unwrap();
        store.insert_online(&record("bob")).await.unwrap();

        let online = store.online().await.unwrap();
        assert_eq!(online.len(), 2);
        assert_eq!(online[0].username, "bob");
        assert_eq!(online[1].mtu, 1400);

        assert_eq!(store.delete_online_by_id(alice).await.unwrap(), 1);
        assert!(!store.is_online("alice").await.unwrap());
        assert!(store.is_online("bob").await.unwrap());

        assert_eq!(store.delete_online("bob").await.unwrap(), 1);
        assert_eq!(store.delete_online("bob").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_traffic() {
        let store = Store::in_memory().await.unwrap();
        store.insert_online(&record("alice")).await.unwrap();

        assert_eq!(store.update_traffic("alice", 1000, 2000, 10, 20).await.unwrap(), 1);
        assert_eq!(store.update_traffic("nobody", 1, 1, 1, 1).await.unwrap(), 0);

        let row = &store.online().await.unwrap()[0];
        assert_eq!((row.total_upload, row.total_download), (1000, 2000));
        assert_eq!((row.upload_speed, row.download_speed), (10, 20));
    }
}
