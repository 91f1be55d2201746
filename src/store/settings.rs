use chrono::Utc;
use std::collections::HashMap;

use super::Store;
use crate::error::EdgeResult;

impl Store {
    /// Every `system_config` entry as key/value pairs.
    pub async fn settings(&self) -> EdgeResult<HashMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT config_key, config_value FROM system_config")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn get_setting(&self, key: &str) -> EdgeResult<Option<String>> {
        let value = sqlx::query_scalar("SELECT config_value FROM system_config WHERE config_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> EdgeResult<()> {
        sqlx::query(
            "INSERT INTO system_config (config_key, config_value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(config_key) DO UPDATE SET
                config_value = excluded.config_value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
