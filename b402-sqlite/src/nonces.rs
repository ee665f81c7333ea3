//! Shared nonce cache table.
//!
//! Rows carry an absolute expiry in unix milliseconds. Expired rows are
//! deleted when read; nothing sweeps the table in the background.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use b402::StoreError;
use b402::replay::NonceEntry;
use b402::store::NonceCache;
use rusqlite::{OptionalExtension, params};

use crate::error::SqliteError;
use crate::store::SqliteStore;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

#[async_trait]
impl NonceCache for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<NonceEntry>, StoreError> {
        let key = key.to_owned();
        self.run(move |conn| {
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT entry, expires_at FROM nonce_cache WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((raw, expires_at)) = row else {
                return Ok(None);
            };
            if expires_at <= now_millis() {
                conn.execute(
                    "DELETE FROM nonce_cache WHERE key = ?1 AND expires_at = ?2",
                    params![key, expires_at],
                )?;
                return Ok(None);
            }
            Ok(Some(serde_json::from_str(&raw)?))
        })
        .await
    }

    async fn set(&self, key: &str, entry: &NonceEntry, ttl: Duration) -> Result<(), StoreError> {
        let key = key.to_owned();
        let raw = serde_json::to_string(entry).map_err(SqliteError::from)?;
        let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.run(move |conn| {
            let expires_at = now_millis().saturating_add(ttl_millis);
            conn.execute(
                "INSERT INTO nonce_cache (key, entry, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET entry = excluded.entry, expires_at = excluded.expires_at",
                params![key, raw, expires_at],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nonce_cache_round_trip_and_expiry() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .set("x402:nonce:a", &NonceEntry::consumed(), Duration::from_millis(80))
            .await
            .unwrap();
        let entry = store.get("x402:nonce:a").await.unwrap().unwrap();
        assert_eq!(entry, NonceEntry::consumed());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.get("x402:nonce:a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_replaces_entry_and_ttl() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .set("k", &NonceEntry::consumed(), Duration::from_millis(1))
            .await
            .unwrap();
        store
            .set("k", &NonceEntry::consumed(), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get("k").await.unwrap().is_some());
    }
}
