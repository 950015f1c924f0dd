//! JSON config values under the `config` table, family `c`.
//!
//! This is the only cross-worker persistence: metric and event definitions,
//! the `database_init` marker and `last_change` all live here. Writes to the
//! same key are last-writer-wins.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::connection::Connection;
use crate::errors::{CdbError, Result};

pub const TABLE: &str = "config";
const COLUMN: &str = "c:v";

pub struct ConfigStore<'a> {
    pub(crate) conn: &'a Connection,
}

impl ConfigStore<'_> {
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        if self.conn.read_only() {
            return Err(CdbError::ReadOnly);
        }
        let encoded = serde_json::to_vec(value)
            .map_err(|e| CdbError::Config(format!("unserialisable config value {key}: {e}")))?;
        let table = self.conn.table(TABLE).await?;
        table.write_cell(key, COLUMN, &encoded).await
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let table = self.conn.table(TABLE).await?;
        let cells = match table.read_row(key, None).await {
            Ok(cells) => cells,
            Err(CdbError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        match cells.get(COLUMN) {
            Some(bytes) => {
                let value = serde_json::from_slice(bytes)
                    .map_err(|e| CdbError::Config(format!("bad config value {key}: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::stores::testutil;

    #[tokio::test]
    async fn test_round_trip() {
        let conn = testutil::connect().await;
        let store = conn.config_store();
        store.put("answer", &serde_json::json!({"n": 42})).await.unwrap();
        let value: Option<serde_json::Value> = store.get("answer").await.unwrap();
        assert_eq!(value.unwrap()["n"], 42);

        let missing: Option<serde_json::Value> = store.get("nope").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let conn = testutil::connect().await;
        let store = conn.config_store();
        store.put("k", &1i64).await.unwrap();
        store.put("k", &2i64).await.unwrap();
        let value: Option<i64> = store.get("k").await.unwrap();
        assert_eq!(value, Some(2));
    }
}
