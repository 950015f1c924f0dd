//! Namespaced per-object metadata maps.
//!
//! Rows are `"{object_name}#{object_id}"`; each entry is one msgpack cell
//! under family `p` (public) or `i` (internal).

use std::collections::BTreeMap;
use std::time::Instant;

use crate::connection::Connection;
use crate::errors::{CdbError, Result};
use crate::models::{DictValue, MetaDataItem, RowUpsert};
use crate::signals::StoreMethod;
use crate::stores::emit;

pub const TABLE: &str = "metadata";

const STORE: &str = "metadata";

fn family(internal: bool) -> &'static str {
    if internal { "i" } else { "p" }
}

pub struct MetaDataStore<'a> {
    pub(crate) conn: &'a Connection,
}

impl MetaDataStore<'_> {
    pub fn row_key(object_name: &str, object_id: &str) -> String {
        format!("{object_name}#{object_id}")
    }

    pub async fn put_items(&self, items: &[MetaDataItem], internal: bool) -> Result<usize> {
        self.conn.ensure_writable()?;
        if items.is_empty() {
            return Err(CdbError::InvalidArgument("no metadata items".to_string()));
        }

        let started = Instant::now();
        let mut upserts: BTreeMap<String, RowUpsert> = BTreeMap::new();
        for item in items {
            let row_key = Self::row_key(&item.object_name, &item.object_id);
            let column = format!("{}:{}", family(internal), item.key);
            let encoded = rmp_serde::to_vec(&item.data)?;
            upserts
                .entry(row_key.clone())
                .or_insert_with(|| RowUpsert::new(row_key))
                .cells
                .insert(column, encoded);
        }
        let row_keys: Vec<String> = upserts.keys().cloned().collect();
        let upserts: Vec<RowUpsert> = upserts.into_values().collect();

        let table = self.conn.table(TABLE).await?;
        table.upsert_rows(&upserts).await?;

        emit(
            self.conn,
            STORE,
            StoreMethod::Put,
            items.len(),
            row_keys,
            started,
        );
        Ok(items.len())
    }

    pub async fn put(
        &self,
        object_name: &str,
        object_id: &str,
        key: &str,
        data: DictValue,
        internal: bool,
    ) -> Result<usize> {
        self.put_items(
            &[MetaDataItem::new(object_name, object_id, key, data)],
            internal,
        )
        .await
    }

    pub async fn get_metadata(
        &self,
        object_name: &str,
        object_id: &str,
        keys: Option<&[String]>,
        internal: bool,
    ) -> Result<Vec<MetaDataItem>> {
        self.get_metadata_bulk(object_name, &[object_id.to_string()], keys, internal)
            .await
    }

    /// One batched row read for many object ids.
    pub async fn get_metadata_bulk(
        &self,
        object_name: &str,
        object_ids: &[String],
        keys: Option<&[String]>,
        internal: bool,
    ) -> Result<Vec<MetaDataItem>> {
        self.conn.ensure_initialised()?;

        let started = Instant::now();
        let row_keys: Vec<String> = object_ids
            .iter()
            .map(|id| Self::row_key(object_name, id))
            .collect();
        let table = self.conn.table(TABLE).await?;
        let rows = table
            .read_rows(&row_keys, Some(&[family(internal).to_string()]))
            .await?;

        let mut out = Vec::new();
        for (row_key, cells) in &rows {
            let Some((object_name, object_id)) = row_key.split_once('#') else {
                continue;
            };
            for (column, bytes) in cells {
                let Some((_, key)) = column.split_once(':') else {
                    continue;
                };
                if keys.is_some_and(|wanted| !wanted.iter().any(|w| w == key)) {
                    continue;
                }
                let data: DictValue = rmp_serde::from_slice(bytes)?;
                out.push(MetaDataItem::new(object_name, object_id, key, data));
            }
        }

        emit(
            self.conn,
            STORE,
            StoreMethod::Get,
            row_keys.len(),
            row_keys,
            started,
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::testutil;
    use serde_json::json;

    fn location() -> DictValue {
        let mut d = DictValue::new();
        d.insert("city".to_string(), json!("hamburg"));
        d.insert("lat".to_string(), json!(53.55));
        d
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let conn = testutil::connect().await;
        let store = conn.metadata();
        store
            .put("sensor", "s17", "location", location(), false)
            .await
            .unwrap();

        let items = store.get_metadata("sensor", "s17", None, false).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].object_name, "sensor");
        assert_eq!(items[0].object_id, "s17");
        assert_eq!(items[0].key, "location");
        assert_eq!(items[0].data, location());
    }

    #[tokio::test]
    async fn test_internal_and_public_are_separate() {
        let conn = testutil::connect().await;
        let store = conn.metadata();
        store
            .put("sensor", "s17", "location", location(), false)
            .await
            .unwrap();
        let mut secret = DictValue::new();
        secret.insert("token".to_string(), json!("xyz"));
        store
            .put("sensor", "s17", "auth", secret.clone(), true)
            .await
            .unwrap();

        let public = store.get_metadata("sensor", "s17", None, false).await.unwrap();
        assert_eq!(public.len(), 1);
        assert_eq!(public[0].key, "location");

        let internal = store.get_metadata("sensor", "s17", None, true).await.unwrap();
        assert_eq!(internal.len(), 1);
        assert_eq!(internal[0].key, "auth");
        assert_eq!(internal[0].data, secret);
    }

    #[tokio::test]
    async fn test_key_filter_and_bulk() {
        let conn = testutil::connect().await;
        let store = conn.metadata();
        let items = vec![
            MetaDataItem::new("sensor", "s1", "location", location()),
            MetaDataItem::new("sensor", "s1", "notes", location()),
            MetaDataItem::new("sensor", "s2", "location", location()),
        ];
        assert_eq!(store.put_items(&items, false).await.unwrap(), 3);

        let all = store
            .get_metadata_bulk(
                "sensor",
                &["s1".to_string(), "s2".to_string(), "s3".to_string()],
                None,
                false,
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let filtered = store
            .get_metadata_bulk(
                "sensor",
                &["s1".to_string(), "s2".to_string()],
                Some(&["location".to_string()]),
                false,
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|i| i.key == "location"));
    }

    #[tokio::test]
    async fn test_overwrite_entry() {
        let conn = testutil::connect().await;
        let store = conn.metadata();
        store
            .put("sensor", "s17", "location", location(), false)
            .await
            .unwrap();
        let mut updated = DictValue::new();
        updated.insert("city".to_string(), json!("berlin"));
        store
            .put("sensor", "s17", "location", updated.clone(), false)
            .await
            .unwrap();
        let items = store.get_metadata("sensor", "s17", None, false).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].data, updated);
    }

    #[tokio::test]
    async fn test_empty_items_rejected() {
        let conn = testutil::connect().await;
        let store = conn.metadata();
        assert!(store.put_items(&[], false).await.is_err());
    }
}
