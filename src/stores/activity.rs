//! Per-reader/device activity counters.
//!
//! Each increment touches one "total" row (`t#{reverse_day}#{reader}`) and
//! up to three parent rows (`{parent}#{reverse_day}#{reader}`), all on the
//! counter cell `c:{HH}.{device_id}`. Counters are atomic big-endian int64
//! cells.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::codec::decode_counter;
use crate::connection::Connection;
use crate::engines::{ScanQuery, split_column};
use crate::errors::{CdbError, Result};
use crate::models::{DeviceActivityItem, ReaderActivityItem};
use crate::signals::StoreMethod;
use crate::stores::{emit, guard_window, now_ts};
use crate::time::{SECONDS_DAY, day_from_reverse_key, hour_key, iter_days, reverse_day_key};

pub const TABLE: &str = "activity";

pub const MAX_GET_WINDOW: i64 = 90 * SECONDS_DAY;

const MAX_BACKDATE: i64 = 3 * 365 * SECONDS_DAY;
const MAX_FORWARD: i64 = 30 * SECONDS_DAY;

const STORE: &str = "activity";

fn check_id(what: &str, id: &str) -> Result<()> {
    if id.len() < 3 || id.len() > 32 {
        return Err(CdbError::InvalidArgument(format!(
            "{what} must be 3-32 chars: {id:?}"
        )));
    }
    Ok(())
}

pub struct ActivityStore<'a> {
    pub(crate) conn: &'a Connection,
}

impl ActivityStore<'_> {
    pub fn row_key(base_key: &str, day_ts: i64, reader_id: Option<&str>) -> String {
        let mut row_key = format!("{}#{}", base_key, reverse_day_key(day_ts));
        if let Some(reader) = reader_id {
            row_key = format!("{row_key}#{reader}");
        }
        row_key
    }

    fn insert_keys(reader_id: &str, day_ts: i64, parent_ids: &[String]) -> Result<Vec<String>> {
        check_id("reader id", reader_id)?;
        if parent_ids.len() > 3 {
            return Err(CdbError::InvalidArgument(
                "at most 3 parent ids allowed".to_string(),
            ));
        }
        let mut row_keys = vec![Self::row_key("t", day_ts, Some(reader_id))];
        for parent in parent_ids {
            check_id("parent id", parent)?;
            row_keys.push(Self::row_key(parent, day_ts, Some(reader_id)));
        }
        Ok(row_keys)
    }

    /// Count one device sighting. Returns the new counter value per touched
    /// row.
    pub async fn incr(
        &self,
        reader_id: &str,
        device_id: &str,
        ts: i64,
        parent_ids: &[String],
        value: i64,
    ) -> Result<Vec<i64>> {
        self.conn.ensure_writable()?;
        let now = now_ts();
        if ts <= now - MAX_BACKDATE || ts >= now + MAX_FORWARD {
            return Err(CdbError::InvalidArgument(
                "timestamp out of activity window -3y +30d".to_string(),
            ));
        }

        let row_keys = Self::insert_keys(reader_id, ts, parent_ids)?;
        let column = format!("c:{}.{}", hour_key(ts), device_id);

        let started = Instant::now();
        let table = self.conn.table(TABLE).await?;
        let mut results = Vec::with_capacity(row_keys.len());
        for row_key in &row_keys {
            results.push(table.increment_counter(row_key, &column, value).await?);
        }

        emit(
            self.conn,
            STORE,
            StoreMethod::Incr,
            row_keys.len(),
            row_keys,
            started,
        );
        Ok(results)
    }

    pub async fn get_total_activity_for_day(&self, day_ts: i64) -> Result<Vec<ReaderActivityItem>> {
        self.get_activity_for_day("t", day_ts).await
    }

    /// Readers and their devices under one parent on one day, sorted by
    /// day-hour then reader id.
    pub async fn get_activity_for_day(
        &self,
        parent_id: &str,
        day_ts: i64,
    ) -> Result<Vec<ReaderActivityItem>> {
        self.conn.ensure_initialised()?;

        let started = Instant::now();
        let prefix = Self::row_key(parent_id, day_ts, None);
        let query = ScanQuery::from_start(prefix.clone())
            .prefix(prefix)
            .families(vec!["c".to_string()]);
        let table = self.conn.table(TABLE).await?;
        let rows = table.scan_rows(&query).await?;

        let mut grouped: BTreeMap<String, BTreeMap<String, Vec<String>>> = BTreeMap::new();
        let mut row_keys = Vec::new();
        for (row_key, cells) in &rows {
            row_keys.push(row_key.clone());
            let mut segments = row_key.rsplit('#');
            let reader_id = segments.next().unwrap_or_default();
            let Some(day) = segments.next().and_then(day_from_reverse_key) else {
                continue;
            };
            for column in cells.keys() {
                let (_, qualifier) = split_column(column)?;
                let Some((hour, device_id)) = qualifier.split_once('.') else {
                    continue;
                };
                grouped
                    .entry(format!("{day}{hour}"))
                    .or_default()
                    .entry(reader_id.to_string())
                    .or_default()
                    .push(device_id.to_string());
            }
        }

        let mut out = Vec::new();
        for (day_hour, readers) in grouped {
            for (reader_id, device_ids) in readers {
                out.push(ReaderActivityItem {
                    day_hour: day_hour.clone(),
                    reader_id,
                    device_ids,
                });
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

    /// Per-device counters of one reader over a day range, summed per
    /// day-hour, sorted by day-hour then device id.
    pub async fn get_activity_for_reader(
        &self,
        reader_id: &str,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<Vec<DeviceActivityItem>> {
        self.conn.ensure_initialised()?;
        guard_window(from_ts, to_ts, MAX_GET_WINDOW, "get_activity_for_reader")?;

        let started = Instant::now();
        let row_keys: Vec<String> = iter_days(from_ts, to_ts)
            .map(|day| Self::row_key("t", day, Some(reader_id)))
            .collect();
        let table = self.conn.table(TABLE).await?;
        let rows = table.read_rows(&row_keys, Some(&["c".to_string()])).await?;

        let mut grouped: BTreeMap<(String, String), i64> = BTreeMap::new();
        for (row_key, cells) in &rows {
            let mut segments = row_key.rsplit('#');
            let _reader = segments.next();
            let Some(day) = segments.next().and_then(day_from_reverse_key) else {
                continue;
            };
            for (column, value) in cells {
                let (_, qualifier) = split_column(column)?;
                let Some((hour, device_id)) = qualifier.split_once('.') else {
                    continue;
                };
                *grouped
                    .entry((format!("{day}{hour}"), device_id.to_string()))
                    .or_default() += decode_counter(value)?;
            }
        }

        let out = grouped
            .into_iter()
            .map(|((day_hour, device_id), counter)| DeviceActivityItem {
                day_hour,
                device_id,
                counter,
            })
            .collect();

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

    fn ts(day: i64, hour: i64) -> i64 {
        // anchored near now so the insert window check passes
        let today = crate::time::day_left(now_ts());
        today - day * SECONDS_DAY + hour * 3600
    }

    #[tokio::test]
    async fn test_incr_writes_total_and_parent_rows() {
        let conn = testutil::connect().await;
        let store = conn.activity();
        let parents = vec!["parent1".to_string(), "parent2".to_string()];
        let when = ts(2, 10);

        for _ in 0..3 {
            store.incr("reader1", "dev1", when, &parents, 1).await.unwrap();
        }

        let rday = reverse_day_key(when);
        let table = conn.table(TABLE).await.unwrap();
        for base in ["t", "parent1", "parent2"] {
            let cells = table
                .read_row(&format!("{base}#{rday}#reader1"), None)
                .await
                .unwrap();
            assert_eq!(decode_counter(&cells["c:10.dev1"]).unwrap(), 3);
        }
    }

    #[tokio::test]
    async fn test_activity_for_day_grouping() {
        let conn = testutil::connect().await;
        let store = conn.activity();
        let p12 = vec!["parent1".to_string(), "parent2".to_string()];
        let p1 = vec!["parent1".to_string()];

        store.incr("reader1", "dev1", ts(1, 12), &p12, 1).await.unwrap();
        store.incr("reader1", "dev1", ts(1, 13), &p1, 1).await.unwrap();
        store.incr("reader1", "dev1", ts(1, 15), &p1, 1).await.unwrap();
        store.incr("reader2", "dev2", ts(1, 12), &p12, 1).await.unwrap();
        store.incr("reader2", "dev2", ts(1, 13), &p1, 1).await.unwrap();
        store.incr("reader2", "dev1", ts(2, 12), &p12, 10).await.unwrap();

        let res = store.get_total_activity_for_day(ts(1, 0)).await.unwrap();
        assert_eq!(res.len(), 5);
        let day = day_from_reverse_key(&reverse_day_key(ts(1, 0))).unwrap();
        assert_eq!(res[0].day_hour, format!("{day}12"));
        assert_eq!(res[0].reader_id, "reader1");
        assert_eq!(res[0].device_ids, vec!["dev1".to_string()]);
        assert_eq!(res[1].reader_id, "reader2");
        assert_eq!(res[1].device_ids, vec!["dev2".to_string()]);
        assert_eq!(res[2].day_hour, format!("{day}13"));
        assert_eq!(res[3].day_hour, format!("{day}13"));
        assert_eq!(res[3].reader_id, "reader2");
        assert_eq!(res[4].day_hour, format!("{day}15"));
        assert_eq!(res[4].reader_id, "reader1");

        let res = store.get_activity_for_day("parent2", ts(1, 0)).await.unwrap();
        assert_eq!(res.len(), 2);
        assert_eq!(res[0].day_hour, format!("{day}12"));
        assert_eq!(res[0].reader_id, "reader1");
        assert_eq!(res[1].reader_id, "reader2");
    }

    #[tokio::test]
    async fn test_activity_for_reader_sums_counters() {
        let conn = testutil::connect().await;
        let store = conn.activity();
        let parents = vec!["parent1".to_string()];

        store.incr("reader2", "dev2", ts(1, 12), &parents, 1).await.unwrap();
        store.incr("reader2", "dev2", ts(1, 12), &parents, 1).await.unwrap();
        store.incr("reader2", "dev2", ts(1, 13), &parents, 1).await.unwrap();
        store.incr("reader2", "dev1", ts(2, 12), &parents, 10).await.unwrap();

        let res = store
            .get_activity_for_reader("reader2", ts(2, 0), ts(1, 23))
            .await
            .unwrap();
        assert_eq!(res.len(), 3);
        let day2 = day_from_reverse_key(&reverse_day_key(ts(2, 0))).unwrap();
        let day1 = day_from_reverse_key(&reverse_day_key(ts(1, 0))).unwrap();
        assert_eq!(res[0].day_hour, format!("{day2}12"));
        assert_eq!(res[0].device_id, "dev1");
        assert_eq!(res[0].counter, 10);
        assert_eq!(res[1].day_hour, format!("{day1}12"));
        assert_eq!(res[1].counter, 2);
        assert_eq!(res[2].day_hour, format!("{day1}13"));
        assert_eq!(res[2].counter, 1);
    }

    #[tokio::test]
    async fn test_incr_window_check() {
        let conn = testutil::connect().await;
        let store = conn.activity();
        let too_old = now_ts() - MAX_BACKDATE - SECONDS_DAY;
        let err = store.incr("reader1", "dev1", too_old, &[], 1).await.unwrap_err();
        assert!(matches!(err, CdbError::InvalidArgument(_)));
        let too_new = now_ts() + MAX_FORWARD + SECONDS_DAY;
        let err = store.incr("reader1", "dev1", too_new, &[], 1).await.unwrap_err();
        assert!(matches!(err, CdbError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_incr_id_validation() {
        let conn = testutil::connect().await;
        let store = conn.activity();
        let when = ts(0, 1);
        assert!(store.incr("r", "dev1", when, &[], 1).await.is_err());
        let too_many: Vec<String> = (0..4).map(|i| format!("parent{i}")).collect();
        assert!(store.incr("reader1", "dev1", when, &too_many, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_increments_sum_exactly() {
        let conn = testutil::connect().await;
        let when = ts(1, 10);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let conn = conn.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    conn.activity()
                        .incr("reader1", "dev1", when, &[], 2)
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let res = conn
            .activity()
            .get_activity_for_reader("reader1", when - 3600, when + 3600)
            .await
            .unwrap();
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].counter, 8 * 25 * 2);
    }
}
