//! Wide-column cluster backend over ClickHouse.
//!
//! Every logical table maps to a `(k, f, q, v)` ReplacingMergeTree ordered
//! by `(k, f, q)`; the replacing merge on the cell key is the backend's
//! cell-version-1 GC rule. Counter cells live in a SummingMergeTree sibling
//! (`*_counters`) holding signed deltas, so n increments of k always read
//! back as n*k regardless of interleaving. Column families have no native
//! representation and are tracked in a `{prefix}__families` registry table.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use async_trait::async_trait;
use clickhouse::Client;
use serde::Deserialize;

use crate::config::WideColumnOptions;
use crate::errors::{CdbError, Result};
use crate::models::RowUpsert;

use super::{EngineCapabilities, RowCells, ScanQuery, StorageEngine, StorageTable, split_column};

pub const URL_ENV_VAR: &str = "CATTLEDB_CLICKHOUSE_URL";

pub struct WideColumnEngine {
    client: Client,
    read_only: bool,
    admin: bool,
    table_prefix: String,
}

impl std::fmt::Debug for WideColumnEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WideColumnEngine")
            .field("read_only", &self.read_only)
            .field("admin", &self.admin)
            .field("table_prefix", &self.table_prefix)
            .finish()
    }
}

fn esc(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn family_filter(column: &str, families: Option<&[String]>) -> String {
    match families {
        Some(fams) if !fams.is_empty() => {
            let list = fams
                .iter()
                .map(|f| format!("'{}'", esc(f)))
                .collect::<Vec<_>>()
                .join(", ");
            format!(" AND {column} IN ({list})")
        }
        _ => String::new(),
    }
}

#[derive(Debug, clickhouse::Row, Deserialize)]
struct CellRecord {
    k: String,
    f: String,
    q: String,
    v: String,
}

#[derive(Debug, clickhouse::Row, Deserialize)]
struct CounterRecord {
    k: String,
    f: String,
    q: String,
    v: i64,
}

#[derive(Debug, clickhouse::Row, Deserialize)]
struct CountRecord {
    n: u64,
}

#[derive(Debug, clickhouse::Row, Deserialize)]
struct FamilyRecord {
    f: String,
}

#[derive(Debug, clickhouse::Row, Deserialize)]
struct SumRecord {
    total: i64,
}

impl WideColumnEngine {
    pub fn connect(
        options: &WideColumnOptions,
        read_only: bool,
        admin: bool,
        table_prefix: &str,
    ) -> Self {
        let url = std::env::var(URL_ENV_VAR).unwrap_or_else(|_| options.url.clone());
        let client = Client::default()
            .with_url(&url)
            .with_database(&options.database)
            .with_user(&options.user)
            .with_password(&options.password);
        tracing::info!(url = %url, database = %options.database, "wide-column engine configured");
        Self {
            client,
            read_only,
            admin,
            table_prefix: table_prefix.to_string(),
        }
    }

    fn full_table_name(&self, table_name: &str) -> String {
        format!("{}_{}", self.table_prefix, table_name)
    }

    fn families_table(&self) -> String {
        format!("{}__families", self.table_prefix)
    }

    fn ensure_admin(&self) -> Result<()> {
        if self.read_only {
            return Err(CdbError::ReadOnly);
        }
        if !self.admin {
            return Err(CdbError::InvalidArgument(
                "admin operations not allowed on this engine".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        self.client.query(sql).execute().await?;
        Ok(())
    }
}

#[async_trait]
impl StorageEngine for WideColumnEngine {
    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities { threading: true }
    }

    async fn disconnect(&self) {}

    async fn setup_table(&self, table_name: &str, silent: bool) -> Result<()> {
        self.ensure_admin()?;
        let full = self.full_table_name(table_name);
        let if_not_exists = if silent { "IF NOT EXISTS " } else { "" };
        self.execute(&format!(
            "CREATE TABLE IF NOT EXISTS {} (t String, f String) \
             ENGINE = ReplacingMergeTree ORDER BY (t, f)",
            self.families_table()
        ))
        .await?;
        self.execute(&format!(
            "CREATE TABLE {if_not_exists}{full} (k String, f String, q String, v String) \
             ENGINE = ReplacingMergeTree ORDER BY (k, f, q)"
        ))
        .await?;
        self.execute(&format!(
            "CREATE TABLE {if_not_exists}{full}_counters (k String, f String, q String, v Int64) \
             ENGINE = SummingMergeTree ORDER BY (k, f, q)"
        ))
        .await?;
        tracing::warn!(table = %full, "created table");
        Ok(())
    }

    async fn setup_column_family(
        &self,
        table_name: &str,
        family: &str,
        silent: bool,
    ) -> Result<()> {
        self.ensure_admin()?;
        let existing: Vec<CountRecord> = self
            .client
            .query(&format!(
                "SELECT count() AS n FROM {} FINAL WHERE t = '{}' AND f = '{}'",
                self.families_table(),
                esc(table_name),
                esc(family)
            ))
            .fetch_all()
            .await?;
        if existing.first().is_some_and(|c| c.n > 0) {
            if silent {
                tracing::warn!(table = table_name, family, "ignoring existing column family");
                return Ok(());
            }
            return Err(CdbError::Backend(format!(
                "column family {family} already exists on {table_name}"
            )));
        }
        self.execute(&format!(
            "INSERT INTO {} (t, f) VALUES ('{}', '{}')",
            self.families_table(),
            esc(table_name),
            esc(family)
        ))
        .await?;
        tracing::warn!(table = table_name, family, "created column family");
        Ok(())
    }

    fn get_table(&self, table_name: &str) -> Result<Box<dyn StorageTable>> {
        Ok(Box::new(WideColumnTable {
            client: self.client.clone(),
            table: self.full_table_name(table_name),
            logical_name: table_name.to_string(),
            families_table: self.families_table(),
        }))
    }

    fn get_admin_table(&self, table_name: &str) -> Result<Box<dyn StorageTable>> {
        self.ensure_admin()?;
        self.get_table(table_name)
    }
}

pub struct WideColumnTable {
    client: Client,
    table: String,
    logical_name: String,
    families_table: String,
}

impl WideColumnTable {
    fn counters_table(&self) -> String {
        format!("{}_counters", self.table)
    }

    async fn fetch_cells(&self, condition: &str, families: Option<&[String]>) -> Result<RowCells> {
        let mut out = RowCells::new();
        let fam = family_filter("f", families);
        let records: Vec<CellRecord> = self
            .client
            .query(&format!(
                "SELECT k, f, q, v FROM {} FINAL WHERE {condition}{fam} ORDER BY f, q",
                self.table
            ))
            .fetch_all()
            .await?;
        for r in records {
            let bytes = BASE64
                .decode(&r.v)
                .map_err(|e| CdbError::CorruptCell(format!("bad base64 in {}:{}: {e}", r.f, r.q)))?;
            out.insert(format!("{}:{}", r.f, r.q), bytes);
        }
        let counters: Vec<CounterRecord> = self
            .client
            .query(&format!(
                "SELECT k, f, q, sum(v) AS v FROM {} WHERE {condition}{fam} GROUP BY k, f, q \
                 ORDER BY f, q",
                self.counters_table()
            ))
            .fetch_all()
            .await?;
        for r in counters {
            out.insert(
                format!("{}:{}", r.f, r.q),
                crate::codec::encode_counter(r.v).to_vec(),
            );
        }
        Ok(out)
    }
}

#[async_trait]
impl StorageTable for WideColumnTable {
    async fn write_cell(&self, row_key: &str, column: &str, value: &[u8]) -> Result<()> {
        let (family, qualifier) = split_column(column)?;
        let sql = format!(
            "INSERT INTO {} (k, f, q, v) VALUES ('{}', '{}', '{}', '{}')",
            self.table,
            esc(row_key),
            esc(family),
            esc(qualifier),
            BASE64.encode(value)
        );
        self.client.query(&sql).execute().await?;
        Ok(())
    }

    async fn read_row(&self, row_key: &str, families: Option<&[String]>) -> Result<RowCells> {
        let cells = self
            .fetch_cells(&format!("k = '{}'", esc(row_key)), families)
            .await?;
        if cells.is_empty() {
            return Err(CdbError::NotFound(format!("row {row_key}")));
        }
        Ok(cells)
    }

    async fn delete_row(&self, row_key: &str, families: Option<&[String]>) -> Result<()> {
        let fam = family_filter("f", families);
        for table in [self.table.clone(), self.counters_table()] {
            let sql = format!(
                "ALTER TABLE {table} DELETE WHERE k = '{}'{fam}",
                esc(row_key)
            );
            self.client.query(&sql).execute().await?;
        }
        Ok(())
    }

    async fn upsert_row(&self, upsert: &RowUpsert) -> Result<()> {
        self.upsert_rows(std::slice::from_ref(upsert)).await
    }

    async fn upsert_rows(&self, upserts: &[RowUpsert]) -> Result<()> {
        let mut values = Vec::new();
        for upsert in upserts {
            for (column, value) in &upsert.cells {
                let (family, qualifier) = split_column(column)?;
                values.push(format!(
                    "('{}', '{}', '{}', '{}')",
                    esc(&upsert.row_key),
                    esc(family),
                    esc(qualifier),
                    BASE64.encode(value)
                ));
            }
        }
        if values.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {} (k, f, q, v) VALUES {}",
            self.table,
            values.join(", ")
        );
        self.client.query(&sql).execute().await?;
        Ok(())
    }

    async fn scan_rows(&self, query: &ScanQuery) -> Result<Vec<(String, RowCells)>> {
        let mut condition = format!("k >= '{}'", esc(&query.start_key));
        if let Some(end) = &query.end_key {
            condition.push_str(&format!(" AND k <= '{}'", esc(end)));
        }
        if let Some(prefix) = &query.check_prefix {
            condition.push_str(&format!(" AND startsWith(k, '{}')", esc(prefix)));
        }
        let fam = family_filter("f", query.families.as_deref());

        let mut rows: std::collections::BTreeMap<String, RowCells> = Default::default();
        let records: Vec<CellRecord> = self
            .client
            .query(&format!(
                "SELECT k, f, q, v FROM {} FINAL WHERE {condition}{fam} ORDER BY k, f, q",
                self.table
            ))
            .fetch_all()
            .await?;
        for r in records {
            let bytes = BASE64
                .decode(&r.v)
                .map_err(|e| CdbError::CorruptCell(format!("bad base64 in {}:{}: {e}", r.f, r.q)))?;
            rows.entry(r.k).or_default().insert(format!("{}:{}", r.f, r.q), bytes);
        }
        let counters: Vec<CounterRecord> = self
            .client
            .query(&format!(
                "SELECT k, f, q, sum(v) AS v FROM {} WHERE {condition}{fam} GROUP BY k, f, q \
                 ORDER BY k, f, q",
                self.counters_table()
            ))
            .fetch_all()
            .await?;
        for r in counters {
            rows.entry(r.k).or_default().insert(
                format!("{}:{}", r.f, r.q),
                crate::codec::encode_counter(r.v).to_vec(),
            );
        }

        let mut out = Vec::new();
        for (key, cells) in rows {
            if query
                .check_prefix
                .as_ref()
                .is_some_and(|p| !key.starts_with(p.as_str()))
            {
                break;
            }
            if cells.is_empty() {
                continue;
            }
            out.push((key, cells));
            if query.row_limit.is_some_and(|limit| out.len() >= limit) {
                break;
            }
        }
        Ok(out)
    }

    async fn increment_counter(&self, row_key: &str, column: &str, value: i64) -> Result<i64> {
        let (family, qualifier) = split_column(column)?;
        self.client
            .query(&format!(
                "INSERT INTO {} (k, f, q, v) VALUES ('{}', '{}', '{}', {})",
                self.counters_table(),
                esc(row_key),
                esc(family),
                esc(qualifier),
                value
            ))
            .execute()
            .await?;
        let sums: Vec<SumRecord> = self
            .client
            .query(&format!(
                "SELECT sum(v) AS total FROM {} WHERE k = '{}' AND f = '{}' AND q = '{}'",
                self.counters_table(),
                esc(row_key),
                esc(family),
                esc(qualifier)
            ))
            .fetch_all()
            .await?;
        Ok(sums.first().map(|s| s.total).unwrap_or(value))
    }

    async fn get_column_families(&self) -> Result<Vec<String>> {
        let records: Vec<FamilyRecord> = self
            .client
            .query(&format!(
                "SELECT f FROM {} FINAL WHERE t = '{}' ORDER BY f",
                self.families_table,
                esc(&self.logical_name)
            ))
            .fetch_all()
            .await?;
        Ok(records.into_iter().map(|r| r.f).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escaping() {
        assert_eq!(esc("plain"), "plain");
        assert_eq!(esc("it's"), "it\\'s");
        assert_eq!(esc("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_family_filter() {
        assert_eq!(family_filter("f", None), "");
        assert_eq!(family_filter("f", Some(&[])), "");
        assert_eq!(
            family_filter("f", Some(&["ph".to_string(), "tmp".to_string()])),
            " AND f IN ('ph', 'tmp')"
        );
    }

    #[test]
    fn test_engine_capabilities() {
        let engine = WideColumnEngine::connect(
            &WideColumnOptions {
                url: "http://localhost:8123".to_string(),
                database: "cattledb".to_string(),
                user: "default".to_string(),
                password: String::new(),
            },
            false,
            true,
            "cdb",
        );
        assert!(engine.capabilities().threading);
        assert_eq!(engine.full_table_name("timeseries"), "cdb_timeseries");
        assert_eq!(engine.families_table(), "cdb__families");
    }
}
