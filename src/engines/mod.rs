//! Pluggable storage-engine interface.
//!
//! An engine hands out [`StorageTable`] descriptors; tables speak in rows of
//! `"family:qualifier" -> bytes` cells. Cells within a returned row are
//! always iterable in ascending column order (the row map is a `BTreeMap`),
//! which the time-series read path relies on.

pub mod sqlite;
pub mod widecolumn;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::errors::{CdbError, Result};
use crate::models::RowUpsert;

/// Ordered cells of one row: `"family:qualifier" -> value`.
pub type RowCells = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineCapabilities {
    /// Whether engine handles may be created per worker and used in parallel.
    pub threading: bool,
}

/// Parameters of an ordered row scan.
#[derive(Debug, Clone, Default)]
pub struct ScanQuery {
    pub start_key: String,
    /// Inclusive end key.
    pub end_key: Option<String>,
    /// Stop at the first row key not starting with this prefix.
    pub check_prefix: Option<String>,
    /// Restrict to these column families.
    pub families: Option<Vec<String>>,
    /// Upper bound on the number of rows returned.
    pub row_limit: Option<usize>,
}

impl ScanQuery {
    pub fn from_start(start_key: impl Into<String>) -> Self {
        Self {
            start_key: start_key.into(),
            ..Self::default()
        }
    }

    pub fn end_key(mut self, end_key: impl Into<String>) -> Self {
        self.end_key = Some(end_key.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.check_prefix = Some(prefix.into());
        self
    }

    pub fn families(mut self, families: Vec<String>) -> Self {
        self.families = Some(families);
        self
    }

    pub fn limit(mut self, rows: usize) -> Self {
        self.row_limit = Some(rows);
        self
    }
}

pub fn split_column(column: &str) -> Result<(&str, &str)> {
    column.split_once(':').ok_or_else(|| {
        CdbError::InvalidArgument(format!("column {column:?} is not of the form family:qualifier"))
    })
}

pub fn build_column(family: &str, qualifier: &str) -> String {
    format!("{family}:{qualifier}")
}

#[async_trait]
pub trait StorageTable: Send + Sync {
    /// Upsert exactly one cell.
    async fn write_cell(&self, row_key: &str, column: &str, value: &[u8]) -> Result<()>;

    /// Most recent cell per column of one row; `NotFound` when the row is
    /// absent.
    async fn read_row(&self, row_key: &str, families: Option<&[String]>) -> Result<RowCells>;

    /// Multi-get preserving key order; absent rows are skipped.
    async fn read_rows(
        &self,
        row_keys: &[String],
        families: Option<&[String]>,
    ) -> Result<Vec<(String, RowCells)>> {
        let mut out = Vec::with_capacity(row_keys.len());
        for key in row_keys {
            match self.read_row(key, families).await {
                Ok(cells) => out.push((key.clone(), cells)),
                Err(CdbError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Delete a whole row or only the named families.
    async fn delete_row(&self, row_key: &str, families: Option<&[String]>) -> Result<()>;

    async fn upsert_row(&self, upsert: &RowUpsert) -> Result<()>;

    /// Batch upsert, atomic per row only.
    async fn upsert_rows(&self, upserts: &[RowUpsert]) -> Result<()> {
        for upsert in upserts {
            self.upsert_row(upsert).await?;
        }
        Ok(())
    }

    /// Ordered scan of `[start_key, end_key]`, honouring prefix early-stop
    /// and the row limit. Rows without any cell in the selected families are
    /// not emitted.
    async fn scan_rows(&self, query: &ScanQuery) -> Result<Vec<(String, RowCells)>>;

    /// First emitted row at or after `start_key`. Without an explicit end
    /// key the row must share the start key as prefix.
    async fn get_first_row(
        &self,
        start_key: &str,
        families: Option<&[String]>,
        end_key: Option<&str>,
    ) -> Result<Option<(String, RowCells)>> {
        let mut query = ScanQuery::from_start(start_key).limit(1);
        match end_key {
            Some(end) => query.end_key = Some(end.to_string()),
            None => query.check_prefix = Some(start_key.to_string()),
        }
        if let Some(fams) = families {
            query.families = Some(fams.to_vec());
        }
        Ok(self.scan_rows(&query).await?.into_iter().next())
    }

    /// Atomic read-modify-write of a big-endian int64 cell, initialised to
    /// zero when missing. Returns the new value.
    async fn increment_counter(&self, row_key: &str, column: &str, value: i64) -> Result<i64>;

    async fn get_column_families(&self) -> Result<Vec<String>>;
}

#[async_trait]
pub trait StorageEngine: Send + Sync + std::fmt::Debug {
    fn capabilities(&self) -> EngineCapabilities;

    async fn disconnect(&self);

    /// Create a table; idempotent when `silent`.
    async fn setup_table(&self, table_name: &str, silent: bool) -> Result<()>;

    /// Create a column family; idempotent when `silent`.
    async fn setup_column_family(
        &self,
        table_name: &str,
        family: &str,
        silent: bool,
    ) -> Result<()>;

    fn get_table(&self, table_name: &str) -> Result<Box<dyn StorageTable>>;

    /// Same as `get_table` but only available in admin mode.
    fn get_admin_table(&self, table_name: &str) -> Result<Box<dyn StorageTable>>;
}

/// Static capabilities of a backend kind, known before connecting.
pub fn engine_capabilities(config: &EngineConfig) -> EngineCapabilities {
    match config {
        EngineConfig::WideColumn(_) => EngineCapabilities { threading: true },
        EngineConfig::Sqlite(_) => EngineCapabilities { threading: false },
    }
}

/// Connect a new engine handle for the configured backend.
pub async fn create_engine(
    config: &EngineConfig,
    read_only: bool,
    admin: bool,
    table_prefix: &str,
) -> Result<Arc<dyn StorageEngine>> {
    match config {
        EngineConfig::WideColumn(options) => Ok(Arc::new(widecolumn::WideColumnEngine::connect(
            options,
            read_only,
            admin,
            table_prefix,
        ))),
        EngineConfig::Sqlite(options) => Ok(Arc::new(sqlite::SqliteEngine::connect(
            options,
            read_only,
            admin,
            table_prefix,
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_column() {
        assert_eq!(split_column("ph:1577836800").unwrap(), ("ph", "1577836800"));
        assert_eq!(split_column("c:10.dev1").unwrap(), ("c", "10.dev1"));
        assert!(split_column("nocolon").is_err());
    }

    #[test]
    fn test_scan_query_builder() {
        let q = ScanQuery::from_start("dev1#29799949")
            .end_key("dev1#29799950")
            .families(vec!["ph".to_string()])
            .limit(10);
        assert_eq!(q.start_key, "dev1#29799949");
        assert_eq!(q.end_key.as_deref(), Some("dev1#29799950"));
        assert_eq!(q.row_limit, Some(10));
        assert!(q.check_prefix.is_none());
    }

    #[test]
    fn test_static_capabilities() {
        assert!(!engine_capabilities(&EngineConfig::default()).threading);
    }
}
