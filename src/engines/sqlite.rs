//! Embedded SQL backend over a single SQLite file.
//!
//! Each logical table maps to `(k TEXT, c TEXT, {family columns} BLOB,
//! PRIMARY KEY (k, c))`: one record per `(row key, column qualifier)` with
//! the cell bytes base64-encoded per family column. Range scans become
//! `k BETWEEN ? AND ? ORDER BY k, c`, which preserves the ascending
//! qualifier contract. The whole engine shares one mutex-guarded
//! connection, so it reports `threading = false`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rusqlite::{Connection, params};

use crate::config::SqliteOptions;
use crate::errors::{CdbError, Result};
use crate::models::RowUpsert;

use super::{
    EngineCapabilities, RowCells, ScanQuery, StorageEngine, StorageTable, split_column,
};

pub struct SqliteEngine {
    conn: Arc<Mutex<Connection>>,
    read_only: bool,
    admin: bool,
    table_prefix: String,
}

impl std::fmt::Debug for SqliteEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteEngine")
            .field("read_only", &self.read_only)
            .field("admin", &self.admin)
            .field("table_prefix", &self.table_prefix)
            .finish()
    }
}

impl SqliteEngine {
    pub fn connect(
        options: &SqliteOptions,
        read_only: bool,
        admin: bool,
        table_prefix: &str,
    ) -> Result<Self> {
        let conn = if options.in_memory {
            Connection::open_in_memory()?
        } else {
            let path = Path::new(&options.data_dir).join("cattle.db");
            let conn = Connection::open(&path)?;
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
            tracing::info!("sqlite engine opened at {}", path.display());
            conn
        };
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            read_only,
            admin,
            table_prefix: table_prefix.to_string(),
        })
    }

    fn full_table_name(&self, table_name: &str) -> String {
        format!("{}_{}", self.table_prefix, table_name)
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
}

#[async_trait]
impl StorageEngine for SqliteEngine {
    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities { threading: false }
    }

    async fn disconnect(&self) {}

    async fn setup_table(&self, table_name: &str, silent: bool) -> Result<()> {
        self.ensure_admin()?;
        let full = self.full_table_name(table_name);
        let if_not_exists = if silent { "IF NOT EXISTS " } else { "" };
        let sql = format!(
            "CREATE TABLE {if_not_exists}{full} (k TEXT NOT NULL, c TEXT NOT NULL, PRIMARY KEY (k, c))"
        );
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(&sql)?;
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
        let full = self.full_table_name(table_name);
        let sql = format!(
            "ALTER TABLE {full} ADD COLUMN {} BLOB",
            physical_column(family)
        );
        let conn = self.conn.lock().unwrap();
        match conn.execute_batch(&sql) {
            Ok(()) => {
                tracing::warn!(table = %full, family, "created column family");
                Ok(())
            }
            Err(e) if silent && e.to_string().contains("duplicate column") => {
                tracing::warn!(table = %full, family, "ignoring existing column family");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get_table(&self, table_name: &str) -> Result<Box<dyn StorageTable>> {
        Ok(Box::new(SqliteTable {
            conn: self.conn.clone(),
            table: self.full_table_name(table_name),
        }))
    }

    fn get_admin_table(&self, table_name: &str) -> Result<Box<dyn StorageTable>> {
        self.ensure_admin()?;
        self.get_table(table_name)
    }
}

pub struct SqliteTable {
    conn: Arc<Mutex<Connection>>,
    table: String,
}

/// Family columns carry an `f_` prefix so a family may share its name with
/// the fixed `k`/`c` columns.
fn physical_column(family: &str) -> String {
    format!("f_{family}")
}

fn select_list(families: &[String]) -> String {
    families
        .iter()
        .map(|f| physical_column(f))
        .collect::<Vec<_>>()
        .join(", ")
}

impl SqliteTable {
    fn family_columns(&self, conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
        let cols = stmt
            .query_map(params![self.table], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(cols
            .into_iter()
            .filter_map(|c| c.strip_prefix("f_").map(str::to_string))
            .collect())
    }

    fn selected_families(
        &self,
        conn: &Connection,
        families: Option<&[String]>,
    ) -> Result<Vec<String>> {
        match families {
            Some(fams) => Ok(fams.to_vec()),
            None => self.family_columns(conn),
        }
    }

    /// Collect `(qualifier, family values)` records into ordered cells.
    fn collect_cells(
        families: &[String],
        records: &[(String, Vec<Option<String>>)],
    ) -> Result<RowCells> {
        let mut out = RowCells::new();
        for (qualifier, values) in records {
            for (family, value) in families.iter().zip(values) {
                if let Some(encoded) = value {
                    let bytes = BASE64.decode(encoded).map_err(|e| {
                        CdbError::CorruptCell(format!("bad base64 in {family}:{qualifier}: {e}"))
                    })?;
                    out.insert(format!("{family}:{qualifier}"), bytes);
                }
            }
        }
        Ok(out)
    }

    fn upsert_cell_sql(&self, family: &str) -> String {
        format!(
            "INSERT INTO {t} (k, c, {f}) VALUES (?1, ?2, ?3) \
             ON CONFLICT(k, c) DO UPDATE SET {f} = excluded.{f}",
            t = self.table,
            f = physical_column(family)
        )
    }
}

#[async_trait]
impl StorageTable for SqliteTable {
    async fn write_cell(&self, row_key: &str, column: &str, value: &[u8]) -> Result<()> {
        let (family, qualifier) = split_column(column)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &self.upsert_cell_sql(family),
            params![row_key, qualifier, BASE64.encode(value)],
        )?;
        Ok(())
    }

    async fn read_row(&self, row_key: &str, families: Option<&[String]>) -> Result<RowCells> {
        let conn = self.conn.lock().unwrap();
        let fams = self.selected_families(&conn, families)?;
        if fams.is_empty() {
            return Err(CdbError::NotFound(format!("row {row_key}")));
        }
        let sql = format!(
            "SELECT c, {} FROM {} WHERE k = ?1 ORDER BY c",
            select_list(&fams),
            self.table
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![row_key], |row| {
                let qualifier: String = row.get(0)?;
                let mut values = Vec::with_capacity(fams.len());
                for i in 0..fams.len() {
                    values.push(row.get::<_, Option<String>>(i + 1)?);
                }
                Ok((qualifier, values))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if records.is_empty() {
            return Err(CdbError::NotFound(format!("row {row_key}")));
        }
        Self::collect_cells(&fams, &records)
    }

    async fn delete_row(&self, row_key: &str, families: Option<&[String]>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        match families {
            None => {
                conn.execute(
                    &format!("DELETE FROM {} WHERE k = ?1", self.table),
                    params![row_key],
                )?;
            }
            Some(fams) => {
                let all = self.family_columns(&conn)?;
                let tx = conn.transaction()?;
                let clear = fams
                    .iter()
                    .map(|f| format!("{} = NULL", physical_column(f)))
                    .collect::<Vec<_>>()
                    .join(", ");
                tx.execute(
                    &format!("UPDATE {} SET {} WHERE k = ?1", self.table, clear),
                    params![row_key],
                )?;
                // drop records that no longer carry any cell
                let empty = all
                    .iter()
                    .map(|f| format!("{} IS NULL", physical_column(f)))
                    .collect::<Vec<_>>()
                    .join(" AND ");
                tx.execute(
                    &format!("DELETE FROM {} WHERE k = ?1 AND {}", self.table, empty),
                    params![row_key],
                )?;
                tx.commit()?;
            }
        }
        Ok(())
    }

    async fn upsert_row(&self, upsert: &RowUpsert) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for (column, value) in &upsert.cells {
            let (family, qualifier) = split_column(column)?;
            tx.execute(
                &self.upsert_cell_sql(family),
                params![upsert.row_key, qualifier, BASE64.encode(value)],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn scan_rows(&self, query: &ScanQuery) -> Result<Vec<(String, RowCells)>> {
        let conn = self.conn.lock().unwrap();
        let fams = self.selected_families(&conn, query.families.as_deref())?;
        if fams.is_empty() {
            return Ok(Vec::new());
        }
        let mut sql = format!(
            "SELECT k, c, {} FROM {} WHERE k >= ?1",
            select_list(&fams),
            self.table
        );
        if query.end_key.is_some() {
            sql.push_str(" AND k <= ?2");
        }
        sql.push_str(" ORDER BY k, c");

        let mut stmt = conn.prepare(&sql)?;
        let map_record = |row: &rusqlite::Row<'_>| {
            let key: String = row.get(0)?;
            let qualifier: String = row.get(1)?;
            let mut values = Vec::with_capacity(fams.len());
            for i in 0..fams.len() {
                values.push(row.get::<_, Option<String>>(i + 2)?);
            }
            Ok((key, qualifier, values))
        };
        let records = match &query.end_key {
            Some(end) => stmt
                .query_map(params![query.start_key, end], map_record)?
                .collect::<std::result::Result<Vec<_>, _>>()?,
            None => stmt
                .query_map(params![query.start_key], map_record)?
                .collect::<std::result::Result<Vec<_>, _>>()?,
        };

        let mut out: Vec<(String, RowCells)> = Vec::new();
        let mut current: Option<(String, Vec<(String, Vec<Option<String>>)>)> = None;
        let mut stopped = false;
        for (key, qualifier, values) in records {
            let same_row = current.as_ref().is_some_and(|(k, _)| *k == key);
            if !same_row {
                if let Some((k, group)) = current.take() {
                    let cells = Self::collect_cells(&fams, &group)?;
                    if !cells.is_empty() {
                        out.push((k, cells));
                    }
                }
                if query.row_limit.is_some_and(|limit| out.len() >= limit) {
                    stopped = true;
                    break;
                }
                if query
                    .check_prefix
                    .as_ref()
                    .is_some_and(|p| !key.starts_with(p.as_str()))
                {
                    stopped = true;
                    break;
                }
                current = Some((key, Vec::new()));
            }
            if let Some((_, group)) = current.as_mut() {
                group.push((qualifier, values));
            }
        }
        if !stopped {
            if let Some((k, group)) = current.take() {
                let cells = Self::collect_cells(&fams, &group)?;
                if !cells.is_empty() && !query.row_limit.is_some_and(|limit| out.len() >= limit) {
                    out.push((k, cells));
                }
            }
        }
        Ok(out)
    }

    async fn increment_counter(&self, row_key: &str, column: &str, value: i64) -> Result<i64> {
        let (family, qualifier) = split_column(column)?;
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM {} WHERE k = ?1 AND c = ?2",
            physical_column(family),
            self.table
        );
        let current: Option<String> = conn
            .query_row(&sql, params![row_key, qualifier], |row| row.get(0))
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let current = match current {
            Some(encoded) => {
                let bytes = BASE64.decode(&encoded).map_err(|e| {
                    CdbError::CorruptCell(format!("bad base64 counter cell: {e}"))
                })?;
                crate::codec::decode_counter(&bytes)?
            }
            None => 0,
        };
        let updated = current + value;
        conn.execute(
            &self.upsert_cell_sql(family),
            params![
                row_key,
                qualifier,
                BASE64.encode(crate::codec::encode_counter(updated))
            ],
        )?;
        Ok(updated)
    }

    async fn get_column_families(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        self.family_columns(&conn)
    }
}
