//! Connection lifecycle for the target database.
//!
//! A [`Store`] is opened at the start of a run and closed at its end; the
//! connection never outlives the run that created it.

use std::{fs, io, path::Path, time::Duration};

use chrono::Utc;
use log::{debug, info};
use rusqlite::{Connection, OpenFlags, params};
use sha2::{Digest, Sha256};

use crate::{
    config::StoreConfig,
    data::VisitKey,
    error::{PipelineError, Result},
};

pub const LEDGER_TABLE: &str = "ingest_ledger";

#[derive(Debug)]
pub struct Store {
    conn: Connection,
    namespace: String,
}

impl Store {
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let path = config
            .path
            .as_deref()
            .ok_or_else(|| PipelineError::not_found("No database path configured"))?;
        if !path.exists() {
            return Err(PipelineError::not_found(format!(
                "Database {path:?} does not exist"
            )));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(PipelineError::database(format!("opening database {path:?}")))?;
        info!("Connected to database {:?}", path);
        Store::from_connection(conn, config)
    }

    /// Wraps an existing connection, applying pragmas and attaching the namespace.
    pub fn from_connection(conn: Connection, config: &StoreConfig) -> Result<Self> {
        configure_connection(&conn, config)?;
        let namespace = config.namespace.trim().to_string();
        if namespace != "main" && namespace != "temp" {
            let attach_path = config.namespace_path.as_deref().ok_or_else(|| {
                PipelineError::schema(format!(
                    "Namespace '{namespace}' needs a namespace_path to attach"
                ))
            })?;
            if !attach_path.exists() {
                return Err(PipelineError::not_found(format!(
                    "Namespace database {attach_path:?} does not exist"
                )));
            }
            conn.execute(
                &format!("ATTACH DATABASE ?1 AS {}", quote_identifier(&namespace)),
                params![attach_path.to_string_lossy()],
            )
            .map_err(PipelineError::database(format!(
                "attaching {attach_path:?} as '{namespace}'"
            )))?;
            debug!("Attached {:?} as namespace '{}'", attach_path, namespace);
        }
        Ok(Store { conn, namespace })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn ensure_ledger(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
               id INTEGER PRIMARY KEY,
               target_table TEXT NOT NULL,
               site_id TEXT NOT NULL,
               grant_id TEXT NOT NULL,
               visit_label TEXT NOT NULL,
               rows_loaded INTEGER NOT NULL,
               source_sha256 TEXT NOT NULL,
               geometry_srid INTEGER NOT NULL,
               loaded_at TEXT NOT NULL
             )",
            qualified(&self.namespace, LEDGER_TABLE)
        );
        self.conn
            .execute_batch(&sql)
            .map_err(PipelineError::database("creating ingest ledger"))
    }

    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, source)| PipelineError::Database {
                context: "closing database".to_string(),
                source,
            })
    }
}

fn configure_connection(conn: &Connection, config: &StoreConfig) -> Result<()> {
    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .map_err(PipelineError::database("setting busy timeout"))?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(PipelineError::database("enabling foreign keys"))?;
    Ok(())
}

/// Per-run stamp written next to every successful load.
#[derive(Debug, Clone)]
pub struct LedgerStamp {
    pub key: VisitKey,
    pub source_sha256: String,
    pub geometry_srid: i64,
}

impl LedgerStamp {
    pub fn record(&self, conn: &Connection, namespace: &str, table: &str, rows: usize) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (target_table, site_id, grant_id, visit_label, rows_loaded, source_sha256,
                             geometry_srid, loaded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            qualified(namespace, LEDGER_TABLE)
        );
        conn.execute(
            &sql,
            params![
                table,
                &self.key.site_id,
                &self.key.grant_id,
                &self.key.visit_label,
                rows as i64,
                &self.source_sha256,
                self.geometry_srid,
                Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            ],
        )
        .map(|_| ())
        .map_err(PipelineError::database(format!("recording ledger entry for '{table}'")))
    }
}

/// Double-quotes an SQL identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn qualified(namespace: &str, table: &str) -> String {
    format!("{}.{}", quote_identifier(namespace), quote_identifier(table))
}

pub fn file_sha256(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}
