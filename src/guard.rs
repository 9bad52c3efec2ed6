//! Decides which target tables may receive rows for a visit.

use std::collections::BTreeSet;

use log::{info, warn};
use rusqlite::{Connection, params};

use crate::{
    config::{GrantReference, KeyColumns},
    data::VisitKey,
    error::{PipelineError, Result},
    store::{qualified, quote_identifier},
};

/// Fails with [`PipelineError::NotFound`] unless `grant_id` is listed in the
/// reference table. Runs before any table is checked or loaded.
pub fn require_grant(
    conn: &Connection,
    store_namespace: &str,
    reference: &GrantReference,
    grant_id: &str,
) -> Result<()> {
    let namespace = reference.namespace.as_deref().unwrap_or(store_namespace);
    let table = qualified(namespace, &reference.table);
    let sql = format!(
        "SELECT EXISTS(SELECT 1 FROM {table} WHERE {} = ?1)",
        quote_identifier(&reference.column)
    );
    let registered: bool = conn
        .query_row(&sql, params![grant_id], |row| row.get(0))
        .map_err(PipelineError::database(format!("checking grant '{grant_id}' in {table}")))?;
    if !registered {
        return Err(PipelineError::not_found(format!(
            "Grant '{grant_id}' is not registered in {table}; add it there before loading"
        )));
    }
    info!("Grant '{}' found in {}", grant_id, table);
    Ok(())
}

/// Tables from `tables` that hold no row for `key` yet.
///
/// Runs one existence query per table. A table whose check fails (missing
/// table or column, locked database) is left out: the guard never lets a
/// load through on an unknown answer.
pub fn tables_pending(
    conn: &Connection,
    namespace: &str,
    key_columns: &KeyColumns,
    tables: &BTreeSet<String>,
    key: &VisitKey,
) -> BTreeSet<String> {
    tables
        .iter()
        .filter(|table| match visit_exists(conn, namespace, key_columns, table, key) {
            Ok(false) => true,
            Ok(true) => {
                info!("Skipping '{}': rows for {} already present", table, key);
                false
            }
            Err(err) => {
                warn!("Existence check on '{}' failed, treating as loaded: {}", table, err);
                false
            }
        })
        .cloned()
        .collect()
}

pub fn visit_exists(
    conn: &Connection,
    namespace: &str,
    key_columns: &KeyColumns,
    table: &str,
    key: &VisitKey,
) -> rusqlite::Result<bool> {
    let [site, grant, visit] = key_columns.names().map(quote_identifier);
    let sql = format!(
        "SELECT EXISTS(SELECT 1 FROM {} WHERE {site} = ?1 AND {grant} = ?2 AND {visit} = ?3)",
        qualified(namespace, table)
    );
    conn.query_row(
        &sql,
        params![key.site_id, key.grant_id, key.visit_label],
        |row| row.get(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    fn db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE photos (photo_id TEXT, site_id TEXT, grant_id TEXT, visit_label TEXT);
             CREATE TABLE vegetation (cover REAL, site_id TEXT, grant_id TEXT, visit_label TEXT);
             INSERT INTO photos VALUES ('P1', 'RMN_01', 'G1', 'V1');",
        )
        .unwrap();
        conn
    }

    fn universe(tables: &[&str]) -> BTreeSet<String> {
        tables.iter().map(|table| table.to_string()).collect()
    }

    #[test]
    fn unmatched_key_keeps_every_table() {
        let pending = tables_pending(
            &db(),
            "main",
            &KeyColumns::default(),
            &universe(&["photos", "vegetation"]),
            &VisitKey::new("RMN_02", "G1", "V1"),
        );
        assert_eq!(pending, universe(&["photos", "vegetation"]));
    }

    #[test]
    fn loaded_and_broken_tables_are_excluded() {
        let pending = tables_pending(
            &db(),
            "main",
            &KeyColumns::default(),
            &universe(&["photos", "vegetation", "missing_table"]),
            &VisitKey::new("RMN_01", "G1", "V1"),
        );
        assert_eq!(pending, universe(&["vegetation"]));
    }

    #[test]
    fn grant_must_be_registered() {
        let conn = db();
        conn.execute_batch(
            "CREATE TABLE grants (reference TEXT);
             INSERT INTO grants VALUES ('G1');",
        )
        .unwrap();
        let reference = GrantReference {
            namespace: None,
            table: "grants".to_string(),
            column: "reference".to_string(),
        };
        require_grant(&conn, "main", &reference, "G1").unwrap();

        let err = require_grant(&conn, "main", &reference, "G2").unwrap_err();
        assert_eq!(err.class(), ErrorClass::NotFound);
        assert!(err.to_string().contains("'G2'"));

        let err = require_grant(&conn, "main", &GrantReference::default(), "G1").unwrap_err();
        assert_eq!(err.class(), ErrorClass::Database);
    }
}
