//! Writes normalized rows into their target table, one transaction per layer.

use std::sync::LazyLock;

use log::{debug, info};
use regex::Regex;
use rusqlite::{Connection, params_from_iter, types::Value as SqlValue};

use crate::{
    config::SentinelStorage,
    data::{Cell, NOT_APPLICABLE, Value},
    error::{PipelineError, Result},
    normalize::NormalizedRecordSet,
    store::{LedgerStamp, qualified, quote_identifier},
};

/// Bound-parameter ceiling per statement; SQLite builds before 3.32 cap at 999.
const MAX_BOUND_PARAMETERS: usize = 999;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid")
});

pub fn validate_identifier(kind: &str, name: &str) -> Result<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(PipelineError::schema(format!(
            "Invalid {kind} name '{name}': expected letters, digits and underscores"
        )))
    }
}

pub struct Loader<'a> {
    namespace: &'a str,
    sentinel: SentinelStorage,
    ledger: Option<&'a LedgerStamp>,
}

impl<'a> Loader<'a> {
    pub fn new(namespace: &'a str, sentinel: SentinelStorage) -> Self {
        Loader {
            namespace,
            sentinel,
            ledger: None,
        }
    }

    /// Records every successful load in the ingest ledger.
    pub fn with_ledger(mut self, stamp: &'a LedgerStamp) -> Self {
        self.ledger = Some(stamp);
        self
    }

    /// Inserts every row of `set` and returns the number written.
    ///
    /// All chunks and the ledger entry share one transaction; on any error
    /// nothing from this set remains in the table.
    pub fn load(&self, conn: &mut Connection, set: NormalizedRecordSet) -> Result<usize> {
        validate_identifier("table", &set.table)?;
        for column in &set.columns {
            validate_identifier("column", column)?;
        }
        if set.is_empty() || set.columns.is_empty() {
            return Ok(0);
        }

        let table = qualified(self.namespace, &set.table);
        let column_list = set
            .columns
            .iter()
            .map(|column| quote_identifier(column))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = format!("({})", vec!["?"; set.columns.len()].join(", "));
        let rows_per_chunk = (MAX_BOUND_PARAMETERS / set.columns.len()).max(1);

        let context = |what: &str| format!("{what} '{}'", set.table);
        let tx = conn
            .transaction()
            .map_err(PipelineError::database(context("starting load of")))?;
        for (chunk_idx, chunk) in set.rows.chunks(rows_per_chunk).enumerate() {
            let sql = format!(
                "INSERT INTO {table} ({column_list}) VALUES {}",
                vec![placeholders.as_str(); chunk.len()].join(", ")
            );
            let values = chunk
                .iter()
                .flat_map(|row| row.iter().map(|cell| self.bind(cell)))
                .collect::<Vec<_>>();
            tx.execute(&sql, params_from_iter(values))
                .map_err(PipelineError::database(context("inserting into")))?;
            debug!(
                "'{}': chunk {} inserted {} row(s)",
                set.table,
                chunk_idx + 1,
                chunk.len()
            );
        }
        if let Some(stamp) = self.ledger {
            stamp.record(&tx, self.namespace, &set.table, set.len())?;
        }
        tx.commit()
            .map_err(PipelineError::database(context("committing load of")))?;
        info!("Loaded {} row(s) into '{}'", set.len(), set.table);
        Ok(set.len())
    }

    fn bind(&self, cell: &Cell) -> SqlValue {
        match cell {
            None => SqlValue::Null,
            Some(Value::Text(text)) => SqlValue::Text(text.clone()),
            Some(Value::Integer(i)) => SqlValue::Integer(*i),
            Some(Value::Float(f)) => SqlValue::Real(*f),
            Some(Value::Boolean(b)) => SqlValue::Integer(i64::from(*b)),
            Some(Value::Date(d)) => SqlValue::Text(d.format("%Y-%m-%d").to_string()),
            Some(Value::DateTime(dt)) => SqlValue::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
            Some(Value::Geometry(geometry)) => SqlValue::Text(geometry.to_wkt()),
            Some(Value::NotApplicable) => match self.sentinel {
                SentinelStorage::Text => SqlValue::Text(NOT_APPLICABLE.to_string()),
                SentinelStorage::Null => SqlValue::Null,
            },
        }
    }
}
