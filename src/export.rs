//! Optional before/after CSV snapshots of each layer, for checking a run by eye.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

use crate::{
    data::{Cell, RecordSet},
    io_utils,
    normalize::NormalizedRecordSet,
};

pub struct DiagnosticExporter {
    dir: PathBuf,
}

impl DiagnosticExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DiagnosticExporter { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `<layer>_before.csv` with the fields as read from the source.
    pub fn write_raw(&self, set: &RecordSet) -> Result<PathBuf> {
        let columns = set.columns();
        let rows = set.records.iter().map(|record| {
            columns
                .iter()
                .map(|column| render(record.get(column).and_then(|cell| cell.as_ref().cloned())))
                .collect::<Vec<_>>()
        });
        self.write(&set.layer, "before", &columns, rows)
    }

    /// Writes `<layer>_after.csv` with the rows about to be loaded.
    pub fn write_normalized(&self, set: &NormalizedRecordSet) -> Result<PathBuf> {
        let rows = set
            .rows
            .iter()
            .map(|row| row.iter().cloned().map(render).collect::<Vec<_>>());
        self.write(&set.layer, "after", &set.columns, rows)
    }

    fn write<I>(&self, layer: &str, stage: &str, headers: &[String], rows: I) -> Result<PathBuf>
    where
        I: Iterator<Item = Vec<String>>,
    {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Creating export directory {:?}", self.dir))?;
        let path = self.dir.join(format!("{}_{stage}.csv", file_stem(layer)));
        let mut writer = io_utils::open_csv_writer(&path)?;
        writer
            .write_record(headers)
            .with_context(|| format!("Writing headers to {path:?}"))?;
        for row in rows {
            writer
                .write_record(&row)
                .with_context(|| format!("Writing row to {path:?}"))?;
        }
        writer
            .flush()
            .with_context(|| format!("Flushing {path:?}"))?;
        Ok(path)
    }
}

fn render(cell: Cell) -> String {
    cell.map(|value| value.as_display()).unwrap_or_default()
}

/// Layer names become safe file names: `Feature status - drains` becomes
/// `feature_status_drains`.
pub fn file_stem(layer: &str) -> String {
    layer
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}
