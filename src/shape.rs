//! Sheet layouts and their extraction into records.
//!
//! A workbook sheet is first loaded into a [`Grid`] anchored at cell A1, then
//! the layer's registered [`LayerShape`] turns the grid into records. Adding a
//! new survey layout means adding a variant here; the pipeline only ever calls
//! [`LayerShape::extract`].

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::{
    data::{Cell, Record, RecordSet, Value},
    error::{PipelineError, Result},
};

/// Dense cell grid; row 0 / column 0 is cell A1.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Grid {
    rows: Vec<Vec<Cell>>,
}

impl Grid {
    pub fn from_rows(rows: Vec<Vec<Cell>>) -> Self {
        Grid { rows }
    }

    pub fn height(&self) -> usize {
        self.rows.len()
    }

    pub fn width(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&Value> {
        self.rows.get(row)?.get(col)?.as_ref()
    }

    fn cell(&self, row: usize, col: usize) -> Cell {
        self.get(row, col).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerShape {
    /// One header row followed directly by data rows.
    Tabular {
        #[serde(default)]
        header_row: usize,
    },
    /// A header row followed by a descriptive row (field types or units)
    /// that is not data.
    DoubleHeader {
        #[serde(default)]
        header_row: usize,
    },
    /// Field labels run down `label_column`; every column to its right holds
    /// one record.
    Transposed {
        #[serde(default = "LayerShape::default_label_column")]
        label_column: usize,
        #[serde(default = "LayerShape::default_header_rows")]
        header_rows: usize,
    },
    /// Fixed cell addresses (`field: B4`) collected into a single record.
    Form { cells: BTreeMap<String, String> },
}

impl Default for LayerShape {
    fn default() -> Self {
        LayerShape::Tabular { header_row: 0 }
    }
}

impl LayerShape {
    const fn default_label_column() -> usize {
        0
    }

    const fn default_header_rows() -> usize {
        1
    }

    pub fn describe(&self) -> &'static str {
        match self {
            LayerShape::Tabular { .. } => "tabular",
            LayerShape::DoubleHeader { .. } => "double-header",
            LayerShape::Transposed { .. } => "transposed",
            LayerShape::Form { .. } => "form",
        }
    }

    pub fn extract(&self, layer: &str, grid: &Grid) -> Result<RecordSet> {
        let records = match self {
            LayerShape::Tabular { header_row } => extract_rows(grid, *header_row, 0),
            LayerShape::DoubleHeader { header_row } => extract_rows(grid, *header_row, 1),
            LayerShape::Transposed {
                label_column,
                header_rows,
            } => extract_transposed(grid, *label_column, *header_rows),
            LayerShape::Form { cells } => extract_form(layer, grid, cells)?,
        };
        Ok(RecordSet::new(layer, records))
    }
}

fn extract_rows(grid: &Grid, header_row: usize, skip_after_header: usize) -> Vec<Record> {
    let width = grid.width();
    let headers = unique_labels((0..width).map(|col| grid.get(header_row, col)));
    let first_data_row = header_row + 1 + skip_after_header;
    (first_data_row..grid.height())
        .map(|row| {
            headers
                .iter()
                .map(|(col, name)| (name.clone(), grid.cell(row, *col)))
                .collect::<Record>()
        })
        .filter(|record| record.values().any(Option::is_some))
        .collect()
}

fn extract_transposed(grid: &Grid, label_column: usize, header_rows: usize) -> Vec<Record> {
    let labels = unique_labels((header_rows..grid.height()).map(|row| grid.get(row, label_column)))
        .into_iter()
        .map(|(offset, name)| (offset + header_rows, name))
        .collect::<Vec<_>>();
    (label_column + 1..grid.width())
        .map(|col| {
            labels
                .iter()
                .map(|(row, name)| (name.clone(), grid.cell(*row, col)))
                .collect::<Record>()
        })
        .filter(|record| record.values().any(Option::is_some))
        .collect()
}

fn extract_form(layer: &str, grid: &Grid, cells: &BTreeMap<String, String>) -> Result<Vec<Record>> {
    let mut record = Record::new();
    for (field, address) in cells {
        let (row, col) = parse_cell_address(address).ok_or_else(|| {
            PipelineError::schema(format!(
                "layer '{layer}': field '{field}' has invalid cell address '{address}'"
            ))
        })?;
        record.insert(field.clone(), grid.cell(row, col));
    }
    if record.values().any(Option::is_some) {
        Ok(vec![record])
    } else {
        Ok(Vec::new())
    }
}

/// Turns header cells into unique field names, keeping their positions.
///
/// Blank labels are skipped; repeated labels get `.1`, `.2`, ... suffixes in
/// order of appearance.
fn unique_labels<'a, I>(cells: I) -> Vec<(usize, String)>
where
    I: Iterator<Item = Option<&'a Value>>,
{
    let mut seen: HashMap<String, usize> = HashMap::new();
    cells
        .enumerate()
        .filter_map(|(idx, cell)| {
            let label = cell.map(|value| value.as_display().trim().to_string())?;
            if label.is_empty() {
                return None;
            }
            let count = seen.entry(label.clone()).or_insert(0);
            let name = if *count == 0 {
                label
            } else {
                format!("{label}.{count}")
            };
            *count += 1;
            Some((idx, name))
        })
        .collect()
}

/// Parses an A1-style reference into zero-based `(row, col)`.
pub fn parse_cell_address(address: &str) -> Option<(usize, usize)> {
    let trimmed = address.trim();
    let split = trimmed.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = trimmed.split_at(split);
    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let row: usize = digits.parse().ok()?;
    if row == 0 {
        return None;
    }
    let col = letters
        .chars()
        .map(|c| c.to_ascii_uppercase() as usize - 'A' as usize + 1)
        .try_fold(0usize, |acc, digit| acc.checked_mul(26)?.checked_add(digit))?;
    Some((row - 1, col - 1))
}
