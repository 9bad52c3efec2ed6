//! Field-mapping catalog: which source fields of which sheet/layer land in
//! which column of which target table.

use std::{
    collections::{BTreeSet, HashMap},
    path::Path,
};

use calamine::{Reader, open_workbook_auto};
use encoding_rs::Encoding;
use itertools::Itertools;
use log::debug;
use serde::Serialize;

use crate::{
    config::LayerDescriptor,
    error::{PipelineError, Result},
    io_utils,
};

const LAYER_HEADERS: &[&str] = &["tab or geopackage layer", "tab or layer", "layer"];
const SOURCE_FIELD_HEADERS: &[&str] = &["field name", "source_field"];
const TARGET_FIELD_HEADERS: &[&str] = &["field name for db", "target_field"];
const TABLE_HEADERS: &[&str] = &["database layer", "target_table"];
const UPLOAD_HEADERS: &[&str] = &["upload to db", "upload"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingEntry {
    pub source_layer: String,
    pub source_field: String,
    pub target_field: String,
    pub target_table: String,
    pub upload_flag: bool,
}

impl MappingEntry {
    pub fn new(
        source_layer: &str,
        source_field: &str,
        target_field: &str,
        target_table: &str,
        upload_flag: bool,
    ) -> Self {
        MappingEntry {
            source_layer: source_layer.to_string(),
            source_field: source_field.to_string(),
            target_field: target_field.to_string(),
            target_table: target_table.to_string(),
            upload_flag,
        }
    }
}

/// Everything needed to remap and route one layer, resolved once.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerPlan {
    pub layer: String,
    pub table: String,
    /// `(source_field, target_field)` in catalog order.
    pub renames: Vec<(String, String)>,
    pub descriptor: LayerDescriptor,
}

impl LayerPlan {
    /// Target columns in catalog order, without repeats.
    pub fn target_fields(&self) -> Vec<&str> {
        self.renames
            .iter()
            .map(|(_, target)| target.as_str())
            .unique()
            .collect()
    }

    /// Configured backfill fields that the catalog maps for this layer.
    pub fn backfill_fields(&self) -> Vec<String> {
        let targets = self.target_fields();
        self.descriptor
            .backfill
            .iter()
            .filter(|field| targets.contains(&field.as_str()))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MappingCatalog {
    entries: Vec<MappingEntry>,
    layers: Vec<String>,
}

impl MappingCatalog {
    /// Builds a catalog from raw entries, dropping those not flagged for upload.
    pub fn from_entries(entries: Vec<MappingEntry>) -> Self {
        let entries = entries
            .into_iter()
            .filter(|entry| entry.upload_flag)
            .collect::<Vec<_>>();
        let layers = entries
            .iter()
            .map(|entry| entry.source_layer.clone())
            .unique()
            .collect();
        MappingCatalog { entries, layers }
    }

    /// Loads a CSV/TSV or workbook catalog and checks every layer routes to
    /// exactly one table.
    pub fn load(path: &Path, encoding: &'static Encoding) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::not_found(format!(
                "Mapping catalog {path:?} does not exist"
            )));
        }
        let (headers, rows) = if is_workbook(path) {
            read_workbook_rows(path)?
        } else {
            read_csv_rows(path, encoding)?
        };
        let entries = entries_from_rows(&headers, rows)?;
        let catalog = MappingCatalog::from_entries(entries);
        if catalog.entries.is_empty() {
            return Err(PipelineError::schema(format!(
                "Mapping catalog {path:?} has no entries flagged for upload"
            )));
        }
        catalog.validate()?;
        debug!(
            "Catalog {:?}: {} entr(ies) across {} layer(s)",
            path,
            catalog.entries.len(),
            catalog.layers.len()
        );
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<()> {
        for layer in &self.layers {
            self.target_table_of(layer)?;
        }
        Ok(())
    }

    pub fn layers(&self) -> &[String] {
        &self.layers
    }

    pub fn contains_layer(&self, layer: &str) -> bool {
        self.layers.iter().any(|known| known == layer)
    }

    /// Uploadable entries for `layer`; fails if the layer is unknown or
    /// routes to more than one table.
    pub fn entries_for(&self, layer: &str) -> Result<Vec<&MappingEntry>> {
        self.target_table_of(layer)?;
        Ok(self.layer_entries(layer).collect())
    }

    pub fn target_table_of(&self, layer: &str) -> Result<&str> {
        let tables = self
            .layer_entries(layer)
            .map(|entry| entry.target_table.as_str())
            .unique()
            .collect::<Vec<_>>();
        match tables.as_slice() {
            [] => Err(PipelineError::schema(format!(
                "Layer '{layer}' is not in the mapping catalog"
            ))),
            [table] => Ok(*table),
            many => Err(PipelineError::schema(format!(
                "Layer '{layer}' maps to more than one table: {}",
                many.join(", ")
            ))),
        }
    }

    pub fn all_target_tables(&self) -> BTreeSet<String> {
        self.entries
            .iter()
            .map(|entry| entry.target_table.clone())
            .collect()
    }

    pub fn layer_plan(&self, layer: &str, descriptor: LayerDescriptor) -> Result<LayerPlan> {
        let table = self.target_table_of(layer)?.to_string();
        let renames = self
            .layer_entries(layer)
            .map(|entry| (entry.source_field.clone(), entry.target_field.clone()))
            .collect();
        Ok(LayerPlan {
            layer: layer.to_string(),
            table,
            renames,
            descriptor,
        })
    }

    fn layer_entries<'a>(&'a self, layer: &str) -> impl Iterator<Item = &'a MappingEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.source_layer == layer)
    }
}

fn is_workbook(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref(),
        Some("xlsx" | "xlsm" | "xlsb" | "xls" | "ods")
    )
}

fn read_csv_rows(path: &Path, encoding: &'static Encoding) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let delimiter = io_utils::resolve_input_delimiter(path);
    let read = || -> anyhow::Result<(Vec<String>, Vec<Vec<String>>)> {
        let mut reader = io_utils::open_csv_reader_from_path(path, delimiter)?;
        let headers = io_utils::reader_headers(&mut reader, encoding)?;
        let rows = reader
            .byte_records()
            .map(|record| {
                let record = record?;
                io_utils::decode_record(&record, encoding)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok((headers, rows))
    };
    read().map_err(|err| PipelineError::schema(format!("Reading catalog {path:?}: {err:#}")))
}

fn read_workbook_rows(path: &Path) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|err| PipelineError::schema(format!("Opening catalog workbook {path:?}: {err}")))?;
    let first = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| PipelineError::schema(format!("Catalog workbook {path:?} has no sheets")))?;
    let range = workbook
        .worksheet_range(&first)
        .map_err(|err| PipelineError::schema(format!("Reading sheet '{first}' of {path:?}: {err}")))?;
    let mut rows = range
        .rows()
        .map(|row| row.iter().map(|cell| cell.to_string()).collect::<Vec<_>>());
    let headers = rows.next().unwrap_or_default();
    Ok((headers, rows.collect()))
}

fn find_header(index: &HashMap<String, usize>, aliases: &[&str], label: &str) -> Result<usize> {
    aliases
        .iter()
        .find_map(|alias| index.get(*alias).copied())
        .ok_or_else(|| {
            PipelineError::schema(format!(
                "Mapping catalog is missing the {label} column (expected one of: {})",
                aliases.join(", ")
            ))
        })
}

fn entries_from_rows(headers: &[String], rows: Vec<Vec<String>>) -> Result<Vec<MappingEntry>> {
    let index = headers
        .iter()
        .enumerate()
        .map(|(idx, header)| (header.trim().to_ascii_lowercase(), idx))
        .collect::<HashMap<_, _>>();
    let layer_idx = find_header(&index, LAYER_HEADERS, "layer")?;
    let source_idx = find_header(&index, SOURCE_FIELD_HEADERS, "source field")?;
    let target_idx = find_header(&index, TARGET_FIELD_HEADERS, "target field")?;
    let table_idx = find_header(&index, TABLE_HEADERS, "target table")?;
    let upload_idx = find_header(&index, UPLOAD_HEADERS, "upload flag")?;

    let entries = rows
        .iter()
        .filter_map(|row| {
            let cell = |idx: usize| row.get(idx).map(|value| value.trim()).unwrap_or_default();
            let entry = MappingEntry::new(
                cell(layer_idx),
                cell(source_idx),
                cell(target_idx),
                cell(table_idx),
                cell(upload_idx).eq_ignore_ascii_case("yes"),
            );
            let complete = !(entry.source_layer.is_empty()
                || entry.source_field.is_empty()
                || entry.target_field.is_empty()
                || entry.target_table.is_empty());
            complete.then_some(entry)
        })
        .collect();
    Ok(entries)
}
