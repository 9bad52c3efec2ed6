//! Readers that turn a survey file into one [`RecordSet`] per layer.
//!
//! Two containers are supported: spreadsheet workbooks, read through
//! `calamine` and reshaped by the layer's [`LayerShape`](crate::shape::LayerShape),
//! and GeoPackages, read directly through SQLite. Layer descriptors then apply
//! the feature-level preparation (row filters, 2D coercion, dissolve).

use std::{collections::BTreeMap, fs::File, io::BufReader, path::Path};

use calamine::{Data, Reader, Sheets, open_workbook_auto};
use log::debug;
use rusqlite::{Connection, OpenFlags, types::ValueRef};

use crate::{
    config::LayerDescriptor,
    data::{Cell, Record, RecordSet, Value, date_or_datetime, parse_naive_date, parse_naive_datetime},
    error::{PipelineError, Result},
    geometry::Geometry,
    shape::Grid,
    store::quote_identifier,
};

pub trait LayerSource {
    /// Layer (sheet or feature table) names in container order.
    fn layer_names(&self) -> &[String];

    fn has_layer(&self, name: &str) -> bool {
        self.layer_names().iter().any(|known| known == name)
    }

    fn read_layer(&mut self, name: &str, descriptor: &LayerDescriptor) -> Result<RecordSet>;
}

/// Opens `path` with the reader matching its extension.
pub fn open_source(path: &Path) -> Result<Box<dyn LayerSource>> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "gpkg" => Ok(Box::new(GeoPackageSource::open(path)?)),
        "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => Ok(Box::new(WorkbookSource::open(path)?)),
        other => Err(PipelineError::not_found(format!(
            "No reader for extension '{other}' ({path:?})"
        ))),
    }
}

pub struct WorkbookSource {
    workbook: Sheets<BufReader<File>>,
    sheets: Vec<String>,
}

impl WorkbookSource {
    pub fn open(path: &Path) -> Result<Self> {
        let workbook = open_workbook_auto(path)
            .map_err(|err| PipelineError::schema(format!("Opening workbook {path:?}: {err}")))?;
        let sheets = workbook.sheet_names().to_vec();
        debug!("Workbook {:?} has sheets {:?}", path, sheets);
        Ok(WorkbookSource { workbook, sheets })
    }
}

impl LayerSource for WorkbookSource {
    fn layer_names(&self) -> &[String] {
        &self.sheets
    }

    fn read_layer(&mut self, name: &str, descriptor: &LayerDescriptor) -> Result<RecordSet> {
        if !self.has_layer(name) {
            return Err(PipelineError::not_found(format!("Sheet '{name}' not found")));
        }
        let range = self
            .workbook
            .worksheet_range(name)
            .map_err(|err| PipelineError::schema(format!("Reading sheet '{name}': {err}")))?;
        let (row_offset, col_offset) = range
            .start()
            .map(|(row, col)| (row as usize, col as usize))
            .unwrap_or((0, 0));
        let mut rows = vec![Vec::new(); row_offset];
        rows.extend(range.rows().map(|row| {
            let mut cells = vec![None; col_offset];
            cells.extend(row.iter().map(workbook_cell));
            cells
        }));
        let set = descriptor.shape.extract(name, &Grid::from_rows(rows))?;
        debug!(
            "Sheet '{}' read as {} layout: {} record(s)",
            name,
            descriptor.shape.describe(),
            set.len()
        );
        apply_descriptor(set, descriptor)
    }
}

fn workbook_cell(data: &Data) -> Cell {
    match data {
        Data::Empty => None,
        Data::String(s) => Some(Value::Text(s.clone())),
        Data::Int(i) => Some(Value::Integer(*i)),
        Data::Float(f) => Some(Value::Float(*f)),
        Data::Bool(b) => Some(Value::Boolean(*b)),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(date_or_datetime)
            .or(Some(Value::Float(dt.as_f64()))),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Some(Value::Text(s.clone())),
        _ => None,
    }
}

pub struct GeoPackageSource {
    conn: Connection,
    layers: Vec<String>,
}

impl GeoPackageSource {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(PipelineError::database(format!("opening GeoPackage {path:?}")))?;
        let layers = {
            let mut statement = conn
                .prepare(
                    "SELECT table_name FROM gpkg_contents
                     WHERE data_type IN ('features', 'attributes')
                     ORDER BY table_name",
                )
                .map_err(|_| PipelineError::schema(format!("{path:?} is not a GeoPackage")))?;
            statement
                .query_map([], |row| row.get::<_, String>(0))
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                .map_err(PipelineError::database("listing GeoPackage layers"))?
        };
        debug!("GeoPackage {:?} has layers {:?}", path, layers);
        Ok(GeoPackageSource { conn, layers })
    }

    fn geometry_column(&self, layer: &str) -> Result<Option<String>> {
        let mut statement = self
            .conn
            .prepare("SELECT column_name FROM gpkg_geometry_columns WHERE table_name = ?1")
            .map_err(PipelineError::database("reading gpkg_geometry_columns"))?;
        let mut rows = statement
            .query_map([layer], |row| row.get::<_, String>(0))
            .map_err(PipelineError::database("reading gpkg_geometry_columns"))?;
        rows.next()
            .transpose()
            .map_err(PipelineError::database("reading gpkg_geometry_columns"))
    }

    fn columns(&self, layer: &str) -> Result<Vec<SourceColumn>> {
        let sql = format!("PRAGMA table_info({})", quote_identifier(layer));
        let mut statement = self
            .conn
            .prepare(&sql)
            .map_err(PipelineError::database(format!("describing layer '{layer}'")))?;
        let columns = statement
            .query_map([], |row| {
                Ok(SourceColumn {
                    name: row.get(1)?,
                    declared_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    primary_key: row.get::<_, i64>(5)? > 0,
                })
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(PipelineError::database(format!("describing layer '{layer}'")))?;
        Ok(columns.into_iter().filter(|column| !column.primary_key).collect())
    }
}

struct SourceColumn {
    name: String,
    declared_type: String,
    primary_key: bool,
}

impl LayerSource for GeoPackageSource {
    fn layer_names(&self) -> &[String] {
        &self.layers
    }

    fn read_layer(&mut self, name: &str, descriptor: &LayerDescriptor) -> Result<RecordSet> {
        if !self.has_layer(name) {
            return Err(PipelineError::not_found(format!("Layer '{name}' not found")));
        }
        let geometry_column = self.geometry_column(name)?;
        let columns = self.columns(name)?;
        if columns.is_empty() {
            return Ok(RecordSet::new(name, Vec::new()));
        }
        let select = columns
            .iter()
            .map(|column| quote_identifier(&column.name))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {select} FROM {}", quote_identifier(name));
        let mut statement = self
            .conn
            .prepare(&sql)
            .map_err(PipelineError::database(format!("reading layer '{name}'")))?;
        let mut rows = statement
            .query([])
            .map_err(PipelineError::database(format!("reading layer '{name}'")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(PipelineError::database(format!("reading layer '{name}'")))?
        {
            let mut record = Record::new();
            for (idx, column) in columns.iter().enumerate() {
                let raw = row
                    .get_ref(idx)
                    .map_err(PipelineError::database(format!("reading layer '{name}'")))?;
                let is_geometry = geometry_column.as_deref() == Some(column.name.as_str());
                let value = feature_cell(name, column, raw, is_geometry)?;
                record.insert(column.name.clone(), value);
            }
            records.push(record);
        }
        debug!("Layer '{}' read: {} feature(s)", name, records.len());
        apply_descriptor(RecordSet::new(name, records), descriptor)
    }
}

fn feature_cell(layer: &str, column: &SourceColumn, raw: ValueRef<'_>, is_geometry: bool) -> Result<Cell> {
    let declared = column.declared_type.to_ascii_uppercase();
    let cell = match raw {
        ValueRef::Null => None,
        ValueRef::Integer(i) if declared == "BOOLEAN" => Some(Value::Boolean(i != 0)),
        ValueRef::Integer(i) => Some(Value::Integer(i)),
        ValueRef::Real(f) => Some(Value::Float(f)),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            let temporal = match declared.as_str() {
                "DATE" => parse_naive_date(&text).map(Value::Date),
                "DATETIME" => parse_naive_datetime(&text).map(date_or_datetime),
                _ => None,
            };
            Some(temporal.unwrap_or(Value::Text(text)))
        }
        ValueRef::Blob(bytes) if is_geometry => Geometry::from_gpkg_blob(bytes)
            .map_err(|err| PipelineError::TypeMismatch {
                layer: layer.to_string(),
                field: column.name.clone(),
                value: err.to_string(),
                expected: "geometry",
            })?
            .map(Value::Geometry),
        ValueRef::Blob(_) => None,
    };
    Ok(cell)
}

/// Applies the descriptor's feature-level preparation to freshly read records.
pub fn apply_descriptor(mut set: RecordSet, descriptor: &LayerDescriptor) -> Result<RecordSet> {
    if let Some(filter) = &descriptor.filter {
        let before = set.len();
        set.records.retain(|record| {
            record
                .get(&filter.field)
                .and_then(|cell| cell.as_ref())
                .is_some_and(|value| value.as_display() == filter.equals)
        });
        debug!(
            "Layer '{}': filter {} == '{}' kept {} of {} record(s)",
            set.layer,
            filter.field,
            filter.equals,
            set.len(),
            before
        );
    }
    if descriptor.force_2d {
        for cell in set.records.iter_mut().flat_map(|record| record.values_mut()) {
            if let Some(Value::Geometry(geometry)) = cell {
                *geometry = geometry.clone().force_2d();
            }
        }
    }
    if descriptor.dissolve && set.len() > 1 {
        set = dissolve(set);
    }
    Ok(set)
}

/// Collapses every record into one: attributes of the first record, all
/// geometries merged into a single multi-part value.
fn dissolve(set: RecordSet) -> RecordSet {
    let RecordSet { layer, records } = set;
    let mut geometries: BTreeMap<String, Vec<Geometry>> = BTreeMap::new();
    for record in &records {
        for (field, cell) in record {
            if let Some(Value::Geometry(geometry)) = cell {
                geometries
                    .entry(field.clone())
                    .or_default()
                    .push(geometry.clone());
            }
        }
    }
    let mut merged = records.into_iter().next().unwrap_or_default();
    for (field, parts) in geometries {
        merged.insert(field, Geometry::collect_parts(parts).map(Value::Geometry));
    }
    debug!("Layer '{}' dissolved into one record", layer);
    RecordSet::new(layer, vec![merged])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::RowFilter, geometry::Coord};

    fn point_record(source: &str, x: f64) -> Record {
        let mut record = Record::new();
        record.insert("source".to_string(), Some(Value::Text(source.to_string())));
        record.insert(
            "geom".to_string(),
            Some(Value::Geometry(Geometry::Point(Some(Coord {
                x,
                y: 1.0,
                z: Some(9.0),
                m: None,
            })))),
        );
        record
    }

    #[test]
    fn filter_and_force_2d_apply_in_order() {
        let set = RecordSet::new(
            "sampling_point",
            vec![point_record("field", 1.0), point_record("desk", 2.0)],
        );
        let descriptor = LayerDescriptor {
            filter: Some(RowFilter {
                field: "source".to_string(),
                equals: "field".to_string(),
            }),
            force_2d: true,
            ..LayerDescriptor::default()
        };
        let prepared = apply_descriptor(set, &descriptor).unwrap();
        assert_eq!(prepared.len(), 1);
        assert_eq!(
            prepared.records[0]["geom"],
            Some(Value::Geometry(Geometry::Point(Some(Coord::xy(1.0, 1.0)))))
        );
    }

    #[test]
    fn dissolve_merges_geometries_into_first_record() {
        let set = RecordSet::new(
            "monitoring_area",
            vec![point_record("a", 1.0), point_record("b", 2.0)],
        );
        let descriptor = LayerDescriptor {
            dissolve: true,
            force_2d: true,
            ..LayerDescriptor::default()
        };
        let prepared = apply_descriptor(set, &descriptor).unwrap();
        assert_eq!(prepared.len(), 1);
        assert_eq!(
            prepared.records[0]["source"],
            Some(Value::Text("a".to_string()))
        );
        match &prepared.records[0]["geom"] {
            Some(Value::Geometry(Geometry::MultiPoint(points))) => assert_eq!(points.len(), 2),
            other => panic!("expected multipoint, got {other:?}"),
        }
    }

    #[test]
    fn unsupported_extension_is_not_found() {
        let err = open_source(Path::new("survey.pdf")).err().expect("no reader");
        assert_eq!(err.class(), crate::error::ErrorClass::NotFound);
    }
}
