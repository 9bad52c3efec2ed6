//! Turns a raw layer into rows ready for the target table.
//!
//! [`Normalizer::normalize`] runs the steps below in order. Each step is a
//! plain function over records so it can be exercised on its own:
//!
//! 1. [`rename_fields`]: source field names to target columns; unmapped fields dropped.
//! 2. [`backfill`]: optional target fields missing from older templates become null.
//! 3. [`coerce_dates`]: the `date` field becomes a date or timestamp.
//! 4. [`resolve_blanks`]: trimming, blank-to-null, the not-applicable marker,
//!    integral floats to integers.
//! 5. [`encode_geometries`]: geometry values to WKT, promoted to multi-part on request.
//! 6. [`reformat_identifiers`]: zero-padding of single-digit identifier suffixes.
//! 7. [`inject_key`]: the visit key columns.
//! 8. [`prune_empty`]: records with nothing but the key are dropped.
//! 9. [`keep_latest_year`]: only the most recent survey year survives.
//!
//! Running the normalizer over its own output changes nothing.

use std::collections::BTreeSet;

use itertools::Itertools;
use log::debug;

use crate::{
    catalog::LayerPlan,
    config::{IdentifierConfig, KeyColumns, PipelineConfig},
    data::{Cell, Record, RecordSet, Value, VisitKey, date_or_datetime, excel_serial_to_datetime,
        parse_naive_date, parse_naive_datetime},
    error::{PipelineError, Result},
};

/// Field that carries the survey date in every template layer.
pub const DATE_FIELD: &str = "date";

/// Largest float that still converts to an integer without losing precision.
const MAX_EXACT_FLOAT: f64 = 9_007_199_254_740_992.0;

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecordSet {
    pub layer: String,
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl NormalizedRecordSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rebuilds keyed records, e.g. to feed the set back through a normalizer.
    pub fn to_record_set(&self) -> RecordSet {
        let records = self
            .rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect::<Record>()
            })
            .collect();
        RecordSet::new(self.layer.clone(), records)
    }
}

pub struct Normalizer<'a> {
    plan: &'a LayerPlan,
    key: &'a VisitKey,
    config: &'a PipelineConfig,
}

impl<'a> Normalizer<'a> {
    pub fn new(plan: &'a LayerPlan, key: &'a VisitKey, config: &'a PipelineConfig) -> Self {
        Normalizer { plan, key, config }
    }

    /// Output columns: target fields in catalog order, then the key columns.
    pub fn columns(&self) -> Vec<String> {
        let key_columns = &self.config.key_columns;
        self.plan
            .target_fields()
            .into_iter()
            .map(str::to_string)
            .filter(|column| !key_columns.contains(column))
            .chain(key_columns.names().into_iter().map(str::to_string))
            .unique()
            .collect()
    }

    pub fn normalize(&self, set: RecordSet) -> Result<NormalizedRecordSet> {
        let layer = set.layer.clone();
        let columns = self.columns();
        let descriptor = &self.plan.descriptor;
        let incoming = set.len();

        let mut records = rename_fields(self.plan, &self.config.key_columns, set)?;
        backfill(&mut records, &self.plan.backfill_fields());
        coerce_dates(&layer, &mut records, &self.config.not_applicable.token)?;
        resolve_blanks(&mut records, &self.config.not_applicable.token);
        encode_geometries(&mut records, descriptor.multi_geometry);
        reformat_identifiers(&mut records, &self.config.identifiers);
        inject_key(&mut records, &self.config.key_columns, self.key);
        prune_empty(&mut records, &self.config.key_columns);
        if descriptor.keep_latest_year {
            keep_latest_year(&mut records);
        }

        let rows = records
            .into_iter()
            .map(|mut record| {
                columns
                    .iter()
                    .map(|column| record.remove(column).flatten())
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        debug!(
            "Layer '{}' normalized for '{}': {} of {} record(s) kept",
            layer,
            self.plan.table,
            rows.len(),
            incoming
        );
        Ok(NormalizedRecordSet {
            layer,
            table: self.plan.table.clone(),
            columns,
            rows,
        })
    }
}

/// Renames mapped fields and drops the rest.
///
/// When several source fields feed one target, the first non-null value in
/// catalog order wins. A mapped target with no source column at all is a
/// [`PipelineError::Key`] unless the layer backfills it. Key columns already
/// present are carried over so normalized output can be normalized again.
pub fn rename_fields(plan: &LayerPlan, key_columns: &KeyColumns, set: RecordSet) -> Result<Vec<Record>> {
    if set.is_empty() {
        return Ok(Vec::new());
    }
    let present = set.columns().into_iter().collect::<BTreeSet<_>>();
    let missing = plan
        .target_fields()
        .into_iter()
        .filter(|target| !plan.descriptor.backfill.iter().any(|field| field == target))
        .flat_map(|target| {
            let sources = plan
                .renames
                .iter()
                .filter(|(_, mapped)| mapped == target)
                .map(|(source, _)| source.as_str())
                .collect::<Vec<_>>();
            if sources.iter().any(|source| present.contains(*source)) {
                Vec::new()
            } else {
                sources
            }
        })
        .map(str::to_string)
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(PipelineError::Key {
            layer: set.layer,
            fields: missing,
        });
    }

    let records = set
        .records
        .into_iter()
        .map(|mut source| {
            let mut record = Record::new();
            for (source_field, target_field) in &plan.renames {
                let Some(value) = source.get(source_field) else {
                    continue;
                };
                let slot = record.entry(target_field.clone()).or_insert(None);
                if slot.is_none() {
                    *slot = value.clone();
                }
            }
            for column in key_columns.names() {
                if let Some(value) = source.remove(column) {
                    record.entry(column.to_string()).or_insert(value);
                }
            }
            record
        })
        .collect();
    Ok(records)
}

pub fn backfill(records: &mut [Record], fields: &[String]) {
    for record in records.iter_mut() {
        for field in fields {
            record.entry(field.clone()).or_insert(None);
        }
    }
}

/// Coerces the `date` field of every record. Text equal to the
/// not-applicable `token` is left for [`resolve_blanks`].
pub fn coerce_dates(layer: &str, records: &mut [Record], token: &str) -> Result<()> {
    for record in records.iter_mut() {
        let Some(cell) = record.get_mut(DATE_FIELD) else {
            continue;
        };
        let Some(value) = cell.take() else {
            continue;
        };
        *cell = coerce_date_value(layer, value, token.trim())?;
    }
    Ok(())
}

fn coerce_date_value(layer: &str, value: Value, token: &str) -> Result<Cell> {
    let mismatch = |value: &Value| PipelineError::TypeMismatch {
        layer: layer.to_string(),
        field: DATE_FIELD.to_string(),
        value: value.as_display(),
        expected: "date",
    };
    match value {
        Value::Date(_) | Value::DateTime(_) | Value::NotApplicable => Ok(Some(value)),
        Value::Text(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else if let Some(date) = parse_naive_date(trimmed) {
                Ok(Some(Value::Date(date)))
            } else if let Some(datetime) = parse_naive_datetime(trimmed) {
                Ok(Some(date_or_datetime(datetime)))
            } else if !token.is_empty() && trimmed.eq_ignore_ascii_case(token) {
                Ok(Some(Value::Text(text)))
            } else {
                Err(mismatch(&Value::Text(text)))
            }
        }
        Value::Float(serial) if serial.is_nan() => Ok(None),
        Value::Integer(days) => serial_date(days as f64).ok_or_else(|| mismatch(&value)),
        Value::Float(days) => serial_date(days).ok_or_else(|| mismatch(&value)),
        Value::Boolean(_) | Value::Geometry(_) => Err(mismatch(&value)),
    }
}

fn serial_date(days: f64) -> Option<Cell> {
    excel_serial_to_datetime(days).map(|datetime| Some(date_or_datetime(datetime)))
}

/// Trims text, maps blanks to null and the marker token to
/// [`Value::NotApplicable`], and tidies numbers.
pub fn resolve_blanks(records: &mut [Record], token: &str) {
    let token = token.trim();
    for cell in records.iter_mut().flat_map(|record| record.values_mut()) {
        let Some(value) = cell.take() else {
            continue;
        };
        *cell = resolve_value(value, token);
    }
}

fn resolve_value(value: Value, token: &str) -> Cell {
    match value {
        Value::Text(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else if !token.is_empty() && trimmed.eq_ignore_ascii_case(token) {
                Some(Value::NotApplicable)
            } else if trimmed.len() == text.len() {
                Some(Value::Text(text))
            } else {
                Some(Value::Text(trimmed.to_string()))
            }
        }
        Value::Float(f) if f.is_nan() => None,
        Value::Float(f) if f.fract() == 0.0 && f.abs() < MAX_EXACT_FLOAT => {
            Some(Value::Integer(f as i64))
        }
        other => Some(other),
    }
}

/// Serializes geometry values to WKT text.
pub fn encode_geometries(records: &mut [Record], multi: bool) {
    for cell in records.iter_mut().flat_map(|record| record.values_mut()) {
        if let Some(Value::Geometry(geometry)) = cell {
            let geometry = if multi {
                geometry.clone().into_multi()
            } else {
                geometry.clone()
            };
            *cell = Some(Value::Text(geometry.to_wkt()));
        }
    }
}

/// `SITE_3` becomes `SITE_03`; anything else is returned unchanged.
pub fn pad_identifier(identifier: &str) -> String {
    match identifier.rsplit_once('_') {
        Some((prefix, suffix)) if suffix.len() == 1 && suffix.chars().all(|c| c.is_ascii_digit()) => {
            format!("{prefix}_0{suffix}")
        }
        _ => identifier.to_string(),
    }
}

/// Pads the primary identifier and, where the dependent field exists,
/// rebuilds it from the padded primary. A dependent value is left as read
/// when the record has no textual primary identifier.
pub fn reformat_identifiers(records: &mut [Record], identifiers: &IdentifierConfig) {
    for record in records.iter_mut() {
        let padded = match record.get_mut(&identifiers.primary_field) {
            Some(Some(Value::Text(text))) => {
                *text = pad_identifier(text);
                text.clone()
            }
            _ => continue,
        };
        if let Some(dependent) = record.get_mut(&identifiers.dependent_field) {
            *dependent = Some(Value::Text(format!(
                "{padded}{}",
                identifiers.dependent_suffix
            )));
        }
    }
}

pub fn inject_key(records: &mut [Record], key_columns: &KeyColumns, key: &VisitKey) {
    for record in records.iter_mut() {
        for (column, value) in key_columns.names().into_iter().zip(key.values()) {
            record.insert(column.to_string(), Some(Value::Text(value.to_string())));
        }
    }
}

/// Drops records whose every non-key field is null.
pub fn prune_empty(records: &mut Vec<Record>, key_columns: &KeyColumns) {
    records.retain(|record| {
        record
            .iter()
            .any(|(field, cell)| cell.is_some() && !key_columns.contains(field))
    });
}

/// When `date` spans several years, keeps only the records of the latest.
pub fn keep_latest_year(records: &mut Vec<Record>) {
    let years = records
        .iter()
        .map(|record| {
            record
                .get(DATE_FIELD)
                .and_then(|cell| cell.as_ref())
                .and_then(Value::year)
        })
        .collect::<Vec<_>>();
    let distinct = years.iter().flatten().collect::<BTreeSet<_>>();
    let Some(latest) = distinct.last().map(|year| **year) else {
        return;
    };
    if distinct.len() < 2 {
        return;
    }
    let mut years = years.into_iter();
    records.retain(|_| years.next().flatten() == Some(latest));
    debug!("Kept {} record(s) from {}", records.len(), latest);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::{MappingCatalog, MappingEntry},
        config::LayerDescriptor,
    };
    use chrono::NaiveDate;

    fn text(value: &str) -> Cell {
        Some(Value::Text(value.to_string()))
    }

    fn record(fields: &[(&str, Cell)]) -> Record {
        fields
            .iter()
            .map(|(name, cell)| (name.to_string(), cell.clone()))
            .collect()
    }

    fn plan(descriptor: LayerDescriptor) -> LayerPlan {
        MappingCatalog::from_entries(vec![
            MappingEntry::new("Photos", "Photo ID", "photo_id", "photos", true),
            MappingEntry::new("Photos", "Date", "date", "photos", true),
            MappingEntry::new("Photos", "DAMS link", "dams_link", "photos", true),
        ])
        .layer_plan("Photos", descriptor)
        .unwrap()
    }

    #[test]
    fn rename_reports_missing_mapped_fields() {
        let set = RecordSet::new(
            "Photos",
            vec![record(&[("Photo ID", text("P1")), ("Unmapped", text("x"))])],
        );
        let err = rename_fields(&plan(LayerDescriptor::default()), &KeyColumns::default(), set)
            .unwrap_err();
        match err {
            PipelineError::Key { layer, fields } => {
                assert_eq!(layer, "Photos");
                assert_eq!(fields, vec!["Date".to_string(), "DAMS link".to_string()]);
            }
            other => panic!("expected key error, got {other:?}"),
        }
    }

    #[test]
    fn backfilled_fields_are_not_missing() {
        let descriptor = LayerDescriptor {
            backfill: vec!["dams_link".to_string()],
            ..LayerDescriptor::default()
        };
        let plan = plan(descriptor);
        let set = RecordSet::new(
            "Photos",
            vec![record(&[("Photo ID", text("P1")), ("Date", text("2022-05-01"))])],
        );
        let mut records = rename_fields(&plan, &KeyColumns::default(), set).unwrap();
        assert!(!records[0].contains_key("Photo ID"));
        backfill(&mut records, &plan.backfill_fields());
        assert_eq!(records[0]["dams_link"], None);
        assert_eq!(records[0]["photo_id"], text("P1"));
    }

    #[test]
    fn dates_accept_text_serials_and_dates() {
        let mut records = vec![
            record(&[("date", text("2022-05-01"))]),
            record(&[("date", Some(Value::Float(44682.0)))]),
            record(&[("date", text("01/05/2022 13:30:00"))]),
            record(&[("date", text("  "))]),
            record(&[("date", text("NA"))]),
        ];
        coerce_dates("Photos", &mut records, "NA").unwrap();
        let may_day = NaiveDate::from_ymd_opt(2022, 5, 1).unwrap();
        assert_eq!(records[0]["date"], Some(Value::Date(may_day)));
        assert_eq!(records[1]["date"], Some(Value::Date(may_day)));
        assert_eq!(
            records[2]["date"],
            Some(Value::DateTime(may_day.and_hms_opt(13, 30, 0).unwrap()))
        );
        assert_eq!(records[3]["date"], None);
        assert_eq!(records[4]["date"], text("NA"));
    }

    #[test]
    fn unparseable_date_is_type_mismatch() {
        let mut records = vec![record(&[("date", text("last tuesday"))])];
        let err = coerce_dates("Vegetation", &mut records, "NA").unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::TypeMismatch);
        assert!(err.to_string().contains("Vegetation"));
    }

    #[test]
    fn blanks_and_marker_are_resolved() {
        let mut records = vec![record(&[
            ("a", text("")),
            ("b", text("   ")),
            ("c", text(" na ")),
            ("d", text("  kept ")),
            ("e", Some(Value::Float(3.0))),
            ("f", Some(Value::Float(f64::NAN))),
            ("g", Some(Value::Float(2.5))),
        ])];
        resolve_blanks(&mut records, "NA");
        let resolved = &records[0];
        assert_eq!(resolved["a"], None);
        assert_eq!(resolved["b"], None);
        assert_eq!(resolved["c"], Some(Value::NotApplicable));
        assert_eq!(resolved["d"], text("kept"));
        assert_eq!(resolved["e"], Some(Value::Integer(3)));
        assert_eq!(resolved["f"], None);
        assert_eq!(resolved["g"], Some(Value::Float(2.5)));
    }

    #[test]
    fn pads_single_digit_suffixes_only() {
        assert_eq!(pad_identifier("SITE_3"), "SITE_03");
        assert_eq!(pad_identifier("RMN_A_7"), "RMN_A_07");
        assert_eq!(pad_identifier("SITE_12"), "SITE_12");
        assert_eq!(pad_identifier("SITE_A"), "SITE_A");
        assert_eq!(pad_identifier("SITE3"), "SITE3");
    }

    #[test]
    fn dependent_identifier_follows_primary() {
        let identifiers = IdentifierConfig::default();
        let mut records = vec![
            record(&[("sampling_point", text("SP_4")), ("drain_point", text("stale"))]),
            record(&[("sampling_point", text("SP_10"))]),
        ];
        reformat_identifiers(&mut records, &identifiers);
        assert_eq!(records[0]["sampling_point"], text("SP_04"));
        assert_eq!(records[0]["drain_point"], text("SP_04_drain"));
        assert!(!records[1].contains_key("drain_point"));
    }

    #[test]
    fn dependent_identifier_survives_without_primary() {
        let identifiers = IdentifierConfig::default();
        let mut records = vec![
            record(&[("drain_point", text("DP_07"))]),
            record(&[("sampling_point", None), ("drain_point", text("DP_08"))]),
        ];
        reformat_identifiers(&mut records, &identifiers);
        assert_eq!(records[0]["drain_point"], text("DP_07"));
        assert_eq!(records[1]["drain_point"], text("DP_08"));
    }

    #[test]
    fn pruning_ignores_key_columns() {
        let keys = KeyColumns::default();
        let key = VisitKey::new("RMN_01", "G1", "V1");
        let mut records = vec![
            record(&[("a", None), ("b", Some(Value::NotApplicable))]),
            record(&[("a", None), ("b", None)]),
        ];
        inject_key(&mut records, &keys, &key);
        prune_empty(&mut records, &keys);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["site_id"], text("RMN_01"));
    }

    #[test]
    fn latest_year_wins_only_when_years_differ() {
        let dated = |y: i32| record(&[("date", Some(Value::Date(NaiveDate::from_ymd_opt(y, 6, 1).unwrap())))]);
        let mut mixed = vec![dated(2021), dated(2021), dated(2022)];
        keep_latest_year(&mut mixed);
        assert_eq!(mixed, vec![dated(2022)]);

        let mut single = vec![dated(2021), dated(2021)];
        keep_latest_year(&mut single);
        assert_eq!(single.len(), 2);
    }

    #[test]
    fn geometry_is_encoded_as_multi_wkt() {
        use crate::geometry::{Coord, Geometry};
        let mut records = vec![record(&[(
            "geom",
            Some(Value::Geometry(Geometry::Point(Some(Coord::xy(1.0, 2.0))))),
        )])];
        encode_geometries(&mut records, true);
        assert_eq!(records[0]["geom"], text("MULTIPOINT ((1 2))"));
    }
}
