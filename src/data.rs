use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::geometry::Geometry;

/// Canonical spelling of the "not applicable" marker once resolved.
pub const NOT_APPLICABLE: &str = "NA";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Geometry(Geometry),
    /// A field the surveyor explicitly marked as not applicable.
    NotApplicable,
}

impl Value {
    pub fn as_display(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                    (*f as i64).to_string()
                } else {
                    f.to_string()
                }
            }
            Value::Boolean(b) => b.to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            Value::Geometry(g) => g.to_wkt(),
            Value::NotApplicable => NOT_APPLICABLE.to_string(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Text(_) => "text",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Boolean(_) => "boolean",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
            Value::Geometry(_) => "geometry",
            Value::NotApplicable => "not-applicable",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Calendar year of a date-like value.
    pub fn year(&self) -> Option<i32> {
        use chrono::Datelike;
        match self {
            Value::Date(d) => Some(d.year()),
            Value::DateTime(dt) => Some(dt.year()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_display())
    }
}

/// A nullable cell; `None` is a blank.
pub type Cell = Option<Value>;

/// One source or normalized record keyed by field name.
pub type Record = BTreeMap<String, Cell>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSet {
    pub layer: String,
    pub records: Vec<Record>,
}

impl RecordSet {
    pub fn new(layer: impl Into<String>, records: Vec<Record>) -> Self {
        RecordSet {
            layer: layer.into(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Union of field names across all records, sorted.
    pub fn columns(&self) -> Vec<String> {
        let mut names = self
            .records
            .iter()
            .flat_map(|record| record.keys().cloned())
            .collect::<Vec<_>>();
        names.sort();
        names.dedup();
        names
    }
}

/// Identifies one survey event: site, grant and visit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VisitKey {
    pub site_id: String,
    pub grant_id: String,
    pub visit_label: String,
}

impl VisitKey {
    pub fn new(
        site_id: impl Into<String>,
        grant_id: impl Into<String>,
        visit_label: impl Into<String>,
    ) -> Self {
        VisitKey {
            site_id: site_id.into(),
            grant_id: grant_id.into(),
            visit_label: visit_label.into(),
        }
    }

    pub fn values(&self) -> [&str; 3] {
        [&self.site_id, &self.grant_id, &self.visit_label]
    }
}

impl fmt::Display for VisitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "site '{}', grant '{}', visit '{}'",
            self.site_id, self.grant_id, self.visit_label
        )
    }
}

pub fn parse_naive_date(value: &str) -> Option<NaiveDate> {
    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d", "%d-%m-%Y", "%d.%m.%Y"];
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

pub fn parse_naive_datetime(value: &str) -> Option<NaiveDateTime> {
    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%d/%m/%Y %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
        "%d/%m/%Y %H:%M",
    ];
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.naive_local());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
}

/// Converts a spreadsheet serial day number (1900 date system) to a timestamp.
pub fn excel_serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial <= 0.0 || serial >= 2_958_466.0 {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let whole_days = serial.trunc() as i64;
    let seconds = ((serial - serial.trunc()) * 86_400.0).round() as i64;
    epoch.checked_add_signed(Duration::days(whole_days) + Duration::seconds(seconds))
}

/// Collapses a midnight timestamp to a plain date.
pub fn date_or_datetime(value: NaiveDateTime) -> Value {
    use chrono::Timelike;
    let time = value.time();
    if time.hour() == 0 && time.minute() == 0 && time.second() == 0 && time.nanosecond() == 0 {
        Value::Date(value.date())
    } else {
        Value::DateTime(value)
    }
}
