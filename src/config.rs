//! Run configuration: store location, key column names, value policies and
//! the per-layer registry.
//!
//! Every field has a default, so a missing or empty YAML file yields the
//! settings for the standard monitoring survey template. A `layers` map in
//! the file replaces the built-in registry as a whole.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::shape::LayerShape;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub store: StoreConfig,
    pub key_columns: KeyColumns,
    pub not_applicable: NotApplicableConfig,
    pub identifiers: IdentifierConfig,
    /// When set, a run refuses to start unless the visit's grant is registered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_reference: Option<GrantReference>,
    pub layers: BTreeMap<String, LayerDescriptor>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            store: StoreConfig::default(),
            key_columns: KeyColumns::default(),
            not_applicable: NotApplicableConfig::default(),
            identifiers: IdentifierConfig::default(),
            grant_reference: None,
            layers: survey_template_layers(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut contents = String::new();
        File::open(path)
            .map(BufReader::new)
            .and_then(|mut reader| reader.read_to_string(&mut contents))
            .with_context(|| format!("Reading config file {path:?}"))?;
        if contents.trim().is_empty() {
            return Ok(PipelineConfig::default());
        }
        serde_yaml::from_str(&contents).context("Parsing config YAML")
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Serializing config to YAML string")
    }

    /// Registered descriptor for `layer`, or the default tabular layout.
    pub fn descriptor(&self, layer: &str) -> LayerDescriptor {
        self.layers.get(layer).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
    /// Schema that holds the target tables; anything but `main` is attached
    /// from `namespace_path`.
    pub namespace: String,
    pub namespace_path: Option<PathBuf>,
    pub busy_timeout_ms: u64,
    pub ledger: bool,
    /// Spatial reference of the WKT written to geometry columns; stamped
    /// on every ledger entry.
    pub geometry_srid: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            path: None,
            namespace: "main".to_string(),
            namespace_path: None,
            busy_timeout_ms: 5_000,
            ledger: true,
            geometry_srid: 27_700,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyColumns {
    pub site: String,
    pub grant: String,
    pub visit: String,
}

impl KeyColumns {
    pub fn names(&self) -> [&str; 3] {
        [&self.site, &self.grant, &self.visit]
    }

    pub fn contains(&self, field: &str) -> bool {
        self.names().contains(&field)
    }
}

impl Default for KeyColumns {
    fn default() -> Self {
        KeyColumns {
            site: "site_id".to_string(),
            grant: "grant_id".to_string(),
            visit: "visit_label".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentinelStorage {
    /// Store NULL, indistinguishable from a blank once written.
    #[default]
    Null,
    /// Store the marker text, for target columns that model it.
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotApplicableConfig {
    /// Source token, matched trimmed and case-insensitively.
    pub token: String,
    pub storage: SentinelStorage,
}

impl Default for NotApplicableConfig {
    fn default() -> Self {
        NotApplicableConfig {
            token: "NA".to_string(),
            storage: SentinelStorage::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifierConfig {
    pub primary_field: String,
    pub dependent_field: String,
    pub dependent_suffix: String,
}

impl Default for IdentifierConfig {
    fn default() -> Self {
        IdentifierConfig {
            primary_field: "sampling_point".to_string(),
            dependent_field: "drain_point".to_string(),
            dependent_suffix: "_drain".to_string(),
        }
    }
}

/// Metadata table listing the grants a visit may be loaded under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrantReference {
    /// Schema holding the table; the store namespace when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub table: String,
    pub column: String,
}

impl Default for GrantReference {
    fn default() -> Self {
        GrantReference {
            namespace: None,
            table: "grant_reference".to_string(),
            column: "grant_id".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFilter {
    pub field: String,
    pub equals: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerDescriptor {
    /// Sheet layout; ignored for GeoPackage layers.
    pub shape: LayerShape,
    /// Target fields older templates may lack; filled with null.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub backfill: Vec<String>,
    /// Keep only source rows whose field equals the given text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<RowFilter>,
    pub force_2d: bool,
    pub multi_geometry: bool,
    /// Merge all features into one record with a multi-part geometry.
    pub dissolve: bool,
    /// Keep only records from the latest year found in `date`.
    pub keep_latest_year: bool,
}

fn survey_template_layers() -> BTreeMap<String, LayerDescriptor> {
    let mut layers = BTreeMap::new();
    layers.insert(
        "Desk study".to_string(),
        LayerDescriptor {
            shape: LayerShape::Transposed {
                label_column: 1,
                header_rows: 1,
            },
            ..LayerDescriptor::default()
        },
    );
    layers.insert(
        "Feature status - drains".to_string(),
        LayerDescriptor {
            shape: LayerShape::DoubleHeader { header_row: 1 },
            ..LayerDescriptor::default()
        },
    );
    for sheet in ["Quadrat information", "Vegetation"] {
        layers.insert(
            sheet.to_string(),
            LayerDescriptor {
                shape: LayerShape::DoubleHeader { header_row: 0 },
                ..LayerDescriptor::default()
            },
        );
    }
    layers.insert(
        "Photos".to_string(),
        LayerDescriptor {
            backfill: vec!["dams_link".to_string()],
            ..LayerDescriptor::default()
        },
    );
    layers.insert(
        "Area-level assessment".to_string(),
        LayerDescriptor {
            backfill: vec!["other_damage_notes".to_string()],
            ..LayerDescriptor::default()
        },
    );
    layers.insert(
        "monitoring_area".to_string(),
        LayerDescriptor {
            multi_geometry: true,
            dissolve: true,
            ..LayerDescriptor::default()
        },
    );
    layers.insert(
        "sampling_point".to_string(),
        LayerDescriptor {
            filter: Some(RowFilter {
                field: "source".to_string(),
                equals: "field".to_string(),
            }),
            force_2d: true,
            keep_latest_year: true,
            ..LayerDescriptor::default()
        },
    );
    layers.insert(
        "drain_points".to_string(),
        LayerDescriptor {
            force_2d: true,
            ..LayerDescriptor::default()
        },
    );
    layers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_file_yields_survey_defaults() {
        let file = NamedTempFile::new().expect("temp file");
        let config = PipelineConfig::load(file.path()).expect("load empty config");
        assert_eq!(config, PipelineConfig::default());
        assert!(config.descriptor("sampling_point").keep_latest_year);
        assert_eq!(config.key_columns.names(), ["site_id", "grant_id", "visit_label"]);
        assert_eq!(config.not_applicable.storage, SentinelStorage::Null);
    }

    #[test]
    fn partial_file_overrides_only_named_sections() {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(file, "key_columns:\n  site: rmn_id\n  visit: visit").unwrap();
        writeln!(file, "not_applicable:\n  storage: text").unwrap();
        let config = PipelineConfig::load(file.path()).expect("load config");
        assert_eq!(config.key_columns.site, "rmn_id");
        assert_eq!(config.key_columns.grant, "grant_id");
        assert_eq!(config.not_applicable.storage, SentinelStorage::Text);
        assert_eq!(config.not_applicable.token, "NA");
        assert_eq!(config.grant_reference, None);
        assert!(config.layers.contains_key("monitoring_area"));
    }

    #[test]
    fn empty_grant_reference_section_enables_the_check() {
        let config: PipelineConfig = serde_yaml::from_str("grant_reference: {}\n").unwrap();
        assert_eq!(config.grant_reference, Some(GrantReference::default()));
        assert_eq!(config.layers, PipelineConfig::default().layers);
    }

    #[test]
    fn unknown_layer_gets_default_descriptor() {
        let config = PipelineConfig::default();
        let descriptor = config.descriptor("Not registered");
        assert_eq!(descriptor.shape, LayerShape::Tabular { header_row: 0 });
        assert!(descriptor.backfill.is_empty());
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let config = PipelineConfig::default();
        let yaml = config.to_yaml_string().unwrap();
        let parsed: PipelineConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }
}
