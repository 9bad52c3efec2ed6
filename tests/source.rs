mod common;

use chrono::NaiveDate;
use common::{TestWorkspace, gpkg_blob, text, wkb_polygon};
use rmn_loader::{
    config::PipelineConfig,
    data::Value,
    error::ErrorClass,
    geometry::Geometry,
    normalize::encode_geometries,
    source::{GeoPackageSource, LayerSource, open_source},
};
use rusqlite::types::Value as SqlValue;

fn square(offset: f64) -> SqlValue {
    gpkg_blob(wkb_polygon(&[
        (offset, 0.0),
        (offset + 1.0, 0.0),
        (offset + 1.0, 1.0),
        (offset, 0.0),
    ]))
}

#[test]
fn geopackage_layers_and_typed_columns() {
    let workspace = TestWorkspace::new();
    let path = workspace
        .geopackage("survey.gpkg")
        .layer(
            "drain_points",
            &[("drain_id", "TEXT"), ("blocked", "BOOLEAN"), ("checked", "DATE")],
            vec![vec![text("D1"), SqlValue::Integer(1), text("2023-08-02")]],
        )
        .finish();
    let mut source = GeoPackageSource::open(&path).expect("open gpkg");
    assert_eq!(source.layer_names(), ["drain_points".to_string()]);
    assert!(!source.has_layer("fid"));

    let config = PipelineConfig::default();
    let set = source
        .read_layer("drain_points", &config.descriptor("drain_points"))
        .expect("read layer");
    assert_eq!(set.len(), 1);
    let record = &set.records[0];
    assert!(!record.contains_key("fid"));
    assert_eq!(record["blocked"], Some(Value::Boolean(true)));
    assert_eq!(
        record["checked"],
        Some(Value::Date(NaiveDate::from_ymd_opt(2023, 8, 2).unwrap()))
    );
}

#[test]
fn monitoring_area_is_dissolved_into_one_multipolygon() {
    let workspace = TestWorkspace::new();
    let path = workspace
        .geopackage("areas.gpkg")
        .layer(
            "monitoring_area",
            &[("area_name", "TEXT"), ("geom", "POLYGON")],
            vec![
                vec![text("north"), square(0.0)],
                vec![text("south"), square(5.0)],
            ],
        )
        .finish();
    let config = PipelineConfig::default();
    let mut source = open_source(&path).expect("open source");
    let mut set = source
        .read_layer("monitoring_area", &config.descriptor("monitoring_area"))
        .expect("read layer");
    assert_eq!(set.len(), 1);
    assert_eq!(set.records[0]["area_name"], Some(Value::Text("north".to_string())));
    match &set.records[0]["geom"] {
        Some(Value::Geometry(Geometry::MultiPolygon(parts))) => assert_eq!(parts.len(), 2),
        other => panic!("expected multipolygon, got {other:?}"),
    }

    encode_geometries(&mut set.records, true);
    assert_eq!(
        set.records[0]["geom"],
        Some(Value::Text(
            "MULTIPOLYGON (((0 0, 1 0, 1 1, 0 0)), ((5 0, 6 0, 6 1, 5 0)))".to_string()
        ))
    );
}

#[test]
fn corrupt_geometry_is_type_mismatch() {
    let workspace = TestWorkspace::new();
    let path = workspace
        .geopackage("broken.gpkg")
        .layer(
            "drain_points",
            &[("drain_id", "TEXT"), ("geom", "POINT")],
            vec![vec![text("D1"), SqlValue::Blob(b"not a geometry".to_vec())]],
        )
        .finish();
    let config = PipelineConfig::default();
    let mut source = open_source(&path).expect("open source");
    let err = source
        .read_layer("drain_points", &config.descriptor("drain_points"))
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::TypeMismatch);
}

#[test]
fn plain_sqlite_file_is_not_a_geopackage() {
    let workspace = TestWorkspace::new();
    let path = workspace.target_db("not_a.gpkg");
    let err = open_source(&path).err().expect("rejected");
    assert_eq!(err.class(), ErrorClass::Schema);
}
