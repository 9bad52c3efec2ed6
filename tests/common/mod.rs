#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, params_from_iter, types::Value as SqlValue};
use rust_xlsxwriter::{Format, Workbook};
use tempfile::{TempDir, tempdir};

/// Standard catalog used across the integration tests: two GeoPackage
/// layers feeding `sampling_point` and `quadrat`.
pub const CATALOG_CSV: &str = "\
Tab or geopackage layer,Field name,Field name for DB,Database layer,Upload to DB
sampling_point,sp_id,sampling_point,sampling_point,Yes
sampling_point,survey_date,date,sampling_point,Yes
sampling_point,comment,notes,sampling_point,Yes
sampling_point,geom,geometry,sampling_point,Yes
sampling_point,source,source,sampling_point,No
quadrat,quadrat_id,quadrat_id,quadrat,Yes
quadrat,cover,cover,quadrat,Yes
Photos,Photo ID,photo_id,photos,Yes
";

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    /// Creates a fresh scratch directory for the current test case.
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    /// Returns the root path for all files owned by this workspace.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents.as_bytes())
            .expect("write temp file contents");
        path
    }

    /// Creates a target database with the tables named in [`CATALOG_CSV`].
    pub fn target_db(&self, name: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let conn = Connection::open(&path).expect("create target db");
        conn.execute_batch(TARGET_SCHEMA).expect("create target tables");
        path
    }

    pub fn geopackage(&self, name: &str) -> GeoPackageBuilder {
        GeoPackageBuilder::create(self.temp_dir.path().join(name))
    }

    pub fn workbook(&self, name: &str) -> WorkbookBuilder {
        WorkbookBuilder {
            path: self.temp_dir.path().join(name),
            workbook: Workbook::new(),
        }
    }
}

pub const TARGET_SCHEMA: &str = "
CREATE TABLE sampling_point (
  sampling_point TEXT, date TEXT, notes TEXT, geometry TEXT,
  site_id TEXT, grant_id TEXT, visit_label TEXT
);
CREATE TABLE quadrat (
  quadrat_id TEXT NOT NULL, cover REAL,
  site_id TEXT, grant_id TEXT, visit_label TEXT
);
CREATE TABLE photos (
  photo_id TEXT, site_id TEXT, grant_id TEXT, visit_label TEXT
);
";

/// Writes a minimal GeoPackage: the two registry tables plus feature and
/// attribute tables.
pub struct GeoPackageBuilder {
    path: PathBuf,
    conn: Connection,
}

impl GeoPackageBuilder {
    fn create(path: PathBuf) -> Self {
        let conn = Connection::open(&path).expect("create geopackage");
        conn.execute_batch(
            "CREATE TABLE gpkg_contents (
               table_name TEXT NOT NULL PRIMARY KEY,
               data_type TEXT NOT NULL,
               identifier TEXT,
               srs_id INTEGER
             );
             CREATE TABLE gpkg_geometry_columns (
               table_name TEXT NOT NULL,
               column_name TEXT NOT NULL,
               geometry_type_name TEXT NOT NULL,
               srs_id INTEGER NOT NULL,
               z TINYINT NOT NULL,
               m TINYINT NOT NULL
             );",
        )
        .expect("create gpkg registry tables");
        Self { path, conn }
    }

    /// Adds a layer. `columns` are `(name, declared type)`; a `geom` column
    /// typed `POINT`/`POLYGON` is registered as the geometry column.
    pub fn layer(self, name: &str, columns: &[(&str, &str)], rows: Vec<Vec<SqlValue>>) -> Self {
        let geometry = columns
            .iter()
            .find(|(_, kind)| matches!(*kind, "POINT" | "POLYGON" | "MULTIPOLYGON"));
        let data_type = if geometry.is_some() { "features" } else { "attributes" };
        let definition = columns
            .iter()
            .map(|(column, kind)| format!("\"{column}\" {kind}"))
            .collect::<Vec<_>>()
            .join(", ");
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE \"{name}\" (fid INTEGER PRIMARY KEY AUTOINCREMENT, {definition});"
            ))
            .expect("create layer table");
        self.conn
            .execute(
                "INSERT INTO gpkg_contents (table_name, data_type, identifier, srs_id) VALUES (?1, ?2, ?1, 27700)",
                [name, data_type],
            )
            .expect("register layer");
        if let Some((column, kind)) = geometry {
            self.conn
                .execute(
                    "INSERT INTO gpkg_geometry_columns VALUES (?1, ?2, ?3, 27700, 0, 0)",
                    [name, *column, *kind],
                )
                .expect("register geometry column");
        }
        let names = columns
            .iter()
            .map(|(column, _)| format!("\"{column}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!("INSERT INTO \"{name}\" ({names}) VALUES ({placeholders})");
        for row in rows {
            self.conn
                .execute(&sql, params_from_iter(row))
                .expect("insert feature");
        }
        self
    }

    pub fn finish(self) -> PathBuf {
        drop(self.conn);
        self.path
    }
}

pub fn text(value: &str) -> SqlValue {
    SqlValue::Text(value.to_string())
}

/// GeoPackage blob (little endian, no envelope) around `wkb`.
pub fn gpkg_blob(wkb: Vec<u8>) -> SqlValue {
    let mut blob = b"GP".to_vec();
    blob.push(0);
    blob.push(0b0000_0001);
    blob.extend(27700i32.to_le_bytes());
    blob.extend(wkb);
    SqlValue::Blob(blob)
}

/// Little-endian ISO WKB point, with Z when given.
pub fn wkb_point(x: f64, y: f64, z: Option<f64>) -> Vec<u8> {
    let mut bytes = vec![1u8];
    let kind: u32 = if z.is_some() { 1001 } else { 1 };
    bytes.extend(kind.to_le_bytes());
    bytes.extend(x.to_le_bytes());
    bytes.extend(y.to_le_bytes());
    if let Some(z) = z {
        bytes.extend(z.to_le_bytes());
    }
    bytes
}

/// Little-endian WKB polygon with a single ring.
pub fn wkb_polygon(ring: &[(f64, f64)]) -> Vec<u8> {
    let mut bytes = vec![1u8];
    bytes.extend(3u32.to_le_bytes());
    bytes.extend(1u32.to_le_bytes());
    bytes.extend((ring.len() as u32).to_le_bytes());
    for (x, y) in ring {
        bytes.extend(x.to_le_bytes());
        bytes.extend(y.to_le_bytes());
    }
    bytes
}

pub fn count_rows(db: &Path, table: &str) -> i64 {
    Connection::open(db)
        .expect("open target db")
        .query_row(&format!("SELECT count(*) FROM \"{table}\""), [], |row| row.get(0))
        .expect("count rows")
}

/// One spreadsheet cell for [`WorkbookBuilder::sheet`].
#[derive(Debug, Clone, Copy)]
pub enum XlsxCell {
    Blank,
    Text(&'static str),
    Number(f64),
    /// Excel serial number written with a date format.
    Date(f64),
}

/// Writes `.xlsx` files cell by cell.
pub struct WorkbookBuilder {
    path: PathBuf,
    workbook: Workbook,
}

impl WorkbookBuilder {
    /// Adds a sheet whose first row and column land at `origin` (zero-based).
    pub fn sheet(mut self, name: &str, origin: (u32, u16), rows: &[&[XlsxCell]]) -> Self {
        let date_format = Format::new().set_num_format("yyyy-mm-dd");
        let worksheet = self.workbook.add_worksheet();
        worksheet.set_name(name).expect("sheet name");
        for (row_idx, row) in rows.iter().enumerate() {
            for (col_idx, cell) in row.iter().enumerate() {
                let row = origin.0 + row_idx as u32;
                let col = origin.1 + col_idx as u16;
                match *cell {
                    XlsxCell::Blank => {}
                    XlsxCell::Text(text) => {
                        worksheet.write_string(row, col, text).expect("write text");
                    }
                    XlsxCell::Number(number) => {
                        worksheet.write_number(row, col, number).expect("write number");
                    }
                    XlsxCell::Date(serial) => {
                        worksheet
                            .write_number_with_format(row, col, serial, &date_format)
                            .expect("write date");
                    }
                }
            }
        }
        self
    }

    pub fn finish(mut self) -> PathBuf {
        self.workbook.save(&self.path).expect("save workbook");
        self.path
    }
}
