//! Vector geometry model with GeoPackage/WKB decoding and WKT encoding.
//!
//! Only the simple-feature types that appear in survey layers are modelled.
//! Decoding accepts the GeoPackage binary header followed by ISO or extended
//! WKB in either byte order; encoding produces WKT with `Z`/`M`/`ZM` tags
//! when the coordinates carry extra ordinates.

use std::fmt::{self, Write as _};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed geometry: {0}")]
pub struct GeometryError(String);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
    pub m: Option<f64>,
}

impl Coord {
    pub fn xy(x: f64, y: f64) -> Self {
        Coord {
            x,
            y,
            z: None,
            m: None,
        }
    }

    fn flattened(self) -> Self {
        Coord::xy(self.x, self.y)
    }
}

pub type Ring = Vec<Coord>;

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Option<Coord>),
    LineString(Vec<Coord>),
    Polygon(Vec<Ring>),
    MultiPoint(Vec<Coord>),
    MultiLineString(Vec<Vec<Coord>>),
    MultiPolygon(Vec<Vec<Ring>>),
    GeometryCollection(Vec<Geometry>),
}

impl Geometry {
    pub fn type_name(&self) -> &'static str {
        match self {
            Geometry::Point(_) => "POINT",
            Geometry::LineString(_) => "LINESTRING",
            Geometry::Polygon(_) => "POLYGON",
            Geometry::MultiPoint(_) => "MULTIPOINT",
            Geometry::MultiLineString(_) => "MULTILINESTRING",
            Geometry::MultiPolygon(_) => "MULTIPOLYGON",
            Geometry::GeometryCollection(_) => "GEOMETRYCOLLECTION",
        }
    }

    pub fn is_multi(&self) -> bool {
        matches!(
            self,
            Geometry::MultiPoint(_)
                | Geometry::MultiLineString(_)
                | Geometry::MultiPolygon(_)
                | Geometry::GeometryCollection(_)
        )
    }

    /// Wraps a single-part geometry in its plural variant.
    pub fn into_multi(self) -> Geometry {
        match self {
            Geometry::Point(Some(coord)) => Geometry::MultiPoint(vec![coord]),
            Geometry::Point(None) => Geometry::MultiPoint(Vec::new()),
            Geometry::LineString(line) => Geometry::MultiLineString(vec![line]),
            Geometry::Polygon(polygon) => Geometry::MultiPolygon(vec![polygon]),
            other => other,
        }
    }

    /// Drops Z and M ordinates.
    pub fn force_2d(self) -> Geometry {
        fn line(coords: Vec<Coord>) -> Vec<Coord> {
            coords.into_iter().map(Coord::flattened).collect()
        }
        fn polygon(rings: Vec<Ring>) -> Vec<Ring> {
            rings.into_iter().map(line).collect()
        }
        match self {
            Geometry::Point(coord) => Geometry::Point(coord.map(Coord::flattened)),
            Geometry::LineString(coords) => Geometry::LineString(line(coords)),
            Geometry::Polygon(rings) => Geometry::Polygon(polygon(rings)),
            Geometry::MultiPoint(coords) => Geometry::MultiPoint(line(coords)),
            Geometry::MultiLineString(lines) => {
                Geometry::MultiLineString(lines.into_iter().map(line).collect())
            }
            Geometry::MultiPolygon(polygons) => {
                Geometry::MultiPolygon(polygons.into_iter().map(polygon).collect())
            }
            Geometry::GeometryCollection(members) => Geometry::GeometryCollection(
                members.into_iter().map(Geometry::force_2d).collect(),
            ),
        }
    }

    /// Merges several geometries into one multi-part geometry.
    ///
    /// Parts are collected, not unioned: overlapping polygons stay separate
    /// members of the resulting multipolygon. Mixed families fall back to a
    /// geometry collection.
    pub fn collect_parts(geometries: Vec<Geometry>) -> Option<Geometry> {
        let mut iter = geometries.into_iter().map(Geometry::into_multi);
        let first = iter.next()?;
        iter.try_fold(first, |acc, next| match (acc, next) {
            (Geometry::MultiPoint(mut a), Geometry::MultiPoint(b)) => {
                a.extend(b);
                Some(Geometry::MultiPoint(a))
            }
            (Geometry::MultiLineString(mut a), Geometry::MultiLineString(b)) => {
                a.extend(b);
                Some(Geometry::MultiLineString(a))
            }
            (Geometry::MultiPolygon(mut a), Geometry::MultiPolygon(b)) => {
                a.extend(b);
                Some(Geometry::MultiPolygon(a))
            }
            (Geometry::GeometryCollection(mut a), other) => {
                a.push(other);
                Some(Geometry::GeometryCollection(a))
            }
            (acc, other) => Some(Geometry::GeometryCollection(vec![acc, other])),
        })
    }

    pub fn to_wkt(&self) -> String {
        self.to_string()
    }

    /// Decodes a GeoPackage geometry blob. Returns `None` for blobs flagged empty.
    pub fn from_gpkg_blob(blob: &[u8]) -> Result<Option<Geometry>, GeometryError> {
        if blob.len() < 8 || &blob[0..2] != b"GP" {
            return Err(GeometryError("missing GeoPackage header".to_string()));
        }
        let flags = blob[3];
        if flags & 0b0010_0000 != 0 {
            return Err(GeometryError(
                "extended GeoPackage geometry types are not supported".to_string(),
            ));
        }
        let envelope_len = match (flags >> 1) & 0b111 {
            0 => 0,
            1 => 32,
            2 | 3 => 48,
            4 => 64,
            other => {
                return Err(GeometryError(format!(
                    "invalid envelope indicator {other}"
                )));
            }
        };
        if flags & 0b0001_0000 != 0 {
            return Ok(None);
        }
        let offset = 8 + envelope_len;
        let wkb = blob
            .get(offset..)
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| GeometryError("truncated GeoPackage header".to_string()))?;
        Geometry::from_wkb(wkb).map(Some)
    }

    pub fn from_wkb(bytes: &[u8]) -> Result<Geometry, GeometryError> {
        let mut reader = WkbReader { bytes, pos: 0 };
        reader.geometry()
    }
}

const WKB_Z_FLAG: u32 = 0x8000_0000;
const WKB_M_FLAG: u32 = 0x4000_0000;
const WKB_SRID_FLAG: u32 = 0x2000_0000;

struct WkbReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

#[derive(Clone, Copy)]
struct Layout {
    little_endian: bool,
    has_z: bool,
    has_m: bool,
}

impl WkbReader<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], GeometryError> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + N)
            .ok_or_else(|| GeometryError(format!("unexpected end of WKB at byte {}", self.pos)))?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn u32(&mut self, little_endian: bool) -> Result<u32, GeometryError> {
        let raw = self.take::<4>()?;
        Ok(if little_endian {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        })
    }

    fn f64(&mut self, little_endian: bool) -> Result<f64, GeometryError> {
        let raw = self.take::<8>()?;
        Ok(if little_endian {
            f64::from_le_bytes(raw)
        } else {
            f64::from_be_bytes(raw)
        })
    }

    fn coord(&mut self, layout: Layout) -> Result<Coord, GeometryError> {
        let x = self.f64(layout.little_endian)?;
        let y = self.f64(layout.little_endian)?;
        let z = layout
            .has_z
            .then(|| self.f64(layout.little_endian))
            .transpose()?;
        let m = layout
            .has_m
            .then(|| self.f64(layout.little_endian))
            .transpose()?;
        Ok(Coord { x, y, z, m })
    }

    fn coords(&mut self, layout: Layout) -> Result<Vec<Coord>, GeometryError> {
        let count = self.u32(layout.little_endian)? as usize;
        (0..count).map(|_| self.coord(layout)).collect()
    }

    fn rings(&mut self, layout: Layout) -> Result<Vec<Ring>, GeometryError> {
        let count = self.u32(layout.little_endian)? as usize;
        (0..count).map(|_| self.coords(layout)).collect()
    }

    fn members(&mut self, layout: Layout) -> Result<Vec<Geometry>, GeometryError> {
        let count = self.u32(layout.little_endian)? as usize;
        (0..count).map(|_| self.geometry()).collect()
    }

    fn geometry(&mut self) -> Result<Geometry, GeometryError> {
        let little_endian = match self.take::<1>()?[0] {
            0 => false,
            1 => true,
            other => return Err(GeometryError(format!("invalid byte order marker {other}"))),
        };
        let raw_type = self.u32(little_endian)?;
        if raw_type & WKB_SRID_FLAG != 0 {
            self.u32(little_endian)?;
        }
        let code = raw_type & 0x1FFF_FFFF;
        let iso_dims = code / 1000;
        let layout = Layout {
            little_endian,
            has_z: raw_type & WKB_Z_FLAG != 0 || matches!(iso_dims, 1 | 3),
            has_m: raw_type & WKB_M_FLAG != 0 || matches!(iso_dims, 2 | 3),
        };
        match code % 1000 {
            1 => {
                let coord = self.coord(layout)?;
                if coord.x.is_nan() && coord.y.is_nan() {
                    Ok(Geometry::Point(None))
                } else {
                    Ok(Geometry::Point(Some(coord)))
                }
            }
            2 => Ok(Geometry::LineString(self.coords(layout)?)),
            3 => Ok(Geometry::Polygon(self.rings(layout)?)),
            4 => self
                .members(layout)?
                .into_iter()
                .map(|member| match member {
                    Geometry::Point(Some(coord)) => Ok(coord),
                    other => Err(unexpected_member("MULTIPOINT", &other)),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Geometry::MultiPoint),
            5 => self
                .members(layout)?
                .into_iter()
                .map(|member| match member {
                    Geometry::LineString(line) => Ok(line),
                    other => Err(unexpected_member("MULTILINESTRING", &other)),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Geometry::MultiLineString),
            6 => self
                .members(layout)?
                .into_iter()
                .map(|member| match member {
                    Geometry::Polygon(rings) => Ok(rings),
                    other => Err(unexpected_member("MULTIPOLYGON", &other)),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Geometry::MultiPolygon),
            7 => Ok(Geometry::GeometryCollection(self.members(layout)?)),
            other => Err(GeometryError(format!("unsupported WKB geometry type {other}"))),
        }
    }
}

fn unexpected_member(container: &str, member: &Geometry) -> GeometryError {
    GeometryError(format!(
        "{container} contains a {} member",
        member.type_name()
    ))
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())?;
        f.write_str(dimension_tag(self))?;
        let mut body = String::new();
        write_body(&mut body, self)?;
        if body.is_empty() {
            f.write_str(" EMPTY")
        } else {
            write!(f, " {body}")
        }
    }
}

fn first_coord(geometry: &Geometry) -> Option<&Coord> {
    match geometry {
        Geometry::Point(coord) => coord.as_ref(),
        Geometry::LineString(coords) | Geometry::MultiPoint(coords) => coords.first(),
        Geometry::Polygon(rings) | Geometry::MultiLineString(rings) => {
            rings.iter().find_map(|ring| ring.first())
        }
        Geometry::MultiPolygon(polygons) => polygons
            .iter()
            .flat_map(|rings| rings.iter())
            .find_map(|ring| ring.first()),
        Geometry::GeometryCollection(members) => members.iter().find_map(first_coord),
    }
}

fn dimension_tag(geometry: &Geometry) -> &'static str {
    if matches!(geometry, Geometry::GeometryCollection(_)) {
        return "";
    }
    match first_coord(geometry) {
        Some(Coord {
            z: Some(_),
            m: Some(_),
            ..
        }) => " ZM",
        Some(Coord { z: Some(_), .. }) => " Z",
        Some(Coord { m: Some(_), .. }) => " M",
        _ => "",
    }
}

fn write_coord(out: &mut String, coord: &Coord) -> fmt::Result {
    write!(out, "{} {}", coord.x, coord.y)?;
    if let Some(z) = coord.z {
        write!(out, " {z}")?;
    }
    if let Some(m) = coord.m {
        write!(out, " {m}")?;
    }
    Ok(())
}

fn write_coords(out: &mut String, coords: &[Coord]) -> fmt::Result {
    out.push('(');
    for (idx, coord) in coords.iter().enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        write_coord(out, coord)?;
    }
    out.push(')');
    Ok(())
}

fn write_rings(out: &mut String, rings: &[Ring]) -> fmt::Result {
    out.push('(');
    for (idx, ring) in rings.iter().enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        write_coords(out, ring)?;
    }
    out.push(')');
    Ok(())
}

/// Writes the parenthesised body; leaves `out` empty for empty geometries.
fn write_body(out: &mut String, geometry: &Geometry) -> fmt::Result {
    match geometry {
        Geometry::Point(None) => Ok(()),
        Geometry::Point(Some(coord)) => write_coords(out, std::slice::from_ref(coord)),
        Geometry::LineString(coords) if coords.is_empty() => Ok(()),
        Geometry::LineString(coords) => write_coords(out, coords),
        Geometry::Polygon(rings) if rings.is_empty() => Ok(()),
        Geometry::Polygon(rings) => write_rings(out, rings),
        Geometry::MultiPoint(coords) if coords.is_empty() => Ok(()),
        Geometry::MultiPoint(coords) => {
            out.push('(');
            for (idx, coord) in coords.iter().enumerate() {
                if idx > 0 {
                    out.push_str(", ");
                }
                write_coords(out, std::slice::from_ref(coord))?;
            }
            out.push(')');
            Ok(())
        }
        Geometry::MultiLineString(lines) if lines.is_empty() => Ok(()),
        Geometry::MultiLineString(lines) => write_rings(out, lines),
        Geometry::MultiPolygon(polygons) if polygons.is_empty() => Ok(()),
        Geometry::MultiPolygon(polygons) => {
            out.push('(');
            for (idx, rings) in polygons.iter().enumerate() {
                if idx > 0 {
                    out.push_str(", ");
                }
                write_rings(out, rings)?;
            }
            out.push(')');
            Ok(())
        }
        Geometry::GeometryCollection(members) if members.is_empty() => Ok(()),
        Geometry::GeometryCollection(members) => {
            out.push('(');
            for (idx, member) in members.iter().enumerate() {
                if idx > 0 {
                    out.push_str(", ");
                }
                write!(out, "{member}")?;
            }
            out.push(')');
            Ok(())
        }
    }
}
