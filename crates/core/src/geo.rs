//! Geometry primitives: WGS84 points, minimum bounding rectangles, an EWKB
//! codec, and great-circle distance.
//!
//! Geometries are stored as EWKB (SRID 4326) in entity documents; the spatial
//! index keeps only MBRs and re-reads the EWKB body when an exact predicate
//! is requested. Exact polygon predicates delegate to the `geo` crate.

use crate::error::{Result, ThemisError};
use crate::value::Value;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Mean earth radius in metres (IUGG).
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

const EWKB_SRID_FLAG: u32 = 0x2000_0000;
const SRID_WGS84: u32 = 4326;

// ============================================================================
// Points and MBRs
// ============================================================================

/// A WGS84 coordinate, `(lon, lat)` in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Longitude in degrees.
    pub lon: f64,
    /// Latitude in degrees.
    pub lat: f64,
}

impl GeoPoint {
    /// Construct a point.
    pub fn new(lon: f64, lat: f64) -> Self {
        GeoPoint { lon, lat }
    }

    /// Great-circle distance to another point, in metres (haversine).
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();
        let a = (dlat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }
}

/// Minimum bounding rectangle in lon/lat degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mbr {
    /// West edge.
    pub min_lon: f64,
    /// South edge.
    pub min_lat: f64,
    /// East edge.
    pub max_lon: f64,
    /// North edge.
    pub max_lat: f64,
}

impl Mbr {
    /// Rectangle from two corners; normalises min/max.
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Mbr {
            min_lon: min_lon.min(max_lon),
            min_lat: min_lat.min(max_lat),
            max_lon: min_lon.max(max_lon),
            max_lat: min_lat.max(max_lat),
        }
    }

    /// Degenerate rectangle around one point.
    pub fn from_point(p: GeoPoint) -> Self {
        Mbr {
            min_lon: p.lon,
            min_lat: p.lat,
            max_lon: p.lon,
            max_lat: p.lat,
        }
    }

    /// The empty rectangle: union identity.
    pub fn empty() -> Self {
        Mbr {
            min_lon: f64::INFINITY,
            min_lat: f64::INFINITY,
            max_lon: f64::NEG_INFINITY,
            max_lat: f64::NEG_INFINITY,
        }
    }

    /// True when no point has been merged in.
    pub fn is_empty(&self) -> bool {
        self.min_lon > self.max_lon
    }

    /// Area in square degrees. The planner's `area_ratio` divides two of
    /// these, so the unit cancels.
    pub fn area(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        (self.max_lon - self.min_lon) * (self.max_lat - self.min_lat)
    }

    /// Half-perimeter, used by the R* split axis choice.
    pub fn margin(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        (self.max_lon - self.min_lon) + (self.max_lat - self.min_lat)
    }

    /// Smallest rectangle covering both.
    pub fn union(&self, other: &Mbr) -> Mbr {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Mbr {
            min_lon: self.min_lon.min(other.min_lon),
            min_lat: self.min_lat.min(other.min_lat),
            max_lon: self.max_lon.max(other.max_lon),
            max_lat: self.max_lat.max(other.max_lat),
        }
    }

    /// True when the rectangles share any point.
    pub fn intersects(&self, other: &Mbr) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.min_lon <= other.max_lon
            && self.max_lon >= other.min_lon
            && self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
    }

    /// True when `other` lies entirely inside this rectangle.
    pub fn contains(&self, other: &Mbr) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.min_lon <= other.min_lon
            && self.max_lon >= other.max_lon
            && self.min_lat <= other.min_lat
            && self.max_lat >= other.max_lat
    }

    /// True when the point lies inside or on the boundary.
    pub fn contains_point(&self, p: &GeoPoint) -> bool {
        !self.is_empty()
            && p.lon >= self.min_lon
            && p.lon <= self.max_lon
            && p.lat >= self.min_lat
            && p.lat <= self.max_lat
    }

    /// Area of the intersection.
    pub fn overlap_area(&self, other: &Mbr) -> f64 {
        let lon = (self.max_lon.min(other.max_lon) - self.min_lon.max(other.min_lon)).max(0.0);
        let lat = (self.max_lat.min(other.max_lat) - self.min_lat.max(other.min_lat)).max(0.0);
        lon * lat
    }

    /// How much area the union with `other` adds over this rectangle.
    pub fn enlargement(&self, other: &Mbr) -> f64 {
        self.union(other).area() - self.area()
    }

    /// Centre point.
    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(
            (self.min_lon + self.max_lon) / 2.0,
            (self.min_lat + self.max_lat) / 2.0,
        )
    }

    /// Lower bound on the great-circle distance from `p` to any point of the
    /// rectangle: clamp `p` into the box, then haversine.
    pub fn min_distance_m(&self, p: &GeoPoint) -> f64 {
        if self.is_empty() {
            return f64::INFINITY;
        }
        let clamped = GeoPoint::new(
            p.lon.clamp(self.min_lon, self.max_lon),
            p.lat.clamp(self.min_lat, self.max_lat),
        );
        p.distance_m(&clamped)
    }
}

// ============================================================================
// Geometries + EWKB
// ============================================================================

/// A stored geometry. Coordinates are WGS84 lon/lat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    /// Single position.
    Point(GeoPoint),
    /// Open polyline.
    LineString(Vec<GeoPoint>),
    /// Outer ring plus holes. Rings are closed (first == last point).
    Polygon {
        /// Exterior ring.
        exterior: Vec<GeoPoint>,
        /// Interior rings (holes).
        holes: Vec<Vec<GeoPoint>>,
    },
}

impl Geometry {
    /// Minimum bounding rectangle.
    pub fn mbr(&self) -> Mbr {
        let mut mbr = Mbr::empty();
        match self {
            Geometry::Point(p) => mbr = mbr.union(&Mbr::from_point(*p)),
            Geometry::LineString(points) => {
                for p in points {
                    mbr = mbr.union(&Mbr::from_point(*p));
                }
            }
            Geometry::Polygon { exterior, holes } => {
                for p in exterior {
                    mbr = mbr.union(&Mbr::from_point(*p));
                }
                for ring in holes {
                    for p in ring {
                        mbr = mbr.union(&Mbr::from_point(*p));
                    }
                }
            }
        }
        mbr
    }

    /// A representative point (the first coordinate). Used by graph geo
    /// filters and distance sorts over point-shaped fields.
    pub fn representative_point(&self) -> Option<GeoPoint> {
        match self {
            Geometry::Point(p) => Some(*p),
            Geometry::LineString(points) => points.first().copied(),
            Geometry::Polygon { exterior, .. } => exterior.first().copied(),
        }
    }

    /// Encode as little-endian EWKB with SRID 4326.
    pub fn to_ewkb(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(1); // little endian
        let type_code: u32 = match self {
            Geometry::Point(_) => 1,
            Geometry::LineString(_) => 2,
            Geometry::Polygon { .. } => 3,
        };
        push_u32(&mut out, type_code | EWKB_SRID_FLAG);
        push_u32(&mut out, SRID_WGS84);
        match self {
            Geometry::Point(p) => push_point(&mut out, p),
            Geometry::LineString(points) => {
                push_u32(&mut out, points.len() as u32);
                for p in points {
                    push_point(&mut out, p);
                }
            }
            Geometry::Polygon { exterior, holes } => {
                push_u32(&mut out, (1 + holes.len()) as u32);
                push_ring(&mut out, exterior);
                for ring in holes {
                    push_ring(&mut out, ring);
                }
            }
        }
        out
    }

    /// Decode EWKB (or plain WKB). Big-endian bodies and geometry kinds
    /// beyond point / linestring / polygon are `Unsupported`.
    pub fn from_ewkb(bytes: &[u8]) -> Result<Geometry> {
        let mut cur = Cursor { bytes, pos: 0 };
        let endian = cur.take_u8()?;
        if endian != 1 {
            return Err(ThemisError::unsupported("big-endian wkb"));
        }
        let raw_type = cur.take_u32()?;
        if raw_type & EWKB_SRID_FLAG != 0 {
            let srid = cur.take_u32()?;
            if srid != SRID_WGS84 {
                return Err(ThemisError::invalid_value(format!(
                    "srid {srid}, only 4326 is stored"
                )));
            }
        }
        match raw_type & 0xFF {
            1 => Ok(Geometry::Point(cur.take_point()?)),
            2 => {
                let n = cur.take_u32()? as usize;
                let mut points = Vec::with_capacity(n);
                for _ in 0..n {
                    points.push(cur.take_point()?);
                }
                Ok(Geometry::LineString(points))
            }
            3 => {
                let rings = cur.take_u32()? as usize;
                if rings == 0 {
                    return Err(ThemisError::invalid_value("polygon with no rings"));
                }
                let mut all = Vec::with_capacity(rings);
                for _ in 0..rings {
                    let n = cur.take_u32()? as usize;
                    let mut ring = Vec::with_capacity(n);
                    for _ in 0..n {
                        ring.push(cur.take_point()?);
                    }
                    all.push(ring);
                }
                let exterior = all.remove(0);
                Ok(Geometry::Polygon {
                    exterior,
                    holes: all,
                })
            }
            other => Err(ThemisError::unsupported(format!("wkb type {other}"))),
        }
    }

    /// Convert to a `geo` geometry for exact predicate evaluation.
    pub fn to_geo(&self) -> geo_types::Geometry<f64> {
        match self {
            Geometry::Point(p) => geo_types::Geometry::Point(geo_types::Point::new(p.lon, p.lat)),
            Geometry::LineString(points) => {
                geo_types::Geometry::LineString(line_string(points))
            }
            Geometry::Polygon { exterior, holes } => {
                geo_types::Geometry::Polygon(geo_types::Polygon::new(
                    line_string(exterior),
                    holes.iter().map(|r| line_string(r)).collect(),
                ))
            }
        }
    }

    /// Exact intersection test.
    pub fn intersects_exact(&self, other: &Geometry) -> bool {
        use geo::Intersects;
        self.to_geo().intersects(&other.to_geo())
    }

    /// Exact containment: `self` entirely inside `other`.
    pub fn within_exact(&self, other: &Geometry) -> bool {
        use geo::Contains;
        other.to_geo().contains(&self.to_geo())
    }
}

fn line_string(points: &[GeoPoint]) -> geo_types::LineString<f64> {
    geo_types::LineString::from(
        points
            .iter()
            .map(|p| geo_types::Coord { x: p.lon, y: p.lat })
            .collect::<Vec<_>>(),
    )
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    LittleEndian::write_u32(&mut b, v);
    out.extend_from_slice(&b);
}

fn push_f64(out: &mut Vec<u8>, v: f64) {
    let mut b = [0u8; 8];
    LittleEndian::write_f64(&mut b, v);
    out.extend_from_slice(&b);
}

fn push_point(out: &mut Vec<u8>, p: &GeoPoint) {
    push_f64(out, p.lon);
    push_f64(out, p.lat);
}

fn push_ring(out: &mut Vec<u8>, ring: &[GeoPoint]) {
    push_u32(out, ring.len() as u32);
    for p in ring {
        push_point(out, p);
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(ThemisError::invalid_value("truncated wkb"));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn take_f64(&mut self) -> Result<f64> {
        Ok(LittleEndian::read_f64(self.take(8)?))
    }

    fn take_point(&mut self) -> Result<GeoPoint> {
        let lon = self.take_f64()?;
        let lat = self.take_f64()?;
        if !lon.is_finite() || !lat.is_finite() {
            return Err(ThemisError::invalid_value("non-finite coordinate"));
        }
        Ok(GeoPoint::new(lon, lat))
    }
}

// ============================================================================
// Document extraction
// ============================================================================

/// Read a geometry out of a document field.
///
/// Accepts, in order of preference:
/// - `Bytes` holding EWKB;
/// - a two-element numeric `Array` as `[lon, lat]`;
/// - a GeoJSON-shaped `Object` with `type` and `coordinates`.
pub fn geometry_from_value(value: &Value) -> Result<Geometry> {
    match value {
        Value::Bytes(b) => Geometry::from_ewkb(b),
        Value::Array(items) if items.len() == 2 => {
            let lon = items[0]
                .as_float()
                .ok_or_else(|| ThemisError::invalid_value("[lon, lat] must be numeric"))?;
            let lat = items[1]
                .as_float()
                .ok_or_else(|| ThemisError::invalid_value("[lon, lat] must be numeric"))?;
            validate_lon_lat(lon, lat)?;
            Ok(Geometry::Point(GeoPoint::new(lon, lat)))
        }
        Value::Object(map) => {
            let kind = map
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| ThemisError::invalid_value("geometry object missing type"))?;
            let coords = map
                .get("coordinates")
                .ok_or_else(|| ThemisError::invalid_value("geometry object missing coordinates"))?;
            match kind {
                "Point" => {
                    let p = point_from_value(coords)?;
                    Ok(Geometry::Point(p))
                }
                "LineString" => Ok(Geometry::LineString(ring_from_value(coords)?)),
                "Polygon" => {
                    let rings = coords
                        .as_array()
                        .ok_or_else(|| ThemisError::invalid_value("polygon coordinates"))?;
                    if rings.is_empty() {
                        return Err(ThemisError::invalid_value("polygon with no rings"));
                    }
                    let mut parsed: Vec<Vec<GeoPoint>> = rings
                        .iter()
                        .map(ring_from_value)
                        .collect::<Result<_>>()?;
                    let exterior = parsed.remove(0);
                    Ok(Geometry::Polygon {
                        exterior,
                        holes: parsed,
                    })
                }
                other => Err(ThemisError::unsupported(format!("geometry type {other}"))),
            }
        }
        other => Err(ThemisError::invalid_value(format!(
            "{} is not a geometry",
            other.type_name()
        ))),
    }
}

fn point_from_value(value: &Value) -> Result<GeoPoint> {
    let pair = value
        .as_array()
        .filter(|a| a.len() == 2)
        .ok_or_else(|| ThemisError::invalid_value("point coordinates"))?;
    let lon = pair[0]
        .as_float()
        .ok_or_else(|| ThemisError::invalid_value("point coordinates"))?;
    let lat = pair[1]
        .as_float()
        .ok_or_else(|| ThemisError::invalid_value("point coordinates"))?;
    validate_lon_lat(lon, lat)?;
    Ok(GeoPoint::new(lon, lat))
}

fn ring_from_value(value: &Value) -> Result<Vec<GeoPoint>> {
    value
        .as_array()
        .ok_or_else(|| ThemisError::invalid_value("coordinate list"))?
        .iter()
        .map(point_from_value)
        .collect()
}

fn validate_lon_lat(lon: f64, lat: f64) -> Result<()> {
    if !lon.is_finite() || !lat.is_finite() || !(-180.0..=180.0).contains(&lon)
        || !(-90.0..=90.0).contains(&lat)
    {
        return Err(ThemisError::invalid_value(format!(
            "coordinate ({lon}, {lat}) outside WGS84 bounds"
        )));
    }
    Ok(())
}
