//! Core data types for the catalog.
//!
//! - [`CatalogRecord`]: one satellite data product with its embedded tags,
//!   parameters and coverage boundary
//! - [`Parameter`] / [`ParameterValue`]: named, typed values attached to a record
//! - [`Polygon`] / [`LineString`]: geometries in `[lon, lat]` order
//! - [`RecordPatch`]: the mutable subset of a record

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// A `[lon, lat]` position.
pub type Position = [f64; 2];

/// Whether a position lies within longitude `[-180, 180]` and latitude `[-90, 90]`.
pub fn in_range(p: &Position) -> bool {
    (-180.0..=180.0).contains(&p[0]) && (-90.0..=90.0).contains(&p[1])
}

/// Truncate a timestamp to the store's millisecond precision.
pub fn truncate_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(3)
}

/// A closed polygon ring describing geographic coverage.
///
/// The ring is stored closed (first position == last position).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Polygon {
    ring: Vec<Position>,
}

impl Polygon {
    /// Build a polygon from its outer ring, closing it if needed.
    ///
    /// Returns `None` when fewer than three distinct corners are given or a
    /// position is outside the valid longitude/latitude range.
    pub fn new(mut ring: Vec<Position>) -> Option<Self> {
        if !ring.iter().all(in_range) {
            return None;
        }
        if ring.first() != ring.last() {
            let first = *ring.first()?;
            ring.push(first);
        }
        // Closed ring: at least three corners plus the closing point.
        if ring.len() < 4 {
            return None;
        }
        Some(Self { ring })
    }

    /// The closed outer ring.
    pub fn ring(&self) -> &[Position] {
        &self.ring
    }

    /// Planar point-in-polygon test (ray casting). Boundary points count as inside.
    pub fn contains_point(&self, p: Position) -> bool {
        let mut inside = false;
        for edge in self.ring.windows(2) {
            let ([x1, y1], [x2, y2]) = (edge[0], edge[1]);
            if on_segment(p, edge[0], edge[1]) {
                return true;
            }
            if (y1 > p[1]) != (y2 > p[1]) {
                let x_cross = x1 + (p[1] - y1) * (x2 - x1) / (y2 - y1);
                if p[0] < x_cross {
                    inside = !inside;
                }
            }
        }
        inside
    }
}

fn on_segment(p: Position, a: Position, b: Position) -> bool {
    let cross = (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0]);
    cross.abs() < 1e-12
        && p[0] >= a[0].min(b[0])
        && p[0] <= a[0].max(b[0])
        && p[1] >= a[1].min(b[1])
        && p[1] <= a[1].max(b[1])
}

/// An open path, e.g. a sub-satellite track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineString {
    points: Vec<Position>,
}

impl LineString {
    /// Build a line string; at least two in-range positions are required.
    pub fn new(points: Vec<Position>) -> Option<Self> {
        if points.len() < 2 || !points.iter().all(in_range) {
            return None;
        }
        Some(Self { points })
    }

    pub fn points(&self) -> &[Position] {
        &self.points
    }
}

/// Value kinds a parameter can carry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ParameterKind {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
    LineString,
}

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    LineString(LineString),
}

impl ParameterValue {
    pub fn kind(&self) -> ParameterKind {
        match self {
            Self::Text(_) => ParameterKind::Text,
            Self::Integer(_) => ParameterKind::Integer,
            Self::Float(_) => ParameterKind::Float,
            Self::Boolean(_) => ParameterKind::Boolean,
            Self::Timestamp(_) => ParameterKind::Timestamp,
            Self::LineString(_) => ParameterKind::LineString,
        }
    }
}

/// A named parameter value together with the time it was recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub value: ParameterValue,
    pub creation_time: DateTime<Utc>,
}

impl Parameter {
    /// Create a parameter stamped with the current time.
    pub fn new(value: ParameterValue) -> Self {
        Self::at(value, Utc::now())
    }

    /// Create a parameter with an explicit creation time.
    pub fn at(value: ParameterValue, creation_time: DateTime<Utc>) -> Self {
        let value = match value {
            ParameterValue::Timestamp(ts) => ParameterValue::Timestamp(truncate_millis(ts)),
            other => other,
        };
        Self {
            value,
            creation_time: truncate_millis(creation_time),
        }
    }
}

/// One indexed metadata entry for a satellite data product.
///
/// Tags, parameters and the boundary are embedded: deleting the record
/// removes them with it.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogRecord {
    /// Primary identity, immutable once created.
    pub uid: String,
    pub file_type: String,
    pub file_format: String,
    /// Originating satellite, e.g. "NOAA-19".
    pub platform_name: String,
    /// Instrument on the platform, e.g. "avhrr".
    pub sensor: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Storage locations in insertion order, never empty.
    pub uris: Vec<String>,
    pub tags: BTreeSet<String>,
    /// Geographic coverage.
    pub boundary: Option<Polygon>,
    pub is_archived: bool,
    /// Set once at insertion.
    pub creation_time: DateTime<Utc>,
    pub parameters: BTreeMap<String, Parameter>,
}

impl CatalogRecord {
    /// Create a record stamped with the current creation time.
    pub fn new(
        uid: impl Into<String>,
        file_type: impl Into<String>,
        file_format: impl Into<String>,
        platform_name: impl Into<String>,
        uri: impl Into<String>,
    ) -> Self {
        Self {
            uid: uid.into(),
            file_type: file_type.into(),
            file_format: file_format.into(),
            platform_name: platform_name.into(),
            sensor: None,
            start_time: None,
            end_time: None,
            uris: vec![uri.into()],
            tags: BTreeSet::new(),
            boundary: None,
            is_archived: false,
            creation_time: truncate_millis(Utc::now()),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_sensor(mut self, sensor: impl Into<String>) -> Self {
        self.sensor = Some(sensor.into());
        self
    }

    pub fn with_time_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(truncate_millis(start));
        self.end_time = Some(truncate_millis(end));
        self
    }

    pub fn with_creation_time(mut self, ts: DateTime<Utc>) -> Self {
        self.creation_time = truncate_millis(ts);
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uris.push(uri.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_boundary(mut self, boundary: Polygon) -> Self {
        self.boundary = Some(boundary);
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, parameter: Parameter) -> Self {
        self.parameters.insert(name.into(), parameter);
        self
    }

    /// Truncate every timestamp to millisecond precision.
    pub(crate) fn normalize_times(&mut self) {
        self.start_time = self.start_time.map(truncate_millis);
        self.end_time = self.end_time.map(truncate_millis);
        self.creation_time = truncate_millis(self.creation_time);
        for p in self.parameters.values_mut() {
            p.creation_time = truncate_millis(p.creation_time);
            if let ParameterValue::Timestamp(ts) = &mut p.value {
                *ts = truncate_millis(*ts);
            }
        }
    }
}

/// The mutable subset of a record.
///
/// Removals are applied after additions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordPatch {
    pub is_archived: Option<bool>,
    pub add_tags: Vec<String>,
    pub remove_tags: Vec<String>,
    pub add_uris: Vec<String>,
    pub remove_uris: Vec<String>,
}

impl RecordPatch {
    pub fn archive(archived: bool) -> Self {
        Self {
            is_archived: Some(archived),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.is_archived.is_none()
            && self.add_tags.is_empty()
            && self.remove_tags.is_empty()
            && self.add_uris.is_empty()
            && self.remove_uris.is_empty()
    }

    /// Apply the patch to a record in place.
    ///
    /// URIs keep their order; an added URI already present is not duplicated.
    pub fn apply(&self, record: &mut CatalogRecord) {
        if let Some(archived) = self.is_archived {
            record.is_archived = archived;
        }
        for tag in &self.add_tags {
            record.tags.insert(tag.clone());
        }
        for tag in &self.remove_tags {
            record.tags.remove(tag);
        }
        for uri in &self.add_uris {
            if !record.uris.contains(uri) {
                record.uris.push(uri.clone());
            }
        }
        record.uris.retain(|u| !self.remove_uris.contains(u));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn square() -> Polygon {
        Polygon::new(vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]]).unwrap()
    }

    #[test]
    fn test_polygon_is_closed_on_construction() {
        let poly = square();
        assert_eq!(poly.ring().len(), 5);
        assert_eq!(poly.ring().first(), poly.ring().last());
    }

    #[test]
    fn test_polygon_rejects_degenerate_rings() {
        assert!(Polygon::new(vec![[0.0, 0.0], [1.0, 1.0]]).is_none());
        assert!(Polygon::new(vec![]).is_none());
        assert!(Polygon::new(vec![[0.0, 0.0], [f64::NAN, 1.0], [1.0, 0.0]]).is_none());
    }

    #[test]
    fn test_geometry_rejects_out_of_range_positions() {
        assert!(Polygon::new(vec![[0.0, 0.0], [500.0, 0.0], [500.0, 120.0]]).is_none());
        assert!(Polygon::new(vec![[0.0, 0.0], [10.0, 0.0], [10.0, 91.0]]).is_none());
        assert!(Polygon::new(vec![[-180.0, -90.0], [180.0, -90.0], [180.0, 90.0]]).is_some());
        assert!(LineString::new(vec![[0.0, 0.0], [-181.0, 0.0]]).is_none());
        assert!(LineString::new(vec![[0.0, 0.0], [f64::INFINITY, 0.0]]).is_none());
    }

    #[test]
    fn test_polygon_contains_point() {
        let poly = square();
        assert!(poly.contains_point([5.0, 5.0]));
        assert!(poly.contains_point([0.0, 5.0]));
        assert!(!poly.contains_point([11.0, 5.0]));
        assert!(!poly.contains_point([-0.5, -0.5]));
    }

    #[test]
    fn test_linestring_needs_two_points() {
        assert!(LineString::new(vec![[0.0, 0.0]]).is_none());
        assert!(LineString::new(vec![[0.0, 0.0], [1.0, 1.0]]).is_some());
    }

    #[test]
    fn test_parameter_kind_from_str() {
        assert_eq!(
            ParameterKind::from_str("integer").unwrap(),
            ParameterKind::Integer
        );
        assert_eq!(
            ParameterKind::from_str("LineString").unwrap(),
            ParameterKind::LineString
        );
        assert!(ParameterKind::from_str("polygon").is_err());
    }

    #[test]
    fn test_record_times_are_truncated_to_millis() {
        let start = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let record = CatalogRecord::new("u", "binary", "HRPT", "NOAA-19", "file:///a")
            .with_time_range(start, start);
        assert_eq!(
            record.start_time.unwrap().timestamp_subsec_nanos(),
            123_000_000
        );
    }

    #[test]
    fn test_patch_apply() {
        let mut record = CatalogRecord::new("u", "binary", "HRPT", "NOAA-19", "file:///a")
            .with_tag("old");
        let patch = RecordPatch {
            is_archived: Some(true),
            add_tags: vec!["new".to_string()],
            remove_tags: vec!["old".to_string()],
            add_uris: vec!["file:///b".to_string(), "file:///a".to_string()],
            remove_uris: vec![],
        };
        patch.apply(&mut record);

        assert!(record.is_archived);
        assert_eq!(record.tags.iter().collect::<Vec<_>>(), vec!["new"]);
        assert_eq!(record.uris, vec!["file:///a", "file:///b"]);
    }

    #[test]
    fn test_patch_is_empty() {
        assert!(RecordPatch::default().is_empty());
        assert!(!RecordPatch::archive(true).is_empty());
    }
}
