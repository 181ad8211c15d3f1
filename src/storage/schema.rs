//! Catalog schema: the canonical document shape and field descriptions.
//!
//! [`Schema::validate`] turns a raw store document into a [`CatalogRecord`]
//! and [`Schema::serialize`] is its inverse. The field table drives the
//! filter compiler, sort-key checks and projections.

use std::collections::BTreeMap;

use bson::{Bson, Document, doc};
use chrono::{DateTime, Utc};
use mongodb::IndexModel;
use mongodb::options::IndexOptions;

use crate::storage::error::ValidationError;
use crate::storage::types::{
    CatalogRecord, LineString, Parameter, ParameterKind, ParameterValue, Polygon, Position,
    truncate_millis,
};

/// Internal compare-and-swap counter stored next to each record.
pub(crate) const REVISION_FIELD: &str = "_rev";

/// Revision of a stored document; documents without a counter are at 0.
pub(crate) fn revision(doc: &Document) -> i64 {
    match doc.get(REVISION_FIELD) {
        Some(Bson::Int64(r)) => *r,
        Some(Bson::Int32(r)) => i64::from(*r),
        _ => 0,
    }
}

/// Semantic type of a queryable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Exact-match string.
    Keyword,
    Timestamp,
    Boolean,
    Integer,
    Float,
    /// Array of strings with set semantics.
    KeywordSet,
    Polygon,
    LineString,
}

impl FieldKind {
    /// Whether the kind has a total order usable for range operators and sorting.
    pub fn is_ordered(self) -> bool {
        matches!(self, Self::Timestamp | Self::Integer | Self::Float)
    }

    pub fn is_geometry(self) -> bool {
        matches!(self, Self::Polygon | Self::LineString)
    }
}

impl From<ParameterKind> for FieldKind {
    fn from(kind: ParameterKind) -> Self {
        match kind {
            ParameterKind::Text => Self::Keyword,
            ParameterKind::Integer => Self::Integer,
            ParameterKind::Float => Self::Float,
            ParameterKind::Boolean => Self::Boolean,
            ParameterKind::Timestamp => Self::Timestamp,
            ParameterKind::LineString => Self::LineString,
        }
    }
}

/// Description of one queryable field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// Name used by clients, e.g. `platform_name` or `parameters.orbit_number`.
    pub name: String,
    /// Dotted path of the value inside the stored document.
    pub path: String,
    pub kind: FieldKind,
    pub sortable: bool,
}

/// The catalog schema, optionally extended with declared parameter types.
#[derive(Debug, Clone)]
pub struct Schema {
    fields: BTreeMap<String, FieldDef>,
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

impl Schema {
    /// The built-in record fields.
    pub fn new() -> Self {
        let mut schema = Self {
            fields: BTreeMap::new(),
        };
        for (name, kind, sortable) in [
            ("uid", FieldKind::Keyword, true),
            ("file_type", FieldKind::Keyword, true),
            ("file_format", FieldKind::Keyword, true),
            ("platform_name", FieldKind::Keyword, true),
            ("sensor", FieldKind::Keyword, true),
            ("start_time", FieldKind::Timestamp, true),
            ("end_time", FieldKind::Timestamp, true),
            ("creation_time", FieldKind::Timestamp, true),
            ("is_archived", FieldKind::Boolean, false),
            ("uris", FieldKind::KeywordSet, false),
            ("tags", FieldKind::KeywordSet, false),
            ("boundary", FieldKind::Polygon, false),
        ] {
            schema.insert(FieldDef {
                name: name.to_string(),
                path: name.to_string(),
                kind,
                sortable,
            });
        }
        schema
    }

    /// Declare the type of an embedded parameter so it becomes filterable
    /// as `parameters.<name>`.
    pub fn with_parameter(mut self, name: &str, kind: ParameterKind) -> Self {
        let field_kind = FieldKind::from(kind);
        self.insert(FieldDef {
            name: format!("parameters.{name}"),
            path: format!("parameters.{name}.value"),
            kind: field_kind,
            sortable: field_kind.is_ordered(),
        });
        self
    }

    fn insert(&mut self, def: FieldDef) {
        self.fields.insert(def.name.clone(), def);
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.values()
    }

    /// Names that may appear in a projection: the top-level record fields.
    pub fn projectable(&self, name: &str) -> bool {
        TOP_LEVEL_FIELDS.contains(&name)
    }

    /// Validate a raw document into a record.
    ///
    /// Fields whose name starts with `_` are store-internal and ignored.
    pub fn validate(&self, raw: &Document) -> Result<CatalogRecord, ValidationError> {
        let record = CatalogRecord {
            uid: required_str(raw, "uid")?,
            file_type: required_str(raw, "file_type")?,
            file_format: required_str(raw, "file_format")?,
            platform_name: required_str(raw, "platform_name")?,
            sensor: optional_str(raw, "sensor")?,
            start_time: optional_datetime(raw, "start_time")?,
            end_time: optional_datetime(raw, "end_time")?,
            uris: string_array(raw, "uris", true)?,
            tags: string_array(raw, "tags", false)?.into_iter().collect(),
            boundary: optional_polygon(raw, "boundary")?,
            is_archived: match raw.get("is_archived") {
                None | Some(Bson::Null) => false,
                Some(Bson::Boolean(b)) => *b,
                Some(_) => return Err(invalid_type("is_archived", "a boolean")),
            },
            creation_time: required_datetime(raw, "creation_time")?,
            parameters: parameters(raw)?,
        };
        check(&record)?;
        Ok(record)
    }

    /// Render a record as its canonical store document.
    pub fn serialize(&self, record: &CatalogRecord) -> Document {
        let mut out = doc! {
            "uid": &record.uid,
            "file_type": &record.file_type,
            "file_format": &record.file_format,
            "platform_name": &record.platform_name,
        };
        if let Some(sensor) = &record.sensor {
            out.insert("sensor", sensor);
        }
        if let Some(start) = record.start_time {
            out.insert("start_time", to_bson_datetime(start));
        }
        if let Some(end) = record.end_time {
            out.insert("end_time", to_bson_datetime(end));
        }
        out.insert("uris", record.uris.clone());
        out.insert(
            "tags",
            record.tags.iter().cloned().collect::<Vec<String>>(),
        );
        if let Some(boundary) = &record.boundary {
            out.insert("boundary", polygon_to_geojson(boundary));
        }
        out.insert("is_archived", record.is_archived);
        out.insert("creation_time", to_bson_datetime(record.creation_time));

        let mut params = Document::new();
        for (name, p) in &record.parameters {
            params.insert(
                name.clone(),
                doc! {
                    "value": parameter_value_to_bson(&p.value),
                    "creation_time": to_bson_datetime(p.creation_time),
                },
            );
        }
        out.insert("parameters", params);
        out
    }

    /// Indexes the catalog collection needs.
    pub fn indexes(&self) -> Vec<IndexModel> {
        vec![
            IndexModel::builder()
                .keys(doc! { "uid": 1 })
                .options(
                    IndexOptions::builder()
                        .unique(true)
                        .name("uid_unique".to_string())
                        .build(),
                )
                .build(),
            IndexModel::builder()
                .keys(doc! { "creation_time": 1, "uid": 1 })
                .options(
                    IndexOptions::builder()
                        .name("creation_time_uid".to_string())
                        .build(),
                )
                .build(),
            IndexModel::builder()
                .keys(doc! { "platform_name": 1, "start_time": 1 })
                .options(
                    IndexOptions::builder()
                        .name("platform_start_time".to_string())
                        .build(),
                )
                .build(),
            IndexModel::builder()
                .keys(doc! { "boundary": "2dsphere" })
                .options(
                    IndexOptions::builder()
                        .name("boundary_2dsphere".to_string())
                        .sparse(true)
                        .build(),
                )
                .build(),
        ]
    }
}

const TOP_LEVEL_FIELDS: &[&str] = &[
    "uid",
    "file_type",
    "file_format",
    "platform_name",
    "sensor",
    "start_time",
    "end_time",
    "uris",
    "tags",
    "boundary",
    "is_archived",
    "creation_time",
    "parameters",
];

/// Check the invariants a typed record must satisfy before it is written.
pub fn check(record: &CatalogRecord) -> Result<(), ValidationError> {
    for (field, value) in [
        ("uid", &record.uid),
        ("file_type", &record.file_type),
        ("file_format", &record.file_format),
        ("platform_name", &record.platform_name),
    ] {
        if value.trim().is_empty() {
            return Err(ValidationError::InvalidValue {
                field: field.to_string(),
                reason: "must not be empty".to_string(),
            });
        }
    }
    if record.uris.is_empty() {
        return Err(ValidationError::EmptyUris);
    }
    if record.uris.iter().any(|u| u.trim().is_empty()) {
        return Err(ValidationError::InvalidValue {
            field: "uris".to_string(),
            reason: "uris must not be empty strings".to_string(),
        });
    }
    if let (Some(start), Some(end)) = (record.start_time, record.end_time) {
        if end < start {
            return Err(ValidationError::TimeOrder {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
    }
    for (name, parameter) in &record.parameters {
        if let ParameterValue::Float(v) = parameter.value {
            if !v.is_finite() {
                return Err(ValidationError::InvalidValue {
                    field: format!("parameters.{name}"),
                    reason: "float must be finite".to_string(),
                });
            }
        }
    }
    Ok(())
}

// =============================================================================
// Conversion helpers
// =============================================================================

pub(crate) fn to_bson_datetime(ts: DateTime<Utc>) -> Bson {
    Bson::DateTime(bson::DateTime::from_chrono(truncate_millis(ts)))
}

pub(crate) fn polygon_to_geojson(polygon: &Polygon) -> Document {
    doc! {
        "type": "Polygon",
        "coordinates": [positions_to_bson(polygon.ring())],
    }
}

pub(crate) fn linestring_to_geojson(line: &LineString) -> Document {
    doc! {
        "type": "LineString",
        "coordinates": positions_to_bson(line.points()),
    }
}

fn positions_to_bson(points: &[Position]) -> Bson {
    Bson::Array(
        points
            .iter()
            .map(|[lon, lat]| Bson::Array(vec![Bson::Double(*lon), Bson::Double(*lat)]))
            .collect(),
    )
}

fn parameter_value_to_bson(value: &ParameterValue) -> Bson {
    match value {
        ParameterValue::Text(s) => Bson::String(s.clone()),
        ParameterValue::Integer(i) => Bson::Int64(*i),
        ParameterValue::Float(f) => Bson::Double(*f),
        ParameterValue::Boolean(b) => Bson::Boolean(*b),
        ParameterValue::Timestamp(ts) => to_bson_datetime(*ts),
        ParameterValue::LineString(line) => Bson::Document(linestring_to_geojson(line)),
    }
}

fn invalid_type(field: &str, expected: &str) -> ValidationError {
    ValidationError::InvalidType {
        field: field.to_string(),
        expected: expected.to_string(),
    }
}

fn required_str(raw: &Document, field: &str) -> Result<String, ValidationError> {
    optional_str(raw, field)?.ok_or_else(|| ValidationError::MissingField(field.to_string()))
}

fn optional_str(raw: &Document, field: &str) -> Result<Option<String>, ValidationError> {
    match raw.get(field) {
        None | Some(Bson::Null) => Ok(None),
        Some(Bson::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(invalid_type(field, "a string")),
    }
}

fn bson_to_datetime(value: &Bson, field: &str) -> Result<DateTime<Utc>, ValidationError> {
    match value {
        Bson::DateTime(dt) => Ok(dt.to_chrono()),
        Bson::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| truncate_millis(dt.with_timezone(&Utc)))
            .map_err(|_| invalid_type(field, "an RFC 3339 timestamp")),
        _ => Err(invalid_type(field, "a timestamp")),
    }
}

fn required_datetime(raw: &Document, field: &str) -> Result<DateTime<Utc>, ValidationError> {
    optional_datetime(raw, field)?.ok_or_else(|| ValidationError::MissingField(field.to_string()))
}

fn optional_datetime(
    raw: &Document,
    field: &str,
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    match raw.get(field) {
        None | Some(Bson::Null) => Ok(None),
        Some(v) => bson_to_datetime(v, field).map(Some),
    }
}

fn string_array(raw: &Document, field: &str, required: bool) -> Result<Vec<String>, ValidationError> {
    match raw.get(field) {
        None | Some(Bson::Null) if required => Err(ValidationError::MissingField(field.to_string())),
        None | Some(Bson::Null) => Ok(Vec::new()),
        Some(Bson::Array(items)) => items
            .iter()
            .map(|item| match item {
                Bson::String(s) => Ok(s.clone()),
                _ => Err(invalid_type(field, "an array of strings")),
            })
            .collect(),
        Some(_) => Err(invalid_type(field, "an array of strings")),
    }
}

pub(crate) fn bson_to_positions(value: &Bson) -> Option<Vec<Position>> {
    let Bson::Array(items) = value else {
        return None;
    };
    items
        .iter()
        .map(|item| match item {
            Bson::Array(pair) if pair.len() == 2 => {
                Some([bson_to_f64(&pair[0])?, bson_to_f64(&pair[1])?])
            }
            _ => None,
        })
        .collect()
}

pub(crate) fn bson_to_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Double(f) => Some(*f),
        Bson::Int32(i) => Some(f64::from(*i)),
        Bson::Int64(i) => Some(*i as f64),
        _ => None,
    }
}

/// Parse a GeoJSON geometry of the given type and return its coordinates.
fn geojson_coordinates<'a>(value: &'a Bson, geometry: &str) -> Option<&'a Bson> {
    let Bson::Document(d) = value else {
        return None;
    };
    match d.get("type") {
        Some(Bson::String(t)) if t == geometry => d.get("coordinates"),
        _ => None,
    }
}

pub(crate) fn bson_to_polygon(value: &Bson) -> Option<Polygon> {
    let Some(Bson::Array(rings)) = geojson_coordinates(value, "Polygon") else {
        return None;
    };
    // Holes are not part of the model.
    if rings.len() != 1 {
        return None;
    }
    Polygon::new(bson_to_positions(&rings[0])?)
}

pub(crate) fn bson_to_linestring(value: &Bson) -> Option<LineString> {
    LineString::new(bson_to_positions(geojson_coordinates(value, "LineString")?)?)
}

fn optional_polygon(raw: &Document, field: &str) -> Result<Option<Polygon>, ValidationError> {
    match raw.get(field) {
        None | Some(Bson::Null) => Ok(None),
        Some(v) => bson_to_polygon(v)
            .map(Some)
            .ok_or_else(|| invalid_type(field, "a GeoJSON Polygon with a single closed ring")),
    }
}

fn parameters(raw: &Document) -> Result<BTreeMap<String, Parameter>, ValidationError> {
    let params = match raw.get("parameters") {
        None | Some(Bson::Null) => return Ok(BTreeMap::new()),
        Some(Bson::Document(d)) => d,
        Some(_) => return Err(invalid_type("parameters", "a sub-document")),
    };

    let mut out = BTreeMap::new();
    for (name, entry) in params {
        let field = format!("parameters.{name}");
        let Bson::Document(entry) = entry else {
            return Err(invalid_type(&field, "a {value, creation_time} sub-document"));
        };
        let value = match entry.get("value") {
            None | Some(Bson::Null) => return Err(ValidationError::MissingField(format!("{field}.value"))),
            Some(Bson::String(s)) => ParameterValue::Text(s.clone()),
            Some(Bson::Int32(i)) => ParameterValue::Integer(i64::from(*i)),
            Some(Bson::Int64(i)) => ParameterValue::Integer(*i),
            Some(Bson::Double(f)) => ParameterValue::Float(*f),
            Some(Bson::Boolean(b)) => ParameterValue::Boolean(*b),
            Some(Bson::DateTime(dt)) => ParameterValue::Timestamp(dt.to_chrono()),
            Some(other @ Bson::Document(_)) => ParameterValue::LineString(
                bson_to_linestring(other)
                    .ok_or_else(|| invalid_type(&field, "a scalar or a GeoJSON LineString"))?,
            ),
            Some(_) => return Err(invalid_type(&field, "a scalar or a GeoJSON LineString")),
        };
        let creation_time = required_datetime(entry, "creation_time").map_err(|e| match e {
            ValidationError::MissingField(_) => {
                ValidationError::MissingField(format!("{field}.creation_time"))
            }
            _ => invalid_type(&format!("{field}.creation_time"), "a timestamp"),
        })?;
        out.insert(
            name.clone(),
            Parameter {
                value,
                creation_time,
            },
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn full_record() -> CatalogRecord {
        CatalogRecord::new(
            "20130115140355_NOAA_15.hmf",
            "binary",
            "HRPT",
            "NOAA-15",
            "ssh://pps.smhi.se//san1/polar_in/20130115140355_NOAA_15.hmf",
        )
        .with_sensor("avhrr")
        .with_time_range(ts(1_358_258_635), ts(1_358_259_547))
        .with_creation_time(ts(1_358_259_600))
        .with_uri("file:///mirror/20130115140355_NOAA_15.hmf")
        .with_tag("direct_readout")
        .with_tag("norrkoping")
        .with_boundary(
            Polygon::new(vec![[10.0, 50.0], [30.0, 50.0], [30.0, 70.0], [10.0, 70.0]]).unwrap(),
        )
        .with_parameter(
            "orbit_number",
            Parameter::at(ParameterValue::Integer(76310), ts(1_358_259_600)),
        )
        .with_parameter(
            "level",
            Parameter::at(ParameterValue::Text("0".to_string()), ts(1_358_259_600)),
        )
        .with_parameter(
            "sub_satellite_track",
            Parameter::at(
                ParameterValue::LineString(
                    LineString::new(vec![[15.0, 55.0], [16.0, 58.5], [17.2, 62.0]]).unwrap(),
                ),
                ts(1_358_259_600),
            ),
        )
    }

    #[test]
    fn test_round_trip() {
        let schema = Schema::new();
        let records = [
            full_record(),
            CatalogRecord::new("minimal", "binary", "HRPT", "NOAA-19", "file:///x")
                .with_creation_time(ts(1_700_000_000)),
        ];
        for record in records {
            let raw = schema.serialize(&record);
            assert_eq!(schema.validate(&raw).unwrap(), record);
        }
    }

    #[test]
    fn test_validate_ignores_internal_fields() {
        let schema = Schema::new();
        let record = full_record();
        let mut raw = schema.serialize(&record);
        raw.insert("_id", bson::oid::ObjectId::new());
        raw.insert(REVISION_FIELD, 3_i64);
        assert_eq!(schema.validate(&raw).unwrap(), record);
    }

    #[test]
    fn test_validate_missing_required_field() {
        let schema = Schema::new();
        let mut raw = schema.serialize(&full_record());
        raw.remove("platform_name");
        assert_eq!(
            schema.validate(&raw).unwrap_err(),
            ValidationError::MissingField("platform_name".to_string())
        );
    }

    #[test]
    fn test_validate_empty_uris() {
        let schema = Schema::new();
        let mut raw = schema.serialize(&full_record());
        raw.insert("uris", Vec::<String>::new());
        assert_eq!(schema.validate(&raw).unwrap_err(), ValidationError::EmptyUris);
    }

    #[test]
    fn test_validate_time_order() {
        let schema = Schema::new();
        let mut raw = schema.serialize(&full_record());
        raw.insert("end_time", to_bson_datetime(ts(1_000)));
        assert!(matches!(
            schema.validate(&raw).unwrap_err(),
            ValidationError::TimeOrder { .. }
        ));
    }

    #[test]
    fn test_validate_coerces_rfc3339_strings() {
        let schema = Schema::new();
        let mut raw = schema.serialize(&full_record());
        raw.insert("start_time", "2013-01-15T14:03:55Z");
        let record = schema.validate(&raw).unwrap();
        assert_eq!(record.start_time, Some(ts(1_358_258_635)));
    }

    #[test]
    fn test_validate_rejects_wrong_types() {
        let schema = Schema::new();
        let mut raw = schema.serialize(&full_record());
        raw.insert("is_archived", "yes");
        assert!(matches!(
            schema.validate(&raw).unwrap_err(),
            ValidationError::InvalidType { field, .. } if field == "is_archived"
        ));

        let mut raw = schema.serialize(&full_record());
        raw.insert("tags", vec![Bson::Int32(1)]);
        assert!(matches!(
            schema.validate(&raw).unwrap_err(),
            ValidationError::InvalidType { field, .. } if field == "tags"
        ));
    }

    #[test]
    fn test_serialized_shape() {
        let schema = Schema::new();
        let raw = schema.serialize(&full_record());
        assert_eq!(raw.get_str("platform_name").unwrap(), "NOAA-15");
        assert_eq!(
            raw.get_document("boundary").unwrap().get_str("type").unwrap(),
            "Polygon"
        );
        let track = raw
            .get_document("parameters")
            .unwrap()
            .get_document("sub_satellite_track")
            .unwrap()
            .get_document("value")
            .unwrap();
        assert_eq!(track.get_str("type").unwrap(), "LineString");
        assert!(raw.get(REVISION_FIELD).is_none());
    }

    #[test]
    fn test_declared_parameter_fields() {
        let schema = Schema::new().with_parameter("orbit_number", ParameterKind::Integer);
        let def = schema.field("parameters.orbit_number").unwrap();
        assert_eq!(def.kind, FieldKind::Integer);
        assert_eq!(def.path, "parameters.orbit_number.value");
        assert!(def.sortable);
        assert!(schema.field("parameters.level").is_none());
    }

    #[test]
    fn test_check_rejects_blank_identity() {
        let mut record = full_record();
        record.uid = "  ".to_string();
        assert!(matches!(
            check(&record).unwrap_err(),
            ValidationError::InvalidValue { field, .. } if field == "uid"
        ));
    }

    #[test]
    fn test_check_rejects_non_finite_float_parameter() {
        for v in [f64::NAN, f64::INFINITY] {
            let record = full_record()
                .with_parameter("snr", Parameter::at(ParameterValue::Float(v), ts(1_358_259_600)));
            assert!(matches!(
                check(&record).unwrap_err(),
                ValidationError::InvalidValue { field, .. } if field == "parameters.snr"
            ));
        }
    }

    #[test]
    fn test_validate_rejects_out_of_range_boundary() {
        let schema = Schema::new();
        let mut raw = schema.serialize(&full_record());
        raw.insert(
            "boundary",
            doc! {
                "type": "Polygon",
                "coordinates": [[[0.0, 0.0], [500.0, 0.0], [500.0, 120.0], [0.0, 0.0]]],
            },
        );
        assert!(matches!(
            schema.validate(&raw).unwrap_err(),
            ValidationError::InvalidType { field, .. } if field == "boundary"
        ));
    }
}
