//! Response assembly.
//!
//! Renders records as JSON objects restricted to a [`Projection`], with
//! timestamps in one canonical form (RFC 3339, milliseconds, `Z`) and
//! geometries as GeoJSON.

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::storage::error::FilterError;
use crate::storage::pagination::ResultPage;
use crate::storage::schema::Schema;
use crate::storage::types::{CatalogRecord, LineString, ParameterValue, Polygon, Position};

/// A field subset to include in responses. `uid` is always included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    /// `None` selects every field.
    fields: Option<BTreeSet<String>>,
}

impl Projection {
    pub fn all() -> Self {
        Self::default()
    }

    /// Build a projection, rejecting names the schema does not know.
    ///
    /// Accepts top-level record fields and declared `parameters.<name>` fields.
    pub fn fields<I, S>(schema: &Schema, names: I) -> Result<Self, FilterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut fields = BTreeSet::from(["uid".to_string()]);
        for name in names {
            let name = name.as_ref();
            let known = schema.projectable(name)
                || (name.starts_with("parameters.") && schema.field(name).is_some());
            if !known {
                return Err(FilterError::UnknownField {
                    field: name.to_string(),
                });
            }
            fields.insert(name.to_string());
        }
        Ok(Self {
            fields: Some(fields),
        })
    }

    fn includes(&self, name: &str) -> bool {
        self.fields.as_ref().is_none_or(|f| f.contains(name))
    }

    /// Whether any part of the parameter map is selected.
    fn includes_parameter(&self, name: &str) -> bool {
        self.includes("parameters") || self.includes(&format!("parameters.{name}"))
    }
}

/// Paging metadata echoed back to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageInfo {
    pub size: u32,
    pub offset: u64,
    pub returned: usize,
    pub next_cursor: Option<String>,
    pub total: Option<u64>,
}

/// The shaped result handed back to the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponsePayload {
    pub records: Vec<Value>,
    pub page: PageInfo,
}

/// Shapes result pages into response payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseAssembler;

impl ResponseAssembler {
    pub fn assemble(&self, page: &ResultPage, projection: &Projection) -> ResponsePayload {
        ResponsePayload {
            records: page
                .records
                .iter()
                .map(|r| self.render(r, projection))
                .collect(),
            page: PageInfo {
                size: page.page_size,
                offset: page.offset,
                returned: page.records.len(),
                next_cursor: page.next_cursor.clone(),
                total: page.total,
            },
        }
    }

    /// Render one record as a JSON object.
    pub fn render(&self, record: &CatalogRecord, projection: &Projection) -> Value {
        let mut out = Map::new();
        let mut put = |name: &str, value: Value| {
            if projection.includes(name) {
                out.insert(name.to_string(), value);
            }
        };

        put("uid", json!(record.uid));
        put("file_type", json!(record.file_type));
        put("file_format", json!(record.file_format));
        put("platform_name", json!(record.platform_name));
        put("sensor", json!(record.sensor));
        put("start_time", json!(record.start_time.map(format_timestamp)));
        put("end_time", json!(record.end_time.map(format_timestamp)));
        put("uris", json!(record.uris));
        put("tags", json!(record.tags));
        put(
            "boundary",
            record.boundary.as_ref().map_or(Value::Null, polygon_json),
        );
        put("is_archived", json!(record.is_archived));
        put("creation_time", json!(format_timestamp(record.creation_time)));

        let params: Map<String, Value> = record
            .parameters
            .iter()
            .filter(|(name, _)| projection.includes_parameter(name))
            .map(|(name, p)| {
                (
                    name.clone(),
                    json!({
                        "value": parameter_json(&p.value),
                        "creation_time": format_timestamp(p.creation_time),
                    }),
                )
            })
            .collect();
        let wants_parameters = projection.includes("parameters")
            || record
                .parameters
                .keys()
                .any(|name| projection.includes_parameter(name));
        if wants_parameters {
            out.insert("parameters".to_string(), Value::Object(params));
        }

        Value::Object(out)
    }
}

/// Canonical timestamp text.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn positions_json(points: &[Position]) -> Value {
    Value::Array(points.iter().map(|[lon, lat]| json!([lon, lat])).collect())
}

fn polygon_json(polygon: &Polygon) -> Value {
    json!({ "type": "Polygon", "coordinates": [positions_json(polygon.ring())] })
}

fn linestring_json(line: &LineString) -> Value {
    json!({ "type": "LineString", "coordinates": positions_json(line.points()) })
}

fn parameter_json(value: &ParameterValue) -> Value {
    match value {
        ParameterValue::Text(s) => json!(s),
        ParameterValue::Integer(i) => json!(i),
        ParameterValue::Float(f) => json!(f),
        ParameterValue::Boolean(b) => json!(b),
        ParameterValue::Timestamp(ts) => json!(format_timestamp(*ts)),
        ParameterValue::LineString(line) => linestring_json(line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{Parameter, ParameterKind};
    use chrono::TimeZone;

    fn record() -> CatalogRecord {
        let ts = Utc.timestamp_millis_opt(1_358_258_635_250).unwrap();
        CatalogRecord::new("a", "binary", "HRPT", "NOAA-15", "file:///a")
            .with_time_range(ts, ts)
            .with_creation_time(ts)
            .with_tag("night")
            .with_parameter("orbit_number", Parameter::at(ParameterValue::Integer(7), ts))
            .with_parameter(
                "level",
                Parameter::at(ParameterValue::Text("0".to_string()), ts),
            )
    }

    #[test]
    fn test_full_render() {
        let value = ResponseAssembler.render(&record(), &Projection::all());
        assert_eq!(value["uid"], "a");
        assert_eq!(value["start_time"], "2013-01-15T14:03:55.250Z");
        assert_eq!(value["sensor"], Value::Null);
        assert_eq!(value["tags"], json!(["night"]));
        assert_eq!(value["parameters"]["orbit_number"]["value"], 7);
    }

    #[test]
    fn test_projection_always_includes_uid() {
        let schema = Schema::new();
        let projection = Projection::fields(&schema, ["platform_name"]).unwrap();
        let value = ResponseAssembler.render(&record(), &projection);
        let mut keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["platform_name", "uid"]);
    }

    #[test]
    fn test_projection_of_single_parameter() {
        let schema = Schema::new().with_parameter("orbit_number", ParameterKind::Integer);
        let projection = Projection::fields(&schema, ["parameters.orbit_number"]).unwrap();
        let value = ResponseAssembler.render(&record(), &projection);
        let params = value["parameters"].as_object().unwrap();
        assert_eq!(params.len(), 1);
        assert!(params.contains_key("orbit_number"));
    }

    #[test]
    fn test_projection_rejects_unknown_fields() {
        let schema = Schema::new();
        assert_eq!(
            Projection::fields(&schema, ["uid", "foo"]).unwrap_err(),
            FilterError::UnknownField {
                field: "foo".to_string()
            }
        );
    }

    #[test]
    fn test_payload_shape() {
        let page = ResultPage {
            records: vec![record()],
            page_size: 2,
            offset: 4,
            next_cursor: None,
            total: Some(5),
        };
        let payload = ResponseAssembler.assemble(&page, &Projection::all());
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json["page"],
            json!({"size": 2, "offset": 4, "returned": 1, "next_cursor": null, "total": 5})
        );
        assert_eq!(json["records"].as_array().unwrap().len(), 1);
    }
}
