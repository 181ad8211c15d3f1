//! Filter compilation.
//!
//! A [`FilterSpec`] is the loosely-typed expression tree clients send. The
//! [`FilterCompiler`] checks it against the [`Schema`], coerces every value
//! to its field's declared kind and produces a [`Predicate`]. Compilation is
//! pure: it never touches the store.

use std::cmp::Ordering;
use std::str::FromStr;

use bson::{Bson, Document, doc};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, de};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::debug;

use crate::storage::error::FilterError;
use crate::storage::schema::{
    FieldDef, FieldKind, Schema, bson_to_f64, bson_to_linestring, bson_to_polygon,
    polygon_to_geojson, to_bson_datetime,
};
use crate::storage::types::{Polygon, Position};

// =============================================================================
// Filter input
// =============================================================================

/// Leaf operators accepted in a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Contains,
    #[strum(to_string = "within-boundary", serialize = "within_boundary")]
    WithinBoundary,
}

/// One `(field, operator, value)` leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Condition {
    pub field: String,
    /// Kept as text so an unknown operator is reported by the compiler.
    pub op: String,
    pub value: Value,
}

/// A client filter expression.
///
/// JSON form: `{"and": [..]}`, `{"or": [..]}`, `{"not": {..}}` or a leaf
/// `{"field": .., "op": .., "value": ..}`.
///
/// A combinator key must be the only key of its node, and a leaf carries
/// no keys besides its own three.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FilterSpec {
    And { and: Vec<FilterSpec> },
    Or { or: Vec<FilterSpec> },
    Not { not: Box<FilterSpec> },
    Condition(Condition),
}

impl<'de> Deserialize<'de> for FilterSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut node = Map::<String, Value>::deserialize(deserializer)?;

        let Some(key) = ["and", "or", "not"].into_iter().find(|k| node.contains_key(*k)) else {
            return Condition::deserialize(Value::Object(node))
                .map(Self::Condition)
                .map_err(de::Error::custom);
        };
        if node.len() > 1 {
            let keys: Vec<&str> = node.keys().map(String::as_str).collect();
            return Err(de::Error::custom(format!(
                "`{key}` must be the only key of a filter node, found {keys:?}"
            )));
        }

        let body = node.remove(key).unwrap_or(Value::Null);
        match key {
            "and" => Vec::<FilterSpec>::deserialize(body).map(|and| Self::And { and }),
            "or" => Vec::<FilterSpec>::deserialize(body).map(|or| Self::Or { or }),
            _ => FilterSpec::deserialize(body).map(|not| Self::Not { not: Box::new(not) }),
        }
        .map_err(de::Error::custom)
    }
}

impl Default for FilterSpec {
    fn default() -> Self {
        Self::all()
    }
}

impl FilterSpec {
    /// The empty filter, matching every record.
    pub fn all() -> Self {
        Self::And { and: Vec::new() }
    }

    pub fn condition(field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Self::Condition(Condition {
            field: field.into(),
            op: op.to_string(),
            value: value.into(),
        })
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(field, Operator::Eq, value)
    }

    pub fn all_of(children: Vec<FilterSpec>) -> Self {
        Self::And { and: children }
    }

    pub fn any_of(children: Vec<FilterSpec>) -> Self {
        Self::Or { or: children }
    }

    pub fn negate(child: FilterSpec) -> Self {
        Self::Not {
            not: Box::new(child),
        }
    }

    /// Parse the JSON form.
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

// =============================================================================
// Compiled predicate
// =============================================================================

/// Scalar comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    fn as_mongo(self) -> &'static str {
        match self {
            Self::Eq => "$eq",
            Self::Ne => "$ne",
            Self::Gt => "$gt",
            Self::Gte => "$gte",
            Self::Lt => "$lt",
            Self::Lte => "$lte",
        }
    }
}

/// A compiled, store-native filter. Paths are stored document paths.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    All,
    None,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Compare {
        path: String,
        op: Comparison,
        value: Bson,
    },
    In {
        path: String,
        values: Vec<Bson>,
    },
    /// Set-valued field contains every listed value.
    ContainsAll {
        path: String,
        values: Vec<Bson>,
    },
    /// Geometry lies entirely inside the polygon.
    WithinPolygon {
        path: String,
        polygon: Polygon,
    },
}

impl Predicate {
    /// Render as a MongoDB query document.
    pub fn to_document(&self) -> Document {
        match self {
            Self::All => Document::new(),
            Self::None => doc! { "$expr": false },
            Self::And(children) if children.is_empty() => Document::new(),
            Self::And(children) => doc! {
                "$and": children.iter().map(|c| Bson::Document(c.to_document())).collect::<Vec<_>>(),
            },
            Self::Or(children) if children.is_empty() => Self::None.to_document(),
            Self::Or(children) => doc! {
                "$or": children.iter().map(|c| Bson::Document(c.to_document())).collect::<Vec<_>>(),
            },
            Self::Not(child) => doc! { "$nor": [child.to_document()] },
            Self::Compare { path, op, value } => {
                doc! { path.as_str(): { op.as_mongo(): value.clone() } }
            }
            Self::In { path, values } => doc! { path.as_str(): { "$in": values.clone() } },
            Self::ContainsAll { path, values } => {
                doc! { path.as_str(): { "$all": values.clone() } }
            }
            Self::WithinPolygon { path, polygon } => doc! {
                path.as_str(): { "$geoWithin": { "$geometry": polygon_to_geojson(polygon) } }
            },
        }
    }

    /// Evaluate against a stored document with the store's matching rules.
    ///
    /// Array fields match when any element does; `$ne` matches documents
    /// missing the field; comparisons never cross type brackets. Geometry
    /// containment is planar on `[lon, lat]`.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::All => true,
            Self::None => false,
            Self::And(children) => children.iter().all(|c| c.matches(doc)),
            Self::Or(children) => children.iter().any(|c| c.matches(doc)),
            Self::Not(child) => !child.matches(doc),
            Self::Compare { path, op, value } => {
                let candidates = candidates(lookup(doc, path));
                let any_equal = || candidates.iter().any(|c| values_equal(c, value));
                match op {
                    Comparison::Eq => any_equal(),
                    Comparison::Ne => !any_equal(),
                    range => candidates.iter().any(|c| {
                        compare_values(c, value).is_some_and(|ord| match range {
                            Comparison::Gt => ord == Ordering::Greater,
                            Comparison::Gte => ord != Ordering::Less,
                            Comparison::Lt => ord == Ordering::Less,
                            _ => ord != Ordering::Greater,
                        })
                    }),
                }
            }
            Self::In { path, values } => {
                let candidates = candidates(lookup(doc, path));
                values
                    .iter()
                    .any(|v| candidates.iter().any(|c| values_equal(c, v)))
            }
            Self::ContainsAll { path, values } => {
                let candidates = candidates(lookup(doc, path));
                !values.is_empty()
                    && values
                        .iter()
                        .all(|v| candidates.iter().any(|c| values_equal(c, v)))
            }
            Self::WithinPolygon { path, polygon } => lookup(doc, path)
                .and_then(geometry_points)
                .is_some_and(|points| points.iter().all(|p| polygon.contains_point(*p))),
        }
    }
}

/// Resolve a dotted path inside a document.
pub(crate) fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Bson::Document(d) => d.get(part)?,
            _ => return None,
        };
    }
    Some(current)
}

fn candidates(value: Option<&Bson>) -> Vec<&Bson> {
    match value {
        None => Vec::new(),
        Some(Bson::Array(items)) => items.iter().collect(),
        Some(v) => vec![v],
    }
}

fn geometry_points(value: &Bson) -> Option<Vec<Position>> {
    if let Some(polygon) = bson_to_polygon(value) {
        return Some(polygon.ring().to_vec());
    }
    bson_to_linestring(value).map(|line| line.points().to_vec())
}

fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(i) => Some(i64::from(*i)),
        Bson::Int64(i) => Some(*i),
        _ => None,
    }
}

/// Order two values of the same type bracket; `None` across brackets.
pub(crate) fn compare_values(a: &Bson, b: &Bson) -> Option<Ordering> {
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        _ => match (as_i64(a), as_i64(b)) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => bson_to_f64(a)?.partial_cmp(&bson_to_f64(b)?),
        },
    }
}

fn values_equal(a: &Bson, b: &Bson) -> bool {
    compare_values(a, b).map_or(a == b, |ord| ord == Ordering::Equal)
}

// =============================================================================
// Compiler
// =============================================================================

/// Compiles [`FilterSpec`] trees against a schema.
#[derive(Debug, Clone, Copy)]
pub struct FilterCompiler<'a> {
    schema: &'a Schema,
}

impl<'a> FilterCompiler<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    pub fn compile(&self, spec: &FilterSpec) -> Result<Predicate, FilterError> {
        let predicate = self.compile_node(spec)?;
        debug!(predicate = %predicate.to_document(), "Compiled filter");
        Ok(predicate)
    }

    fn compile_node(&self, spec: &FilterSpec) -> Result<Predicate, FilterError> {
        match spec {
            FilterSpec::And { and } if and.is_empty() => Ok(Predicate::All),
            FilterSpec::And { and } => Ok(Predicate::And(
                and.iter()
                    .map(|c| self.compile_node(c))
                    .collect::<Result<_, _>>()?,
            )),
            FilterSpec::Or { or } if or.is_empty() => Ok(Predicate::None),
            FilterSpec::Or { or } => Ok(Predicate::Or(
                or.iter()
                    .map(|c| self.compile_node(c))
                    .collect::<Result<_, _>>()?,
            )),
            FilterSpec::Not { not } => Ok(Predicate::Not(Box::new(self.compile_node(not)?))),
            FilterSpec::Condition(cond) => self.compile_condition(cond),
        }
    }

    fn compile_condition(&self, cond: &Condition) -> Result<Predicate, FilterError> {
        let def = self
            .schema
            .field(&cond.field)
            .ok_or_else(|| FilterError::UnknownField {
                field: cond.field.clone(),
            })?;
        let op = Operator::from_str(&cond.op).map_err(|_| FilterError::UnknownOperator {
            operator: cond.op.clone(),
        })?;
        if !operator_allowed(def.kind, op) {
            return Err(FilterError::IncompatibleOperator {
                field: def.name.clone(),
                operator: op.to_string(),
            });
        }

        let path = def.path.clone();
        let compare = |op: Comparison| -> Result<Predicate, FilterError> {
            Ok(Predicate::Compare {
                path: def.path.clone(),
                op,
                value: coerce(def, &cond.value)?,
            })
        };

        match op {
            Operator::Eq => compare(Comparison::Eq),
            Operator::Ne => compare(Comparison::Ne),
            Operator::Gt => compare(Comparison::Gt),
            Operator::Gte => compare(Comparison::Gte),
            Operator::Lt => compare(Comparison::Lt),
            Operator::Lte => compare(Comparison::Lte),
            Operator::In => Ok(Predicate::In {
                values: coerce_list(def, &cond.value)?,
                path,
            }),
            Operator::Contains => {
                let values = match &cond.value {
                    Value::Array(_) => coerce_list(def, &cond.value)?,
                    single => vec![coerce(def, single)?],
                };
                Ok(Predicate::ContainsAll { path, values })
            }
            Operator::WithinBoundary => Ok(Predicate::WithinPolygon {
                polygon: coerce_polygon(&cond.value).ok_or_else(|| {
                    invalid(
                        def,
                        &cond.value,
                        "expected a GeoJSON Polygon or a ring of [lon, lat] pairs",
                    )
                })?,
                path,
            }),
        }
    }
}

fn operator_allowed(kind: FieldKind, op: Operator) -> bool {
    use Operator::*;

    match kind {
        FieldKind::Keyword => matches!(op, Eq | Ne | In),
        FieldKind::Timestamp | FieldKind::Integer | FieldKind::Float => {
            matches!(op, Eq | Ne | Gt | Gte | Lt | Lte | In)
        }
        FieldKind::Boolean => matches!(op, Eq | Ne),
        FieldKind::KeywordSet => op == Contains,
        FieldKind::Polygon | FieldKind::LineString => op == WithinBoundary,
    }
}

fn invalid(def: &FieldDef, value: &Value, reason: &str) -> FilterError {
    FilterError::InvalidValue {
        field: def.name.clone(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn coerce_list(def: &FieldDef, value: &Value) -> Result<Vec<Bson>, FilterError> {
    match value {
        Value::Array(items) if !items.is_empty() => {
            items.iter().map(|item| coerce(def, item)).collect()
        }
        _ => Err(invalid(def, value, "expected a non-empty list")),
    }
}

/// Coerce a scalar to the field's declared kind.
fn coerce(def: &FieldDef, value: &Value) -> Result<Bson, FilterError> {
    match def.kind {
        FieldKind::Keyword | FieldKind::KeywordSet => match value {
            Value::String(s) => Ok(Bson::String(s.clone())),
            Value::Number(n) => Ok(Bson::String(n.to_string())),
            _ => Err(invalid(def, value, "expected a string")),
        },
        FieldKind::Timestamp => value
            .as_str()
            .and_then(parse_timestamp)
            .map(to_bson_datetime)
            .ok_or_else(|| invalid(def, value, "expected an ISO 8601 timestamp")),
        FieldKind::Integer => match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
        .map(Bson::Int64)
        .ok_or_else(|| invalid(def, value, "expected an integer")),
        FieldKind::Float => match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|f| f.is_finite())
        .map(Bson::Double)
        .ok_or_else(|| invalid(def, value, "expected a number")),
        FieldKind::Boolean => match value {
            Value::Bool(b) => Some(*b),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        }
        .map(Bson::Boolean)
        .ok_or_else(|| invalid(def, value, "expected a boolean")),
        FieldKind::Polygon | FieldKind::LineString => {
            Err(invalid(def, value, "geometry fields only support within-boundary"))
        }
    }
}

/// Parse RFC 3339, or a naive date/time taken as UTC.
pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn json_positions(value: &Value) -> Option<Vec<Position>> {
    value
        .as_array()?
        .iter()
        .map(|p| match p.as_array()?.as_slice() {
            [lon, lat] => Some([lon.as_f64()?, lat.as_f64()?]),
            _ => None,
        })
        .collect()
}

fn coerce_polygon(value: &Value) -> Option<Polygon> {
    match value {
        Value::Object(obj) => {
            if obj.get("type")?.as_str()? != "Polygon" {
                return None;
            }
            match obj.get("coordinates")?.as_array()?.as_slice() {
                [ring] => Polygon::new(json_positions(ring)?),
                _ => None,
            }
        }
        Value::Array(_) => Polygon::new(json_positions(value)?),
        _ => None,
    }
}
