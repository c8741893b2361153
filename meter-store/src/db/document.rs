use std::{cmp::Ordering, collections::BTreeMap};

use serde_json::{Map, Number};
use time::OffsetDateTime;

use super::error::StoreError;

/// Field map of a stored document.
pub type Document = BTreeMap<String, Value>;

/// Key used to tag timestamps inside stored JSON bodies.
const TIMESTAMP_TAG: &str = "$ts";

/// A typed document field.
///
/// Values of different kinds order as null < bool < number < timestamp <
/// string < map. Integers and floats compare numerically with each other.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Timestamp(OffsetDateTime),
    String(String),
    Map(Document),
    /// Sentinel replaced with the store clock when the document is written.
    ServerTimestamp,
}

impl Value {
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Timestamp(_) | Value::ServerTimestamp => 3,
            Value::String(_) => 4,
            Value::Map(_) => 5,
        }
    }

    /// Total order used for sorting query results.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        let rank = self.type_rank().cmp(&other.type_rank());
        if rank != Ordering::Equal {
            return rank;
        }

        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                let a = self.as_f64().unwrap_or(f64::NAN);
                let b = other.as_f64().unwrap_or(f64::NAN);
                a.total_cmp(&b)
            }
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Map(a), Value::Map(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let ord = ka.cmp(kb).then_with(|| va.total_cmp(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => Ordering::Equal,
        }
    }

    /// Filter comparison. Values of different kinds never match.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        if self.type_rank() != other.type_rank() {
            return None;
        }
        if self.as_f64().is_some_and(f64::is_nan) || other.as_f64().is_some_and(f64::is_nan) {
            return None;
        }
        Some(self.total_cmp(other))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<OffsetDateTime> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Document> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Encodes the value for a JSON document body. Timestamps become
    /// `{"$ts": <unix micros>}` so they survive a round trip.
    pub fn to_stored_json(&self) -> serde_json::Value {
        match self {
            Value::Null | Value::ServerTimestamp => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Float(f) => Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Timestamp(ts) => {
                let micros = (ts.unix_timestamp_nanos() / 1_000) as i64;
                let mut m = Map::new();
                m.insert(TIMESTAMP_TAG.to_string(), serde_json::Value::Number(micros.into()));
                serde_json::Value::Object(m)
            }
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Map(doc) => document_to_json(doc),
        }
    }

    pub fn from_stored_json(json: serde_json::Value) -> Result<Value, StoreError> {
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(_) => {
                return Err(StoreError::InvalidData("arrays are not supported in documents".to_string()))
            }
            serde_json::Value::Object(m) => {
                if m.len() == 1 {
                    if let Some(micros) = m.get(TIMESTAMP_TAG).and_then(|v| v.as_i64()) {
                        let ts = OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
                            .map_err(|e| StoreError::InvalidData(format!("invalid timestamp {micros}: {e}")))?;
                        return Ok(Value::Timestamp(ts));
                    }
                }
                Value::Map(document_from_json_map(m)?)
            }
        })
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<OffsetDateTime> for Value {
    fn from(ts: OffsetDateTime) -> Self {
        Value::Timestamp(ts)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Map(doc)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

pub fn document_to_json(doc: &Document) -> serde_json::Value {
    let mut m = Map::new();
    for (k, v) in doc {
        m.insert(k.clone(), v.to_stored_json());
    }
    serde_json::Value::Object(m)
}

pub fn document_from_json(json: serde_json::Value) -> Result<Document, StoreError> {
    match json {
        serde_json::Value::Object(m) => document_from_json_map(m),
        other => Err(StoreError::InvalidData(format!("document body is not an object: {other}"))),
    }
}

fn document_from_json_map(m: Map<String, serde_json::Value>) -> Result<Document, StoreError> {
    m.into_iter()
        .map(|(k, v)| Ok((k, Value::from_stored_json(v)?)))
        .collect()
}

/// Typed getters over a [`Document`]. A null field reads as absent.
pub trait FieldAccess {
    fn field(&self, name: &str) -> Option<&Value>;

    fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    fn f64_field(&self, name: &str) -> Option<f64> {
        self.field(name).and_then(Value::as_f64)
    }

    fn i64_field(&self, name: &str) -> Option<i64> {
        self.field(name).and_then(Value::as_i64)
    }

    fn bool_field(&self, name: &str) -> Option<bool> {
        self.field(name).and_then(Value::as_bool)
    }

    fn timestamp_field(&self, name: &str) -> Option<OffsetDateTime> {
        self.field(name).and_then(Value::as_timestamp)
    }
}

impl FieldAccess for Document {
    fn field(&self, name: &str) -> Option<&Value> {
        self.get(name).filter(|v| !v.is_null())
    }
}

/// Splits a dotted field path (`f_monthly_total_m3.2024_03`).
pub fn field_path(field: &str) -> Vec<&str> {
    field.split('.').collect()
}

pub fn get_path<'a>(doc: &'a Document, path: &[&str]) -> Option<&'a Value> {
    let (last, parents) = path.split_last()?;
    let mut current = doc;
    for seg in parents {
        current = current.get(*seg)?.as_map()?;
    }
    current.get(*last)
}

/// Walks to the map holding the last segment, replacing non-map ancestors
/// with empty maps.
fn parent_map_mut<'a>(doc: &'a mut Document, parents: &[&str]) -> &'a mut Document {
    let mut current = doc;
    for seg in parents {
        let entry = current
            .entry((*seg).to_string())
            .or_insert_with(|| Value::Map(Document::new()));
        if !matches!(entry, Value::Map(_)) {
            *entry = Value::Map(Document::new());
        }
        current = match entry {
            Value::Map(m) => m,
            _ => unreachable!("entry was just replaced with a map"),
        };
    }
    current
}

pub fn set_path(doc: &mut Document, path: &[&str], value: Value) {
    if let Some((last, parents)) = path.split_last() {
        parent_map_mut(doc, parents).insert((*last).to_string(), value);
    }
}

/// Adds `by` to a numeric field. A missing or non-numeric field is treated
/// as zero.
pub fn increment_path(doc: &mut Document, path: &[&str], by: f64) {
    if let Some((last, parents)) = path.split_last() {
        let map = parent_map_mut(doc, parents);
        let current = map.get(*last).and_then(Value::as_f64).unwrap_or(0.0);
        map.insert((*last).to_string(), Value::Float(current + by));
    }
}

/// Deep merge: nested maps are merged key by key, everything else replaces.
pub fn merge_into(target: &mut Document, patch: Document) {
    for (key, value) in patch {
        match (target.get_mut(&key), value) {
            (Some(Value::Map(existing)), Value::Map(incoming)) => merge_into(existing, incoming),
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

pub fn resolve_server_timestamps(doc: &mut Document, now: OffsetDateTime) {
    for value in doc.values_mut() {
        resolve_value(value, now);
    }
}

pub fn resolve_value(value: &mut Value, now: OffsetDateTime) {
    match value {
        Value::ServerTimestamp => *value = Value::Timestamp(now),
        Value::Map(m) => resolve_server_timestamps(m, now),
        _ => {}
    }
}
