//! Structured values exchanged in RPC arguments and results.
//!
//! The protocol carries dynamically typed data: scalars, arrays, and named
//! field structures with a type identifier. [`Value`] serializes untagged, so
//! the CBOR on the wire is plain scalars, arrays, and maps.

use serde::{Deserialize, Serialize};

/// A dynamically typed protocol value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Array(Vec<Value>),
    Struct(Structure),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&Structure> {
        match self {
            Value::Struct(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<Structure> for Value {
    fn from(v: Structure) -> Self {
        Value::Struct(v)
    }
}

/// Default type identifier for structures that do not declare one.
pub const DEFAULT_TYPE_ID: &str = "structure";

/// An ordered set of named fields with a type identifier.
///
/// Field order is part of the wire form, so fields live in a `Vec` rather
/// than a map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    pub type_id: String,
    pub fields: Vec<(String, Value)>,
}

impl Structure {
    pub fn new(type_id: impl Into<String>) -> Self {
        Structure { type_id: type_id.into(), fields: Vec::new() }
    }

    /// Builder-style field append.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Sets a field, replacing an existing field of the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn string_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Default for Structure {
    fn default() -> Self {
        Structure::new(DEFAULT_TYPE_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_and_field_lookup() {
        let s = Structure::new("structure")
            .with("op", "info")
            .with("count", 3i64)
            .with("ratio", 0.5)
            .with("enabled", true);
        assert_eq!(s.string_field("op"), Some("info"));
        assert_eq!(s.field("count"), Some(&Value::Int(3)));
        assert_eq!(s.field("ratio"), Some(&Value::Double(0.5)));
        assert_eq!(s.field("enabled"), Some(&Value::Bool(true)));
        assert_eq!(s.field("missing"), None);
        assert_eq!(s.string_field("count"), None);
    }

    #[test]
    fn set_replaces_existing_field() {
        let mut s = Structure::default();
        s.set("op", "info");
        s.set("op", "help");
        assert_eq!(s.fields.len(), 1);
        assert_eq!(s.string_field("op"), Some("help"));
    }

    #[test]
    fn default_structure_has_plain_type_id() {
        let s = Structure::default();
        assert_eq!(s.type_id, DEFAULT_TYPE_ID);
        assert!(s.is_empty());
    }

    #[test]
    fn cbor_round_trip_covers_all_variants() {
        let nested = Structure::new("epics:nt/NTURI:1.0")
            .with("scheme", "pva")
            .with("query", Structure::default().with("op", "info"));
        let value = Value::from(
            Structure::default()
                .with("flag", false)
                .with("count", -7i64)
                .with("ratio", 2.5)
                .with("name", "server")
                .with("list", vec![Value::Int(1), Value::String("two".into())])
                .with("uri", nested),
        );

        let mut buf = Vec::new();
        ciborium::into_writer(&value, &mut buf).unwrap();
        let back: Value = ciborium::from_reader(buf.as_slice()).unwrap();
        assert_eq!(back, value);
    }
}
