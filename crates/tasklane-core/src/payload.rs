//! Typed key/value payload container for task inputs, outputs, and messages.
//!
//! A [`Payload`] is a map from string keys to [`Value`] entries. Containers
//! are value-typed: cloning produces a fully independent map, nested
//! containers included. The engine never serializes payloads; the serde
//! derives and JSON conversions exist for injected codecs and tests.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A single payload entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Map(Payload),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<Payload> for Value {
    fn from(value: Payload) -> Self {
        Value::Map(value)
    }
}

/// Map of string keys to typed values. Insertion order is not preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    entries: HashMap<String, Value>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a key to a value, replacing any previous entry.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Builder-style `set`, for literal construction in tests and handlers.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(Value::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.entries.get(key) {
            Some(Value::Int(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.entries.get(key) {
            Some(Value::Float(f)) => Some(*f),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.entries.get(key) {
            Some(Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.entries.get(key) {
            Some(Value::Bytes(b)) => Some(b.as_slice()),
            _ => None,
        }
    }

    pub fn get_map(&self, key: &str) -> Option<&Payload> {
        match self.entries.get(key) {
            Some(Value::Map(m)) => Some(m),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// Convert to a JSON value for injected codecs.
    ///
    /// Bytes become arrays of numbers; nested containers become objects.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), value_to_json(v)))
            .collect();
        serde_json::Value::Object(map)
    }

    /// Build a payload from a JSON object.
    ///
    /// The root must be an object. Arrays are rejected: the container has
    /// no list type.
    pub fn from_json(value: &serde_json::Value) -> anyhow::Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("payload JSON root must be an object"))?;
        let mut payload = Payload::new();
        for (k, v) in obj {
            payload.entries.insert(k.clone(), json_to_value(v)?);
        }
        Ok(payload)
    }
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Int(n) => serde_json::Value::Number((*n).into()),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Bytes(b) => {
            serde_json::Value::Array(b.iter().map(|byte| (*byte as i64).into()).collect())
        }
        Value::Map(m) => m.to_json(),
    }
}

fn json_to_value(value: &serde_json::Value) -> anyhow::Result<Value> {
    match value {
        serde_json::Value::String(s) => Ok(Value::Str(s.clone())),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Float(f))
            } else {
                Err(anyhow::anyhow!("unsupported JSON number: {}", n))
            }
        }
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::Object(_) => Ok(Value::Map(Payload::from_json(value)?)),
        serde_json::Value::Array(_) => {
            Err(anyhow::anyhow!("payload container has no list type"))
        }
        serde_json::Value::Null => Err(anyhow::anyhow!("payload container has no null type")),
    }
}
