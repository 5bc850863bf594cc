//! Open metadata bag carried by indexed objects
//!
//! Values are a tagged variant so that heterogeneous metadata (flags,
//! counters, names, variable lists, nested documents) survives a round trip
//! through JSON. Typed accessors tell apart a missing key, a stored null and
//! a value of the wrong type.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Key under which an object keeps its importer → variable names summary.
pub const VARIABLES_KEY: &str = "variables";

/// Importer name → sorted variable names.
pub type Variables = BTreeMap<String, Vec<String>>;

/// Errors from typed metadata accessors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetaValueError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key {0} holds a null value")]
    NullValue(String),

    #[error("key {key}: expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// A single metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<MetaValue>),
    Map(BTreeMap<String, MetaValue>),
}

impl MetaValue {
    /// Name of the variant, used in error messages
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// Build a list of strings
    pub fn string_list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::List(items.into_iter().map(|s| Self::String(s.into())).collect())
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<serde_json::Value> for MetaValue {
    fn from(v: serde_json::Value) -> Self {
        use serde_json::Value;
        match v {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or(f64::NAN)), Self::Int),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str(self.kind()),
        }
    }
}

/// String-keyed metadata map with typed accessors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetaBag(BTreeMap<String, MetaValue>);

impl MetaBag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetaValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<MetaValue> {
        self.0.remove(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetaValue)> {
        self.0.iter()
    }

    /// Raw access; fails only when the key is absent
    pub fn get(&self, key: &str) -> Result<&MetaValue, MetaValueError> {
        self.0
            .get(key)
            .ok_or_else(|| MetaValueError::NotFound(key.to_string()))
    }

    /// Like [`Self::get`], but a stored null is an error too
    fn get_non_null(&self, key: &str) -> Result<&MetaValue, MetaValueError> {
        match self.get(key)? {
            MetaValue::Null => Err(MetaValueError::NullValue(key.to_string())),
            value => Ok(value),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, MetaValueError> {
        match self.get_non_null(key)? {
            MetaValue::Bool(b) => Ok(*b),
            other => Err(mismatch(key, "bool", other)),
        }
    }

    pub fn get_int(&self, key: &str) -> Result<i64, MetaValueError> {
        match self.get_non_null(key)? {
            MetaValue::Int(i) => Ok(*i),
            other => Err(mismatch(key, "int", other)),
        }
    }

    pub fn get_str(&self, key: &str) -> Result<&str, MetaValueError> {
        match self.get_non_null(key)? {
            MetaValue::String(s) => Ok(s),
            other => Err(mismatch(key, "string", other)),
        }
    }

    /// A list whose every element is a string
    pub fn get_string_array(&self, key: &str) -> Result<Vec<String>, MetaValueError> {
        match self.get_non_null(key)? {
            MetaValue::List(items) => items
                .iter()
                .map(|item| match item {
                    MetaValue::String(s) => Ok(s.clone()),
                    other => Err(mismatch(key, "string array", other)),
                })
                .collect(),
            other => Err(mismatch(key, "string array", other)),
        }
    }

    pub fn get_map(&self, key: &str) -> Result<&BTreeMap<String, MetaValue>, MetaValueError> {
        match self.get_non_null(key)? {
            MetaValue::Map(m) => Ok(m),
            other => Err(mismatch(key, "map", other)),
        }
    }

    /// The variables summary; an absent key reads as empty
    pub fn variables(&self) -> Result<Variables, MetaValueError> {
        let map = match self.get_map(VARIABLES_KEY) {
            Ok(map) => map,
            Err(MetaValueError::NotFound(_)) => return Ok(Variables::new()),
            Err(e) => return Err(e),
        };
        let mut variables = Variables::new();
        for (importer, names) in map {
            let MetaValue::List(items) = names else {
                return Err(mismatch(VARIABLES_KEY, "string array", names));
            };
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    MetaValue::String(s) => list.push(s.clone()),
                    other => return Err(mismatch(VARIABLES_KEY, "string", other)),
                }
            }
            variables.insert(importer.clone(), list);
        }
        Ok(variables)
    }

    pub fn set_variables(&mut self, variables: &Variables) {
        let map = variables
            .iter()
            .map(|(importer, names)| (importer.clone(), MetaValue::string_list(names.clone())))
            .collect();
        self.0.insert(VARIABLES_KEY.to_string(), MetaValue::Map(map));
    }
}

impl FromIterator<(String, MetaValue)> for MetaBag {
    fn from_iter<T: IntoIterator<Item = (String, MetaValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn mismatch(key: &str, expected: &'static str, found: &MetaValue) -> MetaValueError {
    MetaValueError::TypeMismatch {
        key: key.to_string(),
        expected,
        found: found.kind(),
    }
}
