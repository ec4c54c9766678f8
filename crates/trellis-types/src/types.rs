use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt;

/// Unique identifier for facts, assigned monotonically on insertion and
/// never reused within an engine session.
pub type FactId = u64;

/// A ground value stored in a fact attribute.
///
/// Equality is structural. Every variant is hashable: floats hash by their
/// bit pattern and maps hash by sorted keys, so structurally equal values
/// always hash equally regardless of construction order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(String),
    Tuple(Vec<Value>),
    Object(HashMap<String, Value>),
    /// Reference to another fact by id. This is what a fact-binding
    /// variable resolves to, so actions can address the matched fact
    /// through the mutating API.
    FactRef(FactId),
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Value::Integer(i) => {
                0u8.hash(state);
                i.hash(state);
            }
            Value::Float(f) => {
                1u8.hash(state);
                f.to_bits().hash(state);
            }
            Value::Boolean(b) => {
                2u8.hash(state);
                b.hash(state);
            }
            Value::String(s) => {
                3u8.hash(state);
                s.hash(state);
            }
            Value::Tuple(items) => {
                4u8.hash(state);
                items.hash(state);
            }
            Value::Object(map) => {
                5u8.hash(state);
                // Sort keys for order-independent hashing
                let mut pairs: Vec<_> = map.iter().collect();
                pairs.sort_by_key(|(k, _)| *k);
                for (key, value) in pairs {
                    key.hash(state);
                    value.hash(state);
                }
            }
            Value::FactRef(id) => {
                6u8.hash(state);
                id.hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(fl) => write!(f, "{}", fl),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::String(s) => write!(f, "{}", s),
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Value::Object(map) => {
                write!(f, "{{")?;
                let mut keys: Vec<_> = map.keys().collect();
                keys.sort();
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, map[*key])?;
                }
                write!(f, "}}")
            }
            Value::FactRef(id) => write!(f, "#{}", id),
        }
    }
}

impl Value {
    /// Get the type name as a string
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Boolean(_) => "boolean",
            Value::String(_) => "string",
            Value::Tuple(_) => "tuple",
            Value::Object(_) => "object",
            Value::FactRef(_) => "fact-ref",
        }
    }

    /// Try to read this value as an integer
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Boolean(b) => Some(if *b { 1 } else { 0 }),
            _ => None,
        }
    }

    /// Convenience accessor returning an `f64` if this value is numeric
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Try to read this value as a string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to read this value as a fact reference
    pub fn as_fact_ref(&self) -> Option<FactId> {
        match self {
            Value::FactRef(id) => Some(*id),
            _ => None,
        }
    }

    /// Check if this value is "truthy" for conditional logic
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Boolean(b) => *b,
            Value::Integer(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
            Value::FactRef(_) => true,
        }
    }

    /// Build an object value from key-value pairs
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
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
        Value::Tuple(v)
    }
}

// -------------------------------------------------------------------------
// Conversions between `Value` and `serde_json::Value`, kept next to the
// data type they concern so the mapping is easy to discover and maintain.
// -------------------------------------------------------------------------

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Integer(i) => serde_json::Value::Number(serde_json::Number::from(*i)),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Tuple(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.into()).collect())
            }
            Value::Object(map) => {
                let json_map = map
                    .iter()
                    .map(|(k, v)| (k.clone(), v.into()))
                    .collect::<serde_json::Map<String, serde_json::Value>>();
                serde_json::Value::Object(json_map)
            }
            // Fact references have no JSON-native shape; exported as numbers
            Value::FactRef(id) => serde_json::Value::Number(serde_json::Number::from(*id)),
        }
    }
}

impl TryFrom<&serde_json::Value> for Value {
    type Error = anyhow::Error;

    fn try_from(value: &serde_json::Value) -> Result<Self, Self::Error> {
        Ok(match value {
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    return Err(anyhow::anyhow!("unsupported number value: {}", n));
                }
            }
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                let inner = items.iter().map(Value::try_from).collect::<Result<Vec<_>, _>>()?;
                Value::Tuple(inner)
            }
            serde_json::Value::Object(map) => {
                let mut inner = HashMap::new();
                for (k, v) in map {
                    inner.insert(k.clone(), Value::try_from(v)?);
                }
                Value::Object(inner)
            }
            serde_json::Value::Null => {
                return Err(anyhow::anyhow!("null has no Value representation"));
            }
        })
    }
}

/// Key addressing one attribute of a fact.
///
/// Positional values of a fact appear under `Position(i)`; named attributes
/// under `Name(s)`. The ordering (positions before names, both ascending)
/// gives working memory a deterministic WME decomposition order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttrKey {
    Position(usize),
    Name(String),
}

impl fmt::Display for AttrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrKey::Position(i) => write!(f, "{}", i),
            AttrKey::Name(s) => write!(f, "{}", s),
        }
    }
}

impl From<usize> for AttrKey {
    fn from(i: usize) -> Self {
        AttrKey::Position(i)
    }
}

impl From<&str> for AttrKey {
    fn from(s: &str) -> Self {
        AttrKey::Name(s.to_string())
    }
}

impl From<String> for AttrKey {
    fn from(s: String) -> Self {
        AttrKey::Name(s)
    }
}
