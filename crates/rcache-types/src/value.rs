//! Plain-data values crossing the interception boundary.
//!
//! Arguments and return values of recorded calls are expressed as [`Value`]
//! trees. Live handles (sockets, open files, weak references) have no
//! representation here: callers convert them to plain data before the call
//! reaches the cache, or pass them as [`Value::Opaque`], which fingerprints
//! by type name but cannot be persisted as a return value.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Keyword arguments. Ordered by key so iteration is deterministic.
pub type Kwargs = BTreeMap<String, Value>;

/// A plain-data value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Ordered, mutable-style sequence.
    List(Vec<Self>),
    /// Ordered, fixed-arity sequence.
    Tuple(Vec<Self>),
    /// Mapping in insertion order. Normalization ignores the order.
    Map(Vec<(Self, Self)>),
    /// Unordered collection. Normalization ignores the order.
    Set(Vec<Self>),
    /// A function reference, identified only by its declared name.
    Callable(String),
    /// A live object that only exposes its type name.
    Opaque(String),
}

impl Value {
    /// Build a mapping from key/value pairs, keeping their order.
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<Self>,
        V: Into<Self>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn list<V, I>(items: I) -> Self
    where
        V: Into<Self>,
        I: IntoIterator<Item = V>,
    {
        Self::List(items.into_iter().map(Into::into).collect())
    }

    pub fn tuple<V, I>(items: I) -> Self
    where
        V: Into<Self>,
        I: IntoIterator<Item = V>,
    {
        Self::Tuple(items.into_iter().map(Into::into).collect())
    }

    pub fn set<V, I>(items: I) -> Self
    where
        V: Into<Self>,
        I: IntoIterator<Item = V>,
    {
        Self::Set(items.into_iter().map(Into::into).collect())
    }

    /// Short type label, used for opaque normalization and diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Map(_) => "map",
            Self::Set(_) => "set",
            Self::Callable(_) => "callable",
            Self::Opaque(type_name) => type_name,
        }
    }

    /// Scalars and strings; everything a facade stores as a plain attribute.
    #[must_use]
    pub const fn is_primitive(&self) -> bool {
        matches!(
            self,
            Self::Null | Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Str(_) | Self::Bytes(_)
        )
    }

    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Elements of a list, tuple or set.
    #[must_use]
    pub fn as_items(&self) -> Option<&[Self]> {
        match self {
            Self::List(items) | Self::Tuple(items) | Self::Set(items) => Some(items),
            _ => None,
        }
    }

    /// Look up a mapping entry by key.
    #[must_use]
    pub fn get(&self, key: &Self) -> Option<&Self> {
        match self {
            Self::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Membership test with container semantics: element of a sequence or
    /// set, key of a mapping, substring of a string.
    #[must_use]
    pub fn contains(&self, needle: &Self) -> bool {
        match (self, needle) {
            (Self::Str(haystack), Self::Str(n)) => haystack.contains(n.as_str()),
            (Self::List(items) | Self::Tuple(items) | Self::Set(items), _) => {
                items.iter().any(|item| item == needle)
            }
            (Self::Map(entries), _) => entries.iter().any(|(k, _)| k == needle),
            _ => false,
        }
    }

    /// Check that this value can be persisted and replayed bit-identically.
    ///
    /// Returns the path of the first offending element. Opaque objects carry
    /// no data to replay, and non-finite floats do not survive the JSON body
    /// encoding.
    pub fn check_persistable(&self) -> Result<(), String> {
        self.check_at("$")
    }

    fn check_at(&self, path: &str) -> Result<(), String> {
        match self {
            Self::Opaque(type_name) => Err(format!("{path}: opaque `{type_name}` object")),
            Self::Float(v) if !v.is_finite() => Err(format!("{path}: non-finite float {v}")),
            Self::List(items) | Self::Tuple(items) | Self::Set(items) => {
                for (idx, item) in items.iter().enumerate() {
                    item.check_at(&format!("{path}[{idx}]"))?;
                }
                Ok(())
            }
            Self::Map(entries) => {
                for (idx, (k, v)) in entries.iter().enumerate() {
                    k.check_at(&format!("{path}.key[{idx}]"))?;
                    v.check_at(&format!("{path}.value[{idx}]"))?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:?}"),
            Self::Str(v) => write!(f, "{v:?}"),
            Self::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Self::List(items) => write!(f, "<list of {}>", items.len()),
            Self::Tuple(items) => write!(f, "<tuple of {}>", items.len()),
            Self::Map(entries) => write!(f, "<map of {}>", entries.len()),
            Self::Set(items) => write!(f, "<set of {}>", items.len()),
            Self::Callable(name) => write!(f, "<callable {name}>"),
            Self::Opaque(type_name) => write!(f, "<{type_name} object>"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<Vec<Self>> for Value {
    fn from(v: Vec<Self>) -> Self {
        Self::List(v)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Build [`Kwargs`] from `(key, value)` pairs.
pub fn kwargs<K, V, I>(entries: I) -> Kwargs
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_lookup_and_contains() {
        let m = Value::map([("a", 1), ("b", 2)]);
        assert_eq!(m.get(&Value::from("b")), Some(&Value::Int(2)));
        assert!(m.contains(&Value::from("a")));
        assert!(!m.contains(&Value::from("z")));
        assert!(Value::from("hello world").contains(&Value::from("lo w")));
        assert!(Value::list([1, 2, 3]).contains(&Value::Int(3)));
    }

    #[test]
    fn test_check_persistable_rejects_opaque_and_nan() {
        assert!(Value::list([1, 2]).check_persistable().is_ok());
        let nested = Value::map([("conn", Value::Opaque("Socket".to_owned()))]);
        let err = nested.check_persistable().unwrap_err();
        assert!(err.contains("$.value[0]"), "{err}");
        assert!(err.contains("Socket"), "{err}");
        assert!(Value::Float(f64::NAN).check_persistable().is_err());
        assert!(Value::Float(f64::INFINITY).check_persistable().is_err());
    }

    #[test]
    fn test_json_round_trip_keeps_variants_apart() {
        let original = Value::Tuple(vec![
            Value::Null,
            Value::List(vec![Value::Int(1)]),
            Value::Set(vec![Value::Int(1)]),
            Value::Callable("callback_for_method".to_owned()),
            Value::Bytes(vec![0, 255]),
            Value::Float(1.5),
        ]);
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_kwargs_helper_orders_keys() {
        let kw = kwargs([("b", 2), ("a", 1)]);
        let keys: Vec<&str> = kw.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::from("x"));
    }
}
