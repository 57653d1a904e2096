//! Query key definitions.
//!
//! A query is identified by an ordered list of segments. Two identity lists
//! that serialize to the same JSON array map to the same cache entry and the
//! same subscriber list.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One segment of a query identity.
///
/// Segments are JSON values, so a key can mix resource names, ids and filter
/// objects: `["products", {"page": 2, "search": "mug"}]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeySegment(Value);

impl KeySegment {
    /// Borrow the underlying JSON value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

impl From<Value> for KeySegment {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<&str> for KeySegment {
    fn from(value: &str) -> Self {
        Self(Value::String(value.to_string()))
    }
}

impl From<String> for KeySegment {
    fn from(value: String) -> Self {
        Self(Value::String(value))
    }
}

impl From<&String> for KeySegment {
    fn from(value: &String) -> Self {
        Self(Value::String(value.clone()))
    }
}

impl From<bool> for KeySegment {
    fn from(value: bool) -> Self {
        Self(Value::Bool(value))
    }
}

macro_rules! segment_from_number {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for KeySegment {
                fn from(value: $ty) -> Self {
                    Self(Value::from(value))
                }
            }
        )*
    };
}

segment_from_number!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

/// Serialized query identity.
///
/// Equality, hashing and ordering all go through the serialized form, which
/// is the compact JSON array of the segments (object members sorted by name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    serialized: String,
}

impl QueryKey {
    /// Build a key from an ordered list of segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<KeySegment>,
    {
        let segments: Vec<Value> = segments.into_iter().map(|s| s.into().0).collect();
        Self {
            serialized: Value::Array(segments).to_string(),
        }
    }

    /// Parse a key from its serialized JSON array form.
    pub fn parse(serialized: &str) -> Result<Self, serde_json::Error> {
        let segments: Vec<Value> = serde_json::from_str(serialized)?;
        Ok(Self::new(segments))
    }

    /// The serialized key string.
    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    /// Decode the segments back out of the serialized form.
    pub fn segments(&self) -> Vec<KeySegment> {
        serde_json::from_str::<Vec<Value>>(&self.serialized)
            .map(|values| values.into_iter().map(KeySegment).collect())
            .unwrap_or_default()
    }

    /// Returns true when `prefix` equals this key or names its leading segments.
    ///
    /// Matching happens on segment boundaries: `["orders", 4]` is a prefix of
    /// `["orders", 4, "items"]` but not of `["orders", 42]`.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        if self.serialized == prefix.serialized {
            return true;
        }
        if prefix.serialized == "[]" {
            return true;
        }

        let open = &prefix.serialized[..prefix.serialized.len() - 1];
        self.serialized
            .strip_prefix(open)
            .is_some_and(|rest| rest.starts_with(','))
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialized)
    }
}

impl From<&str> for QueryKey {
    fn from(value: &str) -> Self {
        Self::new([value])
    }
}

/// Build a [`QueryKey`] from heterogeneous segments.
///
/// ```
/// use shopdesk::query_key;
///
/// let key = query_key!["products", 42_u64];
/// assert_eq!(key.as_str(), r#"["products",42]"#);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($segment:expr),* $(,)?) => {
        $crate::query::QueryKey::new(
            ::std::vec![$($crate::query::KeySegment::from($segment)),*]
        )
    };
}
