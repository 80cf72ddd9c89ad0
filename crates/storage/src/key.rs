//! Orderable keys.
//!
//! Keys follow the IndexedDB ordering: every number sorts before every
//! string, and every string before every array. Arrays compare element-wise,
//! and a shorter array that is a prefix of a longer one sorts first.
//!
//! ```
//! use cursordb_storage::Key;
//!
//! assert!(Key::from(10) < Key::from("a"));
//! assert!(Key::from("zzz") < Key::from(vec![Key::from(0)]));
//! ```

use std::{cmp::Ordering, fmt};

use serde_json::Value;

use crate::error::{DbError, DbResult};

/// A primary or index key.
#[derive(Debug, Clone)]
pub enum Key {
    /// A finite number. `NaN` is never a valid key.
    Number(f64),
    /// A UTF-8 string.
    String(String),
    /// An array of keys, used for compound indexes.
    Array(Vec<Key>),
}

impl Key {
    /// Creates a numeric key, rejecting `NaN`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Argument`] if `value` is `NaN`.
    pub fn number(value: f64) -> DbResult<Self> {
        if value.is_nan() {
            return Err(DbError::argument("NaN is not a valid key"));
        }
        Ok(Self::Number(value))
    }

    /// Converts a JSON value into a key.
    ///
    /// Returns `None` for `null`, booleans, objects, and arrays that contain
    /// any of those.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64().filter(|f| !f.is_nan()).map(Self::Number),
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Array(items) => {
                items.iter().map(Self::from_json).collect::<Option<Vec<_>>>().map(Self::Array)
            },
            Value::Null | Value::Bool(_) | Value::Object(_) => None,
        }
    }

    /// Converts the key back into JSON.
    ///
    /// Integral numbers within `i64` range are emitted as JSON integers so
    /// that `{"id": 1}` round-trips as `1` rather than `1.0`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.0e15 {
                    Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number)
                }
            },
            Self::String(s) => Value::String(s.clone()),
            Self::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
        }
    }

    /// Returns the string content for string keys.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Self::Number(_) => 0,
            Self::String(_) => 1,
            Self::Array(_) => 2,
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Array(a), Self::Array(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            },
        }
    }
}

macro_rules! key_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Key {
                fn from(value: $ty) -> Self {
                    Self::Number(value as f64)
                }
            }
        )*
    };
}

key_from_int!(i32, i64, u32, u64, usize);

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<Key>> for Key {
    fn from(value: Vec<Key>) -> Self {
        Self::Array(value)
    }
}

impl TryFrom<&Value> for Key {
    type Error = DbError;

    fn try_from(value: &Value) -> DbResult<Self> {
        Self::from_json(value)
            .ok_or_else(|| DbError::argument(format!("{value} is not a valid key")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn type_ordering_numbers_strings_arrays() {
        let mut keys = vec![
            Key::from(vec![Key::from(1)]),
            Key::from("b"),
            Key::from(3),
            Key::from("a"),
            Key::from(-1),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                Key::from(-1),
                Key::from(3),
                Key::from("a"),
                Key::from("b"),
                Key::from(vec![Key::from(1)]),
            ]
        );
    }

    #[test]
    fn array_prefix_sorts_first() {
        let short = Key::from(vec![Key::from("a")]);
        let long = Key::from(vec![Key::from("a"), Key::from(1)]);
        assert!(short < long);
    }

    #[test]
    fn nan_is_rejected() {
        assert!(Key::number(f64::NAN).unwrap_err().is_argument());
        assert!(Key::from_json(&json!([1, null])).is_none());
    }

    #[test]
    fn json_round_trip_keeps_integers() {
        let key = Key::from_json(&json!(["x", 2, 2.5])).unwrap();
        assert_eq!(key.to_json(), json!(["x", 2, 2.5]));
    }

    #[test]
    fn non_key_json_is_rejected() {
        assert!(Key::try_from(&json!({"a": 1})).unwrap_err().is_argument());
        assert!(Key::from_json(&json!(true)).is_none());
    }

    proptest! {
        #[test]
        fn number_order_matches_f64(a in -1.0e9f64..1.0e9, b in -1.0e9f64..1.0e9) {
            let ka = Key::number(a).unwrap();
            let kb = Key::number(b).unwrap();
            prop_assert_eq!(ka.cmp(&kb), a.partial_cmp(&b).unwrap());
        }

        #[test]
        fn string_order_matches_str(a in "[a-z]{0,6}", b in "[a-z]{0,6}") {
            prop_assert_eq!(Key::from(a.as_str()).cmp(&Key::from(b.as_str())), a.cmp(&b));
        }
    }
}
