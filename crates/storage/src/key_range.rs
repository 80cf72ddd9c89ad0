//! Immutable key ranges.
//!
//! A [`KeyRange`] constrains a scan to an interval over a single orderable
//! key. Either bound may be absent, meaning the range is unbounded on that
//! side. Ranges are never mutated after construction; refinement via
//! [`KeyRange::and`] produces a new range.
//!
//! # Example
//!
//! ```
//! use cursordb_storage::{Key, KeyRange};
//!
//! let range = KeyRange::where_(">=", 2, Some("<"), Some(Key::from(4)))?;
//! assert_eq!(range.lower(), Some(&Key::from(2)));
//! assert!(!range.lower_open());
//! assert_eq!(range.upper(), Some(&Key::from(4)));
//! assert!(range.upper_open());
//! # Ok::<(), cursordb_storage::DbError>(())
//! ```

use std::{fmt, ops::Bound, str::FromStr};

use crate::{
    error::{DbError, DbResult},
    key::Key,
};

/// Comparison operators accepted by [`KeyRange::where_`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// `=` (also accepts `==`)
    Eq,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `^`, string prefix match
    StartsWith,
}

impl Comparison {
    /// Returns `true` for operators that set only a lower bound.
    #[must_use]
    pub fn is_lower(self) -> bool {
        matches!(self, Self::Gt | Self::Ge)
    }

    /// Returns `true` for operators that set only an upper bound.
    #[must_use]
    pub fn is_upper(self) -> bool {
        matches!(self, Self::Lt | Self::Le)
    }

    /// The operator's textual form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::StartsWith => "^",
        }
    }
}

impl FromStr for Comparison {
    type Err = DbError;

    fn from_str(op: &str) -> DbResult<Self> {
        match op.trim() {
            "=" | "==" => Ok(Self::Eq),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            "^" => Ok(Self::StartsWith),
            other => Err(DbError::argument(format!("invalid operator: '{other}'"))),
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An interval over a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    lower: Option<Key>,
    upper: Option<Key>,
    lower_open: bool,
    upper_open: bool,
}

impl KeyRange {
    /// A range matching exactly `value`.
    pub fn only(value: impl Into<Key>) -> Self {
        let value = value.into();
        Self {
            lower: Some(value.clone()),
            upper: Some(value),
            lower_open: false,
            upper_open: false,
        }
    }

    /// A range bounded on both sides.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Argument`] when `lower > upper`, or when the bounds
    /// are equal and either side is open (the range would be empty).
    pub fn bound(
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        lower_open: bool,
        upper_open: bool,
    ) -> DbResult<Self> {
        Self::new(Some(lower.into()), Some(upper.into()), lower_open, upper_open)
    }

    /// A range with only a lower bound.
    pub fn lower_bound(value: impl Into<Key>, open: bool) -> Self {
        Self { lower: Some(value.into()), upper: None, lower_open: open, upper_open: false }
    }

    /// A range with only an upper bound.
    pub fn upper_bound(value: impl Into<Key>, open: bool) -> Self {
        Self { lower: None, upper: Some(value.into()), lower_open: false, upper_open: open }
    }

    /// A range matching every string key that starts with `prefix`.
    pub fn starts_with(prefix: &str) -> Self {
        let mut upper = prefix.to_owned();
        upper.push(char::MAX);
        Self {
            lower: Some(Key::from(prefix)),
            upper: Some(Key::String(upper)),
            lower_open: false,
            upper_open: false,
        }
    }

    /// A range matching every array key whose leading elements equal `prefix`.
    ///
    /// Used for compound indexes where an equality condition fixes the first
    /// components and the remaining components provide ordering. Components
    /// after the prefix are expected to be scalar keys.
    pub fn array_prefix(prefix: Vec<Key>) -> Self {
        let mut upper = prefix.clone();
        upper.push(Key::Array(Vec::new()));
        Self {
            lower: Some(Key::Array(prefix)),
            upper: Some(Key::Array(upper)),
            lower_open: false,
            upper_open: true,
        }
    }

    /// Builds a range from one or two comparison operators.
    ///
    /// `op` is one of `=`, `==`, `<`, `<=`, `>`, `>=`, `^`. The optional second
    /// operator closes the other side of the interval, so it must be an upper
    /// bound operator when `op` is a lower bound operator and vice versa.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Argument`] for unknown operators, for two operators
    /// bounding the same side, for a second operator combined with `=` or `^`,
    /// and when only one of `op2`/`value2` is given.
    pub fn where_(
        op: &str,
        value: impl Into<Key>,
        op2: Option<&str>,
        value2: Option<Key>,
    ) -> DbResult<Self> {
        let first: Comparison = op.parse()?;
        let second = match (op2, value2) {
            (Some(op2), Some(value2)) => Some((op2.parse::<Comparison>()?, value2)),
            (None, None) => None,
            (Some(op2), None) => {
                return Err(DbError::argument(format!("operator '{op2}' given without a value")));
            },
            (None, Some(value2)) => {
                return Err(DbError::argument(format!(
                    "second bound {value2} given without an operator"
                )));
            },
        };
        Self::from_comparisons(first, value.into(), second)
    }

    /// Typed form of [`KeyRange::where_`].
    ///
    /// # Errors
    ///
    /// See [`KeyRange::where_`].
    pub fn from_comparisons(
        op: Comparison,
        value: Key,
        second: Option<(Comparison, Key)>,
    ) -> DbResult<Self> {
        let mut lower = None;
        let mut upper = None;
        let mut lower_open = false;
        let mut upper_open = false;

        match op {
            Comparison::Eq => {
                if second.is_some() {
                    return Err(DbError::argument("'=' cannot be combined with a second operator"));
                }
                return Ok(Self::only(value));
            },
            Comparison::StartsWith => {
                if second.is_some() {
                    return Err(DbError::argument("'^' cannot be combined with a second operator"));
                }
                let prefix = value
                    .as_str()
                    .ok_or_else(|| DbError::argument("'^' requires a string value"))?;
                return Ok(Self::starts_with(prefix));
            },
            Comparison::Lt | Comparison::Le => {
                upper = Some(value);
                upper_open = op == Comparison::Lt;
            },
            Comparison::Gt | Comparison::Ge => {
                lower = Some(value);
                lower_open = op == Comparison::Gt;
            },
        }

        if let Some((op2, value2)) = second {
            if op2.is_upper() && upper.is_none() {
                upper = Some(value2);
                upper_open = op2 == Comparison::Lt;
            } else if op2.is_lower() && lower.is_none() {
                lower = Some(value2);
                lower_open = op2 == Comparison::Gt;
            } else {
                return Err(DbError::argument(format!(
                    "invalid operator combination: '{op}' and '{op2}'"
                )));
            }
        }

        Self::new(lower, upper, lower_open, upper_open)
    }

    fn new(
        lower: Option<Key>,
        upper: Option<Key>,
        lower_open: bool,
        upper_open: bool,
    ) -> DbResult<Self> {
        if let (Some(lo), Some(hi)) = (&lower, &upper) {
            if lo > hi {
                return Err(DbError::argument(format!(
                    "lower bound {lo} is greater than upper bound {hi}"
                )));
            }
            if lo == hi && (lower_open || upper_open) {
                return Err(DbError::argument(format!("open range on a single key {lo} is empty")));
            }
        }
        Ok(Self { lower, upper, lower_open, upper_open })
    }

    /// Lower bound, if any.
    #[must_use]
    pub fn lower(&self) -> Option<&Key> {
        self.lower.as_ref()
    }

    /// Upper bound, if any.
    #[must_use]
    pub fn upper(&self) -> Option<&Key> {
        self.upper.as_ref()
    }

    /// Whether the lower bound is excluded.
    #[must_use]
    pub fn lower_open(&self) -> bool {
        self.lower_open
    }

    /// Whether the upper bound is excluded.
    #[must_use]
    pub fn upper_open(&self) -> bool {
        self.upper_open
    }

    /// Returns `true` if the range matches a single key.
    #[must_use]
    pub fn is_only(&self) -> bool {
        matches!((&self.lower, &self.upper), (Some(lo), Some(hi)) if lo == hi)
            && !self.lower_open
            && !self.upper_open
    }

    /// Returns `true` if `key` lies inside the range.
    #[must_use]
    pub fn contains(&self, key: &Key) -> bool {
        let above_lower = match &self.lower {
            Some(lo) if self.lower_open => key > lo,
            Some(lo) => key >= lo,
            None => true,
        };
        let below_upper = match &self.upper {
            Some(hi) if self.upper_open => key < hi,
            Some(hi) => key <= hi,
            None => true,
        };
        above_lower && below_upper
    }

    /// Intersects two ranges.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Argument`] if the ranges do not overlap.
    pub fn and(&self, other: &KeyRange) -> DbResult<KeyRange> {
        let (lower, lower_open) = match (&self.lower, &other.lower) {
            (Some(a), Some(b)) if a > b => (Some(a.clone()), self.lower_open),
            (Some(a), Some(b)) if b > a => (Some(b.clone()), other.lower_open),
            (Some(a), Some(_)) => (Some(a.clone()), self.lower_open || other.lower_open),
            (Some(a), None) => (Some(a.clone()), self.lower_open),
            (None, Some(b)) => (Some(b.clone()), other.lower_open),
            (None, None) => (None, false),
        };
        let (upper, upper_open) = match (&self.upper, &other.upper) {
            (Some(a), Some(b)) if a < b => (Some(a.clone()), self.upper_open),
            (Some(a), Some(b)) if b < a => (Some(b.clone()), other.upper_open),
            (Some(a), Some(_)) => (Some(a.clone()), self.upper_open || other.upper_open),
            (Some(a), None) => (Some(a.clone()), self.upper_open),
            (None, Some(b)) => (Some(b.clone()), other.upper_open),
            (None, None) => (None, false),
        };
        Self::new(lower, upper, lower_open, upper_open)
            .map_err(|_| DbError::argument(format!("key ranges {self} and {other} do not overlap")))
    }

    /// Converts the range into standard library bounds for `BTreeMap::range`.
    #[must_use]
    pub fn bounds(&self) -> (Bound<&Key>, Bound<&Key>) {
        let lower = match &self.lower {
            Some(k) if self.lower_open => Bound::Excluded(k),
            Some(k) => Bound::Included(k),
            None => Bound::Unbounded,
        };
        let upper = match &self.upper {
            Some(k) if self.upper_open => Bound::Excluded(k),
            Some(k) => Bound::Included(k),
            None => Bound::Unbounded,
        };
        (lower, upper)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.lower_open { "(" } else { "[" })?;
        if let Some(lo) = &self.lower {
            write!(f, "{lo}")?;
        }
        f.write_str(", ")?;
        if let Some(hi) = &self.upper {
            write!(f, "{hi}")?;
        }
        f.write_str(if self.upper_open { ")" } else { "]" })
    }
}
