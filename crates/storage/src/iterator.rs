//! Scan descriptors.
//!
//! A [`DbIterator`] describes a cursor scan over one store: an optional
//! secondary index, an optional [`KeyRange`], direction, uniqueness and
//! whether values are materialized. It is pure data. Executing it through
//! [`Storage`](crate::Storage) produces a [`Request`](crate::Request) whose
//! resolved value is the ordered list of matches.
//!
//! Every derivation method returns a new iterator. The receiver is never
//! mutated, so a base iterator can be reused to derive many scans.
//!
//! # Scan order
//!
//! A primary scan yields records ordered by primary key. An index scan
//! yields entries ordered by index key, then primary key. Reversal flips
//! both. A unique index scan yields one entry per distinct index key,
//! always the one with the lowest primary key.

use std::fmt;

use crate::{
    error::{DbError, DbResult},
    key::Key,
    key_range::KeyRange,
    schema::StoreSchema,
};

/// Where a scan stands relative to its results.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CursorPosition {
    /// The scan has not started.
    #[default]
    Initial,
    /// The scan stopped on an entry and can continue strictly after it.
    Resting {
        /// Effective key of the last entry (index key for index scans).
        key: Key,
        /// Primary key of the last entry.
        primary_key: Key,
    },
    /// Every matching entry has been produced.
    Completed,
}

impl CursorPosition {
    /// Returns `true` when the scan has more entries to offer.
    #[must_use]
    pub fn is_resting(&self) -> bool {
        matches!(self, Self::Resting { .. })
    }
}

/// Description of a cursor scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbIterator {
    store: String,
    index: Option<String>,
    key_range: Option<KeyRange>,
    reverse: bool,
    unique: bool,
    key_only: bool,
    post_fix: Vec<String>,
    position: CursorPosition,
}

impl DbIterator {
    fn base(store: impl Into<String>, index: Option<String>, key_range: Option<KeyRange>) -> Self {
        Self {
            store: store.into(),
            index,
            key_range,
            reverse: false,
            unique: false,
            key_only: true,
            post_fix: Vec::new(),
            position: CursorPosition::Initial,
        }
    }

    /// Primary-key scan yielding keys only.
    pub fn keys(store: impl Into<String>, key_range: Option<KeyRange>) -> Self {
        Self::base(store, None, key_range)
    }

    /// Primary-key scan yielding full records.
    pub fn values(store: impl Into<String>, key_range: Option<KeyRange>) -> Self {
        Self { key_only: false, ..Self::base(store, None, key_range) }
    }

    /// Index scan yielding index keys and primary keys.
    pub fn index_keys(
        store: impl Into<String>,
        index: impl Into<String>,
        key_range: Option<KeyRange>,
    ) -> Self {
        Self::base(store, Some(index.into()), key_range)
    }

    /// Index scan yielding full records.
    pub fn index_values(
        store: impl Into<String>,
        index: impl Into<String>,
        key_range: Option<KeyRange>,
    ) -> Self {
        Self { key_only: false, ..Self::base(store, Some(index.into()), key_range) }
    }

    /// Store being scanned.
    #[must_use]
    pub fn store_name(&self) -> &str {
        &self.store
    }

    /// Index being scanned, if any.
    #[must_use]
    pub fn index_name(&self) -> Option<&str> {
        self.index.as_deref()
    }

    /// Range constraint, if any.
    #[must_use]
    pub fn key_range(&self) -> Option<&KeyRange> {
        self.key_range.as_ref()
    }

    /// Returns `true` for a descending scan.
    #[must_use]
    pub fn is_reversed(&self) -> bool {
        self.reverse
    }

    /// Returns `true` when duplicate index keys are collapsed.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Returns `true` when the scan skips value materialization.
    #[must_use]
    pub fn is_key_only(&self) -> bool {
        self.key_only
    }

    /// Secondary ordering fields supplied by a compound index.
    #[must_use]
    pub fn post_fix(&self) -> &[String] {
        &self.post_fix
    }

    /// Current resume position.
    #[must_use]
    pub fn position(&self) -> &CursorPosition {
        &self.position
    }

    /// Returns `true` if the scan runs over a secondary index rather than the
    /// primary key.
    #[must_use]
    pub fn used_index(&self) -> bool {
        self.index.is_some()
    }

    /// Returns the form handed to a back-end: key-only when `key_only` is set,
    /// otherwise value-materializing.
    #[must_use]
    pub fn get_iterator(&self, key_only: bool) -> Self {
        Self { key_only, ..self.clone() }
    }

    /// Key-only form of this scan.
    #[must_use]
    pub fn as_key_iterator(&self) -> Self {
        self.get_iterator(true)
    }

    /// Value-materializing form of this scan.
    #[must_use]
    pub fn as_value_iterator(&self) -> Self {
        self.get_iterator(false)
    }

    /// Same scan, reset to its initial position.
    #[must_use]
    pub fn copy(&self) -> Self {
        Self { position: CursorPosition::Initial, ..self.clone() }
    }

    /// Same scan in the opposite direction, reset to its initial position.
    #[must_use]
    pub fn reverse(&self) -> Self {
        Self { reverse: !self.reverse, position: CursorPosition::Initial, ..self.clone() }
    }

    /// Same scan with an explicit direction.
    #[must_use]
    pub fn reversed(&self, reverse: bool) -> Self {
        Self { reverse, position: CursorPosition::Initial, ..self.clone() }
    }

    /// Same scan with duplicate index keys collapsed (or not).
    #[must_use]
    pub fn unique(&self, unique: bool) -> Self {
        Self { unique, position: CursorPosition::Initial, ..self.clone() }
    }

    /// Same scan resuming strictly after `(key, primary_key)`.
    ///
    /// For primary scans `key` and `primary_key` are the same value.
    #[must_use]
    pub fn resume(&self, key: Key, primary_key: Key) -> Self {
        Self { position: CursorPosition::Resting { key, primary_key }, ..self.clone() }
    }

    /// Same scan marked as exhausted.
    #[must_use]
    pub fn completed(&self) -> Self {
        Self { position: CursorPosition::Completed, ..self.clone() }
    }

    /// Same scan with a position reported back by a back-end.
    #[must_use]
    pub fn with_position(&self, position: CursorPosition) -> Self {
        Self { position, ..self.clone() }
    }

    /// Same scan with `range` intersected into the current range.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Argument`] if the ranges do not overlap.
    pub fn with_range(&self, range: KeyRange) -> DbResult<Self> {
        let key_range = match &self.key_range {
            Some(current) => current.and(&range)?,
            None => range,
        };
        Ok(Self { key_range: Some(key_range), position: CursorPosition::Initial, ..self.clone() })
    }

    /// Refines the range from comparison operators, see [`KeyRange::where_`].
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Argument`] for invalid operators or disjoint ranges.
    pub fn where_(
        &self,
        op: &str,
        value: impl Into<Key>,
        op2: Option<&str>,
        value2: Option<Key>,
    ) -> DbResult<Self> {
        self.with_range(KeyRange::where_(op, value, op2, value2)?)
    }

    /// Same scan targeting `index` (or the primary key for `None`) with a
    /// fresh range.
    #[must_use]
    pub fn on_index(&self, index: Option<String>, key_range: Option<KeyRange>) -> Self {
        Self {
            index,
            key_range,
            post_fix: Vec::new(),
            position: CursorPosition::Initial,
            ..self.clone()
        }
    }

    /// Returns `true` when the scan is fresh: no range and no index.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.index.is_none() && self.key_range.is_none()
    }

    /// Reorders the scan by `fields`.
    ///
    /// The rules, in order:
    ///
    /// - a primary scan without a range can be ordered by the primary key
    ///   (unchanged), by a single indexed field (switches to that index), or
    ///   by several fields forming a compound index (switches to it);
    /// - an equality scan on index `i` can be ordered by the primary key or
    ///   by `i` (unchanged), or by `f` when a compound index `[i, f]` exists
    ///   (switches to a prefix scan on it, with `f` as post-fix);
    /// - a range scan on index `i` can only be ordered by `i`;
    /// - a primary scan with a range can only be ordered by the primary key.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Argument`] when no rule applies.
    pub fn order(&self, fields: &[&str], store: &StoreSchema) -> DbResult<Self> {
        if fields.is_empty() {
            return Err(DbError::argument("order requires at least one field"));
        }
        let by_primary = fields.len() == 1 && store.is_primary_key(fields[0]);

        let Some(index_name) = &self.index else {
            if by_primary {
                return Ok(self.clone());
            }
            if self.key_range.is_some() {
                return Err(DbError::argument(format!(
                    "cannot order by {fields:?}: a primary key range scan is ordered by '{}'",
                    store.key_path
                )));
            }
            let index = store.index_by_key_path(fields).ok_or_else(|| {
                DbError::argument(format!(
                    "no index on {fields:?} in store '{}' to order by",
                    store.name
                ))
            })?;
            return Ok(self.on_index(Some(index.name.clone()), None));
        };

        let index = store.index(index_name).ok_or_else(|| {
            DbError::argument(format!("index '{index_name}' not found in store '{}'", store.name))
        })?;
        let same_index = (fields.len() == index.key_path.len()
            && fields.iter().zip(&index.key_path).all(|(f, p)| *f == p.as_str()))
            || (fields.len() == 1 && fields[0] == index.name);
        if same_index {
            return Ok(self.clone());
        }
        if !self.post_fix.is_empty()
            && fields.len() == self.post_fix.len()
            && fields.iter().zip(&self.post_fix).all(|(f, p)| *f == p.as_str())
        {
            return Ok(self.clone());
        }

        let equality = self.key_range.as_ref().filter(|r| r.is_only());
        let Some(equality) = equality else {
            return Err(DbError::argument(format!(
                "cannot order by {fields:?}: a range scan on index '{}' is ordered by {:?}",
                index.name, index.key_path
            )));
        };
        if by_primary {
            return Ok(self.clone());
        }
        if index.is_compound() {
            return Err(DbError::argument(format!(
                "cannot order by {fields:?} on compound index '{}'",
                index.name
            )));
        }

        let mut compound_path: Vec<&str> = index.key_path.iter().map(String::as_str).collect();
        compound_path.extend_from_slice(fields);
        let compound = store.index_by_key_path(&compound_path).ok_or_else(|| {
            DbError::argument(format!(
                "ordering an equality scan on '{}' by {fields:?} requires a compound index on \
                 {compound_path:?}",
                index.name
            ))
        })?;
        let prefix = equality.lower().cloned().into_iter().collect();
        Ok(Self {
            index: Some(compound.name.clone()),
            key_range: Some(KeyRange::array_prefix(prefix)),
            post_fix: fields.iter().map(|f| (*f).to_owned()).collect(),
            position: CursorPosition::Initial,
            ..self.clone()
        })
    }
}

impl fmt::Display for DbIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match (self.used_index(), self.key_only) {
            (false, true) => "KeyIterator",
            (false, false) => "ValueIterator",
            (true, true) => "IndexIterator",
            (true, false) => "IndexValueIterator",
        };
        write!(f, "{kind}:{}", self.store)?;
        if let Some(index) = &self.index {
            write!(f, ":{index}")?;
        }
        if let Some(range) = &self.key_range {
            write!(f, "{range}")?;
        }
        if self.reverse {
            f.write_str(" reverse")?;
        }
        if self.unique {
            f.write_str(" unique")?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::IndexSchema;

    fn store() -> StoreSchema {
        StoreSchema::new("articles", "id")
            .with_index(IndexSchema::new("type", "type"))
            .with_index(IndexSchema::new("created", "created"))
            .with_index(IndexSchema::compound("type, created", ["type", "created"]))
    }

    #[test]
    fn derivations_leave_receiver_untouched() {
        let base = DbIterator::values("articles", None);
        let reversed = base.reverse();
        let unique = base.unique(true);
        assert!(!base.is_reversed());
        assert!(!base.is_unique());
        assert!(reversed.is_reversed());
        assert!(unique.is_unique());
    }

    #[test]
    fn key_and_value_forms() {
        let base = DbIterator::index_values("articles", "type", None);
        assert!(!base.is_key_only());
        assert!(base.as_key_iterator().is_key_only());
        assert!(base.get_iterator(true).used_index());
        assert!(!DbIterator::keys("articles", None).used_index());
    }

    #[test]
    fn where_intersects_existing_range() {
        let iter = DbIterator::values("articles", None)
            .where_(">", 1, None, None)
            .unwrap()
            .where_("<=", 5, None, None)
            .unwrap();
        assert_eq!(iter.key_range(), Some(&KeyRange::bound(1, 5, true, false).unwrap()));
    }

    #[test]
    fn resume_and_copy() {
        let iter = DbIterator::values("articles", None).resume(Key::from(3), Key::from(3));
        assert!(iter.position().is_resting());
        assert_eq!(iter.copy().position(), &CursorPosition::Initial);
    }

    #[test]
    fn order_by_primary_key_keeps_primary_scan() {
        let iter = DbIterator::values("articles", None);
        assert_eq!(iter.order(&["id"], &store()).unwrap(), iter);
    }

    #[test]
    fn order_by_indexed_field_switches_to_index() {
        let iter = DbIterator::values("articles", None).order(&["created"], &store()).unwrap();
        assert_eq!(iter.index_name(), Some("created"));
        assert!(!iter.is_key_only());
    }

    #[test]
    fn order_on_equality_uses_compound_index() {
        let iter = DbIterator::index_values("articles", "type", Some(KeyRange::only("a")));
        let ordered = iter.order(&["created"], &store()).unwrap();
        assert_eq!(ordered.index_name(), Some("type, created"));
        assert_eq!(ordered.post_fix(), ["created".to_owned()]);
        assert_eq!(ordered.key_range(), Some(&KeyRange::array_prefix(vec![Key::from("a")])));
        assert_eq!(ordered.order(&["created"], &store()).unwrap(), ordered);
    }

    #[test]
    fn order_on_equality_by_primary_key_is_unchanged() {
        let iter = DbIterator::index_values("articles", "type", Some(KeyRange::only("a")));
        assert_eq!(iter.order(&["id"], &store()).unwrap(), iter);
    }

    #[test]
    fn order_on_range_requires_same_field() {
        let iter =
            DbIterator::index_values("articles", "created", Some(KeyRange::lower_bound(5, false)));
        assert_eq!(iter.order(&["created"], &store()).unwrap(), iter);
        assert!(iter.order(&["type"], &store()).unwrap_err().is_argument());
    }

    #[test]
    fn order_on_primary_range_rejects_other_fields() {
        let iter = DbIterator::values("articles", Some(KeyRange::lower_bound(2, false)));
        assert!(iter.order(&["created"], &store()).unwrap_err().is_argument());
        assert!(iter.order(&["id"], &store()).is_ok());
    }

    #[test]
    fn order_without_index_is_rejected() {
        let iter = DbIterator::values("articles", None);
        assert!(iter.order(&["title"], &store()).unwrap_err().is_argument());
        assert!(iter.order(&[], &store()).unwrap_err().is_argument());
    }

    #[test]
    fn display_names_the_scan() {
        let iter = DbIterator::index_keys("articles", "type", Some(KeyRange::only("a"))).reverse();
        assert_eq!(iter.to_string(), "IndexIterator:articles:type[\"a\", \"a\"] reverse");
    }
}
