//! Result materializer
//!
//! The directory cannot sort or offset a search, so ordering, windowing,
//! de-duplication and projection all happen client-side over the complete
//! result set. This is O(n log n) per sort key plus O(n²) for distinct, which
//! is fine for the hundreds to low thousands of entries a query returns.

use std::fmt;

use crate::error::DirectoryResult;
use crate::model::{ModelMeta, IDENTITY_FIELD};
use crate::traits::RawEntry;
use crate::value::Value;

/// One sort key: a field name (`dn` and `pk` allowed) and a direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderKey {
    pub field: String,
    pub descending: bool,
}

impl OrderKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }

    /// Keys from `name` / `-name` strings.
    pub fn from_keys<I, S>(keys: I) -> Vec<OrderKey>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        keys.into_iter().map(|k| OrderKey::from(k.as_ref())).collect()
    }
}

impl From<&str> for OrderKey {
    fn from(key: &str) -> Self {
        match key.strip_prefix('-') {
            Some(field) => Self::desc(field),
            None => Self::asc(key),
        }
    }
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.descending {
            write!(f, "-{}", self.field)
        } else {
            f.write_str(&self.field)
        }
    }
}

/// Position-based slice `[low, high)` over the sorted results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Window {
    pub low: usize,
    pub high: Option<usize>,
}

impl Window {
    pub fn new(low: usize, high: Option<usize>) -> Self {
        Self { low, high }
    }

    /// Check if the window keeps everything.
    pub fn is_unbounded(&self) -> bool {
        self.low == 0 && self.high.is_none()
    }

    /// Narrow this window by a slice relative to it.
    #[must_use]
    pub fn narrow(&self, low: usize, high: Option<usize>) -> Self {
        let new_low = self.low + low;
        let new_high = match (self.high, high) {
            (Some(current), Some(h)) => Some(current.min(self.low + h)),
            (Some(current), None) => Some(current),
            (None, Some(h)) => Some(self.low + h),
            (None, None) => None,
        };
        Self {
            low: new_low,
            high: new_high.map(|h| h.max(new_low)),
        }
    }

    /// Number of items the window keeps out of `n`.
    pub fn count(&self, n: usize) -> usize {
        let high = self.high.map_or(n, |h| h.min(n));
        high.saturating_sub(self.low.min(n))
    }

    /// Apply the window to a sorted sequence.
    pub fn apply<T>(&self, mut items: Vec<T>) -> Vec<T> {
        let n = items.len();
        let low = self.low.min(n);
        let high = self.high.map_or(n, |h| h.min(n)).max(low);
        items.truncate(high);
        items.drain(..low);
        items
    }
}

/// A projected output column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Column {
    /// The raw entry identity.
    Identity,
    /// A decoded field.
    Field(String),
    /// Per-entry value count of a field.
    Count(String),
}

impl Column {
    /// Column for a field name; `dn` selects the identity.
    pub fn field(name: impl Into<String>) -> Self {
        let name = name.into();
        if name == IDENTITY_FIELD {
            Column::Identity
        } else {
            Column::Field(name)
        }
    }
}

/// A projected row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub dn: String,
    pub values: Vec<Value>,
}

/// Applies codec, sort, projection, distinct and window to raw entries.
#[derive(Debug, Clone, Copy)]
pub struct Materializer<'a> {
    meta: &'a ModelMeta,
}

impl<'a> Materializer<'a> {
    pub fn new(meta: &'a ModelMeta) -> Self {
        Self { meta }
    }

    /// Sort entries in place.
    ///
    /// Keys are applied last to first with stable sorts, so the first key
    /// has the highest priority.
    pub fn sort(&self, entries: &mut Vec<RawEntry>, ordering: &[OrderKey]) -> DirectoryResult<()> {
        for key in ordering.iter().rev() {
            if key.field == IDENTITY_FIELD {
                entries.sort_by(|a, b| {
                    let ord = a.dn.cmp(&b.dn);
                    if key.descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
                continue;
            }

            let field = self.meta.require_field(&key.field)?;
            let mut keyed: Vec<(Value, RawEntry)> = entries
                .drain(..)
                .map(|entry| (field.decode(entry.get(&field.attribute)), entry))
                .collect();

            keyed.sort_by(|(a, _), (b, _)| {
                let ord = a.sort_cmp(b);
                if key.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });

            entries.extend(keyed.into_iter().map(|(_, entry)| entry));
        }
        Ok(())
    }

    /// Project one entry onto the requested columns.
    pub fn project(&self, entry: &RawEntry, columns: &[Column]) -> DirectoryResult<Row> {
        let mut values = Vec::with_capacity(columns.len());

        for column in columns {
            let value = match column {
                Column::Identity => Value::Text(entry.dn.clone()),
                Column::Field(name) if name == IDENTITY_FIELD => Value::Text(entry.dn.clone()),
                Column::Field(name) => {
                    let field = self.meta.require_field(name)?;
                    field.decode(entry.get(&field.attribute))
                }
                Column::Count(name) if name == IDENTITY_FIELD => Value::Integer(1),
                Column::Count(name) => {
                    let field = self.meta.require_field(name)?;
                    let raw = entry.get(&field.attribute);
                    let count = if field.is_multi_valued() {
                        raw.len()
                    } else {
                        usize::from(!raw.is_empty())
                    };
                    Value::Integer(i64::try_from(count).unwrap_or(i64::MAX))
                }
            };
            values.push(value);
        }

        Ok(Row {
            dn: entry.dn.clone(),
            values,
        })
    }

    /// Full pipeline: sort, project, optional distinct, then window.
    pub fn rows(
        &self,
        mut entries: Vec<RawEntry>,
        ordering: &[OrderKey],
        columns: &[Column],
        distinct: bool,
        window: Window,
    ) -> DirectoryResult<Vec<Row>> {
        self.sort(&mut entries, ordering)?;

        let mut rows = entries
            .iter()
            .map(|entry| self.project(entry, columns))
            .collect::<DirectoryResult<Vec<Row>>>()?;

        if distinct {
            rows = distinct_by(rows, |row| &row.values);
        }

        Ok(window.apply(rows))
    }
}

/// Drop items whose key equals an earlier item's, keeping first occurrences.
pub fn distinct_by<T, K, F>(items: Vec<T>, key: F) -> Vec<T>
where
    K: PartialEq + ?Sized,
    F: Fn(&T) -> &K,
{
    let mut kept: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if !kept.iter().any(|k| key(k) == key(&item)) {
            kept.push(item);
        }
    }
    kept
}
