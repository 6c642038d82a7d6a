//! Predicate tree
//!
//! Logical conditions over model fields, built from leaf lookups combined
//! with AND / OR and optional negation. The `&`, `|` and `!` operators are
//! sugar over [`Predicate::and`], [`Predicate::or`] and [`Predicate::negate`].

use std::fmt;
use std::ops::{BitAnd, BitOr, Not};
use std::str::FromStr;

use crate::error::DirectoryError;
use crate::value::Value;

/// Comparison requested by a predicate leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lookup {
    Exact,
    StartsWith,
    EndsWith,
    Contains,
    IContains,
    Gte,
    Lte,
    In,
}

impl Lookup {
    /// Lookup name as written in `field__lookup` keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Lookup::Exact => "exact",
            Lookup::StartsWith => "startswith",
            Lookup::EndsWith => "endswith",
            Lookup::Contains => "contains",
            Lookup::IContains => "icontains",
            Lookup::Gte => "gte",
            Lookup::Lte => "lte",
            Lookup::In => "in",
        }
    }
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lookup {
    type Err = DirectoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(Lookup::Exact),
            "startswith" => Ok(Lookup::StartsWith),
            "endswith" => Ok(Lookup::EndsWith),
            "contains" => Ok(Lookup::Contains),
            "icontains" => Ok(Lookup::IContains),
            "gte" => Ok(Lookup::Gte),
            "lte" => Ok(Lookup::Lte),
            "in" => Ok(Lookup::In),
            other => Err(DirectoryError::invalid_query(format!(
                "unsupported lookup '{other}'"
            ))),
        }
    }
}

/// Right-hand side of a leaf.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Single(Value),
    Many(Vec<Value>),
}

/// Connective of a composite node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    And,
    Or,
}

/// A node of the predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Leaf {
        field: String,
        lookup: Lookup,
        operand: Operand,
    },
    Composite {
        connector: Connector,
        negated: bool,
        children: Vec<Predicate>,
    },
}

impl Predicate {
    /// Leaf comparing `field` with a single value.
    pub fn leaf(field: impl Into<String>, lookup: Lookup, value: impl Into<Value>) -> Self {
        Predicate::Leaf {
            field: field.into(),
            lookup,
            operand: Operand::Single(value.into()),
        }
    }

    /// Leaf from a `field__lookup` key; a bare field name means `exact`.
    pub fn lookup(key: &str, value: impl Into<Value>) -> Result<Self, DirectoryError> {
        let (field, lookup) = match key.rsplit_once("__") {
            Some((field, lookup)) => (field, lookup.parse()?),
            None => (key, Lookup::Exact),
        };
        Ok(Self::leaf(field, lookup, value))
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::leaf(field, Lookup::Exact, value)
    }

    pub fn starts_with(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::leaf(field, Lookup::StartsWith, value)
    }

    pub fn ends_with(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::leaf(field, Lookup::EndsWith, value)
    }

    pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::leaf(field, Lookup::Contains, value)
    }

    pub fn icontains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::leaf(field, Lookup::IContains, value)
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::leaf(field, Lookup::Gte, value)
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::leaf(field, Lookup::Lte, value)
    }

    /// Set membership: `field` equals any of `values`.
    pub fn is_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Predicate::Leaf {
            field: field.into(),
            lookup: Lookup::In,
            operand: Operand::Many(values.into_iter().map(Into::into).collect()),
        }
    }

    /// Conjunction of `children`. No children means "always true".
    pub fn and(children: Vec<Predicate>) -> Self {
        Predicate::Composite {
            connector: Connector::And,
            negated: false,
            children,
        }
    }

    /// Disjunction of `children`.
    pub fn or(children: Vec<Predicate>) -> Self {
        Predicate::Composite {
            connector: Connector::Or,
            negated: false,
            children,
        }
    }

    /// The empty, always-true tree.
    pub fn all() -> Self {
        Self::and(Vec::new())
    }

    /// Negate this node. Composites flip their flag, leaves get wrapped.
    pub fn negate(self) -> Self {
        match self {
            Predicate::Composite {
                connector,
                negated,
                children,
            } => Predicate::Composite {
                connector,
                negated: !negated,
                children,
            },
            leaf @ Predicate::Leaf { .. } => Predicate::Composite {
                connector: Connector::And,
                negated: true,
                children: vec![leaf],
            },
        }
    }

    /// Check whether this is a composite without children.
    pub fn is_empty(&self) -> bool {
        matches!(self, Predicate::Composite { children, .. } if children.is_empty())
    }

    fn combine(self, other: Predicate, connector: Connector) -> Predicate {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        match self {
            Predicate::Composite {
                connector: c,
                negated: false,
                mut children,
            } if c == connector => {
                children.push(other);
                Predicate::Composite {
                    connector,
                    negated: false,
                    children,
                }
            }
            this => Predicate::Composite {
                connector,
                negated: false,
                children: vec![this, other],
            },
        }
    }
}

impl Default for Predicate {
    fn default() -> Self {
        Self::all()
    }
}

impl BitAnd for Predicate {
    type Output = Predicate;

    fn bitand(self, rhs: Predicate) -> Predicate {
        self.combine(rhs, Connector::And)
    }
}

impl BitOr for Predicate {
    type Output = Predicate;

    fn bitor(self, rhs: Predicate) -> Predicate {
        self.combine(rhs, Connector::Or)
    }
}

impl Not for Predicate {
    type Output = Predicate;

    fn not(self) -> Predicate {
        self.negate()
    }
}
