//! Directory backend trait
//!
//! The protocol surface the core needs from a directory server: one page of
//! a search, add, modify, rename and delete. Backends map their native
//! result codes to [`DirectoryError`](crate::error::DirectoryError) before
//! returning.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ConnectionSettings;
use crate::error::DirectoryResult;

/// Search breadth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// The base entry only.
    Base,
    /// Immediate children of the base.
    OneLevel,
    /// The base and everything below it.
    #[default]
    Subtree,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Base => write!(f, "base"),
            Scope::OneLevel => write!(f, "one"),
            Scope::Subtree => write!(f, "sub"),
        }
    }
}

/// A fully compiled search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base: String,
    pub scope: Scope,
    pub filter: String,
    /// Attributes to return. Empty means identities only.
    pub attributes: Vec<String>,
}

impl SearchRequest {
    pub fn new(base: impl Into<String>, scope: Scope, filter: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            scope,
            filter: filter.into(),
            attributes: Vec::new(),
        }
    }

    /// Request these attributes.
    #[must_use]
    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Check if the search only needs entry identities.
    pub fn is_identity_only(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// An entry as returned by the server: identity plus raw attribute values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEntry {
    pub dn: String,
    pub attributes: HashMap<String, Vec<Vec<u8>>>,
}

impl RawEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: HashMap::new(),
        }
    }

    /// Add string values for an attribute.
    #[must_use]
    pub fn with<I, S>(mut self, attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        self.attributes.insert(
            attribute.into(),
            values.into_iter().map(|v| v.as_ref().to_vec()).collect(),
        );
        self
    }

    /// Values of an attribute. Attribute names compare case-insensitively.
    pub fn get(&self, attribute: &str) -> &[Vec<u8>] {
        if let Some(values) = self.attributes.get(attribute) {
            return values;
        }
        self.attributes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }
}

/// One item of a search response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchItem {
    Entry(RawEntry),
    /// Continuation reference; carries no identity and is skipped.
    Referral(Vec<String>),
}

/// Result of one search round-trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    pub items: Vec<SearchItem>,
    /// Continuation cookie. `None` or empty means no more pages.
    pub cookie: Option<Vec<u8>>,
    /// The session was re-established and the search started over from the
    /// first page. Entries of earlier pages are superseded.
    pub restarted: bool,
}

/// A single attribute change of a modify operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    /// Replace every value of the attribute.
    Replace {
        attribute: String,
        values: Vec<Vec<u8>>,
    },
    /// Remove the attribute entirely.
    Delete { attribute: String },
}

impl Modification {
    pub fn attribute(&self) -> &str {
        match self {
            Modification::Replace { attribute, .. } | Modification::Delete { attribute } => attribute,
        }
    }
}

/// Attribute list of an add operation.
pub type EntryAttributes = Vec<(String, Vec<Vec<u8>>)>;

/// A directory server session.
///
/// Implementations handle binding, timeouts and reconnects; callers see one
/// request at a time.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Settings governing paging and timeouts for this session.
    fn settings(&self) -> &ConnectionSettings;

    /// Fetch one page of a search.
    ///
    /// `page_size` of `None` sends no paging control. A server that ignores
    /// the control returns every entry with no cookie.
    async fn search_page(
        &self,
        request: &SearchRequest,
        page_size: Option<u32>,
        cookie: Option<&[u8]>,
    ) -> DirectoryResult<SearchPage>;

    /// Create an entry.
    async fn add(&self, dn: &str, attributes: EntryAttributes) -> DirectoryResult<()>;

    /// Apply attribute changes to an entry.
    async fn modify(&self, dn: &str, changes: Vec<Modification>) -> DirectoryResult<()>;

    /// Change the relative identity of an entry, dropping the old one.
    async fn rename(&self, dn: &str, new_rdn: &str) -> DirectoryResult<()>;

    /// Remove an entry.
    async fn delete(&self, dn: &str) -> DirectoryResult<()>;
}
