//! # LDAP Object Mapping Core
//!
//! Treats entries of an LDAP directory as typed records of a declared model.
//!
//! This crate is transport-agnostic: it compiles queries into LDAP filters,
//! drives paged searches through the [`Directory`](traits::Directory) trait,
//! materializes results client-side and turns record saves into add,
//! modify, rename and delete operations. A concrete LDAP session lives in
//! the `ldapdb-ldap` crate.
//!
//! ## Example
//!
//! ```ignore
//! use ldapdb_core::prelude::*;
//!
//! let group = ModelMeta::new("group", "ou=groups,dc=nodomain")
//!     .with_object_classes(["posixGroup"])
//!     .with_field(FieldDescriptor::new("name", "cn", FieldType::Text).primary_key())
//!     .with_field(FieldDescriptor::new("gid", "gidNumber", FieldType::Integer))
//!     .with_ordering(["name"]);
//!
//! let records = Query::new(&directory, &group)
//!     .filter(Predicate::gte("gid", 1000))
//!     .slice(0, Some(10))
//!     .all()
//!     .await?;
//!
//! let mut record = Record::new().with("name", "staff").with("gid", 1002);
//! EntryManager::new(&directory, &group).save(&mut record).await?;
//! ```
//!
//! ## Crate Organization
//!
//! - [`value`] - Decoded field values
//! - [`codec`] - Field types and attribute encoding
//! - [`model`] - Model metadata and DN construction
//! - [`predicate`] - Predicate trees
//! - [`compiler`] - Predicate to LDAP filter compilation
//! - [`traits`] - The directory session trait and its wire types
//! - [`executor`] - Paged search execution
//! - [`materializer`] - Client-side sort, window, distinct and projection
//! - [`query`] - Query plans and the query facade
//! - [`lifecycle`] - Create, update, rename and delete of records
//! - [`config`] - Connection settings
//! - [`error`] - Error types with transient/permanent classification
//! - [`resilience`] - Reconnect on dropped sessions

pub mod codec;
pub mod compiler;
pub mod config;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod materializer;
pub mod model;
pub mod predicate;
pub mod query;
pub mod resilience;
pub mod traits;
pub mod value;

/// Prelude module for convenient imports.
///
/// ```
/// use ldapdb_core::prelude::*;
/// ```
pub mod prelude {
    // Values and codec
    pub use crate::codec::FieldType;
    pub use crate::value::Value;

    // Models
    pub use crate::model::{FieldDescriptor, ModelMeta, ModelRegistry};

    // Predicates and compilation
    pub use crate::compiler::{CompiledFilter, CompiledQuery, PredicateCompiler};
    pub use crate::predicate::{Connector, Lookup, Operand, Predicate};

    // Directory access
    pub use crate::executor::{SearchExecutor, SearchStream};
    pub use crate::traits::{
        Directory, EntryAttributes, Modification, RawEntry, Scope, SearchItem, SearchPage,
        SearchRequest,
    };

    // Results
    pub use crate::materializer::{Column, Materializer, OrderKey, Row, Window};
    pub use crate::query::{Aggregate, Query, QueryOutput, QueryPlan};

    // Lifecycle
    pub use crate::lifecycle::{EntryManager, Record, RecordState, SaveOutcome};

    // Error handling
    pub use crate::error::{DirectoryError, DirectoryResult, ErrorKind};

    // Configuration
    pub use crate::config::ConnectionSettings;

    // Resilience
    pub use crate::resilience::ReconnectPolicy;
}

// Re-export async_trait for directory implementors
pub use async_trait::async_trait;
