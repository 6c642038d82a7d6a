//! # LDAP Backend
//!
//! `ldap3`-backed directory sessions for `ldapdb-core`.
//!
//! ## Features
//!
//! - Lazy bind on first use, STARTTLS
//! - Per-operation timeouts
//! - Paged search results (RFC 2696)
//! - One transparent reconnect after a dropped session
//! - Named connection aliases and temporary "bind as" aliases
//!
//! ## Example
//!
//! ```ignore
//! use ldapdb_ldap::{ConnectionRegistry, LdapConfig};
//! use ldapdb_core::prelude::*;
//!
//! let config = LdapConfig::new("ldap://localhost:389", "cn=admin,dc=nodomain")
//!     .with_password("secret")
//!     .with_option("page_size", "500");
//!
//! let registry = ConnectionRegistry::new(config)?;
//! let directory = registry.default_directory()?;
//! let groups = Query::new(directory.as_ref(), &group_model).all().await?;
//! ```

pub mod config;
pub mod directory;
pub mod registry;

// Re-exports
pub use config::LdapConfig;
pub use directory::LdapDirectory;
pub use registry::{BoundAlias, ConnectionRegistry, DEFAULT_ALIAS};
