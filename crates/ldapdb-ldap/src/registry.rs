//! Named connection aliases
//!
//! Sessions are looked up by alias. `bind_as` derives a temporary alias from
//! an existing one, bound as another DN, and hands back a guard that
//! unregisters it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use ldapdb_core::error::{DirectoryError, DirectoryResult};

use crate::config::LdapConfig;
use crate::directory::LdapDirectory;

/// Alias used when the caller does not name one.
pub const DEFAULT_ALIAS: &str = "default";

type Connections = Arc<RwLock<HashMap<String, Arc<LdapDirectory>>>>;

/// Directory sessions keyed by alias.
pub struct ConnectionRegistry {
    connections: Connections,
    next_temporary: AtomicU64,
}

impl ConnectionRegistry {
    /// Create a registry holding `config` under the default alias.
    pub fn new(config: LdapConfig) -> DirectoryResult<Self> {
        let registry = Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            next_temporary: AtomicU64::new(1),
        };
        registry.register(DEFAULT_ALIAS, config)?;
        Ok(registry)
    }

    /// Register a session under a new alias.
    pub fn register(&self, alias: &str, config: LdapConfig) -> DirectoryResult<Arc<LdapDirectory>> {
        let directory = Arc::new(LdapDirectory::new(config)?);

        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        if connections.contains_key(alias) {
            return Err(DirectoryError::invalid_configuration(format!(
                "connection alias '{alias}' is already registered"
            )));
        }
        connections.insert(alias.to_string(), directory.clone());
        debug!(alias = %alias, "Registered directory connection");
        Ok(directory)
    }

    pub fn get(&self, alias: &str) -> DirectoryResult<Arc<LdapDirectory>> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(alias)
            .cloned()
            .ok_or_else(|| {
                DirectoryError::invalid_configuration(format!("unknown connection alias '{alias}'"))
            })
    }

    pub fn default_directory(&self) -> DirectoryResult<Arc<LdapDirectory>> {
        self.get(DEFAULT_ALIAS)
    }

    /// Registered aliases, sorted.
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        aliases.sort();
        aliases
    }

    /// Unregister an alias and close its session.
    pub async fn remove(&self, alias: &str) -> DirectoryResult<()> {
        let directory = self
            .connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(alias);

        match directory {
            Some(directory) => directory.close().await,
            None => Err(DirectoryError::invalid_configuration(format!(
                "unknown connection alias '{alias}'"
            ))),
        }
    }

    /// Register a temporary alias that talks to `alias`'s server as `bind_dn`.
    ///
    /// The registration lasts until the guard is released or dropped.
    pub fn bind_as(
        &self,
        alias: &str,
        bind_dn: impl Into<String>,
        password: impl Into<String>,
    ) -> DirectoryResult<BoundAlias> {
        let base = self.get(alias)?;
        let config = base.config().bound_as(bind_dn, password);

        let n = self.next_temporary.fetch_add(1, Ordering::Relaxed);
        let temporary = format!("{alias}#bind-as-{n}");
        let directory = self.register(&temporary, config)?;

        info!(alias = %temporary, bind_dn = %directory.config().bind_dn, "Bound temporary alias");
        Ok(BoundAlias {
            alias: temporary,
            directory,
            connections: self.connections.clone(),
            released: false,
        })
    }

    /// Close every session and clear the registry.
    pub async fn close_all(&self) {
        let directories: Vec<Arc<LdapDirectory>> = self
            .connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, directory)| directory)
            .collect();

        for directory in directories {
            if let Err(e) = directory.close().await {
                warn!(error = %e, "Failed to close directory session");
            }
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("aliases", &self.aliases())
            .finish()
    }
}

/// A temporary alias bound as another DN.
///
/// Dropping the guard unregisters the alias; `release` also unbinds.
pub struct BoundAlias {
    alias: String,
    directory: Arc<LdapDirectory>,
    connections: Connections,
    released: bool,
}

impl BoundAlias {
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn directory(&self) -> &LdapDirectory {
        &self.directory
    }

    fn unregister(&self) {
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.alias);
    }

    /// Unregister the alias and unbind its session.
    pub async fn release(mut self) -> DirectoryResult<()> {
        self.unregister();
        self.released = true;
        debug!(alias = %self.alias, "Released temporary alias");
        self.directory.close().await
    }
}

impl Drop for BoundAlias {
    fn drop(&mut self) {
        if !self.released {
            self.unregister();
        }
    }
}

impl std::fmt::Debug for BoundAlias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundAlias")
            .field("alias", &self.alias)
            .field("directory", &self.directory)
            .finish()
    }
}
