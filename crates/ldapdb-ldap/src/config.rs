//! LDAP connection configuration
//!
//! Connection parameters for one directory alias.

use std::collections::HashMap;

use ldapdb_core::config::ConnectionSettings;
use ldapdb_core::error::{DirectoryError, DirectoryResult};
use serde::{Deserialize, Serialize};

const REDACTED: &str = "***REDACTED***";

const URI_SCHEMES: [&str; 3] = ["ldap://", "ldaps://", "ldapi://"];

/// Configuration for an LDAP directory connection.
#[derive(Clone, Serialize, Deserialize)]
pub struct LdapConfig {
    /// Server URI, e.g. `ldap://localhost:389` or `ldaps://ldap.example.com`.
    pub server_uri: String,

    /// Bind DN; empty for an anonymous bind.
    #[serde(default)]
    pub bind_dn: String,

    /// Bind password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_password: Option<String>,

    /// Upgrade a plain `ldap://` connection with STARTTLS.
    #[serde(default)]
    pub use_starttls: bool,

    /// Free-form options; `page_size` and `query_timeout` override
    /// the typed connection settings.
    #[serde(default)]
    pub options: HashMap<String, String>,

    /// Timeouts, paging and reconnect settings.
    #[serde(default)]
    pub connection: ConnectionSettings,
}

impl std::fmt::Debug for LdapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapConfig")
            .field("server_uri", &self.server_uri)
            .field("bind_dn", &self.bind_dn)
            .field("bind_password", &self.bind_password.as_ref().map(|_| REDACTED))
            .field("use_starttls", &self.use_starttls)
            .field("options", &self.options)
            .field("connection", &self.connection)
            .finish()
    }
}

impl LdapConfig {
    /// Create a new LDAP config with required fields.
    pub fn new(server_uri: impl Into<String>, bind_dn: impl Into<String>) -> Self {
        Self {
            server_uri: server_uri.into(),
            bind_dn: bind_dn.into(),
            bind_password: None,
            use_starttls: false,
            options: HashMap::new(),
            connection: ConnectionSettings::default(),
        }
    }

    /// Set bind password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.bind_password = Some(password.into());
        self
    }

    /// Enable STARTTLS.
    #[must_use]
    pub fn with_starttls(mut self) -> Self {
        self.use_starttls = true;
        self
    }

    /// Set one free-form option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Replace the connection settings.
    #[must_use]
    pub fn with_connection(mut self, connection: ConnectionSettings) -> Self {
        self.connection = connection;
        self
    }

    /// Same server and settings, bound as another DN.
    #[must_use]
    pub fn bound_as(&self, bind_dn: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            bind_dn: bind_dn.into(),
            bind_password: Some(password.into()),
            ..self.clone()
        }
    }

    /// Connection settings with the options map applied.
    pub fn effective_settings(&self) -> DirectoryResult<ConnectionSettings> {
        self.connection.apply_options(&self.options)
    }

    pub fn validate(&self) -> DirectoryResult<()> {
        if self.server_uri.is_empty() {
            return Err(DirectoryError::invalid_configuration("server_uri is required"));
        }

        let lower = self.server_uri.to_ascii_lowercase();
        if !URI_SCHEMES.iter().any(|scheme| lower.starts_with(scheme)) {
            return Err(DirectoryError::invalid_configuration(format!(
                "server_uri '{}' must start with ldap://, ldaps:// or ldapi://",
                self.server_uri
            )));
        }

        if self.use_starttls && lower.starts_with("ldaps://") {
            return Err(DirectoryError::invalid_configuration(
                "cannot use both ldaps:// and STARTTLS",
            ));
        }

        if self.bind_password.is_some() && self.bind_dn.is_empty() {
            return Err(DirectoryError::invalid_configuration(
                "bind_password given without bind_dn",
            ));
        }

        self.effective_settings()?;
        Ok(())
    }

    /// Copy safe to log or serialize.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.bind_password.is_some() {
            config.bind_password = Some(REDACTED.to_string());
        }
        config
    }
}
