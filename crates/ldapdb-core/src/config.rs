//! Directory session settings
//!
//! Timeouts, paging and reconnect settings shared by every backend, plus the
//! free-form per-connection options map that can override them.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DirectoryError, DirectoryResult};

/// Option key overriding [`ConnectionSettings::page_size`].
pub const OPTION_PAGE_SIZE: &str = "page_size";

/// Option key overriding [`ConnectionSettings::query_timeout_secs`].
pub const OPTION_QUERY_TIMEOUT: &str = "query_timeout";

/// Common connection settings for a directory session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Connection (TCP + bind) timeout in seconds.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Timeout applied to every directory operation, in seconds.
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,

    /// Entries requested per page in paged searches.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Ceiling on pages fetched by a single search.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Reconnect-and-retry attempts after a dropped session.
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,

    /// Delay before reconnecting, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_query_timeout() -> u64 {
    60
}

fn default_page_size() -> u32 {
    1000
}

fn default_max_pages() -> u32 {
    10_000
}

fn default_max_reconnects() -> u32 {
    1
}

fn default_retry_delay_ms() -> u64 {
    0
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connection_timeout_secs: default_connection_timeout(),
            query_timeout_secs: default_query_timeout(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            max_reconnects: default_max_reconnects(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl ConnectionSettings {
    /// Create new connection settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn with_connection_timeout(mut self, secs: u64) -> Self {
        self.connection_timeout_secs = secs;
        self
    }

    /// Set the per-operation timeout.
    #[must_use]
    pub fn with_query_timeout(mut self, secs: u64) -> Self {
        self.query_timeout_secs = secs;
        self
    }

    /// Set the search page size.
    #[must_use]
    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = size;
        self
    }

    /// Set the page ceiling for a single search.
    #[must_use]
    pub fn with_max_pages(mut self, pages: u32) -> Self {
        self.max_pages = pages;
        self
    }

    /// Get connection timeout as Duration.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Get query timeout as Duration.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    /// Get reconnect delay as Duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Apply overrides from a per-connection options map.
    ///
    /// Unknown keys are ignored; known keys with unparsable values are a
    /// configuration error.
    pub fn apply_options(&self, options: &HashMap<String, String>) -> DirectoryResult<Self> {
        let mut settings = self.clone();

        if let Some(raw) = options.get(OPTION_PAGE_SIZE) {
            settings.page_size = parse_option(OPTION_PAGE_SIZE, raw)?;
        }
        if let Some(raw) = options.get(OPTION_QUERY_TIMEOUT) {
            settings.query_timeout_secs = parse_option(OPTION_QUERY_TIMEOUT, raw)?;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings.
    pub fn validate(&self) -> DirectoryResult<()> {
        if self.page_size == 0 {
            return Err(DirectoryError::invalid_configuration(
                "page_size must be greater than zero",
            ));
        }
        if self.max_pages == 0 {
            return Err(DirectoryError::invalid_configuration(
                "max_pages must be greater than zero",
            ));
        }
        if self.query_timeout_secs == 0 {
            return Err(DirectoryError::invalid_configuration(
                "query_timeout_secs must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn parse_option<T: std::str::FromStr>(key: &str, raw: &str) -> DirectoryResult<T> {
    raw.trim().parse().map_err(|_| {
        DirectoryError::invalid_configuration(format!("option '{key}' has invalid value '{raw}'"))
    })
}
