//! LDAP directory session
//!
//! Implements the [`Directory`] trait on top of `ldap3`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ldap3::controls::{Control, ControlType, MakeCritical, PagedResults};
use ldap3::{
    Ldap, LdapConnAsync, LdapConnSettings, LdapError, LdapResult, Mod, ResultEntry, SearchEntry,
    SearchResult,
};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use ldapdb_core::config::ConnectionSettings;
use ldapdb_core::error::{DirectoryError, DirectoryResult};
use ldapdb_core::resilience::ReconnectPolicy;
use ldapdb_core::traits::{
    Directory, EntryAttributes, Modification, RawEntry, Scope, SearchItem, SearchPage,
    SearchRequest,
};

use crate::config::LdapConfig;

/// Attribute list asking the server for no attributes (RFC 4511 §4.5.1.8).
const NO_ATTRIBUTES: &str = "1.1";

const RC_SUCCESS: u32 = 0;
const RC_REFERRAL: u32 = 10;
const RC_UNAVAILABLE_CRITICAL_EXTENSION: u32 = 12;

/// A lazily bound session to one LDAP server.
pub struct LdapDirectory {
    config: LdapConfig,

    /// Connection settings with the options map applied.
    settings: ConnectionSettings,

    policy: ReconnectPolicy,

    /// Cached LDAP connection (lazily initialized).
    connection: Arc<RwLock<Option<Ldap>>>,

    /// Whether the session has been closed.
    closed: Arc<RwLock<bool>>,
}

impl LdapDirectory {
    /// Create a session. Nothing is sent until the first operation.
    pub fn new(config: LdapConfig) -> DirectoryResult<Self> {
        config.validate()?;
        let settings = config.effective_settings()?;
        let policy = ReconnectPolicy::from_settings(&settings);

        Ok(Self {
            config,
            settings,
            policy,
            connection: Arc::new(RwLock::new(None)),
            closed: Arc::new(RwLock::new(false)),
        })
    }

    pub fn config(&self) -> &LdapConfig {
        &self.config
    }

    /// Check whether a bound connection is cached.
    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }

    /// Get an LDAP connection, binding one if necessary.
    async fn get_connection(&self) -> DirectoryResult<Ldap> {
        if *self.closed.read().await {
            return Err(DirectoryError::invalid_configuration(
                "directory session has been closed",
            ));
        }

        {
            let conn_guard = self.connection.read().await;
            if let Some(ref conn) = *conn_guard {
                return Ok(conn.clone());
            }
        }

        let mut conn_guard = self.connection.write().await;
        // Another task may have connected while we waited for the lock.
        if let Some(ref conn) = *conn_guard {
            return Ok(conn.clone());
        }
        let conn = self.create_connection().await?;
        *conn_guard = Some(conn.clone());
        Ok(conn)
    }

    /// Open and bind a new LDAP connection.
    async fn create_connection(&self) -> DirectoryResult<Ldap> {
        let url = &self.config.server_uri;
        debug!(url = %url, starttls = self.config.use_starttls, "Connecting to LDAP server");

        let conn_settings = LdapConnSettings::new()
            .set_conn_timeout(self.settings.connection_timeout())
            .set_starttls(self.config.use_starttls);

        let (conn, mut ldap) = LdapConnAsync::with_settings(conn_settings, url)
            .await
            .map_err(|e| {
                DirectoryError::connection_failed_with_source(
                    format!("Failed to connect to LDAP server at {url}"),
                    e,
                )
            })?;

        // Spawn the connection driver
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver error");
            }
        });

        let bind_dn = &self.config.bind_dn;
        let bind_password = self.config.bind_password.as_deref().unwrap_or("");
        debug!(bind_dn = %bind_dn, "Performing LDAP bind");

        let result = ldap
            .with_timeout(self.settings.connection_timeout())
            .simple_bind(bind_dn, bind_password)
            .await
            .map_err(|e| {
                ldap_error(
                    e,
                    &format!("LDAP bind failed for {bind_dn}"),
                    self.settings.connection_timeout_secs,
                )
            })?;
        check_result(&result, bind_dn)?;

        info!(url = %url, bind_dn = %bind_dn, "LDAP connection established");
        Ok(ldap)
    }

    /// Drop the cached connection so the next operation reconnects.
    async fn reset(&self) {
        if self.connection.write().await.take().is_some() {
            debug!(url = %self.config.server_uri, "Discarded LDAP connection");
        }
    }

    /// Unbind and close the session. Later operations fail.
    pub async fn close(&self) -> DirectoryResult<()> {
        *self.closed.write().await = true;

        let mut conn_guard = self.connection.write().await;
        if let Some(mut ldap) = conn_guard.take() {
            if let Err(e) = ldap.unbind().await {
                warn!(error = %e, "Error during LDAP unbind");
            }
        }

        info!(url = %self.config.server_uri, "LDAP session closed");
        Ok(())
    }

    fn map_ldap_error(&self, error: LdapError, context: &str) -> DirectoryError {
        ldap_error(error, context, self.settings.query_timeout_secs)
    }

    async fn search_page_once(
        &self,
        request: &SearchRequest,
        page_size: Option<u32>,
        cookie: Option<&[u8]>,
    ) -> DirectoryResult<SearchPage> {
        let mut ldap = self.get_connection().await?;
        let attrs = requested_attributes(request);

        if let Some(size) = page_size {
            let control = PagedResults {
                size: i32::try_from(size).unwrap_or(i32::MAX),
                cookie: cookie.map(<[u8]>::to_vec).unwrap_or_default(),
            };
            ldap.with_controls(control.critical());
        }

        let SearchResult(items, result) = ldap
            .with_timeout(self.settings.query_timeout())
            .search(&request.base, ldap_scope(request.scope), &request.filter, attrs.clone())
            .await
            .map_err(|e| self.map_ldap_error(e, "LDAP search failed"))?;

        if result.rc == RC_UNAVAILABLE_CRITICAL_EXTENSION && page_size.is_some() {
            // Server does not support paging; fetch everything in one go.
            debug!(base = %request.base, "Paged results unsupported, searching without paging");
            let SearchResult(items, result) = ldap
                .with_timeout(self.settings.query_timeout())
                .search(&request.base, ldap_scope(request.scope), &request.filter, attrs)
                .await
                .map_err(|e| self.map_ldap_error(e, "LDAP search failed"))?;
            check_result(&result, &request.base)?;
            return Ok(SearchPage {
                items: convert_items(items),
                cookie: None,
                restarted: false,
            });
        }

        if result.rc == RC_REFERRAL {
            return Ok(SearchPage {
                items: vec![SearchItem::Referral(result.refs)],
                cookie: None,
                restarted: false,
            });
        }

        // A missing base maps to NotFound, which the executor reads as no entries.
        check_result(&result, &request.base)?;
        Ok(SearchPage {
            items: convert_items(items),
            cookie: response_cookie(&result),
            restarted: false,
        })
    }

    async fn add_once(&self, dn: &str, attributes: EntryAttributes) -> DirectoryResult<()> {
        let mut ldap = self.get_connection().await?;
        let attrs: Vec<(Vec<u8>, HashSet<Vec<u8>>)> = attributes
            .into_iter()
            .map(|(name, values)| (name.into_bytes(), values.into_iter().collect()))
            .collect();

        let result = ldap
            .with_timeout(self.settings.query_timeout())
            .add(dn, attrs)
            .await
            .map_err(|e| self.map_ldap_error(e, &format!("Failed to create entry: {dn}")))?;
        check_result(&result, dn)
    }

    async fn modify_once(&self, dn: &str, modifications: Vec<Modification>) -> DirectoryResult<()> {
        let mut ldap = self.get_connection().await?;
        let mods: Vec<Mod<Vec<u8>>> = modifications.into_iter().map(to_ldap_mod).collect();

        let result = ldap
            .with_timeout(self.settings.query_timeout())
            .modify(dn, mods)
            .await
            .map_err(|e| self.map_ldap_error(e, &format!("Failed to update entry: {dn}")))?;
        check_result(&result, dn)
    }

    async fn rename_once(&self, dn: &str, new_rdn: &str) -> DirectoryResult<()> {
        let mut ldap = self.get_connection().await?;
        let result = ldap
            .with_timeout(self.settings.query_timeout())
            .modifydn(dn, new_rdn, true, None)
            .await
            .map_err(|e| self.map_ldap_error(e, &format!("Failed to rename entry: {dn}")))?;
        check_result(&result, dn)
    }

    async fn delete_once(&self, dn: &str) -> DirectoryResult<()> {
        let mut ldap = self.get_connection().await?;
        let result = ldap
            .with_timeout(self.settings.query_timeout())
            .delete(dn)
            .await
            .map_err(|e| self.map_ldap_error(e, &format!("Failed to delete entry: {dn}")))?;
        check_result(&result, dn)
    }
}

#[async_trait]
impl Directory for LdapDirectory {
    fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    #[instrument(skip(self, request, cookie), fields(base = %request.base, filter = %request.filter))]
    async fn search_page(
        &self,
        request: &SearchRequest,
        page_size: Option<u32>,
        cookie: Option<&[u8]>,
    ) -> DirectoryResult<SearchPage> {
        let reconnected = AtomicBool::new(false);
        let reconnected = &reconnected;

        self.policy
            .execute(
                move || async move {
                    let (cookie, restarted) =
                        replay_cookie(cookie, reconnected.load(Ordering::SeqCst));
                    let mut page = self.search_page_once(request, page_size, cookie).await?;
                    page.restarted = restarted;
                    Ok::<_, DirectoryError>(page)
                },
                move || async move {
                    reconnected.store(true, Ordering::SeqCst);
                    self.reset().await;
                },
            )
            .await
    }

    #[instrument(skip(self, attributes))]
    async fn add(&self, dn: &str, attributes: EntryAttributes) -> DirectoryResult<()> {
        self.policy
            .execute(|| self.add_once(dn, attributes.clone()), || self.reset())
            .await
    }

    #[instrument(skip(self, modifications))]
    async fn modify(&self, dn: &str, modifications: Vec<Modification>) -> DirectoryResult<()> {
        self.policy
            .execute(|| self.modify_once(dn, modifications.clone()), || self.reset())
            .await
    }

    #[instrument(skip(self))]
    async fn rename(&self, dn: &str, new_rdn: &str) -> DirectoryResult<()> {
        self.policy
            .execute(|| self.rename_once(dn, new_rdn), || self.reset())
            .await
    }

    #[instrument(skip(self))]
    async fn delete(&self, dn: &str) -> DirectoryResult<()> {
        self.policy
            .execute(|| self.delete_once(dn), || self.reset())
            .await
    }
}

impl std::fmt::Debug for LdapDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapDirectory")
            .field("config", &self.config.redacted())
            .field("settings", &self.settings)
            .finish()
    }
}

/// Map a client-side `ldap3` failure. Timeouts report the limit that was hit.
fn ldap_error(error: LdapError, context: &str, timeout_secs: u64) -> DirectoryError {
    match error {
        LdapError::Timeout { .. } => DirectoryError::Timeout { timeout_secs },
        other => DirectoryError::connection_failed_with_source(context.to_string(), other),
    }
}

/// Cookie to send for a page, and whether the search restarts.
///
/// Cookies are bound to the connection that issued them, so a page replayed
/// on a new connection starts over without one.
fn replay_cookie(cookie: Option<&[u8]>, reconnected: bool) -> (Option<&[u8]>, bool) {
    if reconnected {
        (None, cookie.is_some())
    } else {
        (cookie, false)
    }
}

fn ldap_scope(scope: Scope) -> ldap3::Scope {
    match scope {
        Scope::Base => ldap3::Scope::Base,
        Scope::OneLevel => ldap3::Scope::OneLevel,
        Scope::Subtree => ldap3::Scope::Subtree,
    }
}

/// Attribute names to request; none means identities only.
fn requested_attributes(request: &SearchRequest) -> Vec<&str> {
    if request.is_identity_only() {
        vec![NO_ATTRIBUTES]
    } else {
        request.attributes.iter().map(String::as_str).collect()
    }
}

fn check_result(result: &LdapResult, target: &str) -> DirectoryResult<()> {
    if result.rc == RC_SUCCESS {
        Ok(())
    } else {
        Err(DirectoryError::from_result_code(result.rc, &result.text, target))
    }
}

/// Cookie from the paged-results response control, if the server sent one.
fn response_cookie(result: &LdapResult) -> Option<Vec<u8>> {
    result.ctrls.iter().find_map(|Control(ctype, raw)| match ctype {
        Some(ControlType::PagedResults) => Some(raw.parse::<PagedResults>().cookie),
        _ => None,
    })
}

fn convert_items(items: Vec<ResultEntry>) -> Vec<SearchItem> {
    items
        .into_iter()
        .filter(|item| !item.is_intermediate())
        .map(|item| {
            if item.is_ref() {
                // Continuation references are skipped; their URIs are not decoded.
                SearchItem::Referral(Vec::new())
            } else {
                SearchItem::Entry(convert_entry(SearchEntry::construct(item)))
            }
        })
        .collect()
}

/// Merge text and binary attributes into one raw byte map.
fn convert_entry(entry: SearchEntry) -> RawEntry {
    let mut raw = RawEntry::new(entry.dn);
    for (name, values) in entry.attrs {
        raw.attributes
            .insert(name, values.into_iter().map(String::into_bytes).collect());
    }
    for (name, values) in entry.bin_attrs {
        raw.attributes.entry(name).or_default().extend(values);
    }
    raw
}

fn to_ldap_mod(modification: Modification) -> Mod<Vec<u8>> {
    match modification {
        Modification::Replace { attribute, values } => {
            Mod::Replace(attribute.into_bytes(), values.into_iter().collect())
        }
        Modification::Delete { attribute } => Mod::Delete(attribute.into_bytes(), HashSet::new()),
    }
}
