//! Search executor
//!
//! Runs a compiled search as a sequence of paged round-trips (RFC 2696):
//! each response's cookie is sent back until the server returns an empty
//! one. Referrals are skipped and a missing search base yields no entries.

use tracing::{debug, warn};

use crate::error::{DirectoryError, DirectoryResult};
use crate::traits::{Directory, RawEntry, Scope, SearchItem, SearchRequest};

/// Starts searches against a directory session.
#[derive(Clone, Copy)]
pub struct SearchExecutor<'a> {
    directory: &'a dyn Directory,
}

impl<'a> SearchExecutor<'a> {
    pub fn new(directory: &'a dyn Directory) -> Self {
        Self { directory }
    }

    /// Start a search. Nothing is sent until the first page is requested.
    pub fn search(&self, request: SearchRequest) -> SearchStream<'a> {
        let settings = self.directory.settings();

        // A base-scope search returns at most one entry.
        let page_size = match request.scope {
            Scope::Base => None,
            Scope::OneLevel | Scope::Subtree => Some(settings.page_size),
        };

        debug!(
            base = %request.base,
            scope = %request.scope,
            filter = %request.filter,
            "Searching directory"
        );

        SearchStream {
            directory: self.directory,
            request,
            page_size,
            max_pages: settings.max_pages,
            pages_fetched: 0,
            cookie: None,
            restarted: false,
            done: false,
        }
    }

    /// Run a search to completion.
    pub async fn search_all(&self, request: SearchRequest) -> DirectoryResult<Vec<RawEntry>> {
        self.search(request).collect().await
    }
}

/// A lazy, finite, non-restartable sequence of result pages.
pub struct SearchStream<'a> {
    directory: &'a dyn Directory,
    request: SearchRequest,
    page_size: Option<u32>,
    max_pages: u32,
    pages_fetched: u32,
    cookie: Option<Vec<u8>>,
    restarted: bool,
    done: bool,
}

impl SearchStream<'_> {
    /// Fetch the next page of entries, or `None` once the search is over.
    ///
    /// If the session dropped mid-search the directory starts over from the
    /// first page; [`SearchStream::restarted`] then reports that earlier
    /// pages are superseded.
    pub async fn next_page(&mut self) -> DirectoryResult<Option<Vec<RawEntry>>> {
        if self.done {
            return Ok(None);
        }

        if self.pages_fetched >= self.max_pages {
            self.done = true;
            warn!(
                base = %self.request.base,
                max_pages = self.max_pages,
                "Paged search still returning cookies at page ceiling"
            );
            return Err(DirectoryError::PageLimitExceeded {
                max_pages: self.max_pages,
            });
        }

        let page = match self
            .directory
            .search_page(&self.request, self.page_size, self.cookie.as_deref())
            .await
        {
            Ok(page) => page,
            Err(DirectoryError::NotFound { dn }) => {
                debug!(base = %dn, "Search base does not exist, returning no entries");
                self.done = true;
                return Ok(None);
            }
            Err(e) => {
                self.done = true;
                return Err(e);
            }
        };
        self.pages_fetched += 1;

        self.restarted = page.restarted;
        if page.restarted {
            warn!(
                base = %self.request.base,
                pages = self.pages_fetched,
                "Paged search restarted after reconnect"
            );
        }

        let mut referrals = 0usize;
        let entries: Vec<RawEntry> = page
            .items
            .into_iter()
            .filter_map(|item| match item {
                SearchItem::Entry(entry) => Some(entry),
                SearchItem::Referral(_) => {
                    referrals += 1;
                    None
                }
            })
            .collect();

        if referrals > 0 {
            debug!(referrals, "Skipped search referrals");
        }

        self.cookie = page.cookie.filter(|c| !c.is_empty());
        if self.page_size.is_none() || self.cookie.is_none() {
            self.done = true;
        }

        Ok(Some(entries))
    }

    /// Number of round-trips made so far.
    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    /// Whether the last page started the search over.
    pub fn restarted(&self) -> bool {
        self.restarted
    }

    /// Drain every remaining page.
    pub async fn collect(mut self) -> DirectoryResult<Vec<RawEntry>> {
        let mut entries = Vec::new();
        while let Some(page) = self.next_page().await? {
            if self.restarted {
                entries.clear();
            }
            entries.extend(page);
        }

        debug!(
            entries = entries.len(),
            pages = self.pages_fetched,
            "Directory search completed"
        );

        Ok(entries)
    }
}
