//! Entry lifecycle
//!
//! Create, update, rename and delete single entries by diffing a record's
//! current values against its last saved state. A save may take up to three
//! round-trips (add, or rename then modify) and is not atomic: a failure
//! between the rename and the modify leaves the entry renamed with its old
//! attribute values.

use std::collections::BTreeMap;

use tracing::{debug, info, instrument};

use crate::error::{DirectoryError, DirectoryResult};
use crate::executor::SearchExecutor;
use crate::model::{rdn_equals, split_rdn, ModelMeta};
use crate::traits::{Directory, EntryAttributes, Modification, RawEntry, Scope, SearchRequest};
use crate::value::Value;

const OBJECT_CLASS: &str = "objectClass";

/// Where a record stands relative to the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Never saved; has no identity.
    Transient,
    /// Saved and unchanged in its key fields.
    Persisted,
    /// Saved, but a key field changed; the next save renames the entry.
    PendingRename,
    /// Removed from the directory. Terminal.
    Deleted,
}

/// Field values of one entry plus its identity and last saved state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    values: BTreeMap<String, Value>,
    dn: Option<String>,
    snapshot: Option<BTreeMap<String, Value>>,
    deleted: bool,
}

impl Record {
    /// A new, unsaved record.
    pub fn new() -> Self {
        Self::default()
    }

    /// A record for an entry that already exists at `dn`, without a snapshot.
    ///
    /// Saving it re-reads the entry at exactly that dn to diff against.
    pub fn existing(dn: impl Into<String>) -> Self {
        Self {
            dn: Some(dn.into()),
            ..Self::default()
        }
    }

    /// A record loaded from a search result, snapshotted as saved.
    pub fn from_entry(meta: &ModelMeta, entry: &RawEntry) -> Self {
        let values = meta.decode_entry(entry);
        Self {
            snapshot: Some(values.clone()),
            values,
            dn: Some(entry.dn.clone()),
            deleted: false,
        }
    }

    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Current identity, if the record has been saved.
    pub fn dn(&self) -> Option<&str> {
        self.dn.as_deref()
    }

    /// Values as of the last load or save.
    pub fn snapshot(&self) -> Option<&BTreeMap<String, Value>> {
        self.snapshot.as_ref()
    }

    pub fn state(&self, meta: &ModelMeta) -> RecordState {
        if self.deleted {
            return RecordState::Deleted;
        }
        let Some(dn) = &self.dn else {
            return RecordState::Transient;
        };
        match meta.build_rdn(&self.values) {
            Ok(rdn) if !rdn_equals(&rdn, split_rdn(dn).0) => RecordState::PendingRename,
            _ => RecordState::Persisted,
        }
    }
}

/// What a save sent to the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Created { dn: String },
    Updated {
        dn: String,
        renamed: bool,
        modifications: usize,
    },
}

/// Writes records of one model to a directory session.
#[derive(Clone, Copy)]
pub struct EntryManager<'a> {
    directory: &'a dyn Directory,
    meta: &'a ModelMeta,
}

impl<'a> EntryManager<'a> {
    pub fn new(directory: &'a dyn Directory, meta: &'a ModelMeta) -> Self {
        Self { directory, meta }
    }

    /// Create or update the entry behind `record`.
    #[instrument(skip(self, record), fields(model = %self.meta.name))]
    pub async fn save(&self, record: &mut Record) -> DirectoryResult<SaveOutcome> {
        if record.deleted {
            return Err(DirectoryError::invalid_query(
                "cannot save a record that has been deleted",
            ));
        }

        match record.dn.clone() {
            None => self.create(record).await,
            Some(dn) => self.update(record, dn).await,
        }
    }

    async fn create(&self, record: &mut Record) -> DirectoryResult<SaveOutcome> {
        let dn = self.meta.build_dn(&record.values)?;

        let mut attributes: EntryAttributes = vec![(
            OBJECT_CLASS.to_string(),
            self.meta
                .object_classes
                .iter()
                .map(|c| c.as_bytes().to_vec())
                .collect(),
        )];

        for field in &self.meta.fields {
            let Some(value) = record.values.get(&field.name) else {
                continue;
            };
            let encoded = field.encode(value)?;
            if !encoded.is_empty() {
                attributes.push((field.attribute.clone(), encoded));
            }
        }

        debug!(dn = %dn, attributes = attributes.len(), "Creating directory entry");
        self.directory.add(&dn, attributes).await?;
        info!(dn = %dn, "Directory entry created");

        record.dn = Some(dn.clone());
        record.snapshot = Some(record.values.clone());
        Ok(SaveOutcome::Created { dn })
    }

    async fn update(&self, record: &mut Record, old_dn: String) -> DirectoryResult<SaveOutcome> {
        let prior = match &record.snapshot {
            Some(snapshot) => snapshot.clone(),
            None => self.fetch_exact(&old_dn).await?,
        };

        let modifications = self.diff(&prior, &record.values)?;

        // Rename first, keeping the entry in its current container.
        let new_rdn = self.meta.build_rdn(&record.values)?;
        let (old_rdn, parent) = split_rdn(&old_dn);
        let mut dn = old_dn.clone();
        let renamed = !rdn_equals(&new_rdn, old_rdn);
        if renamed {
            debug!(dn = %old_dn, new_rdn = %new_rdn, "Renaming directory entry");
            self.directory.rename(&old_dn, &new_rdn).await?;
            dn = match parent {
                Some(parent) => format!("{new_rdn},{parent}"),
                None => new_rdn.clone(),
            };
            record.dn = Some(dn.clone());
            info!(old_dn = %old_dn, dn = %dn, "Directory entry renamed");
        }

        let count = modifications.len();
        if modifications.is_empty() {
            debug!(dn = %dn, "No attribute changes to save");
        } else {
            debug!(dn = %dn, modifications = count, "Modifying directory entry");
            self.directory.modify(&dn, modifications).await?;
            info!(dn = %dn, "Directory entry updated");
        }

        record.snapshot = Some(record.values.clone());
        Ok(SaveOutcome::Updated {
            dn,
            renamed,
            modifications: count,
        })
    }

    /// Modifications turning `prior` into `current`, key fields excluded.
    ///
    /// Fields missing from `current` are left untouched.
    pub fn diff(
        &self,
        prior: &BTreeMap<String, Value>,
        current: &BTreeMap<String, Value>,
    ) -> DirectoryResult<Vec<Modification>> {
        let mut modifications = Vec::new();

        for field in self.meta.fields.iter().filter(|f| !f.primary_key) {
            let Some(new_value) = current.get(&field.name) else {
                continue;
            };
            let old = field.encode(prior.get(&field.name).unwrap_or(&Value::Null))?;
            let new = field.encode(new_value)?;
            if old == new {
                continue;
            }

            if !new.is_empty() {
                modifications.push(Modification::Replace {
                    attribute: field.attribute.clone(),
                    values: new,
                });
            } else if !old.is_empty() {
                modifications.push(Modification::Delete {
                    attribute: field.attribute.clone(),
                });
            }
        }

        Ok(modifications)
    }

    /// Re-read the entry at exactly `dn`.
    async fn fetch_exact(&self, dn: &str) -> DirectoryResult<BTreeMap<String, Value>> {
        let request = SearchRequest::new(dn, Scope::Base, "(objectClass=*)")
            .with_attributes(self.meta.attributes());
        let entries = SearchExecutor::new(self.directory).search_all(request).await?;

        // A base-scope search returns the entry at `dn` or nothing.
        let entry = entries
            .into_iter()
            .next()
            .ok_or_else(|| DirectoryError::NotFound { dn: dn.to_string() })?;
        Ok(self.meta.decode_entry(&entry))
    }

    /// Delete the entry behind `record`. The record becomes terminal.
    #[instrument(skip(self, record), fields(model = %self.meta.name))]
    pub async fn delete(&self, record: &mut Record) -> DirectoryResult<()> {
        let Some(dn) = record.dn.clone() else {
            return Err(DirectoryError::invalid_query(
                "cannot delete a record that was never saved",
            ));
        };

        self.directory.delete(&dn).await?;
        info!(dn = %dn, "Directory entry deleted");

        record.dn = None;
        record.snapshot = None;
        record.deleted = true;
        Ok(())
    }

    /// Delete every entry a search matches. Returns the number deleted.
    #[instrument(skip(self, request), fields(model = %self.meta.name, filter = %request.filter))]
    pub async fn delete_matching(&self, request: SearchRequest) -> DirectoryResult<usize> {
        let request = SearchRequest {
            attributes: Vec::new(),
            ..request
        };
        let entries = SearchExecutor::new(self.directory).search_all(request).await?;

        for entry in &entries {
            self.directory.delete(&entry.dn).await?;
            debug!(dn = %entry.dn, "Directory entry deleted");
        }

        info!(deleted = entries.len(), "Bulk delete completed");
        Ok(entries.len())
    }
}
