//! Query facade
//!
//! A [`QueryPlan`] collects everything a caller asked for (predicate,
//! ordering, window, distinct, projection, aggregate). A [`Query`] binds a
//! plan to a directory session and a model and runs it through the
//! compiler, executor and materializer.

use tracing::debug;

use crate::compiler::{CompiledQuery, PredicateCompiler};
use crate::error::{DirectoryError, DirectoryResult};
use crate::executor::SearchExecutor;
use crate::lifecycle::{EntryManager, Record};
use crate::materializer::{distinct_by, Column, Materializer, OrderKey, Row, Window};
use crate::model::{ModelMeta, PK_ALIAS};
use crate::predicate::Predicate;
use crate::traits::Directory;

/// Aggregates computed over the whole result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    /// Number of results, after distinct and window.
    Count,
}

/// What to fetch and how to shape it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPlan {
    pub predicate: Predicate,
    /// Explicit ordering; empty means the model default.
    pub ordering: Vec<OrderKey>,
    pub window: Window,
    pub distinct: bool,
    /// Projection; `None` returns whole records.
    pub columns: Option<Vec<Column>>,
    pub aggregate: Option<Aggregate>,
    /// Set by `none()`: nothing matches and nothing is sent.
    pub empty: bool,
}

impl QueryPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// AND another predicate into the plan.
    #[must_use]
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = std::mem::take(&mut self.predicate) & predicate;
        self
    }

    /// AND the negation of a predicate into the plan.
    #[must_use]
    pub fn exclude(self, predicate: Predicate) -> Self {
        self.filter(!predicate)
    }

    /// Replace the ordering with `name` / `-name` keys.
    #[must_use]
    pub fn order_by<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ordering = OrderKey::from_keys(keys);
        self
    }

    /// Slice `[low, high)` relative to the current window.
    #[must_use]
    pub fn slice(mut self, low: usize, high: Option<usize>) -> Self {
        self.window = self.window.narrow(low, high);
        self
    }

    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    #[must_use]
    pub fn values(mut self, columns: Vec<Column>) -> Self {
        self.columns = Some(columns);
        self
    }

    #[must_use]
    pub fn count(mut self) -> Self {
        self.aggregate = Some(Aggregate::Count);
        self
    }

    #[must_use]
    pub fn none(mut self) -> Self {
        self.empty = true;
        self
    }

    /// Ordering to apply: explicit keys, else the model default.
    pub fn effective_ordering(&self, meta: &ModelMeta) -> Vec<OrderKey> {
        if self.ordering.is_empty() {
            OrderKey::from_keys(&meta.ordering)
        } else {
            self.ordering.clone()
        }
    }
}

/// Result of running a plan.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Records(Vec<Record>),
    Rows(Vec<Row>),
    Count(usize),
}

/// A plan bound to a session and a model.
#[derive(Clone)]
pub struct Query<'a> {
    directory: &'a dyn Directory,
    meta: &'a ModelMeta,
    plan: QueryPlan,
}

impl<'a> Query<'a> {
    /// Every entry of the model.
    pub fn new(directory: &'a dyn Directory, meta: &'a ModelMeta) -> Self {
        Self::from_plan(directory, meta, QueryPlan::new())
    }

    pub fn from_plan(directory: &'a dyn Directory, meta: &'a ModelMeta, plan: QueryPlan) -> Self {
        Self {
            directory,
            meta,
            plan,
        }
    }

    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    #[must_use]
    pub fn filter(self, predicate: Predicate) -> Self {
        self.map_plan(|p| p.filter(predicate))
    }

    #[must_use]
    pub fn exclude(self, predicate: Predicate) -> Self {
        self.map_plan(|p| p.exclude(predicate))
    }

    #[must_use]
    pub fn order_by<I, S>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.map_plan(|p| p.order_by(keys))
    }

    #[must_use]
    pub fn slice(self, low: usize, high: Option<usize>) -> Self {
        self.map_plan(|p| p.slice(low, high))
    }

    #[must_use]
    pub fn distinct(self) -> Self {
        self.map_plan(QueryPlan::distinct)
    }

    #[must_use]
    pub fn values(self, columns: Vec<Column>) -> Self {
        self.map_plan(|p| p.values(columns))
    }

    #[must_use]
    pub fn none(self) -> Self {
        self.map_plan(QueryPlan::none)
    }

    fn map_plan(mut self, f: impl FnOnce(QueryPlan) -> QueryPlan) -> Self {
        self.plan = f(std::mem::take(&mut self.plan));
        self
    }

    /// Compile the plan's predicate without running it.
    pub fn compile(&self) -> DirectoryResult<CompiledQuery> {
        PredicateCompiler::new(self.meta).compile(&self.plan.predicate)
    }

    /// Run the plan as-is.
    pub async fn execute(&self) -> DirectoryResult<QueryOutput> {
        if self.plan.aggregate == Some(Aggregate::Count) {
            return self.count().await.map(QueryOutput::Count);
        }
        match &self.plan.columns {
            Some(_) => self.rows().await.map(QueryOutput::Rows),
            None => self.all().await.map(QueryOutput::Records),
        }
    }

    /// Fetch whole records: sort, distinct, then window.
    pub async fn all(&self) -> DirectoryResult<Vec<Record>> {
        if self.plan.empty {
            return Ok(Vec::new());
        }

        let compiled = self.compile()?;
        let mut entries = SearchExecutor::new(self.directory)
            .search_all(compiled.to_request(self.meta.attributes()))
            .await?;

        Materializer::new(self.meta).sort(&mut entries, &self.plan.effective_ordering(self.meta))?;

        let mut records: Vec<Record> = entries
            .iter()
            .map(|entry| Record::from_entry(self.meta, entry))
            .collect();
        if self.plan.distinct {
            records = distinct_by(records, Record::values);
        }

        Ok(self.plan.window.apply(records))
    }

    /// Fetch projected rows. Without explicit columns every field is projected.
    pub async fn rows(&self) -> DirectoryResult<Vec<Row>> {
        if self.plan.empty {
            return Ok(Vec::new());
        }

        let columns = match &self.plan.columns {
            Some(columns) => columns.clone(),
            None => self
                .meta
                .fields
                .iter()
                .map(|f| Column::Field(f.name.clone()))
                .collect(),
        };

        let compiled = self.compile()?;
        let entries = SearchExecutor::new(self.directory)
            .search_all(compiled.to_request(self.meta.attributes()))
            .await?;

        Materializer::new(self.meta).rows(
            entries,
            &self.plan.effective_ordering(self.meta),
            &columns,
            self.plan.distinct,
            self.plan.window,
        )
    }

    /// Number of results the plan yields.
    ///
    /// Without distinct only identities are fetched.
    pub async fn count(&self) -> DirectoryResult<usize> {
        if self.plan.empty {
            return Ok(0);
        }
        if self.plan.distinct {
            return Ok(self.rows().await?.len());
        }

        let compiled = self.compile()?;
        let entries = SearchExecutor::new(self.directory)
            .search_all(compiled.to_request(Vec::new()))
            .await?;

        let count = self.plan.window.count(entries.len());
        debug!(model = %self.meta.name, matched = entries.len(), count, "Counted entries");
        Ok(count)
    }

    pub async fn exists(&self) -> DirectoryResult<bool> {
        Ok(self.count().await? > 0)
    }

    /// Exactly one record matching `predicate`.
    pub async fn get(&self, predicate: Predicate) -> DirectoryResult<Record> {
        let query = self.clone().filter(predicate);
        let mut records = query.all().await?;

        match records.len() {
            0 => Err(DirectoryError::NotFound {
                dn: query.describe(),
            }),
            1 => Ok(records.remove(0)),
            count => Err(DirectoryError::MultipleObjectsReturned { count }),
        }
    }

    /// First record in order, or `None`. Unordered plans order by key.
    pub async fn first(&self) -> DirectoryResult<Option<Record>> {
        let mut query = self.clone();
        if query.plan.effective_ordering(self.meta).is_empty() {
            query = query.order_by([PK_ALIAS]);
        }
        let records = query.slice(0, Some(1)).all().await?;
        Ok(records.into_iter().next())
    }

    /// Delete every matching entry. Returns the number deleted.
    pub async fn delete(&self) -> DirectoryResult<usize> {
        if !self.plan.window.is_unbounded() {
            return Err(DirectoryError::invalid_query(
                "cannot delete a sliced query",
            ));
        }
        if self.plan.empty {
            return Ok(0);
        }

        let compiled = self.compile()?;
        EntryManager::new(self.directory, self.meta)
            .delete_matching(compiled.to_request(Vec::new()))
            .await
    }

    /// Search description used in not-found errors.
    fn describe(&self) -> String {
        match self.compile() {
            Ok(compiled) => format!("{} {}", compiled.base, compiled.filter.render()),
            Err(_) => self.meta.base_dn.clone(),
        }
    }
}
