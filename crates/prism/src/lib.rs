#![forbid(unsafe_code)]

//! Coordination between mutable tables, their live views and update
//! subscribers.
//!
//! A [`Session`] owns an [`Engine`], one [`MutationScheduler`] and the
//! registrations of every table and view. Updates and removes are staged in
//! the engine and their recompute is deferred to the next [`Session::tick`];
//! any read that needs current state flushes the table first.

use std::collections::BTreeMap;

use pr_io::IoError;
use pr_runtime::{MutationScheduler, RuntimeError, Scheduled, SchedulerStats};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod config;
mod dispatch;
mod view;

pub use config::{VIEW_CONFIG_KEYS, parse_view_config};
pub use dispatch::{CallbackId, DeltaCache, UpdateEvent, UpdateFn, UpdateMode};
pub use pr_columnar::DataSlice;
pub use pr_engine::{
    Aggregate, CompileReport, Engine, EngineError, EngineStats, ExpressionError, Filter,
    FilterCombinator, FilterOp, FilterValue, MemoryEngine, Mutation, PortId, RecomputeHandle, Row,
    Schema, Sort, SortDir, TableId, TableOptions, ViewConfig, ViewId, ViewInfo,
};
pub use pr_expr::{Canonicalized, ExpressionDescriptor, canonicalize};
pub use pr_io::{MaterializeOptions, Sides, TypedArray, TypedValues, Viewport};
pub use pr_runtime::SessionConfig;
pub use pr_types::{DType, NullKind, Scalar};
pub use view::ExpressionValidation;

use dispatch::Dispatcher;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unrecognized config parameter: {0}")]
    UnrecognizedKey(String),
    #[error("duplicate config parameter {key:?}: also given as {alias:?}")]
    DuplicateKey { key: String, alias: String },
    #[error("invalid value for {key:?}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("cannot specify both index and limit")]
    IndexWithLimit,
    #[error("invalid update mode {0:?}; expected \"none\" or \"row\"")]
    InvalidUpdateMode(String),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UsageError {
    #[error("unknown {0}")]
    UnknownTable(TableId),
    #[error("unknown {0}")]
    UnknownView(ViewId),
    #[error("{callback} is not registered on {view}")]
    UnregisteredCallback { view: ViewId, callback: CallbackId },
    #[error("{0} is not a registered delete callback")]
    UnregisteredDeleteCallback(CallbackId),
    #[error("cannot delete {table}: {views} view(s) still depend on it")]
    TableHasViews { table: TableId, views: usize },
    #[error("{0} has no index; remove needs one")]
    RemoveWithoutIndex(TableId),
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Io(#[from] IoError),
    /// Some tables of one tick failed to recompute. Every other ready table
    /// was still recomputed and dispatched.
    #[error("{} table(s) failed to recompute; {recomputed} succeeded", .failures.len())]
    Recompute {
        recomputed: usize,
        failures: Vec<(TableId, EngineError)>,
    },
}

/// What happened to one update or remove call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOutcome {
    /// Staged; the table's recompute was queued for the next tick.
    Scheduled,
    /// Staged; a recompute was already pending and will pick it up.
    Coalesced,
    /// Rejected by the engine and discarded. The table is unchanged.
    Dropped,
}

impl From<Scheduled> for MutationOutcome {
    fn from(scheduled: Scheduled) -> Self {
        match scheduled {
            Scheduled::Deferred => Self::Scheduled,
            Scheduled::Coalesced => Self::Coalesced,
        }
    }
}

pub type DeleteFn = Box<dyn FnMut()>;

struct DeleteCallbacks(Vec<(CallbackId, DeleteFn)>);

impl DeleteCallbacks {
    fn remove(&mut self, id: CallbackId) -> bool {
        let before = self.0.len();
        self.0.retain(|(registered, _)| *registered != id);
        self.0.len() != before
    }

    fn fire(mut self) {
        for (_, callback) in &mut self.0 {
            callback();
        }
    }
}

struct TableEntry {
    index: Option<String>,
    limit: Option<u32>,
    views: Vec<ViewId>,
    on_delete: DeleteCallbacks,
}

/// Attributes derived once when the view is created.
struct ViewEntry {
    table: TableId,
    config: ViewConfig,
    sides: Sides,
    column_only: bool,
    group_by_depth: usize,
    hidden_columns: usize,
    on_delete: DeleteCallbacks,
}

/// One coordination context: an engine, its tables and views, and the
/// scheduler that batches their recomputes.
pub struct Session<E = MemoryEngine> {
    config: SessionConfig,
    engine: E,
    scheduler: MutationScheduler<TableId, RecomputeHandle>,
    tables: BTreeMap<TableId, TableEntry>,
    views: BTreeMap<ViewId, ViewEntry>,
    dispatcher: Dispatcher,
    next_callback: u64,
}

impl Session<MemoryEngine> {
    /// A session over a fresh [`MemoryEngine`] using the configured column
    /// separator.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let engine = MemoryEngine::with_column_separator(config.column_separator());
        Self::with_engine(config, engine)
    }
}

impl Default for Session<MemoryEngine> {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl<E: Engine> Session<E> {
    pub fn with_engine(config: SessionConfig, engine: E) -> Self {
        Self {
            config,
            engine,
            scheduler: MutationScheduler::new(),
            tables: BTreeMap::new(),
            views: BTreeMap::new(),
            dispatcher: Dispatcher::default(),
            next_callback: 0,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn engine(&self) -> &E {
        &self.engine
    }

    #[must_use]
    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    #[must_use]
    pub fn is_pending(&self, table: TableId) -> bool {
        self.scheduler.is_pending(table)
    }

    /// Runs every deferred recompute that has come due and dispatches its
    /// updates. Returns the number of tables recomputed.
    ///
    /// A table whose recompute fails does not stop the others; the failures
    /// are returned together once every ready table has run.
    pub fn tick(&mut self) -> Result<usize, CoreError> {
        let mut recomputed = 0;
        let mut failures = Vec::new();
        for (table, handle) in self.scheduler.drain_ready() {
            match self.recompute(table, handle) {
                Ok(()) => recomputed += 1,
                Err(err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%table, error = %err, "recompute failed");
                    failures.push((table, err));
                }
            }
        }
        if failures.is_empty() {
            Ok(recomputed)
        } else {
            Err(CoreError::Recompute { recomputed, failures })
        }
    }

    /// Recomputes `table` now if a recompute is pending.
    pub fn flush(&mut self, table: TableId) -> Result<(), CoreError> {
        match self.scheduler.take(table) {
            Some(handle) => Ok(self.recompute(table, handle)?),
            None => Ok(()),
        }
    }

    fn recompute(&mut self, table: TableId, handle: RecomputeHandle) -> Result<(), EngineError> {
        let ports = self.engine.recompute(handle)?;
        let views = self
            .tables
            .get(&table)
            .map(|entry| entry.views.clone())
            .unwrap_or_default();
        for port in ports {
            let mut cache = DeltaCache::default();
            self.dispatcher.dispatch(&mut self.engine, &views, port, &mut cache);
        }
        Ok(())
    }

    fn next_callback_id(&mut self) -> CallbackId {
        let id = CallbackId(self.next_callback);
        self.next_callback += 1;
        id
    }

    fn table_entry(&self, table: TableId) -> Result<&TableEntry, UsageError> {
        self.tables.get(&table).ok_or(UsageError::UnknownTable(table))
    }

    fn table_entry_mut(&mut self, table: TableId) -> Result<&mut TableEntry, UsageError> {
        self.tables.get_mut(&table).ok_or(UsageError::UnknownTable(table))
    }

    /// Creates a table and applies `data` immediately, without deferral.
    ///
    /// A table with neither index nor limit gets the session's default
    /// limit.
    pub fn table(&mut self, schema: Schema, options: TableOptions, data: Vec<Row>) -> Result<TableId, CoreError> {
        if options.index.is_some() && options.limit.is_some() {
            return Err(ConfigError::IndexWithLimit.into());
        }
        let limit = match (&options.index, options.limit) {
            (None, None) => Some(self.config.default_limit()),
            (_, limit) => limit,
        };
        let options = TableOptions {
            index: options.index,
            limit,
        };

        let table = self.engine.create_table(schema, options.clone())?;
        self.tables.insert(
            table,
            TableEntry {
                index: options.index,
                limit: options.limit,
                views: Vec::new(),
                on_delete: DeleteCallbacks(Vec::new()),
            },
        );

        if !data.is_empty() {
            let handle = self.engine.apply_mutation(table, Mutation::Insert(data), PortId(0))?;
            self.engine.recompute(handle)?;
        }
        Ok(table)
    }

    /// Stages `rows` on `port` and defers the recompute.
    pub fn update(&mut self, table: TableId, rows: Vec<Row>, port: PortId) -> Result<MutationOutcome, CoreError> {
        self.table_entry(table)?;
        Ok(self.stage(table, Mutation::Insert(rows), port))
    }

    /// Stages removal of the rows keyed by `keys`. Indexed tables only.
    pub fn remove(&mut self, table: TableId, keys: Vec<Scalar>, port: PortId) -> Result<MutationOutcome, CoreError> {
        if self.table_entry(table)?.index.is_none() {
            return Err(UsageError::RemoveWithoutIndex(table).into());
        }
        Ok(self.stage(table, Mutation::Remove(keys), port))
    }

    fn stage(&mut self, table: TableId, mutation: Mutation, port: PortId) -> MutationOutcome {
        match self.engine.apply_mutation(table, mutation, port) {
            Ok(handle) => self.scheduler.schedule(table, handle).into(),
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%table, %port, error = %_err, "mutation dropped");
                MutationOutcome::Dropped
            }
        }
    }

    /// Empties the table. A pending recompute is discarded, not run.
    pub fn clear(&mut self, table: TableId) -> Result<(), CoreError> {
        self.table_entry(table)?;
        self.scheduler.cancel(table);
        self.engine.reset_table(table)?;
        Ok(())
    }

    /// Replaces the table's rows with `rows` and recomputes immediately.
    pub fn replace(&mut self, table: TableId, rows: Vec<Row>) -> Result<MutationOutcome, CoreError> {
        self.clear(table)?;
        let outcome = self.stage(table, Mutation::Insert(rows), PortId(0));
        self.flush(table)?;
        Ok(outcome)
    }

    pub fn size(&mut self, table: TableId) -> Result<usize, CoreError> {
        self.table_entry(table)?;
        self.flush(table)?;
        Ok(self.engine.table_size(table)?)
    }

    pub fn schema(&mut self, table: TableId) -> Result<Schema, CoreError> {
        self.table_entry(table)?;
        self.flush(table)?;
        Ok(self.engine.get_schema(table)?)
    }

    pub fn columns(&mut self, table: TableId) -> Result<Vec<String>, CoreError> {
        Ok(self.schema(table)?.into_iter().map(|(name, _)| name).collect())
    }

    pub fn index(&self, table: TableId) -> Result<Option<&str>, CoreError> {
        Ok(self.table_entry(table)?.index.as_deref())
    }

    pub fn limit(&self, table: TableId) -> Result<Option<u32>, CoreError> {
        Ok(self.table_entry(table)?.limit)
    }

    pub fn make_port(&mut self, table: TableId) -> Result<PortId, CoreError> {
        self.table_entry(table)?;
        Ok(self.engine.make_port(table)?)
    }

    pub fn table_views(&self, table: TableId) -> Result<&[ViewId], CoreError> {
        Ok(&self.table_entry(table)?.views)
    }

    pub fn on_table_delete(&mut self, table: TableId, callback: impl FnMut() + 'static) -> Result<CallbackId, CoreError> {
        let id = self.next_callback_id();
        self.table_entry_mut(table)?.on_delete.0.push((id, Box::new(callback)));
        Ok(id)
    }

    pub fn remove_table_delete(&mut self, table: TableId, callback: CallbackId) -> Result<(), CoreError> {
        if self.table_entry_mut(table)?.on_delete.remove(callback) {
            Ok(())
        } else {
            Err(UsageError::UnregisteredDeleteCallback(callback).into())
        }
    }

    /// Destroys the table. Fails, leaving the table usable, while views
    /// still depend on it.
    pub fn delete_table(&mut self, table: TableId) -> Result<(), CoreError> {
        let views = self.table_entry(table)?.views.len();
        if views > 0 {
            return Err(UsageError::TableHasViews { table, views }.into());
        }
        self.scheduler.cancel(table);
        self.engine.drop_table(table)?;
        if let Some(entry) = self.tables.remove(&table) {
            entry.on_delete.fire();
        }
        Ok(())
    }
}
