use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::mem;
use std::ops::Range;

use bytes::Bytes;
use pr_columnar::DataSlice;
use pr_expr::ExpressionDescriptor;
use pr_io::{ArrowStream, MaterializeOptions, materialize};
use pr_types::{Scalar, cast_scalar_owned};
use serde::{Deserialize, Serialize};

use crate::compile::{CompiledExpression, compile_expression};
use crate::pivot::{self, Snapshot, StoredRow};
use crate::{
    CompileReport, Engine, EngineError, Mutation, PortId, RecomputeHandle, Schema, TableId,
    TableOptions, ViewConfig, ViewId, ViewInfo,
};

/// Counters for work the engine has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub recompute_calls: u64,
    pub row_delta_calls: u64,
    pub mutations_applied: u64,
    pub mutations_rejected: u64,
}

/// A validated mutation waiting for the next recompute. Insert rows hold
/// one slot per schema column; `None` marks a column the row left out.
#[derive(Debug, Clone, PartialEq)]
enum Staged {
    Insert(Vec<Vec<Option<Scalar>>>),
    Remove(Vec<Scalar>),
}

#[derive(Debug)]
struct TableState {
    schema: Schema,
    index: Option<usize>,
    limit: Option<u32>,
    /// Committed rows ordered by primary key.
    rows: Vec<StoredRow>,
    inserted: u64,
    staged: BTreeMap<PortId, Vec<Staged>>,
    next_port: u32,
    /// Primary keys each port wrote or removed in the last recompute.
    touched: BTreeMap<PortId, Vec<Scalar>>,
    views: BTreeSet<ViewId>,
}

impl TableState {
    fn column_position(&self, name: &str) -> Result<usize, EngineError> {
        self.schema
            .iter()
            .position(|(column, _)| column == name)
            .ok_or_else(|| EngineError::UnknownColumn(name.to_owned()))
    }

    fn row_position(&self, pkey: &Scalar) -> Result<usize, usize> {
        self.rows.binary_search_by(|row| row.pkey.total_cmp(pkey))
    }

    fn validate(&self, mutation: Mutation) -> Result<Staged, EngineError> {
        match mutation {
            Mutation::Insert(rows) => {
                let rows = rows
                    .into_iter()
                    .map(|row| {
                        let mut values = vec![None; self.schema.len()];
                        for (name, value) in row {
                            let position = self.column_position(&name)?;
                            let value = cast_scalar_owned(value, self.schema[position].1)
                                .map_err(|source| EngineError::Cast { column: name, source })?;
                            values[position] = Some(value);
                        }
                        if let Some(index) = self.index
                            && values[index].as_ref().is_none_or(Scalar::is_missing)
                        {
                            return Err(EngineError::MissingIndex(self.schema[index].0.clone()));
                        }
                        Ok(values)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Staged::Insert(rows))
            }
            Mutation::Remove(keys) => {
                let Some(index) = self.index else {
                    return Err(EngineError::RemoveWithoutIndex);
                };
                let (name, dtype) = &self.schema[index];
                let keys = keys
                    .into_iter()
                    .map(|key| {
                        cast_scalar_owned(key, *dtype).map_err(|source| EngineError::Cast {
                            column: name.clone(),
                            source,
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Staged::Remove(keys))
            }
        }
    }

    fn commit(&mut self, staged: Staged, touched: &mut Vec<Scalar>) {
        match staged {
            Staged::Insert(rows) => {
                for values in rows {
                    let pkey = self.next_pkey(&values);
                    self.upsert(pkey.clone(), values);
                    touched.push(pkey);
                }
            }
            Staged::Remove(keys) => {
                for key in keys {
                    if let Ok(position) = self.row_position(&key) {
                        self.rows.remove(position);
                    }
                    touched.push(key);
                }
            }
        }
    }

    /// The index value for indexed tables; otherwise the insertion counter,
    /// wrapped by the limit so old rows are overwritten in place.
    fn next_pkey(&mut self, values: &[Option<Scalar>]) -> Scalar {
        if let Some(pkey) = self.index.and_then(|index| values[index].clone()) {
            return pkey;
        }
        let slot = match self.limit {
            Some(limit) => self.inserted % u64::from(limit),
            None => self.inserted,
        };
        self.inserted += 1;
        Scalar::Int64(i64::try_from(slot).unwrap_or(i64::MAX))
    }

    fn upsert(&mut self, pkey: Scalar, values: Vec<Option<Scalar>>) {
        match self.row_position(&pkey) {
            Ok(position) if self.index.is_some() => {
                let row = &mut self.rows[position];
                for (slot, value) in row.values.iter_mut().zip(values) {
                    if let Some(value) = value {
                        *slot = value;
                    }
                }
            }
            found => {
                let row = StoredRow {
                    pkey,
                    values: values
                        .into_iter()
                        .zip(&self.schema)
                        .map(|(value, (_, dtype))| {
                            value.unwrap_or_else(|| Scalar::missing_for_dtype(*dtype))
                        })
                        .collect(),
                };
                match found {
                    Ok(position) => self.rows[position] = row,
                    Err(position) => self.rows.insert(position, row),
                }
            }
        }
    }

    fn has_port(&self, port: PortId) -> bool {
        port.0 <= self.next_port
    }
}

#[derive(Debug)]
struct ViewState {
    table: TableId,
    config: ViewConfig,
    expressions: Vec<CompiledExpression>,
    snapshot: Snapshot,
    deltas: bool,
}

impl ViewState {
    fn refresh(&mut self, table: &TableState, separator: &str) -> Result<(), EngineError> {
        self.snapshot = pivot::build(
            &table.schema,
            &table.rows,
            &self.config,
            &self.expressions,
            separator,
        )?;
        Ok(())
    }
}

/// An in-process engine holding every table in memory.
///
/// Mutations are validated when applied and staged per port; nothing
/// reaches views until the table is recomputed, at which point every view
/// on it is rebuilt.
#[derive(Debug)]
pub struct MemoryEngine {
    tables: HashMap<TableId, TableState>,
    views: HashMap<ViewId, ViewState>,
    next_table: u32,
    next_view: u32,
    column_separator: String,
    stats: EngineStats,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::with_column_separator("|")
    }
}

impl MemoryEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `separator` joins split-by values and the column name in pivoted
    /// column paths.
    #[must_use]
    pub fn with_column_separator(separator: impl Into<String>) -> Self {
        Self {
            tables: HashMap::new(),
            views: HashMap::new(),
            next_table: 0,
            next_view: 0,
            column_separator: separator.into(),
            stats: EngineStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    #[must_use]
    pub fn column_separator(&self) -> &str {
        &self.column_separator
    }

    fn table(&self, table: TableId) -> Result<&TableState, EngineError> {
        self.tables.get(&table).ok_or(EngineError::UnknownTable(table))
    }

    fn table_mut(&mut self, table: TableId) -> Result<&mut TableState, EngineError> {
        self.tables.get_mut(&table).ok_or(EngineError::UnknownTable(table))
    }

    fn view(&self, view: ViewId) -> Result<&ViewState, EngineError> {
        self.views.get(&view).ok_or(EngineError::UnknownView(view))
    }

    fn refresh_views(&mut self, table: TableId) -> Result<(), EngineError> {
        let state = self.tables.get(&table).ok_or(EngineError::UnknownTable(table))?;
        for view in self.views.values_mut().filter(|view| view.table == table) {
            view.refresh(state, &self.column_separator)?;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(%table, views = state.views.len(), "views rebuilt");
        Ok(())
    }
}

impl Engine for MemoryEngine {
    fn create_table(&mut self, schema: Schema, options: TableOptions) -> Result<TableId, EngineError> {
        if options.index.is_some() && options.limit.is_some() {
            return Err(EngineError::IndexWithLimit);
        }
        if options.limit == Some(0) {
            return Err(EngineError::ZeroLimit);
        }
        for (position, (name, _)) in schema.iter().enumerate() {
            if schema[..position].iter().any(|(earlier, _)| earlier == name) {
                return Err(EngineError::DuplicateColumn(name.clone()));
            }
        }

        let mut state = TableState {
            schema,
            index: None,
            limit: options.limit,
            rows: Vec::new(),
            inserted: 0,
            staged: BTreeMap::new(),
            next_port: 0,
            touched: BTreeMap::new(),
            views: BTreeSet::new(),
        };
        if let Some(index) = &options.index {
            state.index = Some(state.column_position(index)?);
        }

        let id = TableId(self.next_table);
        self.next_table += 1;
        self.tables.insert(id, state);
        Ok(id)
    }

    fn drop_table(&mut self, table: TableId) -> Result<(), EngineError> {
        let views = self.table(table)?.views.len();
        if views > 0 {
            return Err(EngineError::TableHasViews { table, views });
        }
        self.tables.remove(&table);
        Ok(())
    }

    fn reset_table(&mut self, table: TableId) -> Result<(), EngineError> {
        let state = self.table_mut(table)?;
        state.rows.clear();
        state.staged.clear();
        state.touched.clear();
        state.inserted = 0;
        self.refresh_views(table)
    }

    fn make_port(&mut self, table: TableId) -> Result<PortId, EngineError> {
        let state = self.table_mut(table)?;
        state.next_port += 1;
        Ok(PortId(state.next_port))
    }

    fn apply_mutation(
        &mut self,
        table: TableId,
        mutation: Mutation,
        port: PortId,
    ) -> Result<RecomputeHandle, EngineError> {
        let state = self.tables.get_mut(&table).ok_or(EngineError::UnknownTable(table))?;
        if !state.has_port(port) {
            return Err(EngineError::UnknownPort { table, port });
        }
        match state.validate(mutation) {
            Ok(staged) => {
                state.staged.entry(port).or_default().push(staged);
                Ok(RecomputeHandle::new(table))
            }
            Err(err) => {
                self.stats.mutations_rejected += 1;
                Err(err)
            }
        }
    }

    fn recompute(&mut self, handle: RecomputeHandle) -> Result<Vec<PortId>, EngineError> {
        let table = handle.table();
        let state = self.table_mut(table)?;

        let staged = mem::take(&mut state.staged);
        let mut touched = BTreeMap::new();
        let mut applied = 0;
        for (port, batch) in staged {
            let keys = touched.entry(port).or_insert_with(Vec::new);
            for mutation in batch {
                state.commit(mutation, keys);
                applied += 1;
            }
        }
        let ports = touched.keys().copied().collect::<Vec<_>>();
        state.touched = touched;

        self.stats.recompute_calls += 1;
        self.stats.mutations_applied += applied;
        #[cfg(feature = "tracing")]
        tracing::debug!(%table, ports = ports.len(), applied, "table recomputed");

        self.refresh_views(table)?;
        Ok(ports)
    }

    fn get_schema(&self, table: TableId) -> Result<Schema, EngineError> {
        Ok(self.table(table)?.schema.clone())
    }

    fn table_size(&self, table: TableId) -> Result<usize, EngineError> {
        Ok(self.table(table)?.rows.len())
    }

    fn compile_expressions(
        &self,
        table: TableId,
        descriptors: &[ExpressionDescriptor],
    ) -> Result<CompileReport, EngineError> {
        let schema = &self.table(table)?.schema;
        let mut report = CompileReport::default();
        for descriptor in descriptors {
            match compile_expression(descriptor, schema) {
                Ok(compiled) => {
                    report.schema.insert(compiled.alias, compiled.dtype);
                }
                Err(error) => {
                    report.errors.insert(descriptor.alias.clone(), error);
                }
            }
        }
        Ok(report)
    }

    fn create_view(
        &mut self,
        table: TableId,
        config: &ViewConfig,
        descriptors: &[ExpressionDescriptor],
    ) -> Result<ViewId, EngineError> {
        let state = self.table(table)?;
        let expressions = descriptors
            .iter()
            .map(|descriptor| {
                compile_expression(descriptor, &state.schema).map_err(|error| {
                    EngineError::InvalidExpression {
                        alias: descriptor.alias.clone(),
                        error,
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut config = config.clone();
        config.resolve_columns(&state.schema, descriptors.iter().map(|descriptor| descriptor.alias.as_str()));
        let snapshot = pivot::build(
            &state.schema,
            &state.rows,
            &config,
            &expressions,
            &self.column_separator,
        )?;

        let id = ViewId(self.next_view);
        self.next_view += 1;
        self.views.insert(
            id,
            ViewState {
                table,
                config,
                expressions,
                snapshot,
                deltas: false,
            },
        );
        self.table_mut(table)?.views.insert(id);
        Ok(id)
    }

    fn drop_view(&mut self, view: ViewId) -> Result<(), EngineError> {
        let state = self.views.remove(&view).ok_or(EngineError::UnknownView(view))?;
        if let Some(table) = self.tables.get_mut(&state.table) {
            table.views.remove(&view);
        }
        Ok(())
    }

    fn view_info(&self, view: ViewId) -> Result<ViewInfo, EngineError> {
        let state = self.view(view)?;
        let snapshot = &state.snapshot;
        Ok(ViewInfo {
            num_rows: snapshot.num_rows(),
            num_columns: snapshot.columns.len(),
            column_names: snapshot.column_names.clone(),
            column_paths: snapshot.column_paths.clone(),
            schema: snapshot.schema.clone(),
            expression_schema: state
                .expressions
                .iter()
                .map(|expression| (expression.alias.clone(), expression.dtype))
                .collect(),
        })
    }

    fn get_view_slice(
        &self,
        view: ViewId,
        rows: Range<usize>,
        columns: Range<usize>,
    ) -> Result<DataSlice, EngineError> {
        Ok(self.view(view)?.snapshot.slice(rows, columns)?)
    }

    fn get_row_delta(&mut self, view: ViewId, port: PortId) -> Result<Bytes, EngineError> {
        self.stats.row_delta_calls += 1;
        let state = self.view(view)?;
        if !state.deltas {
            return Err(EngineError::DeltasDisabled(view));
        }
        let table = self.table(state.table)?;
        if !table.has_port(port) {
            return Err(EngineError::UnknownPort {
                table: state.table,
                port,
            });
        }

        let snapshot = &state.snapshot;
        let touched = table.touched.get(&port).map_or(&[][..], Vec::as_slice);
        let positions = snapshot.touched_rows(touched);
        let total_columns = snapshot.columns.len() + usize::from(snapshot.sides.is_pivoted());
        let slice = snapshot.select(&positions, 0, 0..total_columns)?;

        let mut layout = snapshot.layout();
        layout.num_rows = positions.len();
        let options = MaterializeOptions::default();
        let window = layout.resolve_window(&options, None);
        Ok(materialize(
            &slice,
            &layout,
            window,
            &options,
            chrono_tz::UTC,
            ArrowStream::default(),
        )?)
    }

    fn set_delta_tracking(&mut self, view: ViewId, enabled: bool) -> Result<(), EngineError> {
        let state = self.views.get_mut(&view).ok_or(EngineError::UnknownView(view))?;
        state.deltas = enabled;
        Ok(())
    }

    fn delta_tracking(&self, view: ViewId) -> Result<bool, EngineError> {
        Ok(self.view(view)?.deltas)
    }

    fn get_min_max(&self, view: ViewId, column: &str) -> Result<Option<(Scalar, Scalar)>, EngineError> {
        let state = self.view(view)?;
        let known = state.snapshot.column_names.iter().any(|name| {
            name.rsplit(self.column_separator.as_str()).next() == Some(column)
        });
        if !known {
            return Err(EngineError::UnknownColumn(column.to_owned()));
        }
        Ok(state.snapshot.min_max(column, &self.column_separator))
    }
}
