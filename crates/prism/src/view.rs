//! Views: construction, inspection, update subscriptions and every
//! materialization entry point.

use std::collections::BTreeMap;

use bytes::Bytes;
use pr_columnar::DataSlice;
use pr_engine::{Engine, ExpressionError, Schema, TableId, ViewConfig, ViewId, ViewInfo};
use pr_expr::{canonicalize, extract_alias};
use pr_io::{
    ArrowStream, ColumnExtractor, Csv, CsvColumnExtractor, Formatter, JsonColumns, JsonRecords,
    MaterializeOptions, Sides, SliceLayout, TypedArray, TypedArrayExtractor, Window,
    materialize, materialize_column,
};
use pr_types::{DType, Scalar};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    CallbackId, CoreError, DeleteCallbacks, Session, UpdateEvent, UpdateMode,
    UsageError, ViewEntry, parse_view_config,
};

/// Result of [`Session::validate_expressions`], keyed by alias.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionValidation {
    pub expression_schema: BTreeMap<String, DType>,
    /// Alias -> the expression as written.
    pub expression_alias: BTreeMap<String, String>,
    pub errors: BTreeMap<String, ExpressionError>,
}

impl ViewEntry {
    fn layout(&self, info: &ViewInfo) -> SliceLayout {
        SliceLayout {
            sides: self.sides,
            column_only: self.column_only,
            visible_columns: self.config.output_columns().len(),
            hidden_columns: self.hidden_columns,
            group_by_depth: self.group_by_depth,
            num_rows: info.num_rows,
            num_columns: info.num_columns,
        }
    }
}

impl<E: Engine> Session<E> {
    fn view_entry(&self, view: ViewId) -> Result<&ViewEntry, UsageError> {
        self.views.get(&view).ok_or(UsageError::UnknownView(view))
    }

    /// Flushes the view's table and returns the engine's current shape.
    fn current_info(&mut self, view: ViewId) -> Result<ViewInfo, CoreError> {
        let table = self.view_entry(view)?.table;
        self.flush(table)?;
        Ok(self.engine.view_info(view)?)
    }

    /// Creates a view over `table`. Pending mutations are flushed first so
    /// the view starts from current data.
    ///
    /// Expressions are canonicalized here; ones that cannot be are skipped
    /// with a warning. An absent `columns` list means every table column
    /// followed by every expression alias; an explicit empty list is kept.
    pub fn view(&mut self, table: TableId, mut config: ViewConfig) -> Result<ViewId, CoreError> {
        self.table_entry(table)?;
        self.flush(table)?;

        let canonical = canonicalize(&config.expressions);
        #[cfg(feature = "tracing")]
        for diagnostic in &canonical.diagnostics {
            tracing::warn!(%table, %diagnostic, "expression skipped");
        }

        if config.columns.is_none() {
            let schema = self.engine.get_schema(table)?;
            config.resolve_columns(&schema, canonical.descriptors.iter().map(|d| d.alias.as_str()));
        }

        let view = self.engine.create_view(table, &config, &canonical.descriptors)?;
        let group_by_depth = config
            .group_by_depth
            .map_or(config.group_by.len(), |depth| depth.min(config.group_by.len()));
        let entry = ViewEntry {
            table,
            sides: Sides::from_pivots(config.group_by.len(), config.split_by.len()),
            column_only: config.is_column_only(),
            group_by_depth,
            hidden_columns: config.hidden_sort_columns().len(),
            config,
            on_delete: DeleteCallbacks(Vec::new()),
        };
        #[cfg(feature = "tracing")]
        tracing::debug!(%table, %view, sides = ?entry.sides, "view created");

        self.views.insert(view, entry);
        self.table_entry_mut(table)?.views.push(view);
        Ok(view)
    }

    /// [`Session::view`] over a JSON configuration object.
    pub fn view_from_json(&mut self, table: TableId, raw: &Value) -> Result<ViewId, CoreError> {
        let config = parse_view_config(raw)?;
        self.view(table, config)
    }

    pub fn sides(&self, view: ViewId) -> Result<Sides, CoreError> {
        Ok(self.view_entry(view)?.sides)
    }

    pub fn get_config(&self, view: ViewId) -> Result<&ViewConfig, CoreError> {
        Ok(&self.view_entry(view)?.config)
    }

    pub fn num_rows(&mut self, view: ViewId) -> Result<usize, CoreError> {
        Ok(self.current_info(view)?.num_rows)
    }

    /// Output columns across every split-by group, hidden sort columns
    /// excluded.
    pub fn num_columns(&mut self, view: ViewId) -> Result<usize, CoreError> {
        let info = self.current_info(view)?;
        Ok(self.view_entry(view)?.layout(&info).num_visible_columns())
    }

    pub fn view_schema(&mut self, view: ViewId) -> Result<Schema, CoreError> {
        Ok(self.current_info(view)?.schema)
    }

    pub fn expression_schema(&mut self, view: ViewId) -> Result<Schema, CoreError> {
        Ok(self.current_info(view)?.expression_schema)
    }

    pub fn column_paths(&mut self, view: ViewId) -> Result<Vec<String>, CoreError> {
        Ok(self.current_info(view)?.column_paths)
    }

    pub fn get_min_max(&mut self, view: ViewId, column: &str) -> Result<Option<(Scalar, Scalar)>, CoreError> {
        let table = self.view_entry(view)?.table;
        self.flush(table)?;
        Ok(self.engine.get_min_max(view, column)?)
    }

    /// Registers `callback` to run after every recompute of the view's
    /// table. `mode` is `"none"` or `"row"`; row mode turns on delta
    /// tracking for the view before returning.
    ///
    /// Mutations already pending are flushed first, so the callback only
    /// hears about updates issued after it was registered.
    pub fn on_update(
        &mut self,
        view: ViewId,
        callback: impl FnMut(&UpdateEvent<'_>) + 'static,
        mode: &str,
    ) -> Result<CallbackId, CoreError> {
        let mode: UpdateMode = mode.parse()?;
        let table = self.view_entry(view)?.table;
        self.flush(table)?;
        if mode == UpdateMode::Row {
            self.engine.set_delta_tracking(view, true)?;
        }
        let id = self.next_callback_id();
        self.dispatcher.register(view, id, mode, Box::new(callback));
        Ok(id)
    }

    /// Unregisters `callback` after flushing pending mutations, which it
    /// still receives.
    pub fn remove_update(&mut self, view: ViewId, callback: CallbackId) -> Result<(), CoreError> {
        let table = self.view_entry(view)?.table;
        self.flush(table)?;
        if !self.dispatcher.unregister(view, callback) {
            #[cfg(feature = "tracing")]
            tracing::warn!(%view, %callback, "removing a callback that was never registered");
            return Err(UsageError::UnregisteredCallback { view, callback }.into());
        }
        if !self.dispatcher.wants_rows(view) && self.engine.delta_tracking(view)? {
            self.engine.set_delta_tracking(view, false)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn update_callbacks(&self, view: ViewId) -> usize {
        self.dispatcher.len(view)
    }

    pub fn on_view_delete(&mut self, view: ViewId, callback: impl FnMut() + 'static) -> Result<CallbackId, CoreError> {
        self.view_entry(view)?;
        let id = self.next_callback_id();
        if let Some(entry) = self.views.get_mut(&view) {
            entry.on_delete.0.push((id, Box::new(callback)));
        }
        Ok(id)
    }

    pub fn remove_view_delete(&mut self, view: ViewId, callback: CallbackId) -> Result<(), CoreError> {
        let entry = self.views.get_mut(&view).ok_or(UsageError::UnknownView(view))?;
        if entry.on_delete.remove(callback) {
            Ok(())
        } else {
            Err(UsageError::UnregisteredDeleteCallback(callback).into())
        }
    }

    /// Releases the view: the engine drops it, its update callbacks are
    /// discarded and its table forgets it.
    pub fn delete_view(&mut self, view: ViewId) -> Result<(), CoreError> {
        let table = self.view_entry(view)?.table;
        self.engine.drop_view(view)?;
        self.dispatcher.drop_view(view);
        if let Some(entry) = self.tables.get_mut(&table) {
            entry.views.retain(|registered| *registered != view);
        }
        if let Some(entry) = self.views.remove(&view) {
            entry.on_delete.fire();
        }
        Ok(())
    }

    fn resolve(&mut self, view: ViewId, options: &MaterializeOptions) -> Result<(SliceLayout, Window), CoreError> {
        let info = self.current_info(view)?;
        let entry = self.view_entry(view)?;
        let layout = entry.layout(&info);
        let window = layout.resolve_window(options, entry.config.viewport.as_ref());
        Ok((layout, window))
    }

    fn materialize_view<F: Formatter>(
        &mut self,
        view: ViewId,
        options: &MaterializeOptions,
        formatter: F,
    ) -> Result<F::Output, CoreError> {
        let (layout, window) = self.resolve(view, options)?;
        let slice = self.engine.get_view_slice(
            view,
            window.start_row..window.end_row,
            window.start_col..window.end_col,
        )?;
        Ok(materialize(
            &slice,
            &layout,
            window,
            options,
            self.config.display_timezone(),
            formatter,
        )?)
    }

    /// One JSON object per row.
    pub fn to_json(&mut self, view: ViewId, options: &MaterializeOptions) -> Result<Vec<Map<String, Value>>, CoreError> {
        self.materialize_view(view, options, JsonRecords::default())
    }

    /// One JSON array per output column.
    pub fn to_columns(&mut self, view: ViewId, options: &MaterializeOptions) -> Result<Map<String, Value>, CoreError> {
        self.materialize_view(view, options, JsonColumns::default())
    }

    pub fn to_csv(&mut self, view: ViewId, options: &MaterializeOptions) -> Result<String, CoreError> {
        self.materialize_view(view, options, Csv::default())
    }

    /// An Arrow IPC stream holding one record batch.
    pub fn to_arrow(&mut self, view: ViewId, options: &MaterializeOptions) -> Result<Bytes, CoreError> {
        self.materialize_view(view, options, ArrowStream::default())
    }

    /// The engine-native rectangle `options` resolve to, row-path slot
    /// included. Column extraction can read from it instead of asking the
    /// engine again.
    pub fn get_data_slice(&mut self, view: ViewId, options: &MaterializeOptions) -> Result<DataSlice, CoreError> {
        let (_, window) = self.resolve(view, options)?;
        Ok(self.engine.get_view_slice(
            view,
            window.start_row..window.end_row,
            window.start_col..window.end_col,
        )?)
    }

    fn extract_column<X: ColumnExtractor>(
        &mut self,
        view: ViewId,
        name: &str,
        options: &MaterializeOptions,
        held: Option<&DataSlice>,
        extractor: &X,
    ) -> Result<Option<X::Output>, CoreError> {
        let (layout, window) = self.resolve(view, options)?;
        let column_names = self.engine.view_info(view)?.column_names;
        let engine = &self.engine;
        materialize_column(
            &column_names,
            name,
            layout.sides,
            held,
            |cidx| {
                engine
                    .get_view_slice(view, window.start_row..window.end_row, cidx..cidx + 1)
                    .map_err(CoreError::from)
            },
            extractor,
        )
    }

    /// One column as a typed buffer. `None` when the view has no such
    /// column or the column has no typed representation.
    pub fn col_to_typed_array(
        &mut self,
        view: ViewId,
        name: &str,
        options: &MaterializeOptions,
    ) -> Result<Option<TypedArray>, CoreError> {
        self.extract_column(view, name, options, None, &TypedArrayExtractor)
    }

    pub fn col_to_csv(&mut self, view: ViewId, name: &str, options: &MaterializeOptions) -> Result<Option<String>, CoreError> {
        self.extract_column(view, name, options, None, &CsvColumnExtractor)
    }

    /// [`Session::col_to_typed_array`] over a slice from
    /// [`Session::get_data_slice`]. The engine is only read again when the
    /// slice does not cover the column; that read spans the slice's rows.
    pub fn col_to_typed_array_from_slice(
        &mut self,
        view: ViewId,
        name: &str,
        slice: &DataSlice,
    ) -> Result<Option<TypedArray>, CoreError> {
        let options = MaterializeOptions::rows(slice.start_row(), slice.end_row());
        self.extract_column(view, name, &options, Some(slice), &TypedArrayExtractor)
    }

    pub fn col_to_csv_from_slice(&mut self, view: ViewId, name: &str, slice: &DataSlice) -> Result<Option<String>, CoreError> {
        let options = MaterializeOptions::rows(slice.start_row(), slice.end_row());
        self.extract_column(view, name, &options, Some(slice), &CsvColumnExtractor)
    }

    /// Canonicalizes and type-checks `expressions` against `table` without
    /// creating a view. Failures are collected per alias; the call itself
    /// only fails for an unknown table or an engine fault.
    ///
    /// Each alias lands in exactly one of `expression_schema` and `errors`,
    /// decided by the last expression written with that alias.
    pub fn validate_expressions<S: AsRef<str>>(
        &mut self,
        table: TableId,
        expressions: &[S],
    ) -> Result<ExpressionValidation, CoreError> {
        self.table_entry(table)?;
        self.flush(table)?;

        let canonical = canonicalize(expressions);
        let report = self.engine.compile_expressions(table, &canonical.descriptors)?;

        let latest = expressions
            .iter()
            .map(|expression| (extract_alias(expression.as_ref()), expression.as_ref()))
            .collect::<BTreeMap<_, _>>();
        let is_latest = |alias: &str, text: &str| latest.get(alias).is_some_and(|last| *last == text);

        let mut validation = ExpressionValidation {
            expression_schema: report.schema,
            errors: report.errors,
            ..ExpressionValidation::default()
        };
        for descriptor in &canonical.descriptors {
            if is_latest(&descriptor.alias, &descriptor.expression) {
                validation
                    .expression_alias
                    .insert(descriptor.alias.clone(), descriptor.expression.clone());
            } else {
                validation.expression_schema.remove(&descriptor.alias);
                validation.errors.remove(&descriptor.alias);
            }
        }
        for diagnostic in canonical.diagnostics {
            let alias = extract_alias(diagnostic.expression());
            if !is_latest(&alias, diagnostic.expression()) {
                continue;
            }
            validation
                .expression_alias
                .insert(alias.clone(), diagnostic.expression().to_owned());
            validation.errors.insert(
                alias,
                ExpressionError {
                    error_message: diagnostic.to_string(),
                    line: 0,
                    column: 0,
                },
            );
        }
        Ok(validation)
    }
}
