//! View snapshots: filter, sort and pivot a table into engine columns.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::ops::Range;

use pr_columnar::{Column, ColumnError, ComparisonOp, DataSlice, ROW_PATH_COLUMN};
use pr_io::{Sides, SliceLayout};
use pr_types::{DType, NullKind, Scalar, cast_scalar};

use crate::compile::CompiledExpression;
use crate::{
    Aggregate, EngineError, Filter, FilterCombinator, FilterOp, FilterValue, Schema, SortDir,
    ViewConfig,
};

/// A committed table row: its primary key and one value per schema column.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StoredRow {
    pub(crate) pkey: Scalar,
    pub(crate) values: Vec<Scalar>,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub(crate) enum GroupKey<'a> {
    Bool(bool),
    Int64(i64),
    FloatBits(u64),
    Utf8(&'a str),
    Date(i32),
    Datetime(i64),
    Null,
}

impl<'a> GroupKey<'a> {
    pub(crate) fn from_scalar(key: &'a Scalar) -> Self {
        match key {
            Scalar::Bool(v) => Self::Bool(*v),
            Scalar::Int64(v) => Self::Int64(*v),
            Scalar::Float64(v) if v.is_nan() => Self::Null,
            Scalar::Float64(v) => Self::FloatBits(v.to_bits()),
            Scalar::Utf8(v) => Self::Utf8(v.as_str()),
            Scalar::Date(v) => Self::Date(*v),
            Scalar::Datetime(v) => Self::Datetime(*v),
            Scalar::Null(_) => Self::Null,
        }
    }
}

/// Table columns followed by expression columns, one frame row per table
/// row in primary-key order.
struct Frame<'a> {
    names: HashMap<&'a str, usize>,
    dtypes: Vec<DType>,
    rows: Vec<Vec<Scalar>>,
    pkeys: Vec<&'a Scalar>,
}

impl<'a> Frame<'a> {
    fn build(schema: &'a Schema, rows: &'a [StoredRow], expressions: &'a [CompiledExpression]) -> Self {
        let mut names = HashMap::new();
        let mut dtypes = Vec::with_capacity(schema.len() + expressions.len());
        for (position, (name, dtype)) in schema.iter().enumerate() {
            names.insert(name.as_str(), position);
            dtypes.push(*dtype);
        }
        let table_positions = names.clone();
        for (offset, expression) in expressions.iter().enumerate() {
            names.insert(expression.alias.as_str(), schema.len() + offset);
            dtypes.push(expression.dtype);
        }

        let frame_rows = rows
            .iter()
            .map(|row| {
                let lookup = |name: &str| {
                    table_positions
                        .get(name)
                        .and_then(|position| row.values.get(*position))
                        .cloned()
                        .unwrap_or(Scalar::Null(NullKind::Null))
                };
                let mut values = row.values.clone();
                values.extend(expressions.iter().map(|expression| expression.evaluate(&lookup)));
                values
            })
            .collect();

        Self {
            names,
            dtypes,
            rows: frame_rows,
            pkeys: rows.iter().map(|row| &row.pkey).collect(),
        }
    }

    fn position(&self, name: &str) -> Result<usize, EngineError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::UnknownColumn(name.to_owned()))
    }

    fn values<'r>(&'r self, rows: &'r [usize], column: usize) -> Vec<&'r Scalar> {
        rows.iter().map(|ridx| &self.rows[*ridx][column]).collect()
    }
}

/// The materialized state of one view after the latest recompute.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Snapshot {
    pub(crate) sides: Sides,
    pub(crate) column_only: bool,
    pub(crate) group_by_depth: usize,
    pub(crate) visible_columns: usize,
    pub(crate) hidden_columns: usize,
    pub(crate) column_names: Vec<String>,
    pub(crate) column_paths: Vec<String>,
    pub(crate) columns: Vec<Column>,
    pub(crate) row_paths: Vec<Vec<Scalar>>,
    pub(crate) pkeys: Vec<Vec<Scalar>>,
    pub(crate) schema: Schema,
}

impl Snapshot {
    pub(crate) fn num_rows(&self) -> usize {
        self.pkeys.len()
    }

    fn has_row_path(&self) -> bool {
        self.sides.is_pivoted() && !self.column_only
    }

    pub(crate) fn layout(&self) -> SliceLayout {
        SliceLayout {
            sides: self.sides,
            column_only: self.column_only,
            visible_columns: self.visible_columns,
            hidden_columns: self.hidden_columns,
            group_by_depth: self.group_by_depth,
            num_rows: self.num_rows(),
            num_columns: self.columns.len(),
        }
    }

    fn is_leaf(&self, ridx: usize) -> bool {
        !self.has_row_path() || self.row_paths[ridx].len() == self.group_by_depth
    }

    /// Engine-coordinate window; the row-path column is column 0 of pivoted
    /// views.
    pub(crate) fn slice(&self, rows: Range<usize>, columns: Range<usize>) -> Result<DataSlice, ColumnError> {
        let end_row = rows.end.min(self.num_rows());
        let start_row = rows.start.min(end_row);
        let total = self.columns.len() + usize::from(self.sides.is_pivoted());
        let end_col = columns.end.min(total);
        let start_col = columns.start.min(end_col);
        let selected = (start_row..end_row).collect::<Vec<_>>();
        self.select(&selected, start_row, start_col..end_col)
    }

    /// Rows at `positions`, renumbered from `start_row`.
    pub(crate) fn select(
        &self,
        positions: &[usize],
        start_row: usize,
        columns: Range<usize>,
    ) -> Result<DataSlice, ColumnError> {
        let offset = usize::from(self.sides.is_pivoted());
        let reindex = positions.iter().map(|ridx| Some(*ridx)).collect::<Vec<_>>();
        let mut names = Vec::with_capacity(columns.len());
        let mut out = Vec::with_capacity(columns.len());

        for cidx in columns.clone() {
            if offset == 1 && cidx == 0 {
                names.push(ROW_PATH_COLUMN.to_owned());
                out.push(Column::new(
                    DType::Null,
                    vec![Scalar::Null(NullKind::Null); positions.len()],
                )?);
                continue;
            }
            names.push(self.column_names[cidx - offset].clone());
            out.push(self.columns[cidx - offset].reindex_by_positions(&reindex)?);
        }

        let row_paths = if self.has_row_path() {
            positions.iter().map(|ridx| self.row_paths[*ridx].clone()).collect()
        } else {
            Vec::new()
        };
        let pkeys = positions.iter().map(|ridx| self.pkeys[*ridx].clone()).collect();

        DataSlice::new(start_row, columns.start, names, out, row_paths, pkeys)
    }

    /// Positions of rows whose primary key is in `touched`. Aggregated rows
    /// have no single key, so every row of a row-pivoted view qualifies.
    pub(crate) fn touched_rows(&self, touched: &[Scalar]) -> Vec<usize> {
        if self.has_row_path() {
            return (0..self.num_rows()).collect();
        }
        let keys = touched.iter().map(GroupKey::from_scalar).collect::<HashSet<_>>();
        (0..self.num_rows())
            .filter(|ridx| {
                self.pkeys[*ridx]
                    .first()
                    .is_some_and(|pkey| keys.contains(&GroupKey::from_scalar(pkey)))
            })
            .collect()
    }

    /// Min and max over leaf rows of every engine column whose last path
    /// segment is `column`.
    pub(crate) fn min_max(&self, column: &str, separator: &str) -> Option<(Scalar, Scalar)> {
        let mut bounds: Option<(&Scalar, &Scalar)> = None;
        for (name, values) in self.column_names.iter().zip(&self.columns) {
            if name.rsplit(separator).next() != Some(column) {
                continue;
            }
            for (ridx, value) in values.values().iter().enumerate() {
                if value.is_missing() || !self.is_leaf(ridx) {
                    continue;
                }
                bounds = Some(match bounds {
                    None => (value, value),
                    Some((lo, hi)) => (
                        if value.total_cmp(lo).is_lt() { value } else { lo },
                        if value.total_cmp(hi).is_gt() { value } else { hi },
                    ),
                });
            }
        }
        bounds.map(|(lo, hi)| (lo.clone(), hi.clone()))
    }
}

/// Builds the snapshot of `config` over `rows`.
pub(crate) fn build(
    schema: &Schema,
    rows: &[StoredRow],
    config: &ViewConfig,
    expressions: &[CompiledExpression],
    separator: &str,
) -> Result<Snapshot, EngineError> {
    let frame = Frame::build(schema, rows, expressions);

    let hidden = config.hidden_sort_columns();
    let output = config
        .output_columns()
        .iter()
        .map(String::as_str)
        .chain(hidden.iter().copied())
        .map(|name| frame.position(name).map(|position| (name, position)))
        .collect::<Result<Vec<_>, _>>()?;
    let group_cols = config
        .group_by
        .iter()
        .map(|name| frame.position(name))
        .collect::<Result<Vec<_>, _>>()?;
    let split_cols = config
        .split_by
        .iter()
        .map(|name| frame.position(name))
        .collect::<Result<Vec<_>, _>>()?;
    let filters = config
        .filter
        .iter()
        .map(|filter| {
            let position = frame.position(&filter.column)?;
            Ok((position, coerce_filter(filter, frame.dtypes[position])))
        })
        .collect::<Result<Vec<_>, EngineError>>()?;
    let sorts = config
        .sort
        .iter()
        .filter(|sort| sort.dir != SortDir::None)
        .map(|sort| {
            frame
                .position(&sort.column)
                .map(|position| (sort.column.as_str(), position, sort.dir))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut selected = (0..frame.rows.len())
        .filter(|ridx| {
            let mut results = filters
                .iter()
                .map(|(position, filter)| filter_matches(filter, &frame.rows[*ridx][*position]));
            filters.is_empty()
                || match config.filter_op {
                    FilterCombinator::And => results.all(|hit| hit),
                    FilterCombinator::Or => results.any(|hit| hit),
                }
        })
        .collect::<Vec<_>>();

    let sides = Sides::from_pivots(config.group_by.len(), config.split_by.len());
    let column_only = config.is_column_only();
    let group_by_depth = config
        .group_by_depth
        .map_or(config.group_by.len(), |depth| depth.min(config.group_by.len()));
    let split_depth = config
        .split_by_depth
        .map_or(split_cols.len(), |depth| depth.min(split_cols.len()));

    let aggregate_for = |name: &str, dtype: DType| {
        config
            .aggregates
            .get(name)
            .copied()
            .unwrap_or_else(|| Aggregate::default_for(dtype))
    };
    let visible = config.output_columns().len();

    let output_dtype = |name: &str, position: usize| {
        let source = frame.dtypes[position];
        if sides.is_pivoted() && !column_only {
            aggregate_for(name, source).output_dtype(source)
        } else {
            source
        }
    };
    let view_schema = output[..visible]
        .iter()
        .map(|(name, position)| ((*name).to_owned(), output_dtype(*name, *position)))
        .collect::<Schema>();

    // Column blocks: one per distinct split-by tuple, or a single unnamed one.
    let (block_keys, row_block) = column_blocks(&frame, &selected, &split_cols[..split_depth]);
    let mut column_names = Vec::new();
    let mut column_paths = Vec::new();
    for key in &block_keys {
        let prefix = key.iter().map(Scalar::to_string).collect::<Vec<_>>();
        for (slot, (name, _)) in output.iter().enumerate() {
            let mut parts = prefix.clone();
            parts.push((*name).to_owned());
            let full = parts.join(separator);
            if slot < visible {
                column_paths.push(full.clone());
            }
            column_names.push(full);
        }
    }

    let mut columns = Vec::with_capacity(column_names.len());
    let (row_paths, pkeys) = if !sides.is_pivoted() || column_only {
        let row_sorts = sorts
            .iter()
            .map(|(_, position, dir)| (*position, *dir))
            .collect::<Vec<_>>();
        sort_rows(&frame, &mut selected, &row_sorts);
        for block in 0..block_keys.len() {
            for (_, position) in &output {
                let values = selected
                    .iter()
                    .map(|ridx| {
                        if row_block.get(ridx).is_none_or(|owner| *owner == block) {
                            frame.rows[*ridx][*position].clone()
                        } else {
                            Scalar::missing_for_dtype(frame.dtypes[*position])
                        }
                    })
                    .collect();
                columns.push(Column::new(frame.dtypes[*position], values)?);
            }
        }
        let pkeys = selected
            .iter()
            .map(|ridx| vec![frame.pkeys[*ridx].clone()])
            .collect();
        (Vec::new(), pkeys)
    } else {
        let group_sorts = sorts
            .iter()
            .map(|(name, position, dir)| {
                (*position, *dir, aggregate_for(*name, frame.dtypes[*position]))
            })
            .collect::<Vec<_>>();

        let mut nodes = vec![(Vec::new(), selected.clone())];
        expand_groups(
            &frame,
            &mut nodes,
            &[],
            &selected,
            &group_cols[..group_by_depth],
            &group_sorts,
        );

        for block in 0..block_keys.len() {
            for (name, position) in &output {
                let source = frame.dtypes[*position];
                let aggregate = aggregate_for(*name, source);
                let out_dtype = aggregate.output_dtype(source);
                let values = nodes
                    .iter()
                    .map(|(_, members)| {
                        let members = members
                            .iter()
                            .copied()
                            .filter(|ridx| row_block.get(ridx).is_none_or(|owner| *owner == block))
                            .collect::<Vec<_>>();
                        if members.is_empty() && !row_block.is_empty() {
                            return Scalar::missing_for_dtype(out_dtype);
                        }
                        aggregate_values(aggregate, source, &frame.values(&members, *position))
                    })
                    .collect();
                columns.push(Column::new(out_dtype, values)?);
            }
        }

        let row_paths = nodes.iter().map(|(path, _)| path.clone()).collect::<Vec<_>>();
        (row_paths.clone(), row_paths)
    };

    Ok(Snapshot {
        sides,
        column_only,
        group_by_depth,
        visible_columns: visible,
        hidden_columns: hidden.len(),
        column_names,
        column_paths,
        columns,
        row_paths,
        pkeys,
        schema: view_schema,
    })
}

/// Distinct split-by tuples in ascending order, and the block each selected
/// row falls into. Without split-by columns there is one block and the map
/// is empty.
fn column_blocks(
    frame: &Frame<'_>,
    selected: &[usize],
    split_cols: &[usize],
) -> (Vec<Vec<Scalar>>, HashMap<usize, usize>) {
    if split_cols.is_empty() {
        return (vec![Vec::new()], HashMap::new());
    }

    let mut keys: Vec<Vec<Scalar>> = Vec::new();
    let mut seen: HashMap<Vec<GroupKey<'_>>, usize> = HashMap::new();
    let mut first_seen = HashMap::with_capacity(selected.len());
    for ridx in selected {
        let row = &frame.rows[*ridx];
        let id = split_cols
            .iter()
            .map(|position| GroupKey::from_scalar(&row[*position]))
            .collect::<Vec<_>>();
        let slot = *seen.entry(id).or_insert_with(|| {
            keys.push(split_cols.iter().map(|position| row[*position].clone()).collect());
            keys.len() - 1
        });
        first_seen.insert(*ridx, slot);
    }

    let mut order = (0..keys.len()).collect::<Vec<_>>();
    order.sort_by(|a, b| compare_tuples(&keys[*a], &keys[*b]));
    let mut rank = vec![0; keys.len()];
    for (block, slot) in order.iter().enumerate() {
        rank[*slot] = block;
    }

    let row_block = first_seen
        .into_iter()
        .map(|(ridx, slot)| (ridx, rank[slot]))
        .collect();
    let sorted = order.into_iter().map(|slot| keys[slot].clone()).collect();
    (sorted, row_block)
}

fn compare_tuples(left: &[Scalar], right: &[Scalar]) -> Ordering {
    left.iter()
        .zip(right)
        .map(|(l, r)| l.total_cmp(r))
        .find(|ordering| ordering.is_ne())
        .unwrap_or_else(|| left.len().cmp(&right.len()))
}

/// Appends every group below `path` depth-first: each group is followed by
/// its own children. Siblings are ordered by key, then by any sort columns
/// over their aggregated values.
fn expand_groups(
    frame: &Frame<'_>,
    nodes: &mut Vec<(Vec<Scalar>, Vec<usize>)>,
    path: &[Scalar],
    rows: &[usize],
    group_cols: &[usize],
    sorts: &[(usize, SortDir, Aggregate)],
) {
    let Some((&column, rest)) = group_cols.split_first() else {
        return;
    };

    let mut ordering = Vec::<GroupKey<'_>>::new();
    let mut slot = HashMap::<GroupKey<'_>, (Scalar, Vec<usize>)>::new();
    for ridx in rows {
        let key = &frame.rows[*ridx][column];
        let key_id = GroupKey::from_scalar(key);
        slot.entry(key_id)
            .or_insert_with(|| {
                ordering.push(key_id);
                (key.clone(), Vec::new())
            })
            .1
            .push(*ridx);
    }

    let mut children = ordering
        .iter()
        .filter_map(|key_id| slot.remove(key_id))
        .map(|(key, members)| {
            let sort_values = sorts
                .iter()
                .map(|(position, _, aggregate)| {
                    aggregate_values(*aggregate, frame.dtypes[*position], &frame.values(&members, *position))
                })
                .collect::<Vec<_>>();
            (key, members, sort_values)
        })
        .collect::<Vec<_>>();

    children.sort_by(|a, b| a.0.total_cmp(&b.0));
    children.sort_by(|a, b| {
        sorts
            .iter()
            .zip(a.2.iter().zip(&b.2))
            .map(|((_, dir, _), (l, r))| compare_sorted(l, r, *dir))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    });

    for (key, members, _) in children {
        let mut child = path.to_vec();
        child.push(key);
        nodes.push((child.clone(), members.clone()));
        expand_groups(frame, nodes, &child, &members, rest, sorts);
    }
}

fn sort_rows(frame: &Frame<'_>, rows: &mut [usize], sorts: &[(usize, SortDir)]) {
    if sorts.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        sorts
            .iter()
            .map(|(position, dir)| compare_sorted(&frame.rows[*a][*position], &frame.rows[*b][*position], *dir))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    });
}

fn compare_sorted(left: &Scalar, right: &Scalar, dir: SortDir) -> Ordering {
    let abs = |value: &Scalar| match value.to_f64() {
        Ok(v) if !value.is_missing() => Scalar::Float64(v.abs()),
        _ => value.clone(),
    };
    match dir {
        SortDir::None => Ordering::Equal,
        SortDir::Asc => left.total_cmp(right),
        SortDir::Desc => right.total_cmp(left),
        SortDir::AscAbs => abs(left).total_cmp(&abs(right)),
        SortDir::DescAbs => abs(right).total_cmp(&abs(left)),
    }
}

/// Reduces one group's values. Missing inputs are skipped except by
/// `first` and `last`, which report the boundary row as-is.
pub(crate) fn aggregate_values(aggregate: Aggregate, input: DType, values: &[&Scalar]) -> Scalar {
    let out = aggregate.output_dtype(input);
    let present = values
        .iter()
        .copied()
        .filter(|value| !value.is_missing())
        .collect::<Vec<_>>();
    let count = |n: usize| Scalar::Int64(i64::try_from(n).unwrap_or(i64::MAX));
    let float_sum = || present.iter().filter_map(|value| value.to_f64().ok()).sum::<f64>();

    match aggregate {
        Aggregate::Count => count(present.len()),
        Aggregate::DistinctCount => count(
            present
                .iter()
                .map(|value| GroupKey::from_scalar(value))
                .collect::<HashSet<_>>()
                .len(),
        ),
        Aggregate::Sum if out == DType::Int64 => Scalar::Int64(
            present
                .iter()
                .filter_map(|value| match value {
                    Scalar::Int64(v) => Some(*v),
                    Scalar::Bool(v) => Some(i64::from(*v)),
                    _ => None,
                })
                .fold(0, i64::saturating_add),
        ),
        Aggregate::Sum => Scalar::Float64(float_sum()),
        Aggregate::Avg if present.is_empty() => Scalar::missing_for_dtype(out),
        Aggregate::Avg => Scalar::Float64(float_sum() / present.len() as f64),
        Aggregate::Min => present
            .iter()
            .min_by(|a, b| a.total_cmp(b))
            .map_or_else(|| Scalar::missing_for_dtype(out), |value| (*value).clone()),
        Aggregate::Max => present
            .iter()
            .max_by(|a, b| a.total_cmp(b))
            .map_or_else(|| Scalar::missing_for_dtype(out), |value| (*value).clone()),
        Aggregate::First => values
            .first()
            .map_or_else(|| Scalar::missing_for_dtype(out), |value| (*value).clone()),
        Aggregate::Last => values
            .last()
            .map_or_else(|| Scalar::missing_for_dtype(out), |value| (*value).clone()),
        Aggregate::Unique => match present.split_first() {
            Some((first, rest)) if rest.iter().all(|value| value.semantic_eq(first)) => {
                (*first).clone()
            }
            _ => Scalar::missing_for_dtype(out),
        },
    }
}

/// Casts comparison operands to the column dtype where that is lossless.
fn coerce_filter(filter: &Filter, dtype: DType) -> Filter {
    let cast = |value: &Scalar| cast_scalar(value, dtype).unwrap_or_else(|_| value.clone());
    let value = match &filter.value {
        FilterValue::One(value) if !is_text_op(filter.op) => FilterValue::One(cast(value)),
        FilterValue::Many(values) => FilterValue::Many(values.iter().map(cast).collect()),
        other => other.clone(),
    };
    Filter::new(filter.column.clone(), filter.op, value)
}

fn is_text_op(op: FilterOp) -> bool {
    matches!(op, FilterOp::Contains | FilterOp::BeginsWith | FilterOp::EndsWith)
}

pub(crate) fn filter_matches(filter: &Filter, value: &Scalar) -> bool {
    match filter.op {
        FilterOp::IsNull => return value.is_missing(),
        FilterOp::IsNotNull => return !value.is_missing(),
        _ => {}
    }
    if value.is_missing() {
        return false;
    }

    let same = |candidate: &Scalar| value.total_cmp(candidate).is_eq();
    match (&filter.value, filter.op) {
        (FilterValue::None, _) => true,
        (FilterValue::Many(candidates), FilterOp::In) => candidates.iter().any(same),
        (FilterValue::Many(candidates), FilterOp::NotIn) => !candidates.iter().any(same),
        (FilterValue::Many(_), _) => false,
        (FilterValue::One(candidate), FilterOp::In) => same(candidate),
        (FilterValue::One(candidate), FilterOp::NotIn) => !same(candidate),
        (FilterValue::One(needle), FilterOp::Contains) => {
            value.to_string().contains(&needle.to_string())
        }
        (FilterValue::One(needle), FilterOp::BeginsWith) => {
            value.to_string().starts_with(&needle.to_string())
        }
        (FilterValue::One(needle), FilterOp::EndsWith) => {
            value.to_string().ends_with(&needle.to_string())
        }
        (FilterValue::One(operand), op) => {
            let comparison = match op {
                FilterOp::Eq => ComparisonOp::Eq,
                FilterOp::Ne => ComparisonOp::Ne,
                FilterOp::Lt => ComparisonOp::Lt,
                FilterOp::Le => ComparisonOp::Le,
                FilterOp::Gt => ComparisonOp::Gt,
                _ => ComparisonOp::Ge,
            };
            !operand.is_missing() && comparison.holds(value.total_cmp(operand))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pr_io::Sides;
    use pr_types::{DType, Scalar};

    use super::{StoredRow, aggregate_values, build, filter_matches};
    use crate::{Aggregate, Filter, FilterCombinator, FilterOp, FilterValue, Sort, SortDir, ViewConfig};

    fn schema() -> Vec<(String, DType)> {
        vec![
            ("region".to_owned(), DType::Utf8),
            ("kind".to_owned(), DType::Utf8),
            ("sales".to_owned(), DType::Int64),
        ]
    }

    fn rows() -> Vec<StoredRow> {
        [("west", "a", 5), ("east", "b", 10), ("west", "b", 7), ("east", "a", 1)]
            .into_iter()
            .enumerate()
            .map(|(pkey, (region, kind, sales))| StoredRow {
                pkey: Scalar::Int64(pkey as i64),
                values: vec![Scalar::from(region), Scalar::from(kind), Scalar::Int64(sales)],
            })
            .collect()
    }

    fn config(columns: &[&str]) -> ViewConfig {
        ViewConfig {
            columns: Some(columns.iter().map(|name| (*name).to_owned()).collect()),
            ..ViewConfig::default()
        }
    }

    #[test]
    fn flat_view_filters_and_sorts() {
        let config = ViewConfig {
            filter: vec![Filter::new("sales", FilterOp::Gt, FilterValue::One(Scalar::Int64(4)))],
            sort: vec![Sort::new("sales", SortDir::Desc)],
            ..config(&["region"])
        };
        let snapshot = build(&schema(), &rows(), &config, &[], "|").expect("snapshot");

        assert_eq!(snapshot.sides, Sides::Zero);
        assert_eq!(snapshot.column_names, vec!["region", "sales"]);
        assert_eq!(snapshot.column_paths, vec!["region"]);
        assert_eq!(snapshot.hidden_columns, 1);
        assert_eq!(
            snapshot.columns[0].values(),
            &[Scalar::from("east"), Scalar::from("west"), Scalar::from("west")]
        );
        assert_eq!(snapshot.pkeys[0], vec![Scalar::Int64(1)]);
    }

    #[test]
    fn or_combinator_keeps_either_match() {
        let config = ViewConfig {
            filter: vec![
                Filter::new("sales", FilterOp::Eq, FilterValue::One(Scalar::Int64(1))),
                Filter::new("kind", FilterOp::Eq, FilterValue::One(Scalar::from("b"))),
            ],
            filter_op: FilterCombinator::Or,
            ..config(&["sales"])
        };
        let snapshot = build(&schema(), &rows(), &config, &[], "|").expect("snapshot");
        assert_eq!(snapshot.num_rows(), 3);
    }

    #[test]
    fn group_by_emits_total_then_sorted_groups() {
        let config = ViewConfig {
            group_by: vec!["region".to_owned()],
            ..config(&["sales"])
        };
        let snapshot = build(&schema(), &rows(), &config, &[], "|").expect("snapshot");

        assert_eq!(snapshot.sides, Sides::One);
        assert_eq!(
            snapshot.row_paths,
            vec![Vec::new(), vec![Scalar::from("east")], vec![Scalar::from("west")]]
        );
        assert_eq!(
            snapshot.columns[0].values(),
            &[Scalar::Int64(23), Scalar::Int64(11), Scalar::Int64(12)]
        );
        assert_eq!(snapshot.schema, vec![("sales".to_owned(), DType::Int64)]);
    }

    #[test]
    fn group_sort_orders_siblings_by_aggregate() {
        let config = ViewConfig {
            group_by: vec!["region".to_owned()],
            sort: vec![Sort::new("sales", SortDir::Desc)],
            ..config(&["sales"])
        };
        let snapshot = build(&schema(), &rows(), &config, &[], "|").expect("snapshot");
        assert_eq!(snapshot.row_paths[1], vec![Scalar::from("west")]);
    }

    #[test]
    fn split_by_names_column_groups_with_separator() {
        let config = ViewConfig {
            group_by: vec!["region".to_owned()],
            split_by: vec!["kind".to_owned()],
            aggregates: BTreeMap::from([("sales".to_owned(), Aggregate::Max)]),
            ..config(&["sales"])
        };
        let snapshot = build(&schema(), &rows(), &config, &[], "|").expect("snapshot");

        assert_eq!(snapshot.sides, Sides::Two);
        assert_eq!(snapshot.column_names, vec!["a|sales", "b|sales"]);
        assert_eq!(
            snapshot.columns[1].values(),
            &[Scalar::Int64(10), Scalar::Int64(10), Scalar::Int64(7)]
        );
        let (lo, hi) = snapshot.min_max("sales", "|").expect("bounds");
        assert_eq!((lo, hi), (Scalar::Int64(1), Scalar::Int64(10)));
    }

    #[test]
    fn column_only_view_keeps_raw_rows() {
        let config = ViewConfig {
            split_by: vec!["kind".to_owned()],
            ..config(&["sales"])
        };
        let snapshot = build(&schema(), &rows(), &config, &[], "-").expect("snapshot");

        assert!(snapshot.column_only);
        assert_eq!(snapshot.num_rows(), 4);
        assert_eq!(snapshot.column_names, vec!["a-sales", "b-sales"]);
        assert!(snapshot.columns[0].values()[1].is_missing());
        assert_eq!(snapshot.columns[1].values()[1], Scalar::Int64(10));
    }

    #[test]
    fn unknown_columns_are_rejected() {
        let err = build(&schema(), &rows(), &config(&["nope"]), &[], "|").expect_err("unknown");
        assert_eq!(err.to_string(), "no column named \"nope\"");
    }

    #[test]
    fn aggregates_skip_missing_values() {
        let values = [Scalar::Int64(3), Scalar::Null(pr_types::NullKind::Null), Scalar::Int64(3)];
        let refs = values.iter().collect::<Vec<_>>();
        assert_eq!(aggregate_values(Aggregate::Count, DType::Int64, &refs), Scalar::Int64(2));
        assert_eq!(aggregate_values(Aggregate::Avg, DType::Int64, &refs), Scalar::Float64(3.0));
        assert_eq!(aggregate_values(Aggregate::Unique, DType::Int64, &refs), Scalar::Int64(3));
        assert_eq!(aggregate_values(Aggregate::DistinctCount, DType::Int64, &refs), Scalar::Int64(1));
        assert_eq!(aggregate_values(Aggregate::Last, DType::Int64, &refs), Scalar::Int64(3));
    }

    #[test]
    fn string_filters_match_text() {
        let begins = Filter::new("s", FilterOp::BeginsWith, FilterValue::One(Scalar::from("ab")));
        assert!(filter_matches(&begins, &Scalar::from("abc")));
        assert!(!filter_matches(&begins, &Scalar::Null(pr_types::NullKind::Null)));
        let within = Filter::new(
            "s",
            FilterOp::In,
            FilterValue::Many(vec![Scalar::from("x"), Scalar::from("y")]),
        );
        assert!(filter_matches(&within, &Scalar::from("y")));
    }
}
