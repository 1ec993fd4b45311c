#![forbid(unsafe_code)]

//! The engine capability the coordination layer drives, its view
//! configuration model, and [`MemoryEngine`], a small in-process engine that
//! implements it.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use bytes::Bytes;
use pr_columnar::{ColumnError, DataSlice};
use pr_expr::ExpressionDescriptor;
use pr_io::{IoError, Viewport};
use pr_types::{DType, Scalar, TypeError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod compile;
mod memory;
mod pivot;

pub use compile::{CompiledExpression, Expr, ExpressionError, Function, compile_expression};
pub use memory::{EngineStats, MemoryEngine};

/// Ordered column name -> dtype pairs.
pub type Schema = Vec<(String, DType)>;

/// One input row; partial rows are allowed for indexed tables.
pub type Row = BTreeMap<String, Scalar>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewId(pub u32);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortId(pub u32);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table#{}", self.0)
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view#{}", self.0)
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

/// Proof that staged mutations are waiting on a table. Owning the handle is
/// the right to recompute once; dropping it discards that right while the
/// staged rows stay with the table for the next recompute.
#[derive(Debug, PartialEq, Eq)]
pub struct RecomputeHandle {
    table: TableId,
}

impl RecomputeHandle {
    pub(crate) fn new(table: TableId) -> Self {
        Self { table }
    }

    #[must_use]
    pub fn table(&self) -> TableId {
        self.table
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "data", rename_all = "snake_case")]
pub enum Mutation {
    Insert(Vec<Row>),
    /// Primary-key values of rows to delete; indexed tables only.
    Remove(Vec<Scalar>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOptions {
    pub index: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "is null")]
    IsNull,
    #[serde(rename = "is not null")]
    IsNotNull,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not in")]
    NotIn,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "begins with")]
    BeginsWith,
    #[serde(rename = "ends with")]
    EndsWith,
}

impl FilterOp {
    pub const ALL: [Self; 13] = [
        Self::Eq,
        Self::Ne,
        Self::Lt,
        Self::Le,
        Self::Gt,
        Self::Ge,
        Self::IsNull,
        Self::IsNotNull,
        Self::In,
        Self::NotIn,
        Self::Contains,
        Self::BeginsWith,
        Self::EndsWith,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::IsNull => "is null",
            Self::IsNotNull => "is not null",
            Self::In => "in",
            Self::NotIn => "not in",
            Self::Contains => "contains",
            Self::BeginsWith => "begins with",
            Self::EndsWith => "ends with",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == raw)
    }

    /// Whether the operator takes no comparison value.
    #[must_use]
    pub fn is_unary(self) -> bool {
        matches!(self, Self::IsNull | Self::IsNotNull)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    None,
    One(Scalar),
    Many(Vec<Scalar>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: FilterValue,
}

impl Filter {
    #[must_use]
    pub fn new(column: impl Into<String>, op: FilterOp, value: FilterValue) -> Self {
        Self {
            column: column.into(),
            op,
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCombinator {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDir {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "asc")]
    Asc,
    #[serde(rename = "desc")]
    Desc,
    #[serde(rename = "asc abs")]
    AscAbs,
    #[serde(rename = "desc abs")]
    DescAbs,
}

impl SortDir {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "none" => Some(Self::None),
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            "asc abs" => Some(Self::AscAbs),
            "desc abs" => Some(Self::DescAbs),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub column: String,
    pub dir: SortDir,
}

impl Sort {
    #[must_use]
    pub fn new(column: impl Into<String>, dir: SortDir) -> Self {
        Self {
            column: column.into(),
            dir,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Aggregate {
    #[serde(rename = "sum")]
    Sum,
    #[serde(rename = "count")]
    Count,
    #[serde(rename = "avg")]
    Avg,
    #[serde(rename = "min")]
    Min,
    #[serde(rename = "max")]
    Max,
    #[serde(rename = "first")]
    First,
    #[serde(rename = "last")]
    Last,
    #[serde(rename = "unique")]
    Unique,
    #[serde(rename = "distinct count")]
    DistinctCount,
}

impl Aggregate {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sum" => Some(Self::Sum),
            "count" => Some(Self::Count),
            "avg" | "mean" => Some(Self::Avg),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "first" | "first by index" => Some(Self::First),
            "last" | "last by index" => Some(Self::Last),
            "unique" => Some(Self::Unique),
            "distinct count" | "distinctcount" => Some(Self::DistinctCount),
            _ => None,
        }
    }

    /// Sum for numeric columns, count for everything else.
    #[must_use]
    pub fn default_for(dtype: DType) -> Self {
        if matches!(dtype, DType::Int64 | DType::Float64) {
            Self::Sum
        } else {
            Self::Count
        }
    }

    #[must_use]
    pub fn output_dtype(self, input: DType) -> DType {
        match self {
            Self::Count | Self::DistinctCount => DType::Int64,
            Self::Avg => DType::Float64,
            Self::Sum if input == DType::Int64 || input == DType::Bool => DType::Int64,
            Self::Sum => DType::Float64,
            Self::Min | Self::Max | Self::First | Self::Last | Self::Unique => input,
        }
    }
}

/// Immutable configuration of a view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    pub group_by: Vec<String>,
    pub split_by: Vec<String>,
    /// Output columns. `None` means every table column followed by every
    /// expression alias; an empty list means no data columns at all.
    pub columns: Option<Vec<String>>,
    pub aggregates: BTreeMap<String, Aggregate>,
    pub filter: Vec<Filter>,
    pub sort: Vec<Sort>,
    pub expressions: Vec<String>,
    pub filter_op: FilterCombinator,
    pub group_by_depth: Option<usize>,
    pub split_by_depth: Option<usize>,
    pub viewport: Option<Viewport>,
}

impl ViewConfig {
    #[must_use]
    pub fn output_columns(&self) -> &[String] {
        self.columns.as_deref().unwrap_or_default()
    }

    /// Fills an absent `columns` list with the table's columns followed by
    /// `aliases`. An explicit list, empty or not, is kept.
    pub fn resolve_columns<'a>(&mut self, schema: &Schema, aliases: impl IntoIterator<Item = &'a str>) {
        if self.columns.is_none() {
            self.columns = Some(
                schema
                    .iter()
                    .map(|(name, _)| name.clone())
                    .chain(aliases.into_iter().map(str::to_owned))
                    .collect(),
            );
        }
    }

    /// Sort columns that are not also output columns, in sort order and
    /// without repeats. They trail every column group of the view.
    #[must_use]
    pub fn hidden_sort_columns(&self) -> Vec<&str> {
        let mut hidden: Vec<&str> = Vec::new();
        for sort in &self.sort {
            let name = sort.column.as_str();
            if !self.output_columns().iter().any(|column| column == name) && !hidden.contains(&name) {
                hidden.push(name);
            }
        }
        hidden
    }

    #[must_use]
    pub fn is_column_only(&self) -> bool {
        !self.split_by.is_empty() && self.group_by.is_empty()
    }
}

/// Shape and naming of a live view, as the materializer needs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewInfo {
    pub num_rows: usize,
    /// Engine column count, hidden sort columns included and the row-path
    /// column excluded.
    pub num_columns: usize,
    /// Engine column names in engine order, row-path column excluded.
    pub column_names: Vec<String>,
    /// Visible output columns only.
    pub column_paths: Vec<String>,
    pub schema: Schema,
    pub expression_schema: Schema,
}

/// Outcome of compiling one batch of canonical expressions against a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileReport {
    pub schema: BTreeMap<String, DType>,
    pub errors: BTreeMap<String, ExpressionError>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown {0}")]
    UnknownTable(TableId),
    #[error("unknown {0}")]
    UnknownView(ViewId),
    #[error("unknown {port} on {table}")]
    UnknownPort { table: TableId, port: PortId },
    #[error("no column named {0:?}")]
    UnknownColumn(String),
    #[error("duplicate column {0:?} in schema")]
    DuplicateColumn(String),
    #[error("cannot specify both index and limit")]
    IndexWithLimit,
    #[error("limit must be positive")]
    ZeroLimit,
    #[error("remove requires an indexed table")]
    RemoveWithoutIndex,
    #[error("row has no value for index column {0:?}")]
    MissingIndex(String),
    #[error("{table} still has {views} live view(s)")]
    TableHasViews { table: TableId, views: usize },
    #[error("delta tracking is disabled on {0}")]
    DeltasDisabled(ViewId),
    #[error("invalid expression {alias:?}: {error}")]
    InvalidExpression {
        alias: String,
        error: ExpressionError,
    },
    #[error("column {column:?} cannot take value: {source}")]
    Cast {
        column: String,
        #[source]
        source: TypeError,
    },
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Io(#[from] IoError),
}

/// Capability interface the coordination layer calls through. Every
/// engine-side resource is named by an id owned by the caller.
pub trait Engine {
    fn create_table(&mut self, schema: Schema, options: TableOptions) -> Result<TableId, EngineError>;

    /// Fails while views are still registered on the table.
    fn drop_table(&mut self, table: TableId) -> Result<(), EngineError>;

    /// Empties the table and discards staged mutations.
    fn reset_table(&mut self, table: TableId) -> Result<(), EngineError>;

    fn make_port(&mut self, table: TableId) -> Result<PortId, EngineError>;

    /// Validates and stages `mutation` on `port`. Nothing is visible to
    /// views until the returned handle is recomputed.
    fn apply_mutation(
        &mut self,
        table: TableId,
        mutation: Mutation,
        port: PortId,
    ) -> Result<RecomputeHandle, EngineError>;

    /// Applies everything staged on the handle's table and refreshes its
    /// views. Returns the ports that carried mutations, ascending.
    fn recompute(&mut self, handle: RecomputeHandle) -> Result<Vec<PortId>, EngineError>;

    fn get_schema(&self, table: TableId) -> Result<Schema, EngineError>;

    fn table_size(&self, table: TableId) -> Result<usize, EngineError>;

    fn compile_expressions(
        &self,
        table: TableId,
        descriptors: &[ExpressionDescriptor],
    ) -> Result<CompileReport, EngineError>;

    fn create_view(
        &mut self,
        table: TableId,
        config: &ViewConfig,
        descriptors: &[ExpressionDescriptor],
    ) -> Result<ViewId, EngineError>;

    fn drop_view(&mut self, view: ViewId) -> Result<(), EngineError>;

    fn view_info(&self, view: ViewId) -> Result<ViewInfo, EngineError>;

    /// Engine column 0 of a pivoted view is the row-path column.
    fn get_view_slice(
        &self,
        view: ViewId,
        rows: Range<usize>,
        columns: Range<usize>,
    ) -> Result<DataSlice, EngineError>;

    /// Rows changed on `port` by the last recompute, as an Arrow IPC stream.
    fn get_row_delta(&mut self, view: ViewId, port: PortId) -> Result<Bytes, EngineError>;

    fn set_delta_tracking(&mut self, view: ViewId, enabled: bool) -> Result<(), EngineError>;

    fn delta_tracking(&self, view: ViewId) -> Result<bool, EngineError>;

    /// Min and max of a column over the view's leaf rows, ignoring missing
    /// values.
    fn get_min_max(&self, view: ViewId, column: &str) -> Result<Option<(Scalar, Scalar)>, EngineError>;
}
