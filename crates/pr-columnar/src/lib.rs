#![forbid(unsafe_code)]

use pr_types::{DType, Scalar, TypeError, cast_scalar_owned, infer_dtype};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityMask {
    bits: Vec<bool>,
}

impl ValidityMask {
    #[must_use]
    pub fn from_values(values: &[Scalar]) -> Self {
        let bits = values.iter().map(|value| !value.is_missing()).collect();
        Self { bits }
    }

    #[must_use]
    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    #[must_use]
    pub fn null_count(&self) -> usize {
        self.bits.iter().filter(|valid| !**valid).count()
    }

    /// Packs the mask into little-endian 32-bit words. The word count is
    /// always a multiple of two so the buffer covers whole 64-bit lanes.
    #[must_use]
    pub fn words(&self) -> Vec<u32> {
        let lanes = self.bits.len().div_ceil(64);
        let mut words = vec![0_u32; lanes * 2];
        for (idx, valid) in self.bits.iter().enumerate() {
            if *valid {
                words[idx / 32] |= 1 << (idx % 32);
            }
        }
        words
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    dtype: DType,
    values: Vec<Scalar>,
    validity: ValidityMask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Gt,
    Lt,
    Eq,
    Ne,
    Ge,
    Le,
}

impl ComparisonOp {
    #[must_use]
    pub fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};

        match self {
            Self::Gt => ordering == Greater,
            Self::Lt => ordering == Less,
            Self::Eq => ordering == Equal,
            Self::Ne => ordering != Equal,
            Self::Ge => ordering != Less,
            Self::Le => ordering != Greater,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ColumnError {
    #[error("column length mismatch: left={left}, right={right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("slice has {names} column names but {columns} columns")]
    SliceShape { names: usize, columns: usize },
    #[error(transparent)]
    Type(#[from] TypeError),
}

impl Column {
    /// Construct a column, coercing values to the target dtype. Values that
    /// already match are moved through without cloning.
    pub fn new(dtype: DType, values: Vec<Scalar>) -> Result<Self, ColumnError> {
        let needs_coercion = values.iter().any(|v| {
            let d = v.dtype();
            d != dtype && d != DType::Null
        });

        let coerced = if needs_coercion {
            values
                .into_iter()
                .map(|value| cast_scalar_owned(value, dtype))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            values
                .into_iter()
                .map(|value| match value {
                    Scalar::Null(_) => Scalar::missing_for_dtype(dtype),
                    other => other,
                })
                .collect()
        };

        let validity = ValidityMask::from_values(&coerced);

        Ok(Self {
            dtype,
            values: coerced,
            validity,
        })
    }

    pub fn from_values(values: Vec<Scalar>) -> Result<Self, ColumnError> {
        let dtype = infer_dtype(&values)?;
        Self::new(dtype, values)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn values(&self) -> &[Scalar] {
        &self.values
    }

    #[must_use]
    pub fn value(&self, idx: usize) -> Option<&Scalar> {
        self.values.get(idx)
    }

    #[must_use]
    pub fn validity(&self) -> &ValidityMask {
        &self.validity
    }

    pub fn reindex_by_positions(&self, positions: &[Option<usize>]) -> Result<Self, ColumnError> {
        let values = positions
            .iter()
            .map(|slot| match slot {
                Some(idx) => self
                    .values
                    .get(*idx)
                    .cloned()
                    .unwrap_or_else(|| Scalar::missing_for_dtype(self.dtype)),
                None => Scalar::missing_for_dtype(self.dtype),
            })
            .collect::<Vec<_>>();

        Self::new(self.dtype, values)
    }
}

/// Name used for the row-path slot at engine column 0 of pivoted views.
pub const ROW_PATH_COLUMN: &str = "__ROW_PATH__";

/// A rectangular half-open window `[start_row, end_row) x [start_col, end_col)`
/// of a view, in engine-native column order.
///
/// Cells are addressed with absolute view coordinates. Pivoted views carry
/// one row path per row; primary keys are carried for every row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSlice {
    start_row: usize,
    end_row: usize,
    start_col: usize,
    column_names: Vec<String>,
    columns: Vec<Column>,
    row_paths: Vec<Vec<Scalar>>,
    pkeys: Vec<Vec<Scalar>>,
}

impl DataSlice {
    pub fn new(
        start_row: usize,
        start_col: usize,
        column_names: Vec<String>,
        columns: Vec<Column>,
        row_paths: Vec<Vec<Scalar>>,
        pkeys: Vec<Vec<Scalar>>,
    ) -> Result<Self, ColumnError> {
        if column_names.len() != columns.len() {
            return Err(ColumnError::SliceShape {
                names: column_names.len(),
                columns: columns.len(),
            });
        }
        let num_rows = pkeys.len();
        for column in &columns {
            if column.len() != num_rows {
                return Err(ColumnError::LengthMismatch {
                    left: column.len(),
                    right: num_rows,
                });
            }
        }
        if !row_paths.is_empty() && row_paths.len() != num_rows {
            return Err(ColumnError::LengthMismatch {
                left: row_paths.len(),
                right: num_rows,
            });
        }

        Ok(Self {
            start_row,
            end_row: start_row + num_rows,
            start_col,
            column_names,
            columns,
            row_paths,
            pkeys,
        })
    }

    #[must_use]
    pub fn start_row(&self) -> usize {
        self.start_row
    }

    #[must_use]
    pub fn end_row(&self) -> usize {
        self.end_row
    }

    #[must_use]
    pub fn start_col(&self) -> usize {
        self.start_col
    }

    #[must_use]
    pub fn end_col(&self) -> usize {
        self.start_col + self.columns.len()
    }

    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.end_row - self.start_row
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    #[must_use]
    pub fn column_name(&self, cidx: usize) -> Option<&str> {
        cidx.checked_sub(self.start_col)
            .and_then(|offset| self.column_names.get(offset))
            .map(String::as_str)
    }

    #[must_use]
    pub fn column(&self, cidx: usize) -> Option<&Column> {
        cidx.checked_sub(self.start_col)
            .and_then(|offset| self.columns.get(offset))
    }

    #[must_use]
    pub fn get(&self, ridx: usize, cidx: usize) -> Option<&Scalar> {
        let row = ridx.checked_sub(self.start_row)?;
        self.column(cidx).and_then(|column| column.value(row))
    }

    #[must_use]
    pub fn row_path(&self, ridx: usize) -> &[Scalar] {
        ridx.checked_sub(self.start_row)
            .and_then(|row| self.row_paths.get(row))
            .map_or(&[][..], Vec::as_slice)
    }

    #[must_use]
    pub fn pkeys(&self, ridx: usize) -> &[Scalar] {
        ridx.checked_sub(self.start_row)
            .and_then(|row| self.pkeys.get(row))
            .map_or(&[][..], Vec::as_slice)
    }
}
