#![forbid(unsafe_code)]

use chrono_tz::Tz;
use pr_columnar::{ColumnError, DataSlice};
use pr_types::{DType, NullKind, Scalar};
use thiserror::Error;

mod arrow_ipc;
mod format;
mod typed_array;
mod window;

pub use arrow_ipc::ArrowStream;
pub use format::{
    CellValue, Csv, Formatter, Header, ID_KEY, INDEX_KEY, JsonColumns, JsonRecords, ROW_PATH_KEY,
    format_temporal, scalar_to_json,
};
pub use typed_array::{
    ColumnExtractor, CsvColumnExtractor, TypedArray, TypedArrayExtractor, TypedValues,
    materialize_column,
};
pub use window::{MaterializeOptions, Sides, SliceLayout, Viewport, Window};

#[derive(Debug, Error)]
pub enum IoError {
    #[error("dictionary exceeds i32 offsets")]
    DictionaryOverflow,
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

/// Walks `window` of `slice` row by row and drives `formatter`.
///
/// Per emitted row: `__ID__` (when requested), the row path (row-pivoted
/// views only), every visible data column in the window, then `__INDEX__`
/// (when requested). Engine column 0 of a pivoted view is the row-path slot
/// and never a data cell; hidden sort columns are skipped. With
/// `leaves_only`, rows whose path is shorter than the group-by depth are
/// skipped.
pub fn materialize<F: Formatter>(
    slice: &DataSlice,
    layout: &SliceLayout,
    window: Window,
    options: &MaterializeOptions,
    timezone: Tz,
    mut formatter: F,
) -> Result<F::Output, IoError> {
    let has_row_path = layout.has_row_path();
    let format_dates = formatter.formats_dates(options.formatted);

    let data_columns = (window.start_col..window.end_col)
        .filter(|cidx| !layout.is_path_column(*cidx) && !layout.is_hidden(*cidx))
        .filter_map(|cidx| {
            let name = slice.column_name(cidx)?;
            let dtype = slice.column(cidx).map_or(DType::Null, |column| column.dtype());
            Some((cidx, name.to_owned(), dtype))
        })
        .collect::<Vec<_>>();

    formatter.begin(&Header {
        row_path_depth: if has_row_path { layout.group_by_depth } else { 0 },
        columns: data_columns
            .iter()
            .map(|(_, name, dtype)| (name.clone(), *dtype))
            .collect(),
        index: options.index,
        id: options.id,
    })?;

    let missing = Scalar::Null(NullKind::Null);
    for ridx in window.start_row..window.end_row {
        let row_path = slice.row_path(ridx);
        if has_row_path && options.leaves_only && row_path.len() < layout.group_by_depth {
            continue;
        }

        formatter.begin_row();

        if options.id {
            let ids: &[Scalar] = if has_row_path {
                row_path
            } else if layout.sides == Sides::Zero {
                slice.pkeys(ridx)
            } else {
                &[]
            };
            formatter.push_list(ID_KEY, ids);
        }

        if has_row_path {
            formatter.push_list(ROW_PATH_KEY, row_path);
        }

        for (cidx, name, _) in &data_columns {
            let value = slice.get(ridx, *cidx).unwrap_or(&missing);
            let cell = if format_dates && !value.is_missing() {
                format_temporal(value, timezone).map_or(CellValue::Raw(value), CellValue::Formatted)
            } else {
                CellValue::Raw(value)
            };
            formatter.push_cell(name, cell);
        }

        if options.index {
            formatter.push_list(INDEX_KEY, slice.pkeys(ridx));
        }

        formatter.end_row()?;
    }

    formatter.finish()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use arrow::array::{Array, Int64Array, StringArray};
    use arrow::ipc::reader::StreamReader;
    use pr_columnar::{Column, DataSlice, ROW_PATH_COLUMN};
    use pr_types::{NullKind, Scalar};
    use serde_json::json;

    use super::{
        ArrowStream, Csv, JsonColumns, JsonRecords, MaterializeOptions, Sides, SliceLayout,
        materialize,
    };

    fn int_column(values: &[i64]) -> Column {
        Column::from_values(values.iter().copied().map(Scalar::Int64).collect()).expect("column")
    }

    fn flat_slice() -> (DataSlice, SliceLayout) {
        let slice = DataSlice::new(
            0,
            0,
            vec!["x".to_owned(), "y".to_owned()],
            vec![
                int_column(&[1, 2, 3]),
                Column::from_values(vec![
                    Scalar::from("a"),
                    Scalar::from("b"),
                    Scalar::Null(NullKind::Null),
                ])
                .expect("column"),
            ],
            Vec::new(),
            vec![
                vec![Scalar::Int64(0)],
                vec![Scalar::Int64(1)],
                vec![Scalar::Int64(2)],
            ],
        )
        .expect("slice");
        let layout = SliceLayout {
            sides: Sides::Zero,
            column_only: false,
            visible_columns: 2,
            hidden_columns: 0,
            group_by_depth: 0,
            num_rows: 3,
            num_columns: 2,
        };
        (slice, layout)
    }

    /// `group_by = ["region"]`, a total row then two leaves, with one hidden
    /// sort column.
    fn pivoted_slice() -> (DataSlice, SliceLayout) {
        let slice = DataSlice::new(
            0,
            0,
            vec![
                ROW_PATH_COLUMN.to_owned(),
                "sales".to_owned(),
                "rank".to_owned(),
            ],
            vec![
                Column::new(pr_types::DType::Null, vec![Scalar::Null(NullKind::Null); 3])
                    .expect("path slot"),
                int_column(&[30, 10, 20]),
                int_column(&[0, 1, 2]),
            ],
            vec![
                Vec::new(),
                vec![Scalar::from("east")],
                vec![Scalar::from("west")],
            ],
            vec![Vec::new(), Vec::new(), Vec::new()],
        )
        .expect("slice");
        let layout = SliceLayout {
            sides: Sides::One,
            column_only: false,
            visible_columns: 1,
            hidden_columns: 1,
            group_by_depth: 1,
            num_rows: 3,
            num_columns: 2,
        };
        (slice, layout)
    }

    #[test]
    fn flat_records_have_no_row_path() {
        let (slice, layout) = flat_slice();
        let options = MaterializeOptions::rows(0, 3);
        let window = layout.resolve_window(&options, None);
        let rows = materialize(&slice, &layout, window, &options, chrono_tz::UTC, JsonRecords::default())
            .expect("records");

        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| !row.contains_key("__ROW_PATH__")));
        assert_eq!(rows[2].get("y"), Some(&json!(null)));
        assert_eq!(rows[0].get("x"), Some(&json!(1)));
    }

    #[test]
    fn pivoted_records_carry_row_path_and_skip_hidden() {
        let (slice, layout) = pivoted_slice();
        let options = MaterializeOptions::default();
        let window = layout.resolve_window(&options, None);
        let rows = materialize(&slice, &layout, window, &options, chrono_tz::UTC, JsonRecords::default())
            .expect("records");

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].get("__ROW_PATH__"), Some(&json!([])));
        assert_eq!(rows[1].get("__ROW_PATH__"), Some(&json!(["east"])));
        assert!(rows.iter().all(|row| !row.contains_key("rank")));
        let keys: Vec<&String> = rows[1].keys().collect();
        assert_eq!(keys, vec!["__ROW_PATH__", "sales"]);
    }

    #[test]
    fn leaves_only_drops_aggregate_rows() {
        let (slice, layout) = pivoted_slice();
        let options = MaterializeOptions {
            leaves_only: true,
            ..MaterializeOptions::default()
        };
        let window = layout.resolve_window(&options, None);
        let rows = materialize(&slice, &layout, window, &options, chrono_tz::UTC, JsonRecords::default())
            .expect("records");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("sales"), Some(&json!(10)));
    }

    #[test]
    fn index_and_id_columns_wrap_each_row() {
        let (slice, layout) = flat_slice();
        let options = MaterializeOptions {
            index: true,
            id: true,
            ..MaterializeOptions::rows(1, 2)
        };
        let window = layout.resolve_window(&options, None);
        let rows = materialize(&slice, &layout, window, &options, chrono_tz::UTC, JsonRecords::default())
            .expect("records");
        let keys: Vec<&String> = rows[0].keys().collect();
        assert_eq!(keys, vec!["__ID__", "x", "y", "__INDEX__"]);
        assert_eq!(rows[0].get("__INDEX__"), Some(&json!([1])));
        assert_eq!(rows[0].get("__ID__"), Some(&json!([1])));
    }

    #[test]
    fn columns_output_is_column_major() {
        let (slice, layout) = flat_slice();
        let options = MaterializeOptions::default().with_columns(1, 2);
        let window = layout.resolve_window(&options, None);
        let columns = materialize(&slice, &layout, window, &options, chrono_tz::UTC, JsonColumns::default())
            .expect("columns");
        assert_eq!(json!(columns), json!({"y": ["a", "b", null]}));
    }

    #[test]
    fn cells_outside_the_slice_stay_aligned_as_null() {
        let (slice, mut layout) = flat_slice();
        layout.num_rows = 4;
        let options = MaterializeOptions::default();
        let window = layout.resolve_window(&options, None);
        let columns = materialize(&slice, &layout, window, &options, chrono_tz::UTC, JsonColumns::default())
            .expect("columns");
        assert_eq!(
            json!(columns),
            json!({"x": [1, 2, 3, null], "y": ["a", "b", null, null]})
        );
    }

    #[test]
    fn csv_flattens_row_path_and_formats_dates() {
        let (slice, layout) = pivoted_slice();
        let options = MaterializeOptions::default();
        let window = layout.resolve_window(&options, None);
        let text = materialize(&slice, &layout, window, &options, chrono_tz::UTC, Csv::default())
            .expect("csv");
        assert_eq!(text, "__ROW_PATH_0__,sales\n,30\neast,10\nwest,20\n");

        let slice = DataSlice::new(
            0,
            0,
            vec!["when".to_owned()],
            vec![Column::from_values(vec![Scalar::Date(18_700)]).expect("col")],
            Vec::new(),
            vec![Vec::new()],
        )
        .expect("slice");
        let layout = SliceLayout {
            sides: Sides::Zero,
            column_only: false,
            visible_columns: 1,
            hidden_columns: 0,
            group_by_depth: 0,
            num_rows: 1,
            num_columns: 1,
        };
        let window = layout.resolve_window(&options, None);
        let text = materialize(&slice, &layout, window, &options, chrono_tz::UTC, Csv::default())
            .expect("csv");
        assert_eq!(text, "when\n3/14/2021\n");
    }

    #[test]
    fn arrow_stream_keeps_types_and_row_path() {
        let (slice, layout) = pivoted_slice();
        let options = MaterializeOptions::default();
        let window = layout.resolve_window(&options, None);
        let bytes = materialize(&slice, &layout, window, &options, chrono_tz::UTC, ArrowStream::default())
            .expect("arrow");

        let mut reader = StreamReader::try_new(Cursor::new(bytes.to_vec()), None).expect("reader");
        let batch = reader.next().expect("one batch").expect("valid batch");
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.schema().field(0).name(), "__ROW_PATH_0__");
        assert_eq!(batch.schema().field(1).name(), "sales");

        let path = batch
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("utf8 path");
        assert!(path.is_null(0));
        assert_eq!(path.value(1), "east");

        let sales = batch
            .column(1)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64 sales");
        assert_eq!(sales.values().to_vec(), vec![30, 10, 20]);
    }
}
