use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, NullArray, StringArray,
    TimestampMillisecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use bytes::Bytes;
use pr_types::{DType, Scalar};

use crate::IoError;
use crate::format::{CellValue, Formatter, Header, ROW_PATH_KEY};

/// Columnar binary output: an Arrow IPC stream holding one record batch.
///
/// Row-path levels become nullable Utf8 `__ROW_PATH_<level>__` fields ahead
/// of the data columns. Index and id lists are not part of the stream.
#[derive(Debug, Default)]
pub struct ArrowStream {
    row_path_depth: usize,
    path_levels: Vec<Vec<Option<String>>>,
    fields: Vec<(String, DType)>,
    values: Vec<Vec<Scalar>>,
    next_cell: usize,
    num_rows: usize,
}

impl Formatter for ArrowStream {
    type Output = Bytes;

    fn formats_dates(&self, _requested: bool) -> bool {
        false
    }

    fn begin(&mut self, header: &Header) -> Result<(), IoError> {
        self.row_path_depth = header.row_path_depth;
        self.path_levels = vec![Vec::new(); header.row_path_depth];
        self.fields = header.columns.clone();
        self.values = vec![Vec::new(); header.columns.len()];
        Ok(())
    }

    fn begin_row(&mut self) {
        self.next_cell = 0;
    }

    fn push_list(&mut self, key: &'static str, values: &[Scalar]) {
        if key != ROW_PATH_KEY {
            return;
        }
        for (level, out) in self.path_levels.iter_mut().enumerate() {
            out.push(
                values
                    .get(level)
                    .filter(|value| !value.is_missing())
                    .map(Scalar::to_string),
            );
        }
    }

    fn push_cell(&mut self, _name: &str, value: CellValue<'_>) {
        let scalar = match value {
            CellValue::Raw(scalar) => scalar.clone(),
            CellValue::Formatted(text) => Scalar::Utf8(text),
        };
        if let Some(column) = self.values.get_mut(self.next_cell) {
            column.push(scalar);
        }
        self.next_cell += 1;
    }

    fn end_row(&mut self) -> Result<(), IoError> {
        self.num_rows += 1;
        Ok(())
    }

    fn finish(self) -> Result<Self::Output, IoError> {
        let mut fields = Vec::with_capacity(self.row_path_depth + self.fields.len());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(fields.capacity());

        for (level, values) in self.path_levels.into_iter().enumerate() {
            fields.push(Field::new(format!("__ROW_PATH_{level}__"), DataType::Utf8, true));
            arrays.push(Arc::new(StringArray::from(values)));
        }
        for ((name, dtype), values) in self.fields.into_iter().zip(self.values) {
            let (data_type, array) = build_array(dtype, &values);
            fields.push(Field::new(name, data_type, true));
            arrays.push(array);
        }

        write_stream(Arc::new(Schema::new(fields)), arrays, self.num_rows)
    }
}

fn build_array(dtype: DType, values: &[Scalar]) -> (DataType, ArrayRef) {
    match dtype {
        DType::Null => (DataType::Null, Arc::new(NullArray::new(values.len()))),
        DType::Bool => {
            let values = values
                .iter()
                .map(|value| match value {
                    Scalar::Bool(v) => Some(*v),
                    _ => None,
                })
                .collect::<Vec<_>>();
            (DataType::Boolean, Arc::new(BooleanArray::from(values)))
        }
        DType::Int64 => {
            let values = values
                .iter()
                .map(|value| match value {
                    Scalar::Int64(v) => Some(*v),
                    _ => None,
                })
                .collect::<Vec<_>>();
            (DataType::Int64, Arc::new(Int64Array::from(values)))
        }
        DType::Float64 => {
            let values = values
                .iter()
                .map(|value| {
                    if value.is_missing() {
                        None
                    } else {
                        value.to_f64().ok()
                    }
                })
                .collect::<Vec<_>>();
            (DataType::Float64, Arc::new(Float64Array::from(values)))
        }
        DType::Utf8 => {
            let values = values
                .iter()
                .map(|value| (!value.is_missing()).then(|| value.to_string()))
                .collect::<Vec<_>>();
            (DataType::Utf8, Arc::new(StringArray::from(values)))
        }
        DType::Date => {
            let values = values
                .iter()
                .map(|value| match value {
                    Scalar::Date(v) => Some(*v),
                    _ => None,
                })
                .collect::<Vec<_>>();
            (DataType::Date32, Arc::new(Date32Array::from(values)))
        }
        DType::Datetime => {
            let values = values
                .iter()
                .map(|value| match value {
                    Scalar::Datetime(v) => Some(*v),
                    _ => None,
                })
                .collect::<Vec<_>>();
            (
                DataType::Timestamp(TimeUnit::Millisecond, None),
                Arc::new(TimestampMillisecondArray::from(values)),
            )
        }
    }
}

fn write_stream(
    schema: Arc<Schema>,
    arrays: Vec<ArrayRef>,
    num_rows: usize,
) -> Result<Bytes, IoError> {
    let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
    let batch = RecordBatch::try_new_with_options(Arc::clone(&schema), arrays, &options)?;

    let mut writer = StreamWriter::try_new(Vec::new(), &schema)?;
    writer.write(&batch)?;
    writer.finish()?;
    Ok(Bytes::from(writer.into_inner()?))
}
