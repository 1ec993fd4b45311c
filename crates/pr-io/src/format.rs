use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use csv::WriterBuilder;
use pr_types::{DType, Scalar};
use serde_json::{Map, Number, Value};

use crate::IoError;

pub const ROW_PATH_KEY: &str = "__ROW_PATH__";
pub const INDEX_KEY: &str = "__INDEX__";
pub const ID_KEY: &str = "__ID__";

const MS_PER_DAY: i64 = 86_400_000;
const DATE_FORMAT: &str = "%-m/%-d/%Y";
const DATETIME_FORMAT: &str = "%-m/%-d/%Y, %-I:%M:%S %p";

/// Renders a date or datetime the way an en-US locale prints it. Dates are
/// calendar days and ignore the timezone; datetimes are shifted into `tz`.
#[must_use]
pub fn format_temporal(value: &Scalar, tz: Tz) -> Option<String> {
    match value {
        Scalar::Date(days) => NaiveDate::from_num_days_from_ce_opt(days.checked_add(719_163)?)
            .map(|date| date.format(DATE_FORMAT).to_string()),
        Scalar::Datetime(ms) => DateTime::from_timestamp_millis(*ms)
            .map(|utc| utc.with_timezone(&tz).format(DATETIME_FORMAT).to_string()),
        _ => None,
    }
}

/// JSON rendering of one scalar. Temporal values become epoch milliseconds
/// and missing values become `null`.
#[must_use]
pub fn scalar_to_json(value: &Scalar) -> Value {
    match value {
        Scalar::Null(_) => Value::Null,
        Scalar::Bool(v) => Value::Bool(*v),
        Scalar::Int64(v) => Value::from(*v),
        Scalar::Float64(v) => Number::from_f64(*v).map_or(Value::Null, Value::Number),
        Scalar::Utf8(v) => Value::String(v.clone()),
        Scalar::Date(days) => Value::from(i64::from(*days) * MS_PER_DAY),
        Scalar::Datetime(ms) => Value::from(*ms),
    }
}

/// A cell handed to a formatter: either the raw engine value or text that
/// the traversal already formatted.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue<'a> {
    Raw(&'a Scalar),
    Formatted(String),
}

impl CellValue<'_> {
    fn to_json(&self) -> Value {
        match self {
            Self::Raw(value) => scalar_to_json(value),
            Self::Formatted(text) => Value::String(text.clone()),
        }
    }

    fn to_text(&self) -> String {
        match self {
            Self::Raw(value) => value.to_string(),
            Self::Formatted(text) => text.clone(),
        }
    }
}

/// Shape of the output announced before the first row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Number of row-path levels, zero when the view emits no row path.
    pub row_path_depth: usize,
    pub columns: Vec<(String, DType)>,
    pub index: bool,
    pub id: bool,
}

/// Sink driven by [`crate::materialize`], one call per emitted piece.
pub trait Formatter {
    type Output;

    /// Whether date cells are rendered as text, given the caller's
    /// `formatted` switch.
    fn formats_dates(&self, requested: bool) -> bool {
        requested
    }

    fn begin(&mut self, header: &Header) -> Result<(), IoError>;

    fn begin_row(&mut self);

    /// One of the list-valued special columns (`__ID__`, `__ROW_PATH__`,
    /// `__INDEX__`).
    fn push_list(&mut self, key: &'static str, values: &[Scalar]);

    fn push_cell(&mut self, name: &str, value: CellValue<'_>);

    fn end_row(&mut self) -> Result<(), IoError>;

    fn finish(self) -> Result<Self::Output, IoError>;
}

/// Row-oriented records: one JSON object per row.
#[derive(Debug, Default)]
pub struct JsonRecords {
    rows: Vec<Map<String, Value>>,
    current: Map<String, Value>,
}

impl Formatter for JsonRecords {
    type Output = Vec<Map<String, Value>>;

    fn begin(&mut self, _header: &Header) -> Result<(), IoError> {
        Ok(())
    }

    fn begin_row(&mut self) {
        self.current = Map::new();
    }

    fn push_list(&mut self, key: &'static str, values: &[Scalar]) {
        let list = values.iter().map(scalar_to_json).collect();
        self.current.insert(key.to_owned(), Value::Array(list));
    }

    fn push_cell(&mut self, name: &str, value: CellValue<'_>) {
        self.current.insert(name.to_owned(), value.to_json());
    }

    fn end_row(&mut self) -> Result<(), IoError> {
        self.rows.push(std::mem::take(&mut self.current));
        Ok(())
    }

    fn finish(self) -> Result<Self::Output, IoError> {
        Ok(self.rows)
    }
}

/// Column-oriented records: one JSON array per output column.
#[derive(Debug, Default)]
pub struct JsonColumns {
    columns: Map<String, Value>,
}

impl JsonColumns {
    fn push(&mut self, key: &str, value: Value) {
        match self.columns.get_mut(key) {
            Some(Value::Array(values)) => values.push(value),
            _ => {
                self.columns.insert(key.to_owned(), Value::Array(vec![value]));
            }
        }
    }
}

impl Formatter for JsonColumns {
    type Output = Map<String, Value>;

    fn begin(&mut self, header: &Header) -> Result<(), IoError> {
        if header.id {
            self.columns.insert(ID_KEY.to_owned(), Value::Array(Vec::new()));
        }
        if header.row_path_depth > 0 {
            self.columns
                .insert(ROW_PATH_KEY.to_owned(), Value::Array(Vec::new()));
        }
        for (name, _) in &header.columns {
            self.columns.insert(name.clone(), Value::Array(Vec::new()));
        }
        if header.index {
            self.columns
                .insert(INDEX_KEY.to_owned(), Value::Array(Vec::new()));
        }
        Ok(())
    }

    fn begin_row(&mut self) {}

    fn push_list(&mut self, key: &'static str, values: &[Scalar]) {
        let list = values.iter().map(scalar_to_json).collect();
        self.push(key, Value::Array(list));
    }

    fn push_cell(&mut self, name: &str, value: CellValue<'_>) {
        self.push(name, value.to_json());
    }

    fn end_row(&mut self) -> Result<(), IoError> {
        Ok(())
    }

    fn finish(self) -> Result<Self::Output, IoError> {
        Ok(self.columns)
    }
}

/// Delimited text. The row path is flattened into `__ROW_PATH_<level>__`
/// columns; `__INDEX__` and `__ID__` are not emitted.
#[derive(Debug)]
pub struct Csv {
    writer: csv::Writer<Vec<u8>>,
    row_path_depth: usize,
    record: Vec<String>,
}

impl Default for Csv {
    fn default() -> Self {
        Self {
            writer: WriterBuilder::new().from_writer(Vec::new()),
            row_path_depth: 0,
            record: Vec::new(),
        }
    }
}

impl Formatter for Csv {
    type Output = String;

    fn formats_dates(&self, _requested: bool) -> bool {
        true
    }

    fn begin(&mut self, header: &Header) -> Result<(), IoError> {
        self.row_path_depth = header.row_path_depth;
        let mut names = (0..header.row_path_depth)
            .map(|level| format!("__ROW_PATH_{level}__"))
            .collect::<Vec<_>>();
        names.extend(header.columns.iter().map(|(name, _)| name.clone()));
        self.writer.write_record(&names)?;
        Ok(())
    }

    fn begin_row(&mut self) {
        self.record.clear();
    }

    fn push_list(&mut self, key: &'static str, values: &[Scalar]) {
        if key != ROW_PATH_KEY {
            return;
        }
        for level in 0..self.row_path_depth {
            self.record
                .push(values.get(level).map_or_else(String::new, Scalar::to_string));
        }
    }

    fn push_cell(&mut self, _name: &str, value: CellValue<'_>) {
        self.record.push(value.to_text());
    }

    fn end_row(&mut self) -> Result<(), IoError> {
        self.writer.write_record(&self.record)?;
        Ok(())
    }

    fn finish(self) -> Result<Self::Output, IoError> {
        let bytes = self.writer.into_inner().map_err(|err| err.into_error())?;
        Ok(String::from_utf8(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use pr_types::{NullKind, Scalar};
    use serde_json::json;

    use super::{format_temporal, scalar_to_json};

    #[test]
    fn dates_format_like_en_us() {
        // 2021-03-14
        let date = Scalar::Date(18_700);
        assert_eq!(format_temporal(&date, chrono_tz::UTC).as_deref(), Some("3/14/2021"));

        // 2021-03-14T15:09:26Z
        let datetime = Scalar::Datetime(1_615_734_566_000);
        assert_eq!(
            format_temporal(&datetime, chrono_tz::UTC).as_deref(),
            Some("3/14/2021, 3:09:26 PM")
        );
        assert_eq!(
            format_temporal(&datetime, chrono_tz::America::New_York).as_deref(),
            Some("3/14/2021, 11:09:26 AM")
        );
        assert_eq!(format_temporal(&Scalar::Int64(1), chrono_tz::UTC), None);
    }

    #[test]
    fn json_scalars_use_epoch_millis_and_null() {
        assert_eq!(scalar_to_json(&Scalar::Date(1)), json!(86_400_000));
        assert_eq!(scalar_to_json(&Scalar::Float64(f64::NAN)), json!(null));
        assert_eq!(scalar_to_json(&Scalar::Null(NullKind::NaT)), json!(null));
        assert_eq!(scalar_to_json(&Scalar::from("x")), json!("x"));
    }
}
