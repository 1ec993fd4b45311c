use std::collections::HashMap;

use pr_columnar::{Column, DataSlice};
use pr_types::{DType, Scalar};
use serde::{Deserialize, Serialize};

use crate::IoError;
use crate::window::Sides;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TypedValues {
    Int32(Vec<i32>),
    Float64(Vec<f64>),
    /// Booleans packed eight per byte, least significant bit first.
    Bits(Vec<u8>),
    /// Utf8 values as a dictionary: concatenated bytes, `offsets` into them
    /// (one more than the number of distinct strings) and one index per row.
    Dictionary {
        dictionary: Vec<u8>,
        offsets: Vec<i32>,
        indices: Vec<i32>,
    },
}

/// One view column as a typed buffer plus its packed validity words.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedArray {
    pub values: TypedValues,
    pub null_count: usize,
    pub validity: Vec<u32>,
}

/// Format-specific conversion of a single column.
pub trait ColumnExtractor {
    type Output;

    /// `None` when the column cannot be represented in this format.
    fn extract(&self, name: &str, column: &Column) -> Result<Option<Self::Output>, IoError>;
}

/// Numeric buffer extraction.
///
/// int64 maps to Int32 when every value fits and to Float64 otherwise;
/// dates map to Int32 days and datetimes to Float64 milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypedArrayExtractor;

impl ColumnExtractor for TypedArrayExtractor {
    type Output = TypedArray;

    fn extract(&self, _name: &str, column: &Column) -> Result<Option<TypedArray>, IoError> {
        let values = column.values();
        let typed = match column.dtype() {
            DType::Null => return Ok(None),
            DType::Int64 => {
                let narrowed = values
                    .iter()
                    .map(|value| match value {
                        Scalar::Int64(v) => i32::try_from(*v).ok(),
                        _ => Some(0),
                    })
                    .collect::<Option<Vec<_>>>();
                match narrowed {
                    Some(ints) => TypedValues::Int32(ints),
                    None => TypedValues::Float64(floats(values)),
                }
            }
            DType::Float64 | DType::Datetime => TypedValues::Float64(floats(values)),
            DType::Date => TypedValues::Int32(
                values
                    .iter()
                    .map(|value| match value {
                        Scalar::Date(days) => *days,
                        _ => 0,
                    })
                    .collect(),
            ),
            DType::Bool => {
                let mut bits = vec![0_u8; values.len().div_ceil(8)];
                for (idx, value) in values.iter().enumerate() {
                    if matches!(value, Scalar::Bool(true)) {
                        bits[idx / 8] |= 1 << (idx % 8);
                    }
                }
                TypedValues::Bits(bits)
            }
            DType::Utf8 => dictionary_encode(values)?,
        };

        let validity = column.validity();
        Ok(Some(TypedArray {
            values: typed,
            null_count: validity.null_count(),
            validity: validity.words(),
        }))
    }
}

/// CSV text for a single column: a header line followed by one line per
/// row.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvColumnExtractor;

impl ColumnExtractor for CsvColumnExtractor {
    type Output = String;

    fn extract(&self, name: &str, column: &Column) -> Result<Option<String>, IoError> {
        let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
        writer.write_record([name])?;
        for value in column.values() {
            writer.write_record([value.to_string()])?;
        }
        let bytes = writer.into_inner().map_err(|err| err.into_error())?;
        Ok(Some(String::from_utf8(bytes)?))
    }
}

fn floats(values: &[Scalar]) -> Vec<f64> {
    values
        .iter()
        .map(|value| {
            if value.is_missing() {
                f64::NAN
            } else {
                value.to_f64().unwrap_or(f64::NAN)
            }
        })
        .collect()
}

fn dictionary_encode(values: &[Scalar]) -> Result<TypedValues, IoError> {
    let mut dictionary = Vec::new();
    let mut offsets = vec![0_i32];
    let mut positions: HashMap<&str, i32> = HashMap::new();
    let mut indices = Vec::with_capacity(values.len());

    for value in values {
        let Scalar::Utf8(text) = value else {
            indices.push(0);
            continue;
        };
        if let Some(position) = positions.get(text.as_str()) {
            indices.push(*position);
            continue;
        }
        let position = i32::try_from(positions.len()).map_err(|_| IoError::DictionaryOverflow)?;
        dictionary.extend_from_slice(text.as_bytes());
        offsets.push(i32::try_from(dictionary.len()).map_err(|_| IoError::DictionaryOverflow)?);
        positions.insert(text, position);
        indices.push(position);
    }

    Ok(TypedValues::Dictionary {
        dictionary,
        offsets,
        indices,
    })
}

/// Extracts one named column of a view.
///
/// `column_names` are the view's engine column names without the row-path
/// column; the engine position shifts by one on pivoted views. A held slice
/// is read when it covers the column, otherwise `fetch` is asked for a
/// single-column slice at the engine position. Unknown names yield
/// `Ok(None)`.
pub fn materialize_column<X, E, F>(
    column_names: &[String],
    name: &str,
    sides: Sides,
    held: Option<&DataSlice>,
    fetch: F,
    extractor: &X,
) -> Result<Option<X::Output>, E>
where
    X: ColumnExtractor,
    E: From<IoError>,
    F: FnOnce(usize) -> Result<DataSlice, E>,
{
    let Some(position) = column_names.iter().position(|candidate| candidate == name) else {
        return Ok(None);
    };
    let cidx = position + usize::from(sides.is_pivoted());

    if let Some(column) = held.and_then(|slice| slice.column(cidx)) {
        return extractor.extract(name, column).map_err(E::from);
    }

    let slice = fetch(cidx)?;
    match slice.column(cidx) {
        Some(column) => extractor.extract(name, column).map_err(E::from),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use pr_columnar::{Column, DataSlice};
    use pr_types::{NullKind, Scalar};

    use super::{
        ColumnExtractor, CsvColumnExtractor, TypedArrayExtractor, TypedValues, materialize_column,
    };
    use crate::IoError;
    use crate::window::Sides;

    #[test]
    fn int64_narrows_to_int32_with_validity() {
        let column = Column::from_values(vec![
            Scalar::Int64(1),
            Scalar::Null(NullKind::Null),
            Scalar::Int64(3),
        ])
        .expect("column");
        let typed = TypedArrayExtractor
            .extract("x", &column)
            .expect("extract")
            .expect("numeric column");
        assert_eq!(typed.values, TypedValues::Int32(vec![1, 0, 3]));
        assert_eq!(typed.null_count, 1);
        assert_eq!(typed.validity, vec![0b101, 0]);
    }

    #[test]
    fn wide_int64_falls_back_to_float64() {
        let column = Column::from_values(vec![Scalar::Int64(i64::from(i32::MAX) + 1)]).expect("col");
        let typed = TypedArrayExtractor
            .extract("x", &column)
            .expect("extract")
            .expect("numeric");
        assert_eq!(typed.values, TypedValues::Float64(vec![2_147_483_648.0]));
    }

    #[test]
    fn strings_are_dictionary_encoded() {
        let column = Column::from_values(vec![
            Scalar::from("ab"),
            Scalar::from("c"),
            Scalar::from("ab"),
        ])
        .expect("col");
        let typed = TypedArrayExtractor
            .extract("s", &column)
            .expect("extract")
            .expect("utf8");
        assert_eq!(
            typed.values,
            TypedValues::Dictionary {
                dictionary: b"abc".to_vec(),
                offsets: vec![0, 2, 3],
                indices: vec![0, 1, 0],
            }
        );
    }

    #[test]
    fn bools_pack_into_bits() {
        let column = Column::from_values(vec![Scalar::Bool(true), Scalar::Bool(false), Scalar::Bool(true)])
            .expect("col");
        let typed = TypedArrayExtractor
            .extract("b", &column)
            .expect("extract")
            .expect("bool");
        assert_eq!(typed.values, TypedValues::Bits(vec![0b101]));
    }

    #[test]
    fn unknown_column_is_none_and_pivoted_position_shifts() {
        let names = vec!["a".to_owned(), "b".to_owned()];
        let missing = materialize_column::<_, IoError, _>(
            &names,
            "zzz",
            Sides::Zero,
            None,
            |_| unreachable!("no fetch for unknown column"),
            &TypedArrayExtractor,
        )
        .expect("lookup");
        assert!(missing.is_none());

        let mut requested = None;
        let csv = materialize_column::<_, IoError, _>(
            &names,
            "b",
            Sides::One,
            None,
            |cidx| {
                requested = Some(cidx);
                let column = Column::from_values(vec![Scalar::Int64(9)]).expect("col");
                Ok(DataSlice::new(0, cidx, vec!["b".to_owned()], vec![column], Vec::new(), vec![vec![]])
                    .expect("slice"))
            },
            &CsvColumnExtractor,
        )
        .expect("extract")
        .expect("present");
        assert_eq!(requested, Some(2));
        assert_eq!(csv, "b\n9\n");
    }
}
