//! `ViewConfig` parsing from loosely-typed JSON.

use std::collections::BTreeMap;

use pr_engine::{
    Aggregate, Filter, FilterCombinator, FilterOp, FilterValue, Sort, SortDir, ViewConfig,
};
use pr_io::Viewport;
use pr_types::Scalar;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::ConfigError;

pub const VIEW_CONFIG_KEYS: [&str; 11] = [
    "group_by",
    "split_by",
    "columns",
    "aggregates",
    "filter",
    "sort",
    "expressions",
    "filter_op",
    "group_by_depth",
    "split_by_depth",
    "viewport",
];

/// Deprecated spellings and the keys they stand for.
const KEY_ALIASES: [(&str, &str); 2] = [("row_pivots", "group_by"), ("column_pivots", "split_by")];

const LEGACY_AGGREGATE_KEY: &str = "aggregate";

/// Parses a view configuration object.
///
/// Accepts the keys in [`VIEW_CONFIG_KEYS`], the deprecated `row_pivots` and
/// `column_pivots` aliases, and the legacy `aggregate` list of
/// `{"column", "op"}` objects, which fills both `aggregates` and `columns`.
pub fn parse_view_config(raw: &Value) -> Result<ViewConfig, ConfigError> {
    let Value::Object(object) = raw else {
        return Err(invalid("<root>", "expected an object"));
    };

    let mut keyed: Map<String, Value> = Map::new();
    for (key, value) in object {
        let target = KEY_ALIASES
            .iter()
            .find(|(alias, _)| alias == key)
            .map_or(key.as_str(), |(_, target)| *target);
        if target != key.as_str() && object.contains_key(target) {
            return Err(ConfigError::DuplicateKey {
                key: target.to_owned(),
                alias: key.clone(),
            });
        }
        if !VIEW_CONFIG_KEYS.contains(&target) && target != LEGACY_AGGREGATE_KEY {
            return Err(ConfigError::UnrecognizedKey(key.clone()));
        }
        keyed.insert(target.to_owned(), value.clone());
    }

    let mut config = ViewConfig {
        group_by: field(&keyed, "group_by")?.unwrap_or_default(),
        split_by: field(&keyed, "split_by")?.unwrap_or_default(),
        columns: field(&keyed, "columns")?,
        expressions: field(&keyed, "expressions")?.unwrap_or_default(),
        group_by_depth: field(&keyed, "group_by_depth")?,
        split_by_depth: field(&keyed, "split_by_depth")?,
        viewport: field::<Viewport>(&keyed, "viewport")?,
        ..ViewConfig::default()
    };

    if let Some(raw) = field::<BTreeMap<String, String>>(&keyed, "aggregates")? {
        for (column, op) in raw {
            config.aggregates.insert(column, parse_aggregate("aggregates", &op)?);
        }
    }

    if let Some(legacy) = field::<Vec<Map<String, Value>>>(&keyed, LEGACY_AGGREGATE_KEY)? {
        for entry in legacy {
            let column = entry
                .get("column")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid(LEGACY_AGGREGATE_KEY, "entry without a column"))?;
            if let Some(op) = entry.get("op").and_then(Value::as_str) {
                config
                    .aggregates
                    .insert(column.to_owned(), parse_aggregate(LEGACY_AGGREGATE_KEY, op)?);
            }
            let columns = config.columns.get_or_insert_with(Vec::new);
            if !columns.iter().any(|existing| existing == column) {
                columns.push(column.to_owned());
            }
        }
    }

    if let Some(raw) = field::<String>(&keyed, "filter_op")? {
        config.filter_op = match raw.as_str() {
            "and" => FilterCombinator::And,
            "or" => FilterCombinator::Or,
            other => return Err(invalid("filter_op", &format!("unknown combinator {other:?}"))),
        };
    }

    if let Some(raw) = field::<Vec<Vec<Value>>>(&keyed, "filter")? {
        config.filter = raw.iter().map(|term| parse_filter(term)).collect::<Result<_, _>>()?;
    }

    if let Some(raw) = field::<Vec<(String, String)>>(&keyed, "sort")? {
        config.sort = raw
            .into_iter()
            .map(|(column, dir)| {
                SortDir::parse(&dir)
                    .map(|dir| Sort::new(column, dir))
                    .ok_or_else(|| invalid("sort", &format!("unknown direction {dir:?}")))
            })
            .collect::<Result<_, _>>()?;
    }

    Ok(config)
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_owned(),
        reason: reason.to_owned(),
    }
}

fn field<T: DeserializeOwned>(keyed: &Map<String, Value>, key: &str) -> Result<Option<T>, ConfigError> {
    match keyed.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|err| invalid(key, &err.to_string())),
    }
}

fn parse_aggregate(key: &str, raw: &str) -> Result<Aggregate, ConfigError> {
    Aggregate::parse(raw).ok_or_else(|| invalid(key, &format!("unknown aggregate {raw:?}")))
}

fn parse_filter(term: &[Value]) -> Result<Filter, ConfigError> {
    let (Some(Value::String(column)), Some(Value::String(op))) = (term.first(), term.get(1)) else {
        return Err(invalid("filter", "expected [column, op, value?]"));
    };
    let op = FilterOp::parse(op).ok_or_else(|| invalid("filter", &format!("unknown operator {op:?}")))?;
    let value = match term.get(2) {
        None | Some(Value::Null) => FilterValue::None,
        Some(Value::Array(items)) => FilterValue::Many(
            items
                .iter()
                .map(json_to_scalar)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Some(other) => FilterValue::One(json_to_scalar(other)?),
    };
    Ok(Filter::new(column.clone(), op, value))
}

fn json_to_scalar(value: &Value) -> Result<Scalar, ConfigError> {
    match value {
        Value::Bool(v) => Ok(Scalar::Bool(*v)),
        Value::Number(number) => number
            .as_i64()
            .map(Scalar::Int64)
            .or_else(|| number.as_f64().map(Scalar::Float64))
            .ok_or_else(|| invalid("filter", &format!("unsupported number {number}"))),
        Value::String(text) => Ok(Scalar::Utf8(text.clone())),
        other => Err(invalid("filter", &format!("unsupported value {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use pr_engine::{Aggregate, FilterCombinator, FilterOp, FilterValue, SortDir};
    use pr_types::Scalar;
    use serde_json::json;

    use super::parse_view_config;
    use crate::ConfigError;

    #[test]
    fn parses_every_recognized_key() {
        let config = parse_view_config(&json!({
            "group_by": ["region"],
            "split_by": ["kind"],
            "columns": ["sales"],
            "aggregates": {"sales": "avg"},
            "filter": [["sales", ">", 3], ["kind", "in", ["a", "b"]], ["region", "is null"]],
            "sort": [["sales", "desc"]],
            "expressions": ["// x\n1 + 1"],
            "filter_op": "or",
            "group_by_depth": 1,
            "viewport": {"top": 0, "left": 0, "height": 10, "width": 2}
        }))
        .expect("valid config");

        assert_eq!(config.group_by, vec!["region"]);
        assert_eq!(config.aggregates.get("sales"), Some(&Aggregate::Avg));
        assert_eq!(config.filter[0].value, FilterValue::One(Scalar::Int64(3)));
        assert_eq!(config.filter[1].op, FilterOp::In);
        assert_eq!(config.filter[2].value, FilterValue::None);
        assert_eq!(config.sort[0].dir, SortDir::Desc);
        assert_eq!(config.filter_op, FilterCombinator::Or);
        assert_eq!(config.group_by_depth, Some(1));
        assert_eq!(config.viewport.and_then(|viewport| viewport.height), Some(10));
    }

    #[test]
    fn explicit_empty_columns_differ_from_absent_ones() {
        let empty = parse_view_config(&json!({"columns": []})).expect("empty columns");
        assert_eq!(empty.columns, Some(Vec::new()));
        let absent = parse_view_config(&json!({})).expect("no columns");
        assert_eq!(absent.columns, None);
    }

    #[test]
    fn deprecated_aliases_map_to_their_keys() {
        let config = parse_view_config(&json!({"row_pivots": ["a"], "column_pivots": ["b"]}))
            .expect("aliases");
        assert_eq!(config.group_by, vec!["a"]);
        assert_eq!(config.split_by, vec!["b"]);

        let err = parse_view_config(&json!({"row_pivots": ["a"], "group_by": ["a"]}))
            .expect_err("alias and key together");
        assert!(matches!(err, ConfigError::DuplicateKey { ref key, .. } if key == "group_by"));
    }

    #[test]
    fn legacy_aggregate_list_fills_columns() {
        let config = parse_view_config(&json!({
            "aggregate": [{"column": "x", "op": "count"}, {"column": "y", "op": "sum"}]
        }))
        .expect("legacy");
        assert_eq!(config.output_columns().to_vec(), vec!["x", "y"]);
        assert_eq!(config.aggregates.get("x"), Some(&Aggregate::Count));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = parse_view_config(&json!({"pivot": []})).expect_err("unknown key");
        assert_eq!(err.to_string(), "Unrecognized config parameter: pivot");

        let err = parse_view_config(&json!({"sort": [["x", "sideways"]]})).expect_err("bad dir");
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "sort"));
    }
}
