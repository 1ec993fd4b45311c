use std::collections::BTreeMap;
use std::io::Cursor;

use arrow::array::{Array, Int64Array, StringArray};
use arrow::ipc::reader::StreamReader;
use prism::{
    Aggregate, DType, MaterializeOptions, Row, Scalar, Session, SessionConfig, Sides, Sort,
    SortDir, TableId, TableOptions, TypedValues, ViewConfig, Viewport,
};
use serde_json::{Value, json};

fn sales_session() -> (Session, TableId) {
    let mut session = Session::new(SessionConfig::default());
    let schema = vec![
        ("region".to_owned(), DType::Utf8),
        ("kind".to_owned(), DType::Utf8),
        ("sales".to_owned(), DType::Int64),
    ];
    let rows = [("west", "a", 5), ("east", "b", 10), ("west", "b", 7), ("east", "a", 1)]
        .into_iter()
        .map(|(region, kind, sales)| {
            Row::from([
                ("region".to_owned(), Scalar::from(region)),
                ("kind".to_owned(), Scalar::from(kind)),
                ("sales".to_owned(), Scalar::Int64(sales)),
            ])
        })
        .collect();
    let table = session.table(schema, TableOptions::default(), rows).expect("table");
    (session, table)
}

fn columns(names: &[&str]) -> ViewConfig {
    ViewConfig {
        columns: Some(names.iter().map(|name| (*name).to_owned()).collect()),
        ..ViewConfig::default()
    }
}

#[test]
fn flat_view_emits_one_record_per_row_without_row_path() {
    let (mut session, table) = sales_session();
    let view = session.view(table, ViewConfig::default()).expect("view");
    assert_eq!(session.sides(view).expect("sides"), Sides::Zero);

    let records = session.to_json(view, &MaterializeOptions::rows(0, 3)).expect("json");
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|record| !record.contains_key("__ROW_PATH__")));
    assert_eq!(
        Value::Object(records[1].clone()),
        json!({"region": "east", "kind": "b", "sales": 10})
    );
}

#[test]
fn row_pivot_carries_paths_and_leaves_only_drops_totals() {
    let (mut session, table) = sales_session();
    let config = ViewConfig {
        group_by: vec!["region".to_owned()],
        ..columns(&["sales"])
    };
    let view = session.view(table, config).expect("view");
    assert_eq!(session.sides(view).expect("sides"), Sides::One);

    let records = session.to_json(view, &MaterializeOptions::default()).expect("json");
    let paths = records
        .iter()
        .map(|record| record["__ROW_PATH__"].clone())
        .collect::<Vec<_>>();
    assert_eq!(paths, vec![json!([]), json!(["east"]), json!(["west"])]);
    assert_eq!(records[0]["sales"], json!(23));

    let options = MaterializeOptions {
        leaves_only: true,
        ..MaterializeOptions::default()
    };
    let leaves = session.to_json(view, &options).expect("leaves");
    assert_eq!(leaves.len(), 2);
    assert_eq!(leaves[0]["sales"], json!(11));
}

#[test]
fn split_by_columns_are_named_by_path() {
    let (mut session, table) = sales_session();
    let config = ViewConfig {
        group_by: vec!["region".to_owned()],
        split_by: vec!["kind".to_owned()],
        aggregates: BTreeMap::from([("sales".to_owned(), Aggregate::Max)]),
        ..columns(&["sales"])
    };
    let view = session.view(table, config).expect("view");

    assert_eq!(session.sides(view).expect("sides"), Sides::Two);
    assert_eq!(session.num_columns(view).expect("columns"), 2);
    assert_eq!(
        session.column_paths(view).expect("paths"),
        vec!["a|sales", "b|sales"]
    );

    let table_out = session.to_columns(view, &MaterializeOptions::default()).expect("columns");
    let keys = table_out.keys().cloned().collect::<Vec<_>>();
    assert_eq!(keys, vec!["__ROW_PATH__", "a|sales", "b|sales"]);
    assert_eq!(table_out["b|sales"], json!([10, 10, 7]));
    assert_eq!(
        session.get_min_max(view, "sales").expect("min max"),
        Some((Scalar::Int64(1), Scalar::Int64(10)))
    );
}

#[test]
fn hidden_sort_columns_shape_order_but_are_not_emitted() {
    let (mut session, table) = sales_session();
    let config = ViewConfig {
        sort: vec![Sort::new("sales", SortDir::Desc)],
        ..columns(&["region"])
    };
    let view = session.view(table, config).expect("view");
    assert_eq!(session.num_columns(view).expect("columns"), 1);

    let records = session.to_json(view, &MaterializeOptions::default()).expect("json");
    let regions = records.iter().map(|record| record["region"].clone()).collect::<Vec<_>>();
    assert_eq!(regions, vec![json!("east"), json!("west"), json!("west"), json!("east")]);
    assert!(records.iter().all(|record| record.len() == 1));
}

#[test]
fn windows_clamp_and_fall_back_to_the_viewport() {
    let (mut session, table) = sales_session();
    let config = ViewConfig {
        viewport: Some(Viewport {
            top: Some(1),
            height: Some(2),
            ..Viewport::default()
        }),
        ..columns(&["sales"])
    };
    let view = session.view(table, config).expect("view");

    let stored = session.to_json(view, &MaterializeOptions::default()).expect("viewport");
    let sales = stored.iter().map(|record| record["sales"].clone()).collect::<Vec<_>>();
    assert_eq!(sales, vec![json!(10), json!(7)]);

    let clamped = session.to_json(view, &MaterializeOptions::rows(2, 100)).expect("clamped");
    assert_eq!(clamped.len(), 2);
}

#[test]
fn index_and_id_columns_are_opt_in() {
    let (mut session, table) = sales_session();
    let view = session.view(table, columns(&["sales"])).expect("view");
    let options = MaterializeOptions {
        index: true,
        id: true,
        ..MaterializeOptions::rows(0, 1)
    };
    let records = session.to_json(view, &options).expect("json");
    assert_eq!(
        Value::Object(records[0].clone()),
        json!({"__ID__": [0], "sales": 5, "__INDEX__": [0]})
    );
}

#[test]
fn csv_flattens_row_paths() {
    let (mut session, table) = sales_session();
    let config = ViewConfig {
        group_by: vec!["region".to_owned()],
        ..columns(&["sales"])
    };
    let view = session.view(table, config).expect("view");
    let text = session.to_csv(view, &MaterializeOptions::default()).expect("csv");
    assert_eq!(text, "__ROW_PATH_0__,sales\n,23\neast,11\nwest,12\n");
}

#[test]
fn arrow_stream_holds_typed_fields() {
    let (mut session, table) = sales_session();
    let view = session.view(table, columns(&["region", "sales"])).expect("view");
    let bytes = session.to_arrow(view, &MaterializeOptions::default()).expect("arrow");

    let reader = StreamReader::try_new(Cursor::new(bytes.to_vec()), None).expect("ipc");
    let batches = reader.collect::<Result<Vec<_>, _>>().expect("batches");
    let batch = &batches[0];
    assert_eq!(batch.num_rows(), 4);
    let regions = batch
        .column_by_name("region")
        .and_then(|column| column.as_any().downcast_ref::<StringArray>())
        .expect("region");
    assert_eq!(regions.value(1), "east");
    let sales = batch
        .column_by_name("sales")
        .and_then(|column| column.as_any().downcast_ref::<Int64Array>())
        .expect("sales");
    assert_eq!(sales.value(2), 7);
}

#[test]
fn single_columns_extract_as_typed_arrays_and_csv() {
    let (mut session, table) = sales_session();
    let flat = session.view(table, columns(&["region", "sales"])).expect("view");
    let options = MaterializeOptions::default();

    let typed = session
        .col_to_typed_array(flat, "sales", &options)
        .expect("typed")
        .expect("sales exists");
    assert_eq!(typed.values, TypedValues::Int32(vec![5, 10, 7, 1]));
    assert_eq!(typed.null_count, 0);
    assert!(session.col_to_typed_array(flat, "nope", &options).expect("missing").is_none());

    let pivoted = session
        .view(
            table,
            ViewConfig {
                group_by: vec!["region".to_owned()],
                ..columns(&["sales"])
            },
        )
        .expect("pivot");
    let typed = session
        .col_to_typed_array(pivoted, "sales", &options)
        .expect("typed")
        .expect("sales exists");
    assert_eq!(typed.values, TypedValues::Int32(vec![23, 11, 12]));

    let text = session
        .col_to_csv(flat, "region", &MaterializeOptions::rows(0, 2))
        .expect("csv")
        .expect("region exists");
    assert_eq!(text, "region\nwest\neast\n");
}

#[test]
fn column_separator_comes_from_session_config() {
    let config = SessionConfig::default()
        .with_column_separator("/")
        .expect("separator");
    let mut session = Session::new(config);
    let schema = vec![("kind".to_owned(), DType::Utf8), ("n".to_owned(), DType::Int64)];
    let rows = vec![Row::from([
        ("kind".to_owned(), Scalar::from("x")),
        ("n".to_owned(), Scalar::Int64(1)),
    ])];
    let table = session.table(schema, TableOptions::default(), rows).expect("table");
    let view = session
        .view(
            table,
            ViewConfig {
                split_by: vec!["kind".to_owned()],
                ..columns(&["n"])
            },
        )
        .expect("column-only view");
    assert_eq!(session.column_paths(view).expect("paths"), vec!["x/n"]);
    let records = session.to_json(view, &MaterializeOptions::default()).expect("json");
    assert!(!records[0].contains_key("__ROW_PATH__"));
}

#[test]
fn reads_observe_updates_issued_before_them() {
    let (mut session, table) = sales_session();
    let view = session.view(table, columns(&["sales"])).expect("view");
    let row = Row::from([("sales".to_owned(), Scalar::Int64(99))]);
    session.update(table, vec![row], prism::PortId(0)).expect("update");

    let records = session.to_json(view, &MaterializeOptions::default()).expect("json");
    assert_eq!(records.len(), 5);
    assert_eq!(records[4]["sales"], json!(99));
}

#[test]
fn explicit_empty_columns_keep_only_row_paths() {
    let (mut session, table) = sales_session();
    let view = session
        .view_from_json(table, &json!({"group_by": ["region"], "columns": []}))
        .expect("view");
    assert_eq!(session.num_columns(view).expect("columns"), 0);

    let records = session.to_json(view, &MaterializeOptions::default()).expect("json");
    assert_eq!(records.len(), 3);
    assert_eq!(records[1]["__ROW_PATH__"], json!(["east"]));
    assert!(records.iter().all(|record| record.len() == 1));

    let defaulted = session
        .view_from_json(table, &json!({"group_by": ["region"]}))
        .expect("view");
    assert_eq!(
        session.get_config(defaulted).expect("config").output_columns(),
        vec!["region", "kind", "sales"]
    );
}
