use data_collection::ingestion::json::{read_json_path, read_json_str};
use data_collection::types::Value;

#[test]
fn read_ndjson_path_with_nested_fields() {
    let dc = read_json_path("tests/fixtures/people.ndjson", false).unwrap();
    assert!(!dc.is_stream());
    let out = dc.to_list();
    assert_eq!(out.len(), 3);
    let ada = out[0].as_record().unwrap();
    assert_eq!(ada.get("address.city"), Some(Value::from("London")));
    assert_eq!(ada.get("tags"), Some(Value::list(["math", "code"])));
}

#[test]
fn streamed_ndjson_is_lazy_and_flattens_by_field() {
    let dc = read_json_path("tests/fixtures/people.ndjson", true).unwrap();
    assert!(dc.is_stream());
    let tags: Vec<Value> = dc
        .flatten_field("tags")
        .filter(|v| v.as_record().and_then(|r| r.get("tags")).is_some_and(|t| t.as_str().is_some()), false)
        .map(|v| v.as_record().and_then(|r| r.get("tags")).unwrap_or_default())
        .to_list();
    assert_eq!(tags, vec![Value::from("math"), Value::from("code"), Value::from("kernel")]);
}

#[test]
fn read_json_array_round_trips_to_json() {
    let input = r#"[{"id":1,"user":{"name":"Ada"}},{"id":2,"user":{"name":"Grace"}}]"#;
    let out = read_json_str(input, false).unwrap().to_list();
    let back: Vec<serde_json::Value> = out.iter().map(Value::to_json).collect();
    assert_eq!(back, serde_json::from_str::<Vec<serde_json::Value>>(input).unwrap());
}

#[test]
fn read_json_errors_on_non_object_row() {
    let err = read_json_str("[{\"a\":1}, 3]", false).unwrap_err();
    assert!(err.to_string().contains("row 2 is not a json object"));
}
