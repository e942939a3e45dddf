//! Core data model types.
//!
//! Every element flowing through a [`crate::DataCollection`] is a [`Value`]. Schema'd elements are
//! [`Record`]s, either owning their fields or viewing one row of a shared column table. Failed
//! elements travel as [`Value::Absent`] markers.
//!
//! [`DataSet`] is the row-indexed frame used by readers and by operators that apply to a whole
//! frame at once (see [`crate::operator::Operator::frame_apply`]).

mod record;

use std::fmt;
use std::sync::Arc;

pub use record::{EntityView, Record};

use crate::error::{PipelineError, PipelineResult};

/// Logical data type for a schema field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    /// 64-bit signed integer.
    Int64,
    /// 64-bit floating point number.
    Float64,
    /// Boolean.
    Bool,
    /// UTF-8 string.
    Utf8,
    /// Nested list of values.
    List,
    /// Nested record.
    Record,
    /// Mixed or unknown values.
    Any,
}

/// A single named, typed field in a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Field/column name.
    pub name: String,
    /// Field data type.
    pub data_type: DataType,
}

impl Field {
    /// Create a new field.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// A list of fields describing the shape of a [`DataSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    /// Ordered list of fields.
    pub fields: Vec<Field>,
}

impl Schema {
    /// Create a new schema from fields.
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Iterate field names in order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Returns the index of a field by name, if present.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// The reason an element became absent: the input that was being processed and the error.
#[derive(Debug, Clone, PartialEq)]
pub struct Absent {
    /// The element the operator was applied to.
    pub input: Value,
    /// Rendered error message.
    pub error: String,
}

/// A single dynamically typed value flowing through a pipeline.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Missing/empty value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit float.
    Float64(f64),
    /// UTF-8 string.
    Utf8(String),
    /// Ordered list (also used for tuples and batches).
    List(Vec<Value>),
    /// Schema'd record.
    Record(Record),
    /// A value whose computation failed.
    Absent(Arc<Absent>),
}

impl Value {
    /// Build an absent marker for `input` failing with `error`.
    pub fn absent(input: Value, error: impl fmt::Display) -> Self {
        Value::Absent(Arc::new(Absent {
            input,
            error: error.to_string(),
        }))
    }

    /// Build a list value.
    pub fn list<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Value::List(items.into_iter().map(Into::into).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Value::Absent(_))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view of the value; integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(v) => Some(*v),
            Value::Int64(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Utf8(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_absent(&self) -> Option<&Absent> {
        match self {
            Value::Absent(a) => Some(a),
            _ => None,
        }
    }

    /// Logical type of this value, `None` for nulls and absent markers.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null | Value::Absent(_) => None,
            Value::Bool(_) => Some(DataType::Bool),
            Value::Int64(_) => Some(DataType::Int64),
            Value::Float64(_) => Some(DataType::Float64),
            Value::Utf8(_) => Some(DataType::Utf8),
            Value::List(_) => Some(DataType::List),
            Value::Record(_) => Some(DataType::Record),
        }
    }

    /// Convert into a JSON value. Records become objects; absent markers become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null | Value::Absent(_) => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int64(v) => serde_json::Value::from(*v),
            Value::Float64(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Utf8(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Record(r) => {
                let mut map = serde_json::Map::new();
                for (k, v) in r.to_pairs() {
                    map.insert(k, v.to_json());
                }
                serde_json::Value::Object(map)
            }
        }
    }

    /// Convert from a JSON value. Objects become nested records in key order.
    pub fn from_json(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int64(i),
                None => n.as_f64().map(Value::Float64).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::Utf8(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Record(Record::from_pairs(
                map.into_iter().map(|(k, v)| (k, Value::from_json(v))),
            )),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::Utf8(s) => write!(f, "{s:?}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Record(r) => write!(f, "{r}"),
            Value::Absent(a) => write!(f, "Absent({})", a.error),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int64(i64::from(v))
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int64(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Utf8(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Utf8(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<Record> for Value {
    fn from(v: Record) -> Self {
        Value::Record(v)
    }
}

/// In-memory row-indexed frame.
///
/// Rows are stored as `Vec<Vec<Value>>` in the same order as the [`Schema`] fields.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSet {
    /// Schema describing row shape.
    pub schema: Schema,
    /// Row-major value storage.
    pub rows: Vec<Vec<Value>>,
}

impl DataSet {
    /// Create a dataset from schema and rows.
    pub fn new(schema: Schema, rows: Vec<Vec<Value>>) -> Self {
        Self { schema, rows }
    }

    /// Build a frame from records, using first-seen field order. Missing fields become nulls.
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a Record>,
    {
        let mut names: Vec<String> = Vec::new();
        let mut pairs: Vec<Vec<(String, Value)>> = Vec::new();
        for record in records {
            let fields = record.to_pairs();
            for (name, _) in &fields {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
            pairs.push(fields);
        }

        let rows: Vec<Vec<Value>> = pairs
            .into_iter()
            .map(|fields| {
                names
                    .iter()
                    .map(|n| {
                        fields
                            .iter()
                            .find(|(k, _)| k == n)
                            .map(|(_, v)| v.clone())
                            .unwrap_or(Value::Null)
                    })
                    .collect()
            })
            .collect();

        let fields = names
            .iter()
            .enumerate()
            .map(|(idx, name)| Field::new(name.clone(), infer_type(rows.iter().map(|r| &r[idx]))))
            .collect();
        Self::new(Schema::new(fields), rows)
    }

    /// Number of rows in the dataset.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// The row at `idx` as an owned record.
    pub fn record(&self, idx: usize) -> Option<Record> {
        let row = self.rows.get(idx)?;
        Some(Record::from_pairs(
            self.schema.field_names().map(str::to_string).zip(row.iter().cloned()),
        ))
    }

    /// Iterate all rows as owned records.
    pub fn records(&self) -> impl Iterator<Item = Record> + '_ {
        (0..self.row_count()).filter_map(move |i| self.record(i))
    }

    /// All values of one column, in row order.
    pub fn column_values(&self, name: &str) -> PipelineResult<Vec<Value>> {
        let idx = self
            .schema
            .index_of(name)
            .ok_or_else(|| PipelineError::schema(format!("missing column '{name}'")))?;
        Ok(self.rows.iter().map(|r| r[idx].clone()).collect())
    }

    /// Create a new dataset containing only rows that match `predicate`.
    ///
    /// The returned dataset preserves the original schema.
    pub fn filter_rows<F>(&self, mut predicate: F) -> Self
    where
        F: FnMut(&[Value]) -> bool,
    {
        let rows = self
            .rows
            .iter()
            .filter(|row| predicate(row.as_slice()))
            .cloned()
            .collect();
        Self {
            schema: self.schema.clone(),
            rows,
        }
    }

    /// Create a new dataset by applying `mapper` to every row.
    ///
    /// Fails if `mapper` returns a row with a different length than the schema field count.
    pub fn map_rows<F>(&self, mut mapper: F) -> PipelineResult<Self>
    where
        F: FnMut(&[Value]) -> Vec<Value>,
    {
        let expected_len = self.schema.fields.len();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let out = mapper(row.as_slice());
                if out.len() != expected_len {
                    return Err(PipelineError::schema(format!(
                        "mapped row length {} does not match schema length {}",
                        out.len(),
                        expected_len
                    )));
                }
                Ok(out)
            })
            .collect::<PipelineResult<Vec<_>>>()?;

        Ok(Self {
            schema: self.schema.clone(),
            rows,
        })
    }
}

fn infer_type<'a>(values: impl Iterator<Item = &'a Value>) -> DataType {
    let mut seen: Option<DataType> = None;
    for dt in values.filter_map(Value::data_type) {
        seen = match (seen, dt) {
            (None, dt) => Some(dt),
            (Some(a), b) if a == b => Some(a),
            (Some(DataType::Int64), DataType::Float64) | (Some(DataType::Float64), DataType::Int64) => {
                Some(DataType::Float64)
            }
            _ => return DataType::Any,
        };
    }
    seen.unwrap_or(DataType::Any)
}

#[cfg(test)]
mod tests {
    use super::{DataSet, DataType, Field, Record, Schema, Value};

    fn sample_dataset() -> DataSet {
        let schema = Schema::new(vec![
            Field::new("id", DataType::Int64),
            Field::new("active", DataType::Bool),
            Field::new("name", DataType::Utf8),
        ]);

        let rows = vec![
            vec![Value::Int64(1), Value::Bool(true), Value::from("a")],
            vec![Value::Int64(2), Value::Bool(false), Value::from("b")],
            vec![Value::Int64(3), Value::Bool(true), Value::from("c")],
        ];

        DataSet::new(schema, rows)
    }

    #[test]
    fn schema_index_of_works() {
        let ds = sample_dataset();
        assert_eq!(ds.schema.index_of("id"), Some(0));
        assert_eq!(ds.schema.index_of("name"), Some(2));
        assert_eq!(ds.schema.index_of("missing"), None);
    }

    #[test]
    fn filter_rows_keeps_schema_and_leaves_original() {
        let ds = sample_dataset();
        let out = ds.filter_rows(|row| matches!(row.first(), Some(Value::Int64(v)) if *v > 1));
        assert_eq!(out.schema, ds.schema);
        assert_eq!(out.row_count(), 2);
        assert_eq!(ds.row_count(), 3);
    }

    #[test]
    fn map_rows_rejects_wrong_arity() {
        let ds = sample_dataset();
        let err = ds.map_rows(|_row| vec![Value::Int64(1)]).unwrap_err();
        assert!(err.to_string().contains("mapped row length"));
    }

    #[test]
    fn records_round_trip_through_frame() {
        let records = vec![
            Record::from_pairs([("a", Value::from(1)), ("b", Value::from("x"))]),
            Record::from_pairs([("b", Value::from("y")), ("c", Value::from(2.5))]),
        ];
        let ds = DataSet::from_records(&records);

        assert_eq!(ds.schema.field_names().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(ds.schema.fields[0].data_type, DataType::Int64);
        assert_eq!(ds.rows[1], vec![Value::Null, Value::from("y"), Value::from(2.5)]);
        assert_eq!(ds.record(0).unwrap().get("b"), Some(Value::from("x")));
    }

    #[test]
    fn json_conversion_nests_objects() {
        let json = serde_json::json!({"id": 1, "user": {"name": "Ada"}, "tags": [1.5, true]});
        let v = Value::from_json(json.clone());
        let rec = v.as_record().unwrap();
        assert_eq!(rec.get("user.name"), Some(Value::from("Ada")));
        assert_eq!(v.to_json(), json);
    }

    #[test]
    fn absent_marker_keeps_input_and_error() {
        let v = Value::absent(Value::from(3), "boom");
        let absent = v.as_absent().unwrap();
        assert_eq!(absent.input, Value::Int64(3));
        assert_eq!(absent.error, "boom");
        assert!(v.is_absent());
    }
}
