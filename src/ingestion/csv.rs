//! CSV reader.

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

use crate::collection::{DataCollection, PipelineConfig, Storage};
use crate::error::{PipelineError, PipelineResult};
use crate::types::{DataSet, DataType, Record, Schema, Value};

/// Options for [`read_csv_path`] and [`read_csv_str`].
#[derive(Debug, Clone, Default)]
pub struct CsvOptions {
    /// Yield records lazily instead of loading a frame.
    pub stream: bool,
    /// Columns to read and their types. Without one every header is read and cell types are
    /// inferred.
    pub schema: Option<Schema>,
}

impl CsvOptions {
    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }
}

/// Read a CSV file with headers.
///
/// Rules:
///
/// - Headers must contain all schema fields (order can differ).
/// - Empty cells are [`Value::Null`].
/// - Without a schema a cell is an integer, else a float, else a bool (`true`/`false`), else a
///   string.
///
/// A non-streamed read returns a frame-backed pipeline; a streamed one yields records as rows
/// are read, turning unparsable rows into absent markers.
pub fn read_csv_path(path: impl AsRef<Path>, options: &CsvOptions) -> PipelineResult<DataCollection> {
    read_csv(File::open(path)?, options)
}

/// Read CSV text. See [`read_csv_path`].
pub fn read_csv_str(input: &str, options: &CsvOptions) -> PipelineResult<DataCollection> {
    read_csv(Cursor::new(input.as_bytes().to_vec()), options)
}

struct ColumnSpec {
    position: usize,
    name: String,
    data_type: DataType,
}

fn read_csv<R: Read + Send + 'static>(reader: R, options: &CsvOptions) -> PipelineResult<DataCollection> {
    let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
    let headers = rdr.headers()?.clone();

    let columns: Vec<ColumnSpec> = match &options.schema {
        Some(schema) => schema
            .fields
            .iter()
            .map(|field| {
                let position = headers.iter().position(|h| h == field.name).ok_or_else(|| {
                    PipelineError::schema(format!(
                        "missing required column '{}'. headers={:?}",
                        field.name,
                        headers.iter().collect::<Vec<_>>()
                    ))
                })?;
                Ok(ColumnSpec {
                    position,
                    name: field.name.clone(),
                    data_type: field.data_type.clone(),
                })
            })
            .collect::<PipelineResult<_>>()?,
        None => headers
            .iter()
            .enumerate()
            .map(|(position, name)| ColumnSpec {
                position,
                name: name.to_string(),
                data_type: DataType::Any,
            })
            .collect(),
    };

    let rows = rdr.into_records().enumerate().map(move |(idx0, result)| {
        // 1-based, and the header is row 1.
        let user_row = idx0 + 2;
        let record = result?;
        columns
            .iter()
            .map(|col| {
                let raw = record.get(col.position).unwrap_or("");
                let value = parse_cell(user_row, col, raw)?;
                Ok((col.name.clone(), value))
            })
            .collect::<PipelineResult<Vec<(String, Value)>>>()
    });

    if options.stream {
        let records = rows.map(|row| row.map(|pairs| Value::Record(Record::from_pairs(pairs))));
        return DataCollection::derive_fallible(PipelineConfig::default(), true, records);
    }

    let rows = rows.collect::<PipelineResult<Vec<_>>>()?;
    let frame = match &options.schema {
        Some(schema) => DataSet::new(
            schema.clone(),
            rows.into_iter()
                .map(|pairs| pairs.into_iter().map(|(_, v)| v).collect())
                .collect(),
        ),
        None => {
            let records: Vec<Record> = rows.into_iter().map(Record::from_pairs).collect();
            DataSet::from_records(&records)
        }
    };
    Ok(DataCollection::new(Storage::Frame(frame)))
}

fn parse_cell(row: usize, column: &ColumnSpec, raw: &str) -> PipelineResult<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Value::Null);
    }
    let invalid = |message: String| {
        PipelineError::schema(format!(
            "row {row}, column '{}': cannot parse {raw:?}: {message}",
            column.name
        ))
    };

    match column.data_type {
        DataType::Any => Ok(infer_cell(trimmed)),
        DataType::Utf8 => Ok(Value::Utf8(trimmed.to_owned())),
        DataType::Int64 => trimmed
            .parse::<i64>()
            .map(Value::Int64)
            .map_err(|e| invalid(e.to_string())),
        DataType::Float64 => trimmed
            .parse::<f64>()
            .map(Value::Float64)
            .map_err(|e| invalid(e.to_string())),
        DataType::Bool => parse_bool(trimmed).map(Value::Bool).map_err(invalid),
        DataType::List | DataType::Record => serde_json::from_str::<serde_json::Value>(trimmed)
            .map(Value::from_json)
            .map_err(|e| invalid(e.to_string())),
    }
}

fn infer_cell(s: &str) -> Value {
    if let Ok(v) = s.parse::<i64>() {
        return Value::Int64(v);
    }
    if let Ok(v) = s.parse::<f64>() {
        return Value::Float64(v);
    }
    match s.to_ascii_lowercase().as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::Utf8(s.to_owned()),
    }
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "y" => Ok(true),
        "false" | "f" | "0" | "no" | "n" => Ok(false),
        _ => Err("expected bool (true/false/1/0/yes/no)".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::{CsvOptions, read_csv_str};
    use crate::collection::Storage;
    use crate::error::PipelineError;
    use crate::types::{DataType, Field, Schema, Value};

    const PEOPLE: &str = "id,name,score,active\n1,ana,1.5,true\n2,bo,,false\n";

    #[test]
    fn inferred_frame() {
        let dc = read_csv_str(PEOPLE, &CsvOptions::default()).unwrap();
        assert!(matches!(dc.storage(), Storage::Frame(_)));
        let ds = dc.to_dataset().unwrap();
        assert_eq!(ds.schema.field_names().collect::<Vec<_>>(), vec!["id", "name", "score", "active"]);
        assert_eq!(ds.rows[0], vec![
            Value::Int64(1),
            Value::Utf8("ana".into()),
            Value::Float64(1.5),
            Value::Bool(true)
        ]);
        assert_eq!(ds.rows[1][2], Value::Null);
    }

    #[test]
    fn schema_selects_and_types_columns() {
        let schema = Schema::new(vec![
            Field::new("name", DataType::Utf8),
            Field::new("id", DataType::Utf8),
        ]);
        let ds = read_csv_str(PEOPLE, &CsvOptions::default().schema(schema))
            .unwrap()
            .to_dataset()
            .unwrap();
        assert_eq!(ds.rows[1], vec![Value::Utf8("bo".into()), Value::Utf8("2".into())]);
    }

    #[test]
    fn missing_column_is_a_schema_error() {
        let schema = Schema::new(vec![Field::new("email", DataType::Utf8)]);
        let err = read_csv_str(PEOPLE, &CsvOptions::default().schema(schema)).unwrap_err();
        assert!(matches!(err, PipelineError::Schema { .. }));
    }

    #[test]
    fn streamed_rows_become_records_and_bad_rows_absent() {
        let schema = Schema::new(vec![Field::new("id", DataType::Int64)]);
        let input = "id\n1\nx\n3\n";
        let out = read_csv_str(input, &CsvOptions::default().stream(true).schema(schema))
            .unwrap()
            .to_list();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].as_record().unwrap().get("id"), Some(Value::Int64(1)));
        assert!(out[1].is_absent());
        assert_eq!(out[2].as_record().unwrap().get("id"), Some(Value::Int64(3)));
    }

    #[test]
    fn eager_read_fails_on_bad_row() {
        let schema = Schema::new(vec![Field::new("id", DataType::Int64)]);
        assert!(read_csv_str("id\n1\nx\n", &CsvOptions::default().schema(schema)).is_err());
    }
}
