//! JSON reader.
//!
//! Supported inputs:
//! - A JSON array of objects: `[{"a":1}, {"a":2}]`
//! - A single object
//! - Newline-delimited JSON (NDJSON): `{"a":1}\n{"a":2}\n`
//!
//! Nested objects become nested records, so fields are reachable with dotted paths
//! (e.g. `user.name`).

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::collection::{DataCollection, PipelineConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::types::Value;

/// Read a JSON or NDJSON file into a pipeline of records.
///
/// Streamed `.ndjson`/`.jsonl` files are read line by line; a malformed line becomes an absent
/// marker.
pub fn read_json_path(path: impl AsRef<Path>, stream: bool) -> PipelineResult<DataCollection> {
    let path = path.as_ref();
    let line_delimited = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext, "ndjson" | "jsonl"));
    if stream && line_delimited {
        let lines = BufReader::new(File::open(path)?).lines().enumerate();
        let records = lines.filter_map(|(idx0, line)| match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(parse_line(idx0 + 1, &line)),
            Err(e) => Some(Err(e.into())),
        });
        return DataCollection::derive_fallible(PipelineConfig::default(), true, records);
    }
    read_json_str(&fs::read_to_string(path)?, stream)
}

/// Read JSON text into a pipeline of records.
pub fn read_json_str(input: &str, stream: bool) -> PipelineResult<DataCollection> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::schema("json input is empty"));
    }

    // First try parsing as a single JSON value (array or object).
    let records: Vec<PipelineResult<Value>> = match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Array(items)) => items
            .into_iter()
            .enumerate()
            .map(|(idx0, v)| object_record(idx0 + 1, v))
            .collect(),
        Ok(v @ serde_json::Value::Object(_)) => vec![object_record(1, v)],
        Ok(_) => {
            return Err(PipelineError::schema(
                "json must be an object, an array of objects, or NDJSON",
            ));
        }
        // Fall back to NDJSON.
        Err(_) => trimmed
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx0, line)| parse_line(idx0 + 1, line))
            .collect(),
    };
    DataCollection::derive_fallible(PipelineConfig::default(), stream, records.into_iter())
}

fn parse_line(line_num: usize, line: &str) -> PipelineResult<Value> {
    let v = serde_json::from_str::<serde_json::Value>(line.trim())
        .map_err(|e| PipelineError::schema(format!("invalid ndjson at line {line_num}: {e}")))?;
    object_record(line_num, v)
}

fn object_record(row_num: usize, v: serde_json::Value) -> PipelineResult<Value> {
    if !v.is_object() {
        return Err(PipelineError::schema(format!("row {row_num} is not a json object")));
    }
    Ok(Value::from_json(v))
}
