//! Readers that start a pipeline from files.
//!
//! - [`csv`]: CSV into a frame-backed pipeline, or a stream of records
//! - [`json`]: JSON arrays, objects and NDJSON into records
//! - [`glob`]: file paths matching glob patterns

pub mod csv;
pub mod glob;
pub mod json;

pub use csv::{CsvOptions, read_csv_path, read_csv_str};
pub use glob::from_glob;
pub use json::{read_json_path, read_json_str};
