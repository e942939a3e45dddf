//! File listing by glob pattern.

use std::io;

use tracing::debug;

use crate::collection::DataCollection;
use crate::error::{PipelineError, PipelineResult};
use crate::types::Value;

/// A pipeline of the paths matching any of `patterns`, in pattern order.
///
/// Matching no file at all is an error.
pub fn from_glob<I, S>(patterns: I) -> PipelineResult<DataCollection>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut patterns_seen = Vec::new();
    let mut files = Vec::new();
    for pattern in patterns {
        let pattern = pattern.as_ref();
        for entry in glob::glob(pattern)? {
            let path = entry.map_err(|e| PipelineError::Io(e.into_error()))?;
            files.push(Value::Utf8(path.to_string_lossy().into_owned()));
        }
        patterns_seen.push(pattern.to_string());
    }
    if files.is_empty() {
        return Err(PipelineError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("there are no files matching {patterns_seen:?}"),
        )));
    }
    debug!(patterns = ?patterns_seen, files = files.len(), "glob");
    Ok(DataCollection::of(files))
}

#[cfg(test)]
mod tests {
    use super::from_glob;
    use crate::error::PipelineError;

    #[test]
    fn matches_crate_sources() {
        let pattern = concat!(env!("CARGO_MANIFEST_DIR"), "/src/ingestion/*.rs");
        let files = from_glob([pattern]).unwrap().to_list();
        assert!(files.iter().any(|f| f.as_str().is_some_and(|s| s.ends_with("glob.rs"))));
    }

    #[test]
    fn no_match_is_an_error() {
        let pattern = concat!(env!("CARGO_MANIFEST_DIR"), "/no-such-dir/*.csv");
        assert!(matches!(from_glob([pattern]), Err(PipelineError::Io(_))));
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        assert!(matches!(from_glob(["a/[b"]), Err(PipelineError::Glob(_))));
    }
}
