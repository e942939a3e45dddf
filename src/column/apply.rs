//! Vectorized application of operators to tables.
//!
//! An operator applied to a table reads the columns named by its index's input key, in key
//! order, and writes its result columns under the output key's names. Outputs are added to (or
//! overwrite columns of) the same table, so every row view over it sees them.

use std::collections::VecDeque;
use std::iter;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::execution::Parallelism;
use crate::operator::LazyOperator;

use super::table::ChunkStream;
use super::{ChunkedTable, Column, Table};

/// Apply `op` to whole columns of `table`, writing the outputs back into it.
///
/// The operator must carry a schema index; the input key selects the argument columns.
pub fn apply_table(table: &Table, op: &LazyOperator) -> PipelineResult<()> {
    let Some(index) = op.index() else {
        return Err(PipelineError::mode(
            format!("column apply of `{}`", op.name()),
            "a schema index naming input and output columns is required",
        ));
    };
    let inputs = index
        .input()
        .map(|key| key.names())
        .unwrap_or_default()
        .into_iter()
        .map(|name| {
            table
                .column(name)
                .ok_or_else(|| PipelineError::schema(format!("table has no column '{name}'")))
        })
        .collect::<PipelineResult<Vec<Column>>>()?;

    let outputs = op.vcall(&inputs)?;
    let names: Vec<String> = index
        .output()
        .map(|key| key.names().into_iter().map(str::to_string).collect())
        .unwrap_or_default();
    debug!(operator = op.name(), rows = table.num_rows(), outputs = ?names, "column apply");
    table.write_many(&names, outputs)
}

/// Apply `op` to every chunk, keeping chunk boundaries.
///
/// Materialized chunks are applied eagerly (on the pool when one is given). Streamed chunks are
/// applied as they are pulled; with a pool, up to `num_worker` chunks are applied together.
pub fn apply_chunks(
    chunks: ChunkedTable,
    op: Arc<LazyOperator>,
    parallel: Option<&Parallelism>,
) -> PipelineResult<ChunkedTable> {
    match chunks {
        ChunkedTable::List(tables) => {
            match parallel {
                Some(p) => p.install(|| tables.par_iter().try_for_each(|t| apply_table(t, &op)))?,
                None => tables.iter().try_for_each(|t| apply_table(t, &op))?,
            }
            Ok(ChunkedTable::List(tables))
        }
        ChunkedTable::Stream(stream) => Ok(ChunkedTable::Stream(match parallel.cloned() {
            Some(p) => apply_stream_parallel(stream, op, p),
            None => Box::new(stream.map(move |chunk| {
                let table = chunk?;
                apply_table(&table, &op)?;
                Ok(table)
            })),
        })),
    }
}

fn apply_stream_parallel(mut stream: ChunkStream, op: Arc<LazyOperator>, parallel: Parallelism) -> ChunkStream {
    let window = parallel.num_worker();
    let mut ready: VecDeque<PipelineResult<Arc<Table>>> = VecDeque::new();
    Box::new(iter::from_fn(move || {
        if ready.is_empty() {
            let batch: Vec<PipelineResult<Arc<Table>>> = stream.by_ref().take(window).collect();
            let applied: Vec<PipelineResult<Arc<Table>>> = parallel.install(|| {
                batch
                    .into_par_iter()
                    .map(|chunk| {
                        let table = chunk?;
                        apply_table(&table, &op)?;
                        Ok(table)
                    })
                    .collect()
            });
            ready.extend(applied);
        }
        ready.pop_front()
    }))
}
