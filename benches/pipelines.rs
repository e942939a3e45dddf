//! Benchmarks for the pipeline execution routes: serial map, parallel map, column apply and
//! chunked column apply.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use data_collection::column::Column;
use data_collection::operator::FnOperator;
use data_collection::types::Value;
use data_collection::{DataCollection, Index, LazyOperator, PipelineError, Record};

fn busy(v: Value) -> Value {
    let x = v.as_i64().unwrap_or(0);
    Value::Int64((0..200).fold(x, |acc, i| acc.wrapping_mul(31).wrapping_add(i)))
}

fn records(n: i64) -> DataCollection {
    DataCollection::of((0..n).map(|i| Record::new().with("a", i)))
}

fn add_one() -> Arc<LazyOperator> {
    let op = FnOperator::vectorized_fn(|cols: &[Column]| match &cols[0] {
        Column::Int64(v) => Ok(vec![Column::Int64(v.iter().map(|x| x + 1).collect())]),
        _ => Err(PipelineError::Schema {
            message: "ints expected".into(),
        }),
    });
    Arc::new(LazyOperator::from_instance(Arc::new(op), "add_one", Some(Index::from(("a", "b")))))
}

/// Serial vs parallel map over plain values
fn bench_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("map");
    for size in [1_000i64, 10_000] {
        group.bench_with_input(BenchmarkId::new("serial", size), &size, |b, &n| {
            b.iter(|| DataCollection::range(black_box(n)).map(busy).run());
        });
        for workers in [2usize, 4] {
            group.bench_with_input(BenchmarkId::new(format!("parallel_{workers}"), size), &size, |b, &n| {
                b.iter(|| {
                    DataCollection::range(black_box(n))
                        .stream()
                        .set_parallel(Some(workers), "thread")
                        .map(|dc| dc.map(busy).run())
                });
            });
        }
    }
    group.finish();
}

/// Row-wise indexed apply vs whole-table and chunked vectorized apply
fn bench_column_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("column_apply");
    let size = 50_000;

    group.bench_function("rows", |b| {
        b.iter(|| {
            records(size)
                .runas_op(("a", "b"), |v| Value::Int64(v.as_i64().unwrap_or(0) + 1))
                .map(DataCollection::run)
        });
    });
    group.bench_function("table", |b| {
        b.iter(|| records(size).to_column().and_then(|dc| dc.map_op(add_one())).map(DataCollection::run));
    });
    for chunk in [1_000usize, 10_000] {
        group.bench_with_input(BenchmarkId::new("chunks", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                records(size)
                    .set_chunksize(chunk)
                    .and_then(|dc| dc.map_op(add_one()))
                    .map(DataCollection::run)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_map, bench_column_apply);
criterion_main!(benches);
