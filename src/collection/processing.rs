//! Element-wise and structural transforms on [`DataCollection`].
//!
//! `map_op` picks one execution route per call:
//!
//! 1. column or chunk storage with an indexed operator: vectorized apply on the tables
//! 2. a stateful operator: serial map
//! 3. a configured executor: ordered parallel map
//! 4. a frame backing and an operator that can apply to whole frames: frame apply
//! 5. otherwise a plain serial map
//!
//! Failures of single elements never abort a map; the element becomes an absent marker and a
//! warning is logged. Absent elements pass through later maps untouched.

use std::collections::VecDeque;
use std::iter;
use std::ops::Add;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::column::apply::{apply_chunks, apply_table};
use crate::dispatch::Index;
use crate::error::{PipelineError, PipelineResult};
use crate::execution::{self, DEFAULT_NUM_WORKER, Parallelism, TaskFn, ValueIter};
use crate::operator::{self, FnOperator, LazyOperator};
use crate::types::Value;

use super::{DataCollection, Storage, StorageMode};

fn closure_op(op: FnOperator, name: &str) -> Arc<LazyOperator> {
    Arc::new(LazyOperator::from_instance(Arc::new(op), name, None))
}

fn apply_element(op: &LazyOperator, x: Value) -> Value {
    if x.is_absent() {
        return x;
    }
    match op.call(x.clone()) {
        Ok(v) => v,
        Err(e) => {
            warn!(operator = op.name(), input = %x, error = %e, "element failed, continuing");
            Value::absent(x, e)
        }
    }
}

impl DataCollection {
    /// Map an infallible function over every element.
    pub fn map<F>(self, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.map_closure(closure_op(FnOperator::from_fn(f), "map"))
    }

    /// Map a fallible function; failing elements become absent markers.
    pub fn try_map<F>(self, f: F) -> Self
    where
        F: Fn(Value) -> PipelineResult<Value> + Send + Sync + 'static,
    {
        self.map_closure(closure_op(FnOperator::try_from_fn(f), "try_map"))
    }

    fn map_closure(self, op: Arc<LazyOperator>) -> Self {
        match self.config.parallel().cloned() {
            Some(parallel) => self.pmap_with(op, parallel),
            None => self.plain_map(op),
        }
    }

    /// Map an operator, choosing the execution route from the storage, the configuration and
    /// the operator's capabilities.
    pub fn map_op(self, op: impl Into<Arc<LazyOperator>>) -> PipelineResult<Self> {
        let op = op.into();
        if self.mode() != StorageMode::RowBased && op.index().is_some() {
            let parallel = self.config.parallel().cloned();
            return self.cmap(op, parallel);
        }
        if op.is_stateful()? {
            return Ok(self.smap(op));
        }
        if let Some(parallel) = self.config.parallel().cloned() {
            return Ok(self.pmap_with(op, parallel));
        }
        if op.capabilities()?.frame_apply {
            if let Storage::Frame(ds) = &self.storage {
                debug!(operator = op.name(), rows = ds.row_count(), "frame apply");
                let out = op.frame_apply(ds)?;
                return Ok(Self::derive_with(self.config, Storage::Frame(out)));
            }
        }
        Ok(self.plain_map(op))
    }

    /// Map each operator over its own copy of the elements. One operator is a parallel map.
    pub fn map_many(self, ops: Vec<Arc<LazyOperator>>) -> PipelineResult<Vec<Self>> {
        self.mmap(ops, None)
    }

    /// Serial map for stateful operators; calls happen in element order on the calling thread.
    pub fn smap(self, op: impl Into<Arc<LazyOperator>>) -> Self {
        self.plain_map(op.into())
    }

    fn plain_map(self, op: Arc<LazyOperator>) -> Self {
        debug!(operator = op.name(), "serial map");
        let (config, stream, items) = self.into_parts();
        Self::derive(config, stream, Box::new(items.map(move |x| apply_element(&op, x))))
    }

    fn cmap(self, op: Arc<LazyOperator>, parallel: Option<Parallelism>) -> PipelineResult<Self> {
        debug!(operator = op.name(), mode = ?self.mode(), "column map");
        let config = self.config;
        let storage = match self.storage {
            Storage::Table(table) => {
                apply_table(&table, &op)?;
                Storage::Table(table)
            }
            Storage::Chunks(chunks) => Storage::Chunks(apply_chunks(chunks, op, parallel.as_ref())?),
            _ => return Err(PipelineError::mode("column map", "column or chunk storage")),
        };
        Ok(Self::derive_with(config, storage))
    }

    /// Parallel map on the configured executor, or on an ad hoc pool of `num_worker` threads.
    ///
    /// Without either, a pool of [`DEFAULT_NUM_WORKER`] threads is used. Output order matches
    /// input order.
    pub fn pmap(self, op: impl Into<Arc<LazyOperator>>, num_worker: Option<usize>) -> PipelineResult<Self> {
        let op = op.into();
        let parallel = match (num_worker, self.config.parallel()) {
            (Some(n), Some(p)) if p.num_worker() == n => p.clone(),
            (Some(n), Some(p)) => p.resized(n)?,
            (Some(n), None) => Parallelism::new(n)?,
            (None, Some(p)) => p.clone(),
            (None, None) => Parallelism::new(DEFAULT_NUM_WORKER)?,
        };
        if self.mode() != StorageMode::RowBased && op.index().is_some() {
            return self.cmap(op, Some(parallel));
        }
        Ok(self.pmap_with(op, parallel))
    }

    fn pmap_with(self, op: Arc<LazyOperator>, parallel: Parallelism) -> Self {
        debug!(operator = op.name(), num_worker = parallel.num_worker(), "parallel map");
        let (config, stream, items) = self.into_parts();
        let task: TaskFn = Arc::new(move |x: Value| if x.is_absent() { Ok(x) } else { op.call(x) });
        Self::derive(config, stream, Box::new(parallel.pmap(items, task)))
    }

    /// Map several operators, each over its own branch of a [`Self::split`].
    pub fn mmap(self, ops: Vec<Arc<LazyOperator>>, num_worker: Option<usize>) -> PipelineResult<Vec<Self>> {
        if ops.len() == 1 {
            let op = ops.into_iter().next().ok_or_else(|| PipelineError::mode("mmap", "an operator"))?;
            return Ok(vec![self.pmap(op, num_worker)?]);
        }
        let branches = self.split(ops.len());
        let mut seen: Vec<Arc<LazyOperator>> = Vec::with_capacity(ops.len());
        let mut out = Vec::with_capacity(ops.len());
        for (branch, op) in branches.into_iter().zip(ops) {
            // A stateful instance is not shared between branches.
            let op = if seen.iter().any(|s| Arc::ptr_eq(s, &op)) && op.is_stateful()? {
                Arc::new(op.fork())
            } else {
                op
            };
            seen.push(Arc::clone(&op));
            out.push(branch.pmap(op, num_worker)?);
        }
        Ok(out)
    }

    /// Broadcast the elements to `count` independent pipelines.
    ///
    /// Streamed pipelines get bounded per-branch queues; list-backed ones unbounded queues, since
    /// each materialized branch drains its queue completely before the next is read.
    pub fn split(self, count: usize) -> Vec<Self> {
        let (config, stream, items) = self.into_parts();
        execution::split(items, count, stream)
            .into_iter()
            .map(|branch| Self::derive(config.clone(), stream, branch))
            .collect()
    }

    /// Keep elements matching `predicate`.
    ///
    /// Absent markers are never passed to `predicate`: they are kept unless `drop_empty`.
    pub fn filter<F>(self, predicate: F, drop_empty: bool) -> Self
    where
        F: Fn(&Value) -> bool + Send + 'static,
    {
        let (config, stream, items) = self.into_parts();
        let kept = items.filter(move |x| if x.is_absent() { !drop_empty } else { predicate(x) });
        Self::derive(config, stream, Box::new(kept))
    }

    /// Remove absent markers.
    pub fn drop_empty(self) -> Self {
        self.filter(|_| true, true)
    }

    /// Group consecutive elements into lists of `size`. The last, shorter group is kept unless
    /// `drop_tail`.
    pub fn batch(self, size: usize, drop_tail: bool) -> PipelineResult<Self> {
        if size == 0 {
            return Err(PipelineError::mode("batch", "batch size must be > 0"));
        }
        let (config, stream, mut items) = self.into_parts();
        let batches = iter::from_fn(move || {
            let group: Vec<Value> = items.by_ref().take(size).collect();
            if group.is_empty() || (drop_tail && group.len() < size) {
                None
            } else {
                Some(Value::List(group))
            }
        });
        Ok(Self::derive(config, stream, Box::new(batches)))
    }

    /// Sliding windows of `size` elements advancing by `step`.
    ///
    /// With `drop_head` off, the growing windows before the first full one are emitted too.
    /// With `drop_tail` off, after the input ends the remaining buffer is emitted and shifted by
    /// `step` until empty.
    pub fn rolling(self, size: usize, step: usize, drop_head: bool, drop_tail: bool) -> PipelineResult<Self> {
        if size == 0 || step == 0 {
            return Err(PipelineError::mode("rolling", "window size and step must be > 0"));
        }
        let (config, stream, input) = self.into_parts();
        let windows = Rolling {
            input,
            buff: VecDeque::with_capacity(size),
            size,
            step,
            drop_head,
            drop_tail,
            gap: 0,
            head: true,
            exhausted: false,
        };
        Ok(Self::derive(config, stream, Box::new(windows)))
    }

    /// Combine element-wise with `others` into lists, stopping at the shortest input.
    pub fn zip<I>(self, others: I) -> Self
    where
        I: IntoIterator<Item = DataCollection>,
    {
        let (config, stream, first) = self.into_parts();
        let mut inputs: Vec<ValueIter> = vec![first];
        inputs.extend(others.into_iter().map(IntoIterator::into_iter));
        let zipped = iter::from_fn(move || {
            inputs
                .iter_mut()
                .map(Iterator::next)
                .collect::<Option<Vec<Value>>>()
                .map(Value::List)
        });
        Self::derive(config, stream, Box::new(zipped))
    }

    /// All elements of `self`, then all of `other`.
    pub fn concat(self, other: DataCollection) -> Self {
        let (config, stream, items) = self.into_parts();
        Self::derive(config, stream, Box::new(items.chain(other)))
    }

    pub fn head(self, n: usize) -> Self {
        let (config, stream, items) = self.into_parts();
        Self::derive(config, stream, Box::new(items.take(n)))
    }

    /// Keep each element with probability `ratio`.
    pub fn sample(self, ratio: f64) -> Self {
        self.sample_with(ratio, StdRng::from_rng(&mut rand::rng()))
    }

    /// [`Self::sample`] with a reproducible random sequence.
    pub fn sample_seeded(self, ratio: f64, seed: u64) -> Self {
        self.sample_with(ratio, StdRng::seed_from_u64(seed))
    }

    fn sample_with(self, ratio: f64, mut rng: StdRng) -> Self {
        let (config, stream, items) = self.into_parts();
        Self::derive(config, stream, Box::new(items.filter(move |_| rng.random::<f64>() < ratio)))
    }

    /// Random permutation of a list-backed pipeline.
    pub fn shuffle(self) -> PipelineResult<Self> {
        self.shuffle_with(&mut rand::rng())
    }

    pub fn shuffle_seeded(self, seed: u64) -> PipelineResult<Self> {
        self.shuffle_with(&mut StdRng::seed_from_u64(seed))
    }

    fn shuffle_with<R: Rng>(self, rng: &mut R) -> PipelineResult<Self> {
        if self.is_stream() {
            return Err(PipelineError::mode("shuffle", "a non-streamed pipeline"));
        }
        let (config, _, items) = self.into_parts();
        let mut values: Vec<Value> = items.collect();
        values.shuffle(rng);
        Ok(Self::derive_with(config, Storage::List(values)))
    }

    /// Split a list-backed pipeline into `(train, test)` children.
    ///
    /// The train part holds the first `floor(train_ratio * len)` elements. With a `seed` the
    /// elements are shuffled first, otherwise the input order is kept.
    pub fn split_train_test(self, train_ratio: f64, seed: Option<u64>) -> PipelineResult<(Self, Self)> {
        if self.is_stream() {
            return Err(PipelineError::mode("split_train_test", "a non-streamed pipeline"));
        }
        if !(0.0..=1.0).contains(&train_ratio) {
            return Err(PipelineError::mode("split_train_test", "a train ratio within [0, 1]"));
        }
        let (config, _, items) = self.into_parts();
        let mut train: Vec<Value> = items.collect();
        if let Some(seed) = seed {
            train.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        // Absorb representation error, 0.9 * 10 must give 9.
        let cut = ((train_ratio * train.len() as f64) + 1e-9).floor() as usize;
        let test = train.split_off(cut.min(train.len()));
        debug!(train = train.len(), test = test.len(), "train/test split");
        Ok((
            Self::derive_with(config.clone(), Storage::List(train)),
            Self::derive_with(config, Storage::List(test)),
        ))
    }

    /// Expand list elements into their items. Other scalars pass through.
    ///
    /// Records need a target field, see [`Self::flatten_field`]; meeting one is an error.
    pub fn flatten(self) -> PipelineResult<Self> {
        if self.mode() != StorageMode::RowBased || matches!(self.storage, Storage::Frame(_)) {
            return Err(flatten_needs_field());
        }
        let (config, stream, items) = self.into_parts();
        let flat = items.flat_map(|x| -> Box<dyn Iterator<Item = PipelineResult<Value>> + Send> {
            match x {
                Value::Record(_) => Box::new(iter::once(Err(flatten_needs_field()))),
                Value::List(nested) => Box::new(nested.into_iter().map(Ok)),
                other => Box::new(iter::once(Ok(other))),
            }
        });
        Self::derive_fallible(config, stream, flat)
    }

    /// Expand records along the list in `field`: one record per item, with `field` replaced by
    /// the item. Records without a list there, and non-record elements, are flattened as by
    /// [`Self::flatten`] or passed through.
    pub fn flatten_field(self, field: &str) -> Self {
        let field = field.to_string();
        let (config, stream, items) = self.into_parts();
        let flat = items.flat_map(move |x| -> ValueIter {
            match x {
                Value::Record(record) => match record.get(&field) {
                    Some(Value::List(nested)) => {
                        let base = record.to_owned_record();
                        let field = field.clone();
                        Box::new(nested.into_iter().map(move |item| {
                            let mut rec = base.clone();
                            match rec.set(&field, item) {
                                Ok(()) => Value::Record(rec),
                                Err(e) => Value::absent(Value::Record(base.clone()), e),
                            }
                        }))
                    }
                    _ => Box::new(iter::once(Value::Record(record))),
                },
                Value::List(nested) => Box::new(nested.into_iter()),
                other => Box::new(iter::once(other)),
            }
        });
        Self::derive(config, stream, Box::new(flat))
    }

    /// Drive the pipeline to completion, discarding the elements.
    pub fn run(self) {
        self.into_iter().for_each(drop);
    }

    /// Drive the pipeline to completion, calling `f` on every element.
    pub fn for_each<F>(self, f: F)
    where
        F: FnMut(Value),
    {
        self.into_iter().for_each(f);
    }

    /// Map a closure over the fields selected by `index`, writing its output fields.
    pub fn runas_op<F>(self, index: impl Into<Index>, f: F) -> PipelineResult<Self>
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.map_op(operator::runas_op(Some(index.into()), move |v| Ok(f(v))))
    }
}

fn flatten_needs_field() -> PipelineError {
    PipelineError::mode("flatten", "a target field to flatten records (use flatten_field)")
}

impl Add for DataCollection {
    type Output = DataCollection;

    fn add(self, other: DataCollection) -> DataCollection {
        self.concat(other)
    }
}

struct Rolling {
    input: ValueIter,
    buff: VecDeque<Value>,
    size: usize,
    step: usize,
    drop_head: bool,
    drop_tail: bool,
    /// Elements still to skip when `step` exceeds `size`.
    gap: usize,
    head: bool,
    exhausted: bool,
}

impl Rolling {
    fn window(&self) -> Value {
        Value::List(self.buff.iter().cloned().collect())
    }

    fn advance(&mut self) {
        let n = self.step.min(self.buff.len());
        self.buff.drain(..n);
    }
}

impl Iterator for Rolling {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        while !self.exhausted {
            let Some(x) = self.input.next() else {
                self.exhausted = true;
                break;
            };
            if self.gap > 0 {
                self.gap -= 1;
                continue;
            }
            self.buff.push_back(x);
            let full = self.buff.len() == self.size;
            let out = ((!self.drop_head && self.head) || full).then(|| self.window());
            if full {
                self.head = false;
                self.advance();
                self.gap = self.step.saturating_sub(self.size);
            }
            if out.is_some() {
                return out;
            }
        }
        if self.drop_tail || self.buff.is_empty() {
            return None;
        }
        let out = self.window();
        self.advance();
        Some(out)
    }
}
