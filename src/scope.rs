//! Context scope: nested key/value frames visible to everything called inside them.
//!
//! Frames live on a per-thread stack and are searched innermost-first, then a process-wide
//! global frame. Keys are dotted paths (`collection.parent`). Frames never cross threads: a
//! worker that runs user code on behalf of another thread re-enters a [`TaskContext`] captured at
//! submission time.
//!
//! The well-known keys [`NAME_KEY`] and [`INDEX_KEY`] carry the operator name and schema index
//! of the dispatch call currently executing.

use std::cell::RefCell;
use std::marker::PhantomData;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::dispatch::Index;
use crate::error::PipelineResult;
use crate::types::{Record, Value};

/// Key holding the dotted operator name of the active dispatch call.
pub const NAME_KEY: &str = "_name";
/// Key holding the schema index of the active dispatch call.
pub const INDEX_KEY: &str = "_index";

thread_local! {
    static FRAMES: RefCell<Vec<Record>> = const { RefCell::new(Vec::new()) };
}

static GLOBAL: Lazy<RwLock<Record>> = Lazy::new(|| RwLock::new(Record::new()));

/// Result of a scope lookup. `Missing` is distinct from a present [`Value::Null`].
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(Value),
    Missing,
}

impl Lookup {
    pub fn is_missing(&self) -> bool {
        matches!(self, Lookup::Missing)
    }

    pub fn value(self) -> Option<Value> {
        match self {
            Lookup::Found(v) => Some(v),
            Lookup::Missing => None,
        }
    }

    pub fn or(self, default: Value) -> Value {
        self.value().unwrap_or(default)
    }
}

/// Pops its frame (and anything pushed above it) when dropped, including during unwinding.
#[must_use = "the frame is popped as soon as the guard is dropped"]
pub struct ScopeGuard {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        FRAMES.with(|frames| frames.borrow_mut().truncate(self.depth));
    }
}

/// Push `frame` onto this thread's scope stack.
pub fn enter(frame: Record) -> ScopeGuard {
    let depth = FRAMES.with(|frames| {
        let mut frames = frames.borrow_mut();
        frames.push(frame);
        frames.len() - 1
    });
    ScopeGuard {
        depth,
        _not_send: PhantomData,
    }
}

/// Push a frame built from dotted `(path, value)` bindings.
pub fn enter_with<I, K, V>(bindings: I) -> PipelineResult<ScopeGuard>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<Value>,
{
    let mut frame = Record::new();
    for (path, value) in bindings {
        frame.set(path.as_ref(), value)?;
    }
    Ok(enter(frame))
}

/// Look `path` up innermost-first, then in the global frame.
///
/// The result is a snapshot: nested records come back as clones, so mutating them does not
/// write through to the frame. Use [`set`] to change a bound value.
pub fn get(path: &str) -> Lookup {
    let local = FRAMES.with(|frames| frames.borrow().iter().rev().find_map(|f| f.get(path)));
    match local.or_else(|| GLOBAL.read().get(path)) {
        Some(v) => Lookup::Found(v),
        None => Lookup::Missing,
    }
}

pub fn get_or(path: &str, default: impl Into<Value>) -> Value {
    get(path).or(default.into())
}

/// Write into the innermost frame, or the global frame when no frame is active.
pub fn set(path: &str, value: impl Into<Value>) -> PipelineResult<()> {
    let value = value.into();
    let pending = FRAMES.with(|frames| match frames.borrow_mut().last_mut() {
        Some(frame) => frame.set(path, value).map(|_| None),
        None => Ok(Some(value)),
    })?;
    match pending {
        Some(value) => set_global(path, value),
        None => Ok(()),
    }
}

pub fn set_global(path: &str, value: impl Into<Value>) -> PipelineResult<()> {
    GLOBAL.write().set(path, value)
}

/// Number of frames on this thread's stack.
pub fn depth() -> usize {
    FRAMES.with(|frames| frames.borrow().len())
}

/// Operator name of the active dispatch call.
pub fn current_name() -> Option<String> {
    match get(NAME_KEY) {
        Lookup::Found(Value::Utf8(s)) => Some(s),
        _ => None,
    }
}

/// Schema index of the active dispatch call.
pub fn current_index() -> Option<Index> {
    get(INDEX_KEY).value().and_then(|v| Index::from_value(&v))
}

/// Snapshot of this thread's frames, re-entered by a worker before it runs user code.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    frames: Vec<Record>,
}

impl TaskContext {
    pub fn capture() -> Self {
        Self {
            frames: FRAMES.with(|frames| frames.borrow().clone()),
        }
    }

    /// Push the captured frames on the current thread.
    pub fn enter(&self) -> ScopeGuard {
        let depth = FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            let depth = frames.len();
            frames.extend(self.frames.iter().cloned());
            depth
        });
        ScopeGuard {
            depth,
            _not_send: PhantomData,
        }
    }
}
