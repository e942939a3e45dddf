//! Dynamic dispatch: building up a dotted operator name and a schema index before calling.
//!
//! A [`DynamicDispatch`] wraps a function taking a [`DispatchPath`]. [`DynamicDispatch::attr`]
//! and [`DynamicDispatch::index`] return new wrappers with the path extended; nothing runs until
//! [`DynamicDispatch::call`], which makes the path visible through [`crate::scope`] and passes it
//! to the function explicitly.
//!
//! ```rust
//! use data_collection::dispatch::DynamicDispatch;
//! use data_collection::operator::OpArgs;
//!
//! let describe = DynamicDispatch::new(|path, _args: OpArgs| {
//!     format!("{:?} {:?}", path.name(), path.schema_index().map(|i| i.to_string()))
//! });
//! let out = describe.attr("image").attr("resize").index(("url", "img")).call(OpArgs::new());
//! assert_eq!(out, r#"Some("image.resize") Some("url, img")"#);
//! ```

use std::fmt;
use std::sync::Arc;

use crate::operator::OpArgs;
use crate::scope;
use crate::types::{Record, Value};

/// One schema index entry: a single column or a group of columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Name(String),
    Group(Vec<String>),
}

impl Key {
    /// A multi-column key.
    pub fn group<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Key::Group(names.into_iter().map(Into::into).collect())
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Key::Group(_))
    }

    /// Column names in declaration order.
    pub fn names(&self) -> Vec<&str> {
        match self {
            Key::Name(n) => vec![n.as_str()],
            Key::Group(ns) => ns.iter().map(String::as_str).collect(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Name(n) => Value::Utf8(n.clone()),
            Key::Group(ns) => Value::list(ns.iter().map(String::as_str)),
        }
    }

    pub fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Utf8(s) => Some(Key::Name(s.clone())),
            Value::List(items) => items
                .iter()
                .map(|i| i.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .map(Key::Group),
            _ => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Name(n) => f.write_str(n),
            Key::Group(ns) => write!(f, "({})", ns.join(", ")),
        }
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::Name(v.to_string())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::Name(v)
    }
}

impl<const N: usize> From<[&str; N]> for Key {
    fn from(v: [&str; N]) -> Self {
        Key::group(v)
    }
}

impl From<Vec<&str>> for Key {
    fn from(v: Vec<&str>) -> Self {
        Key::group(v)
    }
}

/// A schema index: the input key, optionally followed by the output key.
///
/// With a single key the operator reads and writes the same column(s).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Index(Vec<Key>);

impl Index {
    pub fn new(keys: Vec<Key>) -> Self {
        Self(keys)
    }

    pub fn keys(&self) -> &[Key] {
        &self.0
    }

    pub fn input(&self) -> Option<&Key> {
        self.0.first()
    }

    pub fn output(&self) -> Option<&Key> {
        self.0.get(1).or_else(|| self.0.first())
    }

    pub fn to_value(&self) -> Value {
        Value::List(self.0.iter().map(Key::to_value).collect())
    }

    /// Inverse of [`Index::to_value`]; a bare string is a single-key index.
    pub fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Utf8(s) => Some(Index(vec![Key::Name(s.clone())])),
            Value::List(items) => items
                .iter()
                .map(Key::from_value)
                .collect::<Option<Vec<_>>>()
                .map(Index),
            _ => None,
        }
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, key) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}")?;
        }
        Ok(())
    }
}

impl From<&str> for Index {
    fn from(v: &str) -> Self {
        Index(vec![Key::from(v)])
    }
}

impl From<String> for Index {
    fn from(v: String) -> Self {
        Index(vec![Key::from(v)])
    }
}

impl From<Key> for Index {
    fn from(v: Key) -> Self {
        Index(vec![v])
    }
}

impl<A, B> From<(A, B)> for Index
where
    A: Into<Key>,
    B: Into<Key>,
{
    fn from((a, b): (A, B)) -> Self {
        Index(vec![a.into(), b.into()])
    }
}

impl<A, B, C> From<(A, B, C)> for Index
where
    A: Into<Key>,
    B: Into<Key>,
    C: Into<Key>,
{
    fn from((a, b, c): (A, B, C)) -> Self {
        Index(vec![a.into(), b.into(), c.into()])
    }
}

/// Immutable accumulated `(name, index)` of a dispatch chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchPath {
    name: Option<String>,
    index: Option<Index>,
}

impl DispatchPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            index: None,
        }
    }

    /// Extend the dotted name by one segment.
    pub fn attr(&self, segment: &str) -> Self {
        let name = match &self.name {
            Some(n) => format!("{n}.{segment}"),
            None => segment.to_string(),
        };
        Self {
            name: Some(name),
            index: self.index.clone(),
        }
    }

    /// Replace the schema index.
    pub fn index(&self, index: impl Into<Index>) -> Self {
        Self {
            name: self.name.clone(),
            index: Some(index.into()),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn schema_index(&self) -> Option<&Index> {
        self.index.as_ref()
    }

    /// First dotted segment and the remainder, if any.
    pub fn head_tail(&self) -> Option<(&str, Option<&str>)> {
        let name = self.name.as_deref()?;
        Some(match name.split_once('.') {
            Some((head, tail)) => (head, Some(tail)),
            None => (name, None),
        })
    }

    /// The scope frame a call through this path runs in.
    pub fn frame(&self) -> Record {
        let mut frame = Record::new();
        if let Some(name) = &self.name {
            frame = frame.with(scope::NAME_KEY, name.as_str());
        }
        if let Some(index) = &self.index {
            frame = frame.with(scope::INDEX_KEY, index.to_value());
        }
        frame
    }
}

type DispatchFn<R> = dyn Fn(&DispatchPath, OpArgs) -> R + Send + Sync;

/// A function whose name and index are built up by chaining before it is called.
pub struct DynamicDispatch<R> {
    func: Arc<DispatchFn<R>>,
    path: DispatchPath,
}

impl<R> Clone for DynamicDispatch<R> {
    fn clone(&self) -> Self {
        Self {
            func: Arc::clone(&self.func),
            path: self.path.clone(),
        }
    }
}

impl<R> DynamicDispatch<R> {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&DispatchPath, OpArgs) -> R + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            path: DispatchPath::new(),
        }
    }

    pub fn attr(&self, segment: &str) -> Self {
        Self {
            func: Arc::clone(&self.func),
            path: self.path.attr(segment),
        }
    }

    pub fn index(&self, index: impl Into<Index>) -> Self {
        Self {
            func: Arc::clone(&self.func),
            path: self.path.index(index),
        }
    }

    pub fn path(&self) -> &DispatchPath {
        &self.path
    }

    /// Invoke the wrapped function with the accumulated path in scope.
    pub fn call(&self, args: OpArgs) -> R {
        let _frame = scope::enter(self.path.frame());
        (self.func)(&self.path, args)
    }
}

impl<R> fmt::Debug for DynamicDispatch<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicDispatch")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::{DispatchPath, DynamicDispatch, Index, Key};
    use crate::operator::OpArgs;
    use crate::scope;
    use crate::types::Value;

    #[test]
    fn chaining_never_invokes_the_function() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let w = DynamicDispatch::new(move |_p, _a| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let chained = w.attr("a").attr("b").index("x");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        chained.call(OpArgs::new());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wrappers_are_immutable() {
        let w = DynamicDispatch::new(|p: &DispatchPath, _a| p.clone());
        let a = w.attr("a");
        let ab = a.attr("b");
        assert_eq!(a.path().name(), Some("a"));
        assert_eq!(ab.path().name(), Some("a.b"));
        assert_eq!(w.path().name(), None);
    }

    #[test]
    fn call_exposes_name_and_index_through_scope() {
        let w = DynamicDispatch::new(|_p, _a| (scope::current_name(), scope::current_index()));
        let (name, index) = w.attr("image_decode").index(("path", "img")).call(OpArgs::new());
        assert_eq!(name.as_deref(), Some("image_decode"));
        assert_eq!(index, Some(Index::from(("path", "img"))));
        assert_eq!(scope::current_name(), None);
    }

    #[test]
    fn unset_name_and_index_are_none() {
        let w = DynamicDispatch::new(|p: &DispatchPath, _a| (p.name().is_none(), p.schema_index().is_none()));
        assert_eq!(w.call(OpArgs::new()), (true, true));
    }

    #[test]
    fn index_round_trips_through_values() {
        let index = Index::from((["a", "b"], "c"));
        assert_eq!(index.input(), Some(&Key::group(["a", "b"])));
        assert_eq!(index.output(), Some(&Key::from("c")));
        assert_eq!(Index::from_value(&index.to_value()), Some(index));
        assert_eq!(Index::from_value(&Value::from("x")), Some(Index::from("x")));
    }

    #[test]
    fn single_key_reads_and_writes_same_column() {
        let index = Index::from("a");
        assert_eq!(index.input(), index.output());
    }

    #[test]
    fn head_tail_splits_first_segment() {
        let p = DispatchPath::named("ops.text.split");
        assert_eq!(p.head_tail(), Some(("ops", Some("text.split"))));
        assert_eq!(DispatchPath::named("f").head_tail(), Some(("f", None)));
    }
}
