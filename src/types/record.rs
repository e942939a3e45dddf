use std::fmt;
use std::sync::Arc;

use crate::column::Table;
use crate::error::{PipelineError, PipelineResult};

use super::Value;

/// A schema'd element: an ordered field-name → value mapping.
///
/// A record either owns its fields or is a view of one row of a shared [`Table`]. Reading a view
/// field dereferences into the table; writing one replaces (or adds) that column in the table, so
/// every other view over the same table observes the write.
///
/// Field paths may be dotted (`user.name`) to reach nested records.
#[derive(Clone)]
pub struct Record {
    repr: Repr,
}

#[derive(Clone)]
enum Repr {
    Owned(Vec<(String, Value)>),
    View(EntityView),
}

/// A row offset into a shared column table.
#[derive(Clone)]
pub struct EntityView {
    table: Arc<Table>,
    row: usize,
}

impl EntityView {
    pub fn new(table: Arc<Table>, row: usize) -> Self {
        Self { table, row }
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn row(&self) -> usize {
        self.row
    }
}

impl Record {
    /// An empty owned record.
    pub fn new() -> Self {
        Self {
            repr: Repr::Owned(Vec::new()),
        }
    }

    /// Build an owned record from `(name, value)` pairs. Later duplicates overwrite earlier ones.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let mut fields: Vec<(String, Value)> = Vec::new();
        for (k, v) in pairs {
            let (k, v) = (k.into(), v.into());
            match fields.iter_mut().find(|(name, _)| *name == k) {
                Some(slot) => slot.1 = v,
                None => fields.push((k, v)),
            }
        }
        Self {
            repr: Repr::Owned(fields),
        }
    }

    /// A view of row `row` of `table`.
    pub fn view(table: Arc<Table>, row: usize) -> Self {
        Self {
            repr: Repr::View(EntityView::new(table, row)),
        }
    }

    /// Builder form of a top-level field write on an owned record.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let (name, value) = (name.into(), value.into());
        match &mut self.repr {
            Repr::Owned(fields) => put(fields, name, value),
            Repr::View(view) => {
                let mut fields = view.table.row_pairs(view.row);
                put(&mut fields, name, value);
                self.repr = Repr::Owned(fields);
            }
        }
        self
    }

    pub fn is_view(&self) -> bool {
        matches!(self.repr, Repr::View(_))
    }

    /// The backing view, if this record is a table view.
    pub fn as_view(&self) -> Option<&EntityView> {
        match &self.repr {
            Repr::View(v) => Some(v),
            Repr::Owned(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Owned(fields) => fields.len(),
            Repr::View(view) => view.table.column_names().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Field names in order.
    pub fn field_names(&self) -> Vec<String> {
        match &self.repr {
            Repr::Owned(fields) => fields.iter().map(|(k, _)| k.clone()).collect(),
            Repr::View(view) => view.table.column_names(),
        }
    }

    /// Read a field by (possibly dotted) path.
    pub fn get(&self, path: &str) -> Option<Value> {
        if let Some(v) = self.field(path) {
            return Some(v);
        }
        let (head, rest) = path.split_once('.')?;
        let mut current = self.field(head)?;
        for segment in rest.split('.') {
            current = match current {
                Value::Record(r) => r.field(segment)?,
                _ => return None,
            };
        }
        Some(current)
    }

    fn field(&self, name: &str) -> Option<Value> {
        match &self.repr {
            Repr::Owned(fields) => fields.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone()),
            Repr::View(view) => view.table.value(view.row, name),
        }
    }

    /// Write a field by (possibly dotted) path, creating intermediate records as needed.
    ///
    /// Fails if an intermediate segment holds a non-record value.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> PipelineResult<()> {
        let value = value.into();
        let exact = self.field(path).is_some();
        match path.split_once('.') {
            Some((head, rest)) if !exact => {
                let mut nested = match self.field(head) {
                    Some(Value::Record(r)) => r,
                    None | Some(Value::Null) => Record::new(),
                    Some(other) => {
                        return Err(PipelineError::schema(format!(
                            "cannot set '{path}': '{head}' holds {other}, not a record"
                        )));
                    }
                };
                nested.set(rest, value)?;
                self.put_field(head, Value::Record(nested))
            }
            _ => self.put_field(path, value),
        }
    }

    fn put_field(&mut self, name: &str, value: Value) -> PipelineResult<()> {
        match &mut self.repr {
            Repr::Owned(fields) => {
                put(fields, name.to_string(), value);
                Ok(())
            }
            Repr::View(view) => view.table.set_value(view.row, name, value),
        }
    }

    /// Materialize into an owned record. Owned records are cloned as-is.
    pub fn to_owned_record(&self) -> Record {
        Record {
            repr: Repr::Owned(self.to_pairs()),
        }
    }

    /// Snapshot of all fields as `(name, value)` pairs.
    pub fn to_pairs(&self) -> Vec<(String, Value)> {
        match &self.repr {
            Repr::Owned(fields) => fields.clone(),
            Repr::View(view) => view.table.row_pairs(view.row),
        }
    }
}

fn put(fields: &mut Vec<(String, Value)>, name: String, value: Value) {
    match fields.iter_mut().find(|(k, _)| *k == name) {
        Some(slot) => slot.1 = value,
        None => fields.push((name, value)),
    }
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.to_pairs() == other.to_pairs()
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in self.to_pairs() {
            map.entry(&k, &v);
        }
        map.finish()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.to_pairs().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{k}: {v}")?;
        }
        write!(f, "}}")
    }
}
