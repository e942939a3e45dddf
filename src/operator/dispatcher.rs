//! Resolution of dispatched operator names.
//!
//! Given a [`DispatchPath`] and the caller's [`Bindings`], [`resolve`] tries in order:
//!
//! 1. the pipeline's JIT compiler, if one is configured
//! 2. a local (then global) binding named by the first path segment, walking nested namespaces
//!    for the rest of the path; a binding to the operator namespace itself ([`Binding::Ops`])
//!    resolves the remaining path against the registry
//! 3. the registry, under the full dotted name
//!
//! The result is an already constructed [`LazyOperator`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::dispatch::DispatchPath;
use crate::error::{PipelineError, PipelineResult};
use crate::types::Value;

use super::jit::JitCompiler;
use super::registry::Factory;
use super::{FnOperator, LazyOperator, OpArgs, Operator, OperatorClass};

/// Something a name can be bound to in the caller's environment.
#[derive(Clone)]
pub enum Binding {
    /// A callable, used as-is.
    Function(Arc<dyn Operator>),
    /// A class, instantiated with the call's arguments.
    Class(Factory),
    /// A module-like container of further bindings.
    Namespace(Namespace),
    /// The registry-backed operator namespace.
    Ops,
    /// A non-callable value. Resolution skips it.
    Data(Value),
}

impl Binding {
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Binding::Function(Arc::new(FnOperator::from_fn(f)))
    }

    pub fn operator<O: Operator + 'static>(op: O) -> Self {
        Binding::Function(Arc::new(op))
    }

    pub fn class<T: OperatorClass>() -> Self {
        Binding::Class(Arc::new(|args: &OpArgs| {
            let op: Arc<dyn Operator> = Arc::new(T::construct(args)?);
            Ok(op)
        }))
    }

    /// Follow a dotted attribute path through nested namespaces.
    fn walk(&self, path: &str) -> Option<&Binding> {
        let mut current = self;
        for segment in path.split('.') {
            current = match current {
                Binding::Namespace(ns) => ns.get(segment)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Function(_) => f.write_str("Function"),
            Binding::Class(_) => f.write_str("Class"),
            Binding::Namespace(ns) => f.debug_tuple("Namespace").field(ns).finish(),
            Binding::Ops => f.write_str("Ops"),
            Binding::Data(v) => f.debug_tuple("Data").field(v).finish(),
        }
    }
}

/// Named members, possibly nested.
#[derive(Clone, Default)]
pub struct Namespace {
    members: HashMap<String, Binding>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, binding: Binding) -> Self {
        self.members.insert(name.into(), binding);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.members.get(name)
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.members.keys().collect();
        names.sort();
        f.debug_set().entries(names).finish()
    }
}

/// The caller's visible names. Locals shadow globals.
#[derive(Clone, Default, Debug)]
pub struct Bindings {
    locals: HashMap<String, Binding>,
    globals: HashMap<String, Binding>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local(mut self, name: impl Into<String>, binding: Binding) -> Self {
        self.locals.insert(name.into(), binding);
        self
    }

    pub fn global(mut self, name: impl Into<String>, binding: Binding) -> Self {
        self.globals.insert(name.into(), binding);
        self
    }

    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        self.locals.get(name).or_else(|| self.globals.get(name))
    }
}

/// Resolve `path` to a constructed operator.
pub fn resolve(
    path: &DispatchPath,
    args: &OpArgs,
    bindings: &Bindings,
    jit: Option<&dyn JitCompiler>,
) -> PipelineResult<LazyOperator> {
    let Some((head, tail)) = path.head_tail() else {
        return Err(PipelineError::mode("dispatch", "an operator name is required"));
    };
    let name = path.name().unwrap_or(head);
    let index = path.schema_index().cloned();

    if let Some(jit) = jit {
        match jit.compile(path, args) {
            Ok(Some(op)) => {
                debug!(operator = name, jit = jit.name(), "resolved through jit");
                return Ok(LazyOperator::from_instance(op, name, index));
            }
            Ok(None) => {}
            Err(e) => warn!(operator = name, jit = jit.name(), error = %e, "jit compilation failed, falling back"),
        }
    }

    if let Some(binding) = bindings.lookup(head) {
        if let Binding::Ops = binding {
            let Some(tail) = tail else {
                return Err(PipelineError::Resolution { name: name.to_string() });
            };
            debug!(operator = tail, "resolving through operator namespace binding");
            return LazyOperator::new(tail, index, args.clone(), true);
        }
        let target = match tail {
            Some(tail) => binding.walk(tail),
            None => Some(binding),
        };
        match target {
            Some(Binding::Function(op)) => {
                if !args.is_empty() {
                    return Err(PipelineError::construction(
                        name,
                        "functions take no construction arguments",
                    ));
                }
                debug!(operator = name, "resolved from bindings");
                return Ok(LazyOperator::from_instance(Arc::clone(op), name, index));
            }
            Some(Binding::Class(factory)) => {
                debug!(operator = name, "instantiating class from bindings");
                let op = factory(args)?;
                return Ok(LazyOperator::from_instance(op, name, index));
            }
            _ => {}
        }
    }

    LazyOperator::new(name, index, args.clone(), true)
}

#[cfg(test)]
mod tests {
    use super::{Binding, Bindings, Namespace, resolve};
    use crate::dispatch::DispatchPath;
    use crate::error::PipelineError;
    use crate::operator::jit::VectorizeJit;
    use crate::operator::registry::register_fn;
    use crate::operator::{OpArgs, OperatorState};
    use crate::types::Value;

    fn plus(n: i64) -> Binding {
        Binding::function(move |v| Value::Int64(v.as_i64().unwrap_or(0) + n))
    }

    fn apply(path: &str, bindings: &Bindings, x: i64) -> Value {
        resolve(&DispatchPath::named(path), &OpArgs::new(), bindings, None)
            .unwrap()
            .call(Value::from(x))
            .unwrap()
    }

    #[test]
    fn locals_shadow_globals() {
        let bindings = Bindings::new().local("f", plus(1)).global("f", plus(100));
        assert_eq!(apply("f", &bindings, 1), Value::Int64(2));
        let globals_only = Bindings::new().global("f", plus(100));
        assert_eq!(apply("f", &globals_only, 1), Value::Int64(101));
    }

    #[test]
    fn nested_namespaces_are_walked() {
        let math = Namespace::new().with("ops", Binding::Namespace(Namespace::new().with("inc", plus(1))));
        let bindings = Bindings::new().global("math", Binding::Namespace(math));
        assert_eq!(apply("math.ops.inc", &bindings, 4), Value::Int64(5));
    }

    #[test]
    fn ops_binding_goes_to_registry_with_tail() {
        register_fn("dispatcher_test_neg", |v| Value::Int64(-v.as_i64().unwrap_or(0)));
        let bindings = Bindings::new().local("ops", Binding::Ops);
        assert_eq!(apply("ops.dispatcher_test_neg", &bindings, 3), Value::Int64(-3));
    }

    #[test]
    fn local_named_ops_is_not_the_namespace() {
        let bindings = Bindings::new().local("ops", plus(7));
        assert_eq!(apply("ops", &bindings, 0), Value::Int64(7));
    }

    #[test]
    fn unknown_member_falls_back_to_registry_full_name() {
        register_fn("dispatcher_test_pkg.double", |v| Value::Int64(v.as_i64().unwrap_or(0) * 2));
        let bindings = Bindings::new().local("dispatcher_test_pkg", Binding::Namespace(Namespace::new()));
        assert_eq!(apply("dispatcher_test_pkg.double", &bindings, 5), Value::Int64(10));
    }

    #[test]
    fn data_bindings_are_skipped() {
        register_fn("dispatcher_test_data", |_| Value::from("registry"));
        let bindings = Bindings::new().local("dispatcher_test_data", Binding::Data(Value::from(1)));
        assert_eq!(apply("dispatcher_test_data", &bindings, 0), Value::from("registry"));
    }

    #[test]
    fn unresolvable_name_is_fatal() {
        let err = resolve(
            &DispatchPath::named("dispatcher_test_nothing"),
            &OpArgs::new(),
            &Bindings::new(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Resolution { .. }));
    }

    #[test]
    fn jit_is_tried_first() {
        register_fn("dispatcher_test_jit", |v| v);
        let bindings = Bindings::new().local("dispatcher_test_jit", plus(1));
        let op = resolve(
            &DispatchPath::named("dispatcher_test_jit"),
            &OpArgs::new(),
            &bindings,
            Some(&VectorizeJit),
        )
        .unwrap();
        assert!(op.capabilities().unwrap().vectorized);
        assert_eq!(op.state(), OperatorState::Ready);
        assert_eq!(op.call(Value::from(3)).unwrap(), Value::Int64(3));
    }
}
