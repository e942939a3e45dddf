//! Process-wide operator registry.
//!
//! Registration is expected at startup; resolution happens when operators are first needed.
//! Entries are never removed. Re-registering a name overwrites the previous entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::types::Value;

use super::{FnOperator, OpArgs, Operator, OperatorClass};

/// Suffix under which plain functions are registered a second time.
pub const FUNC_SUFFIX: &str = "_func";

/// Builds a fresh operator instance from construction arguments.
pub type Factory = Arc<dyn Fn(&OpArgs) -> PipelineResult<Arc<dyn Operator>> + Send + Sync>;

/// A registered operator.
#[derive(Clone)]
pub enum RegistryEntry {
    /// A plain function; every resolution returns the same instance.
    Function(Arc<dyn Operator>),
    /// A callable object adapted to an operator; every resolution returns the same instance.
    Callable(Arc<dyn Operator>),
    /// A class; every resolution constructs a new instance.
    Class(Factory),
}

impl RegistryEntry {
    pub fn is_class(&self) -> bool {
        matches!(self, RegistryEntry::Class(_))
    }

    /// Produce an operator instance. Functions and callables take no construction arguments.
    pub fn construct(&self, name: &str, args: &OpArgs) -> PipelineResult<Arc<dyn Operator>> {
        match self {
            RegistryEntry::Function(op) | RegistryEntry::Callable(op) => {
                if !args.is_empty() {
                    return Err(PipelineError::construction(
                        name,
                        "functions and callables take no construction arguments",
                    ));
                }
                Ok(Arc::clone(op))
            }
            RegistryEntry::Class(factory) => factory(args),
        }
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryEntry::Function(_) => f.write_str("Function"),
            RegistryEntry::Callable(_) => f.write_str("Callable"),
            RegistryEntry::Class(_) => f.write_str("Class"),
        }
    }
}

static REGISTRY: Lazy<RwLock<HashMap<String, RegistryEntry>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn insert(name: &str, entry: RegistryEntry) {
    debug!(operator = name, kind = ?entry, "registering operator");
    REGISTRY.write().insert(name.to_string(), entry);
}

/// Register a function under `name` and `name_func`.
pub fn register_fn<F>(name: &str, f: F)
where
    F: Fn(Value) -> Value + Send + Sync + 'static,
{
    register_operator_fn(name, Arc::new(FnOperator::from_fn(f)));
}

/// Register a fallible function under `name` and `name_func`.
pub fn register_try_fn<F>(name: &str, f: F)
where
    F: Fn(Value) -> PipelineResult<Value> + Send + Sync + 'static,
{
    register_operator_fn(name, Arc::new(FnOperator::try_from_fn(f)));
}

fn register_operator_fn(name: &str, op: Arc<dyn Operator>) {
    insert(name, RegistryEntry::Function(Arc::clone(&op)));
    insert(&format!("{name}{FUNC_SUFFIX}"), RegistryEntry::Function(op));
}

/// Register an already-built operator object. All resolutions share it.
pub fn register_callable<O>(name: &str, op: O)
where
    O: Operator + 'static,
{
    insert(name, RegistryEntry::Callable(Arc::new(op)));
}

/// Register an operator class, constructed per resolution.
pub fn register_class<T: OperatorClass>(name: &str) {
    let factory: Factory = Arc::new(|args: &OpArgs| {
        let op: Arc<dyn Operator> = Arc::new(T::construct(args)?);
        Ok(op)
    });
    insert(name, RegistryEntry::Class(factory));
}

/// Register a custom factory.
pub fn register_factory<F>(name: &str, factory: F)
where
    F: Fn(&OpArgs) -> PipelineResult<Arc<dyn Operator>> + Send + Sync + 'static,
{
    insert(name, RegistryEntry::Class(Arc::new(factory)));
}

pub fn resolve(name: &str) -> Option<RegistryEntry> {
    REGISTRY.read().get(name).cloned()
}

/// The function entry registered for `name`, bypassing any class of the same name.
pub fn resolve_function(name: &str) -> Option<RegistryEntry> {
    resolve(&format!("{name}{FUNC_SUFFIX}"))
}

pub fn contains(name: &str) -> bool {
    REGISTRY.read().contains_key(name)
}

/// Registered names, sorted.
pub fn names() -> Vec<String> {
    let mut names: Vec<String> = REGISTRY.read().keys().cloned().collect();
    names.sort();
    names
}

/// Resolve `name` and build an instance with `args`.
pub fn construct(name: &str, args: &OpArgs) -> PipelineResult<Arc<dyn Operator>> {
    let entry = resolve(name).ok_or_else(|| PipelineError::Resolution {
        name: name.to_string(),
    })?;
    entry.construct(name, args)
}

#[cfg(test)]
mod tests {
    use super::{
        construct, contains, register_callable, register_class, register_fn, resolve,
        resolve_function,
    };
    use crate::error::{PipelineError, PipelineResult};
    use crate::operator::{FnOperator, OpArgs, Operator, OperatorClass};
    use crate::types::Value;

    struct Scale {
        factor: f64,
    }

    impl Operator for Scale {
        fn call(&self, args: &[Value]) -> PipelineResult<Value> {
            let x = args[0]
                .as_f64()
                .ok_or_else(|| PipelineError::execution("expected a number"))?;
            Ok(Value::Float64(x * self.factor))
        }
    }

    impl OperatorClass for Scale {
        fn construct(args: &OpArgs) -> PipelineResult<Self> {
            let factor = args
                .get("factor")
                .or_else(|| args.nth(0))
                .and_then(Value::as_f64)
                .unwrap_or(1.0);
            Ok(Scale { factor })
        }
    }

    #[test]
    fn function_is_registered_twice() {
        register_fn("registry_test_inc", |v| Value::Int64(v.as_i64().unwrap_or(0) + 1));
        assert!(contains("registry_test_inc"));
        assert!(contains("registry_test_inc_func"));

        let op = construct("registry_test_inc", &OpArgs::new()).unwrap();
        assert_eq!(op.call(&[Value::from(1)]).unwrap(), Value::Int64(2));
    }

    #[test]
    fn class_shadows_name_but_not_func_entry() {
        register_fn("registry_test_shadow", |v| v);
        register_class::<Scale>("registry_test_shadow");

        assert!(resolve("registry_test_shadow").unwrap().is_class());
        assert!(!resolve_function("registry_test_shadow").unwrap().is_class());
    }

    #[test]
    fn class_is_constructed_with_args() {
        register_class::<Scale>("registry_test_scale");
        let op = construct("registry_test_scale", &OpArgs::new().kwarg("factor", 3.0)).unwrap();
        assert_eq!(op.call(&[Value::from(2)]).unwrap(), Value::Float64(6.0));
    }

    #[test]
    fn callables_are_shared_and_reject_args() {
        register_callable("registry_test_callable", FnOperator::from_fn(|v| v));
        let err = construct("registry_test_callable", &OpArgs::new().arg(1)).err().unwrap();
        assert!(matches!(err, PipelineError::Construction { .. }));
    }

    #[test]
    fn unknown_names_fail_resolution() {
        let err = construct("registry_test_nope", &OpArgs::new()).err().unwrap();
        assert_eq!(err.to_string(), "failed to load operator `registry_test_nope`");
    }
}
