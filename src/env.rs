//! Lexical environments
//!
//! Environments form a parent-linked chain. Each frame has two maps:
//! `variables` (bindings made by directives) and `parameters` (frame-local
//! executable arguments, resolved first). Child frames are created for
//! executable invocation, pipeline stages, for-loop iterations, and import
//! evaluation. Shared caches live on the interpreter, not here; an
//! environment is purely lexical state.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::MlldError;
use crate::variable::Variable;

pub type EnvRef = Rc<RefCell<Environment>>;

#[derive(Debug, Default)]
pub struct Environment {
    parent: Option<EnvRef>,
    variables: IndexMap<String, Variable>,
    parameters: IndexMap<String, Variable>,
    /// Parallel iterations run in sealed frames: writes that would land in
    /// an outer frame are rejected instead of propagated
    sealed: bool,
}

impl Environment {
    pub fn new_root() -> EnvRef {
        Rc::new(RefCell::new(Environment::default()))
    }

    pub fn child_of(parent: &EnvRef) -> EnvRef {
        Rc::new(RefCell::new(Environment {
            parent: Some(Rc::clone(parent)),
            ..Environment::default()
        }))
    }

    /// A child frame that refuses rebinding of outer names (parallel for)
    pub fn sealed_child_of(parent: &EnvRef) -> EnvRef {
        let child = Environment::child_of(parent);
        child.borrow_mut().sealed = true;
        child
    }

    pub fn parent(&self) -> Option<&EnvRef> {
        self.parent.as_ref()
    }

    /// Bind a variable in this frame. Later bindings shadow outer frames;
    /// executables are immutable once defined.
    pub fn define(&mut self, variable: Variable) -> Result<(), MlldError> {
        if let Some(existing) = self.variables.get(&variable.name) {
            if existing.is_executable() {
                return Err(MlldError::resolution(format!(
                    "executable @{} cannot be redefined",
                    variable.name
                )));
            }
        }
        if self.sealed && self.variables.get(&variable.name).is_none() {
            // A name that exists only in an outer frame is an outward write
            if lookup_parent(&self.parent, &variable.name).is_some() {
                return Err(MlldError::resolution(format!(
                    "cannot rebind @{} from inside a parallel iteration",
                    variable.name
                )));
            }
        }
        self.variables.insert(variable.name.clone(), variable);
        Ok(())
    }

    /// Bind a parameter in this frame; parameters shadow variables
    pub fn define_parameter(&mut self, variable: Variable) {
        self.parameters.insert(variable.name.clone(), variable);
    }

    /// Resolve through the chain: parameters, then variables, then parent
    pub fn resolve(&self, name: &str) -> Option<Variable> {
        if let Some(var) = self.parameters.get(name) {
            return Some(var.clone());
        }
        if let Some(var) = self.variables.get(name) {
            return Some(var.clone());
        }
        lookup_parent(&self.parent, name)
    }

    pub fn has_local(&self, name: &str) -> bool {
        self.parameters.contains_key(name) || self.variables.contains_key(name)
    }

    /// Bindings of this frame only, in definition order; the export surface
    /// of a module
    pub fn local_variables(&self) -> Vec<Variable> {
        self.variables
            .values()
            .filter(|v| !v.metadata.is_system)
            .cloned()
            .collect()
    }

    pub fn remove(&mut self, name: &str) -> Option<Variable> {
        self.variables.shift_remove(name)
    }
}

fn lookup_parent(parent: &Option<EnvRef>, name: &str) -> Option<Variable> {
    let mut cursor = parent.clone();
    while let Some(env) = cursor {
        let borrowed = env.borrow();
        if let Some(var) = borrowed.parameters.get(name) {
            return Some(var.clone());
        }
        if let Some(var) = borrowed.variables.get(name) {
            return Some(var.clone());
        }
        cursor = borrowed.parent.clone();
    }
    None
}

/// Explicit home for the interpreter's debug counters and error-dedup set,
/// so tests can construct isolated instances
#[derive(Debug, Default)]
pub struct RuntimeDiagnostics {
    seen_errors: RefCell<rustc_hash::FxHashSet<String>>,
    pub dedup_disabled: bool,
}

impl RuntimeDiagnostics {
    pub fn new(dedup_disabled: bool) -> Self {
        Self {
            seen_errors: RefCell::new(rustc_hash::FxHashSet::default()),
            dedup_disabled,
        }
    }

    /// True the first time a given error rendering is reported
    pub fn first_report(&self, rendered: &str) -> bool {
        if self.dedup_disabled {
            return true;
        }
        self.seen_errors.borrow_mut().insert(rendered.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn child_resolves_through_parent_unless_shadowed() {
        let root = Environment::new_root();
        root.borrow_mut()
            .define(Variable::simple_text("x", "outer"))
            .unwrap();
        let child = Environment::child_of(&root);
        assert_eq!(
            child.borrow().resolve("x").unwrap().value.as_str(),
            Some("outer")
        );
        child
            .borrow_mut()
            .define(Variable::simple_text("x", "inner"))
            .unwrap();
        assert_eq!(
            child.borrow().resolve("x").unwrap().value.as_str(),
            Some("inner")
        );
        assert_eq!(
            root.borrow().resolve("x").unwrap().value.as_str(),
            Some("outer")
        );
    }

    #[test]
    fn parameters_shadow_variables() {
        let env = Environment::new_root();
        env.borrow_mut()
            .define(Variable::simple_text("x", "var"))
            .unwrap();
        env.borrow_mut()
            .define_parameter(Variable::simple_text("x", "param"));
        assert_eq!(
            env.borrow().resolve("x").unwrap().value.as_str(),
            Some("param")
        );
    }

    #[test]
    fn executables_are_immutable() {
        let env = Environment::new_root();
        env.borrow_mut()
            .define(Variable::executable("f", Value::Null))
            .unwrap();
        let err = env
            .borrow_mut()
            .define(Variable::simple_text("f", "shadow"))
            .unwrap_err();
        assert!(err.to_string().contains("cannot be redefined"));
    }

    #[test]
    fn sealed_frames_reject_outward_writes() {
        let root = Environment::new_root();
        root.borrow_mut()
            .define(Variable::simple_text("total", "0"))
            .unwrap();
        let iteration = Environment::sealed_child_of(&root);
        let err = iteration
            .borrow_mut()
            .define(Variable::simple_text("total", "1"))
            .unwrap_err();
        assert!(err.to_string().contains("parallel iteration"));
        // Fresh names are still fine
        iteration
            .borrow_mut()
            .define(Variable::simple_text("local", "ok"))
            .unwrap();
    }
}
