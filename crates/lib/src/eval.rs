//! Evaluator interface.
//!
//! Manifests are expressions in the embedder's configuration language; this
//! crate never interprets that language itself. The [`Evaluator`] trait is
//! the seam: it evaluates a manifest file to a [`Value`], parses glue
//! expressions, and applies functions. [`EvalState`] bundles the evaluator
//! with the other collaborators a resolution needs — the store, the
//! transport backend, and the registry — plus the set of filesystem paths
//! evaluation is allowed to touch.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::trace;

use floc_core::fetch::Fetcher;
use floc_core::registry::Registry;
use floc_core::store::Store;

/// An error reported by the evaluator.
#[derive(Debug, Error)]
#[error("evaluation error: {message}")]
pub struct EvalError {
  pub message: String,
}

impl EvalError {
  pub fn new(message: impl Into<String>) -> Self {
    EvalError { message: message.into() }
  }
}

/// An evaluated value, as far as the resolution core needs to see it.
///
/// Function values stay opaque: the core only reads a lambda's formal
/// parameter names and hands the value back to the evaluator for calls.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Null,
  Bool(bool),
  Int(i64),
  String(String),
  List(Vec<Value>),
  Attrs(BTreeMap<String, Value>),
  Lambda(Lambda),
}

/// An opaque function value.
#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
  /// Names of the formal parameters, when the function destructures an
  /// attribute set; empty otherwise.
  pub formals: Vec<String>,
  /// Evaluator-private identifier for the underlying function.
  pub handle: u64,
}

impl Value {
  pub fn attrs(entries: impl IntoIterator<Item = (String, Value)>) -> Value {
    Value::Attrs(entries.into_iter().collect())
  }

  pub fn string(s: impl Into<String>) -> Value {
    Value::String(s.into())
  }

  pub fn as_attrs(&self) -> Option<&BTreeMap<String, Value>> {
    match self {
      Value::Attrs(attrs) => Some(attrs),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Value::Bool(b) => Some(*b),
      _ => None,
    }
  }

  /// Name of the value's type, for error messages.
  pub fn type_name(&self) -> &'static str {
    match self {
      Value::Null => "null",
      Value::Bool(_) => "bool",
      Value::Int(_) => "int",
      Value::String(_) => "string",
      Value::List(_) => "list",
      Value::Attrs(_) => "attribute set",
      Value::Lambda(_) => "function",
    }
  }
}

/// The evaluation operations the resolution core consumes.
pub trait Evaluator {
  /// Evaluate a manifest file to a value.
  fn eval_file(&mut self, path: &Path) -> Result<Value, EvalError>;

  /// Parse (but do not apply) an expression, returning a callable value.
  fn parse_expr(&mut self, src: &str) -> Result<Value, EvalError>;

  /// Apply a function value to one argument.
  fn call_function(&mut self, f: &Value, arg: Value) -> Result<Value, EvalError>;
}

/// Everything a resolution needs: evaluator, store, transport, registry,
/// and the sandbox bookkeeping shared with the evaluator.
pub struct EvalState<'a> {
  pub store: &'a dyn Store,
  pub fetcher: &'a dyn Fetcher,
  pub registry: &'a dyn Registry,
  pub eval: &'a mut dyn Evaluator,
  /// Paths evaluation may read. `None` means unrestricted. The set only
  /// grows; fetched trees are added as they are unpacked.
  pub allowed_paths: Option<BTreeSet<PathBuf>>,
}

impl<'a> EvalState<'a> {
  pub fn new(
    store: &'a dyn Store,
    fetcher: &'a dyn Fetcher,
    registry: &'a dyn Registry,
    eval: &'a mut dyn Evaluator,
  ) -> Self {
    EvalState {
      store,
      fetcher,
      registry,
      eval,
      allowed_paths: None,
    }
  }

  /// Mark a fetched tree as readable by the evaluator.
  pub fn allow_path(&mut self, path: &Path) {
    if let Some(allowed) = &mut self.allowed_paths {
      trace!(path = %path.display(), "allowing path for evaluation");
      allowed.insert(path.to_path_buf());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  mod value {
    use super::*;

    #[test]
    fn typed_accessors() {
      assert_eq!(Value::string("x").as_str(), Some("x"));
      assert_eq!(Value::Bool(true).as_bool(), Some(true));
      assert!(Value::Null.as_attrs().is_none());
    }

    #[test]
    fn type_names() {
      assert_eq!(Value::Null.type_name(), "null");
      assert_eq!(Value::attrs([]).type_name(), "attribute set");
      assert_eq!(
        Value::Lambda(Lambda {
          formals: vec![],
          handle: 0
        })
        .type_name(),
        "function"
      );
    }
  }

  mod eval_state {
    use super::*;
    use floc_core::registry::MemoryRegistry;
    use floc_core::store::LocalStore;

    struct NullEval;
    impl Evaluator for NullEval {
      fn eval_file(&mut self, _path: &Path) -> Result<Value, EvalError> {
        Ok(Value::Null)
      }
      fn parse_expr(&mut self, _src: &str) -> Result<Value, EvalError> {
        Ok(Value::Null)
      }
      fn call_function(&mut self, _f: &Value, _arg: Value) -> Result<Value, EvalError> {
        Ok(Value::Null)
      }
    }

    struct NullFetcher;
    impl Fetcher for NullFetcher {
      fn fetch(
        &self,
        _store: &dyn Store,
        input: &floc_core::input::Input,
      ) -> Result<(floc_core::fetch::Tree, floc_core::input::Input), floc_core::fetch::FetchError> {
        Err(floc_core::fetch::FetchError::UnsupportedInput { url: input.to_string() })
      }
    }

    #[test]
    fn allow_path_is_noop_when_unrestricted() {
      let store = LocalStore::new("/tmp/floc-store");
      let registry = MemoryRegistry::new();
      let mut eval = NullEval;
      let mut state = EvalState::new(&store, &NullFetcher, &registry, &mut eval);

      state.allow_path(Path::new("/some/tree"));
      assert!(state.allowed_paths.is_none());
    }

    #[test]
    fn allow_path_grows_the_set() {
      let store = LocalStore::new("/tmp/floc-store");
      let registry = MemoryRegistry::new();
      let mut eval = NullEval;
      let mut state = EvalState::new(&store, &NullFetcher, &registry, &mut eval);
      state.allowed_paths = Some(BTreeSet::new());

      state.allow_path(Path::new("/some/tree"));
      state.allow_path(Path::new("/other/tree"));
      assert_eq!(state.allowed_paths.as_ref().map(|s| s.len()), Some(2));
    }
  }
}
