//! Calling a locked flake's outputs.
//!
//! Evaluating outputs is the evaluator's business; this module only builds
//! the bridge: the lock file text, the root tree attributes, and the glue
//! expression that stitches them into the call of the outputs function.

use tracing::debug;

use floc_core::fetch::Tree;
use floc_core::input::Input;
use floc_core::reference::FlakeRef;
use floc_core::store::Store;

use super::resolve::{LockFlags, SolveError, lock_flake};
use super::types::LockedFlake;
use crate::eval::{EvalError, EvalState, Value};

/// The glue expression applied to (lock text, root source, root subdir).
/// The evaluator interprets it; its result is the called flake.
const CALL_FLAKE_EXPR: &str = "lockFileStr: rootSrc: rootSubdir: callFlake (fromJSON lockFileStr) rootSrc rootSubdir";

/// Attribute-set value describing a fetched tree, as the outputs function
/// sees its sources.
pub fn emit_tree_attrs(store: &dyn Store, tree: &Tree, input: &Input) -> Value {
  let mut attrs = vec![(
    "outPath".to_string(),
    Value::string(store.print_store_path(&tree.store_path)),
  )];
  if let Some(hash) = &tree.nar_hash {
    attrs.push(("narHash".to_string(), Value::string(hash.to_sri())));
  }
  if let Some(rev) = input.rev() {
    attrs.push(("rev".to_string(), Value::string(rev)));
    attrs.push(("shortRev".to_string(), Value::string(&rev[..7.min(rev.len())])));
  }
  if let Some(rev_count) = input.rev_count() {
    attrs.push(("revCount".to_string(), Value::Int(rev_count as i64)));
  }
  if let Some(last_modified) = input.last_modified() {
    attrs.push(("lastModified".to_string(), Value::Int(last_modified as i64)));
  }
  Value::attrs(attrs)
}

/// Apply the evaluator's flake-calling convention to a locked flake.
pub fn call_flake(state: &mut EvalState<'_>, locked_flake: &LockedFlake) -> Result<Value, SolveError> {
  let locks = locked_flake.lock_file.to_string();
  let root_src = emit_tree_attrs(
    state.store,
    &locked_flake.flake.source_info,
    &locked_flake.flake.locked_ref.input,
  );
  let root_subdir = locked_flake.flake.locked_ref.subdir.clone();

  let eval_err = |e: EvalError| super::manifest::ManifestError::from(e);
  let call = state.eval.parse_expr(CALL_FLAKE_EXPR).map_err(eval_err)?;
  let call = state.eval.call_function(&call, Value::String(locks)).map_err(eval_err)?;
  let call = state.eval.call_function(&call, root_src).map_err(eval_err)?;
  let result = state
    .eval
    .call_function(&call, Value::String(root_subdir))
    .map_err(eval_err)?;

  debug!(flake = %locked_flake.flake.locked_ref, "called flake outputs");
  Ok(result)
}

/// The `getFlake` primitive, as exposed to expressions: parse the
/// reference, lock it without touching the on-disk lock file, and call it.
///
/// Under pure evaluation a mutable reference is rejected outright, and
/// neither registry lookups nor mutable lock entries are allowed.
pub fn prim_get_flake(state: &mut EvalState<'_>, url: &str, pure_eval: bool) -> Result<Value, SolveError> {
  let flake_ref = FlakeRef::parse(url, None, true).map_err(super::manifest::ManifestError::from)?;
  if pure_eval && !flake_ref.is_immutable() {
    return Err(SolveError::MutableInPureMode { input: url.to_string() });
  }

  let flags = LockFlags {
    update_lock_file: false,
    use_registries: !pure_eval,
    allow_mutable: !pure_eval,
    ..LockFlags::default()
  };
  let locked = lock_flake(state, &flake_ref, &flags)?;
  call_flake(state, &locked)
}

#[cfg(test)]
mod tests {
  use super::*;
  use floc_core::hash::Hash;
  use floc_core::store::{LocalStore, StorePath};
  use std::path::PathBuf;

  #[test]
  fn tree_attrs_carry_pinning_metadata() {
    let store = LocalStore::new("/floc/store");
    let rev = "a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0";
    let input = Input::from_url(&format!(
      "github:NixOS/nixpkgs/{}?lastModified=1733667300&revCount=42",
      rev
    ))
    .unwrap();
    let tree = Tree {
      store_path: StorePath::new("source-abcd1234"),
      actual_path: PathBuf::from("/floc/store/source-abcd1234"),
      nar_hash: Some(Hash::of_string("tree")),
    };

    let value = emit_tree_attrs(&store, &tree, &input);
    let attrs = value.as_attrs().unwrap();
    assert_eq!(
      attrs.get("outPath").and_then(Value::as_str),
      Some("/floc/store/source-abcd1234")
    );
    assert_eq!(attrs.get("rev").and_then(Value::as_str), Some(rev));
    assert_eq!(attrs.get("shortRev").and_then(Value::as_str), Some("a1b2c3d"));
    assert_eq!(attrs.get("revCount"), Some(&Value::Int(42)));
    assert_eq!(attrs.get("lastModified"), Some(&Value::Int(1733667300)));
    assert!(attrs.get("narHash").is_some());
  }
}
