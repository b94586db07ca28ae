//! Manifest loading.
//!
//! Turns a flake reference into a parsed [`Flake`]: resolve it if indirect,
//! fetch (or reuse from the per-solve cache), locate `flake.nix` inside the
//! fetched tree, evaluate it, and parse the resulting attribute set into
//! the declared inputs and the outputs function.
//!
//! A manifest accepts exactly these top-level attributes: `description`,
//! `inputs`, `outputs`, and the deprecated `edition` (warned about, still
//! tolerated). Anything else is an error.

use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, warn};

use floc_core::attrs::{Attr, Attrs};
use floc_core::fetch::{FetchError, Tree};
use floc_core::reference::{FlakeRef, ParseError};
use floc_core::registry::RegistryError;

use super::cache::FetchCache;
use super::types::{Flake, FlakeInput, FlakeInputs, InputPath, InputPathError};
use crate::eval::{EvalError, EvalState, Value};

/// File name of a flake manifest.
pub const FLAKE_FILENAME: &str = "flake.nix";

/// File name of a flake's lock.
pub const LOCK_FILENAME: &str = "flake.lock";

/// Errors raised while loading or parsing a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
  /// Breadcrumb: the error occurred while processing a named input.
  #[error("in flake input '{name}': {source}")]
  InInput {
    name: String,
    #[source]
    source: Box<ManifestError>,
  },

  /// Breadcrumb: the error occurred while processing a named attribute.
  #[error("in flake attribute '{name}': {source}")]
  InAttr {
    name: String,
    #[source]
    source: Box<ManifestError>,
  },

  /// An indirect reference was hit while registry lookups are disabled.
  #[error("'{reference}' is an indirect flake reference, but registry lookups are not allowed")]
  RegistryLookupDisallowed { reference: String },

  /// The fetched tree does not contain a manifest.
  #[error("source tree referenced by '{reference}' does not contain a '{subdir}flake.nix' file")]
  MissingFlakeFile { reference: String, subdir: String },

  /// The manifest path escapes the fetched tree through a symlink.
  #[error("'flake.nix' file of flake '{reference}' escapes from '{store_path}'")]
  SymlinkEscape { reference: String, store_path: String },

  /// A value has the wrong type.
  #[error("expected {expected} but got {got}")]
  UnexpectedType { expected: &'static str, got: &'static str },

  /// The manifest has an attribute outside the accepted set.
  #[error("flake '{reference}' has an unsupported attribute '{attr}'")]
  UnsupportedAttr { reference: String, attr: String },

  /// An input entry carries an attribute that is neither recognized nor a
  /// scheme attribute.
  #[error("unexpected flake input attribute '{0}'")]
  UnexpectedInputAttr(String),

  /// The manifest lacks the `outputs` function.
  #[error("flake '{reference}' lacks attribute 'outputs'")]
  MissingOutputs { reference: String },

  /// Reading the fetched tree failed.
  #[error("I/O error on '{path}': {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Registry(#[from] RegistryError),

  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Parse(#[from] ParseError),

  #[error(transparent)]
  InputPath(#[from] InputPathError),

  #[error(transparent)]
  Eval(#[from] EvalError),
}

fn in_input(name: &str) -> impl FnOnce(ManifestError) -> ManifestError + '_ {
  move |e| ManifestError::InInput {
    name: name.to_string(),
    source: Box::new(e),
  }
}

fn in_attr(name: &str) -> impl FnOnce(ManifestError) -> ManifestError + '_ {
  move |e| ManifestError::InAttr {
    name: name.to_string(),
    source: Box::new(e),
  }
}

fn expect_attrs(value: &Value) -> Result<&std::collections::BTreeMap<String, Value>, ManifestError> {
  value.as_attrs().ok_or_else(|| ManifestError::UnexpectedType {
    expected: "attribute set",
    got: value.type_name(),
  })
}

fn expect_string(value: &Value) -> Result<&str, ManifestError> {
  value.as_str().ok_or_else(|| ManifestError::UnexpectedType {
    expected: "string",
    got: value.type_name(),
  })
}

fn expect_bool(value: &Value) -> Result<bool, ManifestError> {
  value.as_bool().ok_or_else(|| ManifestError::UnexpectedType {
    expected: "bool",
    got: value.type_name(),
  })
}

/// Fetch a reference, or reuse an earlier fetch from this solve.
///
/// Indirect references are resolved through the registry first (when
/// allowed); the cache is keyed under both the original and the resolved
/// reference. Returns the tree plus the resolved and fully locked forms of
/// the reference.
pub(crate) fn fetch_or_substitute(
  state: &mut EvalState<'_>,
  cache: &mut FetchCache,
  original_ref: &FlakeRef,
  allow_lookup: bool,
) -> Result<(Tree, FlakeRef, FlakeRef), ManifestError> {
  let mut resolved_ref = original_ref.clone();

  let fetched = match cache.lookup(original_ref) {
    Some(hit) => hit,
    None => {
      let value = if original_ref.is_direct() {
        original_ref.fetch_tree(state.store, state.fetcher)?
      } else if allow_lookup {
        resolved_ref = original_ref.resolve(state.registry)?;
        let value = match cache.lookup(&resolved_ref) {
          Some(hit) => hit,
          None => resolved_ref.fetch_tree(state.store, state.fetcher)?,
        };
        cache.insert(resolved_ref.clone(), value.clone());
        value
      } else {
        return Err(ManifestError::RegistryLookupDisallowed {
          reference: original_ref.to_string(),
        });
      };
      cache.insert(original_ref.clone(), value.clone());
      value
    }
  };

  let (tree, locked_ref) = fetched;
  debug!(store_path = %tree.store_path, locked = %locked_ref, "got tree");

  state.allow_path(&tree.actual_path);

  // An input carrying an expected content hash must land on the store
  // path that hash computes to.
  if let (Some(expected), Some(computed)) = (
    &original_ref.input.nar_hash,
    original_ref.input.compute_store_path(state.store),
  ) {
    if computed != tree.store_path {
      return Err(
        FetchError::HashMismatch {
          url: original_ref.to_string(),
          path: tree.actual_path.display().to_string(),
          expected: *expected,
          got: tree.nar_hash.unwrap_or(*expected),
        }
        .into(),
      );
    }
  }

  Ok((tree, resolved_ref, locked_ref))
}

/// Locate the manifest inside a fetched tree, guarding against symlinks
/// that point outside it.
fn locate_flake_file(tree: &Tree, locked_ref: &FlakeRef, store_path: String) -> Result<PathBuf, ManifestError> {
  let actual = fs::canonicalize(&tree.actual_path).map_err(|e| ManifestError::Io {
    path: tree.actual_path.clone(),
    source: e,
  })?;

  let mut candidate = actual.clone();
  if !locked_ref.subdir.is_empty() {
    candidate.push(&locked_ref.subdir);
  }
  candidate.push(FLAKE_FILENAME);

  let flake_file = fs::canonicalize(&candidate).map_err(|e| {
    if e.kind() == io::ErrorKind::NotFound {
      ManifestError::MissingFlakeFile {
        reference: locked_ref.to_string(),
        subdir: if locked_ref.subdir.is_empty() {
          String::new()
        } else {
          format!("{}/", locked_ref.subdir)
        },
      }
    } else {
      ManifestError::Io {
        path: candidate.clone(),
        source: e,
      }
    }
  })?;

  if !flake_file.starts_with(&actual) {
    return Err(ManifestError::SymlinkEscape {
      reference: locked_ref.to_string(),
      store_path,
    });
  }

  Ok(flake_file)
}

/// Load and parse the flake behind a reference, memoizing fetches in
/// `cache`.
pub(crate) fn get_flake_with_cache(
  state: &mut EvalState<'_>,
  cache: &mut FetchCache,
  original_ref: &FlakeRef,
  allow_lookup: bool,
) -> Result<Flake, ManifestError> {
  let (source_info, resolved_ref, locked_ref) = fetch_or_substitute(state, cache, original_ref, allow_lookup)?;

  let flake_file = locate_flake_file(
    &source_info,
    &locked_ref,
    state.store.print_store_path(&source_info.store_path),
  )?;
  let value = state.eval.eval_file(&flake_file)?;

  parse_flake(&value, original_ref.clone(), resolved_ref, locked_ref, source_info)
}

/// Load and parse the flake behind a reference.
pub fn get_flake(state: &mut EvalState<'_>, original_ref: &FlakeRef, allow_lookup: bool) -> Result<Flake, ManifestError> {
  let mut cache = FetchCache::new();
  get_flake_with_cache(state, &mut cache, original_ref, allow_lookup)
}

/// Parse an evaluated manifest into a [`Flake`].
pub(crate) fn parse_flake(
  value: &Value,
  original_ref: FlakeRef,
  resolved_ref: FlakeRef,
  locked_ref: FlakeRef,
  source_info: Tree,
) -> Result<Flake, ManifestError> {
  let attrs = expect_attrs(value)?;

  let mut description = None;
  let mut inputs = FlakeInputs::new();
  let mut outputs = None;

  for (name, attr_value) in attrs {
    match name.as_str() {
      "description" => {
        description = Some(expect_string(attr_value).map_err(in_attr(name))?.to_string());
      }
      "inputs" => {
        inputs = parse_flake_inputs(attr_value, true).map_err(in_attr(name))?;
      }
      "outputs" => {
        if !matches!(attr_value, Value::Lambda(_)) {
          return Err(in_attr(name)(ManifestError::UnexpectedType {
            expected: "function",
            got: attr_value.type_name(),
          }));
        }
        outputs = Some(attr_value.clone());
      }
      "edition" => {
        warn!(flake = %locked_ref, "flake has deprecated attribute 'edition'");
      }
      _ => {
        return Err(ManifestError::UnsupportedAttr {
          reference: locked_ref.to_string(),
          attr: name.clone(),
        });
      }
    }
  }

  let outputs = outputs.ok_or_else(|| ManifestError::MissingOutputs {
    reference: locked_ref.to_string(),
  })?;

  // Every formal of the outputs function (except `self`) is an input; ones
  // not declared in `inputs` default to a registry alias of the same name.
  if let Value::Lambda(lambda) = &outputs {
    for formal in &lambda.formals {
      if formal != "self" && !inputs.contains_key(formal) {
        inputs.insert(
          formal.clone(),
          FlakeInput {
            ref_: Some(
              FlakeRef::parse(formal, None, false)
                .map_err(ManifestError::from)
                .map_err(in_input(formal))?,
            ),
            ..FlakeInput::default()
          },
        );
      }
    }
  }

  Ok(Flake {
    original_ref,
    resolved_ref,
    locked_ref,
    source_info,
    description,
    inputs,
    outputs,
  })
}

/// Parse an `inputs` attribute set. `default_ref` is set for a manifest's
/// own `inputs` block and cleared for nested override blocks, where an
/// entry without a reference stays a pure override.
pub(crate) fn parse_flake_inputs(value: &Value, default_ref: bool) -> Result<FlakeInputs, ManifestError> {
  let attrs = expect_attrs(value)?;
  let mut inputs = FlakeInputs::new();
  for (name, entry) in attrs {
    let input = parse_flake_input(name, entry, default_ref).map_err(in_input(name))?;
    inputs.insert(name.clone(), input);
  }
  Ok(inputs)
}

fn parse_flake_input(name: &str, value: &Value, default_ref: bool) -> Result<FlakeInput, ManifestError> {
  let attrs = expect_attrs(value)?;

  let mut input = FlakeInput::default();
  let mut bag = Attrs::new();
  let mut url: Option<String> = None;

  for (attr_name, attr_value) in attrs {
    let mut handle = || -> Result<(), ManifestError> {
      match attr_name.as_str() {
        "url" => {
          let s = expect_string(attr_value)?;
          url = Some(s.to_string());
          bag.insert("url".to_string(), Attr::from(s));
        }
        "flake" => {
          input.is_flake = expect_bool(attr_value)?;
        }
        "inputs" => {
          input.overrides = parse_flake_inputs(attr_value, false)?;
        }
        "follows" => {
          input.follows = Some(InputPath::parse(expect_string(attr_value)?)?);
        }
        _ => match attr_value {
          Value::String(s) => {
            bag.insert(attr_name.clone(), Attr::from(s.clone()));
          }
          _ => {
            return Err(ManifestError::UnexpectedType {
              expected: "string",
              got: attr_value.type_name(),
            });
          }
        },
      }
      Ok(())
    };
    handle().map_err(in_attr(attr_name))?;
  }

  if bag.contains_key("type") {
    // Attribute form: `url` is just another scheme attribute.
    input.ref_ = Some(FlakeRef::parse_attrs(&bag)?);
  } else {
    bag.remove("url");
    if let Some((stray, _)) = bag.first_key_value() {
      return Err(ManifestError::UnexpectedInputAttr(stray.clone()));
    }
    if let Some(url) = url {
      input.ref_ = Some(FlakeRef::parse(&url, None, true)?);
    }
  }

  if input.follows.is_none() && input.ref_.is_none() && default_ref {
    input.ref_ = Some(FlakeRef::parse(name, None, false)?);
  }

  Ok(input)
}
