//! Core flake types.
//!
//! This module defines the values flowing through resolution:
//! - [`InputPath`] - a dotted path locating a node in the input graph
//! - [`FlakeInput`] - a parsed input declaration (before locking)
//! - [`Flake`] - a fetched and parsed manifest
//! - [`LockedFlake`] - a flake together with its computed lock file

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};
use thiserror::Error;

use floc_core::fetch::Tree;
use floc_core::hash::Hash;
use floc_core::reference::FlakeRef;
use floc_core::store::Store;

use super::lock::LockFile;
use crate::eval::Value;

/// The name an input is declared under.
pub type FlakeId = String;

/// Declared inputs of one flake, keyed by id.
pub type FlakeInputs = BTreeMap<FlakeId, FlakeInput>;

/// An ordered sequence of input ids locating a node in the input graph,
/// rooted at the top-level flake. The empty path is the root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct InputPath(Vec<FlakeId>);

/// Errors raised when parsing an input path.
#[derive(Debug, Error)]
pub enum InputPathError {
  #[error("invalid input path '{0}': empty segment")]
  EmptySegment(String),
}

impl InputPath {
  /// The root path.
  pub fn root() -> Self {
    InputPath(Vec::new())
  }

  /// Parse a dotted path, e.g. `nixpkgs.lib`.
  pub fn parse(s: &str) -> Result<Self, InputPathError> {
    let segments: Vec<String> = s.split('.').map(str::to_string).collect();
    if segments.iter().any(String::is_empty) {
      return Err(InputPathError::EmptySegment(s.to_string()));
    }
    Ok(InputPath(segments))
  }

  pub fn is_root(&self) -> bool {
    self.0.is_empty()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn segments(&self) -> &[FlakeId] {
    &self.0
  }

  /// This path extended by one id.
  pub fn child(&self, id: &str) -> InputPath {
    let mut segments = self.0.clone();
    segments.push(id.to_string());
    InputPath(segments)
  }

  /// This path extended by all segments of `other`.
  pub fn join(&self, other: &InputPath) -> InputPath {
    let mut segments = self.0.clone();
    segments.extend(other.0.iter().cloned());
    InputPath(segments)
  }

  /// Whether `self` is a proper prefix of `other`.
  pub fn is_proper_prefix_of(&self, other: &InputPath) -> bool {
    other.0.len() > self.0.len() && other.0[..self.0.len()] == self.0[..]
  }
}

impl fmt::Display for InputPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0.join("."))
  }
}

impl From<Vec<String>> for InputPath {
  fn from(segments: Vec<String>) -> Self {
    InputPath(segments)
  }
}

/// A declared dependency of a flake, as written in its manifest.
///
/// After parsing, exactly one of `ref_` and `follows` is meaningful.
#[derive(Debug, Clone, PartialEq)]
pub struct FlakeInput {
  /// Where to fetch the input from.
  pub ref_: Option<FlakeRef>,
  /// Whether the input's tree is itself a flake. Non-flake inputs are
  /// fetched but their manifest is neither parsed nor recursed into.
  pub is_flake: bool,
  /// Alias: this input names the same node as the given path.
  pub follows: Option<InputPath>,
  /// Overrides for this input's own inputs.
  pub overrides: FlakeInputs,
  /// Whether `follows` is rooted at the graph root rather than the
  /// enclosing flake. Set on inputs reconstructed from overrides or an
  /// old lock.
  pub absolute: bool,
}

impl Default for FlakeInput {
  fn default() -> Self {
    FlakeInput {
      ref_: None,
      is_flake: true,
      follows: None,
      overrides: FlakeInputs::new(),
      absolute: false,
    }
  }
}

impl FlakeInput {
  /// Merge incoming overrides into this input's own override map.
  ///
  /// An incoming entry replaces the existing reference (when it carries
  /// one) and merges recursively into the existing children.
  pub fn merge_overrides(&mut self, incoming: FlakeInputs) {
    for (id, child) in incoming {
      match self.overrides.get_mut(&id) {
        Some(existing) => {
          if child.ref_.is_some() {
            existing.ref_ = child.ref_;
          }
          existing.merge_overrides(child.overrides);
        }
        None => {
          self.overrides.insert(id, child);
        }
      }
    }
  }
}

/// A fetched and parsed flake manifest.
#[derive(Debug)]
pub struct Flake {
  /// The reference the user wrote.
  pub original_ref: FlakeRef,
  /// The reference after any registry lookup.
  pub resolved_ref: FlakeRef,
  /// The fully pinned reference returned by the fetch.
  pub locked_ref: FlakeRef,
  /// The fetched source tree.
  pub source_info: Tree,
  pub description: Option<String>,
  pub inputs: FlakeInputs,
  /// The manifest's outputs function, kept opaque for the evaluator.
  pub outputs: Value,
}

/// The result of locking a flake.
pub struct LockedFlake {
  pub flake: Flake,
  pub lock_file: LockFile,
}

impl LockedFlake {
  /// A stable identity for downstream memoization: a digest over the
  /// locked source and the lock file text.
  pub fn fingerprint(&self, store: &dyn Store) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(
      format!(
        "{};{};{};{}",
        store.print_store_path(&self.flake.source_info.store_path),
        self.flake.locked_ref.input.rev_count().unwrap_or(0),
        self.flake.locked_ref.input.last_modified().unwrap_or(0),
        self.lock_file
      )
      .as_bytes(),
    );
    let digest: [u8; 32] = hasher.finalize().into();
    Hash::from(digest)
  }
}
