//! Fetch plumbing.
//!
//! Transport backends (git, HTTP, filesystem) live outside this crate,
//! behind the [`Fetcher`] trait. What lives here is the scheme-independent
//! plumbing around a backend call:
//!
//! - substitution: an input that already carries a content hash can be
//!   satisfied straight from the store, without touching the network;
//! - hash bookkeeping: the observed content hash is filled in from the
//!   store when the backend does not report one;
//! - verification: an expected content hash that does not match the
//!   observed one fails the fetch.

use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use crate::hash::Hash;
use crate::input::Input;
use crate::interrupt::{Interrupted, check_interrupt};
use crate::store::{Store, StoreError, StorePath};

/// A fetched source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
  pub store_path: StorePath,
  /// Real filesystem location of the tree's contents.
  pub actual_path: PathBuf,
  /// Content hash; always present on trees returned by [`Input::fetch`].
  pub nar_hash: Option<Hash>,
}

/// Errors that can occur while fetching an input.
#[derive(Debug, Error)]
pub enum FetchError {
  /// The backend failed to produce the tree.
  #[error("failed to fetch input '{url}': {reason}")]
  Failure { url: String, reason: String },

  /// The observed content hash differs from the expected one.
  #[error("hash mismatch in input '{url}' ({path}), expected '{expected}', got '{got}'")]
  HashMismatch {
    url: String,
    path: String,
    expected: Hash,
    got: Hash,
  },

  /// The backend does not know how to fetch this input.
  #[error("no fetcher available for input '{url}'")]
  UnsupportedInput { url: String },

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Interrupted(#[from] Interrupted),
}

/// A transport backend. One implementation serves every scheme it knows;
/// unknown schemes fail with [`FetchError::UnsupportedInput`].
pub trait Fetcher {
  /// Fetch the tree behind `input` into the store, returning the tree and
  /// the locked form of the input (revision and content hash filled in).
  fn fetch(&self, store: &dyn Store, input: &Input) -> Result<(Tree, Input), FetchError>;

  /// Record that a file below the input's source changed, e.g. commit a
  /// rewritten lock file. Only meaningful for inputs with a local source;
  /// the default does nothing.
  fn mark_changed_file(&self, input: &Input, rel_path: &str, commit_message: Option<&str>) -> Result<(), FetchError> {
    let _ = (input, rel_path, commit_message);
    Ok(())
  }
}

impl Input {
  /// The store path this input's pinned content hash computes to, if it
  /// has one.
  pub fn compute_store_path(&self, store: &dyn Store) -> Option<StorePath> {
    self
      .nar_hash
      .as_ref()
      .map(|hash| store.make_fixed_output_path(true, hash, "source"))
  }

  /// Fetch this input, preferring store substitution when the input
  /// already pins a content hash.
  pub fn fetch(&self, store: &dyn Store, fetcher: &dyn Fetcher) -> Result<(Tree, Input), FetchError> {
    check_interrupt()?;

    if let Some(nar_hash) = &self.nar_hash {
      match self.substitute_tree(store, nar_hash) {
        Ok(tree) => return Ok((tree, self.clone())),
        Err(e) => debug!(input = %self, error = %e, "substitution failed, fetching instead"),
      }
    }

    let (mut tree, mut locked) = fetcher.fetch(store, self)?;

    if tree.actual_path.as_os_str().is_empty() {
      tree.actual_path = store.to_real_path(&tree.store_path);
    }
    if tree.nar_hash.is_none() {
      tree.nar_hash = Some(store.query_nar_hash(&tree.store_path)?);
    }
    if locked.nar_hash.is_none() {
      locked.nar_hash = tree.nar_hash;
    }

    if let Some(expected) = &self.nar_hash
      && let Some(got) = &tree.nar_hash
      && expected != got
    {
      return Err(FetchError::HashMismatch {
        url: self.to_string(),
        path: tree.actual_path.display().to_string(),
        expected: *expected,
        got: *got,
      });
    }

    debug!(input = %self, locked = %locked, store_path = %tree.store_path, "fetched tree");
    Ok((tree, locked))
  }

  /// Satisfy the input from the store using its pinned content hash.
  fn substitute_tree(&self, store: &dyn Store, nar_hash: &Hash) -> Result<Tree, StoreError> {
    let store_path = store.make_fixed_output_path(true, nar_hash, "source");
    store.ensure_path(&store_path)?;

    debug!(input = %self, store_path = %store_path, "using substituted input");
    Ok(Tree {
      actual_path: store.to_real_path(&store_path),
      store_path,
      nar_hash: Some(*nar_hash),
    })
  }
}
