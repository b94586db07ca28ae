//! Content-addressed store interface.
//!
//! Fetched trees land in a content-addressed store and are referred to by
//! [`StorePath`] labels of the form `{name}-{hash[:8]}`, where the hash is
//! the tree's content hash. The solver and the fetch plumbing only consume
//! the [`Store`] trait; [`LocalStore`] is a plain directory-backed
//! implementation.
//!
//! # Store Structure
//!
//! ```text
//! <root>/
//!   source-a1b2c3d4/           # {name}-{hash[:8]}
//!     flake.nix
//!     ...
//!   source-a1b2c3d4.narhash    # content hash sidecar, SRI form
//! ```

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::hash::Hash;

/// Length of the hash prefix used in store labels.
const STORE_HASH_LEN: usize = 8;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
  /// The path is not present in the store.
  #[error("store path '{0}' does not exist")]
  NotFound(StorePath),

  /// The store has no recorded content hash for the path.
  #[error("store path '{0}' has no recorded content hash")]
  MissingHash(StorePath),

  /// An underlying filesystem operation failed.
  #[error("store I/O error on '{path}': {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// The label of a store entry, e.g. `source-a1b2c3d4`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath(String);

impl StorePath {
  pub fn new(label: impl Into<String>) -> Self {
    StorePath(label.into())
  }

  pub fn label(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for StorePath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// The store operations the resolution core consumes.
pub trait Store {
  /// Render a store path as an absolute path string, for display and
  /// fingerprinting.
  fn print_store_path(&self, path: &StorePath) -> String;

  /// The real filesystem location of a store path.
  fn to_real_path(&self, path: &StorePath) -> PathBuf;

  /// Ensure the store path is present, fetching it from elsewhere if the
  /// store knows how; fails if it cannot be produced.
  fn ensure_path(&self, path: &StorePath) -> Result<(), StoreError>;

  /// The store path a fixed-output tree with the given content hash would
  /// occupy.
  fn make_fixed_output_path(&self, recursive: bool, hash: &Hash, name: &str) -> StorePath;

  /// The recorded content hash of a store path.
  fn query_nar_hash(&self, path: &StorePath) -> Result<Hash, StoreError>;
}

/// A directory-backed store.
#[derive(Debug, Clone)]
pub struct LocalStore {
  root: PathBuf,
}

impl LocalStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    LocalStore { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn sidecar(&self, path: &StorePath) -> PathBuf {
    self.root.join(format!("{}.narhash", path.label()))
  }

  /// Copy a tree into the store under `name`, returning its store path and
  /// content hash. Adding the same tree twice is a no-op.
  pub fn add_path(&self, name: &str, source: &Path) -> Result<(StorePath, Hash), StoreError> {
    let hash = hash_tree(source)?;
    let path = self.make_fixed_output_path(true, &hash, name);
    let dest = self.to_real_path(&path);

    if !dest.exists() {
      fs::create_dir_all(&self.root).map_err(|e| StoreError::Io {
        path: self.root.clone(),
        source: e,
      })?;
      copy_tree(source, &dest)?;
      fs::write(self.sidecar(&path), hash.to_sri()).map_err(|e| StoreError::Io {
        path: self.sidecar(&path),
        source: e,
      })?;
    }

    Ok((path, hash))
  }
}

impl Store for LocalStore {
  fn print_store_path(&self, path: &StorePath) -> String {
    self.to_real_path(path).display().to_string()
  }

  fn to_real_path(&self, path: &StorePath) -> PathBuf {
    self.root.join(path.label())
  }

  fn ensure_path(&self, path: &StorePath) -> Result<(), StoreError> {
    if self.to_real_path(path).exists() {
      Ok(())
    } else {
      Err(StoreError::NotFound(path.clone()))
    }
  }

  fn make_fixed_output_path(&self, _recursive: bool, hash: &Hash, name: &str) -> StorePath {
    StorePath::new(format!("{}-{}", name, &hash.to_hex()[..STORE_HASH_LEN]))
  }

  fn query_nar_hash(&self, path: &StorePath) -> Result<Hash, StoreError> {
    let sidecar = self.sidecar(path);
    let content = fs::read_to_string(&sidecar).map_err(|e| {
      if e.kind() == io::ErrorKind::NotFound {
        StoreError::MissingHash(path.clone())
      } else {
        StoreError::Io {
          path: sidecar.clone(),
          source: e,
        }
      }
    })?;
    Hash::parse(content.trim()).map_err(|_| StoreError::MissingHash(path.clone()))
  }
}

/// Compute the content hash of a filesystem tree.
///
/// The serialization covers entry names, types, and file contents, with
/// entries visited in sorted order, so identical trees hash identically on
/// every platform.
pub fn hash_tree(path: &Path) -> Result<Hash, StoreError> {
  let mut hasher = Sha256::new();
  hash_tree_into(&mut hasher, path)?;
  let digest: [u8; 32] = hasher.finalize().into();
  Ok(Hash::from(digest))
}

fn hash_tree_into(hasher: &mut Sha256, path: &Path) -> Result<(), StoreError> {
  let io_err = |e: io::Error| StoreError::Io {
    path: path.to_path_buf(),
    source: e,
  };

  let meta = fs::symlink_metadata(path).map_err(io_err)?;
  if meta.is_dir() {
    hasher.update(b"d(");
    let mut entries: Vec<_> = fs::read_dir(path)
      .map_err(io_err)?
      .collect::<Result<Vec<_>, _>>()
      .map_err(io_err)?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
      hasher.update(entry.file_name().to_string_lossy().as_bytes());
      hasher.update(b"=");
      hash_tree_into(hasher, &entry.path())?;
    }
    hasher.update(b")");
  } else if meta.is_symlink() {
    let target = fs::read_link(path).map_err(io_err)?;
    hasher.update(b"l:");
    hasher.update(target.to_string_lossy().as_bytes());
  } else {
    let content = fs::read(path).map_err(io_err)?;
    hasher.update(b"f:");
    hasher.update(content.len().to_string().as_bytes());
    hasher.update(b":");
    hasher.update(&content);
  }
  Ok(())
}

fn copy_tree(source: &Path, dest: &Path) -> Result<(), StoreError> {
  fs::create_dir_all(dest).map_err(|e| StoreError::Io {
    path: dest.to_path_buf(),
    source: e,
  })?;
  let read_err = |e: io::Error| StoreError::Io {
    path: source.to_path_buf(),
    source: e,
  };
  for entry in fs::read_dir(source).map_err(read_err)? {
    let entry = entry.map_err(read_err)?;
    let from = entry.path();
    let to = dest.join(entry.file_name());
    let file_type = entry.file_type().map_err(|e| StoreError::Io {
      path: from.clone(),
      source: e,
    })?;
    if file_type.is_dir() {
      copy_tree(&from, &to)?;
    } else {
      fs::copy(&from, &to).map_err(|e| StoreError::Io {
        path: from.clone(),
        source: e,
      })?;
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn scratch_tree(root: &Path) {
    fs::create_dir_all(root.join("sub")).unwrap();
    fs::write(root.join("flake.nix"), "{ }").unwrap();
    fs::write(root.join("sub/file"), "content").unwrap();
  }

  mod tree_hashing {
    use super::*;

    #[test]
    fn deterministic() {
      let temp = TempDir::new().unwrap();
      scratch_tree(temp.path());
      assert_eq!(hash_tree(temp.path()).unwrap(), hash_tree(temp.path()).unwrap());
    }

    #[test]
    fn content_change_changes_hash() {
      let temp = TempDir::new().unwrap();
      scratch_tree(temp.path());
      let before = hash_tree(temp.path()).unwrap();

      fs::write(temp.path().join("sub/file"), "other content").unwrap();
      let after = hash_tree(temp.path()).unwrap();
      assert_ne!(before, after);
    }

    #[test]
    fn identical_copies_hash_identically() {
      let a = TempDir::new().unwrap();
      let b = TempDir::new().unwrap();
      scratch_tree(a.path());
      scratch_tree(b.path());
      assert_eq!(hash_tree(a.path()).unwrap(), hash_tree(b.path()).unwrap());
    }
  }

  mod local_store {
    use super::*;

    #[test]
    fn add_path_then_ensure_and_query() {
      let source = TempDir::new().unwrap();
      scratch_tree(source.path());
      let store_dir = TempDir::new().unwrap();
      let store = LocalStore::new(store_dir.path());

      let (path, hash) = store.add_path("source", source.path()).unwrap();
      assert!(path.label().starts_with("source-"));
      store.ensure_path(&path).unwrap();
      assert_eq!(store.query_nar_hash(&path).unwrap(), hash);
      assert!(store.to_real_path(&path).join("sub/file").exists());
    }

    #[test]
    fn add_path_is_idempotent() {
      let source = TempDir::new().unwrap();
      scratch_tree(source.path());
      let store_dir = TempDir::new().unwrap();
      let store = LocalStore::new(store_dir.path());

      let first = store.add_path("source", source.path()).unwrap();
      let second = store.add_path("source", source.path()).unwrap();
      assert_eq!(first, second);
    }

    #[test]
    fn ensure_missing_path_fails() {
      let store_dir = TempDir::new().unwrap();
      let store = LocalStore::new(store_dir.path());
      let path = store.make_fixed_output_path(true, &Hash::of_string("x"), "source");
      assert!(matches!(store.ensure_path(&path), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn fixed_output_path_matches_added_path() {
      let source = TempDir::new().unwrap();
      scratch_tree(source.path());
      let store_dir = TempDir::new().unwrap();
      let store = LocalStore::new(store_dir.path());

      let (path, hash) = store.add_path("source", source.path()).unwrap();
      assert_eq!(store.make_fixed_output_path(true, &hash, "source"), path);
    }
  }
}
