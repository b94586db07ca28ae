//! Per-resolution fetch cache.
//!
//! Memoizes fetches within one lock operation, keyed by flake reference
//! equality. A linear scan is deliberate: the cache lives for a single
//! solve and rarely grows past a few dozen entries.

use tracing::debug;

use floc_core::fetch::Tree;
use floc_core::reference::FlakeRef;

/// A fetched tree together with the fully locked reference it came from.
pub type FetchedFlake = (Tree, FlakeRef);

/// Fetch memoization for one solver invocation.
#[derive(Default)]
pub struct FetchCache {
  entries: Vec<(FlakeRef, FetchedFlake)>,
}

impl FetchCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// Look up a previously fetched reference.
  pub fn lookup(&self, flake_ref: &FlakeRef) -> Option<FetchedFlake> {
    for (key, value) in &self.entries {
      if key == flake_ref {
        debug!(reference = %flake_ref, locked = %value.1, "reusing previously fetched input");
        return Some(value.clone());
      }
    }
    None
  }

  /// Record a fetched reference.
  pub fn insert(&mut self, flake_ref: FlakeRef, fetched: FetchedFlake) {
    self.entries.push((flake_ref, fetched));
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use floc_core::hash::Hash;
  use floc_core::store::StorePath;
  use std::path::PathBuf;

  fn tree(label: &str) -> Tree {
    Tree {
      store_path: StorePath::new(label),
      actual_path: PathBuf::from("/store").join(label),
      nar_hash: Some(Hash::of_string(label)),
    }
  }

  #[test]
  fn lookup_miss_then_hit() {
    let mut cache = FetchCache::new();
    let unlocked = FlakeRef::parse("github:NixOS/nixpkgs", None, false).unwrap();
    let locked = FlakeRef::parse(
      "github:NixOS/nixpkgs/a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0",
      None,
      false,
    )
    .unwrap();

    assert!(cache.lookup(&unlocked).is_none());
    cache.insert(unlocked.clone(), (tree("source-abc"), locked.clone()));

    let (hit_tree, hit_ref) = cache.lookup(&unlocked).unwrap();
    assert_eq!(hit_tree, tree("source-abc"));
    assert_eq!(hit_ref, locked);
  }

  #[test]
  fn distinct_references_do_not_collide() {
    let mut cache = FetchCache::new();
    let a = FlakeRef::parse("github:NixOS/nixpkgs", None, false).unwrap();
    let b = FlakeRef::parse("github:numtide/flake-utils", None, false).unwrap();
    cache.insert(a, (tree("source-a"), FlakeRef::parse("github:NixOS/nixpkgs", None, false).unwrap()));

    assert!(cache.lookup(&b).is_none());
    assert_eq!(cache.len(), 1);
  }
}
