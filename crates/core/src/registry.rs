//! Registry lookup interface.
//!
//! Indirect references (`flake:nixpkgs`, bare `nixpkgs`) name an entry in a
//! registry that maps flake ids to direct references. Registry resolution
//! itself lives outside this crate; the reference model only consults it
//! through the [`Registry`] trait. [`MemoryRegistry`] is a plain in-memory
//! implementation for embedders and tests.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::input::InputError;
use crate::reference::FlakeRef;

/// Errors raised during registry resolution.
#[derive(Debug, Error)]
pub enum RegistryError {
  /// The id has no registry entry.
  #[error("cannot find flake '{0}' in the flake registries")]
  UnknownEntry(String),

  /// The indirect reference carried overrides the target cannot absorb.
  #[error(transparent)]
  Override(#[from] InputError),
}

/// A mapping from flake ids to direct references.
pub trait Registry {
  fn lookup(&self, id: &str) -> Option<FlakeRef>;
}

/// An in-memory registry.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
  entries: BTreeMap<String, FlakeRef>,
}

impl MemoryRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register `id` as an alias for `target`, replacing any existing entry.
  pub fn add(&mut self, id: &str, target: FlakeRef) {
    self.entries.insert(id.to_string(), target);
  }
}

impl Registry for MemoryRegistry {
  fn lookup(&self, id: &str) -> Option<FlakeRef> {
    self.entries.get(id).cloned()
  }
}
