//! The lock solver.
//!
//! [`lock_flake`] computes a new lock file for a top-level flake from three
//! ingredients: the flake's declared inputs, the previously persisted lock
//! file, and the caller's flags and overrides. The traversal is recursive;
//! each step processes one node's inputs:
//!
//! 1. Apply any override inherited from the parent to the input's
//!    reference and merge override children.
//! 2. An input with `follows` becomes an alias edge and is resolved after
//!    the traversal.
//! 3. If the old lock has a usable entry (same original reference, no
//!    override, no explicit update request), it is copied over and the
//!    subtree is re-solved from the old lock without refetching.
//! 4. Otherwise the input is fetched, pinned, and recursed into, with its
//!    own lock file as the baseline for nested inputs.
//!
//! The solver never persists a partial result: the lock file is validated
//! and only written at the very end, and only when it changed.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, warn};

use floc_core::fetch::FetchError;
use floc_core::interrupt::{Interrupted, check_interrupt};
use floc_core::reference::FlakeRef;

use super::cache::FetchCache;
use super::lock::{Edge, LockError, LockFile, NodeId};
use super::manifest::{self, LOCK_FILENAME, ManifestError};
use super::types::{Flake, FlakeInput, FlakeInputs, InputPath, LockedFlake};
use crate::eval::EvalState;

/// Flags controlling a lock computation.
#[derive(Debug, Clone)]
pub struct LockFlags {
  /// May resolve indirect references via the registry.
  pub use_registries: bool,
  /// Persist the new lock to disk if it changed and the top source is
  /// writable.
  pub write_lock_file: bool,
  /// Whether lock changes are permitted at all; when false and changes
  /// were required, the solve fails.
  pub update_lock_file: bool,
  /// Emit a commit message when recording the changed lock file.
  pub commit_lock_file: bool,
  /// Permit new lock entries whose reference is not immutable.
  pub allow_mutable: bool,
  /// Ignore the existing lock file entirely.
  pub recreate_lock_file: bool,
  /// Reference overrides, injected as pseudo-overrides at the root.
  pub input_overrides: BTreeMap<InputPath, FlakeRef>,
  /// Inputs to forcibly re-fetch and re-solve.
  pub input_updates: BTreeSet<InputPath>,
}

impl Default for LockFlags {
  fn default() -> Self {
    LockFlags {
      use_registries: true,
      write_lock_file: true,
      update_lock_file: true,
      commit_lock_file: false,
      allow_mutable: true,
      recreate_lock_file: false,
      input_overrides: BTreeMap::new(),
      input_updates: BTreeSet::new(),
    }
  }
}

/// Errors raised by the lock solver.
#[derive(Debug, Error)]
pub enum SolveError {
  #[error(transparent)]
  Manifest(#[from] ManifestError),

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Interrupted(#[from] Interrupted),

  /// A new lock entry would be mutable while mutable inputs are not
  /// allowed.
  #[error("cannot update flake input '{input}' in pure mode")]
  MutableInPureMode { input: String },

  /// A flake reference reappeared on the chain of parents being locked.
  #[error("found circular import of flake '{reference}'")]
  CircularImport { reference: String },

  /// An input ended up with neither a reference nor a follows target.
  #[error("flake input '{input}' has neither a reference nor a follows target")]
  MissingInputRef { input: String },

  /// Changes were required but updating the lock file is disabled.
  #[error("flake '{reference}' requires lock file changes but they are not allowed")]
  LockChangesDisallowed { reference: String },

  /// The top-level flake has no writable source to put the lock file in.
  #[error("cannot write modified lock file of flake '{reference}'")]
  NotWritable { reference: String },

  /// The lock file was written but the top-level source did not register
  /// the change.
  #[error("'{reference}' did not change after updating its 'flake.lock'; is 'flake.lock' under version control?")]
  LockWriteDidNotTakeEffect { reference: String },
}

/// Record an override at `path`, creating intermediate carrier entries.
fn set_override(overrides: &mut FlakeInputs, path: &InputPath, flake_ref: FlakeRef) {
  let segments = path.segments();
  let Some((first, rest)) = segments.split_first() else {
    return;
  };
  let mut current = overrides.entry(first.clone()).or_default();
  for segment in rest {
    current = current.overrides.entry(segment.clone()).or_default();
  }
  current.ref_ = Some(flake_ref);
}

/// Render the override entries (and their children) still present in the
/// map, for the unused-override warning.
fn print_overrides(overrides: &FlakeInputs, prefix: &InputPath) -> String {
  let mut parts = Vec::new();
  for (id, entry) in overrides {
    let path = prefix.child(id);
    if let Some(flake_ref) = &entry.ref_ {
      parts.push(format!("{}={}", path, flake_ref));
    }
    let children = print_overrides(&entry.overrides, &path);
    if !children.is_empty() {
      parts.push(children);
    }
  }
  parts.join(", ")
}

/// A node inside some lock file used as the baseline for a subtree.
#[derive(Clone, Copy)]
struct NodeRef<'l> {
  lock: &'l LockFile,
  id: NodeId,
}

/// One lock computation: flags, fetch memoization, the cycle stack, and
/// the lock file being built.
struct Locker<'a, 'e> {
  state: &'a mut EvalState<'e>,
  flags: &'a LockFlags,
  cache: FetchCache,
  parents: Vec<FlakeRef>,
  updates_used: BTreeSet<InputPath>,
  lock: LockFile,
}

impl<'a, 'e> Locker<'a, 'e> {
  fn compute_locks(
    &mut self,
    flake_inputs: &FlakeInputs,
    node: NodeId,
    input_path_prefix: &InputPath,
    old_node: Option<NodeRef<'_>>,
    overrides: &mut FlakeInputs,
  ) -> Result<(), SolveError> {
    debug!(node = %input_path_prefix, "computing lock file node");

    for (id, original_input) in flake_inputs {
      check_interrupt()?;
      let input_path = input_path_prefix.child(id);

      // Apply an inherited override, if any. The entry is consumed either
      // way; what remains at the end is reported as unused.
      let mut input = original_input.clone();
      let mut has_override = false;
      if let Some(matching) = overrides.remove(id) {
        if let Some(override_ref) = matching.ref_ {
          debug!(input = %input_path, reference = %override_ref, "applying override");
          input.ref_ = Some(override_ref);
          has_override = true;
        }
        input.merge_overrides(matching.overrides);
      }

      // 'follows' is recorded as an alias edge and resolved after the
      // traversal, since it may name a path not processed yet. A follows
      // from an override (or reconstructed from an old lock) is rooted at
      // the graph root; a declared one is relative to the current flake.
      if let Some(follows) = &input.follows {
        let target = if has_override || input.absolute {
          follows.clone()
        } else {
          input_path_prefix.join(follows)
        };
        debug!(input = %input_path, target = %target, "input follows another node");
        self.lock.add_edge(node, id, Edge::Follows(target));
        continue;
      }

      let Some(input_ref) = input.ref_.clone() else {
        return Err(SolveError::MissingInputRef {
          input: input_path.to_string(),
        });
      };

      self.updates_used.insert(input_path.clone());

      let old_lock = if self.flags.input_updates.contains(&input_path) {
        None
      } else {
        old_node.and_then(|o| match o.lock.child(o.id, id) {
          Some(Edge::Node(child)) => Some(NodeRef {
            lock: o.lock,
            id: *child,
          }),
          _ => None,
        })
      };

      // The old entry is reusable iff the reference the user asked for is
      // still the one recorded there and no override intervened.
      let reusable = old_lock.and_then(|o| {
        let entry = o.lock.node(o.id);
        match (&entry.locked, &entry.original) {
          (Some(locked), Some(original)) if *original == input_ref && !has_override => {
            Some((o, locked.clone(), original.clone(), entry.flake))
          }
          _ => None,
        }
      });

      if let Some((old, old_locked, old_original, old_is_flake)) = reusable {
        debug!(input = %input_path, "keeping existing input");
        let child = self.lock.add_node(old_locked.clone(), old_original, old_is_flake);
        self.lock.add_edge(node, id, Edge::Node(child));

        let has_child_update = self
          .flags
          .input_updates
          .iter()
          .any(|update| input_path.is_proper_prefix_of(update));

        if has_child_update {
          // A deeper input was marked for update, so this flake must be
          // fetched to re-solve its subtree.
          let input_flake = manifest::get_flake_with_cache(self.state, &mut self.cache, &old_locked, false)?;
          self.compute_locks(&input_flake.inputs, child, &input_path, Some(old), &mut input.overrides)?;
        } else {
          // Stay lazy: reconstruct the input declarations from the old
          // locked subtree instead of refetching. New overrides on this
          // subtree still get applied against them.
          let mut fake_inputs = FlakeInputs::new();
          for (child_id, edge) in &old.lock.node(old.id).inputs {
            match edge {
              Edge::Node(grandchild) => {
                let grandchild = old.lock.node(*grandchild);
                if let Some(original) = &grandchild.original {
                  fake_inputs.insert(
                    child_id.clone(),
                    FlakeInput {
                      ref_: Some(original.clone()),
                      is_flake: grandchild.flake,
                      ..FlakeInput::default()
                    },
                  );
                }
              }
              Edge::Follows(path) => {
                fake_inputs.insert(
                  child_id.clone(),
                  FlakeInput {
                    follows: Some(path.clone()),
                    absolute: true,
                    ..FlakeInput::default()
                  },
                );
              }
            }
          }
          self.compute_locks(&fake_inputs, child, &input_path, Some(old), &mut input.overrides)?;
        }
      } else {
        debug!(input = %input_path, "creating new input");

        if !self.flags.allow_mutable && !input_ref.is_immutable() {
          return Err(SolveError::MutableInPureMode {
            input: input_path.to_string(),
          });
        }

        if input.is_flake {
          let input_flake =
            manifest::get_flake_with_cache(self.state, &mut self.cache, &input_ref, self.flags.use_registries)?;

          // Record the declaration's own reference, not the override, so
          // an override survives the next lock run instead of being
          // replaced by the declaration again.
          let original_for_node = original_input.ref_.clone().unwrap_or_else(|| input_ref.clone());
          let child = self.lock.add_node(input_flake.locked_ref.clone(), original_for_node, true);
          self.lock.add_edge(node, id, Edge::Node(child));

          if self.parents.iter().any(|parent| parent == &input_ref) {
            return Err(SolveError::CircularImport {
              reference: input_ref.to_string(),
            });
          }

          self.parents.push(input_ref.clone());
          let result = match old_lock {
            Some(old) => self.compute_locks(&input_flake.inputs, child, &input_path, Some(old), &mut input.overrides),
            None => {
              // Unless the top-level lock already covered this flake, its
              // own lock file is the baseline for its inputs.
              let child_lock = LockFile::read(&lock_file_path(&input_flake));
              match child_lock {
                Ok(child_lock) => {
                  let old = NodeRef {
                    lock: &child_lock,
                    id: child_lock.root(),
                  };
                  self.compute_locks(&input_flake.inputs, child, &input_path, Some(old), &mut input.overrides)
                }
                Err(e) => Err(e.into()),
              }
            }
          };
          self.parents.pop();
          result?;
        } else {
          let (_, _, locked_ref) =
            manifest::fetch_or_substitute(self.state, &mut self.cache, &input_ref, self.flags.use_registries)?;
          let child = self.lock.add_node(locked_ref, input_ref.clone(), false);
          self.lock.add_edge(node, id, Edge::Node(child));
        }
      }
    }

    let unused = print_overrides(overrides, input_path_prefix);
    if !unused.is_empty() {
      warn!(node = %input_path_prefix, "unused override(s): {}", unused);
    }

    Ok(())
  }
}

fn lock_file_path(flake: &Flake) -> PathBuf {
  let mut path = flake.source_info.actual_path.clone();
  if !flake.locked_ref.subdir.is_empty() {
    path.push(&flake.locked_ref.subdir);
  }
  path.push(LOCK_FILENAME);
  path
}

/// Compute an in-memory lock file for the top-level flake and, when
/// requested and possible, write it back next to the flake's manifest.
pub fn lock_flake(state: &mut EvalState<'_>, top_ref: &FlakeRef, flags: &LockFlags) -> Result<LockedFlake, SolveError> {
  let mut cache = FetchCache::new();
  let mut flake = manifest::get_flake_with_cache(state, &mut cache, top_ref, flags.use_registries)?;

  let old_lock = LockFile::read(&lock_file_path(&flake))?;
  debug!(old_lock = %old_lock, "read existing lock file");

  let mut overrides = FlakeInputs::new();
  for (path, flake_ref) in &flags.input_overrides {
    set_override(&mut overrides, path, flake_ref.clone());
  }

  let mut locker = Locker {
    state,
    flags,
    cache,
    parents: Vec::new(),
    updates_used: BTreeSet::new(),
    lock: LockFile::new(),
  };

  let root = locker.lock.root();
  let baseline = if flags.recreate_lock_file {
    None
  } else {
    Some(NodeRef {
      lock: &old_lock,
      id: old_lock.root(),
    })
  };
  locker.compute_locks(&flake.inputs, root, &InputPath::root(), baseline, &mut overrides)?;

  let Locker {
    state,
    updates_used,
    lock: new_lock,
    ..
  } = locker;

  for update in &flags.input_updates {
    if !updates_used.contains(update) {
      warn!(input = %update, "the requested input update does not match any input");
    }
  }

  new_lock.check()?;
  debug!(new_lock = %new_lock, "computed new lock file");

  if new_lock != old_lock {
    let diff = LockFile::diff(&old_lock, &new_lock);

    if flags.write_lock_file {
      let Some(source_path) = top_ref.input.source_path() else {
        return Err(SolveError::NotWritable {
          reference: top_ref.to_string(),
        });
      };

      if !new_lock.is_immutable() {
        warn!(flake = %top_ref, "will not write lock file because it has a mutable input");
      } else {
        if !flags.update_lock_file {
          return Err(SolveError::LockChangesDisallowed {
            reference: top_ref.to_string(),
          });
        }

        let rel_path = if top_ref.subdir.is_empty() {
          LOCK_FILENAME.to_string()
        } else {
          format!("{}/{}", top_ref.subdir, LOCK_FILENAME)
        };
        let path = source_path.join(&rel_path);
        let existed = path.exists();

        let summary = diff.trim_end();
        if !existed {
          warn!(path = %path.display(), "creating lock file");
        } else if summary.is_empty() {
          warn!(path = %path.display(), "updating lock file");
        } else {
          warn!(path = %path.display(), "updating lock file:\n{}", summary);
        }

        new_lock.write(&path)?;

        let commit_message = flags.commit_lock_file.then(|| {
          format!(
            "{}: {}\n\nFlake input changes:\n\n{}",
            rel_path,
            if existed { "Update" } else { "Add" },
            diff
          )
        });
        state
          .fetcher
          .mark_changed_file(&top_ref.input, &rel_path, commit_message.as_deref())?;

        // The write changed the top-level source tree, so re-read the
        // flake through a fresh cache.
        let prev_locked_ref = flake.locked_ref.clone();
        let mut fresh_cache = FetchCache::new();
        flake = manifest::get_flake_with_cache(state, &mut fresh_cache, top_ref, flags.use_registries)?;

        if flags.commit_lock_file
          && flake.locked_ref.input.rev().is_some()
          && prev_locked_ref.input.rev() != flake.locked_ref.input.rev()
        {
          warn!(rev = flake.locked_ref.input.rev().unwrap_or(""), "committed new revision");
        }

        // The tree should be dirty now; a top source that neither pins a
        // revision nor registered the change will silently keep handing
        // out the pre-write tree.
        if flake.locked_ref.input == prev_locked_ref.input && !flake.locked_ref.input.is_immutable() {
          return Err(SolveError::LockWriteDidNotTakeEffect {
            reference: flake.original_ref.to_string(),
          });
        }
      }
    } else {
      warn!(flake = %top_ref, "not writing modified lock file:\n{}", diff.trim_end());
    }
  }

  Ok(LockedFlake {
    flake,
    lock_file: new_lock,
  })
}
