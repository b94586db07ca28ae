//! floc-lib: flake resolution and locking.
//!
//! Given a reference to a top-level flake, this crate traverses the
//! transitive input graph, pins every node to an immutable fetched
//! revision, reconciles the result against a previously persisted lock
//! file, applies user overrides, and produces a new lock file that is
//! complete, consistent, and minimally changed.
//!
//! The main entry points:
//! - [`flake::manifest::get_flake`]: fetch and parse one manifest
//! - [`flake::resolve::lock_flake`]: compute (and optionally persist) a
//!   lock file
//! - [`flake::outputs::call_flake`] / [`flake::outputs::prim_get_flake`]:
//!   hand the locked flake to the evaluator
//!
//! Reference parsing, fetching, and the store interface live in
//! `floc-core`; the evaluator is abstract behind [`eval::Evaluator`].

pub mod eval;
pub mod flake;

pub use eval::{EvalError, EvalState, Evaluator, Lambda, Value};
pub use flake::lock::{Edge, LockError, LockFile, NodeId};
pub use flake::manifest::{ManifestError, get_flake};
pub use flake::outputs::{call_flake, prim_get_flake};
pub use flake::resolve::{LockFlags, SolveError, lock_flake};
pub use flake::{Flake, FlakeId, FlakeInput, FlakeInputs, InputPath, LockedFlake};
