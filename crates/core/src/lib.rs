//! floc-core: the flake reference model and its collaborators.
//!
//! This crate defines the value types the resolution core is built on:
//! - `Input` / `FlakeRef`: scheme-tagged references to source trees, with
//!   parse/print and attribute forms
//! - `Tree` and the `Fetcher` trait: fetch plumbing over external transport
//!   backends, with content-hash substitution and verification
//! - the `Store` trait and a directory-backed `LocalStore`
//! - the `Registry` trait for resolving indirect references
//! - interrupt checks honored by every blocking operation
//!
//! The lock file model and the solver live in the `floc-lib` crate.

pub mod attrs;
pub mod fetch;
pub mod hash;
pub mod input;
pub mod interrupt;
pub mod reference;
pub mod registry;
pub mod store;

pub use attrs::{Attr, Attrs};
pub use fetch::{FetchError, Fetcher, Tree};
pub use hash::Hash;
pub use input::{Input, InputError, Scheme};
pub use interrupt::{Interrupted, check_interrupt};
pub use reference::{FlakeRef, ParseError};
pub use registry::{MemoryRegistry, Registry, RegistryError};
pub use store::{LocalStore, Store, StoreError, StorePath};
