//! Flake references.
//!
//! A [`FlakeRef`] pairs an [`Input`] with an optional `subdir`, the relative
//! path inside the fetched tree where the manifest lives. References come in
//! three increasingly specific forms as resolution proceeds: the *original*
//! reference written by the user, the *resolved* reference after any registry
//! lookup, and the *locked* reference returned by a fetch, which pins a
//! unique revision.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::attrs::{Attr, Attrs, AttrsError};
use crate::fetch::{FetchError, Fetcher, Tree};
use crate::input::{self, Input, IndirectInput, InputError, PathInput, Scheme};
use crate::registry::{Registry, RegistryError};
use crate::store::Store;

/// Errors raised while parsing a flake reference.
#[derive(Debug, Error)]
pub enum ParseError {
  #[error(transparent)]
  Input(#[from] InputError),

  /// A relative path reference was given where it is not allowed.
  #[error("relative flake reference '{0}' is not allowed here")]
  RelativeNotAllowed(String),

  /// The `dir` parameter is not a clean relative path.
  #[error("invalid subdirectory '{0}' in flake reference")]
  InvalidSubdir(String),
}

/// A reference to a flake: a scheme-tagged input plus the subdirectory
/// containing its manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlakeRef {
  pub input: Input,
  /// Relative path of the manifest inside the fetched tree; empty for the
  /// tree root.
  pub subdir: String,
}

fn check_subdir(subdir: &str) -> Result<(), ParseError> {
  let clean = !subdir.starts_with('/')
    && subdir
      .split('/')
      .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
  if subdir.is_empty() || clean {
    Ok(())
  } else {
    Err(ParseError::InvalidSubdir(subdir.to_string()))
  }
}

impl FlakeRef {
  pub fn new(input: Input) -> Self {
    FlakeRef {
      input,
      subdir: String::new(),
    }
  }

  /// Parse a flake reference from its URL form.
  ///
  /// Besides full URLs this accepts two shorthands:
  /// - a bare flake id (`nixpkgs`, `nixpkgs/release-21.11`), which becomes
  ///   an indirect reference, and
  /// - a filesystem path (`/some/dir`, or `./dir` when `allow_relative` is
  ///   set), which becomes a path reference, resolved against `base_dir`
  ///   if one is given.
  pub fn parse(url: &str, base_dir: Option<&Path>, allow_relative: bool) -> Result<Self, ParseError> {
    // Bare indirect shorthand: "nixpkgs", "nixpkgs/ref", "nixpkgs/ref/rev".
    let segments: Vec<&str> = url.split('/').collect();
    if input::is_flake_id(segments[0]) && segments.len() <= 3 && !url.contains(':') {
      let indirect = IndirectInput::from_segments(&segments, url)?;
      return Ok(FlakeRef::new(Input::new(Scheme::Indirect(indirect))));
    }

    // Filesystem shorthand.
    if url.starts_with('.') || url.starts_with('/') {
      if url.starts_with('.') && !allow_relative {
        return Err(ParseError::RelativeNotAllowed(url.to_string()));
      }
      let path = match base_dir {
        Some(base) if !url.starts_with('/') => base.join(url),
        _ => PathBuf::from(url),
      };
      return Ok(FlakeRef::new(Input::new(Scheme::Path(PathInput { path }))));
    }

    let (parsed, mut query) = Input::split_url(url)?;
    let subdir = query.remove("dir").unwrap_or_default();
    check_subdir(&subdir)?;
    let input = Input::from_split_url(&parsed, query)?;
    Ok(FlakeRef { input, subdir })
  }

  /// Parse a flake reference from its attribute form; the `dir` attribute
  /// becomes the subdir.
  pub fn parse_attrs(attrs: &Attrs) -> Result<Self, ParseError> {
    let mut attrs = attrs.clone();
    let subdir = match attrs.remove("dir") {
      None => String::new(),
      Some(Attr::String(s)) => s,
      Some(attr) => {
        return Err(
          InputError::from(AttrsError::WrongType {
            name: "dir".to_string(),
            expected: "string",
            got: attr.type_name(),
          })
          .into(),
        );
      }
    };
    check_subdir(&subdir)?;
    Ok(FlakeRef {
      input: Input::from_attrs(&attrs)?,
      subdir,
    })
  }

  /// Serialize to the attribute form stored in lock files.
  pub fn to_attrs(&self) -> Attrs {
    let mut attrs = self.input.to_attrs();
    if !self.subdir.is_empty() {
      attrs.insert("dir".to_string(), Attr::from(self.subdir.clone()));
    }
    attrs
  }

  /// Whether the underlying input can be fetched without a registry lookup.
  pub fn is_direct(&self) -> bool {
    self.input.is_direct()
  }

  /// Whether the underlying input pins a unique revision.
  pub fn is_immutable(&self) -> bool {
    self.input.is_immutable()
  }

  /// Resolve an indirect reference through the registry. Direct references
  /// resolve to themselves.
  pub fn resolve(&self, registry: &dyn Registry) -> Result<FlakeRef, RegistryError> {
    let Scheme::Indirect(indirect) = &self.input.scheme else {
      return Ok(self.clone());
    };

    let target = registry
      .lookup(&indirect.id)
      .ok_or_else(|| RegistryError::UnknownEntry(indirect.id.clone()))?;
    let input = target
      .input
      .apply_overrides(indirect.ref_.clone(), indirect.rev.clone())?;
    let subdir = if self.subdir.is_empty() {
      target.subdir.clone()
    } else {
      self.subdir.clone()
    };
    Ok(FlakeRef { input, subdir })
  }

  /// Fetch the referenced tree, returning it together with the fully
  /// locked form of this reference.
  pub fn fetch_tree(&self, store: &dyn Store, fetcher: &dyn Fetcher) -> Result<(Tree, FlakeRef), FetchError> {
    let (tree, locked_input) = self.input.fetch(store, fetcher)?;
    Ok((
      tree,
      FlakeRef {
        input: locked_input,
        subdir: self.subdir.clone(),
      },
    ))
  }
}

impl fmt::Display for FlakeRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let base = self.input.to_string();
    if self.subdir.is_empty() {
      write!(f, "{}", base)
    } else {
      write!(
        f,
        "{}",
        input::append_params(base, vec![("dir", self.subdir.clone())])
      )
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::registry::MemoryRegistry;

  const REV: &str = "a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0";

  mod parse {
    use super::*;

    #[test]
    fn bare_id_is_indirect() {
      let ref_ = FlakeRef::parse("nixpkgs", None, false).unwrap();
      assert!(!ref_.is_direct());
      match &ref_.input.scheme {
        Scheme::Indirect(indirect) => assert_eq!(indirect.id, "nixpkgs"),
        other => panic!("expected indirect scheme, got {:?}", other),
      }
    }

    #[test]
    fn bare_id_with_ref_and_rev() {
      let ref_ = FlakeRef::parse(&format!("nixpkgs/release-21.11/{}", REV), None, false).unwrap();
      assert_eq!(ref_.input.rev(), Some(REV));
    }

    #[test]
    fn absolute_path() {
      let ref_ = FlakeRef::parse("/some/dir", None, false).unwrap();
      assert_eq!(ref_.input.source_path(), Some(PathBuf::from("/some/dir")));
    }

    #[test]
    fn relative_path_needs_permission() {
      assert!(matches!(
        FlakeRef::parse("./tree", None, false),
        Err(ParseError::RelativeNotAllowed(_))
      ));
      let ref_ = FlakeRef::parse("./tree", Some(Path::new("/base")), true).unwrap();
      assert_eq!(ref_.input.source_path(), Some(PathBuf::from("/base/./tree")));
    }

    #[test]
    fn dir_param_becomes_subdir() {
      let ref_ = FlakeRef::parse("github:NixOS/nixpkgs?dir=lib", None, false).unwrap();
      assert_eq!(ref_.subdir, "lib");
    }

    #[test]
    fn dir_param_must_be_clean() {
      assert!(matches!(
        FlakeRef::parse("github:NixOS/nixpkgs?dir=../escape", None, false),
        Err(ParseError::InvalidSubdir(_))
      ));
    }
  }

  mod roundtrips {
    use super::*;

    fn check(url: &str) {
      let ref_ = FlakeRef::parse(url, None, true).unwrap();
      let reparsed = FlakeRef::parse(&ref_.to_string(), None, true).unwrap();
      assert_eq!(ref_, reparsed, "print/parse roundtrip of '{}'", url);

      let from_attrs = FlakeRef::parse_attrs(&ref_.to_attrs()).unwrap();
      assert_eq!(ref_, from_attrs, "attrs roundtrip of '{}'", url);
    }

    #[test]
    fn with_and_without_subdir() {
      check("github:NixOS/nixpkgs?dir=lib");
      check("github:numtide/flake-utils");
      check(&format!("git+https://example.com/repo.git?rev={}&dir=sub/dir", REV));
      check("path:/some/dir");
      check("flake:nixpkgs");
    }
  }

  mod resolve {
    use super::*;

    #[test]
    fn direct_resolves_to_itself() {
      let ref_ = FlakeRef::parse("github:NixOS/nixpkgs", None, false).unwrap();
      let registry = MemoryRegistry::new();
      assert_eq!(ref_.resolve(&registry).unwrap(), ref_);
    }

    #[test]
    fn indirect_resolves_through_registry() {
      let mut registry = MemoryRegistry::new();
      registry.add("nixpkgs", FlakeRef::parse("github:NixOS/nixpkgs", None, false).unwrap());

      let ref_ = FlakeRef::parse("nixpkgs/release-21.11", None, false).unwrap();
      let resolved = ref_.resolve(&registry).unwrap();
      match &resolved.input.scheme {
        Scheme::Github(github) => assert_eq!(github.ref_.as_deref(), Some("release-21.11")),
        other => panic!("expected github scheme, got {:?}", other),
      }
    }

    #[test]
    fn unknown_entry_fails() {
      let ref_ = FlakeRef::parse("no-such-flake", None, false).unwrap();
      let registry = MemoryRegistry::new();
      assert!(matches!(
        ref_.resolve(&registry),
        Err(RegistryError::UnknownEntry(_))
      ));
    }
  }
}
