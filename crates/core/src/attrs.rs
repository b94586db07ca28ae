//! Attribute bags for flake references.
//!
//! A reference is, at bottom, a map from attribute names to scalar values.
//! This is the form stored in lock files (`locked` / `original` objects) and
//! the form schemes parse from and serialize to. Keys are ordered so the
//! serialized form is stable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An attribute bag, keyed by attribute name.
pub type Attrs = BTreeMap<String, Attr>;

/// A scalar attribute value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attr {
  String(String),
  Bool(bool),
  Int(u64),
}

impl Attr {
  pub fn as_str(&self) -> Option<&str> {
    match self {
      Attr::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Attr::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_int(&self) -> Option<u64> {
    match self {
      Attr::Int(n) => Some(*n),
      _ => None,
    }
  }

  /// Name of the value's type, for error messages.
  pub fn type_name(&self) -> &'static str {
    match self {
      Attr::String(_) => "string",
      Attr::Bool(_) => "bool",
      Attr::Int(_) => "int",
    }
  }
}

impl From<&str> for Attr {
  fn from(s: &str) -> Self {
    Attr::String(s.to_string())
  }
}

impl From<String> for Attr {
  fn from(s: String) -> Self {
    Attr::String(s)
  }
}

impl From<bool> for Attr {
  fn from(b: bool) -> Self {
    Attr::Bool(b)
  }
}

impl From<u64> for Attr {
  fn from(n: u64) -> Self {
    Attr::Int(n)
  }
}

/// Errors raised by typed attribute access.
#[derive(Debug, Error)]
pub enum AttrsError {
  /// A required attribute is absent.
  #[error("attribute '{0}' is missing")]
  Missing(String),

  /// An attribute has the wrong value type.
  #[error("attribute '{name}' is a {got} while a {expected} is expected")]
  WrongType {
    name: String,
    expected: &'static str,
    got: &'static str,
  },
}

/// Get a string attribute, if present.
pub fn maybe_get_str<'a>(attrs: &'a Attrs, name: &str) -> Result<Option<&'a str>, AttrsError> {
  match attrs.get(name) {
    None => Ok(None),
    Some(attr) => attr.as_str().map(Some).ok_or_else(|| AttrsError::WrongType {
      name: name.to_string(),
      expected: "string",
      got: attr.type_name(),
    }),
  }
}

/// Get a required string attribute.
pub fn get_str<'a>(attrs: &'a Attrs, name: &str) -> Result<&'a str, AttrsError> {
  maybe_get_str(attrs, name)?.ok_or_else(|| AttrsError::Missing(name.to_string()))
}

/// Get an integer attribute, if present.
pub fn maybe_get_int(attrs: &Attrs, name: &str) -> Result<Option<u64>, AttrsError> {
  match attrs.get(name) {
    None => Ok(None),
    Some(attr) => attr.as_int().map(Some).ok_or_else(|| AttrsError::WrongType {
      name: name.to_string(),
      expected: "int",
      got: attr.type_name(),
    }),
  }
}

/// Get a boolean attribute, if present.
pub fn maybe_get_bool(attrs: &Attrs, name: &str) -> Result<Option<bool>, AttrsError> {
  match attrs.get(name) {
    None => Ok(None),
    Some(attr) => attr.as_bool().map(Some).ok_or_else(|| AttrsError::WrongType {
      name: name.to_string(),
      expected: "bool",
      got: attr.type_name(),
    }),
  }
}

/// Render an attribute bag as compact JSON, for error messages.
pub fn attrs_to_json(attrs: &Attrs) -> String {
  serde_json::to_string(attrs).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample() -> Attrs {
    let mut attrs = Attrs::new();
    attrs.insert("owner".to_string(), Attr::from("NixOS"));
    attrs.insert("shallow".to_string(), Attr::from(true));
    attrs.insert("lastModified".to_string(), Attr::from(1733667300u64));
    attrs
  }

  mod typed_access {
    use super::*;

    #[test]
    fn get_str_present() {
      assert_eq!(get_str(&sample(), "owner").unwrap(), "NixOS");
    }

    #[test]
    fn get_str_missing() {
      assert!(matches!(get_str(&sample(), "repo"), Err(AttrsError::Missing(_))));
    }

    #[test]
    fn maybe_get_str_absent_is_none() {
      assert_eq!(maybe_get_str(&sample(), "repo").unwrap(), None);
    }

    #[test]
    fn wrong_type_is_reported() {
      let sample = sample();
      let result = maybe_get_str(&sample, "shallow");
      assert!(matches!(result, Err(AttrsError::WrongType { expected: "string", .. })));
    }

    #[test]
    fn int_access() {
      assert_eq!(maybe_get_int(&sample(), "lastModified").unwrap(), Some(1733667300));
      assert_eq!(maybe_get_bool(&sample(), "shallow").unwrap(), Some(true));
    }
  }

  mod serialization {
    use super::*;

    #[test]
    fn scalars_serialize_untagged() {
      let json = serde_json::to_string(&sample()).unwrap();
      assert_eq!(json, r#"{"lastModified":1733667300,"owner":"NixOS","shallow":true}"#);
    }

    #[test]
    fn roundtrip() {
      let attrs = sample();
      let json = serde_json::to_string(&attrs).unwrap();
      let back: Attrs = serde_json::from_str(&json).unwrap();
      assert_eq!(attrs, back);
    }
  }
}
