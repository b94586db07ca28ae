//! Content hashes for trees and lock fingerprints.
//!
//! Fetched trees are identified by a SHA-256 digest over their serialized
//! contents. Hashes render in two forms:
//! - SRI: `sha256-<base64>` — the form stored in reference attributes and
//!   lock files.
//! - Hex: 64 lowercase hex characters — used for store labels.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Number of bytes in a SHA-256 digest.
const HASH_BYTES: usize = 32;

/// Errors that can occur when parsing a hash.
#[derive(Debug, Error)]
pub enum HashError {
  /// The string is neither an SRI hash nor a 64-character hex string.
  #[error("invalid hash '{0}', expected 'sha256-<base64>' or 64 hex characters")]
  Invalid(String),

  /// The hash names an algorithm other than SHA-256.
  #[error("unsupported hash algorithm in '{0}', only sha256 is supported")]
  UnsupportedAlgorithm(String),
}

/// A SHA-256 content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; HASH_BYTES]);

impl Hash {
  /// Hash a byte slice.
  pub fn of_bytes(data: &[u8]) -> Self {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Self(hasher.finalize().into())
  }

  /// Hash a string.
  pub fn of_string(data: &str) -> Self {
    Self::of_bytes(data.as_bytes())
  }

  /// Parse a hash from its SRI (`sha256-<base64>`) or bare hex form.
  pub fn parse(s: &str) -> Result<Self, HashError> {
    if let Some((algo, rest)) = s.split_once('-') {
      if algo != "sha256" {
        return Err(HashError::UnsupportedAlgorithm(s.to_string()));
      }
      let bytes = BASE64.decode(rest).map_err(|_| HashError::Invalid(s.to_string()))?;
      let bytes: [u8; HASH_BYTES] = bytes.try_into().map_err(|_| HashError::Invalid(s.to_string()))?;
      return Ok(Self(bytes));
    }

    if s.len() == HASH_BYTES * 2 && s.chars().all(|c| c.is_ascii_hexdigit()) {
      let mut bytes = [0u8; HASH_BYTES];
      for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16).ok_or_else(|| HashError::Invalid(s.to_string()))?;
        let lo = (chunk[1] as char).to_digit(16).ok_or_else(|| HashError::Invalid(s.to_string()))?;
        bytes[i] = (hi * 16 + lo) as u8;
      }
      return Ok(Self(bytes));
    }

    Err(HashError::Invalid(s.to_string()))
  }

  /// Render as an SRI string (`sha256-<base64>`).
  pub fn to_sri(&self) -> String {
    format!("sha256-{}", BASE64.encode(self.0))
  }

  /// Render as lowercase hex.
  pub fn to_hex(&self) -> String {
    let mut out = String::with_capacity(HASH_BYTES * 2);
    for b in self.0 {
      out.push_str(&format!("{:02x}", b));
    }
    out
  }
}

impl From<[u8; HASH_BYTES]> for Hash {
  fn from(bytes: [u8; HASH_BYTES]) -> Self {
    Self(bytes)
  }
}

impl fmt::Display for Hash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.to_sri())
  }
}

impl Serialize for Hash {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_sri())
  }
}

impl<'de> Deserialize<'de> for Hash {
  fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    Hash::parse(&s).map_err(serde::de::Error::custom)
  }
}
