//! Hierarchical package names.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::hash::{ObjectHash, hash_bytes};

/// A dotted hierarchical package name, e.g. `org.sw.demo.zlib`.
///
/// Comparison is case-insensitive; the canonical rendering is lower case.
/// The canonical form is fixed at construction so equality, ordering, and
/// hashing all agree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackagePath(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
  #[error("empty package path")]
  Empty,

  #[error("invalid package path component '{0}'")]
  InvalidComponent(String),
}

impl PackagePath {
  /// Parse a dotted path, normalizing to lower case.
  ///
  /// Components must be non-empty and consist of ASCII alphanumerics,
  /// `_` or `-`.
  pub fn parse(s: &str) -> Result<Self, PathError> {
    if s.is_empty() {
      return Err(PathError::Empty);
    }
    let lowered = s.to_ascii_lowercase();
    for component in lowered.split('.') {
      if component.is_empty()
        || !component.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
      {
        return Err(PathError::InvalidComponent(component.to_string()));
      }
    }
    Ok(PackagePath(lowered))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn components(&self) -> impl Iterator<Item = &str> {
    self.0.split('.')
  }

  /// The storage directory key for this path.
  pub fn storage_hash(&self) -> ObjectHash {
    hash_bytes(self.0.as_bytes())
  }
}

impl std::fmt::Display for PackagePath {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_normalizes_case() {
    let a = PackagePath::parse("Org.SW.Demo.Zlib").unwrap();
    let b = PackagePath::parse("org.sw.demo.zlib").unwrap();
    assert_eq!(a, b);
    assert_eq!(a.to_string(), "org.sw.demo.zlib");
  }

  #[test]
  fn rejects_empty_and_bad_components() {
    assert_eq!(PackagePath::parse(""), Err(PathError::Empty));
    assert!(PackagePath::parse("org..zlib").is_err());
    assert!(PackagePath::parse("org.zl ib").is_err());
  }

  #[test]
  fn storage_hash_is_case_insensitive() {
    let a = PackagePath::parse("ORG.demo").unwrap();
    let b = PackagePath::parse("org.Demo").unwrap();
    assert_eq!(a.storage_hash(), b.storage_hash());
  }
}
