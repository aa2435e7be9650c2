//! Versions and version ranges.
//!
//! A version is a sequence of numeric components with an optional
//! pre-release/branch suffix (`1.2.0-rc1`). Versions are totally ordered:
//! comparison is componentwise with missing components treated as zero,
//! and a plain release orders after the same numerals with a suffix.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A multi-component numeric version, e.g. `1.2.0` or `2.0-beta`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
  components: Vec<u64>,
  /// Pre-release or branch suffix. `None` is a plain release.
  extra: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
  #[error("empty version")]
  Empty,

  #[error("invalid version component '{0}'")]
  InvalidComponent(String),

  #[error("invalid version range '{0}'")]
  InvalidRange(String),
}

impl Version {
  pub fn new(components: Vec<u64>) -> Self {
    Version {
      components,
      extra: None,
    }
  }

  pub fn with_extra(components: Vec<u64>, extra: impl Into<String>) -> Self {
    Version {
      components,
      extra: Some(extra.into()),
    }
  }

  /// Parse `1.2.3` or `1.2.3-suffix`.
  pub fn parse(s: &str) -> Result<Self, VersionError> {
    if s.is_empty() {
      return Err(VersionError::Empty);
    }
    let (numerals, extra) = match s.split_once('-') {
      Some((n, e)) => (n, Some(e.to_string())),
      None => (s, None),
    };
    let mut components = Vec::new();
    for part in numerals.split('.') {
      let n: u64 = part
        .parse()
        .map_err(|_| VersionError::InvalidComponent(part.to_string()))?;
      components.push(n);
    }
    Ok(Version { components, extra })
  }

  /// Number of numeric components.
  pub fn level(&self) -> usize {
    self.components.len()
  }

  /// Truncate (or zero-extend) to exactly `level` components, dropping any
  /// suffix.
  pub fn truncate(&self, level: usize) -> Version {
    let mut components = self.components.clone();
    components.resize(level, 0);
    Version {
      components,
      extra: None,
    }
  }

  pub fn components(&self) -> &[u64] {
    &self.components
  }

  pub fn extra(&self) -> Option<&str> {
    self.extra.as_deref()
  }

  pub fn is_release(&self) -> bool {
    self.extra.is_none()
  }

  fn component(&self, i: usize) -> u64 {
    self.components.get(i).copied().unwrap_or(0)
  }
}

impl Ord for Version {
  fn cmp(&self, other: &Self) -> Ordering {
    let len = self.components.len().max(other.components.len());
    for i in 0..len {
      match self.component(i).cmp(&other.component(i)) {
        Ordering::Equal => continue,
        ord => return ord,
      }
    }
    // Same numerals: a release orders after a pre-release. A final
    // tie-break on level keeps the order consistent with structural
    // equality (`1.2` and `1.2.0` are distinct coordinates).
    match (&self.extra, &other.extra) {
      (None, None) => self.components.len().cmp(&other.components.len()),
      (None, Some(_)) => Ordering::Greater,
      (Some(_), None) => Ordering::Less,
      (Some(a), Some(b)) => a
        .cmp(b)
        .then(self.components.len().cmp(&other.components.len())),
    }
  }
}

impl PartialOrd for Version {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl std::fmt::Display for Version {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let numerals: Vec<String> = self.components.iter().map(|c| c.to_string()).collect();
    write!(f, "{}", numerals.join("."))?;
    if let Some(extra) = &self.extra {
      write!(f, "-{}", extra)?;
    }
    Ok(())
  }
}

/// A single comparison against a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CompareOp {
  Eq,
  Ge,
  Le,
  Gt,
  Lt,
}

impl CompareOp {
  fn symbol(self) -> &'static str {
    match self {
      CompareOp::Eq => "==",
      CompareOp::Ge => ">=",
      CompareOp::Le => "<=",
      CompareOp::Gt => ">",
      CompareOp::Lt => "<",
    }
  }
}

/// A conjunction of comparators, e.g. `>=1.0 <2.0`, or `*` for any version.
///
/// An empty comparator list is the universal range.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionRange {
  comparators: Vec<(CompareOp, Version)>,
}

impl VersionRange {
  /// The range matching every version.
  pub fn any() -> Self {
    VersionRange {
      comparators: Vec::new(),
    }
  }

  /// The range matching exactly one version.
  pub fn exact(version: Version) -> Self {
    VersionRange {
      comparators: vec![(CompareOp::Eq, version)],
    }
  }

  /// Parse a space-separated conjunction of comparators.
  ///
  /// A bare version is shorthand for `>=` that version (the common "at
  /// least" request). `*` is the universal range.
  pub fn parse(s: &str) -> Result<Self, VersionError> {
    let s = s.trim();
    if s.is_empty() {
      return Err(VersionError::InvalidRange(s.to_string()));
    }
    if s == "*" {
      return Ok(VersionRange::any());
    }
    let mut comparators = Vec::new();
    for token in s.split_whitespace() {
      let (op, rest) = if let Some(rest) = token.strip_prefix(">=") {
        (CompareOp::Ge, rest)
      } else if let Some(rest) = token.strip_prefix("<=") {
        (CompareOp::Le, rest)
      } else if let Some(rest) = token.strip_prefix("==") {
        (CompareOp::Eq, rest)
      } else if let Some(rest) = token.strip_prefix('>') {
        (CompareOp::Gt, rest)
      } else if let Some(rest) = token.strip_prefix('<') {
        (CompareOp::Lt, rest)
      } else {
        (CompareOp::Ge, token)
      };
      let version = Version::parse(rest).map_err(|_| VersionError::InvalidRange(s.to_string()))?;
      comparators.push((op, version));
    }
    Ok(VersionRange { comparators })
  }

  pub fn matches(&self, version: &Version) -> bool {
    self.comparators.iter().all(|(op, bound)| match op {
      CompareOp::Eq => version == bound,
      CompareOp::Ge => version >= bound,
      CompareOp::Le => version <= bound,
      CompareOp::Gt => version > bound,
      CompareOp::Lt => version < bound,
    })
  }

  /// True when the range is a single `==` pin.
  pub fn is_pin(&self) -> Option<&Version> {
    match self.comparators.as_slice() {
      [(CompareOp::Eq, v)] => Some(v),
      _ => None,
    }
  }
}

impl std::fmt::Display for VersionRange {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.comparators.is_empty() {
      return write!(f, "*");
    }
    let parts: Vec<String> = self
      .comparators
      .iter()
      .map(|(op, v)| format!("{}{}", op.symbol(), v))
      .collect();
    write!(f, "{}", parts.join(" "))
  }
}

impl std::hash::Hash for VersionRange {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    self.to_string().hash(state);
  }
}
