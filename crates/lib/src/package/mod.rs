//! Package identity: paths, versions, resolved and unresolved coordinates.

mod path;
mod version;

pub use path::{PackagePath, PathError};
pub use version::{CompareOp, Version, VersionError, VersionRange};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The unique coordinate of an installed package: path plus concrete
/// version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackageId {
  pub path: PackagePath,
  pub version: Version,
}

impl PackageId {
  pub fn new(path: PackagePath, version: Version) -> Self {
    PackageId { path, version }
  }
}

impl std::fmt::Display for PackageId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}-{}", self.path, self.version)
  }
}

/// A package reference before resolution: path plus version range.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnresolvedPackage {
  pub path: PackagePath,
  pub range: VersionRange,
}

#[derive(Debug, Error)]
pub enum PackageParseError {
  #[error(transparent)]
  Path(#[from] PathError),

  #[error(transparent)]
  Version(#[from] VersionError),
}

impl UnresolvedPackage {
  pub fn new(path: PackagePath, range: VersionRange) -> Self {
    UnresolvedPackage { path, range }
  }

  /// Parse `org.demo.leaf@>=1.0`. A bare path means any version.
  pub fn parse(s: &str) -> Result<Self, PackageParseError> {
    match s.split_once('@') {
      Some((path, range)) => Ok(UnresolvedPackage {
        path: PackagePath::parse(path)?,
        range: VersionRange::parse(range)?,
      }),
      None => Ok(UnresolvedPackage {
        path: PackagePath::parse(s)?,
        range: VersionRange::any(),
      }),
    }
  }
}

impl std::fmt::Display for UnresolvedPackage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}@{}", self.path, self.range)
  }
}

/// Dependency role flags.
///
/// `link` dependencies feed interface-settings propagation; `private`
/// dependencies do not resurface on consumers; `optional` dependencies may
/// be absent without failing resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DependencyFlags {
  pub link: bool,
  pub private: bool,
  pub optional: bool,
}

/// An unresolved package together with its role in the depender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
  pub unresolved: UnresolvedPackage,
  pub flags: DependencyFlags,
}

impl Dependency {
  pub fn link(unresolved: UnresolvedPackage) -> Self {
    Dependency {
      unresolved,
      flags: DependencyFlags {
        link: true,
        ..DependencyFlags::default()
      },
    }
  }
}

/// A resolved package: concrete identity plus origin metadata from the
/// registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
  pub id: PackageId,
  /// Hash of the source archive, as declared by the registry.
  pub hash: String,
  /// Archive URL; empty for locally installed packages.
  pub url: String,
  pub flags: u64,
}

/// A resolved package that must be fetched, with its own dependency list
/// as reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadDependency {
  pub package: Package,
  pub deps: Vec<UnresolvedPackage>,
}

impl DownloadDependency {
  pub fn id(&self) -> &PackageId {
    &self.package.id
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn package_id_display() {
    let id = PackageId::new(
      PackagePath::parse("org.demo.leaf").unwrap(),
      Version::parse("1.2.0").unwrap(),
    );
    assert_eq!(id.to_string(), "org.demo.leaf-1.2.0");
  }

  #[test]
  fn unresolved_parse_with_range() {
    let up = UnresolvedPackage::parse("org.demo.leaf@>=1.0").unwrap();
    assert_eq!(up.path.to_string(), "org.demo.leaf");
    assert!(up.range.matches(&Version::parse("1.5").unwrap()));
  }

  #[test]
  fn unresolved_parse_bare_path_means_any() {
    let up = UnresolvedPackage::parse("org.demo.leaf").unwrap();
    assert!(up.range.matches(&Version::parse("0.1").unwrap()));
  }

  #[test]
  fn dependency_link_constructor_sets_flag() {
    let dep = Dependency::link(UnresolvedPackage::parse("org.demo.a@*").unwrap());
    assert!(dep.flags.link);
    assert!(!dep.flags.private);
    assert!(!dep.flags.optional);
  }
}
