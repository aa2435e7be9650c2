//! Dependency resolution.
//!
//! Turns a set of unresolved package references into a pinned, transitively
//! closed set of concrete package ids, using the service database first and
//! the remote registry for the rest.
//!
//! # Algorithm
//!
//! 1. Local pass (skipped when `query_local_db` is off): each reference is
//!    matched against installed packages; the highest installed version in
//!    range wins.
//! 2. Remote pass: the remaining references go to the registry in one
//!    batch. With `force_server_query`, local hits are re-checked against
//!    the remote to detect superseded identities.
//! 3. Closure: dependencies reported by the registry join the worklist;
//!    passes repeat until the worklist drains. A seen-set keeps dependency
//!    cycles from expanding forever.
//! 4. Conflict reconciliation: when one path resolves to several versions,
//!    an exact pin from a direct root wins, two conflicting pins fail, and
//!    otherwise the highest version wins.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::package::{DownloadDependency, PackageId, PackagePath, UnresolvedPackage, Version};
use crate::registry::{Registry, RegistryError};
use crate::storage::db::ServiceDb;

#[derive(Debug, Error)]
pub enum ResolveError {
  #[error("conflicting pins for {path}: {first} vs {second}")]
  ConflictingPins {
    path: PackagePath,
    first: Version,
    second: Version,
  },

  #[error(transparent)]
  Registry(#[from] RegistryError),

  #[error("unresolvable dependencies: {}", format_refs(.0))]
  Unresolvable(Vec<UnresolvedPackage>),
}

fn format_refs(refs: &[UnresolvedPackage]) -> String {
  let parts: Vec<String> = refs.iter().map(|r| r.to_string()).collect();
  parts.join(", ")
}

/// Resolution controls, normally derived from the build settings.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
  /// Consult the service database before the registry.
  pub query_local_db: bool,
  /// Re-check local matches against the registry.
  pub force_server_query: bool,
  /// Permit remote passes at all (`SW_NO_NETWORK` clears this).
  pub allow_network: bool,
}

impl Default for ResolveOptions {
  fn default() -> Self {
    ResolveOptions {
      query_local_db: true,
      force_server_query: false,
      allow_network: true,
    }
  }
}

/// The outcome of a resolution run.
#[derive(Debug, Default)]
pub struct Resolution {
  /// Every reference reached, mapped to its pinned identity.
  pub resolved: BTreeMap<UnresolvedPackage, PackageId>,
  /// Packages that must be fetched and installed.
  pub downloads: Vec<DownloadDependency>,
  /// References no source could satisfy.
  pub unresolved: Vec<UnresolvedPackage>,
}

impl Resolution {
  /// Fail if anything stayed unresolved.
  pub fn ensure_complete(self) -> Result<Resolution, ResolveError> {
    if self.unresolved.is_empty() {
      Ok(self)
    } else {
      Err(ResolveError::Unresolvable(self.unresolved))
    }
  }

  pub fn id_for(&self, reference: &UnresolvedPackage) -> Option<&PackageId> {
    self.resolved.get(reference)
  }

  /// Distinct pinned identities, sorted.
  pub fn packages(&self) -> Vec<PackageId> {
    let set: BTreeSet<PackageId> = self.resolved.values().cloned().collect();
    set.into_iter().collect()
  }
}

pub struct Resolver<'a> {
  db: &'a ServiceDb,
  registry: &'a dyn Registry,
  options: ResolveOptions,
}

impl<'a> Resolver<'a> {
  pub fn new(db: &'a ServiceDb, registry: &'a dyn Registry, options: ResolveOptions) -> Self {
    Resolver { db, registry, options }
  }

  /// Resolve `roots` and the transitive closure of their dependencies.
  pub fn resolve(&self, roots: &[UnresolvedPackage]) -> Result<Resolution, ResolveError> {
    let root_set: BTreeSet<UnresolvedPackage> = roots.iter().cloned().collect();
    let mut worklist: BTreeSet<UnresolvedPackage> = root_set.clone();
    let mut seen: HashSet<UnresolvedPackage> = HashSet::new();

    let mut resolution = Resolution::default();
    // Registry dependency lists per reference; used to prune downloads of
    // conflict losers.
    let mut downloads: BTreeMap<PackageId, DownloadDependency> = BTreeMap::new();

    info!(roots = roots.len(), "resolving dependencies");

    while !worklist.is_empty() {
      let pending: Vec<UnresolvedPackage> = worklist
        .iter()
        .filter(|u| !seen.contains(*u))
        .cloned()
        .collect();
      worklist.clear();
      if pending.is_empty() {
        break;
      }

      let mut remote_batch: Vec<UnresolvedPackage> = Vec::new();

      // Local pass.
      for reference in &pending {
        seen.insert(reference.clone());

        if self.options.query_local_db {
          if let Some(id) = self.db.match_installed(reference) {
            trace!(reference = %reference, id = %id, "matched installed package");
            resolution.resolved.insert(reference.clone(), id);
            if self.options.force_server_query {
              remote_batch.push(reference.clone());
            }
            continue;
          }
        }
        remote_batch.push(reference.clone());
      }

      if remote_batch.is_empty() {
        continue;
      }

      // Remote pass.
      if !self.options.allow_network {
        for reference in remote_batch {
          if !resolution.resolved.contains_key(&reference) {
            resolution.unresolved.push(reference);
          }
        }
        continue;
      }

      debug!(count = remote_batch.len(), "querying registry");
      let batch = self.registry.resolve_packages(&remote_batch)?;

      for entry in batch.resolved {
        let id = entry.package.id.clone();
        // An entry answers exactly the references its version satisfies;
        // two references to one path may legitimately pin two versions
        // here, and reconciliation collapses them later.
        for reference in remote_batch
          .iter()
          .filter(|r| r.path == id.path && r.range.matches(&id.version))
        {
          resolution.resolved.insert(reference.clone(), id.clone());
        }

        for dep in &entry.deps {
          if !seen.contains(dep) {
            worklist.insert(dep.clone());
          }
        }
        downloads.entry(id).or_insert(entry);
      }

      for reference in batch.unresolved {
        if !resolution.resolved.contains_key(&reference) {
          resolution.unresolved.push(reference);
        }
      }

      // A reference answered by nothing (a protocol-level mismatch) must
      // still surface as unresolved rather than vanish.
      for reference in remote_batch {
        if !resolution.resolved.contains_key(&reference)
          && !resolution.unresolved.contains(&reference)
        {
          resolution.unresolved.push(reference);
        }
      }
    }

    self.reconcile(&root_set, &mut resolution, &mut downloads)?;

    resolution.downloads = downloads.into_values().collect();
    info!(
      resolved = resolution.resolved.len(),
      downloads = resolution.downloads.len(),
      unresolved = resolution.unresolved.len(),
      "resolution finished"
    );
    Ok(resolution)
  }

  /// Collapse multi-version paths to a single winner, or fail on
  /// irreconcilable pins.
  fn reconcile(
    &self,
    roots: &BTreeSet<UnresolvedPackage>,
    resolution: &mut Resolution,
    downloads: &mut BTreeMap<PackageId, DownloadDependency>,
  ) -> Result<(), ResolveError> {
    let mut by_path: BTreeMap<PackagePath, BTreeSet<Version>> = BTreeMap::new();
    for id in resolution.resolved.values() {
      by_path.entry(id.path.clone()).or_default().insert(id.version.clone());
    }

    for (path, versions) in by_path {
      if versions.len() < 2 {
        continue;
      }

      // Exact pins demanded for this path, split by whether the pinning
      // reference is a direct root.
      let mut root_pins: BTreeSet<Version> = BTreeSet::new();
      let mut pins: BTreeSet<Version> = BTreeSet::new();
      for (reference, id) in &resolution.resolved {
        if id.path != path {
          continue;
        }
        if reference.range.is_pin().is_some() {
          pins.insert(id.version.clone());
          if roots.contains(reference) {
            root_pins.insert(id.version.clone());
          }
        }
      }

      let winner = if root_pins.len() > 1 {
        let mut it = root_pins.into_iter();
        let first = it.next().unwrap();
        let second = it.next().unwrap();
        return Err(ResolveError::ConflictingPins { path, first, second });
      } else if let Some(v) = root_pins.into_iter().next() {
        v
      } else if pins.len() > 1 {
        let mut it = pins.into_iter();
        let first = it.next().unwrap();
        let second = it.next().unwrap();
        return Err(ResolveError::ConflictingPins { path, first, second });
      } else if let Some(v) = pins.into_iter().next() {
        v
      } else {
        versions.iter().max().unwrap().clone()
      };

      debug!(path = %path, winner = %winner, "reconciled version conflict");

      for version in versions {
        if version != winner {
          downloads.remove(&PackageId::new(path.clone(), version));
        }
      }
      for id in resolution.resolved.values_mut() {
        if id.path == path && id.version != winner {
          id.version = winner.clone();
        }
      }
    }
    Ok(())
  }
}
