//! The target map: PackageId → targets keyed by settings.

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::package::PackageId;
use crate::settings::Settings;

use super::Target;

/// Two-level mapping from package id to an ordered multiset of targets
/// keyed by the settings key projection.
///
/// Lookup by (id, settings) returns at most one target; inserting a second
/// target whose settings key-compare equal keeps the first. A `predefined`
/// subset marks system-provided targets that exporters filter out.
#[derive(Default)]
pub struct TargetMap {
  entries: BTreeMap<PackageId, Vec<Target>>,
  predefined: BTreeSet<PackageId>,
}

impl TargetMap {
  pub fn new() -> Self {
    TargetMap::default()
  }

  /// Insert a target. Returns true when it was added, false when an equal
  /// settings slot already exists (the earlier target is kept).
  pub fn insert(&mut self, target: Target) -> bool {
    let slot = target.settings.key_hash();
    let targets = self.entries.entry(target.id.clone()).or_default();
    if targets.iter().any(|t| t.settings.key_hash() == slot) {
      trace!(id = %target.id, "duplicate target settings, keeping first");
      return false;
    }
    targets.push(target);
    true
  }

  /// Look up the target for (id, settings) by key projection.
  pub fn find(&self, id: &PackageId, settings: &Settings) -> Option<&Target> {
    let slot = settings.key_hash();
    self
      .entries
      .get(id)?
      .iter()
      .find(|t| t.settings.key_hash() == slot)
  }

  pub fn find_mut(&mut self, id: &PackageId, settings: &Settings) -> Option<&mut Target> {
    let slot = settings.key_hash();
    self
      .entries
      .get_mut(id)?
      .iter_mut()
      .find(|t| t.settings.key_hash() == slot)
  }

  /// All targets for one package, in insertion order.
  pub fn targets_of(&self, id: &PackageId) -> &[Target] {
    self.entries.get(id).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn package_ids(&self) -> impl Iterator<Item = &PackageId> {
    self.entries.keys()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Target> {
    self.entries.values().flatten()
  }

  pub fn len(&self) -> usize {
    self.entries.values().map(Vec::len).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Mark a package's targets as system-provided.
  pub fn mark_predefined(&mut self, id: PackageId) {
    self.predefined.insert(id);
  }

  pub fn is_predefined(&self, id: &PackageId) -> bool {
    self.predefined.contains(id)
  }

  /// Targets visible to exporters: everything not predefined.
  pub fn exported(&self) -> impl Iterator<Item = &Target> {
    self
      .entries
      .iter()
      .filter(|(id, _)| !self.predefined.contains(*id))
      .flat_map(|(_, targets)| targets.iter())
  }
}
