//! Interface settings: the properties a target exposes to its consumers.
//!
//! Propagation across `link` dependencies is transitive and respects the
//! PUBLIC/PRIVATE distinction: public properties (include directories,
//! definitions, link libraries) reappear on consumers, private ones do
//! not. The effective interface is a fixed point over the dependency DAG,
//! computed lazily and memoized on first read.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::package::PackageId;
use crate::settings::{SettingValue, Settings};
use crate::util::hash::ObjectHash;

use super::map::TargetMap;

/// What kind of artifact a target produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
  NativeExecutable,
  #[default]
  NativeStaticLibrary,
  NativeSharedLibrary,
}

impl TargetType {
  pub fn as_str(self) -> &'static str {
    match self {
      TargetType::NativeExecutable => "native_executable",
      TargetType::NativeStaticLibrary => "native_static_library",
      TargetType::NativeSharedLibrary => "native_shared_library",
    }
  }
}

/// Whether a link dependency's public properties re-export to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkVisibility {
  Public,
  Private,
}

/// One entry of `dependencies.link`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkDependency {
  pub id: PackageId,
  pub visibility: LinkVisibility,
  /// The settings the dependency was built with; addresses its target-map
  /// slot.
  pub settings: Settings,
}

/// The exported surface of one target.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InterfaceSettings {
  #[serde(rename = "type")]
  pub target_type: TargetType,
  pub header_only: bool,
  pub include_directories: Vec<PathBuf>,
  pub definitions: Vec<String>,
  pub link_libraries: Vec<PathBuf>,
  pub system_link_libraries: Vec<String>,
  pub import_library: Option<PathBuf>,
  pub output_file: Option<PathBuf>,
  /// Link dependencies keyed by package id string.
  pub link_dependencies: BTreeMap<String, LinkDependency>,
}

impl InterfaceSettings {
  /// The artifact consumers link against, if any.
  pub fn link_artifact(&self) -> Option<&PathBuf> {
    if self.header_only {
      return None;
    }
    match self.target_type {
      TargetType::NativeExecutable => None,
      TargetType::NativeStaticLibrary => self.output_file.as_ref(),
      TargetType::NativeSharedLibrary => self.import_library.as_ref().or(self.output_file.as_ref()),
    }
  }

  /// Render as the settings subset exporters consume.
  pub fn to_settings(&self) -> Settings {
    let mut s = Settings::new();
    s.set("type", self.target_type.as_str());
    s.set("header_only", if self.header_only { "true" } else { "false" });
    s.set("include_directories", path_array(&self.include_directories));
    s.set(
      "definitions",
      SettingValue::Array(self.definitions.iter().map(|d| d.as_str().into()).collect()),
    );
    s.set("link_libraries", path_array(&self.link_libraries));
    s.set(
      "system_link_libraries",
      SettingValue::Array(
        self.system_link_libraries.iter().map(|l| l.as_str().into()).collect(),
      ),
    );
    if let Some(lib) = &self.import_library {
      s.set("import_library", lib.display().to_string());
    }
    if let Some(out) = &self.output_file {
      s.set("output_file", out.display().to_string());
    }

    let mut deps = Settings::new();
    let mut link = Settings::new();
    for (key, dep) in &self.link_dependencies {
      link.set(key.clone(), SettingValue::Map(dep.settings.clone()));
    }
    deps.set("link", SettingValue::Map(link));
    s.set("dependencies", SettingValue::Map(deps));
    s
  }
}

fn path_array(paths: &[PathBuf]) -> SettingValue {
  SettingValue::Array(paths.iter().map(|p| p.display().to_string().into()).collect())
}

/// Lazily computed, memoized effective interfaces over a target map.
pub struct InterfaceResolver<'a> {
  map: &'a TargetMap,
  memo: HashMap<(PackageId, ObjectHash), InterfaceSettings>,
}

impl<'a> InterfaceResolver<'a> {
  pub fn new(map: &'a TargetMap) -> Self {
    InterfaceResolver {
      map,
      memo: HashMap::new(),
    }
  }

  /// The effective interface of (id, settings): the target's own interface
  /// with every public dependency's effective interface merged in.
  ///
  /// Paths and definitions deduplicate while preserving first-insertion
  /// order. A dependency revisited along a cycle contributes nothing the
  /// second time; the union is already its fixed point.
  pub fn effective(&mut self, id: &PackageId, settings: &Settings) -> InterfaceSettings {
    let mut visiting = HashSet::new();
    self.effective_inner(id, settings, &mut visiting)
  }

  fn effective_inner(
    &mut self,
    id: &PackageId,
    settings: &Settings,
    visiting: &mut HashSet<(PackageId, ObjectHash)>,
  ) -> InterfaceSettings {
    let key = (id.clone(), settings.key_hash());
    if let Some(cached) = self.memo.get(&key) {
      return cached.clone();
    }
    if !visiting.insert(key.clone()) {
      return InterfaceSettings::default();
    }

    let Some(target) = self.map.find(id, settings) else {
      visiting.remove(&key);
      return InterfaceSettings::default();
    };

    let mut effective = target.interface.clone();
    let deps: Vec<LinkDependency> = target.interface.link_dependencies.values().cloned().collect();

    for dep in deps {
      if dep.visibility != LinkVisibility::Public {
        continue;
      }
      let inherited = self.effective_inner(&dep.id, &dep.settings, visiting);
      merge_public(&mut effective, &inherited);
    }

    visiting.remove(&key);
    self.memo.insert(key, effective.clone());
    effective
  }

  /// Every artifact (id, settings) must link against: its direct and
  /// transitive link dependencies' outputs, public and private alike.
  pub fn link_closure(&mut self, id: &PackageId, settings: &Settings) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut seen_paths = HashSet::new();
    let mut seen_nodes = HashSet::new();
    self.link_closure_inner(id, settings, &mut out, &mut seen_paths, &mut seen_nodes);
    out
  }

  fn link_closure_inner(
    &mut self,
    id: &PackageId,
    settings: &Settings,
    out: &mut Vec<PathBuf>,
    seen_paths: &mut HashSet<PathBuf>,
    seen_nodes: &mut HashSet<(PackageId, ObjectHash)>,
  ) {
    let key = (id.clone(), settings.key_hash());
    if !seen_nodes.insert(key) {
      return;
    }
    let Some(target) = self.map.find(id, settings) else {
      return;
    };

    let deps: Vec<LinkDependency> = target.interface.link_dependencies.values().cloned().collect();
    for dep in deps {
      if let Some(dep_target) = self.map.find(&dep.id, &dep.settings) {
        if let Some(artifact) = dep_target.interface.link_artifact() {
          if seen_paths.insert(artifact.clone()) {
            out.push(artifact.clone());
          }
        }
      }
      self.link_closure_inner(&dep.id, &dep.settings, out, seen_paths, seen_nodes);
    }
  }
}

/// Merge the public portion of `from` into `into`, deduplicating while
/// preserving insertion order.
fn merge_public(into: &mut InterfaceSettings, from: &InterfaceSettings) {
  extend_dedup(&mut into.include_directories, &from.include_directories);
  extend_dedup(&mut into.definitions, &from.definitions);
  extend_dedup(&mut into.link_libraries, &from.link_libraries);
  extend_dedup(&mut into.system_link_libraries, &from.system_link_libraries);
}

fn extend_dedup<T: Clone + Eq + std::hash::Hash>(into: &mut Vec<T>, from: &[T]) {
  let mut seen: HashSet<T> = into.iter().cloned().collect();
  for item in from {
    if seen.insert(item.clone()) {
      into.push(item.clone());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::package::{PackagePath, Version};
  use crate::target::Target;

  fn id(path: &str, version: &str) -> PackageId {
    PackageId::new(PackagePath::parse(path).unwrap(), Version::parse(version).unwrap())
  }

  fn lib_target(pkg: &PackageId, include: &str, definition: &str) -> Target {
    let mut target = Target::new(pkg.clone(), Settings::new());
    target.interface.target_type = TargetType::NativeStaticLibrary;
    target.interface.include_directories.push(PathBuf::from(include));
    target.interface.definitions.push(definition.to_string());
    target.interface.output_file = Some(PathBuf::from(format!("/bd/lib{}.a", pkg.path)));
    target
  }

  fn link(target: &mut Target, dep: &PackageId, visibility: LinkVisibility) {
    target.interface.link_dependencies.insert(
      dep.to_string(),
      LinkDependency {
        id: dep.clone(),
        visibility,
        settings: Settings::new(),
      },
    );
  }

  #[test]
  fn public_props_propagate_transitively() {
    let a = id("org.demo.a", "1.0");
    let b = id("org.demo.b", "1.0");
    let c = id("org.demo.c", "1.0");

    let mut map = TargetMap::new();
    let mut ta = lib_target(&a, "/src/a/include", "HAVE_A");
    let mut tb = lib_target(&b, "/src/b/include", "HAVE_B");
    let tc = lib_target(&c, "/src/c/include", "HAVE_C");
    link(&mut tb, &c, LinkVisibility::Public);
    link(&mut ta, &b, LinkVisibility::Public);
    map.insert(ta);
    map.insert(tb);
    map.insert(tc);

    let mut resolver = InterfaceResolver::new(&map);
    let effective = resolver.effective(&a, &Settings::new());

    assert_eq!(
      effective.include_directories,
      vec![
        PathBuf::from("/src/a/include"),
        PathBuf::from("/src/b/include"),
        PathBuf::from("/src/c/include"),
      ]
    );
    assert!(effective.definitions.contains(&"HAVE_C".to_string()));
  }

  #[test]
  fn private_props_do_not_propagate() {
    let a = id("org.demo.a", "1.0");
    let b = id("org.demo.b", "1.0");

    let mut map = TargetMap::new();
    let mut ta = lib_target(&a, "/src/a/include", "HAVE_A");
    let tb = lib_target(&b, "/src/b/include", "HAVE_B");
    link(&mut ta, &b, LinkVisibility::Private);
    map.insert(ta);
    map.insert(tb);

    let mut resolver = InterfaceResolver::new(&map);
    let effective = resolver.effective(&a, &Settings::new());

    assert_eq!(effective.include_directories, vec![PathBuf::from("/src/a/include")]);
    assert!(!effective.definitions.contains(&"HAVE_B".to_string()));
  }

  #[test]
  fn diamond_deduplicates_preserving_order() {
    let a = id("org.demo.a", "1.0");
    let b = id("org.demo.b", "1.0");
    let c = id("org.demo.c", "1.0");
    let d = id("org.demo.d", "1.0");

    let mut map = TargetMap::new();
    let mut ta = lib_target(&a, "/a/inc", "A");
    let mut tb = lib_target(&b, "/b/inc", "B");
    let mut tc = lib_target(&c, "/c/inc", "C");
    let td = lib_target(&d, "/d/inc", "D");
    link(&mut tb, &d, LinkVisibility::Public);
    link(&mut tc, &d, LinkVisibility::Public);
    link(&mut ta, &b, LinkVisibility::Public);
    link(&mut ta, &c, LinkVisibility::Public);
    map.insert(ta);
    map.insert(tb);
    map.insert(tc);
    map.insert(td);

    let mut resolver = InterfaceResolver::new(&map);
    let effective = resolver.effective(&a, &Settings::new());

    let d_count = effective
      .include_directories
      .iter()
      .filter(|p| **p == PathBuf::from("/d/inc"))
      .count();
    assert_eq!(d_count, 1);
    assert_eq!(effective.include_directories[0], PathBuf::from("/a/inc"));
  }

  #[test]
  fn link_closure_includes_private_artifacts() {
    let a = id("org.demo.a", "1.0");
    let b = id("org.demo.b", "1.0");
    let c = id("org.demo.c", "1.0");

    let mut map = TargetMap::new();
    let mut ta = lib_target(&a, "/a/inc", "A");
    let mut tb = lib_target(&b, "/b/inc", "B");
    let tc = lib_target(&c, "/c/inc", "C");
    link(&mut tb, &c, LinkVisibility::Private);
    link(&mut ta, &b, LinkVisibility::Private);
    map.insert(ta);
    map.insert(tb);
    map.insert(tc);

    let mut resolver = InterfaceResolver::new(&map);
    let closure = resolver.link_closure(&a, &Settings::new());

    assert_eq!(
      closure,
      vec![
        PathBuf::from("/bd/liborg.demo.b.a"),
        PathBuf::from("/bd/liborg.demo.c.a"),
      ]
    );
  }

  #[test]
  fn cycles_reach_fixed_point() {
    let a = id("org.demo.a", "1.0");
    let b = id("org.demo.b", "1.0");

    let mut map = TargetMap::new();
    let mut ta = lib_target(&a, "/a/inc", "A");
    let mut tb = lib_target(&b, "/b/inc", "B");
    link(&mut ta, &b, LinkVisibility::Public);
    link(&mut tb, &a, LinkVisibility::Public);
    map.insert(ta);
    map.insert(tb);

    let mut resolver = InterfaceResolver::new(&map);
    let effective = resolver.effective(&a, &Settings::new());

    assert!(effective.include_directories.contains(&PathBuf::from("/a/inc")));
    assert!(effective.include_directories.contains(&PathBuf::from("/b/inc")));
  }

  #[test]
  fn header_only_has_no_link_artifact() {
    let a = id("org.demo.a", "1.0");
    let mut target = lib_target(&a, "/a/inc", "A");
    target.interface.header_only = true;
    assert!(target.interface.link_artifact().is_none());
  }

  #[test]
  fn to_settings_round_trips_through_canonical_form() {
    let a = id("org.demo.a", "1.0");
    let target = lib_target(&a, "/a/inc", "A");
    let settings = target.interface.to_settings();

    assert_eq!(
      settings.get("type").unwrap().as_str(),
      Some("native_static_library")
    );
    let bytes = settings.canonical_bytes().unwrap();
    let reparsed = Settings::from_canonical_bytes(&bytes).unwrap();
    assert_eq!(settings, reparsed);
  }
}
