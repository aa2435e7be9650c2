//! Recursive build settings.
//!
//! Settings are a nested mapping from string keys to values, nested maps,
//! or ordered arrays. Equality is structural, arrays preserve order, and
//! the canonical serialized form sorts keys, so two structurally equal
//! settings always hash identically.
//!
//! Two hash views exist: [`Settings::compute_hash`] over the full record,
//! and [`Settings::key_hash`] over the key projection used for target-map
//! addressing. The key projection removes machine-local entries
//! (`storage_dir`, `build_dir`, `caller`) recursively, so settings that
//! differ only in those address the same target slot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::util::hash::{Hashable, ObjectHash};

/// Top-level keys excluded from the key projection.
const VOLATILE_KEYS: &[&str] = &["storage_dir", "build_dir", "caller"];

/// A single settings entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
  Value(String),
  Array(Vec<SettingValue>),
  Map(Settings),
}

impl SettingValue {
  pub fn as_str(&self) -> Option<&str> {
    match self {
      SettingValue::Value(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_map(&self) -> Option<&Settings> {
    match self {
      SettingValue::Map(m) => Some(m),
      _ => None,
    }
  }

  pub fn as_array(&self) -> Option<&[SettingValue]> {
    match self {
      SettingValue::Array(a) => Some(a),
      _ => None,
    }
  }
}

impl From<&str> for SettingValue {
  fn from(s: &str) -> Self {
    SettingValue::Value(s.to_string())
  }
}

impl From<String> for SettingValue {
  fn from(s: String) -> Self {
    SettingValue::Value(s)
  }
}

/// A recursively nested, canonically serializable settings record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings {
  entries: BTreeMap<String, SettingValue>,
}

impl Hashable for Settings {}

impl Settings {
  pub fn new() -> Self {
    Settings::default()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn get(&self, key: &str) -> Option<&SettingValue> {
    self.entries.get(key)
  }

  /// Fetch a nested value by dotted path, e.g. `native.c.compiler`.
  pub fn get_path(&self, dotted: &str) -> Option<&SettingValue> {
    let mut parts = dotted.split('.');
    let first = parts.next()?;
    let mut current = self.entries.get(first)?;
    for part in parts {
      current = current.as_map()?.get(part)?;
    }
    Some(current)
  }

  pub fn set(&mut self, key: impl Into<String>, value: impl Into<SettingValue>) {
    self.entries.insert(key.into(), value.into());
  }

  pub fn remove(&mut self, key: &str) -> Option<SettingValue> {
    self.entries.remove(key)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &SettingValue)> {
    self.entries.iter()
  }

  /// Canonical byte form: JSON with sorted keys (the `BTreeMap` order).
  pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(self)
  }

  pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
    serde_json::from_slice(bytes)
  }

  /// The key projection: this record with volatile entries removed
  /// recursively.
  pub fn key_view(&self) -> Settings {
    let mut out = Settings::new();
    for (key, value) in &self.entries {
      if VOLATILE_KEYS.contains(&key.as_str()) {
        continue;
      }
      let projected = match value {
        SettingValue::Map(m) => SettingValue::Map(m.key_view()),
        other => other.clone(),
      };
      out.entries.insert(key.clone(), projected);
    }
    out
  }

  /// Hash of the key projection; the target-map address of this record.
  pub fn key_hash(&self) -> ObjectHash {
    // Serialization of a string-keyed BTreeMap cannot fail.
    self
      .key_view()
      .compute_hash()
      .expect("settings serialization is infallible")
  }
}

impl<const N: usize> From<[(&str, &str); N]> for Settings {
  fn from(pairs: [(&str, &str); N]) -> Self {
    let mut s = Settings::new();
    for (k, v) in pairs {
      s.set(k, v);
    }
    s
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample() -> Settings {
    let mut os = Settings::new();
    os.set("kernel", "linux");
    os.set("arch", "x86_64");

    let mut s = Settings::new();
    s.set("os", SettingValue::Map(os));
    s.set(
      "flags",
      SettingValue::Array(vec!["-O2".into(), "-g".into()]),
    );
    s
  }

  #[test]
  fn structural_equality() {
    assert_eq!(sample(), sample());

    let mut other = sample();
    other.set("extra", "1");
    assert_ne!(sample(), other);
  }

  #[test]
  fn canonical_roundtrip_preserves_hash() {
    let s = sample();
    let bytes = s.canonical_bytes().unwrap();
    let reparsed = Settings::from_canonical_bytes(&bytes).unwrap();

    assert_eq!(s, reparsed);
    assert_eq!(s.compute_hash().unwrap(), reparsed.compute_hash().unwrap());
  }

  #[test]
  fn hash_independent_of_insertion_order() {
    let mut a = Settings::new();
    a.set("x", "1");
    a.set("y", "2");

    let mut b = Settings::new();
    b.set("y", "2");
    b.set("x", "1");

    assert_eq!(a.compute_hash().unwrap(), b.compute_hash().unwrap());
  }

  #[test]
  fn array_order_matters() {
    let mut a = Settings::new();
    a.set("flags", SettingValue::Array(vec!["-a".into(), "-b".into()]));

    let mut b = Settings::new();
    b.set("flags", SettingValue::Array(vec!["-b".into(), "-a".into()]));

    assert_ne!(a, b);
    assert_ne!(a.compute_hash().unwrap(), b.compute_hash().unwrap());
  }

  #[test]
  fn key_projection_drops_volatile_entries() {
    let mut a = sample();
    a.set("storage_dir", "/home/alice/.sw");

    let mut b = sample();
    b.set("storage_dir", "/home/bob/.sw");

    assert_ne!(a.compute_hash().unwrap(), b.compute_hash().unwrap());
    assert_eq!(a.key_hash(), b.key_hash());
  }

  #[test]
  fn key_projection_recurses() {
    let mut inner = Settings::new();
    inner.set("build_dir", "/tmp/bd");
    inner.set("kept", "yes");

    let mut a = Settings::new();
    a.set("nested", SettingValue::Map(inner));

    let view = a.key_view();
    let nested = view.get("nested").unwrap().as_map().unwrap();
    assert!(nested.get("build_dir").is_none());
    assert_eq!(nested.get("kept").unwrap().as_str(), Some("yes"));
  }

  #[test]
  fn dotted_path_lookup() {
    let s = sample();
    assert_eq!(s.get_path("os.kernel").unwrap().as_str(), Some("linux"));
    assert!(s.get_path("os.missing").is_none());
    assert!(s.get_path("flags.x").is_none());
  }
}
