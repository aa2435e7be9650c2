//! Service database.
//!
//! Tracks installed packages, last-known command hashes, and a file
//! metadata cache. Each table is one JSON document under `storage/db/`,
//! loaded at open and rewritten on every mutation. Access is
//! single-writer, multi-reader: an `RwLock` guards the in-memory tables
//! and persistence happens while the write guard is held.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::package::{Package, PackageId, PackagePath, UnresolvedPackage, Version};
use crate::util::hash::ObjectHash;

const INSTALLED_PACKAGES: &str = "installed_packages.json";
const COMMAND_HASHES: &str = "command_hashes.json";
const INPUT_DATABASE: &str = "input_database.json";

#[derive(Debug, Error)]
pub enum DbError {
  #[error("failed to read {table}: {source}")]
  Read {
    table: &'static str,
    #[source]
    source: io::Error,
  },

  #[error("failed to write {table}: {source}")]
  Write {
    table: &'static str,
    #[source]
    source: io::Error,
  },

  #[error("corrupt table {table}: {source}")]
  Corrupt {
    table: &'static str,
    #[source]
    source: serde_json::Error,
  },
}

/// One row of `installed_packages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
  pub hash: String,
  pub flags: u64,
  pub installed_time: u64,
}

/// One row of `input_database`: cached file metadata keyed by path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
  pub size: u64,
  pub mtime: i64,
  pub content_hash: ObjectHash,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
  /// path -> version string -> row.
  installed: BTreeMap<String, BTreeMap<String, InstalledPackage>>,
  /// command hash -> unix time of last successful run.
  command_hashes: BTreeMap<String, u64>,
  /// file path -> cached metadata.
  input_database: BTreeMap<PathBuf, FileRecord>,
}

pub struct ServiceDb {
  dir: PathBuf,
  tables: RwLock<Tables>,
}

impl ServiceDb {
  /// Open the database in `dir`, loading any existing tables.
  pub fn open(dir: impl Into<PathBuf>) -> Result<Self, DbError> {
    let dir = dir.into();
    let tables = Tables {
      installed: load_table(&dir.join(INSTALLED_PACKAGES), "installed_packages")?,
      command_hashes: load_table(&dir.join(COMMAND_HASHES), "command_hashes")?,
      input_database: load_table(&dir.join(INPUT_DATABASE), "input_database")?,
    };
    Ok(ServiceDb {
      dir,
      tables: RwLock::new(tables),
    })
  }

  // --- installed_packages ---

  pub fn is_installed(&self, id: &PackageId) -> bool {
    let tables = self.tables.read().unwrap();
    tables
      .installed
      .get(id.path.as_str())
      .is_some_and(|versions| versions.contains_key(&id.version.to_string()))
  }

  /// All installed versions of a path, ascending.
  pub fn installed_versions(&self, path: &PackagePath) -> Vec<Version> {
    let tables = self.tables.read().unwrap();
    let mut versions: Vec<Version> = tables
      .installed
      .get(path.as_str())
      .map(|rows| rows.keys().filter_map(|v| Version::parse(v).ok()).collect())
      .unwrap_or_default();
    versions.sort();
    versions
  }

  /// The local-pass match: highest installed version within the range.
  pub fn match_installed(&self, unresolved: &UnresolvedPackage) -> Option<PackageId> {
    self
      .installed_versions(&unresolved.path)
      .into_iter()
      .rev()
      .find(|v| unresolved.range.matches(v))
      .map(|v| PackageId::new(unresolved.path.clone(), v))
  }

  pub fn record_install(&self, package: &Package) -> Result<(), DbError> {
    let mut tables = self.tables.write().unwrap();
    let row = InstalledPackage {
      hash: package.hash.clone(),
      flags: package.flags,
      installed_time: unix_now(),
    };
    tables
      .installed
      .entry(package.id.path.as_str().to_string())
      .or_default()
      .insert(package.id.version.to_string(), row);
    debug!(package = %package.id, "recorded install");
    self.persist_installed(&tables)
  }

  pub fn remove_install(&self, id: &PackageId) -> Result<bool, DbError> {
    let mut tables = self.tables.write().unwrap();
    let removed = match tables.installed.get_mut(id.path.as_str()) {
      Some(rows) => {
        let removed = rows.remove(&id.version.to_string()).is_some();
        if rows.is_empty() {
          tables.installed.remove(id.path.as_str());
        }
        removed
      }
      None => false,
    };
    if removed {
      self.persist_installed(&tables)?;
    }
    Ok(removed)
  }

  pub fn installed_hash(&self, id: &PackageId) -> Option<String> {
    let tables = self.tables.read().unwrap();
    tables
      .installed
      .get(id.path.as_str())
      .and_then(|rows| rows.get(&id.version.to_string()))
      .map(|row| row.hash.clone())
  }

  /// Every installed package id, for listing and GC.
  pub fn all_installed(&self) -> Vec<PackageId> {
    let tables = self.tables.read().unwrap();
    let mut out = Vec::new();
    for (path, rows) in &tables.installed {
      let Ok(path) = PackagePath::parse(path) else {
        continue;
      };
      for version in rows.keys() {
        if let Ok(version) = Version::parse(version) {
          out.push(PackageId::new(path.clone(), version));
        }
      }
    }
    out
  }

  // --- command_hashes ---

  pub fn has_command_hash(&self, hash: &ObjectHash) -> bool {
    let tables = self.tables.read().unwrap();
    tables.command_hashes.contains_key(&hash.0)
  }

  pub fn store_command_hash(&self, hash: &ObjectHash) -> Result<(), DbError> {
    let mut tables = self.tables.write().unwrap();
    tables.command_hashes.insert(hash.0.clone(), unix_now());
    self.persist_command_hashes(&tables)
  }

  pub fn forget_command_hash(&self, hash: &ObjectHash) -> Result<(), DbError> {
    let mut tables = self.tables.write().unwrap();
    if tables.command_hashes.remove(&hash.0).is_some() {
      self.persist_command_hashes(&tables)?;
    }
    Ok(())
  }

  // --- input_database ---

  pub fn file_record(&self, path: &Path) -> Option<FileRecord> {
    let tables = self.tables.read().unwrap();
    tables.input_database.get(path).cloned()
  }

  pub fn store_file_record(&self, path: &Path, record: FileRecord) -> Result<(), DbError> {
    let mut tables = self.tables.write().unwrap();
    tables.input_database.insert(path.to_path_buf(), record);
    self.persist_input_database(&tables)
  }

  // --- persistence ---

  fn persist_installed(&self, tables: &Tables) -> Result<(), DbError> {
    save_table(&self.dir.join(INSTALLED_PACKAGES), "installed_packages", &tables.installed)
  }

  fn persist_command_hashes(&self, tables: &Tables) -> Result<(), DbError> {
    save_table(&self.dir.join(COMMAND_HASHES), "command_hashes", &tables.command_hashes)
  }

  fn persist_input_database(&self, tables: &Tables) -> Result<(), DbError> {
    save_table(&self.dir.join(INPUT_DATABASE), "input_database", &tables.input_database)
  }
}

fn unix_now() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}

fn load_table<T: Default + DeserializeOwned>(path: &Path, table: &'static str) -> Result<T, DbError> {
  match fs::read(path) {
    Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| DbError::Corrupt { table, source }),
    Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(T::default()),
    Err(source) => Err(DbError::Read { table, source }),
  }
}

fn save_table<T: Serialize>(path: &Path, table: &'static str, value: &T) -> Result<(), DbError> {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).map_err(|source| DbError::Write { table, source })?;
  }
  let bytes = serde_json::to_vec_pretty(value).expect("table serialization is infallible");
  fs::write(path, bytes).map_err(|source| DbError::Write { table, source })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::package::VersionRange;
  use tempfile::TempDir;

  fn pkg(path: &str, version: &str) -> Package {
    Package {
      id: PackageId::new(PackagePath::parse(path).unwrap(), Version::parse(version).unwrap()),
      hash: "h".to_string(),
      url: String::new(),
      flags: 0,
    }
  }

  fn unresolved(path: &str, range: &str) -> UnresolvedPackage {
    UnresolvedPackage::new(PackagePath::parse(path).unwrap(), VersionRange::parse(range).unwrap())
  }

  #[test]
  fn record_and_query_install() {
    let temp = TempDir::new().unwrap();
    let db = ServiceDb::open(temp.path()).unwrap();
    let p = pkg("org.demo.leaf", "1.2.0");

    assert!(!db.is_installed(&p.id));
    db.record_install(&p).unwrap();
    assert!(db.is_installed(&p.id));
    assert_eq!(db.installed_hash(&p.id).as_deref(), Some("h"));
  }

  #[test]
  fn persistence_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let p = pkg("org.demo.leaf", "1.2.0");
    {
      let db = ServiceDb::open(temp.path()).unwrap();
      db.record_install(&p).unwrap();
    }
    let db = ServiceDb::open(temp.path()).unwrap();
    assert!(db.is_installed(&p.id));
  }

  #[test]
  fn match_installed_picks_highest_in_range() {
    let temp = TempDir::new().unwrap();
    let db = ServiceDb::open(temp.path()).unwrap();
    db.record_install(&pkg("org.demo.leaf", "1.0.0")).unwrap();
    db.record_install(&pkg("org.demo.leaf", "1.4.0")).unwrap();
    db.record_install(&pkg("org.demo.leaf", "2.0.0")).unwrap();

    let hit = db.match_installed(&unresolved("org.demo.leaf", ">=1.0 <2.0")).unwrap();
    assert_eq!(hit.version, Version::parse("1.4.0").unwrap());

    assert!(db.match_installed(&unresolved("org.demo.leaf", ">=3.0")).is_none());
    assert!(db.match_installed(&unresolved("org.demo.other", "*")).is_none());
  }

  #[test]
  fn remove_install_deletes_row() {
    let temp = TempDir::new().unwrap();
    let db = ServiceDb::open(temp.path()).unwrap();
    let p = pkg("org.demo.leaf", "1.2.0");
    db.record_install(&p).unwrap();

    assert!(db.remove_install(&p.id).unwrap());
    assert!(!db.is_installed(&p.id));
    assert!(!db.remove_install(&p.id).unwrap());
  }

  #[test]
  fn command_hash_roundtrip() {
    let temp = TempDir::new().unwrap();
    let db = ServiceDb::open(temp.path()).unwrap();
    let h = ObjectHash("cmd123".to_string());

    assert!(!db.has_command_hash(&h));
    db.store_command_hash(&h).unwrap();
    assert!(db.has_command_hash(&h));
    db.forget_command_hash(&h).unwrap();
    assert!(!db.has_command_hash(&h));
  }

  #[test]
  fn file_record_roundtrip() {
    let temp = TempDir::new().unwrap();
    let db = ServiceDb::open(temp.path()).unwrap();
    let record = FileRecord {
      size: 10,
      mtime: 123,
      content_hash: ObjectHash("abc".to_string()),
    };

    db.store_file_record(Path::new("/src/a.c"), record.clone()).unwrap();
    assert_eq!(db.file_record(Path::new("/src/a.c")), Some(record));
    assert!(db.file_record(Path::new("/src/b.c")).is_none());
  }
}
