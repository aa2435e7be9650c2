//! On-disk storage layout.
//!
//! Everything lives under a single root, overridable with `SW_STORAGE`:
//!
//! ```text
//! <root>/
//! ├── etc/                                  # global configuration
//! └── storage/
//!     ├── pkg/<path-hash>/<version>/        # per-package source tree
//!     │   └── bd/<settings-hash>/           # build dir for one settings
//!     ├── tmp/                              # downloads, staging
//!     └── db/                               # service database
//! ```

pub mod db;
pub mod lock;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::info;

use crate::consts::{APP_NAME, STORAGE_ENV};
use crate::package::PackageId;
use crate::util::hash::ObjectHash;

#[derive(Debug, Error)]
pub enum StorageError {
  #[error("io error: {0}")]
  Io(#[from] io::Error),
}

/// Deterministic path layout plus per-package install locks.
pub struct Storage {
  root: PathBuf,
  pkg_locks: Mutex<HashMap<PackageId, Arc<Mutex<()>>>>,
}

impl Storage {
  /// Root from `SW_STORAGE`, falling back to the XDG data dir.
  pub fn detect() -> Self {
    let root = std::env::var(STORAGE_ENV)
      .map(PathBuf::from)
      .unwrap_or_else(|_| default_root());
    Storage::with_root(root)
  }

  pub fn with_root(root: impl Into<PathBuf>) -> Self {
    Storage {
      root: root.into(),
      pkg_locks: Mutex::new(HashMap::new()),
    }
  }

  /// Create the directory skeleton.
  pub fn init(&self) -> Result<(), StorageError> {
    fs::create_dir_all(self.etc_dir())?;
    fs::create_dir_all(self.pkg_dir())?;
    fs::create_dir_all(self.tmp_dir())?;
    fs::create_dir_all(self.db_dir())?;
    info!(root = %self.root.display(), "initialized storage");
    Ok(())
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn etc_dir(&self) -> PathBuf {
    self.root.join("etc")
  }

  pub fn pkg_dir(&self) -> PathBuf {
    self.root.join("storage").join("pkg")
  }

  pub fn tmp_dir(&self) -> PathBuf {
    self.root.join("storage").join("tmp")
  }

  pub fn db_dir(&self) -> PathBuf {
    self.root.join("storage").join("db")
  }

  /// Source directory for an installed package.
  pub fn source_dir(&self, id: &PackageId) -> PathBuf {
    self
      .pkg_dir()
      .join(id.path.storage_hash().0)
      .join(id.version.to_string())
  }

  /// Build directory for (package, settings key hash).
  pub fn build_dir(&self, id: &PackageId, settings_hash: &ObjectHash) -> PathBuf {
    self.source_dir(id).join("bd").join(&settings_hash.0)
  }

  /// Scratch path for an in-flight download.
  pub fn download_tmp_path(&self, id: &PackageId) -> PathBuf {
    self.tmp_dir().join(format!("{}.dl", id))
  }

  /// Staging directory unpacked into before the atomic rename.
  pub fn staging_dir(&self, id: &PackageId) -> PathBuf {
    self.tmp_dir().join(format!("{}.stage", id))
  }

  /// The per-package lock guarding unpack and delete.
  ///
  /// Two installs of the same package serialize on this; distinct packages
  /// proceed concurrently.
  pub fn package_lock(&self, id: &PackageId) -> Arc<Mutex<()>> {
    let mut locks = self.pkg_locks.lock().unwrap();
    locks.entry(id.clone()).or_default().clone()
  }

  /// Remove a package's source directory (uninstall).
  pub fn remove_source(&self, id: &PackageId) -> Result<(), StorageError> {
    let lock = self.package_lock(id);
    let _guard = lock.lock().unwrap();
    let dir = self.source_dir(id);
    if dir.exists() {
      fs::remove_dir_all(&dir)?;
    }
    Ok(())
  }
}

#[cfg(windows)]
fn default_root() -> PathBuf {
  let base = std::env::var("LOCALAPPDATA").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."));
  base.join(APP_NAME)
}

#[cfg(not(windows))]
fn default_root() -> PathBuf {
  let data_home = std::env::var("XDG_DATA_HOME").map(PathBuf::from).unwrap_or_else(|_| {
    let home = std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."));
    home.join(".local").join("share")
  });
  data_home.join(APP_NAME)
}
