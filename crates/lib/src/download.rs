//! Package download and installation.
//!
//! For each resolved package that is not yet installed: fetch the archive
//! into `storage/tmp`, verify its hash against the registry's declaration,
//! unpack into a staging directory, rename into the package's source path,
//! and record the install in the service database. Any failure before the
//! rename removes the staging directory; a hash mismatch also unlinks the
//! downloaded file. Installs of the same package deduplicate on the
//! per-package lock.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;

use flate2::read::GzDecoder;
use tar::Archive;
use thiserror::Error;
use tracing::{debug, info};

use crate::package::{DownloadDependency, PackageId};
use crate::registry::{Registry, RegistryError};
use crate::storage::db::{DbError, ServiceDb};
use crate::storage::{Storage, StorageError};
use crate::util::hash::sha256_hex;

#[derive(Debug, Error)]
pub enum DownloadError {
  #[error("hash mismatch for {id}: expected {expected}, got {actual}")]
  HashMismatch {
    id: PackageId,
    expected: String,
    actual: String,
  },

  #[error("corrupt archive for {id}: {message}")]
  ArchiveCorrupt { id: PackageId, message: String },

  #[error("install target for {id} is occupied by different content")]
  InstallConflict { id: PackageId },

  #[error(transparent)]
  Registry(#[from] RegistryError),

  #[error(transparent)]
  Storage(#[from] StorageError),

  #[error(transparent)]
  Db(#[from] DbError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Install every dependency that is not already present.
///
/// Returns the ids actually installed (already-present packages are
/// skipped). Callers may invoke this from several threads; the per-package
/// lock plus the installed re-check under it make concurrent installs of
/// one package collapse into a single unpack.
pub fn install_dependencies(
  storage: &Storage,
  db: &ServiceDb,
  registry: &dyn Registry,
  deps: &[DownloadDependency],
) -> Result<Vec<PackageId>, DownloadError> {
  let mut installed = Vec::new();
  for dep in deps {
    if install_one(storage, db, registry, dep)? {
      installed.push(dep.id().clone());
    }
  }
  info!(installed = installed.len(), requested = deps.len(), "install pass finished");
  Ok(installed)
}

/// Install a single package. Returns false when it was already present.
pub fn install_one(
  storage: &Storage,
  db: &ServiceDb,
  registry: &dyn Registry,
  dep: &DownloadDependency,
) -> Result<bool, DownloadError> {
  let id = dep.id();
  let lock = storage.package_lock(id);
  let _guard = lock.lock().unwrap();

  let source_dir = storage.source_dir(id);
  if db.is_installed(id) && source_dir.exists() {
    debug!(package = %id, "already installed");
    return Ok(false);
  }

  if source_dir.exists() && dir_is_nonempty(&source_dir)? {
    // Occupied but not recorded as this package's install.
    if db.installed_hash(id).as_deref() != Some(dep.package.hash.as_str()) {
      return Err(DownloadError::InstallConflict { id: id.clone() });
    }
  }

  // 1. Download to scratch.
  let tmp_path = storage.download_tmp_path(id);
  registry.fetch_archive(&dep.package, &tmp_path)?;

  // 2. Verify against the declared hash.
  let bytes = fs::read(&tmp_path)?;
  let actual = sha256_hex(&bytes);
  if actual != dep.package.hash {
    fs::remove_file(&tmp_path).ok();
    return Err(DownloadError::HashMismatch {
      id: id.clone(),
      expected: dep.package.hash.clone(),
      actual,
    });
  }
  drop(bytes);

  // 3. Unpack into staging, then rename into place.
  let staging = storage.staging_dir(id);
  if staging.exists() {
    fs::remove_dir_all(&staging)?;
  }
  if let Err(err) = unpack_tar_gz(&tmp_path, &staging) {
    fs::remove_dir_all(&staging).ok();
    fs::remove_file(&tmp_path).ok();
    return Err(DownloadError::ArchiveCorrupt {
      id: id.clone(),
      message: err.to_string(),
    });
  }

  if source_dir.exists() {
    fs::remove_dir_all(&source_dir)?;
  }
  if let Some(parent) = source_dir.parent() {
    fs::create_dir_all(parent)?;
  }
  if let Err(err) = fs::rename(&staging, &source_dir) {
    fs::remove_dir_all(&staging).ok();
    fs::remove_file(&tmp_path).ok();
    return Err(DownloadError::Io(err));
  }
  fs::remove_file(&tmp_path).ok();

  // 4. Record the install.
  db.record_install(&dep.package)?;
  info!(package = %id, "installed");
  Ok(true)
}

/// Uninstall: drop the database row and delete the source directory.
pub fn uninstall(storage: &Storage, db: &ServiceDb, id: &PackageId) -> Result<bool, DownloadError> {
  let removed = db.remove_install(id)?;
  storage.remove_source(id)?;
  if removed {
    info!(package = %id, "uninstalled");
  }
  Ok(removed)
}

fn dir_is_nonempty(dir: &Path) -> std::io::Result<bool> {
  Ok(fs::read_dir(dir)?.next().is_some())
}

/// Unpack a gzipped tar, stripping the archive's single leading directory
/// component.
fn unpack_tar_gz(archive_path: &Path, dest: &Path) -> std::io::Result<()> {
  fs::create_dir_all(dest)?;
  let file = File::open(archive_path)?;
  let decoder = GzDecoder::new(BufReader::new(file));
  let mut archive = Archive::new(decoder);

  for entry in archive.entries()? {
    let mut entry = entry?;
    let path = entry.path()?;

    let stripped: std::path::PathBuf = path.components().skip(1).collect();
    if stripped.as_os_str().is_empty() {
      continue;
    }

    let dest_path = dest.join(&stripped);
    if let Some(parent) = dest_path.parent() {
      fs::create_dir_all(parent)?;
    }
    entry.unpack(&dest_path)?;
  }

  Ok(())
}
