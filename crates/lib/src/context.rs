//! The context: every long-lived collaborator as one value.
//!
//! Storage, the service database, the registry client, registered drivers,
//! detected inputs, and the build settings are owned here and threaded by
//! reference into each subsystem. Inputs and their entry points live in
//! keyed maps; downstream holders carry the key, not a reference.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, info};

use crate::driver::{Driver, Input, InputType, LoadError, TargetEntryPoint};
use crate::package::PackageId;
use crate::registry::Registry;
use crate::settings::{SettingValue, Settings};
use crate::storage::db::{DbError, ServiceDb};
use crate::storage::lock::{LockMode, StorageLock, StorageLockError};
use crate::storage::{Storage, StorageError};
use crate::util::hash::ObjectHash;

#[derive(Debug, Error)]
pub enum ContextError {
  #[error(transparent)]
  Storage(#[from] StorageError),

  #[error(transparent)]
  Db(#[from] DbError),

  #[error(transparent)]
  Lock(#[from] StorageLockError),
}

/// A cooperative stop signal shared with the executor.
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
  pub fn stop(&self) {
    self.0.store(true, Ordering::Relaxed);
  }

  pub fn is_stopped(&self) -> bool {
    self.0.load(Ordering::Relaxed)
  }
}

struct RegisteredInput {
  input: Input,
  driver: usize,
}

pub struct Context {
  storage: Storage,
  db: ServiceDb,
  registry: Box<dyn Registry>,
  drivers: Vec<(PackageId, Box<dyn Driver>)>,
  inputs: BTreeMap<ObjectHash, RegisteredInput>,
  entry_points: BTreeMap<ObjectHash, Vec<Box<dyn TargetEntryPoint>>>,
  settings: Settings,
  stop: Arc<AtomicBool>,
  /// Held for the context's lifetime; released on drop.
  _lock: StorageLock,
}

impl std::fmt::Debug for Context {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Context").finish_non_exhaustive()
  }
}

impl Context {
  /// Construct over a storage root, initializing the layout, taking the
  /// storage lock exclusively, and opening the service database.
  pub fn new(storage: Storage, registry: Box<dyn Registry>) -> Result<Self, ContextError> {
    Context::with_command(storage, registry, "sw")
  }

  /// Like [`Context::new`], labeling the storage lock with the invoking
  /// command for contention diagnostics.
  pub fn with_command(
    storage: Storage,
    registry: Box<dyn Registry>,
    command: &str,
  ) -> Result<Self, ContextError> {
    Context::open(storage, registry, command, LockMode::Exclusive)
  }

  /// Construct for a read-only command, sharing the storage lock with
  /// other readers.
  pub fn read_only(storage: Storage, registry: Box<dyn Registry>) -> Result<Self, ContextError> {
    Context::open(storage, registry, "sw", LockMode::Shared)
  }

  fn open(
    storage: Storage,
    registry: Box<dyn Registry>,
    command: &str,
    mode: LockMode,
  ) -> Result<Self, ContextError> {
    storage.init()?;
    let lock = StorageLock::acquire(storage.root(), mode, command)?;
    let db = ServiceDb::open(storage.db_dir())?;
    let mut settings = host_settings();
    settings.set("storage_dir", storage.root().display().to_string());
    Ok(Context {
      storage,
      db,
      registry,
      drivers: Vec::new(),
      inputs: BTreeMap::new(),
      entry_points: BTreeMap::new(),
      settings,
      stop: Arc::new(AtomicBool::new(false)),
      _lock: lock,
    })
  }

  pub fn storage(&self) -> &Storage {
    &self.storage
  }

  pub fn db(&self) -> &ServiceDb {
    &self.db
  }

  pub fn registry(&self) -> &dyn Registry {
    self.registry.as_ref()
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  pub fn set_settings(&mut self, settings: Settings) {
    self.settings = settings;
  }

  pub fn stop_handle(&self) -> StopHandle {
    StopHandle(self.stop.clone())
  }

  pub fn stop_flag(&self) -> &AtomicBool {
    &self.stop
  }

  /// Mark the current operation for shutdown.
  pub fn stop(&self) {
    self.stop.store(true, Ordering::Relaxed);
  }

  /// Register a driver under its package id. Drivers are consulted in
  /// registration order.
  pub fn register_driver(&mut self, id: PackageId, driver: Box<dyn Driver>) {
    info!(driver = %id, "registered driver");
    self.drivers.push((id, driver));
  }

  pub fn drivers(&self) -> impl Iterator<Item = (&PackageId, &dyn Driver)> {
    self.drivers.iter().map(|(id, d)| (id, d.as_ref()))
  }

  /// Ask every driver, in registration order, for inputs at `path`,
  /// collecting each non-empty answer. Registered inputs deduplicate by
  /// key.
  pub fn detect_inputs(&mut self, path: &Path) -> Result<Vec<ObjectHash>, LoadError> {
    let mut keys = Vec::new();
    for (driver_idx, (_, driver)) in self.drivers.iter().enumerate() {
      for input in driver.detect_inputs(path) {
        let key = input.key();
        debug!(path = %input.path.display(), ?key, "detected input");
        self
          .inputs
          .entry(key.clone())
          .or_insert(RegisteredInput { input, driver: driver_idx });
        keys.push(key);
      }
    }
    if keys.is_empty() {
      return Err(LoadError::NoDriverForInput(path.to_path_buf()));
    }
    Ok(keys)
  }

  /// Register an installed package's source tree as an input, served by
  /// the first driver that can load its path.
  pub fn add_installed_input(&mut self, id: &PackageId) -> Result<ObjectHash, LoadError> {
    let source_dir = self.storage.source_dir(id);
    let driver_idx = self
      .drivers
      .iter()
      .position(|(_, driver)| !driver.detect_inputs(&source_dir).is_empty())
      .ok_or_else(|| LoadError::NoDriverForInput(source_dir.clone()))?;

    let input = Input::new(&source_dir, InputType::InstalledPackage)
      .with_payload(format!("{}@{}", id.path, id.version));
    let key = input.key();
    self
      .inputs
      .entry(key.clone())
      .or_insert(RegisteredInput { input, driver: driver_idx });
    Ok(key)
  }

  pub fn input(&self, key: &ObjectHash) -> Option<&Input> {
    self.inputs.get(key).map(|r| &r.input)
  }

  /// Load entry points for a batch of inputs, grouped per driver so each
  /// driver sees its whole batch at once.
  pub fn load_inputs_batch(&mut self, keys: &[ObjectHash]) -> Result<(), LoadError> {
    let mut by_driver: BTreeMap<usize, Vec<ObjectHash>> = BTreeMap::new();
    for key in keys {
      if self.entry_points.contains_key(key) {
        continue;
      }
      let registered = self.inputs.get(key).ok_or_else(|| {
        LoadError::DriverLoadFailed {
          path: Default::default(),
          message: format!("unknown input key {key}"),
        }
      })?;
      by_driver.entry(registered.driver).or_default().push(key.clone());
    }

    for (driver_idx, batch_keys) in by_driver {
      let batch: Vec<&Input> = batch_keys
        .iter()
        .map(|k| &self.inputs[k].input)
        .collect();
      let loaded = self.drivers[driver_idx].1.load_inputs_batch(&batch)?;
      debug_assert_eq!(loaded.len(), batch_keys.len());
      for (key, entry_points) in batch_keys.into_iter().zip(loaded) {
        self.entry_points.insert(key, entry_points);
      }
    }
    Ok(())
  }

  pub fn entry_points(&self, key: &ObjectHash) -> &[Box<dyn TargetEntryPoint>] {
    self
      .entry_points
      .get(key)
      .map(Vec::as_slice)
      .unwrap_or(&[])
  }
}

/// Settings seeded from the host: os kernel and architecture, the default
/// build configuration.
pub fn host_settings() -> Settings {
  let mut os = Settings::new();
  os.set("kernel", std::env::consts::OS);
  os.set("arch", std::env::consts::ARCH);

  let mut settings = Settings::new();
  settings.set("os", SettingValue::Map(os));
  settings
}
