//! Driver dispatch: teaching the build how to turn inputs into targets.
//!
//! A driver answers two questions: which inputs does a path contain
//! (`detect_inputs`), and how do those inputs become targets
//! (`load_inputs_batch`, batched so a driver can amortize shared work).
//! Drivers are registered on the context by package id and asked in
//! registration order; they are stateless with respect to each other.
//!
//! Loading is two-phase, because package identity is not known before load
//! for source-local inputs: `load_inputs_batch` yields lazy entry points,
//! and each entry point's `load_packages` produces the actual targets,
//! filtered by a whitelist of permitted ids. Once every target is in the
//! map, `prepare_targets` lets the driver emit each target's command list
//! against fully propagated interface settings.

pub mod native;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::package::PackageId;
use crate::settings::Settings;
use crate::storage::Storage;
use crate::target::{Target, TargetMap};
use crate::util::hash::{Hashable, ObjectHash};

#[derive(Debug, Error)]
pub enum LoadError {
  #[error("no driver can load {0}")]
  NoDriverForInput(PathBuf),

  #[error("driver failed to load {path}: {message}")]
  DriverLoadFailed { path: PathBuf, message: String },

  #[error("target {0} defined by more than one input")]
  TargetRedefinition(PackageId),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// What kind of thing an input path is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputType {
  /// A build description file on its own.
  SpecificationFile,
  /// A directory carrying a build description file.
  DirectorySpecificationFile,
  /// A bare source directory without a description.
  Directory,
  /// The source tree of an installed package.
  InstalledPackage,
}

/// One loadable input, owned by the context for the lifetime of a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
  pub path: PathBuf,
  pub input_type: InputType,
  /// Driver-owned opaque payload (e.g. the package id for installed
  /// package inputs).
  pub payload: Option<String>,
}

impl Hashable for Input {}

impl Input {
  pub fn new(path: impl Into<PathBuf>, input_type: InputType) -> Self {
    Input {
      path: path.into(),
      input_type,
      payload: None,
    }
  }

  pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
    self.payload = Some(payload.into());
    self
  }

  /// The context's registry key for this input.
  pub fn key(&self) -> ObjectHash {
    self.compute_hash().expect("input serialization is infallible")
  }
}

/// An ordered mapping relative-path → file-contents identifying a build
/// description; its hash is stable under key reordering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Specification {
  files: BTreeMap<PathBuf, String>,
}

impl Hashable for Specification {}

impl Specification {
  pub fn new() -> Self {
    Specification::default()
  }

  pub fn add_file(&mut self, relative_path: impl Into<PathBuf>, contents: impl Into<String>) {
    self.files.insert(relative_path.into(), contents.into());
  }

  pub fn files(&self) -> &BTreeMap<PathBuf, String> {
    &self.files
  }

  pub fn hash(&self) -> ObjectHash {
    self.compute_hash().expect("specification serialization is infallible")
  }
}

/// A lazy target factory produced by loading an input.
pub trait TargetEntryPoint: Send + Sync {
  /// Produce targets for the ids permitted by `whitelist` (an empty
  /// whitelist permits everything).
  fn load_packages(
    &self,
    storage: &Storage,
    settings: &Settings,
    whitelist: &BTreeSet<PackageId>,
  ) -> Result<Vec<Target>, LoadError>;
}

/// A language driver.
pub trait Driver: Send + Sync {
  /// Inputs found at `path`; empty when this driver cannot load it.
  fn detect_inputs(&self, path: &Path) -> Vec<Input>;

  /// Create entry points for a batch of inputs, one vector per input in
  /// order. Batch form so a driver can amortize cross-input work.
  fn load_inputs_batch(
    &self,
    inputs: &[&Input],
  ) -> Result<Vec<Vec<Box<dyn TargetEntryPoint>>>, LoadError>;

  /// Emit command lists for this driver's targets once all interfaces are
  /// loaded into the map.
  fn prepare_targets(&self, map: &mut TargetMap, storage: &Storage) -> Result<(), LoadError> {
    let _ = (map, storage);
    Ok(())
  }
}
