//! Remote registry contract.
//!
//! The registry exposes a single idempotent endpoint, `resolve_packages`:
//! a batch of `{path, range}` references answered with resolved identities
//! (version, archive hash, url, own dependency list) plus the subset it
//! could not satisfy. Archive bytes are fetched separately by URL.
//!
//! [`HttpRegistry`] speaks this contract over HTTP with bounded
//! exponential-backoff retry. [`MemoryRegistry`] is the in-process
//! implementation used by tests and offline tooling.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::consts::{RETRY_FACTOR, RETRY_INITIAL_MS, RETRY_MAX_ATTEMPTS};
use crate::package::{
  DownloadDependency, Package, PackageId, PackagePath, UnresolvedPackage, Version, VersionRange,
};
use crate::util::hash::sha256_hex;

#[derive(Debug, Error)]
pub enum RegistryError {
  #[error("registry unreachable after {attempts} attempts: {message}")]
  Unreachable { attempts: u32, message: String },

  #[error("registry protocol error: {0}")]
  Protocol(String),

  #[error("archive fetch failed for {url}: {message}")]
  Fetch { url: String, message: String },
}

// --- wire types (request/response contract) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRef {
  pub path: String,
  pub range: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResolved {
  pub path: String,
  pub version: String,
  pub hash: String,
  pub url: String,
  #[serde(default)]
  pub flags: u64,
  #[serde(default)]
  pub deps: Vec<WireRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireResponse {
  #[serde(default)]
  pub resolved: Vec<WireResolved>,
  #[serde(default)]
  pub unresolved: Vec<WireRef>,
}

/// A typed `resolve_packages` answer.
#[derive(Debug, Default)]
pub struct ResolvedBatch {
  pub resolved: Vec<DownloadDependency>,
  pub unresolved: Vec<UnresolvedPackage>,
}

impl ResolvedBatch {
  fn from_wire(wire: WireResponse) -> Result<Self, RegistryError> {
    let mut batch = ResolvedBatch::default();
    for entry in wire.resolved {
      let path = PackagePath::parse(&entry.path)
        .map_err(|e| RegistryError::Protocol(format!("bad path '{}': {}", entry.path, e)))?;
      let version = Version::parse(&entry.version)
        .map_err(|e| RegistryError::Protocol(format!("bad version '{}': {}", entry.version, e)))?;
      let mut deps = Vec::new();
      for dep in entry.deps {
        deps.push(parse_wire_ref(&dep)?);
      }
      batch.resolved.push(DownloadDependency {
        package: Package {
          id: PackageId::new(path, version),
          hash: entry.hash,
          url: entry.url,
          flags: entry.flags,
        },
        deps,
      });
    }
    for entry in wire.unresolved {
      batch.unresolved.push(parse_wire_ref(&entry)?);
    }
    Ok(batch)
  }
}

fn parse_wire_ref(wire: &WireRef) -> Result<UnresolvedPackage, RegistryError> {
  let path = PackagePath::parse(&wire.path)
    .map_err(|e| RegistryError::Protocol(format!("bad path '{}': {}", wire.path, e)))?;
  let range = VersionRange::parse(&wire.range)
    .map_err(|e| RegistryError::Protocol(format!("bad range '{}': {}", wire.range, e)))?;
  Ok(UnresolvedPackage::new(path, range))
}

fn to_wire_refs(batch: &[UnresolvedPackage]) -> Vec<WireRef> {
  batch
    .iter()
    .map(|u| WireRef {
      path: u.path.to_string(),
      range: u.range.to_string(),
    })
    .collect()
}

/// The registry capability used by the resolver and downloader.
pub trait Registry: Send + Sync {
  /// Resolve a batch of references. Idempotent.
  fn resolve_packages(&self, batch: &[UnresolvedPackage]) -> Result<ResolvedBatch, RegistryError>;

  /// Fetch a resolved package's archive into `dest`.
  fn fetch_archive(&self, package: &Package, dest: &Path) -> Result<(), RegistryError>;
}

/// Retry schedule for registry RPC.
#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
  pub initial: Duration,
  pub factor: u32,
  pub max_attempts: u32,
}

impl Default for RetrySchedule {
  fn default() -> Self {
    RetrySchedule {
      initial: Duration::from_millis(RETRY_INITIAL_MS),
      factor: RETRY_FACTOR,
      max_attempts: RETRY_MAX_ATTEMPTS,
    }
  }
}

/// Run `op` under the schedule, sleeping between failed attempts.
pub fn with_retry<T, F>(schedule: &RetrySchedule, mut op: F) -> Result<T, RegistryError>
where
  F: FnMut() -> Result<T, String>,
{
  let mut delay = schedule.initial;
  let mut last = String::new();
  for attempt in 1..=schedule.max_attempts {
    match op() {
      Ok(value) => return Ok(value),
      Err(message) => {
        warn!(attempt, error = %message, "registry request failed");
        last = message;
        if attempt < schedule.max_attempts {
          std::thread::sleep(delay);
          delay *= schedule.factor;
        }
      }
    }
  }
  Err(RegistryError::Unreachable {
    attempts: schedule.max_attempts,
    message: last,
  })
}

/// HTTP registry client.
pub struct HttpRegistry {
  base_url: String,
  client: reqwest::blocking::Client,
  schedule: RetrySchedule,
}

impl HttpRegistry {
  pub fn new(base_url: impl Into<String>) -> Self {
    HttpRegistry {
      base_url: base_url.into(),
      client: reqwest::blocking::Client::new(),
      schedule: RetrySchedule::default(),
    }
  }

  pub fn with_schedule(mut self, schedule: RetrySchedule) -> Self {
    self.schedule = schedule;
    self
  }
}

impl Registry for HttpRegistry {
  fn resolve_packages(&self, batch: &[UnresolvedPackage]) -> Result<ResolvedBatch, RegistryError> {
    let request = to_wire_refs(batch);
    let url = format!("{}/resolvePackages", self.base_url.trim_end_matches('/'));
    debug!(count = batch.len(), url = %url, "resolving batch against registry");

    let wire: WireResponse = with_retry(&self.schedule, || {
      let response = self
        .client
        .post(&url)
        .json(&request)
        .send()
        .map_err(|e| e.to_string())?;
      let response = response.error_for_status().map_err(|e| e.to_string())?;
      response.json::<WireResponse>().map_err(|e| e.to_string())
    })?;

    ResolvedBatch::from_wire(wire)
  }

  fn fetch_archive(&self, package: &Package, dest: &Path) -> Result<(), RegistryError> {
    let bytes = with_retry(&self.schedule, || {
      let response = self.client.get(&package.url).send().map_err(|e| e.to_string())?;
      let response = response.error_for_status().map_err(|e| e.to_string())?;
      response.bytes().map_err(|e| e.to_string())
    })?;

    if let Some(parent) = dest.parent() {
      std::fs::create_dir_all(parent).map_err(|e| RegistryError::Fetch {
        url: package.url.clone(),
        message: e.to_string(),
      })?;
    }
    std::fs::write(dest, &bytes).map_err(|e| RegistryError::Fetch {
      url: package.url.clone(),
      message: e.to_string(),
    })
  }
}

/// An in-process registry: a fixed package universe with archives held in
/// memory. Answers are produced in sorted-path order regardless of request
/// order, so callers relying on response order fail fast in tests.
#[derive(Default)]
pub struct MemoryRegistry {
  packages: BTreeMap<PackagePath, BTreeMap<Version, MemoryPackage>>,
  resolve_calls: Mutex<u32>,
}

struct MemoryPackage {
  hash: String,
  archive: Vec<u8>,
  deps: Vec<UnresolvedPackage>,
}

impl MemoryRegistry {
  pub fn new() -> Self {
    MemoryRegistry::default()
  }

  /// Register a version whose archive is a gzipped tar of `files`
  /// (relative path, contents).
  pub fn add_package(&mut self, reference: &str, deps: &[&str], files: &[(&str, &str)]) {
    let (path, version) = reference
      .split_once('@')
      .expect("reference must be path@version");
    let path = PackagePath::parse(path).expect("valid path");
    let version = Version::parse(version).expect("valid version");

    let archive = build_archive(files);
    let hash = sha256_hex(&archive);
    let deps = deps
      .iter()
      .map(|d| UnresolvedPackage::parse(d).expect("valid dep"))
      .collect();

    self
      .packages
      .entry(path)
      .or_default()
      .insert(version, MemoryPackage { hash, archive, deps });
  }

  /// Number of `resolve_packages` calls served, for batching assertions.
  pub fn resolve_calls(&self) -> u32 {
    *self.resolve_calls.lock().unwrap()
  }

  fn best_match(&self, unresolved: &UnresolvedPackage) -> Option<(&Version, &MemoryPackage)> {
    self
      .packages
      .get(&unresolved.path)?
      .iter()
      .rev()
      .find(|(version, _)| unresolved.range.matches(version))
  }
}

impl Registry for MemoryRegistry {
  fn resolve_packages(&self, batch: &[UnresolvedPackage]) -> Result<ResolvedBatch, RegistryError> {
    *self.resolve_calls.lock().unwrap() += 1;

    let mut sorted: Vec<&UnresolvedPackage> = batch.iter().collect();
    sorted.sort_by(|a, b| (&a.path, a.range.to_string()).cmp(&(&b.path, b.range.to_string())));

    let mut out = ResolvedBatch::default();
    for unresolved in sorted {
      match self.best_match(unresolved) {
        Some((version, entry)) => out.resolved.push(DownloadDependency {
          package: Package {
            id: PackageId::new(unresolved.path.clone(), version.clone()),
            hash: entry.hash.clone(),
            url: format!("mem://{}-{}", unresolved.path, version),
            flags: 0,
          },
          deps: entry.deps.clone(),
        }),
        None => out.unresolved.push(unresolved.clone()),
      }
    }
    Ok(out)
  }

  fn fetch_archive(&self, package: &Package, dest: &Path) -> Result<(), RegistryError> {
    let entry = self
      .packages
      .get(&package.id.path)
      .and_then(|versions| versions.get(&package.id.version))
      .ok_or_else(|| RegistryError::Fetch {
        url: package.url.clone(),
        message: "unknown package".to_string(),
      })?;

    if let Some(parent) = dest.parent() {
      std::fs::create_dir_all(parent).map_err(|e| RegistryError::Fetch {
        url: package.url.clone(),
        message: e.to_string(),
      })?;
    }
    std::fs::write(dest, &entry.archive).map_err(|e| RegistryError::Fetch {
      url: package.url.clone(),
      message: e.to_string(),
    })
  }
}

/// Build a gzipped tar with a single leading directory component, matching
/// the registry's archive convention (the unpacker strips it).
fn build_archive(files: &[(&str, &str)]) -> Vec<u8> {
  let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
  let mut builder = tar::Builder::new(encoder);

  for (name, contents) in files {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
      .append_data(&mut header, format!("pkg/{}", name), contents.as_bytes())
      .expect("in-memory tar append");
  }

  let encoder = builder.into_inner().expect("in-memory tar finish");
  let mut bytes = encoder.finish().expect("in-memory gzip finish");
  bytes.flush().ok();
  bytes
}
