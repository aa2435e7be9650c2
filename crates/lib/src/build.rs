//! Build orchestration.
//!
//! The full flow behind `sw build`:
//!
//! 1. Resolve the root references and their transitive closure.
//! 2. Install every resolved package that is missing.
//! 3. Detect and register inputs (local paths plus installed sources).
//! 4. Load entry points in driver batches and collect targets.
//! 5. Let each driver prepare its targets into command lists.
//! 6. Build the command graph and execute it.
//!
//! Execution failures are contained per command and reported through the
//! summary; a stop request surfaces as `Interrupted`.

use std::collections::BTreeSet;
use std::path::PathBuf;

use thiserror::Error;
use tracing::info;

use crate::consts::NO_NETWORK_ENV;
use crate::context::Context;
use crate::download::{DownloadError, install_dependencies};
use crate::driver::LoadError;
use crate::execute::{
  CommandGraph, ExecuteConfig, ExecuteError, ExecuteSummary, Executor, GraphError,
  graph_from_targets,
};
use crate::package::{PackageId, UnresolvedPackage};
use crate::resolver::{ResolveError, ResolveOptions, Resolver};
use crate::settings::Settings;
use crate::target::TargetMap;

#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Resolve(#[from] ResolveError),

  #[error(transparent)]
  Download(#[from] DownloadError),

  #[error(transparent)]
  Load(#[from] LoadError),

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Execute(#[from] ExecuteError),

  #[error("build interrupted")]
  Interrupted,
}

/// Options for one build run.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
  pub resolve: ResolveOptions,
  pub execute: ExecuteConfig,
}

impl BuildOptions {
  /// Derive options from a settings record plus the environment.
  ///
  /// Recognized keys: `resolver.query_local_db`, `resolver.force_server_query`,
  /// `executor.parallelism`, `executor.explain_outdated`. `SW_NO_NETWORK`
  /// forbids remote passes outright.
  pub fn from_settings(settings: &Settings) -> Self {
    let flag = |key: &str| {
      settings
        .get_path(key)
        .and_then(|v| v.as_str())
        .map(|v| v == "true" || v == "1")
    };

    let mut options = BuildOptions::default();
    if let Some(value) = flag("resolver.query_local_db") {
      options.resolve.query_local_db = value;
    }
    if let Some(value) = flag("resolver.force_server_query") {
      options.resolve.force_server_query = value;
    }
    if std::env::var(NO_NETWORK_ENV).is_ok_and(|v| !v.is_empty() && v != "0") {
      options.resolve.allow_network = false;
    }
    if let Some(value) = flag("executor.explain_outdated") {
      options.execute.explain_outdated = value;
    }
    if let Some(parallelism) = settings
      .get_path("executor.parallelism")
      .and_then(|v| v.as_str())
      .and_then(|v| v.parse::<usize>().ok())
    {
      options.execute.parallelism = parallelism.max(1);
    }
    options
  }
}

/// What a build run did.
#[derive(Debug)]
pub struct BuildReport {
  /// Pinned identities of everything reachable.
  pub packages: Vec<PackageId>,
  /// Packages newly installed by this run.
  pub installed: Vec<PackageId>,
  pub target_count: usize,
  pub summary: ExecuteSummary,
}

impl BuildReport {
  pub fn is_success(&self) -> bool {
    self.summary.is_success()
  }
}

/// Run a full build over root references and local source paths.
pub fn run_build(
  ctx: &mut Context,
  roots: &[UnresolvedPackage],
  local_paths: &[PathBuf],
  options: &BuildOptions,
) -> Result<BuildReport, BuildError> {
  info!(roots = roots.len(), local_inputs = local_paths.len(), "starting build");

  // 1. Resolve.
  let resolution = {
    let resolver = Resolver::new(ctx.db(), ctx.registry(), options.resolve.clone());
    resolver.resolve(roots)?.ensure_complete()?
  };
  let packages = resolution.packages();

  // 2. Install what is missing.
  let installed = install_dependencies(ctx.storage(), ctx.db(), ctx.registry(), &resolution.downloads)?;

  // 3. Inputs: local paths first, then every resolved package.
  let mut input_keys = Vec::new();
  for path in local_paths {
    input_keys.extend(ctx.detect_inputs(path)?);
  }
  for id in &packages {
    input_keys.push(ctx.add_installed_input(id)?);
  }

  // 4. Load targets.
  ctx.load_inputs_batch(&input_keys)?;
  let whitelist: BTreeSet<PackageId> = packages.iter().cloned().collect();
  let settings = ctx.settings().clone();

  let mut map = TargetMap::new();
  for key in &input_keys {
    for entry_point in ctx.entry_points(key) {
      for target in entry_point.load_packages(ctx.storage(), &settings, &whitelist)? {
        let id = target.id.clone();
        if !map.insert(target) {
          return Err(BuildError::Load(LoadError::TargetRedefinition(id)));
        }
      }
    }
  }
  info!(targets = map.len(), "targets loaded");

  // 5. Prepare: drivers emit command lists against propagated interfaces.
  let graph = prepare_and_graph(ctx, &mut map)?;

  // 6. Execute.
  let executor = Executor::new(
    &graph,
    ctx.db(),
    ctx.storage().tmp_dir(),
    options.execute.clone(),
    ctx.stop_flag(),
  );
  let summary = executor.run()?;
  if summary.interrupted {
    return Err(BuildError::Interrupted);
  }

  Ok(BuildReport {
    packages,
    installed,
    target_count: map.len(),
    summary,
  })
}

fn prepare_and_graph(ctx: &Context, map: &mut TargetMap) -> Result<CommandGraph, BuildError> {
  for (_, driver) in ctx.drivers() {
    driver.prepare_targets(map, ctx.storage())?;
  }
  Ok(graph_from_targets(map)?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  fn options_default_to_local_db_and_network() {
    let options = BuildOptions::from_settings(&Settings::new());
    assert!(options.resolve.query_local_db);
    assert!(!options.resolve.force_server_query);
    assert!(options.resolve.allow_network);
  }

  #[test]
  fn options_read_settings_keys() {
    let mut resolver = Settings::new();
    resolver.set("query_local_db", "false");
    resolver.set("force_server_query", "true");
    let mut executor = Settings::new();
    executor.set("parallelism", "2");
    executor.set("explain_outdated", "true");

    let mut settings = Settings::new();
    settings.set("resolver", crate::settings::SettingValue::Map(resolver));
    settings.set("executor", crate::settings::SettingValue::Map(executor));

    let options = BuildOptions::from_settings(&settings);
    assert!(!options.resolve.query_local_db);
    assert!(options.resolve.force_server_query);
    assert_eq!(options.execute.parallelism, 2);
    assert!(options.execute.explain_outdated);
  }

  #[test]
  #[serial]
  fn no_network_env_forbids_remote_passes() {
    temp_env::with_var(NO_NETWORK_ENV, Some("1"), || {
      let options = BuildOptions::from_settings(&Settings::new());
      assert!(!options.resolve.allow_network);
    });
    temp_env::with_var(NO_NETWORK_ENV, Some("0"), || {
      let options = BuildOptions::from_settings(&Settings::new());
      assert!(options.resolve.allow_network);
    });
  }
}
