//! `sw build`: resolve, install, and drive the command graph.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use console::style;

use sw_lib::build::{BuildOptions, run_build};
use sw_lib::package::UnresolvedPackage;

use crate::output;

use super::{new_context, parse_reference};

pub fn run(targets: &[String], registry: Option<&str>) -> Result<ExitCode> {
  let mut ctx = new_context(registry, "build")?;

  // Each target argument is a local path when it exists on disk, a
  // package reference otherwise.
  let mut roots: Vec<UnresolvedPackage> = Vec::new();
  let mut local_paths: Vec<PathBuf> = Vec::new();
  for target in targets {
    if Path::new(target).exists() {
      local_paths.push(PathBuf::from(target));
    } else {
      roots.push(parse_reference(target)?);
    }
  }
  if roots.is_empty() && local_paths.is_empty() {
    local_paths.push(PathBuf::from("."));
  }

  let options = BuildOptions::from_settings(ctx.settings());
  let settings_digest = ctx.settings().key_hash();
  let report = run_build(&mut ctx, &roots, &local_paths, &options)?;

  output::print_report(&report, &settings_digest);

  if report.is_success() {
    println!("{}", style("Build succeeded.").green().bold());
    Ok(ExitCode::SUCCESS)
  } else {
    println!("{}", style("Build failed.").red().bold());
    Ok(ExitCode::FAILURE)
  }
}
