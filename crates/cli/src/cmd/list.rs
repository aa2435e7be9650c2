//! `sw list`: show installed packages.

use std::process::ExitCode;

use anyhow::Result;

use super::new_read_only_context;

pub fn run(registry: Option<&str>) -> Result<ExitCode> {
  let ctx = new_read_only_context(registry)?;
  let installed = ctx.db().all_installed();
  if installed.is_empty() {
    println!("no packages installed");
    return Ok(ExitCode::SUCCESS);
  }
  for id in installed {
    println!("{id}");
  }
  Ok(ExitCode::SUCCESS)
}
