//! `sw install`: resolve and install packages without building.

use std::process::ExitCode;

use anyhow::Result;
use console::style;

use sw_lib::build::BuildOptions;
use sw_lib::download::install_dependencies;
use sw_lib::resolver::Resolver;

use super::{new_context, parse_reference};

pub fn run(packages: &[String], registry: Option<&str>) -> Result<ExitCode> {
  let ctx = new_context(registry, "install")?;
  let roots = packages
    .iter()
    .map(|p| parse_reference(p))
    .collect::<Result<Vec<_>>>()?;

  let options = BuildOptions::from_settings(ctx.settings());
  let resolution = Resolver::new(ctx.db(), ctx.registry(), options.resolve)
    .resolve(&roots)?
    .ensure_complete()?;

  let installed = install_dependencies(ctx.storage(), ctx.db(), ctx.registry(), &resolution.downloads)?;

  for id in &installed {
    println!("{} {}", style("+").green(), id);
  }
  let already = resolution.packages().len() - installed.len();
  if already > 0 {
    println!("{already} package(s) already installed");
  }
  Ok(ExitCode::SUCCESS)
}
