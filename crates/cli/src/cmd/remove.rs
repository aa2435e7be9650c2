//! `sw remove`: uninstall a package and delete its sources.

use std::process::ExitCode;

use anyhow::{Result, bail};
use console::style;

use sw_lib::download::uninstall;
use sw_lib::package::PackageId;

use super::{new_context, parse_reference};

pub fn run(package: &str, registry: Option<&str>) -> Result<ExitCode> {
  let ctx = new_context(registry, "remove")?;
  let reference = parse_reference(package)?;

  // An exact pin names the package directly; a range removes the highest
  // installed match.
  let id: PackageId = match reference.range.is_pin() {
    Some(version) => PackageId::new(reference.path.clone(), version.clone()),
    None => match ctx.db().match_installed(&reference) {
      Some(id) => id,
      None => bail!("package '{reference}' is not installed"),
    },
  };

  if uninstall(ctx.storage(), ctx.db(), &id)? {
    println!("{} {}", style("-").red(), id);
  } else {
    println!("package '{id}' was not installed");
  }
  Ok(ExitCode::SUCCESS)
}
