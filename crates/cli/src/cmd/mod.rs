pub mod build;
pub mod install;
pub mod list;
pub mod remove;
pub mod uri;

use anyhow::{Context as _, Result};

use sw_lib::context::Context;
use sw_lib::driver::native::NativeDriver;
use sw_lib::package::{PackageId, PackagePath, UnresolvedPackage, Version};
use sw_lib::registry::HttpRegistry;
use sw_lib::storage::Storage;

/// Default registry endpoint; override with `--registry` or
/// `etc/registry` under the storage root.
const DEFAULT_REGISTRY: &str = "https://packages.sw.dev/api";

/// Construct the context for a mutating subcommand; holds the storage
/// lock exclusively, labeled with the command name.
pub fn new_context(registry: Option<&str>, command: &str) -> Result<Context> {
  let storage = Storage::detect();
  let url = match registry {
    Some(url) => url.to_string(),
    None => configured_registry(&storage),
  };
  let mut ctx = Context::with_command(storage, Box::new(HttpRegistry::new(url)), command)
    .context("failed to open storage")?;
  ctx.register_driver(native_driver_id(), Box::new(NativeDriver));
  Ok(ctx)
}

/// Construct the context for a read-only subcommand; shares the storage
/// lock with other readers.
pub fn new_read_only_context(registry: Option<&str>) -> Result<Context> {
  let storage = Storage::detect();
  let url = match registry {
    Some(url) => url.to_string(),
    None => configured_registry(&storage),
  };
  let mut ctx = Context::read_only(storage, Box::new(HttpRegistry::new(url)))
    .context("failed to open storage")?;
  ctx.register_driver(native_driver_id(), Box::new(NativeDriver));
  Ok(ctx)
}

/// The registry URL from `etc/registry`, falling back to the default.
fn configured_registry(storage: &Storage) -> String {
  std::fs::read_to_string(storage.etc_dir().join("registry"))
    .map(|s| s.trim().to_string())
    .ok()
    .filter(|s| !s.is_empty())
    .unwrap_or_else(|| DEFAULT_REGISTRY.to_string())
}

fn native_driver_id() -> PackageId {
  PackageId::new(
    PackagePath::parse("org.sw.driver.c").expect("constant driver path"),
    Version::parse("1.0.0").expect("constant driver version"),
  )
}

/// Parse a package reference argument.
pub fn parse_reference(arg: &str) -> Result<UnresolvedPackage> {
  UnresolvedPackage::parse(arg).with_context(|| format!("invalid package reference '{arg}'"))
}
