//! Targets: (package, settings) nodes of a build.

mod interface;
mod map;

pub use interface::{
  InterfaceResolver, InterfaceSettings, LinkDependency, LinkVisibility, TargetType,
};
pub use map::TargetMap;

use crate::command::Command;
use crate::package::PackageId;
use crate::settings::Settings;

/// One buildable unit: a package loaded under concrete settings, carrying
/// its interface and the commands that produce its artifacts.
///
/// Interface settings are mutable while the target is being loaded and
/// freeze once [`Target::prepare`] is called.
#[derive(Debug)]
pub struct Target {
  pub id: PackageId,
  pub settings: Settings,
  pub interface: InterfaceSettings,
  pub commands: Vec<Command>,
  /// Opaque payload the owning driver carries between load and prepare.
  pub driver_data: Option<serde_json::Value>,
  prepared: bool,
}

impl Target {
  pub fn new(id: PackageId, settings: Settings) -> Self {
    Target {
      id,
      settings,
      interface: InterfaceSettings::default(),
      commands: Vec::new(),
      driver_data: None,
      prepared: false,
    }
  }

  /// Freeze the interface.
  pub fn prepare(&mut self) {
    self.prepared = true;
  }

  pub fn is_prepared(&self) -> bool {
    self.prepared
  }

  /// Mutable interface access; `None` once prepared.
  pub fn interface_mut(&mut self) -> Option<&mut InterfaceSettings> {
    if self.prepared {
      None
    } else {
      Some(&mut self.interface)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::package::{PackagePath, Version};

  #[test]
  fn interface_freezes_on_prepare() {
    let id = PackageId::new(
      PackagePath::parse("org.demo.a").unwrap(),
      Version::parse("1.0").unwrap(),
    );
    let mut target = Target::new(id, Settings::new());

    target
      .interface_mut()
      .unwrap()
      .definitions
      .push("BEFORE".to_string());
    target.prepare();

    assert!(target.is_prepared());
    assert!(target.interface_mut().is_none());
    assert_eq!(target.interface.definitions, vec!["BEFORE".to_string()]);
  }
}
