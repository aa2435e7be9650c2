//! The built-in native (C) driver.
//!
//! Recognizes three shapes of input:
//! - a directory with a `sw.build` description file,
//! - a bare directory of C sources (type and name are inferred),
//! - the source tree of an installed package.
//!
//! A target compiles one object per translation unit and then archives a
//! static library, or links an executable when the sources carry `main`.
//! The settings record chooses the toolchain (`native.c.compiler`,
//! `native.ar`); flag emission lives in [`compile_args`] and
//! [`link_args`] so the rest of the driver treats it as opaque.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use std::time::Duration;

use crate::command::{Command, ResponseFileRule};
use crate::package::{Dependency, DependencyFlags, PackageId, PackagePath, UnresolvedPackage, Version};
use crate::settings::Settings;
use crate::storage::Storage;
use crate::target::{
  InterfaceResolver, InterfaceSettings, LinkDependency, LinkVisibility, Target, TargetMap,
  TargetType,
};

use super::{Driver, Input, InputType, LoadError, Specification, TargetEntryPoint};

/// The build description file this driver looks for.
pub const DESCRIPTION_FILE: &str = "sw.build";

/// Prefix for packages loaded from local directories.
const LOCAL_PREFIX: &str = "loc.sw";
const LOCAL_VERSION: &str = "0.0.1";

/// `sw.build` contents.
#[derive(Debug, Clone, Default, Deserialize)]
struct BuildDescription {
  /// Explicit identity, `path@version`. Defaults to a local id derived
  /// from the directory name.
  package: Option<String>,
  #[serde(rename = "type")]
  kind: Option<String>,
  #[serde(default)]
  deps: Vec<DescriptionDep>,
  #[serde(default)]
  definitions: Vec<String>,
  #[serde(default)]
  system_libs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DescriptionDep {
  package: String,
  #[serde(default = "default_visibility")]
  visibility: String,
  #[serde(default)]
  optional: bool,
}

fn default_visibility() -> String {
  "public".to_string()
}

/// Payload carried on targets between load and prepare.
#[derive(Debug, Serialize, Deserialize)]
struct NativePayload {
  sources: Vec<PathBuf>,
  headers: Vec<PathBuf>,
}

pub struct NativeDriver;

impl Driver for NativeDriver {
  fn detect_inputs(&self, path: &Path) -> Vec<Input> {
    if path.is_file() {
      if path.file_name().and_then(|n| n.to_str()) == Some(DESCRIPTION_FILE) {
        return vec![Input::new(path, InputType::SpecificationFile)];
      }
      return Vec::new();
    }
    if !path.is_dir() {
      return Vec::new();
    }
    if path.join(DESCRIPTION_FILE).is_file() {
      return vec![Input::new(path, InputType::DirectorySpecificationFile)];
    }
    if scan_sources(path).map(|files| !files.is_empty()).unwrap_or(false) {
      return vec![Input::new(path, InputType::Directory)];
    }
    Vec::new()
  }

  fn load_inputs_batch(
    &self,
    inputs: &[&Input],
  ) -> Result<Vec<Vec<Box<dyn TargetEntryPoint>>>, LoadError> {
    let mut out: Vec<Vec<Box<dyn TargetEntryPoint>>> = Vec::with_capacity(inputs.len());
    for input in inputs {
      let root = match input.input_type {
        InputType::SpecificationFile => input
          .path
          .parent()
          .map(Path::to_path_buf)
          .unwrap_or_else(|| input.path.clone()),
        _ => input.path.clone(),
      };

      let description = load_description(&root)?;

      // The specification identifies this build input: the description
      // file when present, the source list otherwise.
      let mut specification = Specification::new();
      let description_path = root.join(DESCRIPTION_FILE);
      if description_path.is_file() {
        specification.add_file(DESCRIPTION_FILE, fs::read_to_string(&description_path)?);
      } else {
        for source in scan_sources(&root)? {
          if let Some(name) = source.file_name().and_then(|n| n.to_str()) {
            specification.add_file(name, String::new());
          }
        }
      }
      trace!(input = %root.display(), spec = %specification.hash(), "loading input");

      let installed = match input.input_type {
        InputType::InstalledPackage => Some(parse_payload_id(input)?),
        _ => None,
      };

      let entry = NativeEntryPoint {
        root,
        description,
        installed,
      };
      out.push(vec![Box::new(entry) as Box<dyn TargetEntryPoint>]);
    }
    Ok(out)
  }

  fn prepare_targets(&self, map: &mut TargetMap, storage: &Storage) -> Result<(), LoadError> {
    // First pass reads the map (propagation), second pass writes commands.
    let mut planned: Vec<(PackageId, Settings, Vec<Command>)> = Vec::new();
    {
      let mut resolver = InterfaceResolver::new(map);
      let mut work: Vec<(PackageId, Settings)> = Vec::new();
      for target in map.iter() {
        if target.driver_data.is_some() && !target.is_prepared() {
          work.push((target.id.clone(), target.settings.clone()));
        }
      }
      for (id, settings) in work {
        let effective = resolver.effective(&id, &settings);
        let closure = resolver.link_closure(&id, &settings);
        let target = map.find(&id, &settings).expect("planned target is in the map");
        let payload: NativePayload = serde_json::from_value(
          target.driver_data.clone().expect("planned target has native payload"),
        )
        .map_err(|e| LoadError::DriverLoadFailed {
          path: storage.source_dir(&id),
          message: format!("bad native payload: {e}"),
        })?;

        let commands = generate_commands(&id, &settings, &target.interface, &effective, &closure, &payload, storage);
        planned.push((id, settings, commands));
      }
    }

    for (id, settings, commands) in planned {
      if let Some(target) = map.find_mut(&id, &settings) {
        debug!(target = %id, commands = commands.len(), "prepared target");
        target.commands = commands;
        target.prepare();
      }
    }
    Ok(())
  }
}

struct NativeEntryPoint {
  root: PathBuf,
  description: Option<BuildDescription>,
  installed: Option<PackageId>,
}

impl TargetEntryPoint for NativeEntryPoint {
  fn load_packages(
    &self,
    storage: &Storage,
    settings: &Settings,
    whitelist: &BTreeSet<PackageId>,
  ) -> Result<Vec<Target>, LoadError> {
    let description = self.description.clone().unwrap_or_default();
    let id = self.identity(&description)?;
    // The whitelist pins which installed packages may load; source-local
    // inputs always load (their identity is only known now).
    if self.installed.is_some() && !whitelist.is_empty() && !whitelist.contains(&id) {
      trace!(package = %id, "not whitelisted, skipping");
      return Ok(Vec::new());
    }

    let sources = scan_sources(&self.root)?;
    let headers = scan_headers(&self.root)?;

    let mut target = Target::new(id.clone(), settings.clone());
    target.interface = self.build_interface(&description, &sources, settings, whitelist, storage, &id)?;
    target.driver_data = Some(
      serde_json::to_value(NativePayload { sources, headers })
        .expect("payload serialization is infallible"),
    );

    Ok(vec![target])
  }
}

impl NativeEntryPoint {
  fn identity(&self, description: &BuildDescription) -> Result<PackageId, LoadError> {
    if let Some(id) = &self.installed {
      return Ok(id.clone());
    }
    if let Some(reference) = &description.package {
      let (path, version) = reference.split_once('@').ok_or_else(|| LoadError::DriverLoadFailed {
        path: self.root.clone(),
        message: format!("package must be path@version, got '{reference}'"),
      })?;
      let path = PackagePath::parse(path).map_err(|e| self.bad_description(e.to_string()))?;
      let version = Version::parse(version).map_err(|e| self.bad_description(e.to_string()))?;
      return Ok(PackageId::new(path, version));
    }

    // Local directory: identity derived from the directory name.
    let name: String = self
      .root
      .file_name()
      .and_then(|n| n.to_str())
      .unwrap_or("unnamed")
      .chars()
      .map(|c| {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
          c.to_ascii_lowercase()
        } else {
          '_'
        }
      })
      .collect();
    let path = PackagePath::parse(&format!("{LOCAL_PREFIX}.{name}"))
      .map_err(|e| self.bad_description(e.to_string()))?;
    Ok(PackageId::new(path, Version::parse(LOCAL_VERSION).expect("constant version")))
  }

  fn build_interface(
    &self,
    description: &BuildDescription,
    sources: &[PathBuf],
    settings: &Settings,
    whitelist: &BTreeSet<PackageId>,
    storage: &Storage,
    id: &PackageId,
  ) -> Result<InterfaceSettings, LoadError> {
    let mut interface = InterfaceSettings {
      target_type: self.target_type(description, sources)?,
      header_only: sources.is_empty(),
      definitions: description.definitions.clone(),
      system_link_libraries: description.system_libs.clone(),
      ..InterfaceSettings::default()
    };

    interface.include_directories.push(self.root.clone());
    let include = self.root.join("include");
    if include.is_dir() {
      interface.include_directories.push(include);
    }

    let bd = storage.build_dir(id, &settings.key_hash());
    let stem = id.path.components().last().unwrap_or("out").to_string();
    if !interface.header_only {
      interface.output_file = Some(match interface.target_type {
        TargetType::NativeExecutable => bd.join(&stem),
        TargetType::NativeStaticLibrary => bd.join(format!("lib{stem}.a")),
        TargetType::NativeSharedLibrary => bd.join(format!("lib{stem}.so")),
      });
    }

    for dep in &description.deps {
      let dependency = Dependency {
        unresolved: UnresolvedPackage::parse(&dep.package)
          .map_err(|e| self.bad_description(e.to_string()))?,
        flags: DependencyFlags {
          link: true,
          private: dep.visibility == "private",
          optional: dep.optional,
        },
      };

      let reference = &dependency.unresolved;
      let resolved = whitelist
        .iter()
        .find(|w| w.path == reference.path && reference.range.matches(&w.version))
        .or_else(|| whitelist.iter().find(|w| w.path == reference.path));
      let resolved = match resolved {
        Some(id) => id,
        None if dependency.flags.optional => continue,
        None => {
          return Err(
            self.bad_description(format!("dependency '{}' is not in the resolved set", dep.package)),
          );
        }
      };

      let visibility = if dependency.flags.private {
        LinkVisibility::Private
      } else {
        LinkVisibility::Public
      };
      interface.link_dependencies.insert(
        resolved.to_string(),
        LinkDependency {
          id: resolved.clone(),
          visibility,
          settings: settings.clone(),
        },
      );
    }

    Ok(interface)
  }

  fn target_type(
    &self,
    description: &BuildDescription,
    sources: &[PathBuf],
  ) -> Result<TargetType, LoadError> {
    if let Some(kind) = &description.kind {
      return match kind.as_str() {
        "native_executable" => Ok(TargetType::NativeExecutable),
        "native_static_library" => Ok(TargetType::NativeStaticLibrary),
        "native_shared_library" => Ok(TargetType::NativeSharedLibrary),
        other => Err(self.bad_description(format!("unknown target type '{other}'"))),
      };
    }
    for source in sources {
      if let Ok(contents) = fs::read_to_string(source) {
        if contents.contains("int main") {
          return Ok(TargetType::NativeExecutable);
        }
      }
    }
    Ok(TargetType::NativeStaticLibrary)
  }

  fn bad_description(&self, message: String) -> LoadError {
    LoadError::DriverLoadFailed {
      path: self.root.clone(),
      message,
    }
  }
}

fn load_description(root: &Path) -> Result<Option<BuildDescription>, LoadError> {
  let path = root.join(DESCRIPTION_FILE);
  if !path.is_file() {
    return Ok(None);
  }
  let contents = fs::read_to_string(&path)?;
  serde_json::from_str(&contents)
    .map(Some)
    .map_err(|e| LoadError::DriverLoadFailed {
      path,
      message: e.to_string(),
    })
}

fn parse_payload_id(input: &Input) -> Result<PackageId, LoadError> {
  let payload = input.payload.as_deref().ok_or_else(|| LoadError::DriverLoadFailed {
    path: input.path.clone(),
    message: "installed package input without identity payload".to_string(),
  })?;
  let (path, version) = payload.split_once('@').ok_or_else(|| LoadError::DriverLoadFailed {
    path: input.path.clone(),
    message: format!("bad identity payload '{payload}'"),
  })?;
  let path_parsed = PackagePath::parse(path).map_err(|e| LoadError::DriverLoadFailed {
    path: input.path.clone(),
    message: e.to_string(),
  })?;
  let version = Version::parse(version).map_err(|e| LoadError::DriverLoadFailed {
    path: input.path.clone(),
    message: e.to_string(),
  })?;
  Ok(PackageId::new(path_parsed, version))
}

fn scan_sources(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
  scan_extension(dir, "c")
}

fn scan_headers(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
  let mut headers = scan_extension(dir, "h")?;
  let include = dir.join("include");
  if include.is_dir() {
    headers.extend(scan_extension(&include, "h")?);
  }
  Ok(headers)
}

fn scan_extension(dir: &Path, extension: &str) -> std::io::Result<Vec<PathBuf>> {
  let mut files = Vec::new();
  for entry in fs::read_dir(dir)? {
    let entry = entry?;
    let path = entry.path();
    if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(extension) {
      files.push(path);
    }
  }
  files.sort();
  Ok(files)
}

/// Emit compile arguments for one translation unit. The settings record is
/// treated as an opaque source of toolchain choices here.
fn compile_args(effective: &InterfaceSettings, source: &Path, object: &Path) -> Vec<String> {
  let mut args = vec![
    "-c".to_string(),
    source.display().to_string(),
    "-o".to_string(),
    object.display().to_string(),
  ];
  for dir in &effective.include_directories {
    args.push(format!("-I{}", dir.display()));
  }
  for definition in &effective.definitions {
    args.push(format!("-D{definition}"));
  }
  args
}

/// Emit link arguments for an executable.
fn link_args(objects: &[PathBuf], closure: &[PathBuf], effective: &InterfaceSettings, out: &Path) -> Vec<String> {
  let mut args: Vec<String> = objects.iter().map(|o| o.display().to_string()).collect();
  args.extend(closure.iter().map(|l| l.display().to_string()));
  for lib in &effective.system_link_libraries {
    args.push(format!("-l{lib}"));
  }
  args.push("-o".to_string());
  args.push(out.display().to_string());
  args
}

fn generate_commands(
  id: &PackageId,
  settings: &Settings,
  own: &InterfaceSettings,
  effective: &InterfaceSettings,
  closure: &[PathBuf],
  payload: &NativePayload,
  storage: &Storage,
) -> Vec<Command> {
  if payload.sources.is_empty() {
    return Vec::new();
  }

  let compiler = tool(settings, "native.c.compiler", "cc");
  let archiver = tool(settings, "native.ar", "ar");
  // Optional per-command timeout; absent means none.
  let timeout = settings
    .get_path("executor.command_timeout_ms")
    .and_then(|v| v.as_str())
    .and_then(|v| v.parse::<u64>().ok())
    .map(Duration::from_millis);
  let bd = storage.build_dir(id, &settings.key_hash());
  let obj_dir = bd.join("obj");

  let mut commands = Vec::new();
  let mut objects = Vec::new();

  for source in &payload.sources {
    let stem = source
      .file_stem()
      .and_then(|s| s.to_str())
      .unwrap_or("unit")
      .to_string();
    let object = obj_dir.join(format!("{stem}.o"));

    let mut cmd = Command::new(
      format!("compile {}", source.file_name().and_then(|n| n.to_str()).unwrap_or("unit")),
      compiler.clone(),
    );
    cmd.args = compile_args(effective, source, &object);
    cmd.timeout = timeout;
    cmd.inputs.insert(source.clone());
    for header in &payload.headers {
      cmd.inputs.insert(header.clone());
    }
    cmd.outputs.insert(object.clone());
    commands.push(cmd);
    objects.push(object);
  }

  let Some(output) = own.output_file.clone() else {
    return commands;
  };

  let mut final_cmd = match own.target_type {
    TargetType::NativeExecutable => {
      let mut cmd = Command::new(format!("link {id}"), compiler);
      cmd.args = link_args(&objects, closure, effective, &output);
      for lib in closure {
        cmd.inputs.insert(lib.clone());
      }
      cmd
    }
    _ => {
      let mut cmd = Command::new(format!("archive {id}"), archiver);
      cmd.args.push("rcs".to_string());
      cmd.args.push(output.display().to_string());
      cmd.args.extend(objects.iter().map(|o| o.display().to_string()));
      cmd
    }
  };
  for object in &objects {
    final_cmd.inputs.insert(object.clone());
  }
  final_cmd.outputs.insert(output);
  final_cmd.timeout = timeout;
  final_cmd.response_file = Some(ResponseFileRule {
    flag: "@".to_string(),
    keep_args: if matches!(own.target_type, TargetType::NativeExecutable) { 0 } else { 2 },
  });
  commands.push(final_cmd);
  commands
}

fn tool(settings: &Settings, key: &str, default: &str) -> String {
  settings
    .get_path(key)
    .and_then(|v| v.as_str())
    .unwrap_or(default)
    .to_string()
}
