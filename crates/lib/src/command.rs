//! Commands: the executable units of the build graph.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consts::RESPONSE_FILE_THRESHOLD;
use crate::util::hash::{Hashable, ObjectHash, hash_bytes};

/// How a command's argv is moved into a response file when it exceeds the
/// platform threshold: the first `keep_args` arguments stay on the command
/// line, the rest go into a file referenced as `<flag><path>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFileRule {
  pub flag: String,
  pub keep_args: usize,
}

impl Default for ResponseFileRule {
  fn default() -> Self {
    ResponseFileRule {
      flag: "@".to_string(),
      keep_args: 0,
    }
  }
}

/// One unit of executable work: program, argv, environment, and the files
/// it reads and writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
  /// Display name for diagnostics, e.g. `compile a.c`.
  pub name: String,
  pub program: PathBuf,
  pub args: Vec<String>,
  pub env: BTreeMap<String, String>,
  pub working_dir: Option<PathBuf>,
  /// Files that must exist before the command runs and gate its re-run.
  pub inputs: BTreeSet<PathBuf>,
  /// Files the command produces for downstream consumers.
  pub outputs: BTreeSet<PathBuf>,
  /// Files the command produces that nothing downstream reads.
  pub intermediates: BTreeSet<PathBuf>,
  pub response_file: Option<ResponseFileRule>,
  #[serde(skip)]
  pub timeout: Option<Duration>,
}

impl Command {
  pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
    Command {
      name: name.into(),
      program: program.into(),
      args: Vec::new(),
      env: BTreeMap::new(),
      working_dir: None,
      inputs: BTreeSet::new(),
      outputs: BTreeSet::new(),
      intermediates: BTreeSet::new(),
      response_file: None,
      timeout: None,
    }
  }

  pub fn arg(mut self, arg: impl Into<String>) -> Self {
    self.args.push(arg.into());
    self
  }

  pub fn args<I, S>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.args.extend(args.into_iter().map(Into::into));
    self
  }

  pub fn input(mut self, path: impl Into<PathBuf>) -> Self {
    self.inputs.insert(path.into());
    self
  }

  pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
    self.outputs.insert(path.into());
    self
  }

  pub fn intermediate(mut self, path: impl Into<PathBuf>) -> Self {
    self.intermediates.insert(path.into());
    self
  }

  /// Every file this command writes.
  pub fn produced(&self) -> impl Iterator<Item = &PathBuf> {
    self.outputs.iter().chain(self.intermediates.iter())
  }

  /// Identity of the invocation itself: program, argv, environment.
  /// Input content hashes are mixed in separately by the executor.
  pub fn invocation_hash(&self) -> ObjectHash {
    #[derive(Serialize)]
    struct Invocation<'a> {
      program: &'a Path,
      args: &'a [String],
      env: &'a BTreeMap<String, String>,
      working_dir: Option<&'a Path>,
    }
    impl Hashable for Invocation<'_> {}

    Invocation {
      program: &self.program,
      args: &self.args,
      env: &self.env,
      working_dir: self.working_dir.as_deref(),
    }
    .compute_hash()
    .expect("invocation serialization is infallible")
  }

  /// The combined up-to-date hash: invocation plus the sorted set of
  /// (input path, input content hash).
  pub fn state_hash(&self, input_hashes: &BTreeMap<PathBuf, ObjectHash>) -> ObjectHash {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(self.invocation_hash().0.as_bytes());
    for (path, hash) in input_hashes {
      bytes.push(0);
      bytes.extend_from_slice(path.display().to_string().as_bytes());
      bytes.push(0);
      bytes.extend_from_slice(hash.0.as_bytes());
    }
    hash_bytes(&bytes)
  }

  /// The argv to actually spawn, materializing a response file under
  /// `scratch_dir` when the rule applies and the serialized argv exceeds
  /// the platform threshold.
  pub fn effective_args(&self, scratch_dir: &Path) -> io::Result<Vec<String>> {
    let serialized_len: usize = self.args.iter().map(|a| a.len() + 1).sum();
    let Some(rule) = &self.response_file else {
      return Ok(self.args.clone());
    };
    if serialized_len <= RESPONSE_FILE_THRESHOLD {
      return Ok(self.args.clone());
    }

    let keep = rule.keep_args.min(self.args.len());
    let rsp_path = scratch_dir.join(format!("{}.rsp", self.invocation_hash()));
    std::fs::create_dir_all(scratch_dir)?;
    let body: String = self.args[keep..]
      .iter()
      .map(|a| quote_rsp_arg(a))
      .collect::<Vec<_>>()
      .join("\n");
    std::fs::write(&rsp_path, body)?;

    let mut args: Vec<String> = self.args[..keep].to_vec();
    args.push(format!("{}{}", rule.flag, rsp_path.display()));
    Ok(args)
  }
}

fn quote_rsp_arg(arg: &str) -> String {
  if arg.contains(' ') || arg.contains('"') {
    format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
  } else {
    arg.to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn sample() -> Command {
    Command::new("compile a.c", "cc")
      .args(["-c", "a.c", "-o", "a.o"])
      .input("a.c")
      .output("a.o")
  }

  #[test]
  fn invocation_hash_tracks_argv_and_env() {
    let base = sample();
    assert_eq!(base.invocation_hash(), sample().invocation_hash());

    let changed_args = sample().arg("-O2");
    assert_ne!(base.invocation_hash(), changed_args.invocation_hash());

    let mut changed_env = sample();
    changed_env.env.insert("CC_FLAGS".to_string(), "-g".to_string());
    assert_ne!(base.invocation_hash(), changed_env.invocation_hash());
  }

  #[test]
  fn state_hash_tracks_input_contents() {
    let cmd = sample();
    let mut inputs = BTreeMap::new();
    inputs.insert(PathBuf::from("a.c"), hash_bytes(b"int a;"));
    let first = cmd.state_hash(&inputs);

    inputs.insert(PathBuf::from("a.c"), hash_bytes(b"int a = 1;"));
    let second = cmd.state_hash(&inputs);

    assert_ne!(first, second);
  }

  #[test]
  fn short_argv_is_left_alone() {
    let temp = TempDir::new().unwrap();
    let mut cmd = sample();
    cmd.response_file = Some(ResponseFileRule::default());

    let args = cmd.effective_args(temp.path()).unwrap();
    assert_eq!(args, cmd.args);
  }

  #[test]
  fn oversized_argv_moves_into_response_file() {
    let temp = TempDir::new().unwrap();
    let mut cmd = Command::new("link huge", "ld");
    cmd.response_file = Some(ResponseFileRule {
      flag: "@".to_string(),
      keep_args: 1,
    });
    cmd.args.push("-o".to_string());
    for i in 0..RESPONSE_FILE_THRESHOLD {
      cmd.args.push(format!("obj/{i}.o"));
      if cmd.args.iter().map(|a| a.len() + 1).sum::<usize>() > RESPONSE_FILE_THRESHOLD + 16 {
        break;
      }
    }

    let args = cmd.effective_args(temp.path()).unwrap();
    assert_eq!(args.len(), 2);
    assert_eq!(args[0], "-o");
    let rsp = args[1].strip_prefix('@').unwrap();
    let body = std::fs::read_to_string(rsp).unwrap();
    assert!(body.lines().count() >= cmd.args.len() - 2);
  }

  #[test]
  fn commands_without_rule_never_use_response_files() {
    let temp = TempDir::new().unwrap();
    let mut cmd = Command::new("link huge", "ld");
    while cmd.args.iter().map(|a| a.len() + 1).sum::<usize>() <= RESPONSE_FILE_THRESHOLD + 16 {
      cmd.args.push("x".repeat(64));
    }

    let args = cmd.effective_args(temp.path()).unwrap();
    assert_eq!(args, cmd.args);
  }

  #[test]
  fn rsp_quoting_escapes_spaces_and_quotes() {
    assert_eq!(quote_rsp_arg("plain"), "plain");
    assert_eq!(quote_rsp_arg("has space"), "\"has space\"");
    assert_eq!(quote_rsp_arg("say \"hi\""), "\"say \\\"hi\\\"\"");
  }
}
