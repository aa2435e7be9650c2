//! Types for command execution.

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::db::DbError;

/// Errors that abort the executor as a whole. Per-command failures are
/// contained in the summary instead.
#[derive(Debug, Error)]
pub enum ExecuteError {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error(transparent)]
  Db(#[from] DbError),

  #[error("operation not implemented: {0}")]
  Unimplemented(&'static str),
}

/// Why a single command did not succeed, or how it did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
  /// Executed and exited zero.
  Succeeded,
  /// Outputs present and the stored state hash matched; not executed.
  UpToDate,
  /// Executed and failed.
  Failed {
    exit_code: Option<i32>,
    stderr: String,
  },
  /// Ran past its configured timeout and was terminated.
  Timeout,
  /// Not run because an ancestor failed.
  Poisoned { ancestor: String },
  /// Not run because the build was interrupted.
  Skipped,
}

impl CommandOutcome {
  pub fn is_success(&self) -> bool {
    matches!(self, CommandOutcome::Succeeded | CommandOutcome::UpToDate)
  }
}

/// Per-command record for diagnostics.
#[derive(Debug, Clone)]
pub struct CommandReport {
  pub name: String,
  pub program: PathBuf,
  pub args: Vec<String>,
  pub outcome: CommandOutcome,
}

/// The result of driving a command graph to completion.
#[derive(Debug, Default)]
pub struct ExecuteSummary {
  pub reports: Vec<CommandReport>,
  /// Set when a stop request cut the run short.
  pub interrupted: bool,
}

impl ExecuteSummary {
  pub fn is_success(&self) -> bool {
    !self.interrupted && self.reports.iter().all(|r| r.outcome.is_success())
  }

  pub fn executed(&self) -> usize {
    self.count(|o| matches!(o, CommandOutcome::Succeeded))
  }

  pub fn up_to_date(&self) -> usize {
    self.count(|o| matches!(o, CommandOutcome::UpToDate))
  }

  pub fn failed(&self) -> usize {
    self.count(|o| matches!(o, CommandOutcome::Failed { .. } | CommandOutcome::Timeout))
  }

  pub fn poisoned(&self) -> usize {
    self.count(|o| matches!(o, CommandOutcome::Poisoned { .. }))
  }

  pub fn skipped(&self) -> usize {
    self.count(|o| matches!(o, CommandOutcome::Skipped))
  }

  fn count(&self, predicate: impl Fn(&CommandOutcome) -> bool) -> usize {
    self.reports.iter().filter(|r| predicate(&r.outcome)).count()
  }
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  /// Worker pool size.
  pub parallelism: usize,
  /// Log which up-to-date predicate failed for each re-run command.
  pub explain_outdated: bool,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    ExecuteConfig {
      parallelism: num_cpus(),
      explain_outdated: false,
    }
  }
}

/// Default parallelism: hardware concurrency.
fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}
