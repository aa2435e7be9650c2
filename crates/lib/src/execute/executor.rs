//! The incremental parallel executor.
//!
//! A command is up-to-date when every output exists and the stored hash of
//! (command line ⊕ environment ⊕ sorted (input path, input content hash))
//! matches the service database. Out-of-date commands execute on a bounded
//! worker pool: the ready frontier is FIFO behind a condition variable, a
//! completed command enqueues successors whose last predecessor just
//! finished, and a failed command poisons its dependents while unrelated
//! branches keep going. A stop request terminates in-flight children,
//! drops the queue, and reports the run as interrupted.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::command::Command;
use crate::storage::db::{FileRecord, ServiceDb};
use crate::util::hash::{ObjectHash, hash_file};

use super::graph::CommandGraph;
use super::types::{CommandOutcome, CommandReport, ExecuteConfig, ExecuteError, ExecuteSummary};

/// How long the run loop sleeps between child status polls.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Tail of stderr kept for diagnostics.
const STDERR_TAIL: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
  Pending,
  Queued,
  Running,
  Done(CommandOutcome),
}

struct SchedState {
  ready: VecDeque<usize>,
  remaining_preds: Vec<usize>,
  status: Vec<Status>,
  unfinished: usize,
  interrupted: bool,
}

struct Scheduler {
  state: Mutex<SchedState>,
  cv: Condvar,
}

pub struct Executor<'a> {
  graph: &'a CommandGraph,
  db: &'a ServiceDb,
  scratch_dir: PathBuf,
  config: ExecuteConfig,
  stop: &'a AtomicBool,
}

impl<'a> Executor<'a> {
  pub fn new(
    graph: &'a CommandGraph,
    db: &'a ServiceDb,
    scratch_dir: impl Into<PathBuf>,
    config: ExecuteConfig,
    stop: &'a AtomicBool,
  ) -> Self {
    Executor {
      graph,
      db,
      scratch_dir: scratch_dir.into(),
      config,
      stop,
    }
  }

  /// Drive the graph to completion.
  pub fn run(&self) -> Result<ExecuteSummary, ExecuteError> {
    let count = self.graph.len();
    if count == 0 {
      return Ok(ExecuteSummary::default());
    }
    fs::create_dir_all(&self.scratch_dir)?;

    let mut remaining_preds: Vec<usize> = Vec::with_capacity(count);
    for idx in 0..count {
      remaining_preds.push(self.graph.predecessors(idx).len());
    }
    // Topological order keeps the initial frontier deterministic.
    let ready: VecDeque<usize> = self
      .graph
      .topological_order()
      .iter()
      .copied()
      .filter(|&idx| remaining_preds[idx] == 0)
      .collect();

    let mut status = vec![Status::Pending; count];
    for &idx in &ready {
      status[idx] = Status::Queued;
    }

    let scheduler = Scheduler {
      state: Mutex::new(SchedState {
        ready,
        remaining_preds,
        status,
        unfinished: count,
        interrupted: false,
      }),
      cv: Condvar::new(),
    };

    let workers = self.config.parallelism.clamp(1, count);
    info!(commands = count, workers, "executing command graph");

    std::thread::scope(|scope| {
      for _ in 0..workers {
        scope.spawn(|| self.worker(&scheduler));
      }
    });

    let state = scheduler.state.into_inner().unwrap();
    let mut summary = ExecuteSummary {
      interrupted: state.interrupted,
      ..ExecuteSummary::default()
    };
    for (idx, status) in state.status.into_iter().enumerate() {
      let command = self.graph.command(idx);
      let outcome = match status {
        Status::Done(outcome) => outcome,
        _ => CommandOutcome::Skipped,
      };
      summary.reports.push(CommandReport {
        name: command.name.clone(),
        program: command.program.clone(),
        args: command.args.clone(),
        outcome,
      });
    }

    info!(
      executed = summary.executed(),
      up_to_date = summary.up_to_date(),
      failed = summary.failed(),
      poisoned = summary.poisoned(),
      skipped = summary.skipped(),
      interrupted = summary.interrupted,
      "execution finished"
    );
    Ok(summary)
  }

  fn worker(&self, scheduler: &Scheduler) {
    loop {
      let idx = {
        let mut state = scheduler.state.lock().unwrap();
        loop {
          if self.stop.load(Ordering::Relaxed) && !state.interrupted {
            self.drain_queue(&mut state);
          }
          if state.unfinished == 0 {
            scheduler.cv.notify_all();
            return;
          }
          if let Some(idx) = state.ready.pop_front() {
            state.status[idx] = Status::Running;
            break idx;
          }
          // Interrupted with nothing queued: only running commands remain.
          state = scheduler.cv.wait(state).unwrap();
        }
      };

      let outcome = self.run_command(idx);
      self.complete(scheduler, idx, outcome);
    }
  }

  /// Mark everything still queued or pending as skipped.
  fn drain_queue(&self, state: &mut SchedState) {
    state.interrupted = true;
    for idx in 0..state.status.len() {
      if matches!(state.status[idx], Status::Pending | Status::Queued) {
        state.status[idx] = Status::Done(CommandOutcome::Skipped);
        state.unfinished -= 1;
      }
    }
    state.ready.clear();
    warn!("stop requested, dropping queued commands");
  }

  fn complete(&self, scheduler: &Scheduler, idx: usize, outcome: CommandOutcome) {
    let mut state = scheduler.state.lock().unwrap();
    let succeeded = outcome.is_success();
    // Skipped (stop request) leaves dependents to the drain pass; only a
    // real failure poisons them.
    let poisons = matches!(outcome, CommandOutcome::Failed { .. } | CommandOutcome::Timeout);
    state.status[idx] = Status::Done(outcome);
    state.unfinished -= 1;

    if succeeded {
      for &succ in self.graph.successors(idx) {
        state.remaining_preds[succ] -= 1;
        if state.remaining_preds[succ] == 0 && state.status[succ] == Status::Pending && !state.interrupted {
          state.status[succ] = Status::Queued;
          state.ready.push_back(succ);
        }
      }
    } else if poisons {
      self.poison_descendants(&mut state, idx);
    }
    scheduler.cv.notify_all();
  }

  /// Mark every transitive dependent of `failed_idx` as poisoned.
  fn poison_descendants(&self, state: &mut SchedState, failed_idx: usize) {
    let ancestor = self.graph.command(failed_idx).name.clone();
    let mut stack: Vec<usize> = self.graph.successors(failed_idx).iter().copied().collect();
    while let Some(idx) = stack.pop() {
      if matches!(state.status[idx], Status::Pending | Status::Queued) {
        if state.status[idx] == Status::Queued {
          state.ready.retain(|&r| r != idx);
        }
        state.status[idx] = Status::Done(CommandOutcome::Poisoned {
          ancestor: ancestor.clone(),
        });
        state.unfinished -= 1;
        stack.extend(self.graph.successors(idx).iter().copied());
      }
    }
  }

  fn run_command(&self, idx: usize) -> CommandOutcome {
    let command = self.graph.command(idx);

    match self.up_to_date(command) {
      Ok(Some(state_hash)) => {
        // Out of date; remember the hash to store on success.
        match self.execute(command, state_hash) {
          Ok(outcome) => outcome,
          Err(err) => CommandOutcome::Failed {
            exit_code: None,
            stderr: err.to_string(),
          },
        }
      }
      Ok(None) => {
        debug!(command = %command.name, "up to date");
        CommandOutcome::UpToDate
      }
      Err(err) => CommandOutcome::Failed {
        exit_code: None,
        stderr: err.to_string(),
      },
    }
  }

  /// Returns `None` when the command is up-to-date, otherwise the state
  /// hash to record after a successful run.
  fn up_to_date(&self, command: &Command) -> Result<Option<ObjectHash>, ExecuteError> {
    let mut input_hashes: BTreeMap<PathBuf, ObjectHash> = BTreeMap::new();
    for input in &command.inputs {
      input_hashes.insert(input.clone(), self.content_hash(input)?);
    }
    let state_hash = command.state_hash(&input_hashes);

    for output in command.outputs.iter() {
      if !output.exists() {
        if self.config.explain_outdated {
          info!(command = %command.name, output = %output.display(), "outdated: output missing");
        }
        return Ok(Some(state_hash));
      }
    }
    if !self.db.has_command_hash(&state_hash) {
      if self.config.explain_outdated {
        info!(command = %command.name, "outdated: command or input state changed");
      }
      return Ok(Some(state_hash));
    }
    Ok(None)
  }

  /// Content hash of an input, through the size+mtime cache.
  fn content_hash(&self, path: &Path) -> Result<ObjectHash, ExecuteError> {
    let metadata = match fs::metadata(path) {
      Ok(m) => m,
      // A missing input hashes as empty; the spawned command will report
      // the real error.
      Err(_) => return Ok(crate::util::hash::hash_bytes(b"")),
    };
    let size = metadata.len();
    let mtime = metadata
      .modified()
      .ok()
      .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
      .map(|d| d.as_nanos() as i64)
      .unwrap_or(0);

    if let Some(record) = self.db.file_record(path) {
      if record.size == size && record.mtime == mtime {
        return Ok(record.content_hash);
      }
    }

    let content_hash = hash_file(path)?;
    self.db.store_file_record(
      path,
      FileRecord {
        size,
        mtime,
        content_hash: content_hash.clone(),
      },
    )?;
    Ok(content_hash)
  }

  fn execute(&self, command: &Command, state_hash: ObjectHash) -> Result<CommandOutcome, ExecuteError> {
    debug!(command = %command.name, program = %command.program.display(), "running");

    for produced in command.produced() {
      if let Some(parent) = produced.parent() {
        fs::create_dir_all(parent)?;
      }
    }

    let args = command.effective_args(&self.scratch_dir)?;
    let stderr_path = self.scratch_dir.join(format!("{}.stderr", command.invocation_hash()));
    let stderr_file = File::create(&stderr_path)?;

    let mut process = std::process::Command::new(&command.program);
    process
      .args(&args)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::from(stderr_file));
    for (key, value) in &command.env {
      process.env(key, value);
    }
    if let Some(dir) = &command.working_dir {
      process.current_dir(dir);
    }

    let mut child = process.spawn()?;
    let started = Instant::now();

    let status = loop {
      if let Some(status) = child.try_wait()? {
        break status;
      }
      if self.stop.load(Ordering::Relaxed) {
        child.kill().ok();
        child.wait()?;
        debug!(command = %command.name, "terminated by stop request");
        return Ok(CommandOutcome::Skipped);
      }
      if let Some(timeout) = command.timeout {
        if started.elapsed() > timeout {
          child.kill().ok();
          child.wait()?;
          warn!(command = %command.name, "timed out");
          return Ok(CommandOutcome::Timeout);
        }
      }
      std::thread::sleep(POLL_INTERVAL);
    };

    if status.success() {
      self.flush_outputs(command);
      self.db.store_command_hash(&state_hash)?;
      fs::remove_file(&stderr_path).ok();
      Ok(CommandOutcome::Succeeded)
    } else {
      let stderr = read_tail(&stderr_path, STDERR_TAIL);
      fs::remove_file(&stderr_path).ok();
      Ok(CommandOutcome::Failed {
        exit_code: status.code(),
        stderr,
      })
    }
  }

  /// Establish the file-system barrier: outputs are durable before the
  /// command reports completion.
  fn flush_outputs(&self, command: &Command) {
    for output in command.outputs.iter() {
      if let Ok(file) = File::open(output) {
        file.sync_all().ok();
      }
    }
  }
}

fn read_tail(path: &Path, limit: usize) -> String {
  let Ok(contents) = fs::read(path) else {
    return String::new();
  };
  let start = contents.len().saturating_sub(limit);
  String::from_utf8_lossy(&contents[start..]).into_owned()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::Storage;
  use tempfile::TempDir;

  struct Fixture {
    _temp: TempDir,
    storage: Storage,
    db: ServiceDb,
    stop: AtomicBool,
  }

  fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let storage = Storage::with_root(temp.path());
    storage.init().unwrap();
    let db = ServiceDb::open(storage.db_dir()).unwrap();
    Fixture {
      storage,
      db,
      stop: AtomicBool::new(false),
      _temp: temp,
    }
  }

  fn sh(name: &str, script: String) -> Command {
    Command::new(name, "sh").args(["-c", script.as_str()])
  }

  fn run(fx: &Fixture, graph: &CommandGraph) -> ExecuteSummary {
    let executor = Executor::new(
      graph,
      &fx.db,
      fx.storage.tmp_dir(),
      ExecuteConfig {
        parallelism: 4,
        explain_outdated: true,
      },
      &fx.stop,
    );
    executor.run().unwrap()
  }

  #[test]
  fn empty_graph_executes_nothing() {
    let fx = fixture();
    let graph = CommandGraph::build(Vec::new()).unwrap();
    let summary = run(&fx, &graph);
    assert!(summary.is_success());
    assert!(summary.reports.is_empty());
  }

  #[test]
  fn chain_runs_in_order_and_second_run_is_up_to_date() {
    let fx = fixture();
    let dir = fx.storage.root().join("work");
    fs::create_dir_all(&dir).unwrap();
    let src = dir.join("in.txt");
    fs::write(&src, "hello").unwrap();
    let mid = dir.join("mid.txt");
    let out = dir.join("out.txt");

    let build_graph = || {
      CommandGraph::build(vec![
        {
          let mut c = sh("copy-in", format!("cp {} {}", src.display(), mid.display()));
          c.inputs.insert(src.clone());
          c.outputs.insert(mid.clone());
          c
        },
        {
          let mut c = sh("copy-mid", format!("cp {} {}", mid.display(), out.display()));
          c.inputs.insert(mid.clone());
          c.outputs.insert(out.clone());
          c
        },
      ])
      .unwrap()
    };

    let summary = run(&fx, &build_graph());
    assert!(summary.is_success());
    assert_eq!(summary.executed(), 2);
    assert_eq!(fs::read_to_string(&out).unwrap(), "hello");

    // Incremental idempotence: nothing re-runs.
    let summary = run(&fx, &build_graph());
    assert!(summary.is_success());
    assert_eq!(summary.executed(), 0);
    assert_eq!(summary.up_to_date(), 2);
  }

  #[test]
  fn touching_an_input_reruns_downstream_only() {
    let fx = fixture();
    let dir = fx.storage.root().join("work");
    fs::create_dir_all(&dir).unwrap();
    let src_a = dir.join("a.txt");
    let src_b = dir.join("b.txt");
    fs::write(&src_a, "a0").unwrap();
    fs::write(&src_b, "b0").unwrap();
    let out_a = dir.join("a.out");
    let out_b = dir.join("b.out");

    let build_graph = || {
      CommandGraph::build(vec![
        {
          let mut c = sh("gen-a", format!("cp {} {}", src_a.display(), out_a.display()));
          c.inputs.insert(src_a.clone());
          c.outputs.insert(out_a.clone());
          c
        },
        {
          let mut c = sh("gen-b", format!("cp {} {}", src_b.display(), out_b.display()));
          c.inputs.insert(src_b.clone());
          c.outputs.insert(out_b.clone());
          c
        },
      ])
      .unwrap()
    };

    assert_eq!(run(&fx, &build_graph()).executed(), 2);

    // Change only one input; the other branch stays up-to-date.
    fs::write(&src_a, "a1").unwrap();
    let summary = run(&fx, &build_graph());
    assert_eq!(summary.executed(), 1);
    assert_eq!(summary.up_to_date(), 1);
    let rerun: Vec<&str> = summary
      .reports
      .iter()
      .filter(|r| r.outcome == CommandOutcome::Succeeded)
      .map(|r| r.name.as_str())
      .collect();
    assert_eq!(rerun, vec!["gen-a"]);
  }

  #[test]
  fn failure_poisons_dependents_and_spares_unrelated_branches() {
    let fx = fixture();
    let dir = fx.storage.root().join("work");
    fs::create_dir_all(&dir).unwrap();
    let poisoned_out = dir.join("never.txt");
    let ok_out = dir.join("ok.txt");

    let graph = CommandGraph::build(vec![
      {
        let mut c = sh("boom", "exit 3".to_string());
        c.outputs.insert(dir.join("boom.txt"));
        c
      },
      {
        let mut c = sh("after-boom", format!("touch {}", poisoned_out.display()));
        c.inputs.insert(dir.join("boom.txt"));
        c.outputs.insert(poisoned_out.clone());
        c
      },
      {
        let mut c = sh("unrelated", format!("touch {}", ok_out.display()));
        c.outputs.insert(ok_out.clone());
        c
      },
    ])
    .unwrap();

    let summary = run(&fx, &graph);
    assert!(!summary.is_success());
    assert_eq!(summary.failed(), 1);
    assert_eq!(summary.poisoned(), 1);
    assert_eq!(summary.executed(), 1);
    assert!(ok_out.exists());
    assert!(!poisoned_out.exists());

    let failed = summary.reports.iter().find(|r| r.name == "boom").unwrap();
    assert!(matches!(
      failed.outcome,
      CommandOutcome::Failed { exit_code: Some(3), .. }
    ));
    let poisoned = summary.reports.iter().find(|r| r.name == "after-boom").unwrap();
    assert_eq!(
      poisoned.outcome,
      CommandOutcome::Poisoned {
        ancestor: "boom".to_string()
      }
    );
  }

  #[test]
  fn failed_command_stderr_is_captured() {
    let fx = fixture();
    let graph = CommandGraph::build(vec![sh("noisy", "echo bad thing >&2; exit 1".to_string())]).unwrap();

    let summary = run(&fx, &graph);
    let report = &summary.reports[0];
    match &report.outcome {
      CommandOutcome::Failed { stderr, .. } => assert!(stderr.contains("bad thing")),
      other => panic!("expected failure, got {other:?}"),
    }
  }

  #[test]
  fn changed_argv_invalidates_stored_state() {
    let fx = fixture();
    let dir = fx.storage.root().join("work");
    fs::create_dir_all(&dir).unwrap();
    let out = dir.join("out.txt");

    let build_graph = |text: &str| {
      let mut c = sh("gen", format!("echo {} > {}", text, out.display()));
      c.outputs.insert(out.clone());
      CommandGraph::build(vec![c]).unwrap()
    };

    assert_eq!(run(&fx, &build_graph("one")).executed(), 1);
    assert_eq!(run(&fx, &build_graph("one")).up_to_date(), 1);
    assert_eq!(run(&fx, &build_graph("two")).executed(), 1);
    assert_eq!(fs::read_to_string(&out).unwrap().trim(), "two");
  }

  #[test]
  fn missing_output_triggers_rerun() {
    let fx = fixture();
    let dir = fx.storage.root().join("work");
    fs::create_dir_all(&dir).unwrap();
    let out = dir.join("out.txt");

    let build_graph = || {
      let mut c = sh("gen", format!("touch {}", out.display()));
      c.outputs.insert(out.clone());
      CommandGraph::build(vec![c]).unwrap()
    };

    assert_eq!(run(&fx, &build_graph()).executed(), 1);
    fs::remove_file(&out).unwrap();
    assert_eq!(run(&fx, &build_graph()).executed(), 1);
  }

  #[test]
  fn stop_before_start_skips_everything() {
    let fx = fixture();
    fx.stop.store(true, Ordering::Relaxed);
    let graph = CommandGraph::build(vec![sh("never", "true".to_string())]).unwrap();

    let summary = run(&fx, &graph);
    assert!(summary.interrupted);
    assert_eq!(summary.skipped(), 1);
  }

  #[test]
  fn command_timeout_is_reported() {
    let fx = fixture();
    let mut slow = sh("sleepy", "sleep 30".to_string());
    slow.timeout = Some(Duration::from_millis(100));
    let graph = CommandGraph::build(vec![slow]).unwrap();

    let summary = run(&fx, &graph);
    assert_eq!(summary.reports[0].outcome, CommandOutcome::Timeout);
    assert!(!summary.is_success());
  }

  #[test]
  fn diamond_executes_fully_in_parallel_pool() {
    let fx = fixture();
    let dir = fx.storage.root().join("work");
    fs::create_dir_all(&dir).unwrap();
    let root = dir.join("root.txt");
    let left = dir.join("left.txt");
    let right = dir.join("right.txt");
    let join = dir.join("join.txt");

    let graph = CommandGraph::build(vec![
      {
        let mut c = sh("root", format!("echo r > {}", root.display()));
        c.outputs.insert(root.clone());
        c
      },
      {
        let mut c = sh("left", format!("cp {} {}", root.display(), left.display()));
        c.inputs.insert(root.clone());
        c.outputs.insert(left.clone());
        c
      },
      {
        let mut c = sh("right", format!("cp {} {}", root.display(), right.display()));
        c.inputs.insert(root.clone());
        c.outputs.insert(right.clone());
        c
      },
      {
        let mut c = sh(
          "join",
          format!("cat {} {} > {}", left.display(), right.display(), join.display()),
        );
        c.inputs.insert(left.clone());
        c.inputs.insert(right.clone());
        c.outputs.insert(join.clone());
        c
      },
    ])
    .unwrap();

    let summary = run(&fx, &graph);
    assert!(summary.is_success());
    assert_eq!(summary.executed(), 4);
    assert!(join.exists());
  }
}
