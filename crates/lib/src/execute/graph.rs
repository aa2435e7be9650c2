//! The bipartite command/file graph.
//!
//! Left nodes are files, right nodes are commands. A file points at every
//! command that reads it; a command points at every file it writes. Every
//! file is produced by at most one command, and the graph must be acyclic.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use crate::command::Command;

#[derive(Debug, Error)]
pub enum GraphError {
  #[error("commands '{first}' and '{second}' both produce {path}")]
  DoubleProducer {
    path: PathBuf,
    first: String,
    second: String,
  },

  #[error("circular command dependency")]
  CircularCommandDependency,
}

/// A node of the bipartite graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphNode {
  File(PathBuf),
  Command(usize),
}

/// An immutable build graph plus the derived scheduling structure.
#[derive(Debug)]
pub struct CommandGraph {
  commands: Vec<Command>,
  graph: DiGraph<GraphNode, ()>,
  producers: HashMap<PathBuf, usize>,
  /// Producer commands of each command's inputs.
  preds: Vec<BTreeSet<usize>>,
  /// Inverse of `preds`.
  succs: Vec<BTreeSet<usize>>,
  /// Command indices in topological order.
  order: Vec<usize>,
}

impl CommandGraph {
  pub fn build(commands: Vec<Command>) -> Result<Self, GraphError> {
    let mut producers: HashMap<PathBuf, usize> = HashMap::new();
    for (idx, command) in commands.iter().enumerate() {
      for path in command.produced() {
        if let Some(&first) = producers.get(path) {
          return Err(GraphError::DoubleProducer {
            path: path.clone(),
            first: commands[first].name.clone(),
            second: command.name.clone(),
          });
        }
        producers.insert(path.clone(), idx);
      }
    }

    let mut graph = DiGraph::new();
    let mut file_nodes: HashMap<PathBuf, NodeIndex> = HashMap::new();
    let mut command_nodes = Vec::with_capacity(commands.len());

    for idx in 0..commands.len() {
      command_nodes.push(graph.add_node(GraphNode::Command(idx)));
    }
    let mut file_node = |graph: &mut DiGraph<GraphNode, ()>, path: &Path| {
      *file_nodes
        .entry(path.to_path_buf())
        .or_insert_with(|| graph.add_node(GraphNode::File(path.to_path_buf())))
    };

    for (idx, command) in commands.iter().enumerate() {
      for input in &command.inputs {
        let file = file_node(&mut graph, input);
        graph.add_edge(file, command_nodes[idx], ());
      }
      for produced in command.produced() {
        let file = file_node(&mut graph, produced);
        graph.add_edge(command_nodes[idx], file, ());
      }
    }

    if toposort(&graph, None).is_err() {
      return Err(GraphError::CircularCommandDependency);
    }

    let mut preds: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); commands.len()];
    let mut succs: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); commands.len()];
    for (idx, command) in commands.iter().enumerate() {
      for input in &command.inputs {
        if let Some(&producer) = producers.get(input) {
          if producer != idx {
            preds[idx].insert(producer);
            succs[producer].insert(idx);
          }
        }
      }
    }

    // Kahn over the command projection for a deterministic order.
    let mut remaining: Vec<usize> = preds.iter().map(BTreeSet::len).collect();
    let mut queue: Vec<usize> = (0..commands.len()).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(commands.len());
    let mut cursor = 0;
    while cursor < queue.len() {
      let idx = queue[cursor];
      cursor += 1;
      order.push(idx);
      for &succ in &succs[idx] {
        remaining[succ] -= 1;
        if remaining[succ] == 0 {
          queue.push(succ);
        }
      }
    }
    debug_assert_eq!(order.len(), commands.len());

    Ok(CommandGraph {
      commands,
      graph,
      producers,
      preds,
      succs,
      order,
    })
  }

  pub fn commands(&self) -> &[Command] {
    &self.commands
  }

  pub fn len(&self) -> usize {
    self.commands.len()
  }

  pub fn is_empty(&self) -> bool {
    self.commands.is_empty()
  }

  pub fn command(&self, idx: usize) -> &Command {
    &self.commands[idx]
  }

  pub fn producer_of(&self, path: &Path) -> Option<usize> {
    self.producers.get(path).copied()
  }

  pub fn predecessors(&self, idx: usize) -> &BTreeSet<usize> {
    &self.preds[idx]
  }

  pub fn successors(&self, idx: usize) -> &BTreeSet<usize> {
    &self.succs[idx]
  }

  /// Command indices in topological order.
  pub fn topological_order(&self) -> &[usize] {
    &self.order
  }

  /// Input files no command produces; they must already exist on disk.
  pub fn source_files(&self) -> BTreeSet<PathBuf> {
    let mut sources = BTreeSet::new();
    for command in &self.commands {
      for input in &command.inputs {
        if !self.producers.contains_key(input) {
          sources.insert(input.clone());
        }
      }
    }
    sources
  }

  /// Total node count of the bipartite graph (files + commands).
  pub fn node_count(&self) -> usize {
    self.graph.node_count()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn cmd(name: &str, inputs: &[&str], outputs: &[&str]) -> Command {
    let mut command = Command::new(name, "true");
    for input in inputs {
      command.inputs.insert(PathBuf::from(input));
    }
    for output in outputs {
      command.outputs.insert(PathBuf::from(output));
    }
    command
  }

  #[test]
  fn empty_graph() {
    let graph = CommandGraph::build(Vec::new()).unwrap();
    assert!(graph.is_empty());
    assert!(graph.source_files().is_empty());
  }

  #[test]
  fn chain_derives_predecessors() {
    let graph = CommandGraph::build(vec![
      cmd("compile", &["a.c"], &["a.o"]),
      cmd("archive", &["a.o"], &["liba.a"]),
      cmd("link", &["liba.a"], &["app"]),
    ])
    .unwrap();

    assert!(graph.predecessors(0).is_empty());
    assert_eq!(graph.predecessors(1).iter().copied().collect::<Vec<_>>(), vec![0]);
    assert_eq!(graph.predecessors(2).iter().copied().collect::<Vec<_>>(), vec![1]);
    assert_eq!(graph.successors(0).iter().copied().collect::<Vec<_>>(), vec![1]);
    assert_eq!(graph.topological_order(), &[0, 1, 2]);

    assert_eq!(graph.producer_of(Path::new("a.o")), Some(0));
    assert_eq!(graph.producer_of(Path::new("a.c")), None);
    assert_eq!(
      graph.source_files().into_iter().collect::<Vec<_>>(),
      vec![PathBuf::from("a.c")]
    );
  }

  #[test]
  fn double_producer_is_rejected() {
    let err = CommandGraph::build(vec![
      cmd("one", &[], &["out.o"]),
      cmd("two", &[], &["out.o"]),
    ])
    .unwrap_err();
    assert!(matches!(err, GraphError::DoubleProducer { .. }));
  }

  #[test]
  fn intermediate_double_production_is_rejected_too() {
    let mut a = cmd("one", &[], &[]);
    a.intermediates.insert(PathBuf::from("scratch.tmp"));
    let mut b = cmd("two", &[], &[]);
    b.intermediates.insert(PathBuf::from("scratch.tmp"));

    let err = CommandGraph::build(vec![a, b]).unwrap_err();
    assert!(matches!(err, GraphError::DoubleProducer { .. }));
  }

  #[test]
  fn cycle_is_rejected() {
    let err = CommandGraph::build(vec![
      cmd("a", &["x"], &["y"]),
      cmd("b", &["y"], &["x"]),
    ])
    .unwrap_err();
    assert!(matches!(err, GraphError::CircularCommandDependency));
  }

  #[test]
  fn self_loop_is_rejected() {
    let err = CommandGraph::build(vec![cmd("a", &["x"], &["x"])]).unwrap_err();
    assert!(matches!(err, GraphError::CircularCommandDependency));
  }

  #[test]
  fn diamond_topology() {
    let graph = CommandGraph::build(vec![
      cmd("root", &[], &["r"]),
      cmd("left", &["r"], &["l"]),
      cmd("right", &["r"], &["g"]),
      cmd("join", &["l", "g"], &["out"]),
    ])
    .unwrap();

    assert_eq!(graph.predecessors(3).len(), 2);
    let order = graph.topological_order();
    let pos = |i: usize| order.iter().position(|&x| x == i).unwrap();
    assert!(pos(0) < pos(1));
    assert!(pos(0) < pos(2));
    assert!(pos(1) < pos(3));
    assert!(pos(2) < pos(3));
  }

  #[test]
  fn bipartite_node_count_includes_files() {
    let graph = CommandGraph::build(vec![cmd("compile", &["a.c"], &["a.o"])]).unwrap();
    // One command, two files.
    assert_eq!(graph.node_count(), 3);
  }
}
