//! Command graph construction and incremental parallel execution.

mod executor;
mod graph;
mod types;

pub use executor::Executor;
pub use graph::{CommandGraph, GraphError, GraphNode};
pub use types::{CommandOutcome, CommandReport, ExecuteConfig, ExecuteError, ExecuteSummary};

use crate::target::TargetMap;

/// Gather every prepared target's commands into one graph.
pub fn graph_from_targets(map: &TargetMap) -> Result<CommandGraph, GraphError> {
  let mut commands = Vec::new();
  for target in map.iter() {
    commands.extend(target.commands.iter().cloned());
  }
  CommandGraph::build(commands)
}
