#![allow(dead_code)]

use std::sync::Arc;

use stack_golem::error::BatchError;
use stack_golem::pool::Allocation;
use stack_golem::process::MockProcessRunner;
use stack_golem::provider::MockStackProvider;
use stack_golem::report::{NoopReporter, Reporter};
use stack_golem::types::{Command, StackId};

/// Creates a `Command` running `true` with no dependencies or pipelines.
pub fn make_command(name: &str) -> Command {
    Command::new(name, &["true"])
}

/// Creates a command that needs stacks from the given pipelines.
pub fn make_stack_command(name: &str, pipelines: &[&str], exclusive: bool) -> Command {
    let mut command = make_command(name);
    command.pipelines = pipelines.iter().map(|p| p.to_string()).collect();
    command.exclusive = exclusive;
    command
}

/// Creates a command depending on the given command names.
pub fn make_dependent_command(name: &str, depends_on: &[&str]) -> Command {
    let mut command = make_command(name);
    command.depends_on = depends_on.iter().map(|d| d.to_string()).collect();
    command
}

/// Allocator closure result for pool tests: a stack named `<pipeline>-<n>`.
pub async fn allocate(pipeline: &str, n: usize) -> Result<Allocation, BatchError> {
    Ok(Allocation::new(StackId::new(pipeline, &format!("{}-{}", pipeline, n))))
}

pub fn noop_reporter() -> Arc<dyn Reporter> {
    Arc::new(NoopReporter::default())
}

pub fn mock_provider(pipelines: &[(&str, usize)]) -> Arc<MockStackProvider> {
    Arc::new(MockStackProvider::new(pipelines))
}

pub fn mock_runner() -> Arc<MockProcessRunner> {
    Arc::new(MockProcessRunner::new())
}
