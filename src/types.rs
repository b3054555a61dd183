use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// --- Commands ---

/// How to launch a command's process.
#[derive(Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ProcessSpec {
    pub argv: Vec<String>,
    /// Working directory; relative paths resolve against the batch file's directory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A named command in a batch. Immutable once scheduling begins.
#[derive(Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Command {
    pub name: String,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub pipelines: Vec<String>,
    #[serde(default)]
    pub flaky: bool,
    #[serde(flatten)]
    pub process: ProcessSpec,
    /// Environment whose before hooks initialize the command's stacks.
    #[serde(default)]
    pub environment: Option<String>,
}

impl Command {
    /// Construct a command with the given argv and defaults for everything else.
    pub fn new(name: &str, argv: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            process: ProcessSpec {
                argv: argv.iter().map(|a| a.to_string()).collect(),
                ..ProcessSpec::default()
            },
            ..Self::default()
        }
    }
}

// --- Stacks ---

/// Identity of a live stack instance: pipeline family plus a short name,
/// unique within the pipeline.
#[derive(Serialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackId {
    pub family: String,
    pub name: String,
}

impl StackId {
    pub fn new(family: &str, name: &str) -> Self {
        Self {
            family: family.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.family, self.name)
    }
}

/// Resolved pipeline definition, as handed to the allocator and deploy action.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct PipelineSpec {
    pub name: String,
    pub max_stacks: usize,
    pub deploy: Vec<String>,
    pub release: Vec<String>,
    /// Environment templates expanded per stack.
    pub env: BTreeMap<String, String>,
}

// --- Statuses ---

/// Completion signal value observed by dependents. Moves from `Pending` to
/// one of the terminal values exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionStatus {
    Pending,
    Success,
    Skipped,
}

/// Final status of a command as reported.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandStatus::Succeeded => write!(f, "succeeded"),
            CommandStatus::Failed => write!(f, "failed"),
            CommandStatus::Skipped => write!(f, "skipped"),
            CommandStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one command, recorded with the reporter.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct CommandResult {
    pub name: String,
    pub status: CommandStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn skipped(name: &str, reason: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CommandStatus::Skipped,
            attempts: 0,
            error: Some(reason.to_string()),
            started_at: None,
            duration_ms: 0,
        }
    }

    pub fn cancelled(name: &str, attempts: u32) -> Self {
        Self {
            name: name.to_string(),
            status: CommandStatus::Cancelled,
            attempts,
            error: None,
            started_at: None,
            duration_ms: 0,
        }
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SetupPhase {
    Deploy,
    BeforeHooks,
}

/// Outcome of a one-time stack initialization step.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct EnvironmentSetup {
    pub stack: StackId,
    pub phase: SetupPhase,
    pub environment: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}
