use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::BatchError;
use crate::log::LogLevel;
use crate::types::Command;

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BatchConfig {
    pub batch: BatchSettings,
    pub pipelines: HashMap<String, PipelineConfig>,
    pub environments: HashMap<String, EnvironmentConfig>,
    pub commands: Vec<Command>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BatchSettings {
    pub parallelism: usize,
    pub bail: bool,
    pub advisory: bool,
    /// Cancel the whole batch after this many minutes; 0 disables the timeout.
    pub timeout_minutes: u64,
    pub report_dir: Option<PathBuf>,
    pub log_level: LogLevel,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            parallelism: 4,
            bail: false,
            advisory: false,
            timeout_minutes: 0,
            report_dir: None,
            log_level: LogLevel::Info,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_stacks: usize,
    pub deploy: Vec<String>,
    pub release: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_stacks: 1,
            deploy: Vec::new(),
            release: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub before: Vec<Vec<String>>,
}

pub fn validate(config: &BatchConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.batch.parallelism < 1 {
        errors.push("batch.parallelism must be >= 1".to_string());
    }

    for (name, pipeline) in &config.pipelines {
        if pipeline.max_stacks < 1 {
            errors.push(format!("pipelines.{}: max_stacks must be >= 1", name));
        }
    }

    let mut seen = HashSet::new();
    for command in &config.commands {
        if command.name.trim().is_empty() {
            errors.push("commands: name must not be empty".to_string());
            continue;
        }
        if !seen.insert(command.name.as_str()) {
            errors.push(format!("commands: duplicate command name '{}'", command.name));
        }
        if command.process.argv.is_empty() {
            errors.push(format!("commands.{}: argv must not be empty", command.name));
        }
        for pipeline in &command.pipelines {
            if !config.pipelines.contains_key(pipeline) {
                errors.push(format!(
                    "commands.{}: unknown pipeline '{}'",
                    command.name, pipeline
                ));
            }
        }
        if let Some(env) = &command.environment {
            if !config.environments.contains_key(env) {
                errors.push(format!(
                    "commands.{}: unknown environment '{}'",
                    command.name, env
                ));
            }
        }
    }

    if let Some(cycle) = find_dependency_cycle(&config.commands) {
        errors.push(format!("dependency cycle: {}", cycle.join(" -> ")));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Find a cycle in the `depends_on` graph, returned as the path that closes
/// it (first and last element equal). Dependencies on names outside the
/// batch are ignored here; they skip at runtime.
pub fn find_dependency_cycle(commands: &[Command]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        graph: &HashMap<&'a str, &'a [String]>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(name) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = path.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                cycle.push(name.to_string());
                return Some(cycle);
            }
            None => {}
        }

        marks.insert(name, Mark::Visiting);
        path.push(name);
        if let Some(&deps) = graph.get(name) {
            for dep in deps {
                if graph.contains_key(dep.as_str()) {
                    if let Some(cycle) = visit(dep.as_str(), graph, marks, path) {
                        return Some(cycle);
                    }
                }
            }
        }
        path.pop();
        marks.insert(name, Mark::Done);
        None
    }

    let graph: HashMap<&str, &[String]> = commands
        .iter()
        .map(|c| (c.name.as_str(), c.depends_on.as_slice()))
        .collect();
    let mut marks = HashMap::new();
    let mut path = Vec::new();

    commands
        .iter()
        .find_map(|c| visit(c.name.as_str(), &graph, &mut marks, &mut path))
}

/// Parse a batch file from TOML text. Relative command directories and the
/// report directory resolve against `base_dir`.
pub fn parse_batch(contents: &str, base_dir: &Path) -> Result<BatchConfig, BatchError> {
    let mut config: BatchConfig =
        toml::from_str(contents).map_err(|e| BatchError::Config(e.to_string()))?;

    validate(&config).map_err(|errors| {
        BatchError::Config(format!(
            "validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        ))
    })?;

    for command in &mut config.commands {
        if let Some(dir) = &command.process.dir {
            if dir.is_relative() {
                command.process.dir = Some(base_dir.join(dir));
            }
        }
    }
    if let Some(dir) = &config.batch.report_dir {
        if dir.is_relative() {
            config.batch.report_dir = Some(base_dir.join(dir));
        }
    }

    Ok(config)
}

pub fn load_batch(path: &Path) -> Result<BatchConfig, BatchError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| BatchError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    let base_dir = path.parent().unwrap_or(Path::new("."));
    parse_batch(&contents, base_dir).map_err(|e| match e {
        BatchError::Config(msg) => BatchError::Config(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}
