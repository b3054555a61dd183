use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use serde::Serialize;

use crate::error::BatchError;
use crate::types::{CommandResult, CommandStatus, EnvironmentSetup};

/// Where a command attempt's stdout/stderr goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSink {
    Discard,
    Inherit,
    File(PathBuf),
}

impl OutputSink {
    /// Build the (stdout, stderr) pair for a child process.
    pub fn stdio(&self) -> std::io::Result<(Stdio, Stdio)> {
        match self {
            OutputSink::Discard => Ok((Stdio::null(), Stdio::null())),
            OutputSink::Inherit => Ok((Stdio::inherit(), Stdio::inherit())),
            OutputSink::File(path) => {
                let file = fs::File::create(path)?;
                let err = file.try_clone()?;
                Ok((Stdio::from(file), Stdio::from(err)))
            }
        }
    }
}

/// Capability interface for recording a batch run. Implementations guard
/// their own state; every method may be called from concurrent tasks.
pub trait Reporter: Send + Sync {
    fn record_environment_setup(&self, setup: &EnvironmentSetup);

    fn open_command_output(&self, command: &str, attempt: u32) -> Result<OutputSink, BatchError>;

    fn record_command_result(&self, result: &CommandResult);

    fn finalize(&self) -> Result<(), BatchError>;
}

/// Reporter that records nothing.
#[derive(Debug, Default)]
pub struct NoopReporter {
    inherit_output: bool,
}

impl NoopReporter {
    /// A no-op reporter that lets command output through to the terminal.
    pub fn inheriting() -> Self {
        Self {
            inherit_output: true,
        }
    }
}

impl Reporter for NoopReporter {
    fn record_environment_setup(&self, _setup: &EnvironmentSetup) {}

    fn open_command_output(&self, _command: &str, _attempt: u32) -> Result<OutputSink, BatchError> {
        Ok(if self.inherit_output {
            OutputSink::Inherit
        } else {
            OutputSink::Discard
        })
    }

    fn record_command_result(&self, _result: &CommandResult) {}

    fn finalize(&self) -> Result<(), BatchError> {
        Ok(())
    }
}

/// Contents of `report.json`.
#[derive(Serialize, Debug, Default)]
pub struct BatchReport {
    pub generated_at: String,
    pub setups: Vec<EnvironmentSetup>,
    pub commands: Vec<CommandResult>,
    pub failures: Vec<String>,
}

/// File stems handed out per command, so two names that sanitize alike
/// never share a log file.
#[derive(Debug, Default)]
struct OutputStems {
    by_command: HashMap<String, String>,
    taken: HashSet<String>,
}

/// Writes each attempt's output to `<dir>/output/<command>.<attempt>.log`
/// and a JSON summary to `<dir>/report.json` on finalize.
#[derive(Debug)]
pub struct FileReporter {
    dir: PathBuf,
    report: Mutex<BatchReport>,
    stems: Mutex<OutputStems>,
}

impl FileReporter {
    pub fn new(dir: &Path) -> Result<Self, BatchError> {
        let output_dir = dir.join("output");
        fs::create_dir_all(&output_dir).map_err(|e| {
            BatchError::Report(format!("Failed to create {}: {}", output_dir.display(), e))
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            report: Mutex::new(BatchReport::default()),
            stems: Mutex::new(OutputStems::default()),
        })
    }

    pub fn report_path(&self) -> PathBuf {
        self.dir.join("report.json")
    }

    /// Log file for one attempt. A command whose sanitized name is already
    /// used by another command gets a `-2`, `-3`, ... suffix.
    pub fn output_path(&self, command: &str, attempt: u32) -> PathBuf {
        self.dir
            .join("output")
            .join(format!("{}.{}.log", self.output_stem(command), attempt))
    }

    fn output_stem(&self, command: &str) -> String {
        let mut stems = self
            .stems
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(stem) = stems.by_command.get(command) {
            return stem.clone();
        }

        let base = sanitize(command);
        let mut stem = base.clone();
        let mut n = 2;
        while stems.taken.contains(&stem) {
            stem = format!("{}-{}", base, n);
            n += 1;
        }
        stems.taken.insert(stem.clone());
        stems.by_command.insert(command.to_string(), stem.clone());
        stem
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BatchReport> {
        self.report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Reporter for FileReporter {
    fn record_environment_setup(&self, setup: &EnvironmentSetup) {
        self.lock().setups.push(setup.clone());
    }

    fn open_command_output(&self, command: &str, attempt: u32) -> Result<OutputSink, BatchError> {
        Ok(OutputSink::File(self.output_path(command, attempt)))
    }

    fn record_command_result(&self, result: &CommandResult) {
        let mut report = self.lock();
        if result.status == CommandStatus::Failed {
            report.failures.push(result.name.clone());
        }
        report.commands.push(result.clone());
    }

    fn finalize(&self) -> Result<(), BatchError> {
        let path = self.report_path();
        let contents = {
            let mut report = self.lock();
            report.generated_at = chrono::Utc::now().to_rfc3339();
            report.commands.sort_by(|a, b| a.name.cmp(&b.name));
            report.failures.sort();
            serde_json::to_string_pretty(&*report)
                .map_err(|e| BatchError::Report(format!("Failed to serialize report: {}", e)))?
        };
        fs::write(&path, contents)
            .map_err(|e| BatchError::Report(format!("Failed to write {}: {}", path.display(), e)))
    }
}

/// Command names become file names; keep them to a safe character set.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Reporter chosen from configuration.
#[derive(Debug)]
pub enum ReporterKind {
    Noop(NoopReporter),
    File(FileReporter),
}

impl ReporterKind {
    /// File reporter when a report directory is configured, otherwise no-op
    /// with output passed through to the terminal.
    pub fn from_report_dir(dir: Option<&Path>) -> Result<Self, BatchError> {
        match dir {
            Some(dir) => Ok(ReporterKind::File(FileReporter::new(dir)?)),
            None => Ok(ReporterKind::Noop(NoopReporter::inheriting())),
        }
    }

    fn inner(&self) -> &dyn Reporter {
        match self {
            ReporterKind::Noop(r) => r,
            ReporterKind::File(r) => r,
        }
    }
}

impl Reporter for ReporterKind {
    fn record_environment_setup(&self, setup: &EnvironmentSetup) {
        self.inner().record_environment_setup(setup)
    }

    fn open_command_output(&self, command: &str, attempt: u32) -> Result<OutputSink, BatchError> {
        self.inner().open_command_output(command, attempt)
    }

    fn record_command_result(&self, result: &CommandResult) {
        self.inner().record_command_result(result)
    }

    fn finalize(&self) -> Result<(), BatchError> {
        self.inner().finalize()
    }
}
