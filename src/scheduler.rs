use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::BatchError;
use crate::pool::{PoolSet, StackLease};
use crate::process::{ProcessRunner, RunRequest};
use crate::provider::StackProvider;
use crate::report::Reporter;
use crate::tracker::{CompletionTracker, DependencyOutcome};
use crate::types::{
    Command, CommandResult, CommandStatus, CompletionStatus, EnvironmentSetup, SetupPhase,
};
use crate::{log_debug, log_error, log_info, log_warn};

/// Total attempts allowed for a flaky command.
pub const FLAKY_MAX_ATTEMPTS: u32 = 3;

/// Pause between attempts of a flaky command.
const FLAKY_RETRY_BACKOFF_MS: u64 = 500;

// --- Public types ---

/// Batch-wide scheduling and failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub parallelism: usize,
    /// Cancel the batch on the first command failure.
    pub bail: bool,
    /// Record failures but report the batch as successful. Ignored with `bail`.
    pub advisory: bool,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            parallelism: 4,
            bail: false,
            advisory: false,
        }
    }
}

/// Per-command outcomes of a batch run.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub results: Vec<CommandResult>,
    /// Commands that failed, excluding cancellations.
    pub failures: Vec<String>,
    pub cancelled: Vec<String>,
    pub skipped: Vec<String>,
}

impl BatchSummary {
    pub fn from_results(mut results: Vec<CommandResult>) -> Self {
        results.sort_by(|a, b| a.name.cmp(&b.name));
        let names_with = |status: CommandStatus| -> Vec<String> {
            results
                .iter()
                .filter(|r| r.status == status)
                .map(|r| r.name.clone())
                .collect()
        };
        let failures = names_with(CommandStatus::Failed);
        let cancelled = names_with(CommandStatus::Cancelled);
        let skipped = names_with(CommandStatus::Skipped);
        Self {
            results,
            failures,
            cancelled,
            skipped,
        }
    }

    pub fn result(&self, name: &str) -> Option<&CommandResult> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn succeeded(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == CommandStatus::Succeeded)
            .count()
    }

    /// Apply the failure policy.
    ///
    /// - bail with a failing command: `Bailed` naming it
    /// - cancelled for any other reason (timeout, signal): `Cancelled`
    /// - failures without advisory: `CommandsFailed`
    /// - otherwise `Ok`
    pub fn outcome(
        &self,
        policy: &BatchPolicy,
        bail_cause: Option<(String, String)>,
    ) -> Result<(), BatchError> {
        if let Some((command, message)) = bail_cause {
            return Err(BatchError::Bailed { command, message });
        }
        if !self.cancelled.is_empty() {
            return Err(BatchError::Cancelled);
        }
        if !self.failures.is_empty() && !(policy.advisory && !policy.bail) {
            return Err(BatchError::CommandsFailed(self.failures.clone()));
        }
        Ok(())
    }

    /// [`BatchSummary::outcome`], keeping the summary on success.
    pub fn into_outcome(
        self,
        policy: &BatchPolicy,
        bail_cause: Option<(String, String)>,
    ) -> Result<BatchSummary, BatchError> {
        self.outcome(policy, bail_cause).map(|()| self)
    }
}

/// A finished batch: every command's result plus the policy outcome.
#[derive(Debug)]
pub struct BatchRun {
    pub summary: BatchSummary,
    pub outcome: Result<(), BatchError>,
}

impl BatchRun {
    /// The summary if the batch succeeded under its policy, otherwise the error.
    pub fn into_result(self) -> Result<BatchSummary, BatchError> {
        self.outcome.map(|()| self.summary)
    }
}

// --- Entry point ---

/// Run every command, honoring dependencies, stack pools and the batch policy.
///
/// Returns the summary on success and the policy error otherwise. Use
/// [`execute_batch`] to keep the per-command results when the batch fails.
pub async fn run_batch<P, R>(
    commands: Vec<Command>,
    policy: BatchPolicy,
    provider: Arc<P>,
    runner: Arc<R>,
    reporter: Arc<dyn Reporter>,
    cancel: CancellationToken,
) -> Result<BatchSummary, BatchError>
where
    P: StackProvider + 'static,
    R: ProcessRunner + 'static,
{
    execute_batch(commands, policy, provider, runner, reporter, cancel)
        .await?
        .into_result()
}

/// Run every command and return each result alongside the policy outcome.
///
/// Commands are expected to be validated (unique names, acyclic
/// dependencies). `Err` is returned only when scheduling cannot start (an
/// unknown pipeline). Every stack allocated during the run is released before
/// returning, and the reporter is finalized on every path past pipeline
/// resolution.
pub async fn execute_batch<P, R>(
    commands: Vec<Command>,
    policy: BatchPolicy,
    provider: Arc<P>,
    runner: Arc<R>,
    reporter: Arc<dyn Reporter>,
    cancel: CancellationToken,
) -> Result<BatchRun, BatchError>
where
    P: StackProvider + 'static,
    R: ProcessRunner + 'static,
{
    let pipelines: BTreeSet<&str> = commands
        .iter()
        .flat_map(|c| c.pipelines.iter().map(String::as_str))
        .collect();
    let specs = pipelines
        .iter()
        .map(|name| provider.resolve(name))
        .collect::<Result<Vec<_>, _>>()?;
    for spec in &specs {
        log_debug!("[pool:{}] max_stacks={}", spec.name, spec.max_stacks);
    }

    let ctx = Arc::new(BatchContext {
        provider: Arc::clone(&provider),
        runner,
        reporter: Arc::clone(&reporter),
        pools: PoolSet::new(specs),
        tracker: Arc::new(CompletionTracker::new(
            commands.iter().map(|c| c.name.as_str()),
        )),
        limiter: Semaphore::new(policy.parallelism.max(1)),
        bail: policy.bail,
        bail_cause: Mutex::new(None),
        cancel: cancel.clone(),
    });

    log_info!(
        "Batch started ({} commands, parallelism={}, bail={}, advisory={})",
        commands.len(),
        policy.parallelism,
        policy.bail,
        policy.advisory
    );

    let mut join_set: JoinSet<CommandResult> = JoinSet::new();
    for command in commands {
        let ctx = Arc::clone(&ctx);
        join_set.spawn(async move { ctx.run_command(command).await });
    }

    let mut results = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => log_error!("Command task failed to complete: {}", e),
        }
    }

    ctx.pools.teardown(&provider).await;

    let summary = BatchSummary::from_results(results);
    log_info!(
        "Batch finished: {} succeeded, {} failed, {} skipped, {} cancelled",
        summary.succeeded(),
        summary.failures.len(),
        summary.skipped.len(),
        summary.cancelled.len()
    );

    let bail_cause = ctx.take_bail_cause();
    let outcome = summary.outcome(&policy, bail_cause);
    let outcome = match (reporter.finalize(), outcome) {
        (Ok(()), outcome) => outcome,
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(batch_error)) => {
            log_warn!("Warning: failed to finalize report: {}", e);
            Err(batch_error)
        }
    };
    Ok(BatchRun { summary, outcome })
}

// --- Per-command task ---

struct BatchContext<P, R> {
    provider: Arc<P>,
    runner: Arc<R>,
    reporter: Arc<dyn Reporter>,
    pools: PoolSet,
    tracker: Arc<CompletionTracker>,
    limiter: Semaphore,
    bail: bool,
    /// First failing command when bailing, with its error.
    bail_cause: Mutex<Option<(String, String)>>,
    cancel: CancellationToken,
}

impl<P, R> BatchContext<P, R>
where
    P: StackProvider + 'static,
    R: ProcessRunner + 'static,
{
    async fn run_command(self: Arc<Self>, command: Command) -> CommandResult {
        let name = command.name.clone();
        let mut completion = CompletionSignal::new(Arc::clone(&self.tracker), &name);

        match self
            .tracker
            .wait_for_dependencies(&command.depends_on, &self.cancel)
            .await
        {
            Ok(DependencyOutcome::Ready) => {}
            Ok(DependencyOutcome::Skip(reason)) => {
                log_info!("[{}] Skipped: {}", name, reason);
                let result = CommandResult::skipped(&name, &reason);
                self.reporter.record_command_result(&result);
                return result;
            }
            Err(_) => return self.cancelled(&name, 0),
        }

        let _permit = tokio::select! {
            permit = self.limiter.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return self.cancelled(&name, 0),
            },
            _ = self.cancel.cancelled() => return self.cancelled(&name, 0),
        };

        let started_at = chrono::Utc::now().to_rfc3339();
        let started = Instant::now();
        let (attempts, outcome) = self.execute(&command).await;

        let (status, error) = match &outcome {
            Ok(()) => (CommandStatus::Succeeded, None),
            Err(e) if e.is_cancellation() => (CommandStatus::Cancelled, None),
            Err(e) => (CommandStatus::Failed, Some(e.to_string())),
        };
        let result = CommandResult {
            name: name.clone(),
            status,
            attempts,
            error,
            started_at: Some(started_at),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        self.reporter.record_command_result(&result);

        match status {
            CommandStatus::Succeeded => {
                completion.succeed();
                log_info!("[{}] Succeeded (attempts: {})", name, attempts);
            }
            CommandStatus::Cancelled => log_info!("[{}] Cancelled", name),
            _ => {
                let message = result.error.clone().unwrap_or_default();
                log_error!("[{}] Failed: {}", name, message);
                if self.bail {
                    self.trigger_bail(&name, &message);
                }
            }
        }
        result
    }

    /// Acquire stacks, initialize them, and run the process. Stacks are
    /// released when the leases drop at the end, whatever the outcome.
    async fn execute(&self, command: &Command) -> (u32, Result<(), BatchError>) {
        let leases = match self.acquire_stacks(command).await {
            Ok(leases) => leases,
            Err(e) => return (0, Err(e)),
        };

        if let Err(e) = self.initialize_stacks(command, &leases).await {
            return (0, Err(e));
        }

        let env = match self.build_env(command, &leases) {
            Ok(env) => env,
            Err(e) => return (0, Err(e)),
        };

        self.run_with_retry(command, env).await
    }

    /// Pipelines are acquired in name order so two commands needing the same
    /// pipelines can't each hold one and wait on the other.
    async fn acquire_stacks(&self, command: &Command) -> Result<Vec<StackLease>, BatchError> {
        let pipelines: BTreeSet<&String> = command.pipelines.iter().collect();
        let mut leases = Vec::with_capacity(pipelines.len());

        for pipeline in pipelines {
            let (pool, spec) = self
                .pools
                .get(pipeline)
                .ok_or_else(|| BatchError::PipelineNotFound(pipeline.clone()))?;
            let provider = &self.provider;
            let lease = pool
                .acquire(command.exclusive, &self.cancel, || provider.allocate(&spec))
                .await?;
            log_debug!("[{}] Holding {}", command.name, lease.id());
            leases.push(lease);
        }
        Ok(leases)
    }

    /// Deploy each stack once per lifetime and run before hooks once per
    /// initialization window. Co-users wait on the same gates.
    async fn initialize_stacks(
        &self,
        command: &Command,
        leases: &[StackLease],
    ) -> Result<(), BatchError> {
        for lease in leases {
            let (_, spec) = self
                .pools
                .get(lease.pipeline())
                .ok_or_else(|| BatchError::PipelineNotFound(lease.pipeline().to_string()))?;

            let deployed = lease.deployed().run_once(|| async {
                log_info!("[{}] Deploying {}", command.name, lease.id());
                let started = Instant::now();
                let result = self
                    .provider
                    .deploy(lease.id(), &spec)
                    .await
                    .map_err(|e| e.to_string());
                self.record_setup(lease, SetupPhase::Deploy, None, &result, started);
                result
            });
            tokio::select! {
                result = deployed => result.map_err(|message| BatchError::Allocation {
                    pipeline: spec.name.clone(),
                    message,
                })?,
                _ = self.cancel.cancelled() => return Err(BatchError::Cancelled),
            }

            let environment = command.environment.as_deref();
            let initialized = lease.before_hooks().run_once(|| async {
                log_debug!("[{}] Running before hooks on {}", command.name, lease.id());
                let started = Instant::now();
                let result = self
                    .provider
                    .run_before_hooks(lease.id(), environment)
                    .await
                    .map_err(|e| e.to_string());
                self.record_setup(lease, SetupPhase::BeforeHooks, environment, &result, started);
                result
            });
            tokio::select! {
                result = initialized => result.map_err(|message| BatchError::Setup {
                    stack: lease.id().clone(),
                    message,
                })?,
                _ = self.cancel.cancelled() => return Err(BatchError::Cancelled),
            }
        }
        Ok(())
    }

    fn record_setup(
        &self,
        lease: &StackLease,
        phase: SetupPhase,
        environment: Option<&str>,
        result: &Result<(), String>,
        started: Instant,
    ) {
        self.reporter.record_environment_setup(&EnvironmentSetup {
            stack: lease.id().clone(),
            phase,
            environment: environment.map(str::to_string),
            error: result.as_ref().err().cloned(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    /// Stack-derived variables first, then the command's own env on top.
    fn build_env(
        &self,
        command: &Command,
        leases: &[StackLease],
    ) -> Result<BTreeMap<String, String>, BatchError> {
        let mut env = BTreeMap::new();
        for lease in leases {
            if let Some((_, spec)) = self.pools.get(lease.pipeline()) {
                env.extend(self.provider.expand_env(lease.id(), &spec.env)?);
            }
        }
        env.extend(command.process.env.clone());
        Ok(env)
    }

    async fn run_with_retry(
        &self,
        command: &Command,
        env: BTreeMap<String, String>,
    ) -> (u32, Result<(), BatchError>) {
        let max_attempts = if command.flaky { FLAKY_MAX_ATTEMPTS } else { 1 };
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                return (attempt - 1, Err(BatchError::Cancelled));
            }

            log_info!(
                "[{}] Running (attempt {}/{})",
                command.name,
                attempt,
                max_attempts
            );
            let sink = match self.reporter.open_command_output(&command.name, attempt) {
                Ok(sink) => sink,
                Err(e) => return (attempt, Err(e)),
            };
            let request = RunRequest {
                command: command.name.clone(),
                argv: command.process.argv.clone(),
                env: env.clone(),
                dir: command.process.dir.clone(),
                sink,
            };

            let error = match self.runner.run(request, &self.cancel).await {
                Ok(exit) if exit.success() => return (attempt, Ok(())),
                Ok(exit) => BatchError::Execution {
                    command: command.name.clone(),
                    message: match exit.code {
                        Some(code) => format!("exited with code {}", code),
                        None => "terminated by signal".to_string(),
                    },
                },
                Err(e) if !e.is_retryable() => return (attempt, Err(e)),
                Err(e) => e,
            };

            if attempt < max_attempts {
                log_warn!(
                    "[{}] Failed (attempt {}/{}): {}",
                    command.name,
                    attempt,
                    max_attempts,
                    error
                );
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(FLAKY_RETRY_BACKOFF_MS)) => {}
                    _ = self.cancel.cancelled() => return (attempt, Err(BatchError::Cancelled)),
                }
            }
            last_error = Some(error);
        }

        let error = last_error.unwrap_or_else(|| BatchError::Execution {
            command: command.name.clone(),
            message: "no attempts were made".to_string(),
        });
        (max_attempts, Err(error))
    }

    fn cancelled(&self, name: &str, attempts: u32) -> CommandResult {
        log_debug!("[{}] Cancelled before running", name);
        let result = CommandResult::cancelled(name, attempts);
        self.reporter.record_command_result(&result);
        result
    }

    fn trigger_bail(&self, name: &str, message: &str) {
        let mut cause = self
            .bail_cause
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if cause.is_none() {
            log_error!("Bailing: cancelling batch after '{}' failed", name);
            *cause = Some((name.to_string(), message.to_string()));
            self.cancel.cancel();
        }
    }

    fn take_bail_cause(&self) -> Option<(String, String)> {
        self.bail_cause
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Signals a command's completion when dropped, as `Skipped` unless marked
/// successful, so dependents never wait on a task that ended early.
struct CompletionSignal {
    tracker: Arc<CompletionTracker>,
    name: String,
    status: CompletionStatus,
}

impl CompletionSignal {
    fn new(tracker: Arc<CompletionTracker>, name: &str) -> Self {
        Self {
            tracker,
            name: name.to_string(),
            status: CompletionStatus::Skipped,
        }
    }

    fn succeed(&mut self) {
        self.status = CompletionStatus::Success;
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        self.tracker.finish(&self.name, self.status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, status: CommandStatus) -> CommandResult {
        CommandResult {
            name: name.to_string(),
            status,
            attempts: 1,
            error: None,
            started_at: None,
            duration_ms: 0,
        }
    }

    #[test]
    fn summary_sorts_and_groups_results() {
        let summary = BatchSummary::from_results(vec![
            result("c", CommandStatus::Failed),
            result("a", CommandStatus::Succeeded),
            result("b", CommandStatus::Cancelled),
            result("d", CommandStatus::Skipped),
        ]);

        let names: Vec<&str> = summary.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
        assert_eq!(summary.failures, vec!["c"]);
        assert_eq!(summary.cancelled, vec!["b"]);
        assert_eq!(summary.skipped, vec!["d"]);
        assert_eq!(summary.succeeded(), 1);
    }

    #[test]
    fn advisory_outcome_ignores_failures() {
        let summary = BatchSummary::from_results(vec![result("a", CommandStatus::Failed)]);
        let policy = BatchPolicy {
            advisory: true,
            ..BatchPolicy::default()
        };

        let outcome = summary.into_outcome(&policy, None).unwrap();
        assert_eq!(outcome.failures, vec!["a"]);
    }

    #[test]
    fn advisory_is_overridden_by_bail() {
        let summary = BatchSummary::from_results(vec![result("a", CommandStatus::Failed)]);
        let policy = BatchPolicy {
            advisory: true,
            bail: true,
            ..BatchPolicy::default()
        };

        let err = summary.into_outcome(&policy, None).unwrap_err();
        assert!(matches!(err, BatchError::CommandsFailed(ref names) if names == &["a"]));
    }

    #[test]
    fn bail_cause_takes_precedence() {
        let summary = BatchSummary::from_results(vec![
            result("a", CommandStatus::Failed),
            result("b", CommandStatus::Cancelled),
        ]);
        let policy = BatchPolicy {
            bail: true,
            ..BatchPolicy::default()
        };

        let err = summary
            .into_outcome(&policy, Some(("a".to_string(), "exit 1".to_string())))
            .unwrap_err();
        assert!(matches!(err, BatchError::Bailed { ref command, .. } if command == "a"));
    }

    #[test]
    fn external_cancellation_fails_the_batch() {
        let summary = BatchSummary::from_results(vec![
            result("a", CommandStatus::Succeeded),
            result("b", CommandStatus::Cancelled),
        ]);
        let err = summary
            .into_outcome(&BatchPolicy::default(), None)
            .unwrap_err();
        assert!(err.is_cancellation());
    }
}
