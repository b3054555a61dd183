use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use stack_golem::config::{self, BatchConfig};
use stack_golem::log::LogLevel;
use stack_golem::process::{
    install_signal_handlers, kill_all_children, watch_for_shutdown, SubprocessRunner,
};
use stack_golem::provider::LocalStackProvider;
use stack_golem::report::{Reporter, ReporterKind};
use stack_golem::scheduler::{self, BatchPolicy, BatchRun, BatchSummary};
use stack_golem::{log_info, log_warn};

#[derive(Parser)]
#[command(
    name = "stack-golem",
    about = "Run batches of commands against shared deployment stacks"
)]
struct Cli {
    /// Log verbosity level (error, warn, info, debug). Overrides the batch file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every command in a batch file
    Run {
        /// Path to the batch file (TOML)
        batch: PathBuf,
        /// Maximum number of commands running at once
        #[arg(long)]
        parallelism: Option<usize>,
        /// Abort the whole batch on the first failure
        #[arg(long)]
        bail: bool,
        /// Report failures without failing the batch
        #[arg(long)]
        advisory: bool,
        /// Directory for command output and report.json
        #[arg(long)]
        report_dir: Option<PathBuf>,
    },
    /// Validate a batch file without running it
    Check {
        /// Path to the batch file (TOML)
        batch: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cli_level = match cli.log_level.as_deref().map(str::parse::<LogLevel>) {
        Some(Ok(level)) => Some(level),
        Some(Err(e)) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
        None => None,
    };

    let result = match cli.command {
        Commands::Run {
            batch,
            parallelism,
            bail,
            advisory,
            report_dir,
        } => {
            handle_run(
                &batch,
                cli_level,
                parallelism,
                bail,
                advisory,
                report_dir,
            )
            .await
        }
        Commands::Check { batch } => handle_check(&batch),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn handle_check(batch_path: &Path) -> Result<(), String> {
    let config = config::load_batch(batch_path).map_err(|e| e.to_string())?;
    println!(
        "{}: {} commands, {} pipelines, {} environments",
        batch_path.display(),
        config.commands.len(),
        config.pipelines.len(),
        config.environments.len()
    );
    Ok(())
}

async fn handle_run(
    batch_path: &Path,
    cli_level: Option<LogLevel>,
    parallelism: Option<usize>,
    bail: bool,
    advisory: bool,
    report_dir: Option<PathBuf>,
) -> Result<(), String> {
    let mut config = config::load_batch(batch_path).map_err(|e| e.to_string())?;
    stack_golem::log::set_log_level(cli_level.unwrap_or(config.batch.log_level));

    // CLI flags win over the batch file
    if let Some(n) = parallelism {
        if n < 1 {
            return Err("--parallelism must be >= 1".to_string());
        }
        config.batch.parallelism = n;
    }
    config.batch.bail |= bail;
    config.batch.advisory |= advisory;
    if report_dir.is_some() {
        config.batch.report_dir = report_dir;
    }
    if config.batch.bail && config.batch.advisory {
        log_warn!("Warning: advisory has no effect when bail is set");
    }

    install_signal_handlers()?;

    log_info!("--- Stack Golem ---");
    log_config_summary(&config);

    let base_dir = batch_path.parent().unwrap_or(Path::new("."));
    let provider = Arc::new(LocalStackProvider::from_config(&config, base_dir));
    let runner = Arc::new(SubprocessRunner);
    let reporter: Arc<dyn Reporter> = Arc::new(
        ReporterKind::from_report_dir(config.batch.report_dir.as_deref())
            .map_err(|e| e.to_string())?,
    );

    let cancel = CancellationToken::new();
    tokio::spawn(watch_for_shutdown(cancel.clone()));
    if config.batch.timeout_minutes > 0 {
        let timeout = Duration::from_secs(config.batch.timeout_minutes * 60);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    log_warn!("Batch timed out after {} minutes", timeout.as_secs() / 60);
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {}
            }
        });
    }

    let policy = BatchPolicy {
        parallelism: config.batch.parallelism,
        bail: config.batch.bail,
        advisory: config.batch.advisory,
    };

    let run = scheduler::execute_batch(
        config.commands,
        policy,
        provider,
        runner,
        reporter,
        cancel.clone(),
    )
    .await;

    // Stops the watchers; any process a task could not reap is killed here.
    cancel.cancel();
    kill_all_children();

    let BatchRun { summary, outcome } = run.map_err(|e| e.to_string())?;
    print_summary(&summary);
    outcome.map_err(|e| e.to_string())?;
    if !summary.failures.is_empty() {
        log_info!("Advisory failures: {}", summary.failures.join(", "));
    }
    Ok(())
}

fn log_config_summary(config: &BatchConfig) {
    log_info!(
        "[config] parallelism={}, bail={}, advisory={}, timeout={}",
        config.batch.parallelism,
        config.batch.bail,
        config.batch.advisory,
        if config.batch.timeout_minutes > 0 {
            format!("{}min", config.batch.timeout_minutes)
        } else {
            "none".to_string()
        }
    );
    let mut pipelines: Vec<(&String, &config::PipelineConfig)> = config.pipelines.iter().collect();
    pipelines.sort_by(|a, b| a.0.cmp(b.0));
    for (name, pipeline) in pipelines {
        log_info!("[pipeline:{}] max_stacks={}", name, pipeline.max_stacks);
    }
    match &config.batch.report_dir {
        Some(dir) => log_info!("[config] Report: {}", dir.display()),
        None => log_info!("[config] Report: none"),
    }
    log_info!("");
}

fn print_summary(summary: &BatchSummary) {
    println!("{:<32} {:<10} {:<8} {:>10}", "COMMAND", "STATUS", "ATTEMPTS", "DURATION");
    println!("{}", "-".repeat(63));
    for result in &summary.results {
        println!(
            "{:<32} {:<10} {:<8} {:>9}s",
            result.name,
            result.status.to_string(),
            result.attempts,
            result.duration_ms / 1000
        );
    }
}
