use std::path::{Path, PathBuf};

use stack_golem::config::*;
use stack_golem::error::BatchError;
use stack_golem::log::LogLevel;
use stack_golem::types::Command;

const FULL_BATCH: &str = r#"
[batch]
parallelism = 8
bail = true
timeout_minutes = 30
report_dir = "out"
log_level = "debug"

[pipelines.web]
max_stacks = 3
deploy = ["./deploy.sh", "web"]
release = ["./teardown.sh"]
env = { WEB_URL = "https://{stack}.example.test" }

[environments.seeded]
before = [["./seed.sh"], ["./warm-cache.sh", "--quick"]]

[[commands]]
name = "build"
argv = ["make", "build"]

[[commands]]
name = "e2e"
argv = ["npm", "run", "e2e"]
dir = "frontend"
env = { CI = "1" }
depends_on = ["build"]
pipelines = ["web"]
environment = "seeded"
exclusive = true
flaky = true
tags = ["slow"]
"#;

fn parse(contents: &str) -> Result<BatchConfig, BatchError> {
    parse_batch(contents, Path::new("/work"))
}

fn command_with_deps(name: &str, deps: &[&str]) -> Command {
    let mut command = Command::new(name, &["true"]);
    command.depends_on = deps.iter().map(|d| d.to_string()).collect();
    command
}

fn validation_message(contents: &str) -> String {
    match parse(contents) {
        Err(BatchError::Config(msg)) => msg,
        other => panic!("expected a config error, got {:?}", other),
    }
}

// --- Parsing ---

#[test]
fn parse_full_batch() {
    let config = parse(FULL_BATCH).unwrap();

    assert_eq!(config.batch.parallelism, 8);
    assert!(config.batch.bail);
    assert!(!config.batch.advisory);
    assert_eq!(config.batch.timeout_minutes, 30);
    assert_eq!(config.batch.log_level, LogLevel::Debug);

    let web = &config.pipelines["web"];
    assert_eq!(web.max_stacks, 3);
    assert_eq!(web.deploy, vec!["./deploy.sh", "web"]);
    assert_eq!(web.release, vec!["./teardown.sh"]);
    assert_eq!(web.env["WEB_URL"], "https://{stack}.example.test");

    assert_eq!(config.environments["seeded"].before.len(), 2);

    let e2e = &config.commands[1];
    assert_eq!(e2e.name, "e2e");
    assert_eq!(e2e.process.argv, vec!["npm", "run", "e2e"]);
    assert_eq!(e2e.process.env["CI"], "1");
    assert_eq!(e2e.depends_on, vec!["build"]);
    assert_eq!(e2e.pipelines, vec!["web"]);
    assert_eq!(e2e.environment.as_deref(), Some("seeded"));
    assert!(e2e.exclusive);
    assert!(e2e.flaky);
    assert_eq!(e2e.tags, vec!["slow"]);
}

#[test]
fn relative_paths_resolve_against_base_dir() {
    let config = parse(FULL_BATCH).unwrap();

    assert_eq!(
        config.commands[1].process.dir,
        Some(PathBuf::from("/work/frontend"))
    );
    assert_eq!(config.batch.report_dir, Some(PathBuf::from("/work/out")));
}

#[test]
fn absolute_paths_are_kept() {
    let config = parse(
        r#"
[batch]
report_dir = "/tmp/reports"

[[commands]]
name = "a"
argv = ["true"]
dir = "/srv/app"
"#,
    )
    .unwrap();

    assert_eq!(config.commands[0].process.dir, Some(PathBuf::from("/srv/app")));
    assert_eq!(config.batch.report_dir, Some(PathBuf::from("/tmp/reports")));
}

#[test]
fn empty_batch_uses_defaults() {
    let config = parse("").unwrap();

    assert_eq!(config.batch, BatchSettings::default());
    assert_eq!(config.batch.parallelism, 4);
    assert!(!config.batch.bail);
    assert!(!config.batch.advisory);
    assert_eq!(config.batch.timeout_minutes, 0);
    assert_eq!(config.batch.report_dir, None);
    assert_eq!(config.batch.log_level, LogLevel::Info);
    assert!(config.commands.is_empty());
}

#[test]
fn pipeline_defaults_to_one_stack() {
    let config = parse(
        r#"
[pipelines.api]
"#,
    )
    .unwrap();

    assert_eq!(config.pipelines["api"], PipelineConfig::default());
    assert_eq!(config.pipelines["api"].max_stacks, 1);
}

#[test]
fn command_defaults() {
    let config = parse(
        r#"
[[commands]]
name = "unit"
argv = ["cargo", "test"]
"#,
    )
    .unwrap();

    let unit = &config.commands[0];
    assert!(!unit.exclusive);
    assert!(!unit.flaky);
    assert!(unit.depends_on.is_empty());
    assert!(unit.pipelines.is_empty());
    assert_eq!(unit.environment, None);
    assert_eq!(unit.process.dir, None);
}

#[test]
fn invalid_toml_returns_error() {
    let result = parse("[batch\nparallelism = ");
    assert!(matches!(result, Err(BatchError::Config(_))));
}

#[test]
fn unknown_log_level_returns_error() {
    let result = parse(
        r#"
[batch]
log_level = "chatty"
"#,
    );
    assert!(matches!(result, Err(BatchError::Config(_))));
}

// --- Validation ---

#[test]
fn zero_parallelism_fails() {
    let msg = validation_message(
        r#"
[batch]
parallelism = 0
"#,
    );
    assert!(msg.contains("parallelism must be >= 1"), "{}", msg);
}

#[test]
fn zero_max_stacks_fails() {
    let msg = validation_message(
        r#"
[pipelines.web]
max_stacks = 0
"#,
    );
    assert!(msg.contains("pipelines.web: max_stacks must be >= 1"), "{}", msg);
}

#[test]
fn duplicate_command_names_fail() {
    let msg = validation_message(
        r#"
[[commands]]
name = "a"
argv = ["true"]

[[commands]]
name = "a"
argv = ["false"]
"#,
    );
    assert!(msg.contains("duplicate command name 'a'"), "{}", msg);
}

#[test]
fn empty_argv_fails() {
    let msg = validation_message(
        r#"
[[commands]]
name = "a"
argv = []
"#,
    );
    assert!(msg.contains("commands.a: argv must not be empty"), "{}", msg);
}

#[test]
fn unknown_pipeline_and_environment_fail() {
    let msg = validation_message(
        r#"
[[commands]]
name = "a"
argv = ["true"]
pipelines = ["nope"]
environment = "missing"
"#,
    );
    assert!(msg.contains("unknown pipeline 'nope'"), "{}", msg);
    assert!(msg.contains("unknown environment 'missing'"), "{}", msg);
}

#[test]
fn dependency_cycle_fails() {
    let msg = validation_message(
        r#"
[[commands]]
name = "a"
argv = ["true"]
depends_on = ["b"]

[[commands]]
name = "b"
argv = ["true"]
depends_on = ["a"]
"#,
    );
    assert!(msg.contains("dependency cycle: a -> b -> a"), "{}", msg);
}

#[test]
fn unknown_dependency_is_not_a_validation_error() {
    let config = parse(
        r#"
[[commands]]
name = "a"
argv = ["true"]
depends_on = ["not-in-batch"]
"#,
    )
    .unwrap();
    assert_eq!(config.commands[0].depends_on, vec!["not-in-batch"]);
}

#[test]
fn multiple_errors_reported_together() {
    let config = BatchConfig {
        batch: BatchSettings {
            parallelism: 0,
            ..BatchSettings::default()
        },
        commands: vec![Command::new("a", &[]), Command::new("", &["true"])],
        ..BatchConfig::default()
    };

    let errors = validate(&config).unwrap_err();
    assert_eq!(errors.len(), 3, "{:?}", errors);
}

// --- Cycle detection ---

#[test]
fn no_cycle_in_dag() {
    let commands = vec![
        command_with_deps("a", &[]),
        command_with_deps("b", &["a"]),
        command_with_deps("c", &["a", "b"]),
    ];
    assert_eq!(find_dependency_cycle(&commands), None);
}

#[test]
fn self_dependency_is_a_cycle() {
    let commands = vec![command_with_deps("a", &["a"])];
    assert_eq!(
        find_dependency_cycle(&commands),
        Some(vec!["a".to_string(), "a".to_string()])
    );
}

#[test]
fn cycle_path_starts_at_reentered_command() {
    let commands = vec![
        command_with_deps("root", &["x"]),
        command_with_deps("x", &["y"]),
        command_with_deps("y", &["z"]),
        command_with_deps("z", &["x"]),
    ];
    assert_eq!(
        find_dependency_cycle(&commands),
        Some(vec![
            "x".to_string(),
            "y".to_string(),
            "z".to_string(),
            "x".to_string()
        ])
    );
}

// --- Loading from disk ---

#[test]
fn load_batch_resolves_against_file_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("batch.toml");
    std::fs::write(
        &path,
        r#"
[[commands]]
name = "a"
argv = ["true"]
dir = "sub"
"#,
    )
    .unwrap();

    let config = load_batch(&path).unwrap();
    assert_eq!(config.commands[0].process.dir, Some(dir.path().join("sub")));
}

#[test]
fn load_batch_missing_file_returns_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = load_batch(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(BatchError::Config(ref msg)) if msg.contains("Failed to read")));
}

#[test]
fn load_batch_prefixes_validation_errors_with_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("batch.toml");
    std::fs::write(&path, "[batch]\nparallelism = 0\n").unwrap();

    match load_batch(&path) {
        Err(BatchError::Config(msg)) => {
            assert!(msg.starts_with(&path.display().to_string()), "{}", msg);
            assert!(msg.contains("validation failed"), "{}", msg);
        }
        other => panic!("expected a config error, got {:?}", other),
    }
}
