use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::pool::Allocation;
use crate::types::{PipelineSpec, StackId};
use crate::{log_debug, log_info};

/// Everything the scheduler needs from the environment side: pipeline
/// resolution, stack allocation and release, one-time setup, and per-stack
/// environment expansion. Enables mocking in scheduler tests.
pub trait StackProvider: Send + Sync {
    fn resolve(&self, pipeline: &str) -> Result<PipelineSpec, BatchError>;

    fn allocate(
        &self,
        spec: &PipelineSpec,
    ) -> impl Future<Output = Result<Allocation, BatchError>> + Send;

    /// Best-effort and idempotent.
    fn release(&self, id: &StackId) -> impl Future<Output = Result<(), BatchError>> + Send;

    fn deploy(
        &self,
        id: &StackId,
        spec: &PipelineSpec,
    ) -> impl Future<Output = Result<(), BatchError>> + Send;

    fn run_before_hooks(
        &self,
        id: &StackId,
        environment: Option<&str>,
    ) -> impl Future<Output = Result<(), BatchError>> + Send;

    fn expand_env(
        &self,
        id: &StackId,
        templates: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, BatchError>;
}

/// Substitute `{stack}` and `{pipeline}` in each template value.
/// Unknown placeholders are left as written.
pub fn expand_templates(
    id: &StackId,
    templates: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    templates
        .iter()
        .map(|(key, value)| {
            let expanded = value
                .replace("{stack}", &id.name)
                .replace("{pipeline}", &id.family);
            (key.clone(), expanded)
        })
        .collect()
}

// --- LocalStackProvider ---

/// Config-driven provider: stacks are named `<pipeline>-<n>` and set up by
/// running the pipeline's deploy/release commands and the environment's
/// before hooks as local subprocesses.
pub struct LocalStackProvider {
    pipelines: HashMap<String, PipelineSpec>,
    environments: HashMap<String, Vec<Vec<String>>>,
    base_dir: PathBuf,
    counters: Mutex<HashMap<String, usize>>,
}

impl LocalStackProvider {
    pub fn from_config(config: &BatchConfig, base_dir: &Path) -> Self {
        let pipelines = config
            .pipelines
            .iter()
            .map(|(name, p)| {
                (
                    name.clone(),
                    PipelineSpec {
                        name: name.clone(),
                        max_stacks: p.max_stacks,
                        deploy: p.deploy.clone(),
                        release: p.release.clone(),
                        env: p.env.clone(),
                    },
                )
            })
            .collect();
        let environments = config
            .environments
            .iter()
            .map(|(name, e)| (name.clone(), e.before.clone()))
            .collect();
        Self {
            pipelines,
            environments,
            base_dir: base_dir.to_path_buf(),
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn next_name(&self, pipeline: &str) -> String {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let n = counters.entry(pipeline.to_string()).or_insert(0);
        *n += 1;
        format!("{}-{}", pipeline, n)
    }

    async fn run_setup_command(&self, argv: &[String], id: &StackId) -> Result<(), String> {
        let Some((program, args)) = argv.split_first() else {
            return Ok(());
        };
        log_debug!("[{}] Running: {}", id, argv.join(" "));
        let output = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&self.base_dir)
            .env("STACK_NAME", &id.name)
            .env("STACK_PIPELINE", &id.family)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("Failed to spawn '{}': {}", program, e))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "'{}' exited with {:?}: {}",
                argv.join(" "),
                output.status.code(),
                stderr.trim()
            ))
        }
    }
}

impl StackProvider for LocalStackProvider {
    fn resolve(&self, pipeline: &str) -> Result<PipelineSpec, BatchError> {
        self.pipelines
            .get(pipeline)
            .cloned()
            .ok_or_else(|| BatchError::PipelineNotFound(pipeline.to_string()))
    }

    async fn allocate(&self, spec: &PipelineSpec) -> Result<Allocation, BatchError> {
        let name = self.next_name(&spec.name);
        Ok(Allocation::new(StackId::new(&spec.name, &name)))
    }

    async fn release(&self, id: &StackId) -> Result<(), BatchError> {
        let Some(spec) = self.pipelines.get(&id.family) else {
            return Ok(());
        };
        log_info!("[{}] Releasing stack", id);
        self.run_setup_command(&spec.release, id)
            .await
            .map_err(|message| BatchError::Setup {
                stack: id.clone(),
                message,
            })
    }

    async fn deploy(&self, id: &StackId, spec: &PipelineSpec) -> Result<(), BatchError> {
        self.run_setup_command(&spec.deploy, id)
            .await
            .map_err(|message| BatchError::Allocation {
                pipeline: spec.name.clone(),
                message,
            })
    }

    async fn run_before_hooks(
        &self,
        id: &StackId,
        environment: Option<&str>,
    ) -> Result<(), BatchError> {
        let Some(hooks) = environment.and_then(|e| self.environments.get(e)) else {
            return Ok(());
        };
        for hook in hooks {
            self.run_setup_command(hook, id)
                .await
                .map_err(|message| BatchError::Setup {
                    stack: id.clone(),
                    message,
                })?;
        }
        Ok(())
    }

    fn expand_env(
        &self,
        id: &StackId,
        templates: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, BatchError> {
        Ok(expand_templates(id, templates))
    }
}

// --- MockStackProvider ---

/// In-memory provider for scheduler tests. Counts every call.
#[derive(Default)]
pub struct MockStackProvider {
    pipelines: HashMap<String, PipelineSpec>,
    pub allocations: AtomicUsize,
    pub deploys: AtomicUsize,
    pub before_hooks: AtomicUsize,
    pub releases: AtomicUsize,
    fail_allocation: bool,
    fail_deploy: bool,
    setup_delay: Duration,
}

impl MockStackProvider {
    /// Create a mock serving pipelines with the given `(name, max_stacks)` pairs.
    pub fn new(pipelines: &[(&str, usize)]) -> Self {
        let pipelines = pipelines
            .iter()
            .map(|(name, max)| {
                let mut env = BTreeMap::new();
                env.insert(
                    format!("{}_STACK", name.to_uppercase()),
                    "{stack}".to_string(),
                );
                (
                    name.to_string(),
                    PipelineSpec {
                        name: name.to_string(),
                        max_stacks: *max,
                        env,
                        ..PipelineSpec::default()
                    },
                )
            })
            .collect();
        Self {
            pipelines,
            ..Self::default()
        }
    }

    pub fn failing_allocation(mut self) -> Self {
        self.fail_allocation = true;
        self
    }

    pub fn failing_deploy(mut self) -> Self {
        self.fail_deploy = true;
        self
    }

    /// Make deploy and before hooks take `delay`, to widen race windows.
    pub fn with_setup_delay(mut self, delay: Duration) -> Self {
        self.setup_delay = delay;
        self
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl StackProvider for MockStackProvider {
    fn resolve(&self, pipeline: &str) -> Result<PipelineSpec, BatchError> {
        self.pipelines
            .get(pipeline)
            .cloned()
            .ok_or_else(|| BatchError::PipelineNotFound(pipeline.to_string()))
    }

    async fn allocate(&self, spec: &PipelineSpec) -> Result<Allocation, BatchError> {
        if self.fail_allocation {
            return Err(BatchError::Allocation {
                pipeline: spec.name.clone(),
                message: "mock allocator refused".to_string(),
            });
        }
        let n = self.allocations.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Allocation::new(StackId::new(
            &spec.name,
            &format!("{}-{}", spec.name, n),
        )))
    }

    async fn release(&self, _id: &StackId) -> Result<(), BatchError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn deploy(&self, _id: &StackId, spec: &PipelineSpec) -> Result<(), BatchError> {
        self.deploys.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.setup_delay).await;
        if self.fail_deploy {
            return Err(BatchError::Allocation {
                pipeline: spec.name.clone(),
                message: "mock deploy failed".to_string(),
            });
        }
        Ok(())
    }

    async fn run_before_hooks(
        &self,
        _id: &StackId,
        _environment: Option<&str>,
    ) -> Result<(), BatchError> {
        self.before_hooks.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.setup_delay).await;
        Ok(())
    }

    fn expand_env(
        &self,
        id: &StackId,
        templates: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, BatchError> {
        Ok(expand_templates(id, templates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_known_placeholders_only() {
        let id = StackId::new("foo", "foo-3");
        let mut templates = BTreeMap::new();
        templates.insert("NS".to_string(), "ns-{stack}".to_string());
        templates.insert("P".to_string(), "{pipeline}/{other}".to_string());

        let expanded = expand_templates(&id, &templates);

        assert_eq!(expanded["NS"], "ns-foo-3");
        assert_eq!(expanded["P"], "foo/{other}");
    }
}
