use std::collections::HashMap;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::BatchError;
use crate::types::CompletionStatus;

/// How a command's dependencies resolved.
#[derive(Debug, PartialEq, Eq)]
pub enum DependencyOutcome {
    /// Every dependency succeeded.
    Ready,
    /// A dependency was unknown or did not succeed; the command must not run.
    Skip(String),
}

/// Per-command completion signals used to gate dependents.
///
/// Each command's status moves from `Pending` to `Success` or `Skipped` once.
/// Waiting on dependencies is lazy: no topological pass is made, so a cyclic
/// dependency set would wait forever. Cycles are rejected at load time.
pub struct CompletionTracker {
    signals: HashMap<String, watch::Sender<CompletionStatus>>,
}

impl CompletionTracker {
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let signals = names
            .into_iter()
            .map(|name| {
                let (tx, _rx) = watch::channel(CompletionStatus::Pending);
                (name.to_string(), tx)
            })
            .collect();
        Self { signals }
    }

    pub fn status(&self, name: &str) -> Option<CompletionStatus> {
        self.signals.get(name).map(|tx| *tx.borrow())
    }

    /// Finalize a command's status. Later calls for the same command are ignored.
    pub fn finish(&self, name: &str, status: CompletionStatus) {
        if status == CompletionStatus::Pending {
            return;
        }
        if let Some(tx) = self.signals.get(name) {
            tx.send_if_modified(|current| {
                if *current == CompletionStatus::Pending {
                    *current = status;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Wait until every dependency in `deps` has completed.
    ///
    /// Returns `Skip` as soon as one dependency is unknown or skipped, and
    /// `Err(Cancelled)` if the batch is cancelled while waiting.
    pub async fn wait_for_dependencies(
        &self,
        deps: &[String],
        cancel: &CancellationToken,
    ) -> Result<DependencyOutcome, BatchError> {
        for dep in deps {
            let Some(tx) = self.signals.get(dep) else {
                return Ok(DependencyOutcome::Skip(format!(
                    "dependency '{}' is not part of the batch",
                    dep
                )));
            };

            let mut rx = tx.subscribe();
            let status = tokio::select! {
                result = rx.wait_for(|s| *s != CompletionStatus::Pending) => match result {
                    Ok(status) => *status,
                    // Sender lives in `self`, so this only happens during teardown
                    Err(_) => return Err(BatchError::Cancelled),
                },
                _ = cancel.cancelled() => return Err(BatchError::Cancelled),
            };

            if status == CompletionStatus::Skipped {
                return Ok(DependencyOutcome::Skip(format!(
                    "dependency '{}' did not succeed",
                    dep
                )));
            }
        }
        Ok(DependencyOutcome::Ready)
    }
}
