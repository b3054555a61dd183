use std::future::Future;
use std::sync::Arc;

use tokio::sync::OnceCell;

/// Run-once gate with a completion signal.
///
/// The first caller of [`OnceGate::run_once`] executes the action; every
/// concurrent caller waits for it to finish and observes the same outcome.
/// Failures are latched too: the action is never re-run on the same gate.
#[derive(Clone, Debug, Default)]
pub struct OnceGate {
    cell: Arc<OnceCell<Result<(), String>>>,
}

impl OnceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the action has completed, successfully or not.
    pub fn has_fired(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn run_once<F, Fut>(&self, action: F) -> Result<(), String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), String>>,
    {
        self.cell.get_or_init(action).await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_run_action_once() {
        let gate = OnceGate::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                gate.run_once(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(gate.has_fired());
    }

    #[tokio::test]
    async fn failure_is_latched() {
        let gate = OnceGate::new();
        let first = gate.run_once(|| async { Err("boom".to_string()) }).await;
        let second = gate.run_once(|| async { Ok(()) }).await;

        assert_eq!(first, Err("boom".to_string()));
        assert_eq!(second, Err("boom".to_string()));
    }
}
