use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::BatchError;
use crate::gate::OnceGate;
use crate::provider::StackProvider;
use crate::types::{PipelineSpec, StackId};
use crate::{log_debug, log_info, log_warn};

/// A freshly allocated stack, as returned by the allocator.
pub struct Allocation {
    pub id: StackId,
    /// Errors the stack reports after allocation (e.g. a dropped port-forward).
    pub errors: Option<mpsc::UnboundedReceiver<String>>,
}

impl Allocation {
    pub fn new(id: StackId) -> Self {
        Self { id, errors: None }
    }
}

struct StackEntry {
    usage_count: usize,
    exclusive_lock: bool,
    deployed: OnceGate,
    before_hooks: OnceGate,
}

struct PoolState {
    /// Ordered so reuse picks the same instance for the same pool history.
    stacks: BTreeMap<StackId, StackEntry>,
    /// Allocations in flight; counted against capacity but not in `stack_count`.
    pending: usize,
}

enum Admission {
    Reuse(StackId, OnceGate, OnceGate),
    Allocate,
    Wait,
}

/// Bounded set of live stacks for one pipeline.
///
/// Counters are atomics so capacity can be read without the lock, but every
/// transition happens under `state`. Releases wake every blocked acquirer,
/// each of which re-checks the pool under the lock.
pub struct StackPool {
    pipeline: String,
    max_stacks: usize,
    stack_count: AtomicUsize,
    free_stack_count: AtomicUsize,
    state: Mutex<PoolState>,
    released: Notify,
}

impl StackPool {
    pub fn new(pipeline: &str, max_stacks: usize) -> Arc<Self> {
        Arc::new(Self {
            pipeline: pipeline.to_string(),
            max_stacks: max_stacks.max(1),
            stack_count: AtomicUsize::new(0),
            free_stack_count: AtomicUsize::new(0),
            state: Mutex::new(PoolState {
                stacks: BTreeMap::new(),
                pending: 0,
            }),
            released: Notify::new(),
        })
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn max_stacks(&self) -> usize {
        self.max_stacks
    }

    /// Number of live stacks.
    pub fn stack_count(&self) -> usize {
        self.stack_count.load(Ordering::Acquire)
    }

    /// Number of live stacks not held exclusively.
    pub fn free_stack_count(&self) -> usize {
        self.free_stack_count.load(Ordering::Acquire)
    }

    pub fn usage_count(&self, id: &StackId) -> Option<usize> {
        self.lock().stacks.get(id).map(|e| e.usage_count)
    }

    pub fn is_exclusively_held(&self, id: &StackId) -> Option<bool> {
        self.lock().stacks.get(id).map(|e| e.exclusive_lock)
    }

    /// Acquire a hold on a stack, allocating a new one through `allocate` when
    /// no live stack can be reused and capacity allows.
    ///
    /// Blocks while the pool is saturated, until a release or cancellation.
    /// A failed allocation leaves the pool counters untouched.
    pub async fn acquire<F, Fut>(
        self: &Arc<Self>,
        exclusive: bool,
        cancel: &CancellationToken,
        allocate: F,
    ) -> Result<StackLease, BatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Allocation, BatchError>>,
    {
        loop {
            // Registered before the check so a release in between is not missed.
            let released = self.released.notified();

            let admission = if self.is_saturated() {
                Admission::Wait
            } else {
                self.admit(exclusive)
            };

            match admission {
                Admission::Reuse(id, deployed, before_hooks) => {
                    log_debug!(
                        "[pool:{}] Reusing {} ({})",
                        self.pipeline,
                        id,
                        hold_kind(exclusive)
                    );
                    return Ok(self.lease(id, exclusive, deployed, before_hooks));
                }
                Admission::Allocate => break,
                Admission::Wait => {
                    log_debug!(
                        "[pool:{}] At capacity ({}/{}), waiting for a release",
                        self.pipeline,
                        self.stack_count(),
                        self.max_stacks
                    );
                    tokio::select! {
                        _ = released => {}
                        _ = cancel.cancelled() => return Err(BatchError::Cancelled),
                    }
                }
            }
        }

        let mut slot = PendingSlot {
            pool: self,
            armed: true,
        };
        let allocation = allocate().await?;
        slot.armed = false;
        Ok(self.register(allocation, exclusive))
    }

    /// Lock-free pre-check: no shareable stack and no room for a new one.
    fn is_saturated(&self) -> bool {
        self.free_stack_count() == 0 && self.stack_count() >= self.max_stacks
    }

    fn admit(&self, exclusive: bool) -> Admission {
        let mut state = self.lock();

        let reusable = state.stacks.iter_mut().find(|(_, entry)| {
            if exclusive {
                entry.usage_count == 0
            } else {
                !entry.exclusive_lock
            }
        });

        if let Some((id, entry)) = reusable {
            entry.usage_count += 1;
            if exclusive {
                entry.exclusive_lock = true;
                self.free_stack_count.fetch_sub(1, Ordering::AcqRel);
            }
            return Admission::Reuse(
                id.clone(),
                entry.deployed.clone(),
                entry.before_hooks.clone(),
            );
        }

        if state.stacks.len() + state.pending < self.max_stacks {
            state.pending += 1;
            Admission::Allocate
        } else {
            Admission::Wait
        }
    }

    fn register(self: &Arc<Self>, allocation: Allocation, exclusive: bool) -> StackLease {
        let Allocation { id, errors } = allocation;
        let deployed = OnceGate::new();
        let before_hooks = OnceGate::new();

        {
            let mut state = self.lock();
            state.pending -= 1;
            state.stacks.insert(
                id.clone(),
                StackEntry {
                    usage_count: 1,
                    exclusive_lock: exclusive,
                    deployed: deployed.clone(),
                    before_hooks: before_hooks.clone(),
                },
            );
            self.stack_count.fetch_add(1, Ordering::AcqRel);
            if !exclusive {
                self.free_stack_count.fetch_add(1, Ordering::AcqRel);
            }
        }
        // Shared acquirers that waited on this in-flight allocation can join it now.
        if !exclusive {
            self.released.notify_waiters();
        }

        if let Some(mut errors) = errors {
            let pipeline = self.pipeline.clone();
            let stack = id.clone();
            tokio::spawn(async move {
                while let Some(message) = errors.recv().await {
                    log_warn!("[pool:{}] Stack {} reported: {}", pipeline, stack, message);
                }
            });
        }

        log_info!(
            "[pool:{}] Allocated {} ({}/{} stacks, {})",
            self.pipeline,
            id,
            self.stack_count(),
            self.max_stacks,
            hold_kind(exclusive)
        );
        self.lease(id, exclusive, deployed, before_hooks)
    }

    fn lease(
        self: &Arc<Self>,
        id: StackId,
        exclusive: bool,
        deployed: OnceGate,
        before_hooks: OnceGate,
    ) -> StackLease {
        StackLease {
            pool: Arc::clone(self),
            id,
            exclusive,
            deployed,
            before_hooks,
        }
    }

    /// Drop one hold on `id` and wake blocked acquirers.
    ///
    /// Ending an exclusive hold resets the before-hook gate: the holder may
    /// have mutated the stack, so the next user re-runs initialization.
    pub fn release(&self, id: &StackId) {
        {
            let mut state = self.lock();
            let Some(entry) = state.stacks.get_mut(id) else {
                log_warn!("[pool:{}] Release of unknown stack {}", self.pipeline, id);
                return;
            };
            entry.usage_count = entry.usage_count.saturating_sub(1);
            if entry.exclusive_lock {
                entry.exclusive_lock = false;
                entry.before_hooks = OnceGate::new();
                self.free_stack_count.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.released.notify_waiters();
    }

    /// Remove every stack from the pool, returning their identities for release.
    pub fn drain(&self) -> Vec<StackId> {
        let mut state = self.lock();
        let ids: Vec<StackId> = std::mem::take(&mut state.stacks).into_keys().collect();
        self.stack_count.store(0, Ordering::Release);
        self.free_stack_count.store(0, Ordering::Release);
        ids
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // State is only mutated in short non-panicking sections.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Capacity reserved for an allocation in flight. Returned to the pool if
/// the allocation fails or the acquiring future is dropped.
struct PendingSlot<'a> {
    pool: &'a StackPool,
    armed: bool,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.lock().pending -= 1;
            self.pool.released.notify_waiters();
        }
    }
}

fn hold_kind(exclusive: bool) -> &'static str {
    if exclusive {
        "exclusive"
    } else {
        "shared"
    }
}

/// A hold on one stack. Released when dropped.
#[must_use = "the stack is released when StackLease is dropped"]
pub struct StackLease {
    pool: Arc<StackPool>,
    id: StackId,
    exclusive: bool,
    deployed: OnceGate,
    before_hooks: OnceGate,
}

impl StackLease {
    pub fn id(&self) -> &StackId {
        &self.id
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn pipeline(&self) -> &str {
        self.pool.pipeline()
    }

    /// Fires once per stack lifetime, around the deploy action.
    pub fn deployed(&self) -> &OnceGate {
        &self.deployed
    }

    /// Fires once per initialization window, around the before hooks.
    /// Completion is the stack's "initialized" signal.
    pub fn before_hooks(&self) -> &OnceGate {
        &self.before_hooks
    }
}

impl std::fmt::Debug for StackLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackLease")
            .field("id", &self.id)
            .field("exclusive", &self.exclusive)
            .finish()
    }
}

impl Drop for StackLease {
    fn drop(&mut self) {
        self.pool.release(&self.id);
    }
}

// --- PoolSet ---

/// One pool per pipeline referenced by the batch, plus the resolved specs.
pub struct PoolSet {
    pools: HashMap<String, (Arc<StackPool>, Arc<PipelineSpec>)>,
}

impl PoolSet {
    pub fn new(specs: Vec<PipelineSpec>) -> Self {
        let pools = specs
            .into_iter()
            .map(|spec| {
                let pool = StackPool::new(&spec.name, spec.max_stacks);
                (spec.name.clone(), (pool, Arc::new(spec)))
            })
            .collect();
        Self { pools }
    }

    pub fn get(&self, pipeline: &str) -> Option<(Arc<StackPool>, Arc<PipelineSpec>)> {
        self.pools
            .get(pipeline)
            .map(|(pool, spec)| (Arc::clone(pool), Arc::clone(spec)))
    }

    /// Release every live stack through the provider, in parallel and best-effort.
    pub async fn teardown<P: StackProvider + 'static>(&self, provider: &Arc<P>) {
        let mut join_set = JoinSet::new();
        for (pool, _) in self.pools.values() {
            for id in pool.drain() {
                let provider = Arc::clone(provider);
                join_set.spawn(async move {
                    if let Err(e) = provider.release(&id).await {
                        log_warn!("Warning: failed to release stack {}: {}", id, e);
                    }
                });
            }
        }
        while let Some(result) = join_set.join_next().await {
            if let Err(e) = result {
                log_debug!("Release task join error: {}", e);
            }
        }
    }
}
