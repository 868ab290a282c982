//! Bounded resource pool with deduplicated creation and guarded hand-off.
//!
//! Creation runs on a spawned task so that a waiter giving up (cancellation)
//! never strands the other waiters of the same index. The creation's own
//! token is a child of the pool's shutdown token, cancelled by [`Pool::close`].

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use futures::FutureExt;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use super::events::{EventHub, PoolEvent, Subscription};
use super::lease::Lease;
use super::slot::{Creation, SlotPhase, SlotState};
use crate::status::PoolStatus;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("Slot {index} out of range (capacity {capacity})")]
    OutOfRange { index: usize, capacity: usize },
    #[error("Could not create resource for slot {index}: {cause}")]
    Exhausted { index: usize, cause: String },
    #[error("Slot {index} is retired: {cause}")]
    Retired { index: usize, cause: String },
    #[error("Every slot in the pool is retired")]
    Depleted,
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Pool is closed")]
    Closed,
    #[error("Entropy source unavailable: {0}")]
    Entropy(String),
}

/// Failure reported by a [`ResourceFactory`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FactoryError {
    /// The slot may be retried later.
    #[error("{0}")]
    Transient(String),
    /// The slot can never produce a resource; it is retired.
    #[error("permanently unusable: {0}")]
    Permanent(String),
    #[error("cancelled")]
    Cancelled,
}

/// Builds (and tears down) the resources held by a [`Pool`].
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;

    async fn create(
        &self,
        index: usize,
        cancel: CancellationToken,
    ) -> Result<Self::Resource, FactoryError>;

    /// Release a resource that is leaving the pool for good.
    fn destroy(&self, _resource: &Self::Resource) -> Result<(), FactoryError> {
        Ok(())
    }
}

/// Adapts a closure into a [`ResourceFactory`] with a no-op `destroy`.
pub struct FnFactory<F>(F);

pub fn factory_fn<F, Fut, R>(f: F) -> FnFactory<F>
where
    F: Fn(usize, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, FactoryError>> + Send + 'static,
    R: Send + Sync + 'static,
{
    FnFactory(f)
}

#[async_trait]
impl<F, Fut, R> ResourceFactory for FnFactory<F>
where
    F: Fn(usize, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, FactoryError>> + Send + 'static,
    R: Send + Sync + 'static,
{
    type Resource = R;

    async fn create(&self, index: usize, cancel: CancellationToken) -> Result<R, FactoryError> {
        (self.0)(index, cancel).await
    }
}

pub(crate) struct PoolInner<F: ResourceFactory> {
    name: String,
    capacity: usize,
    pub(crate) factory: F,
    slots: StdMutex<Vec<SlotState<F::Resource>>>,
    size: AtomicUsize,
    generation: AtomicU64,
    /// Serializes select+remove for `take`.
    take_lock: Mutex<()>,
    events: EventHub,
    status_tx: watch::Sender<PoolStatus>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

/// Fixed-capacity pool of lazily created resources. Cheap to clone.
pub struct Pool<F: ResourceFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ResourceFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

enum Step<R> {
    Ready(usize, Arc<R>),
    Wait(Creation<R>),
}

impl<F: ResourceFactory> PoolInner<F> {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Lock the slot table, recovering from poisoning.
    fn lock_slots(&self) -> MutexGuard<'_, Vec<SlotState<F::Resource>>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(pool = %self.name, "Slot table mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            size: self.size.load(Ordering::Acquire),
            capacity: self.capacity,
        }
    }

    /// Notify after the slot lock is released.
    fn publish(&self, events: &[PoolEvent]) {
        if events.is_empty() {
            return;
        }
        // Read size under the watch lock so the last send carries the latest value.
        self.status_tx
            .send_modify(|status| status.size = self.size.load(Ordering::Acquire));
        for event in events {
            self.events.publish(*event);
        }
    }

    fn check_open(&self, cancel: &CancellationToken) -> Result<(), PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        if cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        Ok(())
    }

    /// Mark `index` as creating and spawn the factory call. Caller holds the slot lock.
    fn start_creation(
        self: &Arc<Self>,
        slots: &mut [SlotState<F::Resource>],
        index: usize,
    ) -> Creation<F::Resource> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = self.shutdown.child_token();
        let inner = Arc::clone(self);

        tracing::debug!(pool = %self.name, slot = index, "Creating resource");
        let handle = tokio::spawn(async move { inner.run_factory(index, generation, token).await });

        let creation = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(PoolError::Exhausted {
                    index,
                    cause: format!("creation task failed: {e}"),
                }),
            }
        }
        .boxed()
        .shared();

        slots[index] = SlotState::Creating {
            generation,
            creation: creation.clone(),
        };
        creation
    }

    async fn run_factory(
        &self,
        index: usize,
        generation: u64,
        token: CancellationToken,
    ) -> Result<Arc<F::Resource>, PoolError> {
        let outcome = AssertUnwindSafe(self.factory.create(index, token))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(FactoryError::Transient("factory panicked".to_string())));

        let mut orphan = None;
        let mut events = Vec::new();
        let result = {
            let mut slots = self.lock_slots();
            let current = slots[index].is_creating(generation);

            match outcome {
                Ok(resource) => {
                    let resource = Arc::new(resource);
                    if current && !self.closed.load(Ordering::Acquire) {
                        slots[index] = SlotState::Ready(Arc::clone(&resource));
                        self.size.fetch_add(1, Ordering::AcqRel);
                        events.push(PoolEvent::Created(index));
                        Ok(resource)
                    } else {
                        orphan = Some(resource);
                        Err(PoolError::Closed)
                    }
                }
                Err(e) => {
                    if current {
                        slots[index] = match &e {
                            FactoryError::Permanent(cause) => SlotState::Deleted {
                                cause: cause.clone(),
                            },
                            _ => SlotState::Empty,
                        };
                    }
                    Err(self.factory_error(index, e))
                }
            }
        };

        if let Some(resource) = orphan {
            tracing::debug!(pool = %self.name, slot = index, "Discarding resource created after close");
            self.destroy(index, &resource);
        }
        match &result {
            Ok(_) => tracing::debug!(pool = %self.name, slot = index, "Resource ready"),
            Err(e) => tracing::debug!(pool = %self.name, slot = index, error = %e, "Resource creation failed"),
        }
        self.publish(&events);
        result
    }

    fn factory_error(&self, index: usize, error: FactoryError) -> PoolError {
        match error {
            FactoryError::Cancelled if self.closed.load(Ordering::Acquire) => PoolError::Closed,
            FactoryError::Cancelled => PoolError::Cancelled,
            FactoryError::Permanent(cause) => {
                tracing::warn!(pool = %self.name, slot = index, cause = %cause, "Slot retired - capacity permanently reduced");
                PoolError::Retired { index, cause }
            }
            FactoryError::Transient(cause) => PoolError::Exhausted { index, cause },
        }
    }

    /// Best-effort teardown; failures are logged, never propagated.
    pub(crate) fn destroy(&self, index: usize, resource: &F::Resource) {
        if let Err(e) = self.factory.destroy(resource) {
            tracing::error!(pool = %self.name, slot = index, error = %e, "Failed to destroy resource");
        }
    }

    async fn wait(
        creation: Creation<F::Resource>,
        cancel: &CancellationToken,
    ) -> Result<Arc<F::Resource>, PoolError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PoolError::Cancelled),
            result = creation => result,
        }
    }

    /// Pick a ready slot, or join/start a creation to wait on.
    ///
    /// With `remove`, the chosen resource leaves the pool in the same critical
    /// section that selected it.
    fn select_step(
        self: &Arc<Self>,
        secure: bool,
        remove: bool,
    ) -> Result<(Step<F::Resource>, Option<PoolEvent>), PoolError> {
        let mut slots = self.lock_slots();

        let ready: Vec<usize> = (0..slots.len()).filter(|&i| slots[i].is_ready()).collect();
        if !ready.is_empty() {
            let index = pick(&ready, secure)?;
            if remove {
                let resource = slots[index].take_ready().ok_or(PoolError::Depleted)?;
                self.size.fetch_sub(1, Ordering::AcqRel);
                return Ok((Step::Ready(index, resource), Some(PoolEvent::Deleted(index))));
            }
            if let SlotState::Ready(resource) = &slots[index] {
                return Ok((Step::Ready(index, Arc::clone(resource)), None));
            }
        }

        // Join a creation already in flight before starting another one.
        for slot in slots.iter() {
            if let SlotState::Creating { creation, .. } = slot {
                return Ok((Step::Wait(creation.clone()), None));
            }
        }

        let empty: Vec<usize> = (0..slots.len())
            .filter(|&i| matches!(slots[i], SlotState::Empty))
            .collect();
        if empty.is_empty() {
            return Err(PoolError::Depleted);
        }
        let index = pick(&empty, secure)?;
        Ok((Step::Wait(self.start_creation(&mut slots, index)), None))
    }

    async fn select(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        secure: bool,
        remove: bool,
    ) -> Result<(usize, Arc<F::Resource>), PoolError> {
        loop {
            self.check_open(cancel)?;
            let (step, event) = self.select_step(secure, remove)?;
            match step {
                Step::Ready(index, resource) => {
                    if let Some(event) = event {
                        self.publish(&[event]);
                    }
                    return Ok((index, resource));
                }
                // Re-select after creation: someone else may have claimed it.
                Step::Wait(creation) => {
                    Self::wait(creation, cancel).await?;
                }
            }
        }
    }
}

fn pick(candidates: &[usize], secure: bool) -> Result<usize, PoolError> {
    if secure {
        let mut rng = StdRng::try_from_os_rng().map_err(|e| PoolError::Entropy(e.to_string()))?;
        Ok(candidates[rng.random_range(0..candidates.len())])
    } else {
        Ok(candidates[rand::rng().random_range(0..candidates.len())])
    }
}

impl<F: ResourceFactory> Pool<F> {
    pub fn new(name: impl Into<String>, capacity: usize, factory: F) -> Self {
        let slots = (0..capacity).map(|_| SlotState::Empty).collect();
        let (status_tx, _) = watch::channel(PoolStatus { size: 0, capacity });

        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                capacity,
                factory,
                slots: StdMutex::new(slots),
                size: AtomicUsize::new(0),
                generation: AtomicU64::new(0),
                take_lock: Mutex::new(()),
                events: EventHub::new(),
                status_tx,
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of ready resources.
    pub fn size(&self) -> usize {
        self.inner.size.load(Ordering::Acquire)
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.status()
    }

    /// Stream of `{size, capacity}` snapshots, updated on every transition.
    pub fn watch_status(&self) -> watch::Receiver<PoolStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn subscribe<C>(&self, callback: C) -> Subscription
    where
        C: Fn(PoolEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(Arc::new(callback))
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    pub fn phase(&self, index: usize) -> Option<SlotPhase> {
        self.inner.lock_slots().get(index).map(SlotState::phase)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn check_index(&self, index: usize) -> Result<(), PoolError> {
        if index >= self.inner.capacity {
            return Err(PoolError::OutOfRange {
                index,
                capacity: self.inner.capacity,
            });
        }
        Ok(())
    }

    fn begin_or_join(&self, index: usize) -> Result<Step<F::Resource>, PoolError> {
        let mut slots = self.inner.lock_slots();
        match &slots[index] {
            SlotState::Ready(resource) => return Ok(Step::Ready(index, Arc::clone(resource))),
            SlotState::Creating { creation, .. } => return Ok(Step::Wait(creation.clone())),
            SlotState::Deleted { cause } => {
                return Err(PoolError::Retired {
                    index,
                    cause: cause.clone(),
                });
            }
            SlotState::Empty => {}
        }
        Ok(Step::Wait(self.inner.start_creation(&mut slots, index)))
    }

    /// Ensure slot `index` is ready, running the factory unless a creation
    /// is already in flight (in which case its outcome is awaited).
    ///
    /// `cancel` bounds only this caller's wait. The factory itself receives a
    /// token owned by the pool, cancelled by [`Pool::close`], so a caller
    /// giving up never aborts a creation other callers are waiting on.
    pub async fn create(&self, index: usize, cancel: &CancellationToken) -> Result<(), PoolError> {
        self.get(index, cancel).await.map(|_| ())
    }

    /// Ready resource at `index`, created first if absent. The resource stays
    /// in the pool. Cancellation follows [`Pool::create`].
    pub async fn get(
        &self,
        index: usize,
        cancel: &CancellationToken,
    ) -> Result<Arc<F::Resource>, PoolError> {
        self.check_index(index)?;
        self.inner.check_open(cancel)?;
        match self.begin_or_join(index)? {
            Step::Ready(_, resource) => Ok(resource),
            Step::Wait(creation) => PoolInner::<F>::wait(creation, cancel).await,
        }
    }

    /// Uniformly random ready slot, creating one if none is ready.
    pub async fn select_random(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(usize, Arc<F::Resource>), PoolError> {
        self.inner.select(cancel, false, false).await
    }

    /// Like [`Pool::select_random`], drawing from an OS-seeded CSPRNG.
    pub async fn select_random_secure(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(usize, Arc<F::Resource>), PoolError> {
        self.inner.select(cancel, true, false).await
    }

    /// Remove a ready resource from the pool. No-op for slots that are not ready.
    pub fn delete(&self, index: usize) -> Option<Arc<F::Resource>> {
        let removed = {
            let mut slots = self.inner.lock_slots();
            let removed = slots.get_mut(index).and_then(SlotState::take_ready);
            if removed.is_some() {
                self.inner.size.fetch_sub(1, Ordering::AcqRel);
            }
            removed
        };
        if removed.is_some() {
            self.inner.publish(&[PoolEvent::Deleted(index)]);
        }
        removed
    }

    /// Securely select a ready resource and remove it, as one step no other
    /// `take` can interleave with. Creation, when needed, happens while the
    /// guard is held.
    pub async fn take(&self, cancel: &CancellationToken) -> Result<Lease<F>, PoolError> {
        self.inner.check_open(cancel)?;

        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            guard = self.inner.take_lock.lock() => guard,
        };

        let (index, resource) = self.inner.select(cancel, true, true).await?;
        tracing::debug!(pool = %self.inner.name, slot = index, "Resource leased");
        Ok(Lease::new(index, resource, Arc::clone(&self.inner)))
    }

    /// Start background creation of every empty slot.
    pub fn prefill(&self) {
        if self.is_closed() {
            return;
        }
        let mut slots = self.inner.lock_slots();
        for index in 0..slots.len() {
            if matches!(slots[index], SlotState::Empty) {
                let _ = self.inner.start_creation(&mut slots, index);
            }
        }
    }

    /// Start background creation of one slot if it is empty.
    pub fn replenish(&self, index: usize) {
        if self.is_closed() || index >= self.inner.capacity {
            return;
        }
        let mut slots = self.inner.lock_slots();
        if matches!(slots[index], SlotState::Empty) {
            let _ = self.inner.start_creation(&mut slots, index);
        }
    }

    /// Cancel in-flight creations, destroy every ready resource, and refuse
    /// further work. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();

        let mut drained = Vec::new();
        {
            let mut slots = self.inner.lock_slots();
            for (index, slot) in slots.iter_mut().enumerate() {
                match slot {
                    SlotState::Ready(_) => {
                        if let Some(resource) = slot.take_ready() {
                            self.inner.size.fetch_sub(1, Ordering::AcqRel);
                            drained.push((index, resource));
                        }
                    }
                    SlotState::Creating { .. } => *slot = SlotState::Empty,
                    SlotState::Empty | SlotState::Deleted { .. } => {}
                }
            }
        }

        let events: Vec<PoolEvent> = drained
            .iter()
            .map(|(index, _)| PoolEvent::Deleted(*index))
            .collect();
        for (index, resource) in &drained {
            self.inner.destroy(*index, resource);
        }
        tracing::debug!(pool = %self.inner.name, destroyed = drained.len(), "Pool closed");
        self.inner.publish(&events);
    }
}
