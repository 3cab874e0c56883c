//! Bounded, elastically sized pool of engine execution contexts.
//!
//! `size` counts every context whose engine still exists (idle, checked out or
//! still tearing down) and is only changed under its own lock. Each context owns
//! a [`SlotLease`]; the slot is freed when the lease drops, not when the handle
//! is retired. The idle queue is paired with a semaphore whose
//! permits track queue occupancy, so waiting for a context is an async acquire
//! with a timeout instead of a poll. Waiters also wake when a discard frees
//! capacity, so they can grow the pool instead of sleeping until the timeout.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;
use metrics::{counter, gauge};
use tokio::sync::{Notify, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

use super::{
    METRIC_ENGINE_CONTEXT_DISCARDED_TOTAL, METRIC_ENGINE_POOL_SIZE,
    METRIC_ENGINE_POOL_TIMEOUT_TOTAL, types::RenderError,
};

/// Smallest pool a deployment runs with, whatever was configured.
pub const MIN_POOL_SIZE: usize = 8;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// A checked-out engine instance.
pub trait ExecutionContext: Send + 'static {
    fn id(&self) -> u64;

    /// Clear per-request bindings before the context goes back to the idle queue.
    fn reset(&mut self);

    /// Best-effort stop of whatever the context is executing.
    fn interrupt(&self);

    /// Tear the engine down. The slot lease goes with it.
    fn dispose(self);
}

/// Creates execution contexts bound to the compiled program. `create` may block.
pub trait ContextFactory: Send + Sync + 'static {
    type Context: ExecutionContext;

    /// The new context must keep `lease` alive until its engine is gone.
    fn create(&self, lease: SlotLease) -> Result<Self::Context, RenderError>;
}

/// One unit of pool capacity, released on drop.
#[derive(Debug)]
pub struct SlotLease {
    slots: Option<Arc<Slots>>,
}

impl SlotLease {
    /// A lease for a context created outside any pool.
    pub fn detached() -> Self {
        Self { slots: None }
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.take() {
            slots.release();
        }
    }
}

#[derive(Debug)]
struct Slots {
    size: Mutex<usize>,
    max_size: usize,
    freed: Notify,
}

impl Slots {
    fn reserve(self: &Arc<Self>) -> Option<SlotLease> {
        let mut size = lock(&self.size);
        if *size >= self.max_size {
            return None;
        }
        *size += 1;
        gauge!(METRIC_ENGINE_POOL_SIZE).set(*size as f64);
        Some(SlotLease {
            slots: Some(Arc::clone(self)),
        })
    }

    fn release(&self) {
        {
            let mut size = lock(&self.size);
            *size = size.saturating_sub(1);
            gauge!(METRIC_ENGINE_POOL_SIZE).set(*size as f64);
        }
        self.freed.notify_one();
    }

    fn size(&self) -> usize {
        *lock(&self.size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_size: usize,
    pub acquire_timeout: Duration,
}

impl PoolConfig {
    /// Apply the sizing policy: 4 × available parallelism unless overridden, never below 8.
    pub fn new(max_size: Option<usize>, acquire_timeout: Option<Duration>) -> Self {
        let max_size = max_size
            .filter(|size| *size > 0)
            .unwrap_or_else(|| available_parallelism() * 4)
            .max(MIN_POOL_SIZE);

        Self {
            max_size,
            acquire_timeout: acquire_timeout.unwrap_or(DEFAULT_ACQUIRE_TIMEOUT),
        }
    }

    /// Contexts created eagerly at startup.
    pub fn warm_count(&self) -> usize {
        self.max_size / 2
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(None, None)
    }
}

pub(crate) fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub max_size: usize,
}

pub struct EnginePool<F: ContextFactory> {
    factory: Arc<F>,
    config: PoolConfig,
    idle: Mutex<VecDeque<F::Context>>,
    available: Semaphore,
    slots: Arc<Slots>,
    closed: AtomicBool,
}

impl<F: ContextFactory> EnginePool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let slots = Arc::new(Slots {
            size: Mutex::new(0),
            max_size: config.max_size,
            freed: Notify::new(),
        });
        Self {
            factory: Arc::new(factory),
            config,
            idle: Mutex::new(VecDeque::new()),
            available: Semaphore::new(0),
            slots,
            closed: AtomicBool::new(false),
        }
    }

    /// Build a pool and warm half of it. A warmup failure is returned after the
    /// pool has been closed again.
    pub async fn start(factory: F, config: PoolConfig) -> Result<Arc<Self>, RenderError> {
        let pool = Arc::new(Self::new(factory, config));
        let count = pool.config.warm_count();
        if let Err(err) = pool.warmup(count).await {
            pool.close();
            return Err(err);
        }
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.slots.size(),
            idle: lock(&self.idle).len(),
            max_size: self.config.max_size,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Create up to `count` contexts concurrently and park them in the idle queue.
    pub async fn warmup(&self, count: usize) -> Result<usize, RenderError> {
        let leases: Vec<SlotLease> = std::iter::from_fn(|| self.slots.reserve())
            .take(count)
            .collect();

        let tasks = leases.into_iter().map(|lease| {
            let factory = Arc::clone(&self.factory);
            tokio::task::spawn_blocking(move || factory.create(lease))
        });

        let mut warmed = 0;
        let mut first_error = None;
        for joined in join_all(tasks).await {
            match joined {
                Ok(Ok(context)) => {
                    self.park(context);
                    warmed += 1;
                }
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(join_err) => {
                    first_error.get_or_insert(RenderError::context_init(join_err.to_string()));
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!(
                    target = "ssrd::engine::pool",
                    warmed,
                    max_size = self.config.max_size,
                    "engine pool warmed"
                );
                Ok(warmed)
            }
        }
    }

    /// Check out a context: reuse an idle one, else grow, else wait up to the
    /// acquire timeout.
    pub async fn get(&self) -> Result<F::Context, RenderError> {
        if self.is_closed() {
            return Err(RenderError::PoolClosed);
        }

        match self.available.try_acquire() {
            Ok(permit) => {
                permit.forget();
                return self.pop_idle();
            }
            Err(TryAcquireError::Closed) => return Err(RenderError::PoolClosed),
            Err(TryAcquireError::NoPermits) => {}
        }

        if let Some(lease) = self.slots.reserve() {
            return self.create_with(lease).await;
        }

        match tokio::time::timeout(self.config.acquire_timeout, self.wait_for_context()).await {
            Ok(result) => result,
            Err(_) => {
                counter!(METRIC_ENGINE_POOL_TIMEOUT_TOTAL).increment(1);
                warn!(
                    target = "ssrd::engine::pool",
                    waited_ms = self.config.acquire_timeout.as_millis() as u64,
                    max_size = self.config.max_size,
                    "engine pool exhausted"
                );
                Err(RenderError::PoolTimeout {
                    waited: self.config.acquire_timeout,
                })
            }
        }
    }

    /// Return a healthy context. When the idle queue is already full the context
    /// is disposed and the pool shrinks.
    pub fn put(&self, mut context: F::Context) {
        context.reset();

        let mut idle = lock(&self.idle);
        if self.is_closed() || idle.len() >= self.config.max_size {
            drop(idle);
            context.dispose();
            return;
        }
        idle.push_back(context);
        drop(idle);
        self.available.add_permits(1);
    }

    /// Drop a context whose execution was interrupted or otherwise untrusted.
    pub fn discard(&self, context: F::Context) {
        debug!(
            target = "ssrd::engine::pool",
            context_id = context.id(),
            "discarding execution context"
        );
        counter!(METRIC_ENGINE_CONTEXT_DISCARDED_TOTAL).increment(1);
        context.interrupt();
        context.dispose();
    }

    /// Dispose every idle context. Later `get` calls fail with `PoolClosed`.
    pub fn close(&self) {
        let drained: Vec<F::Context> = {
            let mut idle = lock(&self.idle);
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            self.available.close();
            idle.drain(..).collect()
        };

        let disposed = drained.len();
        for context in drained {
            context.dispose();
        }

        info!(
            target = "ssrd::engine::pool",
            disposed,
            remaining = self.slots.size(),
            "engine pool closed"
        );
    }

    async fn wait_for_context(&self) -> Result<F::Context, RenderError> {
        loop {
            tokio::select! {
                permit = self.available.acquire() => {
                    return match permit {
                        Ok(permit) => {
                            permit.forget();
                            self.pop_idle()
                        }
                        Err(_) => Err(RenderError::PoolClosed),
                    };
                }
                _ = self.slots.freed.notified() => {
                    if self.is_closed() {
                        return Err(RenderError::PoolClosed);
                    }
                    if let Some(lease) = self.slots.reserve() {
                        return self.create_with(lease).await;
                    }
                }
            }
        }
    }

    fn pop_idle(&self) -> Result<F::Context, RenderError> {
        lock(&self.idle).pop_front().ok_or(RenderError::PoolClosed)
    }

    fn park(&self, context: F::Context) {
        let mut idle = lock(&self.idle);
        if self.is_closed() {
            drop(idle);
            context.dispose();
            return;
        }
        idle.push_back(context);
        drop(idle);
        self.available.add_permits(1);
    }

    /// Create a context on the blocking pool. If this future is dropped the
    /// finished context is dropped with the task output, freeing its slot.
    async fn create_with(&self, lease: SlotLease) -> Result<F::Context, RenderError> {
        let factory = Arc::clone(&self.factory);

        let created = tokio::task::spawn_blocking(move || factory.create(lease))
            .await
            .map_err(|err| RenderError::context_init(err.to_string()))??;

        if self.is_closed() {
            created.dispose();
            return Err(RenderError::PoolClosed);
        }

        debug!(
            target = "ssrd::engine::pool",
            context_id = created.id(),
            "created execution context"
        );
        Ok(created)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    };

    use super::{ContextFactory, ExecutionContext, SlotLease};
    use crate::application::render::types::RenderError;

    #[derive(Debug, Default)]
    pub struct Ledger {
        pub created: AtomicUsize,
        pub resets: AtomicUsize,
        pub interrupts: AtomicUsize,
        pub disposed: Mutex<Vec<u64>>,
        /// When set, disposed contexts keep their lease in `lingering`, like an
        /// engine still unwinding an interrupted job.
        pub linger: AtomicBool,
        pub lingering: Mutex<Vec<SlotLease>>,
    }

    #[derive(Debug)]
    pub struct FakeContext {
        pub id: u64,
        ledger: Arc<Ledger>,
        lease: SlotLease,
    }

    impl ExecutionContext for FakeContext {
        fn id(&self) -> u64 {
            self.id
        }

        fn reset(&mut self) {
            self.ledger.resets.fetch_add(1, Ordering::SeqCst);
        }

        fn interrupt(&self) {
            self.ledger.interrupts.fetch_add(1, Ordering::SeqCst);
        }

        fn dispose(self) {
            if let Ok(mut disposed) = self.ledger.disposed.lock() {
                disposed.push(self.id);
            }
            if self.ledger.linger.load(Ordering::SeqCst)
                && let Ok(mut lingering) = self.ledger.lingering.lock()
            {
                lingering.push(self.lease);
            }
        }
    }

    #[derive(Debug, Default)]
    pub struct FakeFactory {
        pub ledger: Arc<Ledger>,
        next_id: AtomicU64,
        pub fail: AtomicBool,
    }

    impl ContextFactory for FakeFactory {
        type Context = FakeContext;

        fn create(&self, lease: SlotLease) -> Result<FakeContext, RenderError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RenderError::context_init("bundle threw during evaluation"));
            }
            self.ledger.created.fetch_add(1, Ordering::SeqCst);
            Ok(FakeContext {
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
                ledger: Arc::clone(&self.ledger),
                lease,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{Arc, Mutex, atomic::Ordering},
        time::Duration,
    };

    use super::{
        fake::{FakeFactory, Ledger},
        *,
    };

    fn pool(max_size: usize, acquire_timeout: Duration) -> (Arc<EnginePool<FakeFactory>>, Arc<Ledger>) {
        let factory = FakeFactory::default();
        let ledger = Arc::clone(&factory.ledger);
        let pool = EnginePool::new(
            factory,
            PoolConfig {
                max_size,
                acquire_timeout,
            },
        );
        (Arc::new(pool), ledger)
    }

    #[test]
    fn sizing_policy_floors_at_eight() {
        assert_eq!(PoolConfig::new(Some(2), None).max_size, MIN_POOL_SIZE);
        assert_eq!(PoolConfig::new(Some(32), None).max_size, 32);
        assert!(PoolConfig::new(None, None).max_size >= MIN_POOL_SIZE);
        assert_eq!(PoolConfig::new(None, None).acquire_timeout, DEFAULT_ACQUIRE_TIMEOUT);
        assert_eq!(PoolConfig::new(Some(10), None).warm_count(), 5);
    }

    #[tokio::test]
    async fn start_warms_half_the_pool() {
        let factory = FakeFactory::default();
        let ledger = Arc::clone(&factory.ledger);
        let pool = EnginePool::start(factory, PoolConfig::new(Some(8), None))
            .await
            .expect("pool starts");

        let stats = pool.stats();
        assert_eq!(stats.size, 4);
        assert_eq!(stats.idle, 4);
        assert_eq!(ledger.created.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn start_fails_when_contexts_cannot_be_created() {
        let factory = FakeFactory::default();
        factory.fail.store(true, Ordering::SeqCst);

        let err = EnginePool::start(factory, PoolConfig::new(Some(8), None))
            .await
            .err()
            .expect("warmup error");

        assert!(matches!(err, RenderError::ContextInit { .. }));
    }

    #[tokio::test]
    async fn idle_contexts_are_reused_before_growing() {
        let (pool, ledger) = pool(4, Duration::from_millis(50));

        let first = pool.get().await.expect("context");
        let first_id = first.id();
        pool.put(first);
        let second = pool.get().await.expect("context");

        assert_eq!(second.id(), first_id);
        assert_eq!(ledger.created.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let (pool, _ledger) = pool(2, Duration::from_millis(30));

        let _a = pool.get().await.expect("context");
        let _b = pool.get().await.expect("context");
        let err = pool.get().await.expect_err("pool is saturated");

        assert_eq!(
            err,
            RenderError::PoolTimeout {
                waited: Duration::from_millis(30)
            }
        );
        assert_eq!(pool.stats().size, 2);
    }

    #[tokio::test]
    async fn waiter_receives_returned_context() {
        let (pool, _ledger) = pool(1, Duration::from_secs(2));
        let held = pool.get().await.expect("context");
        let held_id = held.id();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get().await.map(|ctx| ctx.id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.put(held);

        assert_eq!(waiter.await.expect("join"), Ok(held_id));
    }

    #[tokio::test]
    async fn discard_disposes_and_frees_capacity() {
        let (pool, ledger) = pool(1, Duration::from_millis(30));

        let context = pool.get().await.expect("context");
        let id = context.id();
        pool.discard(context);

        assert_eq!(pool.stats().size, 0);
        assert_eq!(ledger.interrupts.load(Ordering::SeqCst), 1);
        assert_eq!(*ledger.disposed.lock().expect("ledger"), vec![id]);

        let replacement = pool.get().await.expect("fresh context");
        assert_ne!(replacement.id(), id);
    }

    #[tokio::test]
    async fn discard_lets_a_waiter_grow_the_pool() {
        let (pool, ledger) = pool(1, Duration::from_secs(2));
        let broken = pool.get().await.expect("context");
        let broken_id = broken.id();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get().await.map(|ctx| ctx.id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.discard(broken);

        let id = waiter.await.expect("join").expect("fresh context");
        assert_ne!(id, broken_id);
        assert_eq!(ledger.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slot_stays_taken_until_the_engine_is_gone() {
        let (pool, ledger) = pool(1, Duration::from_millis(30));
        ledger.linger.store(true, Ordering::SeqCst);

        let stuck = pool.get().await.expect("context");
        pool.discard(stuck);

        assert_eq!(pool.stats().size, 1);
        assert!(matches!(
            pool.get().await,
            Err(RenderError::PoolTimeout { .. })
        ));

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        ledger.lingering.lock().expect("lingering").clear();

        let fresh = waiter.await.expect("join").expect("context after release");
        assert_eq!(pool.stats().size, 1);
        pool.put(fresh);
        assert_eq!(ledger.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_creation_releases_its_slot() {
        let factory = FakeFactory::default();
        factory.fail.store(true, Ordering::SeqCst);
        let pool = EnginePool::new(
            factory,
            PoolConfig {
                max_size: 1,
                acquire_timeout: Duration::from_millis(10),
            },
        );

        let err = pool.get().await.expect_err("creation fails");

        assert!(matches!(err, RenderError::ContextInit { .. }));
        assert_eq!(pool.stats().size, 0);
    }

    #[tokio::test]
    async fn close_disposes_idle_and_rejects_later_gets() {
        let (pool, ledger) = pool(4, Duration::from_secs(1));
        let idle = pool.get().await.expect("context");
        let held = pool.get().await.expect("context");
        pool.put(idle);

        pool.close();

        assert_eq!(ledger.disposed.lock().expect("ledger").len(), 1);
        assert_eq!(pool.get().await.expect_err("closed"), RenderError::PoolClosed);

        pool.put(held);
        assert_eq!(ledger.disposed.lock().expect("ledger").len(), 2);
        assert_eq!(pool.stats().size, 0);
    }

    #[tokio::test]
    async fn close_wakes_waiters_with_pool_closed() {
        let (pool, _ledger) = pool(1, Duration::from_secs(5));
        let _held = pool.get().await.expect("context");

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get().await.map(|ctx| ctx.id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.close();

        assert_eq!(waiter.await.expect("join"), Err(RenderError::PoolClosed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checkouts_respect_bound_and_exclusivity() {
        let (pool, ledger) = pool(4, Duration::from_secs(5));
        let in_flight = Arc::new(Mutex::new(HashSet::new()));

        let workers = (0..24).map(|_| {
            let pool = Arc::clone(&pool);
            let in_flight = Arc::clone(&in_flight);
            tokio::spawn(async move {
                for round in 0..20 {
                    let context = pool.get().await.expect("context");
                    let id = context.id();
                    assert!(
                        in_flight.lock().expect("set").insert(id),
                        "context {id} handed out twice"
                    );
                    assert!(pool.stats().size <= 4);
                    tokio::task::yield_now().await;
                    in_flight.lock().expect("set").remove(&id);
                    if round % 7 == 0 {
                        pool.discard(context);
                    } else {
                        pool.put(context);
                    }
                }
            })
        });

        for result in join_all(workers).await {
            result.expect("worker completes");
        }

        let stats = pool.stats();
        assert!(stats.size <= 4);
        assert_eq!(stats.size, stats.idle);
        let disposed = ledger.disposed.lock().expect("ledger").len();
        assert_eq!(ledger.created.load(Ordering::SeqCst) - disposed, stats.size);
    }
}
