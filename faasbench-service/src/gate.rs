//! Concurrency gate shared by all benchmark tasks.
//!
//! [`ConcurrencyGate`] bounds how many cold start estimates and how many load tests run at the
//! same time across all targets. Each kind of work draws from its own tokio semaphore, or both
//! draw from a single shared one. Semaphores in tokio are fair, so blocked tasks are served in
//! the order they started waiting.
//!
//! An acquired [`GatePermit`] is returned when dropped, which also notifies waiters of
//! [`ConcurrencyGate::wait_idle`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Interval for the periodic metrics emitter.
const EMITTER_INTERVAL: Duration = Duration::from_secs(1);

/// The kind of work a permit is acquired for.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PermitKind {
    /// A cold start estimate, including its warm samples.
    ColdStart,
    /// A load test run.
    LoadTest,
}

impl PermitKind {
    /// Returns a stable name used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            PermitKind::ColdStart => "cold_start",
            PermitKind::LoadTest => "load_test",
        }
    }
}

impl fmt::Display for PermitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Pool {
    semaphore: Arc<Semaphore>,
    max: usize,
}

impl Pool {
    fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        })
    }

    fn used(&self) -> usize {
        self.max - self.semaphore.available_permits()
    }
}

/// Limits concurrent cold start estimates and load tests.
///
/// Clones share the same permits.
#[derive(Clone, Debug)]
pub struct ConcurrencyGate {
    cold_start: Arc<Pool>,
    load_test: Arc<Pool>,
    released: Arc<Notify>,
}

impl ConcurrencyGate {
    /// Creates a gate where both kinds of work draw from one pool of `max` permits.
    pub fn shared(max: usize) -> Self {
        let pool = Pool::new(max);
        Self {
            cold_start: Arc::clone(&pool),
            load_test: pool,
            released: Arc::new(Notify::new()),
        }
    }

    /// Creates a gate with independent pools for cold start estimates and load tests.
    pub fn split(max_cold_start: usize, max_load_test: usize) -> Self {
        Self {
            cold_start: Pool::new(max_cold_start),
            load_test: Pool::new(max_load_test),
            released: Arc::new(Notify::new()),
        }
    }

    fn pool(&self, kind: PermitKind) -> &Pool {
        match kind {
            PermitKind::ColdStart => &self.cold_start,
            PermitKind::LoadTest => &self.load_test,
        }
    }

    /// Returns `true` if both kinds of work draw from the same pool.
    pub fn is_shared(&self) -> bool {
        Arc::ptr_eq(&self.cold_start, &self.load_test)
    }

    /// Waits for a permit of the given kind.
    ///
    /// Returns `None` without holding a permit if `cancel` fires first.
    pub async fn acquire(
        &self,
        kind: PermitKind,
        cancel: &CancellationToken,
    ) -> Option<GatePermit> {
        let semaphore = Arc::clone(&self.pool(kind).semaphore);

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            permit = semaphore.acquire_owned() => permit.ok()?,
        };

        Some(GatePermit {
            kind,
            permit: Some(permit),
            released: Arc::clone(&self.released),
        })
    }

    /// Returns the number of permits of the given kind currently held.
    ///
    /// For a shared gate this counts permits of both kinds.
    pub fn used_permits(&self, kind: PermitKind) -> usize {
        self.pool(kind).used()
    }

    /// Returns the configured maximum for the given kind.
    pub fn max_permits(&self, kind: PermitKind) -> usize {
        self.pool(kind).max
    }

    /// Returns the lower of the two maxima.
    pub fn min_concurrency(&self) -> usize {
        self.cold_start.max.min(self.load_test.max)
    }

    /// Waits until all permits have been returned.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.released.notified();
            if self.cold_start.used() == 0 && self.load_test.used() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Periodically calls `emit` with the in-use count of each kind.
    ///
    /// This future runs forever and is intended to be raced against the benchmark tasks.
    pub async fn run_emitter<F, Fut>(&self, mut emit: F)
    where
        F: FnMut(PermitKind, usize) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(EMITTER_INTERVAL);
        loop {
            ticker.tick().await;
            emit(PermitKind::ColdStart, self.cold_start.used()).await;
            emit(PermitKind::LoadTest, self.load_test.used()).await;
        }
    }
}

/// RAII guard for a gate permit.
///
/// Dropping this permit releases it back to the [`ConcurrencyGate`] and notifies any task
/// waiting in [`ConcurrencyGate::wait_idle`].
pub struct GatePermit {
    kind: PermitKind,
    permit: Option<OwnedSemaphorePermit>,
    released: Arc<Notify>,
}

impl GatePermit {
    /// The kind of work this permit was acquired for.
    pub fn kind(&self) -> PermitKind {
        self.kind
    }
}

impl fmt::Debug for GatePermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatePermit")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        drop(self.permit.take());
        self.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn acquire_and_release() {
        let gate = ConcurrencyGate::split(2, 1);
        let cancel = CancellationToken::new();

        let p1 = gate.acquire(PermitKind::ColdStart, &cancel).await.unwrap();
        let p2 = gate.acquire(PermitKind::ColdStart, &cancel).await.unwrap();
        let p3 = gate.acquire(PermitKind::LoadTest, &cancel).await.unwrap();
        assert_eq!(gate.used_permits(PermitKind::ColdStart), 2);
        assert_eq!(gate.used_permits(PermitKind::LoadTest), 1);
        assert_eq!(p3.kind(), PermitKind::LoadTest);

        drop(p1);
        assert_eq!(gate.used_permits(PermitKind::ColdStart), 1);

        drop(p2);
        drop(p3);
        assert_eq!(gate.used_permits(PermitKind::ColdStart), 0);
        assert_eq!(gate.used_permits(PermitKind::LoadTest), 0);
    }

    #[tokio::test]
    async fn shared_pool_counts_both_kinds() {
        let gate = ConcurrencyGate::shared(2);
        let cancel = CancellationToken::new();
        assert!(gate.is_shared());
        assert_eq!(gate.min_concurrency(), 2);

        let _cold = gate.acquire(PermitKind::ColdStart, &cancel).await.unwrap();
        let _load = gate.acquire(PermitKind::LoadTest, &cancel).await.unwrap();
        assert_eq!(gate.used_permits(PermitKind::ColdStart), 2);
        assert_eq!(gate.used_permits(PermitKind::LoadTest), 2);

        let mut third = Box::pin(gate.acquire(PermitKind::ColdStart, &cancel));
        assert!(futures::poll!(&mut third).is_pending());
    }

    #[tokio::test]
    async fn split_pools_are_independent() {
        let gate = ConcurrencyGate::split(1, 3);
        let cancel = CancellationToken::new();
        assert!(!gate.is_shared());
        assert_eq!(gate.min_concurrency(), 1);
        assert_eq!(gate.max_permits(PermitKind::LoadTest), 3);

        let _cold = gate.acquire(PermitKind::ColdStart, &cancel).await.unwrap();
        let load = gate.acquire(PermitKind::LoadTest, &cancel).await;
        assert!(load.is_some());
    }

    #[tokio::test]
    async fn cancelled_acquire_returns_without_permit() {
        let gate = ConcurrencyGate::shared(1);
        let cancel = CancellationToken::new();
        let _held = gate.acquire(PermitKind::LoadTest, &cancel).await.unwrap();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.acquire(PermitKind::LoadTest, &cancel).await })
        };
        tokio::task::yield_now().await;

        cancel.cancel();
        assert!(waiter.await.unwrap().is_none());
        assert_eq!(gate.used_permits(PermitKind::LoadTest), 1);
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let gate = ConcurrencyGate::shared(1);
        let cancel = CancellationToken::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let held = gate.acquire(PermitKind::ColdStart, &cancel).await.unwrap();

        let mut tasks = Vec::new();
        for id in 0..4 {
            let gate = gate.clone();
            let cancel = cancel.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _permit = gate.acquire(PermitKind::ColdStart, &cancel).await.unwrap();
                order.lock().unwrap().push(id);
            }));
            // let the task enqueue itself before spawning the next one
            tokio::task::yield_now().await;
        }

        drop(held);
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), [0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_maximum() {
        let gate = ConcurrencyGate::shared(2);
        let cancel = CancellationToken::new();
        let current = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let gate = gate.clone();
                let cancel = cancel.clone();
                let current = Arc::clone(&current);
                let observed = Arc::clone(&observed);
                tokio::spawn(async move {
                    for _ in 0..3 {
                        let _permit = gate.acquire(PermitKind::LoadTest, &cancel).await.unwrap();
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        observed.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(observed.load(Ordering::SeqCst), 2);
        assert_eq!(gate.used_permits(PermitKind::LoadTest), 0);
    }

    #[tokio::test]
    async fn wait_idle_resolves_when_permits_returned() {
        let gate = ConcurrencyGate::split(2, 2);
        let cancel = CancellationToken::new();
        let p1 = gate.acquire(PermitKind::ColdStart, &cancel).await.unwrap();
        let p2 = gate.acquire(PermitKind::LoadTest, &cancel).await.unwrap();

        let mut wait = Box::pin(gate.wait_idle());

        drop(p1);
        assert!(futures::poll!(&mut wait).is_pending());

        drop(p2);
        assert!(futures::poll!(&mut wait).is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn emitter_reports_both_kinds() {
        let gate = ConcurrencyGate::split(5, 5);
        let cancel = CancellationToken::new();
        let _permit = gate.acquire(PermitKind::LoadTest, &cancel).await.unwrap();

        let emitted = Arc::new(Mutex::new(Vec::new()));
        let emitter = gate.run_emitter(|kind, count| {
            let emitted = Arc::clone(&emitted);
            async move {
                emitted.lock().unwrap().push((kind, count));
            }
        });

        tokio::select! {
            _ = emitter => unreachable!("emitter runs forever"),
            _ = tokio::time::sleep(EMITTER_INTERVAL / 2) => {}
        }

        assert_eq!(
            *emitted.lock().unwrap(),
            [(PermitKind::ColdStart, 0), (PermitKind::LoadTest, 1)]
        );
    }
}
