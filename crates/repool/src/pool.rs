//! The bounded pool: check-out/check-in, waiter coordination, idle
//! expiry and background workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::Rng;

use crate::entry::Entry;
use crate::error::PoolError;
use crate::events::{self, PoolEvent, PoolListener};
use crate::reusable::{ResourceFactory, Reusable};

/// Order in which idle items are handed out.
///
/// LIFO maximises cache warmth (the hottest item is reused), FIFO
/// maximises fairness across items, random is provided for
/// load-distribution experiments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessOrder {
    /// Last in, first out (a stack). The default.
    #[default]
    Lifo,
    /// First in, first out (a queue).
    Fifo,
    /// A uniformly random idle item.
    Random,
}

/// Sizing and expiry parameters for a pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolParameters {
    /// Soft cap on total entries; 0 = unbounded.
    pub pool_size: usize,
    /// Hard cap on simultaneous entries; 0 = unbounded. When positive
    /// it is raised to at least `pool_size`.
    pub max_size: usize,
    /// Idle expiry for free entries; zero = no expiry.
    pub expiry: Duration,
}

impl PoolParameters {
    /// Parameters for an unbounded pool with no expiry.
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            pool_size: 0,
            max_size: 0,
            expiry: Duration::ZERO,
        }
    }
}

/// A snapshot of pool state and counters.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Total entries held (free and checked-out).
    pub size: usize,
    /// Entries free to be checked out.
    pub free: usize,
    /// Entries currently checked out.
    pub checked_out: usize,
    /// Successful check-outs since the last parameter change.
    pub requests: u64,
    /// Check-outs satisfied from the free list.
    pub hits: u64,
    /// `hits / requests` as a percentage; 0 when no requests.
    pub hit_rate: f64,
}

struct PoolState<T> {
    free: Vec<Entry<Arc<T>>>,
    used: Vec<Arc<T>>,
    pool_size: usize,
    max_size: usize,
    expiry: Duration,
    access: AccessOrder,
    requests: u64,
    hits: u64,
    released: bool,
}

impl<T> PoolState<T> {
    fn total(&self) -> usize {
        self.free.len() + self.used.len()
    }

    fn hit_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            (self.hits as f64 / self.requests as f64) * 100.0
        }
    }
}

/// A background worker owned by the pool (reaper or initialiser).
struct Worker {
    stop: Arc<AtomicBool>,
    wake: Option<mpsc::Sender<()>>,
    handle: thread::JoinHandle<()>,
}

/// Longest a parked worker sleeps before re-checking its stop flag.
const WORKER_PARK: Duration = Duration::from_secs(5);

/// A bounded, named pool of reusable items.
///
/// The pool is used through an [`Arc`]; background workers and borrowed
/// items hold [`Weak`] references back to it.
///
/// See the crate docs for the lifecycle model. All blocking waits are
/// on the pool's condition variable, signalled by [`check_in`]
/// (`notify_all`) and by release completion; waiters are not
/// FIFO-fair.
///
/// [`check_in`]: Pool::check_in
pub struct Pool<F: ResourceFactory> {
    name: String,
    factory: Arc<F>,
    /// Back-reference handed to background workers and borrowed items.
    weak: Weak<Self>,
    state: Mutex<PoolState<F::Item>>,
    cond: Condvar,
    listeners: Mutex<Vec<Arc<dyn PoolListener>>>,
    async_destroy: AtomicBool,
    reaper: Mutex<Option<Worker>>,
    initer: Mutex<Option<Worker>>,
}

impl<F: ResourceFactory> Pool<F> {
    /// Create a new pool and start its reaper if `params.expiry` is
    /// non-zero.
    pub fn new(name: impl Into<String>, factory: F, params: PoolParameters) -> Arc<Self> {
        let pool = Arc::new_cyclic(|weak| Self {
            name: name.into(),
            factory: Arc::new(factory),
            weak: weak.clone(),
            state: Mutex::new(PoolState {
                free: Vec::new(),
                used: Vec::new(),
                pool_size: 0,
                max_size: 0,
                expiry: Duration::ZERO,
                access: AccessOrder::default(),
                requests: 0,
                hits: 0,
                released: false,
            }),
            cond: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
            async_destroy: AtomicBool::new(false),
            reaper: Mutex::new(None),
            initer: Mutex::new(None),
        });
        pool.set_parameters(params);
        pool
    }

    /// A weak handle to this pool, suitable for back-references from
    /// items that must check themselves in.
    pub fn downgrade(&self) -> Weak<Self> {
        self.weak.clone()
    }

    /// The pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The factory supplying this pool's lifecycle hooks.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    // ------------------------------------------------------------------
    // Check-out / check-in
    // ------------------------------------------------------------------

    /// Check out an item.
    ///
    /// Pops idle entries per the configured [`AccessOrder`], destroying
    /// any that fail validation, until a valid one is found (a *hit*).
    /// If the free list is exhausted a new item is created unless the
    /// hard cap is reached, in which case `Ok(None)` is returned after
    /// emitting [`PoolEvent::MaxSizeLimitError`].
    pub fn check_out(&self) -> Result<Option<Arc<F::Item>>, PoolError> {
        let mut pending = Vec::new();
        let result = {
            let mut state = self.state.lock();
            self.check_out_locked(&mut state, &mut pending)
        };
        self.fire(&pending);
        result
    }

    /// Check out an item, waiting up to `timeout` for one to be
    /// checked in if the pool is at its hard cap.
    ///
    /// Returns `Ok(None)` at the deadline; the timeout itself is never
    /// an error.
    pub fn check_out_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<Arc<F::Item>>, PoolError> {
        let deadline = Instant::now() + timeout;
        let mut pending = Vec::new();
        let result = (|| {
            let mut state = self.state.lock();
            loop {
                if let Some(item) = self.check_out_locked(&mut state, &mut pending)? {
                    return Ok(Some(item));
                }
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                tracing::debug!(pool = %self.name, ?timeout, "no pooled items spare, waiting");
                if self.cond.wait_until(&mut state, deadline).timed_out() {
                    // One final attempt after the deadline wait.
                    return self.check_out_locked(&mut state, &mut pending);
                }
            }
        })();
        self.fire(&pending);
        result
    }

    fn check_out_locked(
        &self,
        state: &mut PoolState<F::Item>,
        pending: &mut Vec<PoolEvent>,
    ) -> Result<Option<Arc<F::Item>>, PoolError> {
        if state.released {
            return Err(PoolError::released(&self.name));
        }
        let old_total = state.total();

        let mut item: Option<Arc<F::Item>> = None;
        let mut hit = false;
        while !state.free.is_empty() {
            let index = match state.access {
                AccessOrder::Lifo => state.free.len() - 1,
                AccessOrder::Fifo => 0,
                AccessOrder::Random => rand::thread_rng().gen_range(0..state.free.len()),
            };
            let entry = state.free.remove(index);
            if self.factory.validate(entry.item()) {
                item = Some(entry.into_item());
                hit = true;
                break;
            }
            pending.push(PoolEvent::ValidationError);
            tracing::info!(pool = %self.name, "removed invalid item from pool");
            self.destroy_item(entry.item());
        }

        if item.is_none() {
            if state.max_size > 0 && state.used.len() == state.max_size {
                pending.push(PoolEvent::MaxSizeLimitError);
            } else if state.max_size == 0 || state.used.len() < state.max_size {
                let created = self.factory.create()?;
                if !self.factory.validate(&created) {
                    self.destroy_item(&created);
                    return Err(PoolError::CreateInvalid {
                        pool: self.name.clone(),
                    });
                }
                item = Some(created);
            }
        }

        if let Some(item) = item {
            state.used.push(Arc::clone(&item));
            state.requests += 1;
            if hit {
                state.hits += 1;
            }
            pending.push(PoolEvent::CheckOut);
            // Threshold events fire only on an upward crossing; hovering
            // at the boundary does not re-fire them.
            let total = state.total();
            if total == state.pool_size && total > old_total {
                pending.push(PoolEvent::MaxPoolLimitReached);
            } else if total == state.pool_size + 1 && total > old_total {
                pending.push(PoolEvent::MaxPoolLimitExceeded);
            }
            if total == state.max_size && total > old_total {
                pending.push(PoolEvent::MaxSizeLimitReached);
            }
            tracing::debug!(
                pool = %self.name,
                used = state.used.len(),
                total,
                hit_rate = state.hit_rate(),
                "checkout"
            );
            Ok(Some(item))
        } else {
            tracing::debug!(
                pool = %self.name,
                used = state.used.len(),
                total = state.total(),
                "checkout refused, hard cap reached"
            );
            Ok(None)
        }
    }

    /// Check an item back in and wake any waiters.
    ///
    /// The item is destroyed when the pool already holds `pool_size`
    /// entries, recycled and returned to the free list otherwise;
    /// a recycle failure also destroys it.
    pub fn check_in(&self, item: &Arc<F::Item>) -> Result<(), PoolError> {
        let pending = [PoolEvent::CheckIn];
        let result = {
            let mut state = self.state.lock();
            let position = state.used.iter().position(|u| Arc::ptr_eq(u, item));
            match position {
                None => {
                    tracing::warn!(pool = %self.name, "attempt to return item not belonging to pool");
                    Err(PoolError::foreign_item(&self.name))
                }
                Some(position) => {
                    state.used.remove(position);
                    let kill = (state.max_size > 0 && state.total() >= state.pool_size)
                        || (state.max_size == 0 && state.free.len() >= state.pool_size);
                    if kill {
                        self.destroy_item(item);
                        tracing::debug!(
                            pool = %self.name,
                            used = state.used.len(),
                            total = state.total(),
                            "checkin, surplus destroyed"
                        );
                    } else {
                        match item.recycle() {
                            Ok(()) => {
                                let expiry = state.expiry;
                                state.free.push(Entry::new(Arc::clone(item), expiry));
                                tracing::debug!(
                                    pool = %self.name,
                                    used = state.used.len(),
                                    total = state.total(),
                                    "checkin"
                                );
                            }
                            Err(error) => {
                                self.destroy_item(item);
                                tracing::warn!(
                                    pool = %self.name,
                                    %error,
                                    "unable to recycle item, destroyed"
                                );
                            }
                        }
                    }
                    self.cond.notify_all();
                    Ok(())
                }
            }
        };
        self.fire(&pending);
        result
    }

    // ------------------------------------------------------------------
    // Parameters and introspection
    // ------------------------------------------------------------------

    /// Change the pool's sizing and expiry parameters.
    ///
    /// Existing entries remain, subject to the new parameters: every
    /// free entry's expiry deadline is re-stamped. The hit counters are
    /// reset. The reaper is halted and, when the new expiry is
    /// non-zero, restarted with an interval derived from it.
    pub fn set_parameters(&self, params: PoolParameters) {
        self.halt_reaper();
        {
            let mut state = self.state.lock();
            state.pool_size = params.pool_size;
            state.max_size = if params.max_size > 0 {
                params.max_size.max(params.pool_size)
            } else {
                0
            };
            state.expiry = params.expiry;
            state.requests = 0;
            state.hits = 0;
            let expiry = state.expiry;
            for entry in &mut state.free {
                entry.set_expiry(expiry);
            }
        }
        if params.expiry > Duration::ZERO {
            self.spawn_reaper(params.expiry);
        }
        tracing::debug!(
            pool = %self.name,
            pool_size = params.pool_size,
            max_size = params.max_size,
            expiry_ms = params.expiry.as_millis() as u64,
            "parameters changed"
        );
        self.fire(&[PoolEvent::ParametersChanged]);
    }

    /// Change the order in which idle items are handed out.
    pub fn set_access_order(&self, access: AccessOrder) {
        self.state.lock().access = access;
    }

    /// The configured access order.
    pub fn access_order(&self) -> AccessOrder {
        self.state.lock().access
    }

    /// Enable or disable asynchronous destruction.
    ///
    /// When enabled, every destroy triggered by pool logic (invalid
    /// items, surplus check-ins, recycle failures, expiry, flush) runs
    /// on a fresh detached thread so the triggering call returns
    /// immediately. Final release always destroys synchronously.
    pub fn set_async_destroy(&self, enabled: bool) {
        self.async_destroy.store(enabled, Ordering::SeqCst);
    }

    /// Whether asynchronous destruction is enabled.
    pub fn async_destroy(&self) -> bool {
        self.async_destroy.load(Ordering::SeqCst)
    }

    /// Total entries held (free and checked-out).
    pub fn size(&self) -> usize {
        self.state.lock().total()
    }

    /// Entries free to be checked out.
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Entries currently checked out.
    pub fn checked_out(&self) -> usize {
        self.state.lock().used.len()
    }

    /// The soft cap on total entries (0 = unbounded).
    pub fn pool_size(&self) -> usize {
        self.state.lock().pool_size
    }

    /// The hard cap on simultaneous entries (0 = unbounded).
    pub fn max_size(&self) -> usize {
        self.state.lock().max_size
    }

    /// The idle expiry for free entries (zero = no expiry).
    pub fn expiry(&self) -> Duration {
        self.state.lock().expiry
    }

    /// Proportion of check-outs satisfied from the free list, as a
    /// percentage. Zero when there have been no requests.
    pub fn hit_rate(&self) -> f64 {
        self.state.lock().hit_rate()
    }

    /// Whether the pool has been released.
    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    /// A consistent snapshot of sizes and counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            size: state.total(),
            free: state.free.len(),
            checked_out: state.used.len(),
            requests: state.requests,
            hits: state.hits,
            hit_rate: state.hit_rate(),
        }
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Subscribe a listener to pool events.
    pub fn add_listener(&self, listener: Arc<dyn PoolListener>) {
        self.listeners.lock().push(listener);
    }

    /// Unsubscribe a listener (matched by `Arc` identity).
    pub fn remove_listener(&self, listener: &Arc<dyn PoolListener>) {
        self.listeners
            .lock()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    fn fire(&self, events: &[PoolEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.lock().clone();
        events::dispatch(&self.name, &listeners, events);
    }

    // ------------------------------------------------------------------
    // Population and teardown
    // ------------------------------------------------------------------

    /// Populate the pool in the background until it holds `count`
    /// items.
    ///
    /// `count` is clamped to `[0, pool_size]`. Items already held count
    /// toward the target. Only one initialiser runs at a time; calling
    /// `init` again halts and replaces the previous one.
    pub fn init(&self, count: usize) {
        let pool_size = self.state.lock().pool_size;
        let target = count.min(pool_size);
        if target == 0 {
            return;
        }

        if let Some(worker) = self.initer.lock().take() {
            Self::halt_worker(worker);
        }

        let weak = self.weak.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("{}-init", self.name))
            .spawn(move || {
                while !stop_flag.load(Ordering::SeqCst) {
                    let Some(pool) = weak.upgrade() else { break };
                    {
                        let state = pool.state.lock();
                        if state.released
                            || state.total() >= target
                            || target > state.pool_size
                        {
                            break;
                        }
                    }
                    match pool.factory.create() {
                        Ok(item) => {
                            let mut state = pool.state.lock();
                            if state.released {
                                drop(state);
                                pool.destroy_item(&item);
                                break;
                            }
                            let expiry = state.expiry;
                            state.free.push(Entry::new(item, expiry));
                            tracing::debug!(pool = %pool.name, "initialized new item in pool");
                        }
                        Err(error) => {
                            tracing::warn!(
                                pool = %pool.name,
                                %error,
                                "unable to initialize items in pool"
                            );
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn pool initialiser thread");

        *self.initer.lock() = Some(Worker {
            stop,
            wake: None,
            handle,
        });
    }

    /// Release the pool, waiting for checked-out items to drain.
    ///
    /// Sets the one-way `released` latch (no further check-outs
    /// succeed), halts the background workers, blocks until every
    /// checked-out item has been checked back in, then destroys all
    /// free entries, emits [`PoolEvent::Released`] and clears the
    /// listener list. A second call is a no-op.
    pub fn release(&self) {
        self.release_inner(false);
    }

    /// Release the pool, forcibly destroying checked-out items instead
    /// of waiting for them.
    pub fn release_forcibly(&self) {
        self.release_inner(true);
    }

    /// Perform [`release`](Pool::release) on a detached background
    /// thread and return immediately.
    pub fn release_async(&self, force: bool) {
        let Some(pool) = self.weak.upgrade() else {
            return;
        };
        thread::Builder::new()
            .name(format!("{}-release", self.name))
            .spawn(move || pool.release_inner(force))
            .expect("failed to spawn pool release thread");
    }

    fn release_inner(&self, force: bool) {
        {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            state.released = true;
        }
        self.halt_reaper();
        if let Some(worker) = self.initer.lock().take() {
            Self::halt_worker(worker);
        }

        let mut released = 0usize;
        {
            let mut state = self.state.lock();
            if force {
                let used: Vec<_> = state.used.drain(..).collect();
                for item in used {
                    self.factory.destroy(&item);
                    released += 1;
                }
            } else {
                if !state.used.is_empty() {
                    tracing::debug!(pool = %self.name, "waiting for used items to be checked in");
                }
                while !state.used.is_empty() {
                    self.cond.wait(&mut state);
                }
            }
            let free: Vec<_> = state.free.drain(..).collect();
            for entry in free {
                self.factory.destroy(entry.item());
                released += 1;
            }
        }
        tracing::info!(pool = %self.name, released, "pool released");
        self.cond.notify_all();
        self.fire(&[PoolEvent::Released]);
        self.listeners.lock().clear();
    }

    /// Destroy every free entry now, emptying the free list.
    pub fn flush(&self) {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.free.drain(..).collect()
        };
        let count = drained.len();
        for entry in drained {
            self.destroy_item(entry.item());
        }
        if count > 0 {
            tracing::debug!(pool = %self.name, count, "flushed all spare items from pool");
        }
    }

    /// Destroy an item, on a detached thread when async destroy is on.
    fn destroy_item(&self, item: &Arc<F::Item>) {
        if self.async_destroy.load(Ordering::SeqCst) {
            let factory = Arc::clone(&self.factory);
            let item = Arc::clone(item);
            thread::Builder::new()
                .name(format!("{}-destroy", self.name))
                .spawn(move || factory.destroy(&item))
                .expect("failed to spawn destroy thread");
        } else {
            self.factory.destroy(item);
        }
    }

    // ------------------------------------------------------------------
    // Reaper
    // ------------------------------------------------------------------

    fn spawn_reaper(&self, expiry: Duration) {
        let interval = (expiry / 5).min(Duration::from_secs(5));
        let weak = self.weak.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let (wake_tx, wake_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(format!("{}-reaper", self.name))
            .spawn(move || {
                while !stop_flag.load(Ordering::SeqCst) {
                    {
                        let Some(pool) = weak.upgrade() else { break };
                        let mut state = pool.state.lock();
                        let keep_sweeping = pool.purge_expired(&mut state);
                        if !keep_sweeping && !stop_flag.load(Ordering::SeqCst) {
                            // Nothing to reap until a check-in; the wait is
                            // bounded so halt and pool drop are observed.
                            let _ = pool.cond.wait_for(&mut state, WORKER_PARK);
                        }
                    }
                    if stop_flag.load(Ordering::SeqCst) {
                        break;
                    }
                    match wake_rx.recv_timeout(interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                }
            })
            .expect("failed to spawn pool reaper thread");

        *self.reaper.lock() = Some(Worker {
            stop,
            wake: Some(wake_tx),
            handle,
        });
    }

    /// Remove and destroy expired free entries. Returns whether the
    /// reaper should keep sweeping (free entries remain or something
    /// was purged).
    fn purge_expired(&self, state: &mut PoolState<F::Item>) -> bool {
        tracing::trace!(pool = %self.name, "checking for expired items");
        let mut purged = 0usize;
        let mut index = 0;
        while index < state.free.len() {
            if state.free[index].is_expired() {
                let entry = state.free.remove(index);
                self.destroy_item(entry.item());
                purged += 1;
            } else {
                index += 1;
            }
        }
        if purged > 0 {
            tracing::debug!(pool = %self.name, purged, "expired idle items");
        }
        !state.free.is_empty() || purged > 0
    }

    fn halt_reaper(&self) {
        let worker = self.reaper.lock().take();
        if let Some(worker) = worker {
            worker.stop.store(true, Ordering::SeqCst);
            // Serialise with a waiting reaper so the notify is not lost
            // between its stop-flag check and its wait.
            drop(self.state.lock());
            self.cond.notify_all();
            Self::halt_worker(worker);
        }
    }

    fn halt_worker(worker: Worker) {
        worker.stop.store(true, Ordering::SeqCst);
        if let Some(wake) = &worker.wake {
            let _ = wake.send(());
        }
        let _ = worker.handle.join();
    }
}

impl<F: ResourceFactory> Drop for Pool<F> {
    fn drop(&mut self) {
        // Detach the workers; their weak back-references are already
        // dead and the bounded parks let them exit on their own.
        for slot in [&self.reaper, &self.initer] {
            if let Some(worker) = slot.lock().take() {
                worker.stop.store(true, Ordering::SeqCst);
                if let Some(wake) = &worker.wake {
                    let _ = wake.send(());
                }
            }
        }
    }
}

impl<F: ResourceFactory> std::fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("free", &state.free.len())
            .field("used", &state.used.len())
            .field("pool_size", &state.pool_size)
            .field("max_size", &state.max_size)
            .field("released", &state.released)
            .finish()
    }
}
