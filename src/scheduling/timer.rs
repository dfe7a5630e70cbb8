//! Deadline-driven timer service.
//!
//! This module provides `TimerService`, a manager for one-shot and repeating
//! callbacks. Callers schedule work with a delay; a single coordinator
//! thread per service drains due timers in deadline order, then sleeps until
//! the next deadline or until a scheduling change posts a wakeup through a
//! coalescing `Signal`. There is no periodic tick: the coordinator wakes at
//! most once per scheduling change plus once per elapsed deadline.

use std::collections::HashMap;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::sync::signal::Signal;
use crate::TempusError;

use super::heap::IndexedHeap;
use super::Deadlined;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds elapsed since the crate's monotonic epoch (the first clock
/// read in this process). All deadlines in this module live on this scale.
pub fn now_nanos() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

fn due_after(delay: Duration) -> u64 {
    now_nanos() + delay.as_nanos() as u64
}

/// A scheduled unit of work. The context travels inside the closure, so the
/// callback/context pair stays fully typed end to end.
pub type Job = Arc<dyn Fn() + Send + Sync + 'static>;

/// Firing policy: how the coordinator hands off a due timer's work.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, job: Job);
}

/// Runs each callback directly on the coordinator thread. A callback that
/// blocks here delays every later timer on the same service.
pub struct InlineDispatch;

impl Dispatch for InlineDispatch {
    fn dispatch(&self, job: Job) {
        job();
    }
}

/// Spawns a thread per firing, so a slow callback never holds up the
/// coordinator or other timers.
pub struct SpawnDispatch;

impl Dispatch for SpawnDispatch {
    fn dispatch(&self, job: Job) {
        thread::spawn(move || job());
    }
}

struct TimerCore {
    id: u64,
    due_ns: AtomicU64,
    period_ns: AtomicU64,
    repeating: bool,
    cancelled: AtomicBool,
    job: Job,
    owner: Weak<ServiceInner>,
}

impl Deadlined for Arc<TimerCore> {
    fn key(&self) -> u64 {
        self.id
    }
    fn due_at(&self) -> u64 {
        self.due_ns.load(Acquire)
    }
}

/// Cloneable handle to one scheduled timer.
///
/// The handle holds only a weak route back to its service: keeping a handle
/// alive never keeps the service alive.
#[derive(Clone)]
pub struct TimerHandle {
    core: Arc<TimerCore>,
}

impl TimerHandle {
    /// The service-unique id assigned at scheduling time.
    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.cancelled.load(Acquire)
    }

    /// Cancels the timer. The flag is raised before the heap entry is
    /// removed, so a firing racing with this call observes the cancellation
    /// no later than its pre-dispatch check.
    ///
    /// Always reports true, even when the timer already fired or was already
    /// stopped; the return value cannot distinguish those histories.
    pub fn stop(&self) -> bool {
        self.core.cancelled.store(true, Release);
        if let Some(owner) = self.core.owner.upgrade() {
            owner.remove_timer(self.core.id);
        }
        true
    }

    /// Reschedules the timer to fire `delay` from now. On a repeating timer
    /// this also rewrites the period: every subsequent interval becomes
    /// `delay`.
    ///
    /// Returns false without effect when the timer is already cancelled, or
    /// when its service has been torn down.
    pub fn reset(&self, delay: Duration) -> bool {
        if self.core.cancelled.load(Acquire) {
            return false;
        }
        let owner = match self.core.owner.upgrade() {
            Some(owner) => owner,
            None => return false,
        };
        owner.remove_timer(self.core.id);
        self.core.due_ns.store(due_after(delay), Release);
        self.core.period_ns.store(delay.as_nanos() as u64, Release);
        owner.insert(Arc::clone(&self.core));
        true
    }
}

/// Heap and id index, always mutated together under one lock.
struct SchedState {
    heap: IndexedHeap<Arc<TimerCore>>,
    index: HashMap<u64, Arc<TimerCore>>,
}

struct ServiceInner {
    state: Mutex<SchedState>,
    wake: Signal,
    next_id: AtomicU64,
    shutdown: AtomicBool,
    dispatch: Box<dyn Dispatch>,
}

impl ServiceInner {
    /// Inserts a timer, or repositions it when it is already pending (a
    /// firing's re-arm can race a reset); either way the timer ends up in
    /// exactly one heap slot and the coordinator is woken.
    fn insert(&self, timer: Arc<TimerCore>) {
        let mut state = self.state.lock().unwrap();
        if state.index.contains_key(&timer.id) {
            state.heap.fix(timer.id);
        } else {
            state.index.insert(timer.id, Arc::clone(&timer));
            state
                .heap
                .push(timer)
                .expect("heap holds a key the index does not, indicates a bug");
        }
        drop(state);
        self.wake.notify();
    }

    fn remove_timer(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        if state.index.remove(&id).is_some() {
            state.heap.remove(id);
        }
    }

    /// Pops the minimum timer if it is due at `now`, dropping it from the
    /// index in the same critical section.
    fn take_due(&self, now: u64) -> Option<Arc<TimerCore>> {
        let mut state = self.state.lock().unwrap();
        if state.heap.peek()?.due_at() > now {
            return None;
        }
        let timer = state.heap.pop()?;
        state.index.remove(&timer.id);
        Some(timer)
    }

    fn next_due(&self) -> Option<u64> {
        let state = self.state.lock().unwrap();
        state.heap.peek().map(|timer| timer.due_at())
    }

    /// Fires one timer. The state lock is NOT held here: the callback may
    /// freely stop or reset timers on this service, including this one.
    fn fire(&self, timer: &Arc<TimerCore>) {
        if timer.cancelled.load(Acquire) {
            return;
        }
        self.dispatch.dispatch(Arc::clone(&timer.job));
        if timer.repeating && !timer.cancelled.load(Acquire) {
            // advance from the scheduled deadline, not from now: repeats do
            // not drift with firing latency
            timer
                .due_ns
                .fetch_add(timer.period_ns.load(Relaxed), AcqRel);
            self.insert(Arc::clone(timer));
        }
    }
}

/// Coordinator loop: wait for a wakeup or the armed deadline, drain every
/// due timer in deadline order, re-arm for the new minimum.
fn run(inner: Arc<ServiceInner>) {
    let mut armed: Option<u64> = None;
    loop {
        match armed {
            Some(due_ns) => {
                let remaining = due_ns.saturating_sub(now_nanos());
                inner.wake.wait_timeout(Duration::from_nanos(remaining));
            }
            None => inner.wake.wait(),
        }
        if inner.shutdown.load(Acquire) {
            return;
        }
        let now = now_nanos();
        while let Some(timer) = inner.take_due(now) {
            inner.fire(&timer);
        }
        armed = inner.next_due();
    }
}

/// Deadline scheduler for one-shot and repeating callbacks.
///
/// Each service owns exactly one coordinator thread, started at
/// construction and joined at teardown. Scheduling, stopping, and resetting
/// may be called from any thread; callbacks run wherever the service's
/// `Dispatch` policy puts them (on the coordinator thread under the default
/// `InlineDispatch`), never on the caller's thread. Dropping the service
/// shuts the coordinator down; pending timers that have not fired by then
/// are discarded.
pub struct TimerService {
    inner: Arc<ServiceInner>,
    coordinator: Option<JoinHandle<()>>,
}

impl Default for TimerService {
    fn default() -> Self {
        TimerService::new()
    }
}

impl TimerService {
    /// Creates a service firing callbacks inline on the coordinator thread.
    pub fn new() -> Self {
        Self::with_dispatch(InlineDispatch)
    }

    /// Creates a service with an explicit firing policy.
    pub fn with_dispatch<D: Dispatch + 'static>(dispatch: D) -> Self {
        let inner = Arc::new(ServiceInner {
            state: Mutex::new(SchedState {
                heap: IndexedHeap::new(),
                index: HashMap::new(),
            }),
            wake: Signal::new(),
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            dispatch: Box::new(dispatch),
        });
        let worker = Arc::clone(&inner);
        let coordinator = thread::Builder::new()
            .name("tempus-coordinator".into())
            .spawn(move || run(worker))
            .expect("failed to spawn coordinator thread");
        Self {
            inner,
            coordinator: Some(coordinator),
        }
    }

    /// Schedules `callback(&context)` to run once, `delay` from now.
    ///
    /// A zero delay means "due immediately", but the callback still goes
    /// through the normal insert/wake/drain path so it runs on the
    /// dispatcher's execution context, never the caller's.
    pub fn once_timer<C, F>(&self, delay: Duration, context: C, callback: F) -> TimerHandle
    where
        C: Send + Sync + 'static,
        F: Fn(&C) + Send + Sync + 'static,
    {
        self.schedule(delay, false, Arc::new(move || callback(&context)))
    }

    /// Schedules `callback(&context)` to run every `interval`, first firing
    /// one interval from now. Repeats are re-armed from the scheduled
    /// deadline, so the cadence does not drift with firing latency.
    ///
    /// A zero interval is accepted but re-arms as due immediately, which
    /// keeps the coordinator draining continuously.
    pub fn repeat_timer<C, F>(&self, interval: Duration, context: C, callback: F) -> TimerHandle
    where
        C: Send + Sync + 'static,
        F: Fn(&C) + Send + Sync + 'static,
    {
        self.schedule(interval, true, Arc::new(move || callback(&context)))
    }

    fn schedule(&self, delay: Duration, repeating: bool, job: Job) -> TimerHandle {
        let core = Arc::new(TimerCore {
            id: self.inner.next_id.fetch_add(1, Relaxed),
            due_ns: AtomicU64::new(due_after(delay)),
            period_ns: AtomicU64::new(delay.as_nanos() as u64),
            repeating,
            cancelled: AtomicBool::new(false),
            job,
            owner: Arc::downgrade(&self.inner),
        });
        self.inner.insert(Arc::clone(&core));
        TimerHandle { core }
    }

    /// Number of timers currently pending (scheduled, not yet fired or
    /// stopped).
    pub fn pending(&self) -> usize {
        self.inner.state.lock().unwrap().heap.len()
    }

    /// Stops the coordinator and joins it. Pending timers are discarded.
    pub fn shutdown(mut self) -> Result<(), TempusError> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<(), TempusError> {
        let coordinator = match self.coordinator.take() {
            Some(coordinator) => coordinator,
            None => return Ok(()),
        };
        self.inner.shutdown.store(true, Release);
        self.inner.wake.notify();
        coordinator.join().map_err(|_| TempusError::Terminated)
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}


#[cfg(test)]
mod timer_stress_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Barrier, Mutex};

    #[test]
    fn concurrent_registration_keeps_per_thread_deadline_order() {
        const THREADS: usize = 4;
        const PER_THREAD: u64 = 25;

        let svc = Arc::new(TimerService::new());
        let order: Arc<Mutex<Vec<(usize, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let barrier = Arc::new(Barrier::new(THREADS));
        let mut workers = Vec::new();

        for thread_id in 0..THREADS {
            let svc = Arc::clone(&svc);
            let order = Arc::clone(&order);
            let barrier = Arc::clone(&barrier);
            workers.push(thread::spawn(move || {
                barrier.wait();
                for i in 0..PER_THREAD {
                    // strictly ascending deadlines within each thread, with
                    // enough spacing to dominate registration jitter
                    let delay = Duration::from_millis(150 + 5 * i);
                    svc.once_timer(
                        delay,
                        (Arc::clone(&order), thread_id, i),
                        |(order, thread_id, i): &(
                            Arc<Mutex<Vec<(usize, u64)>>>,
                            usize,
                            u64,
                        )| {
                            order.lock().unwrap().push((*thread_id, *i));
                        },
                    );
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }

        thread::sleep(Duration::from_millis(800));

        let fired = order.lock().unwrap();
        assert_eq!(fired.len(), THREADS * PER_THREAD as usize);
        assert_eq!(svc.pending(), 0);

        for thread_id in 0..THREADS {
            let seen: Vec<u64> = fired
                .iter()
                .filter(|(t, _)| *t == thread_id)
                .map(|(_, i)| *i)
                .collect();
            let mut sorted = seen.clone();
            sorted.sort_unstable();
            assert_eq!(seen, sorted, "thread {thread_id} fired out of order");
        }
    }

    #[test]
    fn stops_racing_registration_suppress_exactly_their_targets() {
        const TOTAL: usize = 100;

        let svc = TimerService::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(TOTAL);

        for _ in 0..TOTAL {
            handles.push(svc.once_timer(
                Duration::from_millis(80),
                Arc::clone(&hits),
                |hits: &Arc<AtomicUsize>| {
                    hits.fetch_add(1, Ordering::SeqCst);
                },
            ));
        }

        // cancel every second timer well before the shared deadline
        for handle in handles.iter().step_by(2) {
            assert!(handle.stop());
        }

        thread::sleep(Duration::from_millis(400));
        assert_eq!(hits.load(Ordering::SeqCst), TOTAL / 2);
        assert_eq!(svc.pending(), 0);
    }
}
