use rustc_hash::FxHashSet;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};
use tempo_scheduler::Host;
use thiserror::Error;

/// Errors surfaced by [`EventPump::run_until_idle`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PumpError {
    /// The pump is already servicing callbacks further up this stack.
    #[error("event pump is already running")]
    AlreadyRunning,
}

struct PumpTimer {
    due: u64,
    token: u64,
    wake: Box<dyn FnOnce(u64)>,
}

impl PartialEq for PumpTimer {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.token == other.token
    }
}

impl Eq for PumpTimer {}

impl Ord for PumpTimer {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap behavior: earliest deadline first,
        // arming order among equal deadlines.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.token.cmp(&self.token))
    }
}

impl PartialOrd for PumpTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

enum Turn {
    Fire(Box<dyn FnOnce(u64)>),
    Sleep(u64),
    Empty,
}

/// A single-threaded event loop implementing the scheduler's [`Host`]
/// contract with real time.
///
/// Posted wakes land in a deferred queue and run on a later loop turn,
/// which is what gives the scheduler its yield points. Delayed wakes sit
/// in a timer min-heap; cancellation drops a tombstone instead of
/// searching the heap, and tombstoned timers are discarded when they
/// surface, the same lazy rule the scheduler applies to its own queues.
/// Clones share the same pump: hand one clone to the scheduler, keep
/// another to drive the loop.
#[derive(Clone)]
pub struct EventPump {
    inner: Rc<PumpInner>,
}

struct PumpInner {
    origin: Instant,
    ready: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    timers: RefCell<BinaryHeap<PumpTimer>>,
    cancelled: RefCell<FxHashSet<u64>>,
    next_token: Cell<u64>,
    running: Cell<bool>,
}

impl EventPump {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(PumpInner {
                origin: Instant::now(),
                ready: RefCell::new(VecDeque::new()),
                timers: RefCell::new(BinaryHeap::new()),
                cancelled: RefCell::new(FxHashSet::default()),
                next_token: Cell::new(0),
                running: Cell::new(false),
            }),
        }
    }

    /// Service the loop until no wake is queued and no timer is armed.
    ///
    /// Each turn runs one posted wake; when the queue is empty the next
    /// due timer fires, and when no timer is due yet the thread sleeps
    /// until the soonest deadline. Calling this from inside a serviced
    /// wake is refused. A panicking wake propagates to the caller; the
    /// pump itself stays usable afterwards.
    pub fn run_until_idle(&self) -> Result<(), PumpError> {
        if self.inner.running.replace(true) {
            return Err(PumpError::AlreadyRunning);
        }
        let _guard = RunGuard { pump: &self.inner };
        tracing::debug!("event pump running");

        loop {
            let wake = self.inner.ready.borrow_mut().pop_front();
            if let Some(wake) = wake {
                wake();
                continue;
            }
            match self.next_turn() {
                Turn::Fire(wake) => wake(self.now()),
                Turn::Sleep(ms) => thread::sleep(Duration::from_millis(ms)),
                Turn::Empty => break,
            }
        }

        tracing::debug!("event pump idle");
        Ok(())
    }

    /// What the loop should do now that the ready queue is empty: fire the
    /// next due timer, sleep until the soonest deadline, or stop.
    /// Tombstoned timers are discarded on the way to the root.
    fn next_turn(&self) -> Turn {
        let mut timers = self.inner.timers.borrow_mut();
        let mut cancelled = self.inner.cancelled.borrow_mut();
        loop {
            let Some(timer) = timers.peek() else {
                return Turn::Empty;
            };
            if cancelled.remove(&timer.token) {
                timers.pop();
                continue;
            }
            let now = self.now();
            if timer.due <= now {
                let timer = timers.pop().unwrap();
                return Turn::Fire(timer.wake);
            }
            return Turn::Sleep(timer.due - now);
        }
    }
}

impl Default for EventPump {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for EventPump {
    type DelayToken = u64;

    fn now(&self) -> u64 {
        self.inner.origin.elapsed().as_millis() as u64
    }

    fn post(&self, wake: Box<dyn FnOnce()>) {
        self.inner.ready.borrow_mut().push_back(wake);
    }

    fn post_delayed(&self, delay_ms: u64, wake: Box<dyn FnOnce(u64)>) -> u64 {
        let token = self.inner.next_token.get();
        self.inner.next_token.set(token + 1);
        let due = self.now() + delay_ms;
        self.inner
            .timers
            .borrow_mut()
            .push(PumpTimer { due, token, wake });
        token
    }

    fn cancel_delayed(&self, token: u64) {
        self.inner.cancelled.borrow_mut().insert(token);
    }
}

/// Lowers the running flag on every exit path, so a panicking wake leaves
/// the pump reusable.
struct RunGuard<'a> {
    pump: &'a PumpInner,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.pump.running.set(false);
    }
}
