use crate::Host;
use crate::queue::{MinQueue, QueueNode};
use crate::task::{Priority, Step, Task, TaskHandle, TaskKey};
use slotmap::SlotMap;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Elapsed slice time after which [`Scheduler::should_yield`] turns true.
const FRAME_BUDGET_MS: u64 = 5;

/// A queue slot. The heaps order these; the slot map holds the task state.
/// In the timer queue `sort_index` is the task's start time, in the task
/// queue its expiration time.
#[derive(Clone, Copy)]
struct QueueEntry {
    sort_index: u64,
    id: u64,
    key: TaskKey,
}

impl QueueNode for QueueEntry {
    fn sort_index(&self) -> u64 {
        self.sort_index
    }

    fn id(&self) -> u64 {
        self.id
    }
}

/// The scheduler engine: two deadline-ordered queues, the single-flight
/// host-wake flags, and the time-sliced work loop.
///
/// An engine is an explicit instance over an injected [`Host`]; several
/// independent schedulers can coexist in one process. All state lives in
/// `Cell`/`RefCell` because units of work are allowed to call back into
/// `submit`/`cancel`/`should_yield` while they execute; no borrow is held
/// across a unit-of-work invocation.
pub struct Scheduler<H: Host> {
    host: H,
    frame_budget: u64,
    tasks: RefCell<SlotMap<TaskKey, Task>>,
    /// Ready tasks, keyed by expiration time.
    task_queue: RefCell<MinQueue<QueueEntry>>,
    /// Future-dated tasks, keyed by start time.
    timer_queue: RefCell<MinQueue<QueueEntry>>,
    next_task_id: Cell<u64>,
    current_priority: Cell<Priority>,
    active_task: Cell<Option<u64>>,
    /// A flush has been requested and has not started yet.
    flush_scheduled: Cell<bool>,
    /// The next wake delivery has a flush to run.
    flush_requested: Cell<bool>,
    /// A wake is in flight with the host.
    wake_loop_running: Cell<bool>,
    performing_work: Cell<bool>,
    delayed_wake_armed: Cell<bool>,
    delayed_wake: RefCell<Option<H::DelayToken>>,
    slice_start: Cell<u64>,
}

impl<H: Host + 'static> Scheduler<H> {
    pub fn new(host: H) -> Rc<Self> {
        Self::with_frame_budget(host, FRAME_BUDGET_MS)
    }

    /// Build a scheduler with a non-default slice budget. Embedders that
    /// target a different frame length (and tests) use this; everything
    /// else wants [`Scheduler::new`].
    pub fn with_frame_budget(host: H, frame_budget_ms: u64) -> Rc<Self> {
        Rc::new(Self {
            host,
            frame_budget: frame_budget_ms,
            tasks: RefCell::new(SlotMap::with_key()),
            task_queue: RefCell::new(MinQueue::new()),
            timer_queue: RefCell::new(MinQueue::new()),
            next_task_id: Cell::new(1),
            current_priority: Cell::new(Priority::Normal),
            active_task: Cell::new(None),
            flush_scheduled: Cell::new(false),
            flush_requested: Cell::new(false),
            wake_loop_running: Cell::new(false),
            performing_work: Cell::new(false),
            delayed_wake_armed: Cell::new(false),
            delayed_wake: RefCell::new(None),
            slice_start: Cell::new(0),
        })
    }

    /// Host clock passthrough, monotonic milliseconds.
    pub fn now(&self) -> u64 {
        self.host.now()
    }

    /// True once the current execution slice has used its frame budget.
    /// In-progress work calls this to decide whether to return a
    /// [`Step::Continue`] instead of finishing synchronously.
    pub fn should_yield(&self) -> bool {
        self.host.now().saturating_sub(self.slice_start.get()) >= self.frame_budget
    }

    /// Priority of the task currently executing, or of the most recent one
    /// outside a flush. Saved and restored around every flush.
    pub fn current_priority(&self) -> Priority {
        self.current_priority.get()
    }

    /// True when neither queue holds a task.
    pub fn is_idle(&self) -> bool {
        self.task_queue.borrow().is_empty() && self.timer_queue.borrow().is_empty()
    }

    /// Submit a unit of work that is ready to run now.
    pub fn submit(
        self: &Rc<Self>,
        priority: Priority,
        work: impl FnOnce(bool) -> Step + 'static,
    ) -> TaskHandle {
        self.submit_delayed(priority, 0, work)
    }

    /// Submit a unit of work that becomes eligible after `delay_ms`.
    pub fn submit_delayed(
        self: &Rc<Self>,
        priority: Priority,
        delay_ms: u64,
        work: impl FnOnce(bool) -> Step + 'static,
    ) -> TaskHandle {
        let current_time = self.host.now();
        let start_time = current_time + delay_ms;
        let expiration_time = start_time.saturating_add_signed(priority.timeout_budget());

        let id = self.next_task_id.get();
        self.next_task_id.set(id + 1);

        let key = self.tasks.borrow_mut().insert(Task {
            id,
            callback: Some(Box::new(work)),
            priority,
            start_time,
            expiration_time,
        });
        tracing::trace!(
            "task {} submitted: priority {:?}, start {}, deadline {}",
            id,
            priority,
            start_time,
            expiration_time
        );

        if start_time > current_time {
            // Future-dated: park it in the timer queue, keyed by start time.
            let is_soonest = {
                let mut timers = self.timer_queue.borrow_mut();
                timers.push(QueueEntry {
                    sort_index: start_time,
                    id,
                    key,
                });
                timers.peek().is_some_and(|entry| entry.id == id)
            };
            if self.task_queue.borrow().is_empty() && is_soonest {
                // Nothing runnable and this is now the soonest timer: the
                // delayed wake must fire at its start time, replacing any
                // wake armed for a later one.
                if self.delayed_wake_armed.get() {
                    self.cancel_delayed_wake();
                } else {
                    self.delayed_wake_armed.set(true);
                }
                self.arm_delayed_wake(start_time - current_time);
            }
        } else {
            // Ready now: into the task queue, keyed by expiration time.
            self.task_queue.borrow_mut().push(QueueEntry {
                sort_index: expiration_time,
                id,
                key,
            });
            if !self.flush_scheduled.get() && !self.performing_work.get() {
                self.flush_scheduled.set(true);
                self.request_wake();
            }
        }

        TaskHandle(key)
    }

    /// Cancel a submitted task. Lazy: the task is marked dead and its queue
    /// entry is discarded the next time it surfaces, never unlinked eagerly.
    /// Cancelling an already-completed task is a no-op.
    pub fn cancel(&self, handle: TaskHandle) {
        if let Some(task) = self.tasks.borrow_mut().get_mut(handle.0) {
            task.callback = None;
            tracing::trace!("task {} cancelled", task.id);
        }
    }

    /// Host-wake entry point: runs one execution slice. Host adapters call
    /// this when a posted wake is delivered; embedders never call it
    /// directly.
    pub fn run_until_yield(self: &Rc<Self>) {
        if !self.flush_requested.get() {
            self.wake_loop_running.set(false);
            return;
        }
        let current_time = self.host.now();
        self.slice_start.set(current_time);
        // The guard re-posts the wake if work remains, and also if the
        // flush unwinds: the failure propagates to the host, but the queue
        // must survive it and get a fresh slice.
        let mut outcome = WakeOutcome {
            scheduler: self,
            has_more: true,
        };
        outcome.has_more = self.flush_work(current_time);
    }

    fn request_wake(self: &Rc<Self>) {
        self.flush_requested.set(true);
        if !self.wake_loop_running.get() {
            self.wake_loop_running.set(true);
            self.post_wake();
        }
    }

    fn post_wake(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        self.host.post(Box::new(move || {
            if let Some(scheduler) = weak.upgrade() {
                scheduler.run_until_yield();
            }
        }));
    }

    fn arm_delayed_wake(self: &Rc<Self>, delay_ms: u64) {
        let weak = Rc::downgrade(self);
        let token = self.host.post_delayed(
            delay_ms,
            Box::new(move |current_time| {
                if let Some(scheduler) = weak.upgrade() {
                    scheduler.handle_delayed_wake(current_time);
                }
            }),
        );
        *self.delayed_wake.borrow_mut() = Some(token);
        tracing::trace!("delayed wake armed for {} ms", delay_ms);
    }

    fn cancel_delayed_wake(&self) {
        if let Some(token) = self.delayed_wake.borrow_mut().take() {
            self.host.cancel_delayed(token);
        }
    }

    /// Delayed-wake entry point: migrate ready timers, then either start a
    /// flush or re-arm for the soonest remaining timer.
    fn handle_delayed_wake(self: &Rc<Self>, current_time: u64) {
        self.delayed_wake_armed.set(false);
        // The token just fired; cancelling it later would be a no-op.
        self.delayed_wake.borrow_mut().take();
        self.advance_timers(current_time);

        if self.flush_scheduled.get() {
            return;
        }
        if !self.task_queue.borrow().is_empty() {
            self.flush_scheduled.set(true);
            self.request_wake();
        } else {
            let next_delay = self
                .timer_queue
                .borrow()
                .peek()
                .map(|first| first.sort_index.saturating_sub(current_time));
            if let Some(delay) = next_delay {
                self.arm_delayed_wake(delay);
            }
        }
    }

    /// One flush: clear the request flags, run the work loop, and restore
    /// the engine state on every exit path, unwinding included.
    fn flush_work(self: &Rc<Self>, initial_time: u64) -> bool {
        self.flush_scheduled.set(false);
        if self.delayed_wake_armed.get() {
            // A flush supersedes the pending delayed wake; the work loop
            // re-arms one if only future-dated timers remain.
            self.delayed_wake_armed.set(false);
            self.cancel_delayed_wake();
        }

        self.performing_work.set(true);
        let _guard = FlushGuard {
            scheduler: self,
            previous_priority: self.current_priority.get(),
        };
        self.work_loop(initial_time)
    }

    /// Drain ready work in deadline order until the queue empties or the
    /// slice budget forces a yield. Returns true if work remains.
    fn work_loop(self: &Rc<Self>, initial_time: u64) -> bool {
        let mut current_time = initial_time;
        self.advance_timers(current_time);

        loop {
            let Some(entry) = self.task_queue.borrow().peek().copied() else {
                break;
            };
            let root = self
                .tasks
                .borrow()
                .get(entry.key)
                .map(|task| (task.priority, task.expiration_time));
            let Some((priority, expiration_time)) = root else {
                // Entry outlived its task; discard it like any dead root.
                self.task_queue.borrow_mut().pop();
                continue;
            };

            // The slice check comes before the dead-root check: a yield is
            // reported even when the root turns out to be cancelled.
            if expiration_time > current_time && self.should_yield() {
                return true;
            }

            let callback = self
                .tasks
                .borrow_mut()
                .get_mut(entry.key)
                .and_then(|task| task.callback.take());
            let Some(callback) = callback else {
                self.task_queue.borrow_mut().pop();
                self.tasks.borrow_mut().remove(entry.key);
                continue;
            };

            // The callback is already cleared, so a reentrant cancel or
            // resubmission never sees a stale one on this task. No borrow
            // is held across the invocation.
            self.current_priority.set(priority);
            self.active_task.set(Some(entry.id));
            let overdue = expiration_time <= current_time;
            tracing::trace!("task {} executing, overdue: {}", entry.id, overdue);
            let step = callback(overdue);
            current_time = self.host.now();

            match step {
                Step::Continue(next) => {
                    // Unfinished: the task keeps its queue slot and deadline
                    // and resumes with the continuation on a later pass.
                    if let Some(task) = self.tasks.borrow_mut().get_mut(entry.key) {
                        task.callback = Some(next);
                    }
                }
                Step::Done => {
                    // A higher-priority arrival may have taken the root
                    // during the invocation; it must not be evicted. The
                    // finished task's entry is then discarded lazily when
                    // it surfaces again.
                    let still_root = self
                        .task_queue
                        .borrow()
                        .peek()
                        .is_some_and(|root| root.id == entry.id);
                    if still_root {
                        self.task_queue.borrow_mut().pop();
                        self.tasks.borrow_mut().remove(entry.key);
                    }
                }
            }
            self.active_task.set(None);

            // Time advanced during execution; newly ready timers migrate
            // before the next pick.
            self.advance_timers(current_time);
        }

        // Task queue is drained. If timers remain, wake up when the
        // soonest one becomes ready.
        let next_delay = self
            .timer_queue
            .borrow()
            .peek()
            .map(|first| first.sort_index.saturating_sub(current_time));
        if let Some(delay) = next_delay {
            self.arm_delayed_wake(delay);
        }
        false
    }

    /// Move every timer whose start time has passed into the task queue,
    /// re-keyed by expiration time. Dead timers are discarded on the way.
    fn advance_timers(&self, current_time: u64) {
        loop {
            let Some(entry) = self.timer_queue.borrow().peek().copied() else {
                return;
            };
            let promotion = {
                let tasks = self.tasks.borrow();
                match tasks.get(entry.key) {
                    Some(task) if task.callback.is_none() => None,
                    Some(task) if task.start_time <= current_time => Some(task.expiration_time),
                    // The root is the soonest timer; nothing further is ready.
                    Some(_) => return,
                    None => None,
                }
            };
            self.timer_queue.borrow_mut().pop();
            match promotion {
                Some(expiration_time) => {
                    self.task_queue.borrow_mut().push(QueueEntry {
                        sort_index: expiration_time,
                        id: entry.id,
                        key: entry.key,
                    });
                    tracing::trace!("task {} ready, moved to task queue", entry.id);
                }
                None => {
                    self.tasks.borrow_mut().remove(entry.key);
                }
            }
        }
    }
}

/// Restores flush invariants on every exit path, a panicking unit of work
/// included: active task cleared, prior priority restored, performing-work
/// lowered.
struct FlushGuard<'a, H: Host> {
    scheduler: &'a Scheduler<H>,
    previous_priority: Priority,
}

impl<H: Host> Drop for FlushGuard<'_, H> {
    fn drop(&mut self) {
        // Still set here means the flush is unwinding out of a unit of
        // work; on a normal exit the loop already cleared it.
        if let Some(id) = self.scheduler.active_task.take() {
            tracing::debug!("task {} terminated abnormally", id);
        }
        self.scheduler.current_priority.set(self.previous_priority);
        self.scheduler.performing_work.set(false);
    }
}

/// Settles a wake delivery: re-posts the wake while work remains (or when
/// the flush unwound), otherwise marks the wake cycle idle.
struct WakeOutcome<'a, H: Host + 'static> {
    scheduler: &'a Rc<Scheduler<H>>,
    has_more: bool,
}

impl<H: Host + 'static> Drop for WakeOutcome<'_, H> {
    fn drop(&mut self) {
        if self.has_more {
            self.scheduler.post_wake();
        } else {
            self.scheduler.wake_loop_running.set(false);
            self.scheduler.flush_requested.set(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::VirtualHost;

    #[test]
    fn expiration_adds_priority_budget_to_start_time() {
        let host = VirtualHost::new();
        host.advance(1_000);
        let scheduler = Scheduler::new(host.clone());

        let handle = scheduler.submit(Priority::UserBlocking, |_| Step::Done);

        let tasks = scheduler.tasks.borrow();
        let task = tasks.get(handle.0).expect("task should be stored");
        assert_eq!(task.start_time, 1_000);
        assert_eq!(task.expiration_time, 1_250);
    }

    #[test]
    fn immediate_priority_is_born_overdue() {
        let host = VirtualHost::new();
        host.advance(1_000);
        let scheduler = Scheduler::new(host.clone());

        let handle = scheduler.submit(Priority::Immediate, |_| Step::Done);

        let tasks = scheduler.tasks.borrow();
        let task = tasks.get(handle.0).expect("task should be stored");
        assert_eq!(task.expiration_time, 999);
        assert!(task.expiration_time <= host.now());
    }

    #[test]
    fn immediate_expiration_saturates_at_time_zero() {
        let host = VirtualHost::new();
        let scheduler = Scheduler::new(host.clone());

        let handle = scheduler.submit(Priority::Immediate, |_| Step::Done);

        let tasks = scheduler.tasks.borrow();
        let task = tasks.get(handle.0).expect("task should be stored");
        assert_eq!(task.expiration_time, 0);
        assert!(task.expiration_time <= host.now());
    }

    #[test]
    fn deferred_task_is_keyed_by_start_then_expiration() {
        let host = VirtualHost::new();
        let scheduler = Scheduler::new(host.clone());

        scheduler.submit_delayed(Priority::Normal, 100, |_| Step::Done);

        assert_eq!(
            scheduler.timer_queue.borrow().peek().map(|e| e.sort_index),
            Some(100)
        );
        assert!(scheduler.task_queue.borrow().is_empty());

        // The delayed wake fires and migrates the timer; inspect the queue
        // before the posted flush consumes it.
        host.advance(150);
        assert_eq!(
            scheduler.task_queue.borrow().peek().map(|e| e.sort_index),
            Some(5_100)
        );
        assert!(scheduler.timer_queue.borrow().is_empty());
    }

    #[test]
    fn flush_restores_prior_priority() {
        let host = VirtualHost::new();
        let scheduler = Scheduler::new(host.clone());

        let inner = scheduler.clone();
        let observed = Rc::new(Cell::new(Priority::Normal));
        let seen = observed.clone();
        scheduler.submit(Priority::UserBlocking, move |_| {
            seen.set(inner.current_priority());
            Step::Done
        });
        host.run_posted();

        assert_eq!(observed.get(), Priority::UserBlocking);
        assert_eq!(scheduler.current_priority(), Priority::Normal);
    }
}
