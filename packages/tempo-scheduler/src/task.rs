use slotmap::new_key_type;

new_key_type! {
    pub(crate) struct TaskKey;
}

/// Opaque handle returned by task submission. It is only good for asking
/// the scheduler that created it to cancel the task; the scheduler keeps
/// ownership of the task itself for its entire lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle(pub(crate) TaskKey);

/// A unit of schedulable work. The argument is true when the task is past
/// its deadline, so the work can decide to rush to completion instead of
/// checking [`Scheduler::should_yield`](crate::Scheduler::should_yield).
pub type WorkFn = Box<dyn FnOnce(bool) -> Step>;

/// What a unit of work hands back to the scheduler.
pub enum Step {
    /// The task is finished and leaves the queue.
    Done,
    /// The task is not finished: store this continuation and re-invoke it
    /// on a later pass. The task keeps its queue position and deadline.
    Continue(WorkFn),
}

/// Priority levels, in decreasing urgency. Each maps to a fixed deadline
/// budget added to the task's start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Immediate,
    UserBlocking,
    #[default]
    Normal,
    Low,
    Idle,
}

const MAX_SIGNED_31_BIT: i64 = 1_073_741_823;

impl Priority {
    /// Deadline budget in milliseconds. Immediate is born overdue; Idle is
    /// effectively unbounded (max signed 31-bit).
    pub fn timeout_budget(self) -> i64 {
        match self {
            Priority::Immediate => -1,
            Priority::UserBlocking => 250,
            Priority::Normal => 5_000,
            Priority::Low => 10_000,
            Priority::Idle => MAX_SIGNED_31_BIT,
        }
    }
}

pub(crate) struct Task {
    /// Assigned in submission order, never reused. Breaks deadline ties.
    pub id: u64,
    /// `None` marks the task dead: cancelled, mid-execution, or completed.
    /// Dead entries are skipped lazily when they surface at a queue root.
    pub callback: Option<WorkFn>,
    pub priority: Priority,
    /// Absolute time at which the task becomes eligible to run.
    pub start_time: u64,
    /// Absolute deadline: `start_time + timeout_budget(priority)`.
    pub expiration_time: u64,
}
