//! Event-loop host adapter for the tempo scheduler.
//!
//! [`EventPump`] implements the scheduler's [`Host`](tempo_scheduler::Host)
//! contract with real time: posted wakes run on a later loop turn (never in
//! the caller's stack), delayed wakes fire off a timer min-heap, and the
//! loop sleeps until the next deadline when nothing is runnable.

pub mod pump;

pub use pump::{EventPump, PumpError};
