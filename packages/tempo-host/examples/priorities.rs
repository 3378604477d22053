//! Submit work at two priorities and watch deadline order beat
//! submission order.
//!
//! ```sh
//! cargo run -p tempo-host --example priorities
//! ```

use tempo_host::{EventPump, PumpError};
use tempo_scheduler::{Priority, Scheduler, Step};

fn main() -> Result<(), PumpError> {
    tracing_subscriber::fmt::init();

    let pump = EventPump::new();
    let scheduler = Scheduler::new(pump.clone());

    scheduler.submit(Priority::UserBlocking, |_| {
        println!("user-blocking work");
        Step::Done
    });
    scheduler.submit(Priority::Immediate, |_| {
        // Submitted second, but its deadline is already behind it, so it
        // runs first.
        println!("immediate work");
        Step::Done
    });
    scheduler.submit_delayed(Priority::Normal, 50, |overdue| {
        println!("deferred work (overdue: {overdue})");
        Step::Done
    });

    pump.run_until_idle()
}
