use std::cell::RefCell;
use std::rc::Rc;
use tempo_scheduler::{Priority, Scheduler, Step, VirtualHost};

#[test]
fn earlier_deadline_runs_first_despite_later_submission() {
    let host = VirtualHost::new();
    let scheduler = Scheduler::new(host.clone());
    let log = Rc::new(RefCell::new(Vec::new()));

    {
        let log = log.clone();
        scheduler.submit(Priority::Normal, move |_| {
            log.borrow_mut().push("normal");
            Step::Done
        });
    }
    {
        let log = log.clone();
        scheduler.submit(Priority::Immediate, move |_| {
            log.borrow_mut().push("immediate");
            Step::Done
        });
    }

    host.run_posted();
    assert_eq!(*log.borrow(), vec!["immediate", "normal"]);
    assert!(scheduler.is_idle());
}

#[test]
fn equal_deadlines_run_in_submission_order() {
    let host = VirtualHost::new();
    let scheduler = Scheduler::new(host.clone());
    let log = Rc::new(RefCell::new(Vec::new()));

    for label in ["first", "second", "third"] {
        let log = log.clone();
        scheduler.submit(Priority::Normal, move |_| {
            log.borrow_mut().push(label);
            Step::Done
        });
    }

    host.run_posted();
    assert_eq!(*log.borrow(), vec!["first", "second", "third"]);
}

#[test]
fn mixed_priorities_order_by_expiration() {
    let host = VirtualHost::new();
    let scheduler = Scheduler::new(host.clone());
    let log = Rc::new(RefCell::new(Vec::new()));

    let submissions = [
        ("idle", Priority::Idle),
        ("low", Priority::Low),
        ("user-blocking", Priority::UserBlocking),
        ("normal", Priority::Normal),
        ("immediate", Priority::Immediate),
    ];
    for (label, priority) in submissions {
        let log = log.clone();
        scheduler.submit(priority, move |_| {
            log.borrow_mut().push(label);
            Step::Done
        });
    }

    host.run_posted();
    assert_eq!(
        *log.borrow(),
        vec!["immediate", "user-blocking", "normal", "low", "idle"]
    );
}

#[test]
fn overdue_flag_reflects_deadline() {
    let host = VirtualHost::new();
    let scheduler = Scheduler::new(host.clone());
    let log = Rc::new(RefCell::new(Vec::new()));

    {
        let log = log.clone();
        scheduler.submit(Priority::Immediate, move |overdue| {
            log.borrow_mut().push(("immediate", overdue));
            Step::Done
        });
    }
    {
        let log = log.clone();
        scheduler.submit(Priority::Normal, move |overdue| {
            log.borrow_mut().push(("normal", overdue));
            Step::Done
        });
    }

    host.run_posted();
    assert_eq!(
        *log.borrow(),
        vec![("immediate", true), ("normal", false)]
    );
}

#[test]
fn reentrant_submission_joins_the_current_flush() {
    let host = VirtualHost::new();
    let scheduler = Scheduler::new(host.clone());
    let log = Rc::new(RefCell::new(Vec::new()));

    {
        let log = log.clone();
        let inner = scheduler.clone();
        scheduler.submit(Priority::Normal, move |_| {
            log.borrow_mut().push("parent");
            let log = log.clone();
            inner.submit(Priority::Immediate, move |_| {
                log.borrow_mut().push("child");
                Step::Done
            });
            Step::Done
        });
    }

    // One wake: the child is picked up by the same flush that ran the
    // parent, without a second round trip through the host.
    assert_eq!(host.run_posted(), 1);
    assert_eq!(*log.borrow(), vec!["parent", "child"]);
}

#[test]
fn displaced_root_is_not_evicted_by_a_finished_task() {
    let host = VirtualHost::new();
    let scheduler = Scheduler::new(host.clone());
    let log = Rc::new(RefCell::new(Vec::new()));

    {
        let log = log.clone();
        let inner = scheduler.clone();
        scheduler.submit(Priority::Normal, move |_| {
            // The immediate arrival takes the root position while this
            // task is still executing; finishing must not pop it.
            let log2 = log.clone();
            inner.submit(Priority::Immediate, move |_| {
                log2.borrow_mut().push("immediate");
                Step::Done
            });
            log.borrow_mut().push("normal");
            Step::Done
        });
    }

    host.run_posted();
    assert_eq!(*log.borrow(), vec!["normal", "immediate"]);
    // The displaced finished task's stale entry is discarded lazily and
    // the queues drain completely.
    assert!(scheduler.is_idle());
}
