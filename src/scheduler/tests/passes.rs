use super::util::*;
use super::*;

#[test]
fn runs_until_exhausted() {
    trace_init();
    let scheduler = scheduler();
    let (task, runs) = counted(100, 3);
    scheduler.add_task(task).unwrap();
    task.enable();

    for now in [0, 100, 200, 300] {
        set_time(now);
        scheduler.execute();
    }

    assert_eq!(runs.load(SeqCst), 3);
    assert_eq!(task.run_counter(), 3);
    assert!(!task.is_enabled());
}

#[test]
fn first_run_waits_a_full_interval() {
    let scheduler = scheduler();
    let (task, runs) = counted(100, Task::FOREVER);
    scheduler.add_task(task).unwrap();

    set_time(30);
    task.enable();
    scheduler.execute();
    set_time(129);
    scheduler.execute();
    assert_eq!(runs.load(SeqCst), 0);

    set_time(130);
    scheduler.execute();
    assert_eq!(runs.load(SeqCst), 1);
}

#[test]
fn zero_interval_runs_every_pass() {
    let scheduler = scheduler();
    let (task, runs) = counted(0, Task::FOREVER);
    scheduler.add_task(task).unwrap();
    task.enable();

    for _ in 0..5 {
        scheduler.execute();
    }
    assert_eq!(runs.load(SeqCst), 5);
}

#[test]
fn exhausted_task_is_disabled_by_pass() {
    trace_init();
    let scheduler = scheduler();
    let disables = counter();
    let task = task(10, 0);
    task.set_callbacks(leak(Callbacks::new().on_disable(counting(disables))));
    scheduler.add_task(task).unwrap();
    task.enable();

    set_time(10);
    let pass = scheduler.execute();
    assert!(!task.is_enabled());
    assert_eq!(disables.load(SeqCst), 1);
    assert_eq!(pass.ran, 0);
}

#[test]
fn restart_delayed_after_exhaustion() {
    let scheduler = scheduler();
    let (task, runs) = counted(100, 1);
    scheduler.add_task(task).unwrap();
    task.enable();

    set_time(100);
    scheduler.execute();
    assert!(!task.is_enabled());

    set_time(1000);
    task.restart_delayed(50);
    assert!(task.is_enabled());

    set_time(1149);
    scheduler.execute();
    assert_eq!(runs.load(SeqCst), 1);

    set_time(1150);
    scheduler.execute();
    assert_eq!(runs.load(SeqCst), 2);
    assert_eq!(task.run_counter(), 1);
}

#[test]
fn tick_counter_wraparound() {
    let scheduler = scheduler();
    let (task, runs) = counted(100, Task::FOREVER);
    scheduler.add_task(task).unwrap();

    set_time(Ticks::MAX - 49);
    task.enable();

    set_time(49);
    scheduler.execute();
    assert_eq!(runs.load(SeqCst), 0);

    set_time(50);
    scheduler.execute();
    assert_eq!(runs.load(SeqCst), 1);
}

#[test]
fn tasks_run_in_registration_order() {
    let scheduler = scheduler();
    let order: &'static std::sync::Mutex<Vec<usize>> = leak(std::sync::Mutex::new(Vec::new()));
    for i in 0..3 {
        let task = task(10, 1);
        let push = leak(move || order.lock().unwrap().push(i));
        task.set_callbacks(leak(Callbacks::new().on_run(push)));
        scheduler.add_task(task).unwrap();
        task.enable();
    }

    set_time(10);
    let pass = scheduler.execute();
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(pass.ran, 3);
    assert_eq!(pass.evaluated, 3);
}

#[test]
fn pass_summary() {
    let scheduler = scheduler();
    let (slow, fast, off) = (task(100, Task::FOREVER), task(30, Task::FOREVER), task(1, 1));
    for task in [slow, fast, off] {
        scheduler.add_task(task).unwrap();
    }
    slow.enable();
    fast.enable();

    set_time(10);
    let pass = scheduler.execute();
    assert!(pass.is_idle());
    assert_eq!(pass.evaluated, 3);
    assert_eq!(pass.next_due, Some(20));

    set_time(30);
    let pass = scheduler.execute();
    assert!(!pass.is_idle());
    assert_eq!(pass.ran, 1);
    // `fast` just ran, so only `slow` counts toward the estimate.
    assert_eq!(pass.next_due, Some(70));

    let empty = leak(Scheduler::new(MOCK_CLOCK));
    assert_eq!(empty.execute(), Pass::default());
}

#[test]
fn delete_current_task_in_callback() {
    trace_init();
    let scheduler = scheduler();
    let (a, b) = (task(10, Task::FOREVER), task(10, Task::FOREVER));
    let b_runs = counter();
    a.set_callbacks(leak(Callbacks::new().on_run(leak(move || {
        let current = scheduler.current_task().expect("a task is running");
        assert!(core::ptr::eq(current, a));
        scheduler.delete_task(current).unwrap();
        // Still linked until the callback returns.
        assert!(scheduler.tasks().any(|task| core::ptr::eq(task, a)));
    }))));
    b.set_callbacks(leak(Callbacks::new().on_run(counting(b_runs))));
    for task in [a, b] {
        scheduler.add_task(task).unwrap();
        task.enable();
    }

    set_time(10);
    let pass = scheduler.execute();
    scheduler.assert_valid();

    assert_eq!(pass.ran, 2, "deleting the current task doesn't skip its successor");
    assert_eq!(b_runs.load(SeqCst), 1);
    assert_eq!(scheduler.len(), 1);
    assert!(a.scheduler().is_none());
    assert!(a.is_enabled());
    assert!(scheduler.current_task().is_none());
}

#[test]
fn delete_next_task_in_callback() {
    let scheduler = scheduler();
    let (a, b, c) = (task(10, 1), task(10, 1), task(10, 1));
    let (b_runs, c_runs) = (counter(), counter());
    let delete_b = leak(move || scheduler.delete_task(b).unwrap());
    a.set_callbacks(leak(Callbacks::new().on_run(delete_b)));
    b.set_callbacks(leak(Callbacks::new().on_run(counting(b_runs))));
    c.set_callbacks(leak(Callbacks::new().on_run(counting(c_runs))));
    for task in [a, b, c] {
        scheduler.add_task(task).unwrap();
        task.enable();
    }

    set_time(10);
    scheduler.execute();
    scheduler.assert_valid();
    assert_eq!(b_runs.load(SeqCst), 0);
    assert_eq!(c_runs.load(SeqCst), 1);
}

#[test]
fn add_task_in_callback() {
    let scheduler = scheduler();
    let (late, late_runs) = counted(0, 1);
    let first = task(10, 1);
    first.set_callbacks(leak(Callbacks::new().on_run(leak(move || {
        scheduler.add_task(late).unwrap();
        late.enable();
    }))));
    scheduler.add_task(first).unwrap();
    first.enable();

    set_time(10);
    let pass = scheduler.execute();
    assert_eq!(late_runs.load(SeqCst), 1, "tasks added mid-pass are visited by it");
    assert_eq!(pass.ran, 2);
}

#[test]
fn nested_execute_is_refused() {
    let scheduler = scheduler();
    let nested: &'static std::sync::Mutex<Option<Pass>> = leak(std::sync::Mutex::new(None));
    let (other, other_runs) = counted(10, 1);
    let task = task(10, 1);
    task.set_callbacks(leak(Callbacks::new().on_run(leak(move || {
        *nested.lock().unwrap() = Some(scheduler.execute());
    }))));
    for task in [task, other] {
        scheduler.add_task(task).unwrap();
        task.enable();
    }

    set_time(10);
    scheduler.execute();
    assert_eq!(*nested.lock().unwrap(), Some(Pass::default()));
    assert_eq!(other_runs.load(SeqCst), 1, "the outer pass ran the other task once");
}

#[test]
fn callback_can_delay_itself() {
    let scheduler = scheduler();
    let task = task(100, Task::FOREVER);
    let runs = counter();
    task.set_callbacks(leak(Callbacks::new().on_run(leak(move || {
        runs.fetch_add(1, SeqCst);
        task.delay(50);
    }))));
    scheduler.add_task(task).unwrap();
    task.enable();

    set_time(100);
    scheduler.execute();
    set_time(249);
    scheduler.execute();
    assert_eq!(runs.load(SeqCst), 1);

    set_time(250);
    scheduler.execute();
    assert_eq!(runs.load(SeqCst), 2);
}

#[test]
fn force_next_iteration() {
    let scheduler = scheduler();
    let (task, runs) = counted(1000, Task::FOREVER);
    scheduler.add_task(task).unwrap();
    task.enable();

    set_time(5);
    task.force_next_iteration();
    scheduler.execute();
    scheduler.execute();
    assert_eq!(runs.load(SeqCst), 1);
}

#[test]
fn disable_and_enable_all() {
    trace_init();
    let scheduler = scheduler();
    let disables = counter();
    let mut tasks = Vec::new();
    for _ in 0..5 {
        let task = task(10, Task::FOREVER);
        task.set_callbacks(leak(Callbacks::new().on_disable(counting(disables))));
        scheduler.add_task(task).unwrap();
        task.enable();
        tasks.push(task);
    }

    scheduler.disable_all();
    assert_eq!(disables.load(SeqCst), 5);
    assert!(tasks.iter().all(|task| !task.is_enabled()));

    scheduler.disable_all();
    assert_eq!(disables.load(SeqCst), 5, "already-disabled tasks aren't notified");

    scheduler.enable_all();
    assert!(tasks.iter().all(|task| task.is_enabled()));
}

#[test]
fn disable_all_when_on_disable_deletes() {
    let scheduler = scheduler();
    let tasks = [task(10, 1), task(10, 1), task(10, 1)];
    for task in tasks {
        let delete_self = leak(move || scheduler.delete_task(task).unwrap());
        task.set_callbacks(leak(Callbacks::new().on_disable(delete_self)));
        scheduler.add_task(task).unwrap();
        task.enable();
    }

    scheduler.disable_all();
    scheduler.assert_valid();
    assert!(scheduler.is_empty());
    assert!(tasks.iter().all(|task| !task.is_enabled()));
}

#[test]
fn disable_all_when_on_disable_deletes_ahead() {
    trace_init();
    let scheduler = scheduler();
    let [a, b, c, d] = [
        task(10, Task::FOREVER),
        task(20, Task::FOREVER),
        task(30, Task::FOREVER),
        task(40, Task::FOREVER),
    ];
    let delete_a_and_b = leak(move || {
        scheduler.delete_task(a).unwrap();
        scheduler.delete_task(b).unwrap();
    });
    a.set_callbacks(leak(Callbacks::new().on_disable(delete_a_and_b)));
    for task in [a, b, c, d] {
        scheduler.add_task(task).unwrap();
        task.enable();
    }

    scheduler.disable_all();
    scheduler.assert_valid();

    assert!(!a.is_enabled());
    assert!(b.is_enabled(), "b was deleted before the sweep reached it");
    assert!(!c.is_enabled(), "the sweep continues past the deleted tasks");
    assert!(!d.is_enabled());
    assert!(a.scheduler().is_none());
    assert!(b.scheduler().is_none());
    let intervals: Vec<_> = scheduler.tasks().map(Task::interval).collect();
    assert_eq!(intervals, vec![30, 40]);
}

#[test]
fn enable_all_with_veto() {
    let scheduler = scheduler();
    let enables = counter();
    let tasks = [task(10, 1), task(20, 1), task(30, 1)];
    let veto = leak(move || {
        enables.fetch_add(1, SeqCst);
        false
    });
    tasks[1].set_callbacks(leak(Callbacks::new().on_enable(veto)));
    for task in tasks {
        scheduler.add_task(task).unwrap();
    }

    scheduler.enable_all();
    assert!(tasks[0].is_enabled());
    assert!(!tasks[1].is_enabled(), "a vetoing task stays disabled");
    assert!(tasks[2].is_enabled(), "a veto doesn't stop the sweep");
    assert_eq!(enables.load(SeqCst), 1);

    set_time(30);
    let pass = scheduler.execute();
    assert_eq!(pass.ran, 2);
}

#[test]
fn task_changes_never_take_the_list_lock() {
    trace_init();
    let scheduler = scheduler();
    let disables = counter();
    let (task, runs) = counted(10, Task::FOREVER);
    scheduler.add_task_enabled(task).unwrap();
    let replacement = leak(
        Callbacks::new()
            .on_run(counting(runs))
            .on_disable(counting(disables)),
    );

    // An interrupt handler may land while the main context is adding or
    // deleting tasks. Everything it can do to a task must still complete.
    scheduler.with_tasks_locked(|| {
        task.set_callbacks(replacement);
        assert!(task.disable());
        task.enable();
        task.set_iterations(3);
        task.set_interval(20);
        task.restart_delayed(5);
        task.force_next_iteration();
        assert!(task.scheduler().is_some());
    });
    assert_eq!(disables.load(SeqCst), 1);

    scheduler.execute();
    assert_eq!(runs.load(SeqCst), 1);
    assert_eq!(task.iterations(), 2);
}

#[test]
fn on_disable_sees_current_task() {
    let scheduler = scheduler();
    let task = task(10, 1);
    let saw_current: &'static std::sync::atomic::AtomicBool =
        leak(std::sync::atomic::AtomicBool::new(false));
    task.set_callbacks(leak(Callbacks::new().on_disable(leak(move || {
        let current = scheduler.current_task();
        saw_current.store(current.is_some_and(|current| core::ptr::eq(current, task)), SeqCst);
    }))));
    scheduler.add_task(task).unwrap();
    task.enable();

    set_time(10);
    scheduler.execute();
    assert!(!task.is_enabled());
    assert!(saw_current.load(SeqCst));
}

#[test]
fn interrupt_style_disable() {
    let scheduler = scheduler();
    let (task, runs) = counted(10, Task::FOREVER);
    scheduler.add_task(task).unwrap();
    task.enable();

    let handle = std::thread::spawn(move || task.disable());
    assert!(handle.join().unwrap());

    set_time(10);
    scheduler.execute();
    assert_eq!(runs.load(SeqCst), 0);
}

#[cfg(feature = "time-critical")]
#[test]
fn overrun_is_measured() {
    let scheduler = scheduler();
    let task = task(100, Task::FOREVER);
    scheduler.add_task(task).unwrap();
    task.enable();

    set_time(125);
    scheduler.execute();
    assert_eq!(task.overrun(), 25);

    // Late runs don't push the schedule back.
    set_time(200);
    scheduler.execute();
    assert_eq!(task.overrun(), 0);
    assert_eq!(task.run_counter(), 2);
}

#[cfg(feature = "sleep-on-idle")]
mod idle {
    use super::*;
    use std::{cell::Cell, thread_local};

    thread_local! {
        static SLEPT: Cell<Option<Ticks>> = const { Cell::new(None) };
    }

    fn record_sleep(wait: Ticks) {
        SLEPT.with(|slept| slept.set(Some(wait)));
    }

    fn take_sleep() -> Option<Ticks> {
        SLEPT.with(Cell::take)
    }

    fn idle_scheduler() -> &'static Scheduler {
        set_time(0);
        take_sleep();
        leak(Scheduler::with_idle_sleep(MOCK_CLOCK, record_sleep))
    }

    #[test]
    fn sleeps_when_idle() {
        let scheduler = idle_scheduler();
        let task = task(100, Task::FOREVER);
        scheduler.add_task(task).unwrap();
        task.enable();

        set_time(40);
        scheduler.execute();
        assert_eq!(take_sleep(), Some(60));

        set_time(100);
        scheduler.execute();
        assert_eq!(take_sleep(), None, "a pass that ran something doesn't sleep");
    }

    #[test]
    fn sleeps_forever_with_nothing_enabled() {
        let scheduler = idle_scheduler();
        scheduler.execute();
        assert_eq!(take_sleep(), Some(Ticks::MAX));
    }

    #[test]
    fn sleep_can_be_disallowed() {
        let scheduler = idle_scheduler();
        scheduler.allow_sleep(false);
        scheduler.execute();
        assert_eq!(take_sleep(), None);

        scheduler.allow_sleep(true);
        scheduler.execute();
        assert!(take_sleep().is_some());
    }

    #[test]
    fn plain_scheduler_never_sleeps() {
        let scheduler = scheduler();
        take_sleep();
        scheduler.allow_sleep(true);
        scheduler.execute();
        assert_eq!(take_sleep(), None);
    }
}
