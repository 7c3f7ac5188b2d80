#![allow(dead_code)]
use hyphae::{time::Clock, Scheduler, Task, time::Ticks};
use std::cell::Cell;

std::thread_local! {
    static NOW: Cell<Ticks> = const { Cell::new(0) };
}

pub fn trace_init() {
    use tracing_subscriber::filter::LevelFilter;
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_test_writer()
        .try_init();
}

fn now() -> Ticks {
    NOW.with(Cell::get)
}

pub fn set_time(now: Ticks) {
    NOW.with(|cell| cell.set(now));
}

pub fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// Returns a new scheduler whose clock is advanced by [`set_time`], with the
/// clock rewound to zero.
pub fn scheduler() -> &'static Scheduler {
    set_time(0);
    leak(Scheduler::new(Clock::new(now).named("test")))
}

/// Runs one pass at each of the given timestamps.
pub fn run_at(scheduler: &Scheduler, times: impl IntoIterator<Item = Ticks>) {
    for now in times {
        set_time(now);
        tracing::debug!(now, pass = ?scheduler.execute());
    }
}

pub fn enabled(tasks: &[&'static Task]) -> Vec<bool> {
    tasks.iter().map(|task| task.is_enabled()).collect()
}
