//! Tasks: the units of work driven by a [`Scheduler`].
//!
//! A [`Task`] holds everything needed to decide when it should next run: an
//! interval, a timestamp of its last run, an iteration budget, and a set of
//! [`Callbacks`]. Tasks are plain values owned by the caller. To be driven,
//! a task must be registered with a [`Scheduler`] using
//! [`Scheduler::add_task`], which requires a `&'static Task`; usually, tasks
//! are declared as `static` items.
//!
//! # The task lifecycle
//!
//! A task is either *enabled* or *disabled*. Disabled tasks are skipped by
//! every pass of the scheduler. An enabled task runs whenever at least
//! [`interval`](Task::interval) ticks have passed since it last ran (or since
//! it was enabled), until its iteration budget is exhausted, at which point
//! it disables itself.
//!
//! - [`Task::enable`] asks the task's [`on_enable`](Callbacks::on_enable)
//!   callback whether it may start, and if so starts a fresh interval.
//! - [`Task::disable`] stops the task, notifying its
//!   [`on_disable`](Callbacks::on_disable) callback if it was running.
//! - [`Task::restart`] refills the iteration budget and enables the task.
//!
//! # Interrupt safety
//!
//! A task may be enabled, disabled, restarted or reconfigured from an
//! interrupt handler while the main context is inside
//! [`Scheduler::execute`], or while the main context is itself in the middle
//! of changing the same task. None of these operations takes a lock: a
//! task's scalar state is stored in atomics, and its [`Callbacks`] are
//! swapped as a single `&'static` pointer. A change never tears a value; at
//! worst, it takes effect on the next pass.
use crate::{
    loom::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering::*},
    time::{self, Ticks},
    util::StaticPtr,
    Scheduler,
};
use cordyceps::{list::Links, Linked};
use core::{
    fmt,
    pin::Pin,
    ptr::{self, NonNull},
};

/// The body of a task, run each time the task is due.
pub type OnRun = &'static (dyn Fn() + Sync);

/// A guard run each time a task is enabled. Returning `false` vetoes the
/// enable, leaving the task disabled.
pub type OnEnable = &'static (dyn Fn() -> bool + Sync);

/// A notification run each time an enabled task is disabled.
pub type OnDisable = &'static (dyn Fn() + Sync);

/// A schedulable unit of work.
///
/// See the [module-level documentation](self) for details.
///
/// # Examples
///
/// A task that blinks an LED five times, once every 500 ticks:
///
/// ```
/// use hyphae::{Callbacks, Scheduler, Task, time::Clock};
/// # fn millis() -> u32 { 0 }
/// # fn toggle_led() {}
///
/// static BLINK_CALLBACKS: Callbacks = Callbacks::new().on_run(&|| toggle_led());
/// static BLINK: Task = Task::new(500, 5, &BLINK_CALLBACKS);
///
/// let scheduler: &'static Scheduler = Box::leak(Box::new(Scheduler::new(Clock::new(millis))));
/// scheduler.add_task(&BLINK).expect("BLINK is not registered anywhere else");
/// BLINK.enable();
///
/// loop {
///     scheduler.execute();
///     # break;
/// }
/// ```
pub struct Task {
    links: Links<Task>,

    /// The scheduler this task is registered with, if any.
    scheduler: StaticPtr<Scheduler>,

    /// Set when the task was deleted while its scheduler was visiting it; the
    /// scheduler unlinks it once it has moved past.
    unlink_pending: AtomicBool,

    // These are touched by interrupt handlers.
    enabled: AtomicBool,
    iterations: AtomicI32,
    set_iterations: AtomicI32,
    /// Set when `set_iterations` was changed while the task was disabled, so
    /// that the next enable picks up the new budget.
    template_pending: AtomicBool,

    // Everything below is only written from the main context.
    interval: AtomicU32,
    previous: AtomicU32,
    /// Extra ticks to wait, on top of the interval, before the next run.
    delay: AtomicU32,
    run_counter: AtomicU32,
    force_next: AtomicBool,
    #[cfg(feature = "time-critical")]
    overrun: AtomicI32,

    callbacks: StaticPtr<Callbacks>,
}

/// The three callback slots of a [`Task`].
///
/// A task refers to its callbacks through a `&'static Callbacks`, so that all
/// three slots are replaced at once, without locking. `Callbacks` is built
/// with `const` methods, so it is usually a `static` of its own:
///
/// ```
/// use hyphae::{Callbacks, Task};
/// # fn sample_sensor() {}
/// # fn sensor_ready() -> bool { true }
/// # fn power_down_sensor() {}
///
/// static SENSOR_CALLBACKS: Callbacks = Callbacks::new()
///     .on_run(&|| sample_sensor())
///     .on_enable(&|| sensor_ready())
///     .on_disable(&|| power_down_sensor());
///
/// static SENSOR: Task = Task::new(100, Task::FOREVER, &SENSOR_CALLBACKS);
/// ```
#[derive(Clone, Copy, Default)]
pub struct Callbacks {
    on_run: Option<OnRun>,
    on_enable: Option<OnEnable>,
    on_disable: Option<OnDisable>,
}

/// What a scheduler pass should do with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Check {
    /// The task is disabled, and should be skipped.
    Disabled,
    /// The task has run out of iterations, and must be disabled.
    Exhausted,
    /// The task is not due yet. It will be due in this many ticks.
    Waiting(Ticks),
    /// The task is due. This many ticks have elapsed since its last run.
    Due(Ticks),
}

// === impl Task ===

impl Task {
    /// An iteration count meaning "run until disabled".
    pub const FOREVER: i32 = -1;

    loom_const_fn! {
        /// Returns a new, disabled task that runs every `interval` ticks,
        /// `iterations` times (or forever, if `iterations` is
        /// [`Task::FOREVER`]).
        #[must_use]
        pub fn new(interval: Ticks, iterations: i32, callbacks: &'static Callbacks) -> Self {
            Self {
                links: Links::new(),
                scheduler: StaticPtr::null(),
                unlink_pending: AtomicBool::new(false),
                enabled: AtomicBool::new(false),
                iterations: AtomicI32::new(iterations),
                set_iterations: AtomicI32::new(iterations),
                template_pending: AtomicBool::new(false),
                interval: AtomicU32::new(interval),
                previous: AtomicU32::new(0),
                delay: AtomicU32::new(0),
                run_counter: AtomicU32::new(0),
                force_next: AtomicBool::new(false),
                #[cfg(feature = "time-critical")]
                overrun: AtomicI32::new(0),
                callbacks: StaticPtr::new(callbacks),
            }
        }
    }

    /// Enables the task.
    ///
    /// If the task has an [`on_enable`](Callbacks::on_enable) callback, it is
    /// called first; if it returns `false`, the task is left disabled (an
    /// enabled task is disabled, without calling `on_disable`) and nothing
    /// else changes.
    ///
    /// Otherwise, the task's interval starts over from the current tick, so
    /// its first run happens one full interval from now. If the task was
    /// disabled, its run counter is reset. Enabling never runs the task
    /// directly.
    pub fn enable(&self) {
        let was_enabled = self.enabled.load(Acquire);
        if let Some(on_enable) = self.callbacks().on_enable {
            if !on_enable() {
                self.enabled.store(false, Release);
                debug!(task = ?self, "task.enable: vetoed by on_enable");
                return;
            }
        }

        self.restamp();
        if !was_enabled {
            self.run_counter.store(0, Relaxed);
            if self.template_pending.load(Acquire) {
                self.reload_iterations();
            }
        }
        self.enabled.store(true, Release);
        trace!(task = ?self, was_enabled, "task.enable");
    }

    /// Enables the task only if it is currently disabled.
    ///
    /// Returns whether the task was *already* enabled.
    pub fn enable_if_not(&self) -> bool {
        let was_enabled = self.is_enabled();
        if !was_enabled {
            self.enable();
        }
        was_enabled
    }

    /// Enables the task, deferring its first run by `delay` ticks (so that
    /// it first runs `delay + interval` ticks from now).
    pub fn enable_delayed(&self, delay: Ticks) {
        self.enable();
        self.delay(delay);
    }

    /// Pushes the task's next run `delay` ticks further into the future.
    ///
    /// This doesn't change whether the task is enabled, its remaining
    /// iterations, or its run counter. It is typically called from the
    /// task's own callback, to reschedule itself.
    ///
    /// Delays accumulate, saturating at [`Ticks::MAX`].
    pub fn delay(&self, delay: Ticks) {
        let _ = self
            .delay
            .fetch_update(Relaxed, Relaxed, |pending| Some(pending.saturating_add(delay)));
    }

    /// Makes the task run on the next scheduler pass, regardless of how much
    /// of its interval is left.
    ///
    /// The task must still be enabled to run.
    pub fn force_next_iteration(&self) {
        self.force_next.store(true, Release);
    }

    /// Disables the task, returning whether it was enabled.
    ///
    /// The task's [`on_disable`](Callbacks::on_disable) callback is called
    /// only if the task was enabled. A callback that is already running
    /// is unaffected; disabling only stops future runs.
    pub fn disable(&self) -> bool {
        let was_enabled = self.enabled.swap(false, AcqRel);
        if was_enabled {
            trace!(task = ?self, "task.disable");
            if let Some(on_disable) = self.callbacks().on_disable {
                on_disable();
            }
        }
        was_enabled
    }

    /// Refills the task's iteration budget, resets its run counter, and
    /// enables it.
    ///
    /// As with [`Task::enable`], the task's `on_enable` callback may veto
    /// this.
    pub fn restart(&self) {
        self.reload_iterations();
        self.run_counter.store(0, Relaxed);
        self.enable();
    }

    /// Restarts the task, deferring its first run by `delay` ticks (so that
    /// it first runs `delay + interval` ticks from now).
    pub fn restart_delayed(&self, delay: Ticks) {
        self.restart();
        self.delay(delay);
    }

    /// Returns `true` if the task is enabled.
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Acquire)
    }

    /// Reconfigures the task's interval, iteration budget, and callbacks.
    ///
    /// The interval and iterations are changed as by
    /// [`set_interval`](Self::set_interval) and
    /// [`set_iterations`](Self::set_iterations). All three callback slots
    /// are replaced, as by [`set_callbacks`](Self::set_callbacks).
    pub fn set(&self, interval: Ticks, iterations: i32, callbacks: &'static Callbacks) {
        self.set_callbacks(callbacks);
        self.set_interval(interval);
        self.set_iterations(iterations);
    }

    /// Replaces all three of the task's callback slots at once.
    ///
    /// A callback that is already running finishes normally; the new
    /// callbacks are used from the next time one is called.
    pub fn set_callbacks(&self, callbacks: &'static Callbacks) {
        self.callbacks.store(Some(callbacks));
    }

    /// Changes the task's interval.
    ///
    /// The interval starts over from the current tick, so the next run
    /// happens one full new interval from now.
    pub fn set_interval(&self, interval: Ticks) {
        self.interval.store(interval, Relaxed);
        self.restamp();
    }

    /// Returns the task's interval, in ticks.
    #[inline]
    #[must_use]
    pub fn interval(&self) -> Ticks {
        self.interval.load(Relaxed)
    }

    /// Changes the task's iteration budget.
    ///
    /// The new budget is always what [`Task::restart`] refills to. If the
    /// task is enabled, its remaining iterations are also set to the new
    /// budget immediately. If it is disabled, the remaining count is left
    /// alone until the task is next enabled or restarted, which picks up the
    /// new budget.
    pub fn set_iterations(&self, iterations: i32) {
        self.set_iterations.store(iterations, Release);
        if self.is_enabled() {
            self.iterations.store(iterations, Release);
            self.template_pending.store(false, Release);
        } else {
            self.template_pending.store(true, Release);
        }
    }

    /// Returns the task's remaining iterations.
    ///
    /// This is [`Task::FOREVER`] for a task that runs forever, and `0` for a
    /// task that has finished its last run.
    #[inline]
    #[must_use]
    pub fn iterations(&self) -> i32 {
        self.iterations.load(Acquire)
    }

    /// Returns how many times the task has run since it was last enabled.
    #[inline]
    #[must_use]
    pub fn run_counter(&self) -> u32 {
        self.run_counter.load(Relaxed)
    }

    /// Returns how many ticks late (or, if negative, early) the task's
    /// most recent run was, relative to its target time.
    #[cfg(feature = "time-critical")]
    #[cfg_attr(docsrs, doc(cfg(feature = "time-critical")))]
    #[inline]
    #[must_use]
    pub fn overrun(&self) -> i32 {
        self.overrun.load(Relaxed)
    }

    /// Returns `true` if the task is on its first run since it was enabled
    /// (or hasn't run yet).
    #[inline]
    #[must_use]
    pub fn is_first_iteration(&self) -> bool {
        self.run_counter() <= 1
    }

    /// Returns `true` if the task is on its last run.
    #[inline]
    #[must_use]
    pub fn is_last_iteration(&self) -> bool {
        self.iterations() == 0
    }

    /// Returns the scheduler this task is registered with, if any.
    #[must_use]
    pub fn scheduler(&self) -> Option<&'static Scheduler> {
        self.scheduler.load()
    }

    // === scheduler-facing ===

    /// Decides what the current pass should do with this task.
    pub(crate) fn check(&self, now: Ticks) -> Check {
        if !self.is_enabled() {
            return Check::Disabled;
        }

        if self.iterations() == 0 {
            return Check::Exhausted;
        }

        let wait = self.interval().saturating_add(self.delay.load(Relaxed));
        let elapsed = time::elapsed(now, self.previous.load(Relaxed));
        if elapsed >= wait || self.force_next.load(Acquire) {
            Check::Due(elapsed)
        } else {
            Check::Waiting(wait - elapsed)
        }
    }

    /// Runs the task once. `elapsed` is the value returned by `check`.
    pub(crate) fn run(&self, now: Ticks, elapsed: Ticks) {
        let wait = self
            .interval()
            .saturating_add(self.delay.swap(0, Relaxed));
        self.force_next.store(false, Release);

        #[cfg(feature = "time-critical")]
        {
            self.overrun.store(overrun(elapsed, wait), Relaxed);
            if elapsed >= wait {
                let previous = self.previous.load(Relaxed);
                self.previous.store(previous.wrapping_add(wait), Relaxed);
            } else {
                // Forced early; there's no target time to stay aligned to.
                self.previous.store(now, Relaxed);
            }
        }

        #[cfg(not(feature = "time-critical"))]
        {
            let _ = (elapsed, wait);
            self.previous.store(now, Relaxed);
        }

        self.run_counter.fetch_add(1, Relaxed);
        let _ = self
            .iterations
            .fetch_update(AcqRel, Acquire, |n| (n > 0).then(|| n - 1));

        trace!(task = ?self, elapsed, "task.run");
        if let Some(on_run) = self.callbacks().on_run {
            on_run();
        }

        // The callback may have restarted the task or handed it a new
        // budget; only a budget that is still exhausted disables it.
        if self.iterations() == 0 && self.is_enabled() {
            self.disable();
        }
    }

    /// Claims this task for `scheduler`. Returns `false` if it is already
    /// registered with a scheduler.
    pub(crate) fn claim(&self, scheduler: &'static Scheduler) -> bool {
        self.scheduler
            .compare_exchange(None, Some(scheduler))
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.scheduler.store(None);
    }

    pub(crate) fn is_registered_with(&self, scheduler: &Scheduler) -> bool {
        self.scheduler.is(scheduler)
    }

    pub(crate) fn defer_unlink(&self) {
        self.unlink_pending.store(true, Release);
    }

    pub(crate) fn take_unlink_pending(&self) -> bool {
        self.unlink_pending.swap(false, AcqRel)
    }

    /// Re-expresses the task's timestamp relative to `from` as one relative
    /// to `to`, when it moves between tick sources.
    ///
    /// Unregistered tasks keep their timestamps relative to tick zero.
    pub(crate) fn rebase(&self, from: Ticks, to: Ticks) {
        let previous = self.previous.load(Relaxed);
        self.previous
            .store(previous.wrapping_sub(from).wrapping_add(to), Relaxed);
    }

    fn reload_iterations(&self) {
        self.iterations
            .store(self.set_iterations.load(Acquire), Release);
        self.template_pending.store(false, Release);
    }

    /// Starts a fresh interval from the current tick, dropping any pending
    /// delay.
    fn restamp(&self) {
        self.previous.store(self.now(), Relaxed);
        self.delay.store(0, Relaxed);
    }

    fn callbacks(&self) -> &'static Callbacks {
        self.callbacks.load().unwrap_or(&Callbacks::NONE)
    }

    fn now(&self) -> Ticks {
        self.scheduler().map_or(0, |scheduler| scheduler.clock().now())
    }
}

/// Forced early runs report a negative overrun. Either way, the result
/// saturates rather than wrapping.
#[cfg(feature = "time-critical")]
fn overrun(elapsed: Ticks, wait: Ticks) -> i32 {
    if elapsed >= wait {
        i32::try_from(elapsed - wait).unwrap_or(i32::MAX)
    } else {
        i32::try_from(wait - elapsed).map_or(i32::MIN, |early| -early)
    }
}

// Only `&'static Task`s are ever pushed onto a scheduler's list, so a task's
// handle is a pinned `'static` reference, and dropping one does nothing.
unsafe impl Linked<Links<Task>> for Task {
    type Handle = Pin<&'static Task>;

    fn into_ptr(task: Self::Handle) -> NonNull<Self> {
        NonNull::from(task.get_ref())
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        // Safety: every pointer in a scheduler's list came from `into_ptr`,
        // i.e. from a `&'static Task`.
        Pin::static_ref(unsafe { ptr.as_ref() })
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<Links<Self>> {
        // Safety: the caller guarantees `target` points at a live task; this
        // only projects to a field, without creating a reference to the task.
        unsafe {
            let links = ptr::addr_of_mut!((*target.as_ptr()).links);
            NonNull::new_unchecked(links)
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Task");
        s.field("addr", &format_args!("{:p}", self))
            .field("enabled", &self.is_enabled())
            .field("interval", &self.interval())
            .field("previous", &self.previous.load(Relaxed))
            .field("delay", &self.delay.load(Relaxed))
            .field("iterations", &self.iterations())
            .field("set_iterations", &self.set_iterations.load(Relaxed))
            .field("run_counter", &self.run_counter());
        #[cfg(feature = "time-critical")]
        s.field("overrun", &self.overrun());
        s.finish()
    }
}

// === impl Callbacks ===

impl Callbacks {
    /// Empty callback slots, for tasks that are given their callbacks later
    /// with [`Task::set_callbacks`].
    pub const NONE: Self = Self::new();

    /// Returns a set of empty callback slots.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            on_run: None,
            on_enable: None,
            on_disable: None,
        }
    }

    /// Sets the task body, run each time the task is due.
    ///
    /// Use [`Scheduler::current_task`] from inside the callback to get at the
    /// task being run.
    #[must_use]
    pub const fn on_run(self, on_run: OnRun) -> Self {
        Self {
            on_run: Some(on_run),
            ..self
        }
    }

    /// Sets the guard run each time the task is enabled.
    ///
    /// If it returns `false`, the task stays disabled.
    #[must_use]
    pub const fn on_enable(self, on_enable: OnEnable) -> Self {
        Self {
            on_enable: Some(on_enable),
            ..self
        }
    }

    /// Sets the notification run each time the task goes from enabled to
    /// disabled.
    #[must_use]
    pub const fn on_disable(self, on_disable: OnDisable) -> Self {
        Self {
            on_disable: Some(on_disable),
            ..self
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_run", &self.on_run.is_some())
            .field("on_enable", &self.on_enable.is_some())
            .field("on_disable", &self.on_disable.is_some())
            .finish()
    }
}
