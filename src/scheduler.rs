//! The [`Scheduler`] and its polling loop.
use crate::{
    loom::sync::atomic::{AtomicBool, Ordering::*},
    task::{Check, Task},
    time::{Clock, Ticks},
    util::StaticPtr,
};
use cordyceps::List;
use core::{
    fmt,
    pin::Pin,
    ptr::{self, NonNull},
};
use maitake_sync::blocking::Mutex;

/// A cooperative scheduler for a list of [`Task`]s.
///
/// A `Scheduler` owns an ordered list of registered tasks. Each call to
/// [`Scheduler::execute`] makes exactly one pass over that list, in
/// registration order, running every enabled task whose interval has
/// elapsed. Callbacks run synchronously and to completion inside
/// `execute`; nothing is ever preempted.
///
/// Schedulers hold `&'static` references to their tasks, and tasks hold a
/// `&'static` reference back to the scheduler they are registered with, so a
/// scheduler must itself be `'static` before tasks can be added to it. Any
/// number of independent schedulers may exist.
///
/// The task list is guarded by a [`blocking::Mutex`]. With the
/// `critical-section` feature enabled, that lock is a critical section, and
/// tasks may also be added and deleted from interrupt handlers. Otherwise,
/// registration should only happen in the main context. Changing a task's
/// state, as with [`Task::enable`] or [`Task::disable`], never touches the
/// list and is always safe from an interrupt handler.
///
/// [`blocking::Mutex`]: maitake_sync::blocking::Mutex
///
/// # Examples
///
/// ```
/// use hyphae::{Callbacks, Scheduler, Task, time::Clock};
/// use core::sync::atomic::{AtomicU32, Ordering};
///
/// static MILLIS: AtomicU32 = AtomicU32::new(0);
/// static SCHEDULER: Scheduler = Scheduler::new(
///     Clock::new(|| MILLIS.load(Ordering::Relaxed)).named("millis")
/// );
/// static RUNS: AtomicU32 = AtomicU32::new(0);
/// static COUNT_CALLBACKS: Callbacks =
///     Callbacks::new().on_run(&|| { RUNS.fetch_add(1, Ordering::Relaxed); });
/// static COUNT: Task = Task::new(100, 3, &COUNT_CALLBACKS);
///
/// SCHEDULER.add_task_enabled(&COUNT).unwrap();
///
/// for now in [0, 100, 200, 300] {
///     MILLIS.store(now, Ordering::Relaxed);
///     SCHEDULER.execute();
/// }
///
/// assert_eq!(RUNS.load(Ordering::Relaxed), 3);
/// assert!(!COUNT.is_enabled());
/// ```
pub struct Scheduler {
    tasks: Mutex<List<Task>>,

    /// The task whose callback is running right now.
    current: StaticPtr<Task>,

    /// The task being visited by `disable_all` or `enable_all`.
    sweeping: StaticPtr<Task>,

    /// Set for the duration of a pass, so that passes never nest.
    executing: AtomicBool,

    clock: Clock,

    #[cfg(feature = "sleep-on-idle")]
    idle: Option<IdleSleep>,

    #[cfg(feature = "sleep-on-idle")]
    allow_sleep: AtomicBool,
}

/// A low-power wait, called when a pass over the task list ran nothing.
///
/// The argument is an estimate of how many ticks remain until the next task
/// is due, or [`Ticks::MAX`] if no task is waiting. Implementations should
/// return when woken by any interrupt, even if they meant to sleep longer;
/// the caller's loop simply calls [`Scheduler::execute`] again.
#[cfg(feature = "sleep-on-idle")]
#[cfg_attr(docsrs, doc(cfg(feature = "sleep-on-idle")))]
pub type IdleSleep = fn(Ticks);

/// A summary of one pass over a scheduler's task list, returned by
/// [`Scheduler::execute`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Pass {
    /// The number of tasks in the list that were looked at.
    pub evaluated: usize,

    /// The number of tasks that ran.
    pub ran: usize,

    /// How many ticks remain until the soonest enabled task that did not
    /// run becomes due, if any.
    pub next_due: Option<Ticks>,
}

/// Errors returned when registering or removing a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum RegisterError {
    /// The task is already registered with a scheduler (this one, or another).
    #[error("task is already registered with a scheduler")]
    AlreadyRegistered,

    /// The task is not registered with this scheduler.
    #[error("task is not registered with this scheduler")]
    NotRegistered,
}

/// Iterates over the tasks registered with a [`Scheduler`], in the order
/// they will run.
///
/// Returned by [`Scheduler::tasks`].
///
/// Each step looks the next task up in the scheduler's list, so tasks may be
/// added or deleted while iterating. Deleting the task that was just yielded
/// ends the iteration.
pub struct Tasks<'sched> {
    scheduler: &'sched Scheduler,
    next: Option<&'static Task>,
}

// === impl Scheduler ===

impl Scheduler {
    loom_const_fn! {
        /// Returns a new scheduler with no tasks, reading the time from
        /// `clock`.
        #[must_use]
        pub fn new(clock: Clock) -> Self {
            Self {
                tasks: Mutex::new(List::new()),
                current: StaticPtr::null(),
                sweeping: StaticPtr::null(),
                executing: AtomicBool::new(false),
                clock,
                #[cfg(feature = "sleep-on-idle")]
                idle: None,
                #[cfg(feature = "sleep-on-idle")]
                allow_sleep: AtomicBool::new(false),
            }
        }
    }

    #[cfg(feature = "sleep-on-idle")]
    loom_const_fn! {
        /// Returns a new scheduler with no tasks, reading the time from
        /// `clock`, that calls `idle` whenever a pass runs nothing.
        ///
        /// Sleeping is allowed by default; see
        /// [`allow_sleep`](Self::allow_sleep).
        #[must_use]
        #[cfg_attr(docsrs, doc(cfg(feature = "sleep-on-idle")))]
        pub fn with_idle_sleep(clock: Clock, idle: IdleSleep) -> Self {
            Self {
                tasks: Mutex::new(List::new()),
                current: StaticPtr::null(),
                sweeping: StaticPtr::null(),
                executing: AtomicBool::new(false),
                clock,
                idle: Some(idle),
                allow_sleep: AtomicBool::new(true),
            }
        }
    }

    /// Sets whether the scheduler may call its idle-sleep hook when a pass
    /// runs nothing.
    #[cfg(feature = "sleep-on-idle")]
    #[cfg_attr(docsrs, doc(cfg(feature = "sleep-on-idle")))]
    pub fn allow_sleep(&self, allow: bool) {
        self.allow_sleep.store(allow, Release);
    }

    /// Appends `task` to the end of this scheduler's task list.
    ///
    /// Registering doesn't enable the task. If the task was enabled before
    /// it was registered, the time until its next run is preserved: while a
    /// task isn't registered, its timestamps count from tick zero.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::AlreadyRegistered`] if the task is already
    /// registered with this or any other scheduler.
    pub fn add_task(&'static self, task: &'static Task) -> Result<(), RegisterError> {
        self.tasks.with_lock(|tasks| {
            if !task.claim(self) {
                return Err(RegisterError::AlreadyRegistered);
            }
            tasks.push_back(Pin::static_ref(task));
            task.rebase(0, self.clock.now());
            Ok(())
        })
        .inspect_err(|_| debug!(?task, "scheduler.add_task: already registered"))?;

        trace!(?task, "scheduler.add_task");
        Ok(())
    }

    /// Appends `task` to the end of this scheduler's task list, and then
    /// [enables](Task::enable) it.
    ///
    /// The task's `on_enable` callback may still veto the enable, in which
    /// case the task stays registered but disabled.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::AlreadyRegistered`] if the task is already
    /// registered with this or any other scheduler. The task is not enabled
    /// in that case.
    pub fn add_task_enabled(&'static self, task: &'static Task) -> Result<(), RegisterError> {
        self.add_task(task)?;
        task.enable();
        Ok(())
    }

    /// Removes `task` from this scheduler's task list.
    ///
    /// The task is not disabled and its `on_disable` callback is not called.
    /// A task may be deleted from inside its own callbacks, including while
    /// [`disable_all`](Self::disable_all) or [`enable_all`](Self::enable_all)
    /// is visiting it; it is then unlinked as soon as the scheduler moves
    /// past it.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::NotRegistered`] if the task is not
    /// registered with this scheduler.
    pub fn delete_task(&self, task: &'static Task) -> Result<(), RegisterError> {
        let unlinked = self.tasks.with_lock(|tasks| {
            if !task.is_registered_with(self) {
                return Err(RegisterError::NotRegistered);
            }

            if self.current.is(task) || self.sweeping.is(task) {
                task.defer_unlink();
                return Ok(false);
            }

            self.unlink(tasks, task);
            Ok(true)
        })?;

        if unlinked {
            trace!(?task, "scheduler.delete_task");
        } else {
            trace!(?task, "scheduler.delete_task: deferred until the scheduler moves on");
        }
        Ok(())
    }

    /// Removes every task from this scheduler, without disabling them.
    pub fn clear(&self) {
        let mut next = self.head();
        while let Some(task) = next {
            next = self.successor(task);
            // Every task in the list is registered with this scheduler.
            let _ = self.delete_task(task);
        }
    }

    /// [Disables](Task::disable) every task, in list order.
    ///
    /// `on_disable` callbacks may delete any task, including the one being
    /// disabled; every task still registered when the sweep reaches it is
    /// disabled.
    pub fn disable_all(&self) {
        self.for_each(|task| {
            task.disable();
        });
    }

    /// [Enables](Task::enable) every task, in list order.
    pub fn enable_all(&self) {
        self.for_each(Task::enable);
    }

    /// Makes one pass over the task list, running every task that is due.
    ///
    /// For each enabled task, in list order:
    ///
    /// - a task with no iterations left is disabled;
    /// - a task whose interval has elapsed since it last ran (measured with
    ///   wrapping arithmetic, so tick counter overflow is harmless), or that
    ///   was [forced](Task::force_next_iteration), is run.
    ///
    /// Tasks added during the pass are visited by the same pass.
    ///
    /// Passes never nest: calling `execute` from inside a task's callback
    /// returns an empty [`Pass`] immediately.
    pub fn execute(&self) -> Pass {
        if self.executing.swap(true, Acquire) {
            debug!("scheduler.execute: already executing");
            return Pass::default();
        }

        let mut pass = Pass::default();
        let mut next = self.head();
        while let Some(task) = next {
            pass.evaluated += 1;

            let now = self.clock.now();
            next = match test_dbg!(task.check(now)) {
                Check::Disabled => self.successor(task),
                Check::Waiting(remaining) => {
                    pass.next_due = Some(pass.next_due.map_or(remaining, |due| due.min(remaining)));
                    self.successor(task)
                }
                Check::Exhausted => self.visit(&self.current, task, || {
                    task.disable();
                }),
                Check::Due(elapsed) => {
                    pass.ran += 1;
                    self.visit(&self.current, task, || task.run(now, elapsed))
                }
            };
        }

        self.executing.store(false, Release);
        trace!(?pass, "scheduler.execute");

        #[cfg(feature = "sleep-on-idle")]
        if pass.ran == 0 && self.allow_sleep.load(Acquire) {
            if let Some(idle) = self.idle {
                let wait = pass.next_due.unwrap_or(Ticks::MAX);
                trace!(wait, "scheduler.execute: idle");
                idle(wait);
            }
        }

        pass
    }

    /// Returns the task whose callback is running right now.
    ///
    /// This is `None` unless called from inside a task's callback during
    /// [`Scheduler::execute`].
    #[must_use]
    pub fn current_task(&self) -> Option<&'static Task> {
        self.current.load()
    }

    /// Returns an iterator over this scheduler's tasks, in list order.
    #[must_use]
    pub fn tasks(&self) -> Tasks<'_> {
        Tasks {
            scheduler: self,
            next: self.head(),
        }
    }

    /// Returns the number of registered tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.with_lock(|tasks| tasks.len())
    }

    /// Returns `true` if no tasks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.with_lock(|tasks| tasks.is_empty())
    }

    /// Returns the clock this scheduler reads the time from.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Applies `f` to every task in list order, tolerating `f` (or the
    /// callbacks it triggers) deleting any task.
    fn for_each(&self, mut f: impl FnMut(&'static Task)) {
        let mut next = self.head();
        while let Some(task) = next {
            next = self.visit(&self.sweeping, task, || f(task));
        }
    }

    /// Runs `f` with `task` recorded in `slot`, so that deleting `task`
    /// meanwhile is deferred. Returns the task that follows it afterwards,
    /// and unlinks `task` if it was deleted.
    fn visit(
        &self,
        slot: &StaticPtr<Task>,
        task: &'static Task,
        f: impl FnOnce(),
    ) -> Option<&'static Task> {
        // In case `task` is unlinked from under `slot` after all, by a
        // nested sweep.
        let after = self.successor(task);

        let outer = slot.load();
        slot.store(Some(task));
        f();

        // Unpinning and taking the pending unlink happen under the lock, so
        // that a concurrent `delete_task` either sees `task` pinned and
        // defers, or sees it unpinned and unlinks it itself.
        self.tasks.with_lock(|tasks| {
            slot.store(outer);
            let unlink = task.take_unlink_pending();

            let mut iter = tasks.iter();
            if !iter.by_ref().any(|curr| ptr::eq(&*curr, task)) {
                return after.filter(|after| after.is_registered_with(self));
            }
            let next = iter.next().map(static_task);

            if unlink {
                self.unlink(tasks, task);
                trace!(?task, "scheduler.unlink: deferred delete");
            }
            next
        })
    }

    fn head(&self) -> Option<&'static Task> {
        self.tasks.with_lock(|tasks| tasks.iter().next().map(static_task))
    }

    /// Returns the task after `task` in the list, or `None` if `task` is the
    /// last one or isn't in the list.
    fn successor(&self, task: &Task) -> Option<&'static Task> {
        self.tasks.with_lock(|tasks| {
            let mut iter = tasks.iter();
            iter.by_ref().find(|curr| ptr::eq(&**curr, task))?;
            iter.next().map(static_task)
        })
    }

    /// Unlinks `task`, which must be registered with this scheduler, from
    /// the locked task list.
    fn unlink(&self, tasks: &mut List<Task>, task: &'static Task) {
        // Safety: `task` is registered with this scheduler, so it is linked
        // into this list and no other.
        let removed = unsafe { tasks.remove(NonNull::from(task)) };
        debug_assert!(
            removed.is_some(),
            "a task registered with a scheduler must be in its list"
        );
        task.rebase(self.clock.now(), 0);
        task.release();
    }

    #[cfg(test)]
    pub(crate) fn assert_valid(&self) {
        self.tasks.with_lock(|tasks| tasks.assert_valid());
    }

    #[cfg(all(test, not(loom)))]
    pub(crate) fn with_tasks_locked<T>(&self, f: impl FnOnce() -> T) -> T {
        self.tasks.with_lock(|_| f())
    }
}

/// Every task in a scheduler's list was pushed as a `Pin<&'static Task>`.
fn static_task(task: &Task) -> &'static Task {
    // Safety: see above; the list only hands out a shorter borrow.
    unsafe { &*ptr::from_ref(task) }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Scheduler");
        s.field("tasks", &self.len())
            .field("current", &self.current)
            .field("sweeping", &self.sweeping)
            .field("clock", &self.clock);
        #[cfg(feature = "sleep-on-idle")]
        s.field("allow_sleep", &self.allow_sleep.load(Relaxed));
        s.finish()
    }
}

// === impl Tasks ===

impl Iterator for Tasks<'_> {
    type Item = &'static Task;

    fn next(&mut self) -> Option<Self::Item> {
        let task = self.next?;
        self.next = self.scheduler.successor(task);
        Some(task)
    }
}

impl fmt::Debug for Tasks<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tasks").finish_non_exhaustive()
    }
}

// === impl Pass ===

impl Pass {
    /// Returns `true` if no task ran during this pass.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.ran == 0
    }
}
