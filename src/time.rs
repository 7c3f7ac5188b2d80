//! Tick sources.
//!
//! See the documentation for the [`Clock`] type for more details.
use core::fmt;

/// A timestamp or duration, measured in ticks of a [`Clock`].
///
/// What a tick represents is up to the platform; canonically, it is one
/// millisecond. Tick counts are 32 bits wide and are expected to wrap: all
/// elapsed-time arithmetic in this crate uses wrapping subtraction, so a
/// counter that overflows while tasks are waiting does not disturb them, as
/// long as no single interval approaches `Ticks::MAX`.
pub type Ticks = u32;

/// A hardware tick source.
///
/// A `Clock` consists of a function that returns the current timestamp in
/// [`Ticks`] (`now()`), and a name used to identify it in diagnostics.
///
/// # Implementing `now()`
///
/// Timestamps returned by `now()` must be monotonically non-decreasing
/// *modulo 2<sup>32</sup>*. Unlike a general-purpose time source, a `Clock`
/// is **not** required to avoid overflow: a free-running 32-bit millisecond
/// counter wraps after roughly 49 days, and the [`Scheduler`] absorbs that
/// wraparound when computing how long ago each task last ran.
///
/// ## Examples
///
/// A clock for an interrupt-driven millisecond counter:
///
/// ```rust
/// use hyphae::time::{Clock, Ticks};
/// use core::sync::atomic::{AtomicU32, Ordering};
///
/// // Incremented by the hardware timer interrupt once per millisecond.
/// static MILLIS: AtomicU32 = AtomicU32::new(0);
///
/// fn timer_interrupt_handler() {
///     MILLIS.fetch_add(1, Ordering::Relaxed);
/// }
///
/// fn millis() -> Ticks {
///     MILLIS.load(Ordering::Relaxed)
/// }
///
/// static CLOCK: Clock = Clock::new(millis).named("millis");
/// # timer_interrupt_handler();
/// assert_eq!(CLOCK.now(), 1);
/// ```
///
/// [`Scheduler`]: crate::Scheduler
#[derive(Clone)]
pub struct Clock {
    now: fn() -> Ticks,
    name: &'static str,
}

impl Clock {
    /// Returns a new [`Clock`] that reads the current timestamp by calling
    /// `now`.
    #[must_use]
    pub const fn new(now: fn() -> Ticks) -> Self {
        Self {
            now,
            name: "<unnamed clock>",
        }
    }

    /// Adds a name to this `Clock`, for diagnostics.
    #[must_use]
    pub const fn named(self, name: &'static str) -> Self {
        Self { name, ..self }
    }

    /// Returns the current timestamp.
    #[inline]
    #[must_use]
    pub fn now(&self) -> Ticks {
        (self.now)()
    }

    /// Returns this `Clock`'s name, if it was given one using
    /// [`Clock::named`].
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { now, name } = self;
        f.debug_struct("Clock")
            .field("name", name)
            .field("now", &format_args!("{:p}", *now as *const ()))
            .finish()
    }
}

/// Returns the number of ticks that have elapsed between `since` and `now`,
/// accounting for the tick counter wrapping around.
#[inline]
#[must_use]
pub const fn elapsed(now: Ticks, since: Ticks) -> Ticks {
    now.wrapping_sub(since)
}
