macro_rules! event {
    ($level:ident, $($arg:tt)+) => {
        {
            #[cfg(any(feature = "tracing", test))]
            {
                tracing::event!(tracing::Level::$level, $($arg)+)
            }
        }
    };
}

macro_rules! trace {
    ($($arg:tt)+) => {
        event!(TRACE, $($arg)+)
    };
}

macro_rules! debug {
    ($($arg:tt)+) => {
        event!(DEBUG, $($arg)+)
    };
}

#[cfg(not(test))]
macro_rules! test_dbg {
    ($e:expr) => {
        $e
    };
}

#[cfg(test)]
macro_rules! test_dbg {
    ($e:expr) => {
        match $e {
            e => {
                debug!(
                    location = %core::panic::Location::caller(),
                    "{} = {:?}",
                    stringify!($e),
                    &e
                );
                e
            }
        }
    };
}

macro_rules! loom_const_fn {
    (
        $(#[$meta:meta])*
        $vis:vis fn $name:ident($($arg:ident: $T:ty),*) -> $Ret:ty $body:block
    ) => {
        $(#[$meta])*
        #[cfg(not(loom))]
        $vis const fn $name($($arg: $T),*) -> $Ret $body

        $(#[$meta])*
        #[cfg(loom)]
        $vis fn $name($($arg: $T),*) -> $Ret $body
    }
}

use crate::loom::sync::atomic::{AtomicPtr, Ordering::*};
use core::{fmt, marker::PhantomData, ptr};

/// Formats an optional `'static` reference by address.
pub(crate) struct FmtPtr<T: 'static>(pub(crate) Option<&'static T>);

/// An atomic, nullable pointer that may only ever hold a `&'static T`.
///
/// Because nothing but `'static` references are ever stored, loading the
/// pointer back as a `&'static T` is always sound.
pub(crate) struct StaticPtr<T: 'static> {
    ptr: AtomicPtr<T>,
    _ref: PhantomData<&'static T>,
}

impl<T: 'static> fmt::Debug for FmtPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(ptr) => write!(f, "{:p}", ptr),
            None => f.write_str("None"),
        }
    }
}

// === impl StaticPtr ===

impl<T: 'static> StaticPtr<T> {
    loom_const_fn! {
        #[must_use]
        pub(crate) fn null() -> Self {
            Self {
                ptr: AtomicPtr::new(ptr::null_mut()),
                _ref: PhantomData,
            }
        }
    }

    loom_const_fn! {
        #[must_use]
        pub(crate) fn new(value: &'static T) -> Self {
            Self {
                ptr: AtomicPtr::new(ptr::from_ref(value).cast_mut()),
                _ref: PhantomData,
            }
        }
    }

    #[inline]
    pub(crate) fn load(&self) -> Option<&'static T> {
        // Safety: the only values ever stored in `self.ptr` are null or
        // pointers created from a `&'static T`.
        unsafe { self.ptr.load(Acquire).as_ref() }
    }

    #[inline]
    pub(crate) fn store(&self, value: Option<&'static T>) {
        self.ptr.store(Self::raw(value), Release);
    }

    /// Stores `new` if the current value is `current`, returning the previous
    /// value on failure.
    pub(crate) fn compare_exchange(
        &self,
        current: Option<&'static T>,
        new: Option<&'static T>,
    ) -> Result<(), Option<&'static T>> {
        self.ptr
            .compare_exchange(Self::raw(current), Self::raw(new), AcqRel, Acquire)
            .map(|_| ())
            // Safety: see `load`.
            .map_err(|actual| unsafe { actual.as_ref() })
    }

    /// Returns `true` if this pointer currently points at `value`.
    #[inline]
    pub(crate) fn is(&self, value: &T) -> bool {
        ptr::eq(self.ptr.load(Acquire), value)
    }

    #[inline]
    fn raw(value: Option<&'static T>) -> *mut T {
        value.map_or(ptr::null_mut(), |value| ptr::from_ref(value).cast_mut())
    }
}

impl<T: 'static> fmt::Debug for StaticPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&FmtPtr(self.load()), f)
    }
}

#[cfg(test)]
pub(crate) use self::test_util::*;
