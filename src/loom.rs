#[allow(unused_imports)]
pub(crate) use self::inner::*;

#[cfg(loom)]
mod inner {
    #![allow(dead_code, unused_imports)]

    pub(crate) use loom::{model, thread};

    pub(crate) mod sync {
        pub(crate) use loom::sync::*;
    }
}

#[cfg(not(loom))]
mod inner {
    #![allow(dead_code, unused_imports)]

    pub(crate) mod sync {
        pub use core::sync::*;
    }
}
