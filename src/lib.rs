#![cfg_attr(docsrs, doc = include_str!("../README.md"))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg, doc_cfg_hide))]
#![cfg_attr(docsrs, deny(missing_docs))]
#![cfg_attr(not(test), no_std)]

#[macro_use]
pub(crate) mod util;
pub(crate) mod loom;

pub mod scheduler;
pub mod task;
pub mod time;

#[doc(inline)]
pub use self::scheduler::{Pass, RegisterError, Scheduler};
#[doc(inline)]
pub use self::task::{Callbacks, Task};

#[cfg(feature = "sleep-on-idle")]
#[doc(inline)]
pub use self::scheduler::IdleSleep;
