//! A minimal single-threaded stackful coroutine runtime.
//!
//! Every coroutine runs on its own stack, so it can suspend from anywhere, even several calls deep,
//! and pick up later with all of its locals intact.
//! Coroutines take turns in round-robin order, each turn ending with an explicit [yield_now].
//!
//! # Examples
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! fn nested(log: &RefCell<Vec<String>>, name: &str) {
//!     for i in 0..2 {
//!         log.borrow_mut().push(format!("{name} {i}"));
//!         stackful::yield_now(); // suspends the whole call stack
//!     }
//! }
//!
//! let log = stackful::runtime::start(|| {
//!     let log = Rc::new(RefCell::new(Vec::new()));
//!
//!     for name in ["a", "b"] {
//!         let log = log.clone();
//!         stackful::spawn(move || nested(&log, name)).unwrap();
//!     }
//!     stackful::run_scheduler();
//!
//!     let log = log.borrow().clone();
//!     log
//! })
//! .unwrap();
//!
//! assert_eq!(log, ["a 0", "b 0", "a 1", "b 1"]);
//! ```
//!
//! # Platform support
//! Context switching is implemented for x86_64 Linux.

#![cfg_attr(feature = "fast_thread_local", feature(thread_local))]
#![warn(missing_docs)]

use std::io;

pub mod runtime;

pub use runtime::{
    current, run_scheduler, spawn, spawn_with_stack_size, yield_now, Config, CoroutineHandle, Id,
    State,
};
#[cfg(feature = "macros")]
pub use stackful_macros::start;

/// Failure to create a coroutine.
/// Only the caller of [spawn] is affected, the rest of the runtime keeps going.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The stack's memory couldn't be mapped.
    #[error("couldn't allocate coroutine stack: {0}")]
    Allocation(#[source] io::Error),

    /// The closure and the initial frame don't fit on the requested stack.
    #[error("stack of {size} bytes is too small, at least {required} bytes are required")]
    StackTooSmall {
        /// Usable bytes of the stack.
        size: usize,
        /// Bytes needed before the coroutine even starts.
        required: usize,
    },
}
