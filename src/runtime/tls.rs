//! Thread local storage for the runtime state.
//! Encapsulates the choice between `thread_local!` and the faster nightly `#[thread_local]`.

use std::cell::RefCell;

use super::{Config, RuntimeState};

/// Cache padded to avoid potential performance hit due to false sharing.
#[repr(align(128))]
struct Runtime(RefCell<Option<RuntimeState>>);

#[cfg(not(feature = "fast_thread_local"))]
thread_local! {
    /// Each thread gets its own independent runtime.
    static RUNTIME: Runtime = Runtime(RefCell::new(None));
}

#[cfg(feature = "fast_thread_local")]
#[thread_local]
static RUNTIME: Runtime = Runtime(RefCell::new(None));

#[cfg(not(feature = "fast_thread_local"))]
fn with_cell<T>(f: impl FnOnce(&RefCell<Option<RuntimeState>>) -> T) -> T {
    RUNTIME.with(|thread_local| f(&thread_local.0))
}

#[cfg(feature = "fast_thread_local")]
fn with_cell<T>(f: impl FnOnce(&RefCell<Option<RuntimeState>>) -> T) -> T {
    f(&RUNTIME.0)
}

/// Installs a runtime for the duration of `f`, then tears it down (even if `f` panics).
pub(super) fn exclusive_runtime<T>(config: Config, f: impl FnOnce() -> T) -> T {
    with_cell(|cell| {
        let mut cell = cell.borrow_mut();
        assert!(cell.is_none(), "a runtime is already running on this thread");
        *cell = Some(RuntimeState::new(config));
    });

    let _teardown = Teardown;
    f()
}

struct Teardown;

impl Drop for Teardown {
    fn drop(&mut self) {
        // dropped outside the borrow, stacks and the signal stack are unmapped on the way
        let state = with_cell(|cell| cell.borrow_mut().take());
        drop(state);
    }
}

/// Borrow the thread's runtime.
/// Never hold onto the borrow across a context switch.
///
/// # Panics
/// If no runtime is running on this thread.
pub(super) fn runtime<T>(f: impl FnOnce(&mut RuntimeState) -> T) -> T {
    with_cell(|cell| {
        let mut cell = cell.borrow_mut();
        let runtime = cell
            .as_mut()
            .expect("no runtime on this thread, call from within stackful::runtime::start");
        f(runtime)
    })
}
