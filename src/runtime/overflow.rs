//! Turns a coroutine's stack overflow into an abort with a diagnostic.
//!
//! A deep overflow faults on the guard pages long before the coroutine reaches a switch point,
//! where the canary would be checked. The fault is caught by a SIGSEGV/SIGBUS handler running on an
//! alternate signal stack, since the coroutine's own stack is exhausted.
//! Faults outside the running coroutine's guard pages are passed on to the previous handler.

use std::cell::Cell;
use std::io::{self, Write};
use std::ops::Range;
use std::sync::OnceLock;
use std::{ffi, mem, ptr};

use super::Id;

/// Plenty for [handle_fault], which neither allocates nor recurses.
const SIGNAL_STACK_SIZE: usize = 64 * 1024;

thread_local! {
    /// Guard pages of the running coroutine, empty while the driver runs.
    static WATCHED: Cell<Watched> = const { Cell::new(Watched::NONE) };
}

#[derive(Debug, Copy, Clone)]
struct Watched {
    guard: (usize, usize),
    id: Id,
}

impl Watched {
    const NONE: Watched = Watched {
        guard: (0, 0),
        id: Id(0),
    };

    fn contains(&self, address: usize) -> bool {
        let (start, end) = self.guard;
        start <= address && address < end
    }
}

/// Faults on `guard` are reported as coroutine `id` overflowing its stack.
pub(super) fn watch(id: Id, guard: Option<Range<usize>>) {
    let watched = match guard {
        Some(guard) => Watched {
            guard: (guard.start, guard.end),
            id,
        },
        None => Watched::NONE,
    };
    WATCHED.with(|cell| cell.set(watched));
}

struct Previous {
    segmentation: libc::sigaction,
    bus: libc::sigaction,
}

/// Handlers that were installed before ours, saved for chaining.
static PREVIOUS: OnceLock<Previous> = OnceLock::new();

/// Installs the process wide handler. Idempotent.
pub(super) fn install_handler() {
    PREVIOUS.get_or_init(|| unsafe {
        Previous {
            segmentation: replace_handler(libc::SIGSEGV),
            bus: replace_handler(libc::SIGBUS),
        }
    });
}

unsafe fn replace_handler(signal: libc::c_int) -> libc::sigaction {
    let mut action: libc::sigaction = mem::zeroed();
    action.sa_sigaction = handle_fault as *const () as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
    libc::sigemptyset(&mut action.sa_mask);

    let mut previous: libc::sigaction = mem::zeroed();
    if libc::sigaction(signal, &action, &mut previous) == -1 {
        let error = io::Error::last_os_error();
        super::die(&format!("couldn't install the stack overflow handler: {error}"));
    }
    previous
}

unsafe extern "C" fn handle_fault(
    signal: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut ffi::c_void,
) {
    let address = (*info).si_addr() as usize;
    let watched = WATCHED.try_with(Cell::get).unwrap_or(Watched::NONE);

    if watched.contains(address) {
        report_overflow(watched.id);
    }

    chain_to_previous(signal, info, context);
}

/// Async signal safe counterpart of [super::die].
fn report_overflow(id: Id) -> ! {
    let mut message = [0; 128];
    let mut cursor = io::Cursor::new(&mut message[..]);
    let _ = writeln!(cursor, "stackful: coroutine {id} overflowed its stack, aborting");
    let length = cursor.position() as usize;

    unsafe {
        libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), length);
        libc::abort()
    }
}

unsafe fn chain_to_previous(
    signal: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut ffi::c_void,
) {
    let previous = match PREVIOUS.get() {
        Some(previous) if signal == libc::SIGBUS => previous.bus,
        Some(previous) => previous.segmentation,
        None => {
            // faulted while the handlers were being replaced
            libc::signal(signal, libc::SIG_DFL);
            return;
        }
    };

    if previous.sa_flags & libc::SA_SIGINFO != 0 {
        let handler: unsafe extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut ffi::c_void) =
            mem::transmute(previous.sa_sigaction);
        handler(signal, info, context);
    } else if previous.sa_sigaction == libc::SIG_DFL || previous.sa_sigaction == libc::SIG_IGN {
        // the faulting instruction runs again, this time with the default action
        libc::signal(signal, libc::SIG_DFL);
    } else {
        let handler: unsafe extern "C" fn(libc::c_int) = mem::transmute(previous.sa_sigaction);
        handler(signal);
    }
}

/// Alternate signal stack for the current thread, installed unless the thread already has one.
#[derive(Debug)]
pub(super) struct SignalStack {
    pointer: *mut ffi::c_void,
    previous: libc::stack_t,
}

impl SignalStack {
    pub(super) fn install() -> io::Result<Option<Self>> {
        let mut current: libc::stack_t = unsafe { mem::zeroed() };
        if unsafe { libc::sigaltstack(ptr::null(), &mut current) } == -1 {
            return Err(io::Error::last_os_error());
        }
        if current.ss_flags & libc::SS_DISABLE == 0 {
            return Ok(None);
        }

        let pointer = unsafe {
            libc::mmap(
                ptr::null_mut(),
                SIGNAL_STACK_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if pointer == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let stack = libc::stack_t {
            ss_sp: pointer,
            ss_flags: 0,
            ss_size: SIGNAL_STACK_SIZE,
        };
        if unsafe { libc::sigaltstack(&stack, ptr::null_mut()) } == -1 {
            let error = io::Error::last_os_error();
            unsafe { libc::munmap(pointer, SIGNAL_STACK_SIZE) };
            return Err(error);
        }

        Ok(Some(SignalStack {
            pointer,
            previous: current,
        }))
    }
}

impl Drop for SignalStack {
    fn drop(&mut self) {
        unsafe {
            libc::sigaltstack(&self.previous, ptr::null_mut());
            libc::munmap(self.pointer, SIGNAL_STACK_SIZE);
        }
    }
}
