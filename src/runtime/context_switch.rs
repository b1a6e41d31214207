//! Abstraction over userspace multitasking.
//!
//! Everything that knows about the calling convention lives here,
//! the rest of the runtime treats a [Context] as opaque.

use std::arch::global_asm;
use std::{mem, ptr};

use super::stack::Stack;

/// Largest number of word sized arguments an [Entry] receives.
pub(super) const MAX_ARGUMENTS: usize = 3;

/// Stack pointer alignment required at a `call` instruction.
const STACK_ALIGNMENT: usize = 16;

/// Zeroed bytes kept above the initial frame, they end frame pointer walks and unwinding.
const TERMINATOR: usize = 16;

/// Default MXCSR (all exceptions masked, round to nearest) and x87 control word.
const DEFAULT_FPU_CONTROL: u64 = (0x037F << 32) | 0x1F80;

/// Bytes below the top of a stack that [prepare_stack] may write to.
pub(super) const FRAME_RESERVE: usize =
    mem::size_of::<InitialFrame>() + TERMINATOR + STACK_ALIGNMENT;

/// Function a prepared stack starts executing.
/// Unused arguments are zero.
pub(super) type Entry = extern "C" fn(usize, usize, usize);

/// Handle to a stack pointer set up for context switching.
#[repr(transparent)]
#[derive(Debug, Copy, Clone)]
pub(super) struct Continuation(*const ());

impl Continuation {
    /// Placeholder for a context that is running, [jump] fills it in when switching away.
    pub(super) const RUNNING: Continuation = Continuation(ptr::null());
}

/// Saved execution state of one coroutine, along with the stack it points into.
#[derive(Debug)]
pub(super) struct Context {
    stack: Option<Stack>,
    continuation: Continuation,
}

impl Context {
    /// The thread's original execution context, it runs on the thread's own stack.
    pub(super) fn driver() -> Self {
        Context {
            stack: None,
            continuation: Continuation::RUNNING,
        }
    }

    /// Builds a context that calls `entry` with `arguments` the first time it's jumped into.
    ///
    /// # Safety
    /// `top` must lie inside `stack` with at least [FRAME_RESERVE] bytes of it below.
    pub(super) unsafe fn build(
        stack: Stack,
        top: *mut u8,
        entry: Entry,
        arguments: &[usize],
    ) -> Self {
        debug_assert!(top <= stack.base());
        debug_assert!(top as usize - stack.limit() as usize >= FRAME_RESERVE);

        let continuation = prepare_stack(top, entry, arguments);
        Context {
            stack: Some(stack),
            continuation,
        }
    }

    pub(super) fn stack(&self) -> Option<&Stack> {
        self.stack.as_ref()
    }

    pub(super) fn into_stack(self) -> Option<Stack> {
        self.stack
    }

    pub(super) fn continuation_mut(&mut self) -> *mut Continuation {
        &mut self.continuation
    }

    pub(super) fn continuation(&self) -> *const Continuation {
        &self.continuation
    }
}

/// What [jump] pops off a stack, lowest address first.
#[repr(C)]
struct InitialFrame {
    fpu_control: u64,
    r15: usize,
    r14: usize,
    r13: usize,
    r12: usize,
    rbx: usize,
    rbp: usize,
    return_address: usize,
}

// `ret` leaves the stack pointer right above the frame, aligned for the bootstrap's `call`
const _: () = assert!(mem::size_of::<InitialFrame>() % STACK_ALIGNMENT == 0);

/// Initializes a stack for context switching.
///
/// The first [jump] into the returned continuation behaves as if `entry` was just called with `arguments`,
/// through `stackful_bootstrap` which moves them into the argument registers.
/// If `entry` returns, control lands in [entry_returned].
///
/// # Safety
/// The [FRAME_RESERVE] bytes below `top` must be writable and unused.
pub(super) unsafe fn prepare_stack(top: *mut u8, entry: Entry, arguments: &[usize]) -> Continuation {
    assert!(
        arguments.len() <= MAX_ARGUMENTS,
        "entry takes at most {MAX_ARGUMENTS} arguments, got {}",
        arguments.len()
    );
    let mut registers = [0; MAX_ARGUMENTS];
    registers[..arguments.len()].copy_from_slice(arguments);

    let frame_end = (top as usize - TERMINATOR) & !(STACK_ALIGNMENT - 1);
    ptr::write_bytes(frame_end as *mut u8, 0, TERMINATOR);

    let frame = (frame_end - mem::size_of::<InitialFrame>()) as *mut InitialFrame;
    frame.write(InitialFrame {
        fpu_control: DEFAULT_FPU_CONTROL,
        r15: entry_returned as *const () as usize,
        r14: registers[2],
        r13: registers[1],
        r12: registers[0],
        rbx: entry as *const () as usize,
        rbp: 0,
        return_address: stackful_bootstrap as *const () as usize,
    });

    Continuation(frame as *const ())
}

/// Executes a context switch.
///
/// Spills registers, sets [from] to updated stack pointer.
/// Sets stack pointer to [to], restores registers.
/// Returns once another context jumps back into [from].
///
/// # Safety
/// [to] must come from [prepare_stack] or an earlier [jump], and its stack must still be mapped.
/// Nothing may hold a borrow that the next context could need.
#[inline(always)]
pub(super) unsafe fn jump(from: *mut Continuation, to: *const Continuation) {
    stackful_jump(from, to);
}

extern "C" fn entry_returned() -> ! {
    super::die("coroutine entry returned instead of switching away");
}

extern "C" {
    fn stackful_jump(from: *mut Continuation, to: *const Continuation);

    fn stackful_bootstrap();
}

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("stackful only supports x86_64 Linux");

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
global_asm!(include_str!("assembly/x86_64.s"));
