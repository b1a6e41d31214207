//! Stackful coroutines, scheduled cooperatively in round-robin order on a single thread.
//!
//! The thread that calls [start] becomes the driver, the first participant of the rotation.
//! Every [spawn]ed coroutine gets its own stack and joins the end of the rotation.
//! [yield_now] suspends the running coroutine, however deep inside nested calls it is,
//! and resumes the next one where it last left off.

use std::any::Any;
use std::collections::VecDeque;
use std::{fmt, marker, mem, panic, process, ptr, thread};

mod config;
mod context_switch;
mod overflow;
mod scheduler;
mod stack;
mod tls;

pub use config::Config;

use context_switch::{Context, Continuation};

/// Runs `f` as the driver of a fresh runtime on the current thread.
///
/// Coroutines still alive once `f` returns are cancelled.
/// Suspended ones unwind from their pending [yield_now], running their destructors,
/// and those that never started are dropped without running.
/// Returns `Err` if `f` panicked, or a coroutine panicked.
///
/// # Panics
/// If a runtime is already running on this thread.
pub fn start<F: FnOnce() -> T, T>(f: F) -> thread::Result<T> {
    start_with(Config::default(), f)
}

/// [start] with custom settings.
pub fn start_with<F: FnOnce() -> T, T>(config: Config, f: F) -> thread::Result<T> {
    tls::exclusive_runtime(config, || {
        let output = panic::catch_unwind(panic::AssertUnwindSafe(f));
        cancel_remaining();
        let output = output?;

        match tls::runtime(|runtime| runtime.panics.pop_front()) {
            Some(payload) => Err(payload),
            None => Ok(output),
        }
    })
}

/// Spawns a new coroutine with the configured stack size, it runs once the rotation reaches it.
///
/// The closure's captures are the coroutine's arguments, they're moved onto its own stack.
///
/// # Panics
/// If no runtime is running on this thread.
pub fn spawn<F: FnOnce() + 'static>(f: F) -> Result<CoroutineHandle, crate::Error> {
    let stack_size = tls::runtime(|runtime| runtime.config.stack_size);
    spawn_with_stack_size(stack_size, f)
}

/// Spawns a new coroutine with at least `stack_size` usable bytes of stack.
///
/// The stack must fit the coroutine's deepest call nesting,
/// running past it aborts the process.
pub fn spawn_with_stack_size<F: FnOnce() + 'static>(
    stack_size: usize,
    f: F,
) -> Result<CoroutineHandle, crate::Error> {
    let guard_pages = tls::runtime(|runtime| runtime.config.guard_pages);

    // allocated outside the runtime borrow, so that a failure can drop f safely
    let stack = stack::Stack::new(stack_size, guard_pages).map_err(crate::Error::Allocation)?;
    let (context, closure) = build_context(stack, f)?;

    let (key, id) = tls::runtime(|runtime| runtime.register(context, closure));
    Ok(CoroutineHandle::new(key, id))
}

/// Moves `f` to the top of `stack` and prepares the stack to run it.
fn build_context<F: FnOnce() + 'static>(
    stack: stack::Stack,
    f: F,
) -> Result<(Context, EntryClosure), crate::Error> {
    let size = stack.usable_len();
    let alignment = mem::align_of::<F>().max(16);

    let closure = (stack.base() as usize)
        .checked_sub(mem::size_of::<F>())
        .map(|address| address & !(alignment - 1));
    // the canary must stay clear of the initial frame
    let required = closure.map(|closure| {
        stack.base() as usize - closure + context_switch::FRAME_RESERVE + mem::size_of::<u64>()
    });
    let closure = match (closure, required) {
        (Some(closure), Some(required)) if required <= size => closure,
        _ => {
            let required = mem::size_of::<F>() + alignment + context_switch::FRAME_RESERVE;
            return Err(crate::Error::StackTooSmall { size, required });
        }
    };

    let closure = closure as *mut F;
    // safety: the closure and the frame below it lie within the usable part of the stack
    unsafe {
        closure.write(f);
        let context = Context::build(
            stack,
            closure as *mut u8,
            coroutine_main::<F>,
            &[closure as usize],
        );
        Ok((context, EntryClosure::new(closure)))
    }
}

/// First Rust code that runs on a coroutine's stack.
extern "C" fn coroutine_main<F: FnOnce()>(closure: usize, _: usize, _: usize) {
    let cancelled = tls::runtime(|runtime| {
        runtime.release_retired();
        let entry = runtime.running().closure.take().expect("coroutine started twice");
        entry.disarm();
        runtime.cancelling
    });
    // safety: build_context wrote an F there, and it was just disarmed
    let f = unsafe { (closure as *const F).read() };

    // spawned during teardown, it never gets to run
    let result = if cancelled {
        panic::catch_unwind(panic::AssertUnwindSafe(move || drop(f)))
    } else {
        panic::catch_unwind(panic::AssertUnwindSafe(f))
    };

    match result {
        Ok(()) => {}
        Err(payload) if payload.is::<Cancelled>() => {
            tls::runtime(|runtime| log::trace!("coroutine {} cancelled", runtime.running().id));
        }
        Err(payload) => tls::runtime(|runtime| {
            log::debug!("coroutine {} panicked", runtime.running().id);
            runtime.panics.push_back(payload);
        }),
    }

    finish()
}

/// Terminates the running coroutine and switches to its successor, never to return.
fn finish() -> ! {
    // the stack stays mapped until the successor releases it
    let mut dummy = mem::MaybeUninit::uninit();
    let next = tls::runtime(|runtime| runtime.retire_running());
    unsafe { context_switch::jump(dummy.as_mut_ptr(), next) };
    unreachable!()
}

/// Suspends the running coroutine and resumes the next one in the rotation.
///
/// Returns once the rotation comes back around, immediately if nothing else is running.
///
/// # Panics
/// If no runtime is running on this thread.
/// When called by the driver, resumes the panic of any coroutine that panicked in the meantime.
pub fn yield_now() {
    switch();
    propagate_panic();
}

/// Unwinds out of a suspended coroutine during teardown.
struct Cancelled;

/// Resumes the next coroutine in the rotation, returns once the rotation comes back around.
fn switch() {
    let Some((from, to)) = tls::runtime(|runtime| runtime.switch_to_next()) else {
        return;
    };

    unsafe { context_switch::jump(from, to) };

    let cancelled = tls::runtime(|runtime| {
        runtime.release_retired();
        runtime.cancelling && !runtime.is_driver_running()
    });
    // destructors of a coroutine that's already unwinding may still yield
    if cancelled && !thread::panicking() {
        panic::resume_unwind(Box::new(Cancelled));
    }
}

/// Cancels every coroutine that's still alive, so that nothing refers to their stacks once released.
fn cancel_remaining() {
    let live = tls::runtime(|runtime| {
        runtime.cancelling = true;
        runtime.scheduler.len() - 1
    });
    if live > 0 {
        log::debug!("cancelling {live} live coroutines");
    }

    loop {
        // dropped outside the borrow, since closures may use the runtime in their drop glue
        let unstarted = tls::runtime(RuntimeState::discard_unstarted);
        drop(unstarted);

        if tls::runtime(|runtime| runtime.scheduler.len() == 1) {
            break;
        }
        switch();
    }
}

/// Keeps yielding until every spawned coroutine has terminated.
///
/// # Panics
/// If not called by the driver.
pub fn run_scheduler() {
    assert!(
        tls::runtime(|runtime| runtime.is_driver_running()),
        "run_scheduler must be called by the driver"
    );

    while tls::runtime(|runtime| runtime.scheduler.len() > 1) {
        yield_now();
    }
}

/// Identifies the running coroutine, or the driver.
pub fn current() -> Id {
    tls::runtime(|runtime| runtime.running().id)
}

fn propagate_panic() {
    let payload = tls::runtime(|runtime| {
        if runtime.is_driver_running() {
            runtime.panics.pop_front()
        } else {
            None
        }
    });

    if let Some(payload) = payload {
        panic::resume_unwind(payload);
    }
}

/// Logs and aborts, for broken invariants that can't be unwound from.
pub(crate) fn die(message: &str) -> ! {
    log::error!("{message}, aborting");
    eprintln!("stackful: {message}, aborting");
    process::abort();
}

struct RuntimeState {
    config: Config,
    coroutines: slab::Slab<Coroutine>,
    scheduler: scheduler::RoundRobin<Key>,
    driver: Key,
    next_id: u64,
    /// Stacks of terminated coroutines, released once execution has moved off them.
    retired: Vec<stack::Stack>,
    /// Payloads of coroutine panics, resumed on the driver.
    panics: VecDeque<Box<dyn Any + Send + 'static>>,
    /// Set once the driver has returned, resumed coroutines unwind.
    cancelling: bool,
    _signal_stack: Option<overflow::SignalStack>,
}

impl RuntimeState {
    fn new(config: Config) -> Self {
        let mut coroutines = slab::Slab::new();
        let driver = Key(coroutines.insert(Coroutine {
            id: Id(0),
            state: State::Running,
            closure: None,
            context: Context::driver(),
        }));

        overflow::install_handler();
        let signal_stack = overflow::SignalStack::install().unwrap_or_else(|error| {
            log::warn!("no alternate signal stack, stack overflows will crash silently: {error}");
            None
        });

        RuntimeState {
            config,
            coroutines,
            scheduler: scheduler::RoundRobin::new(driver),
            driver,
            next_id: 1,
            retired: Vec::new(),
            panics: VecDeque::new(),
            cancelling: false,
            _signal_stack: signal_stack,
        }
    }

    fn register(&mut self, context: Context, closure: EntryClosure) -> (Key, Id) {
        let id = Id(self.next_id);
        self.next_id += 1;

        log::debug!(
            "spawned coroutine {id} with {} bytes of stack",
            context.stack().map_or(0, stack::Stack::usable_len)
        );

        let key = Key(self.coroutines.insert(Coroutine {
            id,
            state: State::NotStarted,
            closure: Some(closure),
            context,
        }));
        self.scheduler.register(key);

        (key, id)
    }

    fn running(&mut self) -> &mut Coroutine {
        let key = self.scheduler.current();
        &mut self.coroutines[key.0]
    }

    fn is_driver_running(&self) -> bool {
        self.scheduler.current() == self.driver
    }

    /// Suspends the running coroutine and selects its successor.
    /// Returns where to save the running context and where to load the next one from,
    /// or nothing if the running coroutine is alone.
    fn switch_to_next(&mut self) -> Option<(*mut Continuation, *const Continuation)> {
        let current = self.scheduler.current();
        let next = self.scheduler.advance();
        if next == current {
            return None;
        }

        self.check_stack(current);
        let coroutine = &mut self.coroutines[current.0];
        coroutine.state = State::Suspended;
        let from = coroutine.context.continuation_mut();

        Some((from, self.enter(next)))
    }

    /// Removes the running coroutine and selects its successor.
    fn retire_running(&mut self) -> *const Continuation {
        let key = self.scheduler.current();
        assert_ne!(key, self.driver, "the driver can't terminate");
        self.check_stack(key);

        let coroutine = self.coroutines.remove(key.0);
        self.scheduler.remove(key);
        log::debug!("coroutine {} terminated", coroutine.id);

        if let Some(stack) = coroutine.context.into_stack() {
            self.retired.push(stack);
        }

        let next = self.scheduler.current();
        self.enter(next)
    }

    /// Marks `key` as running, returning its saved context.
    fn enter(&mut self, key: Key) -> *const Continuation {
        if !self.scheduler.contains(key) {
            die("invalid switch target: coroutine isn't part of the rotation");
        }
        let Some(coroutine) = self.coroutines.get_mut(key.0) else {
            die("invalid switch target: coroutine was released");
        };

        match coroutine.state {
            State::NotStarted => log::trace!("starting coroutine {}", coroutine.id),
            State::Suspended => log::trace!("resuming coroutine {}", coroutine.id),
            State::Running | State::Terminated => {
                let (id, state) = (coroutine.id, coroutine.state);
                die(&format!("invalid switch target: coroutine {id} is {state:?}"))
            }
        }

        coroutine.state = State::Running;
        let guard = coroutine.context.stack().map(stack::Stack::guard);
        overflow::watch(coroutine.id, guard);
        coroutine.context.continuation()
    }

    fn check_stack(&self, key: Key) {
        let coroutine = &self.coroutines[key.0];
        if let Some(stack) = coroutine.context.stack() {
            if !stack.is_intact() {
                die(&format!("coroutine {} overflowed its stack", coroutine.id));
            }
        }
    }

    /// Removes the coroutines that haven't started yet, handing them over for dropping.
    fn discard_unstarted(&mut self) -> Vec<Coroutine> {
        let unstarted: Vec<_> = self
            .scheduler
            .iter()
            .filter(|key| self.coroutines[key.0].state == State::NotStarted)
            .collect();

        unstarted
            .into_iter()
            .map(|key| {
                self.scheduler.remove(key);
                self.coroutines.remove(key.0)
            })
            .collect()
    }

    fn release_retired(&mut self) {
        self.retired.clear();
    }

    fn state_of(&self, key: Key, id: Id) -> State {
        match self.coroutines.get(key.0) {
            Some(coroutine) if coroutine.id == id => coroutine.state,
            _ => State::Terminated,
        }
    }
}

/// Slab index of a live coroutine, reused after it terminates.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Key(usize);

#[derive(Debug)]
struct Coroutine {
    id: Id,
    state: State,
    /// Dropped before the context, since it lives on the context's stack.
    closure: Option<EntryClosure>,
    context: Context,
}

/// A closure waiting at the top of its coroutine's stack for the coroutine to start.
/// Dropping it drops the closure in place.
#[derive(Debug)]
struct EntryClosure {
    pointer: *mut u8,
    drop: unsafe fn(*mut u8),
}

impl EntryClosure {
    fn new<F>(pointer: *mut F) -> Self {
        unsafe fn drop_closure<F>(pointer: *mut u8) {
            ptr::drop_in_place(pointer as *mut F);
        }

        EntryClosure {
            pointer: pointer as *mut u8,
            drop: drop_closure::<F>,
        }
    }

    /// Hands ownership of the closure over to the coroutine.
    fn disarm(self) {
        mem::forget(self);
    }
}

impl Drop for EntryClosure {
    fn drop(&mut self) {
        unsafe { (self.drop)(self.pointer) };
    }
}

/// Stable identifier of a coroutine, never reused within a runtime.
/// The driver is always `0`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u64);

impl Id {
    /// Whether this identifies the driver.
    pub fn is_driver(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a coroutine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    /// Spawned, waiting for its first turn.
    NotStarted,
    /// Yielded, waiting for its next turn.
    Suspended,
    /// Currently executing.
    Running,
    /// Returned, panicked or got cancelled, its stack is gone.
    Terminated,
}

/// Handle for inspecting or joining a coroutine.
///
/// Dropping the handle doesn't affect the coroutine.
#[derive(Debug)]
pub struct CoroutineHandle {
    key: Key,
    id: Id,
    _not_send: marker::PhantomData<*const ()>,
}

impl CoroutineHandle {
    fn new(key: Key, id: Id) -> Self {
        CoroutineHandle {
            key,
            id,
            _not_send: marker::PhantomData,
        }
    }

    /// Identifier of the coroutine.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Where the coroutine is in its lifecycle.
    ///
    /// # Panics
    /// If the runtime that spawned the coroutine is gone.
    pub fn state(&self) -> State {
        tls::runtime(|runtime| runtime.state_of(self.key, self.id))
    }

    /// Whether the coroutine has terminated.
    pub fn is_finished(&self) -> bool {
        self.state() == State::Terminated
    }

    /// Yields until the coroutine has terminated.
    ///
    /// # Panics
    /// If called by the coroutine itself.
    pub fn join(self) {
        assert_ne!(current(), self.id, "a coroutine can't join itself");

        while !self.is_finished() {
            yield_now();
        }
    }
}
