use std::num::NonZeroUsize;

/// Runtime settings, fixed for the lifetime of [super::start_with].
///
/// # Examples
/// ```
/// use std::num::NonZeroUsize;
///
/// let config = stackful::Config {
///     stack_size: 256 * 1024,
///     guard_pages: NonZeroUsize::new(2).unwrap(),
/// };
///
/// let output = stackful::runtime::start_with(config, || 123).unwrap();
/// assert_eq!(output, 123);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Usable bytes of stack for coroutines created by [super::spawn], rounded up to whole pages.
    ///
    /// Must cover the coroutine's deepest call nesting.
    /// Overflowing into the guard pages or past the canary aborts the process.
    pub stack_size: usize,

    /// Inaccessible pages below every stack.
    pub guard_pages: NonZeroUsize,
}

impl Config {
    /// 1 MiB of usable stack, only the touched pages are backed by physical memory.
    pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;
}

impl Default for Config {
    fn default() -> Self {
        Config {
            stack_size: Config::DEFAULT_STACK_SIZE,
            guard_pages: NonZeroUsize::MIN,
        }
    }
}
