//! Fixed-size coroutine stacks, protected from overflow.
//!
//! Stacks grow downward: [Stack::base] is the first address past the usable memory,
//! the guard pages sit below [Stack::limit].

use std::num::NonZeroUsize;
use std::ops::Range;
use std::{ffi, io, ptr};

/// Planted at [Stack::limit], a coroutine that reaches it has overflowed its stack.
const CANARY: u64 = 0xC0DE_CAFE_F00D_D00D;

#[derive(Debug)]
pub(super) struct Stack {
    pointer: *mut u8,
    length: usize,
    guard_length: usize,
}

impl Stack {
    /// Allocates a stack with at least `usable` bytes, rounded up to whole pages.
    /// Demand paging ensures that physical memory is allocated only as necessary, during a page fault.
    /// The memory is zero-filled by the kernel.
    /// The stack is protected from overflow using guard pages and a canary.
    pub(super) fn new(usable: usize, guard_pages: NonZeroUsize) -> io::Result<Self> {
        let page_size = page_size();
        let usable_pages = usable.div_ceil(page_size).max(1);
        let (guard_length, length) = guard_pages
            .get()
            .checked_mul(page_size)
            .and_then(|guard| {
                let length = usable_pages.checked_mul(page_size)?.checked_add(guard)?;
                Some((guard, length))
            })
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;

        // kernel allocates an unused block of virtual memory
        let pointer = unsafe {
            libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if pointer == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // if guarding memory goes wrong then mmap gets cleaned up in Stack's drop
        let stack = Stack {
            pointer: pointer as *mut u8,
            length,
            guard_length,
        };
        #[cfg(test)]
        tracking::allocated();

        // located at the lowest addresses since the stack grows downward
        let result = unsafe { libc::mprotect(pointer, guard_length, libc::PROT_NONE) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        // safety: limit is page aligned and writable
        unsafe { (stack.limit() as *mut u64).write(CANARY) };

        Ok(stack)
    }

    /// Upper bound of the stack, the first frame is placed right below it.
    pub(super) fn base(&self) -> *mut u8 {
        // safety: part of same allocation, can't overflow
        unsafe { self.pointer.add(self.length) }
    }

    /// Lowest usable address, right above the guard pages.
    pub(super) fn limit(&self) -> *mut u8 {
        // safety: part of same allocation
        unsafe { self.pointer.add(self.guard_length) }
    }

    /// Addresses of the guard pages.
    pub(super) fn guard(&self) -> Range<usize> {
        self.pointer as usize..self.limit() as usize
    }

    pub(super) fn usable_len(&self) -> usize {
        self.length - self.guard_length
    }

    /// Whether the canary at the bottom of the stack was left alone.
    pub(super) fn is_intact(&self) -> bool {
        unsafe { (self.limit() as *const u64).read_volatile() == CANARY }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let result = unsafe { libc::munmap(self.pointer as *mut ffi::c_void, self.length) };
        assert_eq!(result, 0);
        #[cfg(test)]
        tracking::released();
    }
}

pub(super) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
