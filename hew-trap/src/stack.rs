//! Stack bounds of threads that run trapping code.
//!
//! A memory fault is only a stack overflow when it lands in the guard range
//! at the low end of the faulting thread's stack. The pthread queries that
//! find that range are not async-signal-safe, so each thread records its
//! bounds once during [`thread_init`](crate::thread_init) and the fault path
//! reads the recorded copy.

use std::cell::Cell;

/// Low end of a thread's stack and the guard range around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StackBounds {
    /// Lowest stack address as reported by the thread library.
    pub(crate) low: usize,
    /// Extent of the guard range on each side of `low`.
    pub(crate) guard: usize,
}

impl StackBounds {
    /// Whether `addr` lies in the guard range.
    ///
    /// Covers both sides of `low`: glibc has reported the guard page both
    /// inside and below the stack over its history.
    pub(crate) fn guards(&self, addr: usize) -> bool {
        self.low.saturating_sub(self.guard) <= addr && addr < self.low.saturating_add(self.guard)
    }
}

thread_local! {
    static BOUNDS: Cell<Option<StackBounds>> = const { Cell::new(None) };
}

pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(4096)
}

/// Record the calling thread's stack bounds, once.
pub(crate) fn record() {
    if BOUNDS.with(Cell::get).is_none() {
        let bounds = query();
        if bounds.is_none() {
            tracing::debug!("stack bounds unavailable, using the stack-pointer window");
        }
        BOUNDS.with(|b| b.set(bounds));
    }
}

/// Bounds recorded for the calling thread, if any.
#[cfg_attr(not(hew_trap_native), allow(dead_code))]
pub(crate) fn recorded() -> Option<StackBounds> {
    BOUNDS.with(Cell::get)
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        fn query() -> Option<StackBounds> {
            // SAFETY: attr is filled by pthread_getattr_np before it is read
            // and destroyed before returning; the out-pointers are locals.
            unsafe {
                let mut attr: libc::pthread_attr_t = std::mem::zeroed();
                if libc::pthread_getattr_np(libc::pthread_self(), &raw mut attr) != 0 {
                    return None;
                }
                let mut addr: *mut libc::c_void = std::ptr::null_mut();
                let mut size: libc::size_t = 0;
                let mut guard: libc::size_t = 0;
                let found =
                    libc::pthread_attr_getstack(&raw const attr, &raw mut addr, &raw mut size) == 0;
                libc::pthread_attr_getguardsize(&raw const attr, &raw mut guard);
                libc::pthread_attr_destroy(&raw mut attr);
                (found && !addr.is_null()).then(|| StackBounds {
                    low: addr as usize,
                    guard: guard.max(page_size()),
                })
            }
        }
    } else if #[cfg(target_os = "macos")] {
        fn query() -> Option<StackBounds> {
            // SAFETY: queries on the calling thread's own handle.
            let (top, size) = unsafe {
                let this = libc::pthread_self();
                (
                    libc::pthread_get_stackaddr_np(this) as usize,
                    libc::pthread_get_stacksize_np(this),
                )
            };
            let low = top.checked_sub(size)?;
            Some(StackBounds {
                low,
                guard: page_size(),
            })
        }
    } else {
        fn query() -> Option<StackBounds> {
            None
        }
    }
}
