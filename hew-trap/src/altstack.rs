//! Per-thread alternate signal stacks.
//!
//! A stack overflow leaves no room on the faulting stack to run the
//! handler, so every thread that may fault gets its own signal stack with
//! a `PROT_NONE` guard page below it. An already registered stack that is
//! large enough (for example the one libstd installs for its own overflow
//! reporting on the main thread) is reused. Stacks we allocate are
//! unregistered and unmapped when the thread exits.

use std::cell::RefCell;
use std::ptr;

use crate::error::InstallError;
use crate::stack::page_size;

enum AltStack {
    Unset,
    /// An existing registration was large enough.
    Inherited,
    Allocated { base: *mut libc::c_void, len: usize },
}

thread_local! {
    static ALT_STACK: RefCell<AltStack> = const { RefCell::new(AltStack::Unset) };
}

/// Make sure the calling thread has an alternate signal stack of at least
/// `size` usable bytes.
pub(crate) fn ensure(size: usize) -> Result<(), InstallError> {
    ALT_STACK.with(|slot| {
        let mut slot = slot.borrow_mut();
        if !matches!(*slot, AltStack::Unset) {
            return Ok(());
        }

        // SAFETY: querying only; old is a valid out-pointer.
        let mut old: libc::stack_t = unsafe { std::mem::zeroed() };
        // SAFETY: as above.
        if unsafe { libc::sigaltstack(ptr::null(), &raw mut old) } != 0 {
            return Err(InstallError::AltStack(InstallError::last_errno()));
        }
        if old.ss_flags & libc::SS_DISABLE == 0 && old.ss_size >= size {
            *slot = AltStack::Inherited;
            return Ok(());
        }

        let guard = page_size();
        let usable = size.next_multiple_of(guard);
        let len = guard + usable;

        // SAFETY: fresh anonymous mapping; MAP_FAILED is checked.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(InstallError::AltStack(InstallError::last_errno()));
        }

        // Everything above the guard page becomes the stack.
        let stack = base.cast::<u8>().wrapping_add(guard).cast::<libc::c_void>();
        let new = libc::stack_t {
            ss_sp: stack,
            ss_flags: 0,
            ss_size: usable,
        };
        // SAFETY: stack..stack+usable lies inside the mapping created above.
        let registered = unsafe {
            libc::mprotect(stack, usable, libc::PROT_READ | libc::PROT_WRITE) == 0
                && libc::sigaltstack(&raw const new, ptr::null_mut()) == 0
        };
        if !registered {
            let errno = InstallError::last_errno();
            // SAFETY: base/len describe the mapping created above.
            unsafe { libc::munmap(base, len) };
            return Err(InstallError::AltStack(errno));
        }

        tracing::trace!(size = usable, "registered alternate signal stack");
        *slot = AltStack::Allocated { base, len };
        Ok(())
    })
}

impl Drop for AltStack {
    fn drop(&mut self) {
        let Self::Allocated { base, len } = *self else {
            return;
        };
        let disable = libc::stack_t {
            ss_sp: ptr::null_mut(),
            ss_flags: libc::SS_DISABLE,
            ss_size: 0,
        };
        // SAFETY: the thread is exiting and no longer handling signals on
        // this stack; base/len describe our mapping.
        unsafe {
            libc::sigaltstack(&raw const disable, ptr::null_mut());
            let r = libc::munmap(base, len);
            debug_assert_eq!(r, 0, "munmap of alternate signal stack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current() -> libc::stack_t {
        // SAFETY: query only.
        unsafe {
            let mut ss: libc::stack_t = std::mem::zeroed();
            assert_eq!(libc::sigaltstack(ptr::null(), &raw mut ss), 0);
            ss
        }
    }

    #[test]
    fn fresh_thread_gets_a_stack() {
        std::thread::spawn(|| {
            ensure(64 * 1024).unwrap();
            let ss = current();
            assert_eq!(ss.ss_flags & libc::SS_DISABLE, 0);
            assert!(ss.ss_size >= 64 * 1024);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn ensure_is_idempotent() {
        std::thread::spawn(|| {
            ensure(64 * 1024).unwrap();
            let first = current().ss_sp;
            ensure(64 * 1024).unwrap();
            assert_eq!(current().ss_sp, first);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn large_enough_stack_is_reused() {
        std::thread::spawn(|| {
            ensure(128 * 1024).unwrap();
            let ours = current().ss_sp;
            // Forget the allocation without unmapping it, as a caller that
            // registered its own stack would look.
            let allocated = ALT_STACK.with(|slot| slot.replace(AltStack::Unset));
            ensure(64 * 1024).unwrap();
            assert_eq!(current().ss_sp, ours);
            ALT_STACK.with(|slot| assert!(matches!(*slot.borrow(), AltStack::Inherited)));
            ALT_STACK.with(|slot| *slot.borrow_mut() = allocated);
        })
        .join()
        .unwrap();
    }
}
