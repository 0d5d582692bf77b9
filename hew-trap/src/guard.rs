//! Per-thread reentrancy guard for the fault handler.
//!
//! A fault raised while the handler is already resolving one (for example,
//! inside the resolver itself) must never be resolved again: it is forwarded
//! to the previous handler so the process terminates normally instead of
//! recursing. Callers check [`is_handling`] before acquiring.
//!
//! The flag is const-initialized TLS with no destructor, so touching it from
//! a signal handler never allocates or registers a TLS dtor.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static HANDLING: Cell<bool> = const { Cell::new(false) };
}

/// Whether this thread is currently inside a handling session.
#[inline]
pub fn is_handling() -> bool {
    HANDLING.with(Cell::get)
}

/// Marks the current thread as handling a fault until dropped.
///
/// Not `Send`: the mark belongs to the thread that acquired it.
#[must_use = "the guard clears the flag when dropped"]
pub struct HandlerGuard {
    _not_send: PhantomData<*const ()>,
}

impl HandlerGuard {
    /// Enter a handling session.
    ///
    /// The recursive case is routed upstream via [`is_handling`]; reaching
    /// here with the flag set is a bug in the interception layer.
    #[inline]
    pub fn enter() -> Self {
        let was = HANDLING.with(|h| h.replace(true));
        debug_assert!(!was, "fault handler re-entered without recursion check");
        Self {
            _not_send: PhantomData,
        }
    }

    /// Clear the flag before a transfer that never returns to this frame.
    ///
    /// Equivalent to dropping; spelled out at the unwind site so the ordering
    /// is visible.
    #[inline]
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for HandlerGuard {
    #[inline]
    fn drop(&mut self) {
        HANDLING.with(|h| h.set(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_starts_clear() {
        std::thread::spawn(|| assert!(!is_handling()))
            .join()
            .unwrap();
    }

    #[test]
    fn guard_sets_and_clears() {
        assert!(!is_handling());
        let guard = HandlerGuard::enter();
        assert!(is_handling());
        drop(guard);
        assert!(!is_handling());
    }

    #[test]
    fn release_clears_before_transfer() {
        let guard = HandlerGuard::enter();
        guard.release();
        assert!(!is_handling());
    }

    #[test]
    fn flag_is_per_thread() {
        let _guard = HandlerGuard::enter();
        let other = std::thread::spawn(is_handling).join().unwrap();
        assert!(!other);
        assert!(is_handling());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "re-entered")]
    fn double_enter_is_caught_in_debug() {
        let _a = HandlerGuard::enter();
        let _b = HandlerGuard::enter();
    }
}
