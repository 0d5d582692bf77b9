//! Handler-chain forwarding for the signal model.
//!
//! Installation captures whatever disposition each trapped signal had
//! before. A fault that is not ours is replayed against that disposition so
//! the process behaves exactly as if we had never been installed: an
//! embedding crash reporter still sees the signal, and a default
//! disposition still terminates the process with the original signal.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

/// Signals the interception layer installs for on this target.
#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd", target_arch = "arm"))]
pub(crate) const TRAP_SIGNALS: &[libc::c_int] =
    &[libc::SIGSEGV, libc::SIGBUS, libc::SIGILL, libc::SIGFPE];
#[cfg(not(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_arch = "arm"
)))]
pub(crate) const TRAP_SIGNALS: &[libc::c_int] = &[libc::SIGSEGV, libc::SIGILL, libc::SIGFPE];

const MAX_SIGNALS: usize = 4;

type SigInfoHandler = unsafe extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void);
type SimpleHandler = unsafe extern "C" fn(libc::c_int);

/// How a captured disposition is replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Replay {
    /// `SA_SIGINFO` handler: call it with the original arguments.
    SigInfo(usize),
    /// Plain `void (*)(int)` handler.
    Simple(usize),
    /// `SIG_DFL`/`SIG_IGN`: reinstate it and return so the faulting
    /// instruction re-executes under it.
    Restore,
}

impl Replay {
    pub(crate) fn of(action: &libc::sigaction) -> Self {
        let handler = action.sa_sigaction;
        if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
            Self::Restore
        } else if action.sa_flags & libc::SA_SIGINFO != 0 {
            Self::SigInfo(handler)
        } else {
            Self::Simple(handler)
        }
    }
}

struct Slot {
    signal: libc::c_int,
    captured: AtomicBool,
    action: UnsafeCell<MaybeUninit<libc::sigaction>>,
}

/// Dispositions that were in place before installation, one per trapped
/// signal.
pub(crate) struct PreviousHandlers {
    slots: [Slot; MAX_SIGNALS],
}

// SAFETY: each action cell is written once, by the installing thread,
// before `captured` is published with Release; readers Acquire `captured`
// first and never write.
unsafe impl Sync for PreviousHandlers {}

impl PreviousHandlers {
    pub(crate) const fn new() -> Self {
        const fn slot(signal: libc::c_int) -> Slot {
            Slot {
                signal,
                captured: AtomicBool::new(false),
                action: UnsafeCell::new(MaybeUninit::uninit()),
            }
        }
        Self {
            slots: [
                slot(libc::SIGSEGV),
                slot(libc::SIGBUS),
                slot(libc::SIGILL),
                slot(libc::SIGFPE),
            ],
        }
    }

    fn slot(&self, signal: libc::c_int) -> Option<&Slot> {
        self.slots.iter().find(|s| s.signal == signal)
    }

    /// Out-pointer for `sigaction`'s `oldact` while installing `signal`.
    ///
    /// # Safety
    ///
    /// Only the installing thread may call this, before [`publish`](Self::publish)
    /// for the same signal.
    pub(crate) unsafe fn capture_slot(&self, signal: libc::c_int) -> *mut libc::sigaction {
        self.slot(signal)
            .map_or(ptr::null_mut(), |s| s.action.get().cast())
    }

    /// Mark the disposition captured for `signal` as valid.
    pub(crate) fn publish(&self, signal: libc::c_int) {
        if let Some(slot) = self.slot(signal) {
            slot.captured.store(true, Ordering::Release);
        }
    }

    /// The captured disposition for `signal`, if installation got that far.
    pub(crate) fn get(&self, signal: libc::c_int) -> Option<&libc::sigaction> {
        let slot = self.slot(signal)?;
        if !slot.captured.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: captured implies the cell was fully written and is now
        // read-only.
        Some(unsafe { (*slot.action.get()).assume_init_ref() })
    }

    /// Put back the captured disposition for `signal`.
    pub(crate) fn restore(&self, signal: libc::c_int) {
        if let Some(prev) = self.get(signal) {
            // SAFETY: prev is a disposition the kernel handed us.
            unsafe { libc::sigaction(signal, prev, ptr::null_mut()) };
        }
    }

    /// Hand a fault we are not resolving to the previous disposition.
    ///
    /// May return, in which case the caller returns from the signal handler
    /// and the faulting instruction runs again under whatever disposition
    /// is now in place.
    ///
    /// # Safety
    ///
    /// Must be called from the signal handler with the arguments it
    /// received.
    pub(crate) unsafe fn forward(
        &self,
        signal: libc::c_int,
        info: *mut libc::siginfo_t,
        context: *mut c_void,
    ) {
        let Some(prev) = self.get(signal) else {
            // Nothing captured: fall back to the default so the re-executed
            // instruction terminates the process.
            // SAFETY: SIG_DFL is always a valid disposition.
            unsafe { libc::signal(signal, libc::SIG_DFL) };
            return;
        };

        match Replay::of(prev) {
            Replay::SigInfo(handler) => {
                // SAFETY: SA_SIGINFO guarantees the three-argument form.
                let handler: SigInfoHandler = unsafe { std::mem::transmute(handler) };
                // SAFETY: Caller passes the kernel-supplied arguments.
                unsafe { handler(signal, info, context) };
            }
            Replay::Simple(handler) => {
                // SAFETY: without SA_SIGINFO the handler takes one argument.
                let handler: SimpleHandler = unsafe { std::mem::transmute(handler) };
                // SAFETY: as above.
                unsafe { handler(signal) };
            }
            Replay::Restore => {
                // SAFETY: reinstating the disposition we replaced.
                unsafe { libc::sigaction(signal, prev, ptr::null_mut()) };
            }
        }
    }
}
