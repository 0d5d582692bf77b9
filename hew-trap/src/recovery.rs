//! Recovery points for unwinding out of faulting code.
//!
//! [`catch_traps`] saves the caller's register state with `sigsetjmp`
//! (`_setjmp` on Windows) and publishes the save area as the thread's
//! innermost *activation*. A resolver that claims the activation through
//! [`Fault::take_recovery`](crate::Fault::take_recovery) receives a
//! [`RecoveryHandle`]; the interception layer then writes the [`Trap`]
//! record into the save area and jumps back to it, and `catch_traps`
//! returns `Err(trap)`.
//!
//! # Safety Design
//!
//! - The jump target frame is `catch_traps` itself, which is live for as
//!   long as the activation is published.
//! - The activation slot is const-initialized TLS without a destructor, so
//!   reading it from a signal handler is a plain load.
//! - A point is armed only while `f` runs and is disarmed when claimed, so
//!   a stale handle can never be produced for a returned frame.

use std::cell::{Cell, UnsafeCell};
use std::ffi::c_void;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};

use crate::bridge::Trap;

// ── FFI bindings ────────────────────────────────────────────────────────

/// Bytes reserved for a `sigjmp_buf`.
///
/// glibc's is 200 bytes on `x86_64`; other C libraries and architectures
/// are larger, so over-allocate.
#[cfg(target_arch = "x86_64")]
const JMP_BUF_LEN: usize = 256;
#[cfg(not(target_arch = "x86_64"))]
const JMP_BUF_LEN: usize = 512;

/// Save area for `sigsetjmp` / `_setjmp`.
#[repr(C, align(16))]
pub(crate) struct JmpBuf([u8; JMP_BUF_LEN]);

impl JmpBuf {
    const fn zeroed() -> Self {
        Self([0; JMP_BUF_LEN])
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        extern "C" {
            // On glibc, sigsetjmp is a macro that expands to __sigsetjmp.
            #[cfg_attr(all(target_os = "linux", target_env = "gnu"), link_name = "__sigsetjmp")]
            fn sigsetjmp(env: *mut JmpBuf, savemask: libc::c_int) -> libc::c_int;
            fn siglongjmp(env: *mut JmpBuf, val: libc::c_int) -> !;
        }

        /// # Safety
        ///
        /// The caller's frame must stay live while `env` is jumpable.
        #[inline(always)]
        unsafe fn save(env: *mut JmpBuf) -> i32 {
            // SAFETY: forwarded from this function's contract.
            unsafe { sigsetjmp(env, 1) }
        }

        /// # Safety
        ///
        /// `env` must have been filled by [`save`] in a frame that is still
        /// live on this thread.
        unsafe fn jump(env: *mut JmpBuf) -> ! {
            // SAFETY: forwarded from this function's contract.
            unsafe { siglongjmp(env, 1) }
        }
    } else if #[cfg(windows)] {
        extern "C" {
            // A null frame makes longjmp a plain register restore with no
            // SEH unwind, which is what a jump out of a vectored handler
            // needs.
            #[link_name = "_setjmp"]
            fn setjmp(env: *mut JmpBuf, frame: *mut c_void) -> i32;
            fn longjmp(env: *mut JmpBuf, val: i32) -> !;
            fn _resetstkoflw() -> i32;
        }

        #[inline(always)]
        unsafe fn save(env: *mut JmpBuf) -> i32 {
            // SAFETY: forwarded from this function's contract.
            unsafe { setjmp(env, ptr::null_mut()) }
        }

        unsafe fn jump(env: *mut JmpBuf) -> ! {
            // SAFETY: forwarded from this function's contract.
            unsafe { longjmp(env, 1) }
        }
    }
}

// ── Recovery points ─────────────────────────────────────────────────────

/// One `catch_traps` activation.
#[repr(C)]
pub(crate) struct RecoveryPoint {
    buf: JmpBuf,
    /// Claimable by a resolver.
    armed: Cell<bool>,
    reason: Cell<u32>,
    /// Written by the interception layer just before the jump.
    trap: UnsafeCell<MaybeUninit<Trap>>,
    /// Enclosing activation, restored when this one ends.
    prev: *mut RecoveryPoint,
}

impl RecoveryPoint {
    pub(crate) const fn new() -> Self {
        Self {
            buf: JmpBuf::zeroed(),
            armed: Cell::new(false),
            reason: Cell::new(0),
            trap: UnsafeCell::new(MaybeUninit::uninit()),
            prev: ptr::null_mut(),
        }
    }
}

thread_local! {
    static ACTIVE: Cell<*mut RecoveryPoint> = const { Cell::new(ptr::null_mut()) };
}

/// Address of the calling thread's activation slot.
///
/// Stable for the lifetime of the thread; the exception-port listener
/// reads it on behalf of a suspended thread.
pub(crate) fn activation_slot() -> *const Cell<*mut RecoveryPoint> {
    ACTIVE.with(ptr::from_ref)
}

/// Claim the innermost armed point published in `slot`.
///
/// # Safety
///
/// `slot` must come from [`activation_slot`] on a thread that is either
/// the caller or suspended for the duration of the call.
pub(crate) unsafe fn take_armed(slot: *const Cell<*mut RecoveryPoint>) -> Option<RecoveryHandle> {
    // SAFETY: Caller guarantees the slot's thread is not running.
    let point = unsafe { (*slot).get() };
    let point = NonNull::new(point)?;
    // SAFETY: a published point lives in a catch_traps frame that is still
    // on the (suspended or current) stack.
    let armed = unsafe { point.as_ref() }.armed.replace(false);
    armed.then_some(RecoveryHandle {
        point,
        _not_send: PhantomData,
    })
}

/// Permission to unwind to a claimed recovery point.
///
/// Produced by [`Fault::take_recovery`](crate::Fault::take_recovery) and
/// consumed by returning it inside
/// [`TrapVerdict::Unwind`](crate::TrapVerdict::Unwind).
#[derive(Debug)]
#[must_use = "a claimed recovery point is disarmed; return it in an Unwind verdict"]
pub struct RecoveryHandle {
    point: NonNull<RecoveryPoint>,
    _not_send: PhantomData<*const ()>,
}

impl RecoveryHandle {
    /// Attach a resolver-defined trap code, reported as [`Trap::reason`].
    pub fn with_reason(self, reason: u32) -> Self {
        // SAFETY: the point outlives the handle (see take_armed).
        unsafe { self.point.as_ref() }.reason.set(reason);
        self
    }

    /// The trap code set with [`with_reason`](Self::with_reason).
    pub fn reason(&self) -> u32 {
        // SAFETY: as above.
        unsafe { self.point.as_ref() }.reason.get()
    }

    /// Convert to an opaque pointer for the C ABI.
    pub fn into_raw(self) -> *mut c_void {
        self.point.as_ptr().cast()
    }

    /// Rebuild a handle from [`into_raw`](Self::into_raw).
    ///
    /// # Safety
    ///
    /// `raw` must come from `into_raw` for a point whose `catch_traps`
    /// frame is still live, and must not be used again afterwards.
    pub unsafe fn from_raw(raw: *mut c_void) -> Self {
        // SAFETY: Caller guarantees raw is a non-null RecoveryPoint.
        let point = unsafe { NonNull::new_unchecked(raw.cast::<RecoveryPoint>()) };
        Self {
            point,
            _not_send: PhantomData,
        }
    }

    /// Write the trap record and return the bare point, for a jump that
    /// the faulting thread performs later (exception-port redirect).
    pub(crate) fn stage(self, trap: Trap) -> *mut RecoveryPoint {
        let point = self.point.as_ptr();
        // SAFETY: the point is live and nothing else reads the record
        // until the jump lands.
        unsafe {
            let reason = (*point).reason.get();
            (*(*point).trap.get()).write(Trap { reason, ..trap });
        }
        point
    }

    /// Record `trap` and jump to the recovery point.
    ///
    /// # Safety
    ///
    /// Must run on the thread that owns the point, from a context that may
    /// be abandoned (a signal or vectored exception handler, with the
    /// reentrancy guard already released).
    pub(crate) unsafe fn transfer(self, trap: Trap) -> ! {
        let point = self.stage(trap);
        // SAFETY: Caller guarantees we are on the owning thread, whose
        // catch_traps frame is below us on the stack.
        unsafe { resume_at(point) }
    }
}

/// Jump to a staged point. Entry for threads redirected by the
/// exception-port listener, which calls it as `resume_at(point)`.
///
/// # Safety
///
/// `point` must come from [`RecoveryHandle::stage`] and belong to the
/// calling thread.
pub(crate) unsafe extern "C" fn resume_at(point: *mut RecoveryPoint) -> ! {
    // SAFETY: Caller guarantees point was staged for this thread.
    unsafe { jump(&raw mut (*point).buf) }
}

/// Run `f`, turning resolved faults inside it into `Err(Trap)`.
///
/// Installs nothing by itself: handlers must already be active through
/// [`install_handlers`](crate::install_handlers), and the resolver decides
/// which faults unwind here. The calling thread is prepared with
/// [`thread_init`](crate::thread_init) on first use.
///
/// # Safety
///
/// When a fault unwinds, control leaves `f` without running destructors
/// or releasing locks held by frames between the fault and this call.
/// `f` must only run code for which that is acceptable, typically
/// generated code whose state is owned by the caller.
pub unsafe fn catch_traps<R>(f: impl FnOnce() -> R) -> Result<R, Trap> {
    if let Err(err) = crate::thread::thread_init() {
        tracing::debug!("thread preparation failed: {err}");
    }

    let mut point = RecoveryPoint::new();
    let point_ptr = &raw mut point;
    let slot = activation_slot();

    // SAFETY: point_ptr is this frame's local; the slot is ours.
    unsafe {
        (*point_ptr).prev = (*slot).get();
        (*slot).set(point_ptr);
    }
    let _published = Published {
        slot,
        point: point_ptr,
    };

    // SAFETY: this frame outlives every jump to point_ptr: `_published`
    // unpublishes the point on return and on panic.
    if unsafe { save(&raw mut (*point_ptr).buf) } == 0 {
        // SAFETY: point_ptr is live.
        unsafe { (*point_ptr).armed.set(true) };
        let value = call(f);
        // SAFETY: point_ptr is live.
        unsafe { (*point_ptr).armed.set(false) };
        Ok(value)
    } else {
        // SAFETY: stage() wrote the record before jumping here.
        let trap = unsafe { (*(*point_ptr).trap.get()).assume_init() };
        #[cfg(windows)]
        if trap.kind == crate::FaultKind::StackOverflow {
            // SAFETY: we are back on the normal stack, well above the
            // guard page that was consumed.
            unsafe { _resetstkoflw() };
        }
        Err(trap)
    }
}

/// Disarms a published recovery point and restores the enclosing
/// activation when its `catch_traps` frame is left, including by a panic
/// out of the guarded closure.
struct Published {
    slot: *const Cell<*mut RecoveryPoint>,
    point: *mut RecoveryPoint,
}

impl Drop for Published {
    fn drop(&mut self) {
        // SAFETY: both outlive this guard: the point is a local of the
        // catch_traps frame that owns the guard, the slot is thread-local.
        unsafe {
            (*self.point).armed.set(false);
            (*self.slot).set((*self.point).prev);
        }
    }
}

/// Keeps `f` out of the frame that called `save`.
#[inline(never)]
fn call<R>(f: impl FnOnce() -> R) -> R {
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FaultKind;

    fn claim() -> Option<RecoveryHandle> {
        // SAFETY: our own slot.
        unsafe { take_armed(activation_slot()) }
    }

    #[test]
    fn nothing_armed_by_default() {
        assert!(claim().is_none());
    }

    #[test]
    fn catch_traps_returns_the_value() {
        // SAFETY: f does not fault.
        let out = unsafe { catch_traps(|| 40 + 2) };
        assert_eq!(out, Ok(42));
        assert!(claim().is_none(), "point must be unpublished afterwards");
    }

    #[test]
    fn point_is_claimable_once() {
        // SAFETY: f does not fault.
        unsafe {
            catch_traps(|| {
                let first = claim();
                assert!(first.is_some());
                assert!(claim().is_none());
            })
        }
        .unwrap();
    }

    #[test]
    fn nested_activations_restore_outer() {
        // SAFETY: f does not fault.
        unsafe {
            catch_traps(|| {
                let outer = (*activation_slot()).get();
                catch_traps(|| {
                    assert_ne!((*activation_slot()).get(), outer);
                })
                .unwrap();
                assert_eq!((*activation_slot()).get(), outer);
                assert!(claim().is_some(), "outer point must still be armed");
            })
        }
        .unwrap();
    }

    #[test]
    fn transfer_lands_in_catch_traps() {
        // SAFETY: transfer runs on this thread with catch_traps live below.
        let out = unsafe {
            catch_traps::<()>(|| {
                let handle = claim().unwrap().with_reason(9);
                handle.transfer(Trap {
                    pc: 0x1234,
                    fault_address: Some(0x10),
                    kind: FaultKind::AccessViolation,
                    reason: 0,
                });
            })
        };
        let trap = out.unwrap_err();
        assert_eq!(trap.pc, 0x1234);
        assert_eq!(trap.fault_address, Some(0x10));
        assert_eq!(trap.reason, 9);
        assert!(claim().is_none());
    }

    #[test]
    fn panic_in_closure_unpublishes_the_point() {
        let out = std::panic::catch_unwind(|| {
            // SAFETY: f does not fault.
            unsafe { catch_traps::<()>(|| panic!("boom")) }
        });
        assert!(out.is_err());
        // SAFETY: our own slot.
        assert!(unsafe { (*activation_slot()).get() }.is_null());
        assert!(claim().is_none());
    }

    #[test]
    fn panic_in_nested_closure_leaves_outer_armed() {
        // SAFETY: f does not fault.
        let out = unsafe {
            catch_traps(|| {
                let outer = (*activation_slot()).get();
                let inner = std::panic::catch_unwind(|| catch_traps::<()>(|| panic!("inner")));
                assert!(inner.is_err());
                assert_eq!((*activation_slot()).get(), outer);
                let handle = claim().unwrap();
                assert_eq!(handle.into_raw(), outer.cast());
            })
        };
        assert!(out.is_ok());
        assert!(claim().is_none());
    }

    #[test]
    fn raw_round_trip_keeps_reason() {
        let mut point = RecoveryPoint::new();
        // SAFETY: point is live for the test.
        let handle = unsafe { RecoveryHandle::from_raw((&raw mut point).cast()) }.with_reason(3);
        let raw = handle.into_raw();
        // SAFETY: raw came from into_raw.
        let handle = unsafe { RecoveryHandle::from_raw(raw) };
        assert_eq!(handle.reason(), 3);
    }
}
