//! Trap resolver bridge.
//!
//! Every interception model reduces a hardware fault to a [`Fault`] and
//! hands it to [`dispatch`], which consults the registered
//! [`TrapResolver`] under the reentrancy guard and turns its verdict into an
//! [`Action`] for the caller to carry out. The bridge never touches
//! registers itself; the resolver is given the context and decides.

use std::cell::Cell;
use std::ffi::c_void;
use std::ptr;

use crate::context::RegisterContext;
use crate::guard::{self, HandlerGuard};
use crate::recovery::{self, RecoveryHandle, RecoveryPoint};
use crate::stats::TrapStats;

/// What kind of hardware fault was intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum FaultKind {
    /// Load or store to an unmapped or protected address.
    AccessViolation = 0,
    /// Access into the guard region below the stack pointer.
    StackOverflow = 1,
    /// Undefined or privileged instruction.
    IllegalInstruction = 2,
    /// Integer division by zero.
    IntegerDivideByZero = 3,
    /// Integer overflow trap (`INT_MIN / -1` on x86).
    IntegerOverflow = 4,
    /// Any other arithmetic exception.
    Arithmetic = 5,
}

/// Without recorded stack bounds, a memory fault this far below the stack
/// pointer still counts as stack growth.
#[cfg(unix)]
const STACK_GUARD_WINDOW: usize = 64 * 1024;

impl FaultKind {
    /// Classify a memory fault from its data address, the faulting thread's
    /// stack pointer and, when recorded, its stack bounds.
    ///
    /// Stacks grow down, so an address at or above the stack pointer is
    /// never an overflow.
    #[cfg(unix)]
    #[cfg_attr(not(hew_trap_native), allow(dead_code))]
    pub(crate) fn memory(
        address: Option<usize>,
        sp: usize,
        stack: Option<crate::stack::StackBounds>,
    ) -> Self {
        let Some(addr) = address else {
            return Self::AccessViolation;
        };
        if sp == 0 || addr >= sp {
            return Self::AccessViolation;
        }
        let overflow = match stack {
            Some(bounds) => bounds.guards(addr),
            None => sp - addr < STACK_GUARD_WINDOW,
        };
        if overflow {
            Self::StackOverflow
        } else {
            Self::AccessViolation
        }
    }

    /// Decode the C ABI representation.
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => Self::AccessViolation,
            1 => Self::StackOverflow,
            2 => Self::IllegalInstruction,
            3 => Self::IntegerDivideByZero,
            4 => Self::IntegerOverflow,
            5 => Self::Arithmetic,
            _ => return None,
        })
    }
}

/// Record of a fault that was resolved by unwinding to a recovery point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trap {
    /// Program counter of the faulting instruction.
    pub pc: usize,
    /// Data address that faulted, for memory faults.
    pub fault_address: Option<usize>,
    /// Classification of the fault.
    pub kind: FaultKind,
    /// Resolver-supplied trap code, see [`RecoveryHandle::with_reason`].
    pub reason: u32,
}

/// A fault being offered to the resolver.
pub struct Fault<'a> {
    kind: FaultKind,
    pc: usize,
    address: Option<usize>,
    context: &'a mut dyn RegisterContext,
    activation: *const Cell<*mut RecoveryPoint>,
}

impl<'a> Fault<'a> {
    /// A fault on the calling thread.
    pub(crate) fn new(
        kind: FaultKind,
        address: Option<usize>,
        context: &'a mut dyn RegisterContext,
    ) -> Self {
        // SAFETY: this thread's slot; the fault never outlives the thread.
        unsafe { Self::for_thread(kind, address, context, recovery::activation_slot()) }
    }

    /// A fault on another (suspended) thread whose activation slot is known.
    ///
    /// # Safety
    ///
    /// `activation` must be null or the activation slot of the thread that
    /// faulted, and that thread must stay suspended while the fault is live.
    pub(crate) unsafe fn for_thread(
        kind: FaultKind,
        address: Option<usize>,
        context: &'a mut dyn RegisterContext,
        activation: *const Cell<*mut RecoveryPoint>,
    ) -> Self {
        Self {
            kind,
            pc: context.pc(),
            address,
            context,
            activation,
        }
    }

    /// Program counter of the faulting instruction.
    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    /// Faulting data address, when the OS reports one.
    pub fn address(&self) -> Option<usize> {
        self.address
    }

    pub fn context(&self) -> &dyn RegisterContext {
        self.context
    }

    /// Mutable register access for a resolver that repairs the fault in
    /// place (for example by stepping over the instruction).
    pub fn context_mut(&mut self) -> &mut dyn RegisterContext {
        self.context
    }

    /// Claim the innermost armed recovery point of the faulting thread.
    ///
    /// Returns `None` when the thread is not inside
    /// [`catch_traps`](crate::catch_traps) or the point was already claimed.
    /// A claimed point is disarmed, so a second fault in the same
    /// activation cannot claim it again.
    pub fn take_recovery(&mut self) -> Option<RecoveryHandle> {
        if self.activation.is_null() {
            return None;
        }
        // SAFETY: for_thread's contract keeps the slot and its owner alive.
        unsafe { recovery::take_armed(self.activation) }
    }

    pub(crate) fn trap(&self) -> Trap {
        Trap {
            pc: self.pc,
            fault_address: self.address,
            kind: self.kind,
            reason: 0,
        }
    }
}

impl std::fmt::Debug for Fault<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fault")
            .field("kind", &self.kind)
            .field("pc", &format_args!("{:#x}", self.pc))
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Resolver decision for one fault.
#[derive(Debug)]
pub enum TrapVerdict {
    /// Not a fault generated by managed code; forward it.
    NotOurs,
    /// The resolver repaired the condition; re-execute or continue at the
    /// (possibly adjusted) context.
    ResolvedInPlace,
    /// Abandon the faulting code and resume at this recovery point.
    Unwind(RecoveryHandle),
}

/// Decides whether a fault belongs to managed code.
///
/// Called on the faulting thread from signal or vectored-exception context,
/// or on the exception listener thread while the faulting thread is
/// suspended. Implementations must not allocate, lock, or panic.
pub trait TrapResolver: Sync {
    fn resolve(&self, fault: &mut Fault<'_>) -> TrapVerdict;
}

impl<F> TrapResolver for F
where
    F: Fn(&mut Fault<'_>) -> TrapVerdict + Sync,
{
    fn resolve(&self, fault: &mut Fault<'_>) -> TrapVerdict {
        self(fault)
    }
}

/// What the interception layer must do next.
#[derive(Debug)]
pub(crate) enum Action {
    /// Return and let the thread continue at its (possibly patched) context.
    Resume,
    /// Hand the fault to the previously installed handler.
    Forward,
    /// Transfer control to the recovery point. The guard is already clear.
    Unwind(RecoveryHandle, Trap),
}

/// Consult the resolver for one fault.
pub(crate) fn dispatch(
    resolver: &dyn TrapResolver,
    stats: &TrapStats,
    fault: &mut Fault<'_>,
) -> Action {
    if guard::is_handling() {
        stats.record_recursive();
        return Action::Forward;
    }

    let guard = HandlerGuard::enter();
    match resolver.resolve(fault) {
        TrapVerdict::NotOurs => {
            drop(guard);
            stats.record_forwarded();
            Action::Forward
        }
        TrapVerdict::ResolvedInPlace => {
            drop(guard);
            stats.record_resolved_in_place();
            Action::Resume
        }
        TrapVerdict::Unwind(handle) => {
            let trap = fault.trap();
            // Control never comes back to this frame, so the flag must be
            // clear before the transfer.
            guard.release();
            stats.record_unwound();
            Action::Unwind(handle, trap)
        }
    }
}

// ── C ABI ───────────────────────────────────────────────────────────────

/// # Safety
///
/// `fault` must be null or the pointer handed to the C resolver, used only
/// for the duration of that resolve call.
unsafe fn fault_ref<'a>(fault: *const c_void) -> Option<&'a Fault<'a>> {
    // SAFETY: Caller guarantees the pointer is null or a live Fault.
    unsafe { fault.cast::<Fault<'a>>().as_ref() }
}

/// Program counter of the fault being resolved, or 0 for a null fault.
///
/// # Safety
///
/// `fault` must be null or the pointer passed to the C resolver.
#[no_mangle]
pub unsafe extern "C" fn hew_trap_fault_pc(fault: *const c_void) -> usize {
    // SAFETY: forwarded from this function's contract.
    unsafe { fault_ref(fault).map_or(0, Fault::pc) }
}

/// Faulting data address, or 0 when none was reported.
///
/// # Safety
///
/// `fault` must be null or the pointer passed to the C resolver.
#[no_mangle]
pub unsafe extern "C" fn hew_trap_fault_address(fault: *const c_void) -> usize {
    // SAFETY: forwarded from this function's contract.
    unsafe { fault_ref(fault).and_then(Fault::address).unwrap_or(0) }
}

/// [`FaultKind`] as an integer, or -1 for a null fault.
///
/// # Safety
///
/// `fault` must be null or the pointer passed to the C resolver.
#[no_mangle]
pub unsafe extern "C" fn hew_trap_fault_kind(fault: *const c_void) -> i32 {
    // SAFETY: forwarded from this function's contract.
    unsafe { fault_ref(fault).map_or(-1, |f| f.kind() as i32) }
}

/// Claim the innermost armed recovery point; null when there is none.
///
/// The returned handle is consumed by returning it in an unwind verdict.
///
/// # Safety
///
/// `fault` must be null or the pointer passed to the C resolver.
#[no_mangle]
pub unsafe extern "C" fn hew_trap_fault_take_recovery(fault: *mut c_void) -> *mut c_void {
    // SAFETY: as for fault_ref, and the resolver holds the only reference.
    let Some(fault) = (unsafe { fault.cast::<Fault<'_>>().as_mut() }) else {
        return ptr::null_mut();
    };
    fault
        .take_recovery()
        .map_or(ptr::null_mut(), RecoveryHandle::into_raw)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::context::testing::FakeContext;

    fn fault(cx: &mut FakeContext) -> Fault<'_> {
        Fault::new(FaultKind::AccessViolation, Some(0x10), cx)
    }

    #[test]
    fn not_ours_forwards() {
        let stats = TrapStats::new();
        let mut cx = FakeContext {
            pc: 0x4000,
            ..FakeContext::default()
        };
        let resolver = |_: &mut Fault<'_>| TrapVerdict::NotOurs;
        let action = dispatch(&resolver, &stats, &mut fault(&mut cx));
        assert!(matches!(action, Action::Forward));
        assert!(!guard::is_handling());
        assert_eq!(stats.snapshot().forwarded, 1);
    }

    #[test]
    fn resolved_in_place_keeps_resolver_edits() {
        let stats = TrapStats::new();
        let mut cx = FakeContext {
            pc: 0x4000,
            ..FakeContext::default()
        };
        let resolver = |f: &mut Fault<'_>| {
            assert_eq!(f.pc(), 0x4000);
            assert_eq!(f.address(), Some(0x10));
            f.context_mut().set_pc(0x4004);
            TrapVerdict::ResolvedInPlace
        };
        let action = dispatch(&resolver, &stats, &mut fault(&mut cx));
        assert!(matches!(action, Action::Resume));
        assert_eq!(cx.pc, 0x4004);
        assert!(!guard::is_handling());
        assert_eq!(stats.snapshot().resolved_in_place, 1);
    }

    #[test]
    fn resolver_runs_under_the_guard() {
        let stats = TrapStats::new();
        let mut cx = FakeContext::default();
        let resolver = |_: &mut Fault<'_>| {
            assert!(guard::is_handling());
            TrapVerdict::NotOurs
        };
        dispatch(&resolver, &stats, &mut fault(&mut cx));
    }

    #[test]
    fn recursive_fault_is_forwarded_without_resolving() {
        let stats = TrapStats::new();
        let calls = AtomicUsize::new(0);
        let resolver = |_: &mut Fault<'_>| {
            calls.fetch_add(1, Ordering::Relaxed);
            TrapVerdict::ResolvedInPlace
        };
        let mut cx = FakeContext::default();

        let outer = HandlerGuard::enter();
        let action = dispatch(&resolver, &stats, &mut fault(&mut cx));
        assert!(matches!(action, Action::Forward));
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        assert!(guard::is_handling(), "outer session must stay marked");
        drop(outer);

        let snap = stats.snapshot();
        assert_eq!(snap.recursive, 1);
        assert_eq!(snap.forwarded, 0);
    }

    #[test]
    fn no_recovery_outside_catch_traps() {
        let mut cx = FakeContext::default();
        let mut f = fault(&mut cx);
        assert!(f.take_recovery().is_none());
    }

    #[test]
    fn unwind_clears_guard_and_records_trap() {
        let stats = TrapStats::new();
        let mut point = RecoveryPoint::new();
        let raw = (&raw mut point) as usize;
        let resolver = move |_: &mut Fault<'_>| {
            // SAFETY: `point` outlives the dispatch and is never jumped to.
            let handle = unsafe { RecoveryHandle::from_raw(raw as *mut c_void) };
            TrapVerdict::Unwind(handle.with_reason(7))
        };

        let mut cx = FakeContext {
            pc: 0x4000,
            ..FakeContext::default()
        };
        let action = dispatch(&resolver, &stats, &mut fault(&mut cx));
        let Action::Unwind(handle, trap) = action else {
            panic!("expected unwind, got {action:?}");
        };
        assert!(!guard::is_handling());
        assert_eq!(trap.pc, 0x4000);
        assert_eq!(trap.fault_address, Some(0x10));
        assert_eq!(trap.kind, FaultKind::AccessViolation);
        assert_eq!(handle.reason(), 7);
        assert_eq!(stats.snapshot().unwound, 1);
    }

    #[test]
    fn fault_kind_round_trips_through_c_repr() {
        for kind in [
            FaultKind::AccessViolation,
            FaultKind::StackOverflow,
            FaultKind::IllegalInstruction,
            FaultKind::IntegerDivideByZero,
            FaultKind::IntegerOverflow,
            FaultKind::Arithmetic,
        ] {
            assert_eq!(FaultKind::from_raw(kind as i32), Some(kind));
        }
        assert_eq!(FaultKind::from_raw(42), None);
    }

    #[test]
    fn c_accessors_tolerate_null() {
        // SAFETY: null is explicitly allowed.
        unsafe {
            assert_eq!(hew_trap_fault_pc(ptr::null()), 0);
            assert_eq!(hew_trap_fault_address(ptr::null()), 0);
            assert_eq!(hew_trap_fault_kind(ptr::null()), -1);
            assert!(hew_trap_fault_take_recovery(ptr::null_mut()).is_null());
        }
    }

    #[test]
    fn c_accessors_read_the_fault() {
        let mut cx = FakeContext {
            pc: 0x4000,
            ..FakeContext::default()
        };
        let mut f = Fault::new(FaultKind::IntegerDivideByZero, None, &mut cx);
        let raw = (&raw mut f).cast::<c_void>();
        // SAFETY: raw points at a live Fault.
        unsafe {
            assert_eq!(hew_trap_fault_pc(raw), 0x4000);
            assert_eq!(hew_trap_fault_address(raw), 0);
            assert_eq!(hew_trap_fault_kind(raw), 3);
        }
    }
}
