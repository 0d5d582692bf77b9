//! POSIX signal interception.
//!
//! One `SA_SIGINFO | SA_ONSTACK | SA_NODEFER` handler with an empty mask
//! serves every trapped signal. `SA_NODEFER` lets a fault raised inside the
//! resolver re-enter the handler, where the reentrancy guard routes it
//! straight to the previous disposition instead of resolving it again.
//!
//! # Async-Signal-Safety
//!
//! [`trap_handler`] only performs:
//! - a `OnceLock` load for the process state,
//! - const TLS loads/stores (no lazy initialization, no destructors),
//! - relaxed atomic counter updates,
//! - the resolver call, under the resolver's own no-alloc contract,
//! - `sigaction`/`siglongjmp`, both async-signal-safe per POSIX.

use std::ffi::c_void;

use crate::bridge::{self, Action, Fault, FaultKind};
use crate::context::{RegisterContext, SignalContext};
use crate::error::InstallError;
use crate::install::TrapState;
use crate::stack::{self, StackBounds};

// `si_code` values for SIGFPE. The numbering differs between kernels and
// libc does not export them everywhere.
cfg_if::cfg_if! {
    if #[cfg(any(target_os = "macos", target_os = "ios"))] {
        const FPE_INTDIV: libc::c_int = 7;
        const FPE_INTOVF: libc::c_int = 8;
    } else if #[cfg(target_os = "freebsd")] {
        const FPE_INTOVF: libc::c_int = 1;
        const FPE_INTDIV: libc::c_int = 2;
    } else {
        const FPE_INTDIV: libc::c_int = 1;
        const FPE_INTOVF: libc::c_int = 2;
    }
}

/// Map a delivered signal to a [`FaultKind`].
pub(crate) fn classify(
    signal: libc::c_int,
    code: libc::c_int,
    address: Option<usize>,
    sp: usize,
    stack: Option<StackBounds>,
) -> FaultKind {
    match signal {
        libc::SIGFPE => match code {
            FPE_INTDIV => FaultKind::IntegerDivideByZero,
            FPE_INTOVF => FaultKind::IntegerOverflow,
            _ => FaultKind::Arithmetic,
        },
        libc::SIGILL => FaultKind::IllegalInstruction,
        _ => FaultKind::memory(address, sp, stack),
    }
}

/// Install [`trap_handler`] for `signals`, capturing each previous
/// disposition in `state`.
///
/// On failure every disposition already replaced is put back.
pub(crate) fn install(
    state: &'static TrapState,
    signals: &[libc::c_int],
) -> Result<(), InstallError> {
    for (i, &signal) in signals.iter().enumerate() {
        // SAFETY: sa is fully initialized before use; the old-action slot is
        // only written here, during installation.
        let ret = unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_NODEFER;
            libc::sigemptyset(&raw mut sa.sa_mask);
            sa.sa_sigaction = trap_handler
                as unsafe extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void)
                as usize;
            libc::sigaction(signal, &raw const sa, state.previous.capture_slot(signal))
        };
        if ret != 0 {
            let err = InstallError::last_signal_error(signal);
            for &installed in &signals[..i] {
                state.previous.restore(installed);
            }
            return Err(err);
        }
        state.previous.publish(signal);
        tracing::trace!(signal, "installed trap handler");
    }
    Ok(())
}

/// Signal handler for synchronous fault signals.
unsafe extern "C" fn trap_handler(
    signal: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut c_void,
) {
    let Some(state) = crate::install::state() else {
        // Unreachable in practice: the state is published before the first
        // sigaction. Terminate with the original signal.
        // SAFETY: SIG_DFL is always valid.
        unsafe { libc::signal(signal, libc::SIG_DFL) };
        return;
    };

    let action = {
        // SAFETY: the kernel passes the live ucontext for this delivery.
        let mut cx = unsafe { SignalContext::from_raw(context) };
        // SAFETY: info is the live siginfo for this delivery.
        let (code, address) = unsafe {
            let code = (*info).si_code;
            let address = match signal {
                libc::SIGSEGV | libc::SIGBUS => Some((*info).si_addr() as usize),
                _ => None,
            };
            (code, address)
        };
        let kind = classify(signal, code, address, cx.sp(), stack::recorded());
        let mut fault = Fault::new(kind, address, &mut cx);
        bridge::dispatch(state.resolver, &state.stats, &mut fault)
    };

    match action {
        Action::Resume => {}
        Action::Forward => {
            // SAFETY: forwarding the arguments this handler received.
            unsafe { state.previous.forward(signal, info, context) };
        }
        Action::Unwind(handle, trap) => {
            // SAFETY: signal handlers run on the faulting thread, whose
            // catch_traps frame owns the handle.
            unsafe { handle.transfer(trap) }
        }
    }
}

/// Address of [`trap_handler`] as it appears in `sa_sigaction`.
#[cfg(test)]
pub(crate) fn handler_address() -> usize {
    trap_handler as unsafe extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void) as usize
}

/// The disposition currently installed for `signal`.
#[cfg(test)]
pub(crate) fn current_disposition(signal: libc::c_int) -> libc::sigaction {
    // SAFETY: query only.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        libc::sigaction(signal, std::ptr::null(), &raw mut sa);
        sa
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fpe_codes_map_to_arithmetic_kinds() {
        assert_eq!(
            classify(libc::SIGFPE, FPE_INTDIV, None, 0, None),
            FaultKind::IntegerDivideByZero
        );
        assert_eq!(
            classify(libc::SIGFPE, FPE_INTOVF, None, 0, None),
            FaultKind::IntegerOverflow
        );
        assert_eq!(
            classify(libc::SIGFPE, 99, None, 0, None),
            FaultKind::Arithmetic
        );
    }

    #[test]
    fn sigill_is_illegal_instruction() {
        assert_eq!(
            classify(libc::SIGILL, 0, None, 0x7fff_0000, None),
            FaultKind::IllegalInstruction
        );
    }

    #[test]
    fn memory_faults_far_from_sp_are_access_violations() {
        let sp = 0x7fff_0000;
        assert_eq!(
            classify(libc::SIGSEGV, 1, Some(0x1000), sp, None),
            FaultKind::AccessViolation
        );
        assert_eq!(
            classify(libc::SIGBUS, 2, Some(0x5555_0000), sp, None),
            FaultKind::AccessViolation
        );
        assert_eq!(
            classify(libc::SIGSEGV, 1, None, sp, None),
            FaultKind::AccessViolation
        );
    }

    #[test]
    fn memory_faults_just_below_sp_are_overflows_without_bounds() {
        let sp = 0x7fff_0000;
        for addr in [sp - 8, sp - 0x1000, sp - 0xf000] {
            assert_eq!(
                classify(libc::SIGSEGV, 2, Some(addr), sp, None),
                FaultKind::StackOverflow,
                "{addr:#x}"
            );
        }
    }

    #[test]
    fn memory_faults_at_or_above_sp_are_never_overflows() {
        let sp = 0x7fff_0000;
        let bounds = StackBounds {
            low: sp - 0x4_0000,
            guard: 0x1000,
        };
        for stack in [None, Some(bounds)] {
            for addr in [sp, sp + 0x100, sp + 0x25c0] {
                assert_eq!(
                    classify(libc::SIGSEGV, 2, Some(addr), sp, stack),
                    FaultKind::AccessViolation,
                    "{addr:#x} {stack:?}"
                );
            }
        }
    }

    #[test]
    fn recorded_bounds_confine_overflows_to_the_guard() {
        let sp = 0x7fff_0000;
        let bounds = StackBounds {
            low: sp - 0x8000,
            guard: 0x1000,
        };
        // Below sp but inside the mapped stack.
        assert_eq!(
            classify(libc::SIGSEGV, 2, Some(sp - 0x10), sp, Some(bounds)),
            FaultKind::AccessViolation
        );
        assert_eq!(
            classify(libc::SIGSEGV, 2, Some(bounds.low - 8), sp, Some(bounds)),
            FaultKind::StackOverflow
        );
        // Some other mapping further below the guard.
        assert_eq!(
            classify(libc::SIGSEGV, 2, Some(bounds.low - 0x2000), sp, Some(bounds)),
            FaultKind::AccessViolation
        );
    }

    #[test]
    fn install_takes_over_trap_signals() {
        static FORWARD_ALL: fn(&mut crate::Fault<'_>) -> crate::TrapVerdict =
            |_| crate::TrapVerdict::NotOurs;
        if crate::install_handlers(&FORWARD_ALL).is_err() {
            return;
        }
        let Some(state) = crate::install::installed() else {
            return;
        };
        if state.model != crate::install::Model::Signals {
            return;
        }
        for &signal in crate::chain::TRAP_SIGNALS {
            let sa = current_disposition(signal);
            assert_eq!(sa.sa_sigaction, handler_address(), "signal {signal}");
            assert_ne!(sa.sa_flags & libc::SA_SIGINFO, 0);
            assert_ne!(sa.sa_flags & libc::SA_ONSTACK, 0);
        }
    }

    #[test]
    fn unknown_stack_pointer_never_claims_overflow() {
        assert_eq!(
            classify(libc::SIGSEGV, 1, Some(0x10), 0, None),
            FaultKind::AccessViolation
        );
    }
}
