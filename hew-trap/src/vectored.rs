//! Windows vectored exception interception.
//!
//! A single handler is registered first in the vectored chain. It accepts
//! the five synchronous hardware exception codes we can classify and
//! returns `EXCEPTION_CONTINUE_SEARCH` for everything else, which is also
//! how a fault is forwarded: the OS then walks the rest of the vectored
//! chain and the frame-based SEH handlers as if we were not there.

use windows_sys::Win32::Foundation::{
    GetLastError, EXCEPTION_ACCESS_VIOLATION, EXCEPTION_ILLEGAL_INSTRUCTION,
    EXCEPTION_INT_DIVIDE_BY_ZERO, EXCEPTION_INT_OVERFLOW, EXCEPTION_STACK_OVERFLOW, NTSTATUS,
};
use windows_sys::Win32::System::Diagnostics::Debug::{
    AddVectoredExceptionHandler, EXCEPTION_POINTERS,
};
use windows_sys::Win32::System::Threading::SetThreadStackGuarantee;

use crate::bridge::{self, Action, Fault, FaultKind};
use crate::context::ExceptionContext;
use crate::error::InstallError;
use crate::install::TrapState;

const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

/// Stack reserved for the handler when the guard page is hit.
const STACK_GUARANTEE: u32 = 64 * 1024;

/// Map an exception code to a [`FaultKind`]; `None` for codes we never
/// look at.
pub(crate) fn classify(code: NTSTATUS) -> Option<FaultKind> {
    Some(match code {
        EXCEPTION_ACCESS_VIOLATION => FaultKind::AccessViolation,
        EXCEPTION_STACK_OVERFLOW => FaultKind::StackOverflow,
        EXCEPTION_ILLEGAL_INSTRUCTION => FaultKind::IllegalInstruction,
        EXCEPTION_INT_DIVIDE_BY_ZERO => FaultKind::IntegerDivideByZero,
        EXCEPTION_INT_OVERFLOW => FaultKind::IntegerOverflow,
        _ => return None,
    })
}

/// Register [`exception_handler`] first in the vectored chain.
pub(crate) fn install() -> Result<(), InstallError> {
    // SAFETY: the handler is a valid `extern "system"` function for the
    // lifetime of the process.
    let handle = unsafe { AddVectoredExceptionHandler(1, Some(exception_handler)) };
    if handle.is_null() {
        // SAFETY: no preconditions.
        let err = unsafe { GetLastError() };
        return Err(InstallError::VectoredHandler(err as i32));
    }
    tracing::trace!("installed vectored exception handler");
    Ok(())
}

/// Reserve headroom so a stack overflow can still run the handler.
pub(crate) fn reserve_stack_guarantee() -> Result<(), InstallError> {
    let mut size = STACK_GUARANTEE;
    // SAFETY: size is a valid in/out pointer.
    if unsafe { SetThreadStackGuarantee(&raw mut size) } == 0 {
        // SAFETY: no preconditions.
        let err = unsafe { GetLastError() };
        return Err(InstallError::VectoredHandler(err as i32));
    }
    Ok(())
}

unsafe extern "system" fn exception_handler(info: *mut EXCEPTION_POINTERS) -> i32 {
    // SAFETY: the OS passes valid exception pointers to vectored handlers.
    let (record, context) = unsafe { (&*(*info).ExceptionRecord, (*info).ContextRecord) };
    let Some(kind) = classify(record.ExceptionCode) else {
        return EXCEPTION_CONTINUE_SEARCH;
    };
    let Some(state) = crate::install::state() else {
        return EXCEPTION_CONTINUE_SEARCH;
    };

    let address = (kind == FaultKind::AccessViolation && record.NumberParameters >= 2)
        .then(|| record.ExceptionInformation[1]);

    let action = {
        // SAFETY: ContextRecord is the live context for this exception.
        let mut cx = unsafe { ExceptionContext::from_raw(context) };
        let mut fault = Fault::new(kind, address, &mut cx);
        bridge::dispatch(state.resolver, &state.stats, &mut fault)
    };

    match action {
        Action::Resume => EXCEPTION_CONTINUE_EXECUTION,
        Action::Forward => EXCEPTION_CONTINUE_SEARCH,
        Action::Unwind(handle, trap) => {
            // SAFETY: vectored handlers run on the faulting thread, whose
            // catch_traps frame owns the handle.
            unsafe { handle.transfer(trap) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_codes_are_classified() {
        assert_eq!(
            classify(EXCEPTION_ACCESS_VIOLATION),
            Some(FaultKind::AccessViolation)
        );
        assert_eq!(
            classify(EXCEPTION_STACK_OVERFLOW),
            Some(FaultKind::StackOverflow)
        );
        assert_eq!(
            classify(EXCEPTION_INT_DIVIDE_BY_ZERO),
            Some(FaultKind::IntegerDivideByZero)
        );
    }

    #[test]
    fn other_codes_are_ignored() {
        // EXCEPTION_BREAKPOINT
        assert_eq!(classify(0x8000_0003_u32 as i32), None);
        // C++ exceptions
        assert_eq!(classify(0xE06D_7363_u32 as i32), None);
    }
}
