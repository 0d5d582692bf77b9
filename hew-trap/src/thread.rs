//! Per-thread preparation.
//!
//! Each interception model needs something from every thread that may run
//! trapping code: an alternate signal stack, an exception-port
//! registration, or a stack guarantee for the vectored handler. Unix
//! threads also record their stack bounds for overflow classification.
//! [`catch_traps`](crate::catch_traps) prepares the calling thread lazily;
//! runtimes that spawn their own workers may call [`thread_init`] up front
//! instead.

use std::cell::Cell;

use crate::error::InstallError;
use crate::install::{self, Model};

thread_local! {
    static PREPARED: Cell<bool> = const { Cell::new(false) };
}

/// Prepare the calling thread for fault interception.
///
/// A no-op until [`install_handlers`](crate::install_handlers) has
/// succeeded; idempotent afterwards.
pub fn thread_init() -> Result<(), InstallError> {
    if PREPARED.with(Cell::get) {
        return Ok(());
    }
    let Some(state) = install::installed() else {
        return Ok(());
    };
    prepare(state.model, state.alt_stack_size)?;
    PREPARED.with(|p| p.set(true));
    Ok(())
}

#[cfg_attr(not(all(unix, hew_trap_native)), allow(unused_variables))]
fn prepare(model: Model, alt_stack_size: usize) -> Result<(), InstallError> {
    #[cfg(unix)]
    crate::stack::record();
    match model {
        #[cfg(all(unix, hew_trap_native))]
        Model::Signals => crate::altstack::ensure(alt_stack_size),
        #[cfg(hew_trap_mach)]
        Model::ExceptionPorts => crate::mach::register_thread(),
        #[cfg(all(windows, hew_trap_native))]
        Model::Vectored => crate::vectored::reserve_stack_guarantee(),
    }
}

// ── C ABI ───────────────────────────────────────────────────────────────

/// Prepare the calling thread. Returns `false` if preparation failed.
#[no_mangle]
pub extern "C" fn hew_trap_thread_init() -> bool {
    match thread_init() {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!("thread preparation failed: {err}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_before_installation_is_retried_later() {
        std::thread::spawn(|| {
            if install::installed().is_none() {
                thread_init().unwrap();
                assert!(!PREPARED.with(Cell::get));
            }
        })
        .join()
        .unwrap();
    }
}
