//! Hardware-fault to VM-trap bridge for the Hew runtime.
//!
//! Generated code is allowed to fault on purpose: an out-of-bounds heap
//! access hits a guard page, a division by zero executes `idiv`, an
//! `unreachable` executes `ud2`. This crate intercepts those hardware
//! faults, asks the runtime's [`TrapResolver`] whether the faulting
//! instruction belongs to managed code, and either resumes the thread,
//! unwinds it to a recovery point captured by [`catch_traps`], or hands
//! the fault to whatever handler was installed before us.
//!
//! # Interception models
//!
//! | Target | Mechanism |
//! |--------|-----------|
//! | Linux, Android, FreeBSD, OpenBSD | POSIX signals (`SIGSEGV`, `SIGILL`, `SIGFPE`, `SIGBUS` where it carries memory faults) |
//! | macOS | kernel exception ports (default) or POSIX signals |
//! | Windows | vectored exception handler |
//!
//! Other targets build, but [`install_handlers`] reports
//! [`InstallError::Unsupported`].
//!
//! # Usage
//!
//! ```no_run
//! use hew_trap::{catch_traps, install_handlers, Fault, TrapVerdict};
//!
//! fn resolve(fault: &mut Fault<'_>) -> TrapVerdict {
//!     // A real runtime checks `fault.pc()` against its code ranges.
//!     match fault.take_recovery() {
//!         Some(handle) => TrapVerdict::Unwind(handle),
//!         None => TrapVerdict::NotOurs,
//!     }
//! }
//!
//! install_handlers(&resolve).expect("fault handlers");
//! // SAFETY: the closure owns no resources that need dropping.
//! let result = unsafe { catch_traps(|| 1 + 1) };
//! assert_eq!(result, Ok(2));
//! ```
//!
//! # Configuration
//!
//! Read once from the environment, see [`config`].

pub mod config;
pub mod context;
mod error;
pub mod guard;

mod bridge;
mod install;
mod recovery;
#[cfg(unix)]
mod stack;
mod stats;
mod thread;

#[cfg(all(unix, hew_trap_native))]
mod altstack;
#[cfg(all(unix, hew_trap_native))]
mod chain;
#[cfg(all(unix, hew_trap_native))]
mod signals;

#[cfg(hew_trap_mach)]
mod mach;

#[cfg(all(windows, hew_trap_native))]
mod vectored;

pub use bridge::{
    hew_trap_fault_address, hew_trap_fault_kind, hew_trap_fault_pc,
    hew_trap_fault_take_recovery, Fault, FaultKind, Trap, TrapResolver, TrapVerdict,
};
pub use config::TrapConfig;
pub use context::RegisterContext;
pub use error::InstallError;
pub use install::{
    hew_trap_install_handlers, install_handlers, is_installed, HewTrapResolveFn, HewTrapVerdict,
    HEW_TRAP_NOT_OURS, HEW_TRAP_RESOLVED, HEW_TRAP_UNWIND,
};
pub use recovery::{catch_traps, RecoveryHandle};
pub use stats::{hew_trap_stats, stats, TrapStatsSnapshot};
pub use thread::{hew_trap_thread_init, thread_init};
