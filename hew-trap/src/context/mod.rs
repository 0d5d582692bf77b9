//! Register-context accessors.
//!
//! Every fault-delivery mechanism hands us the faulting thread's registers in
//! a different OS- and architecture-specific structure. [`RegisterContext`] is
//! the one view the rest of the crate uses; the concrete implementation is
//! chosen at build time by target, never at runtime, because the layouts are
//! incompatible.
//!
//! | Type | Delivered by |
//! |------|--------------|
//! | [`SignalContext`] | POSIX signal handler `ucontext_t` |
//! | [`ExceptionContext`] | Windows vectored exception `CONTEXT` |
//! | [`ThreadState`] | Darwin `thread_get_state` copy |

#[cfg(all(unix, hew_trap_native))]
mod ucontext;
#[cfg(all(unix, hew_trap_native))]
pub use ucontext::SignalContext;

#[cfg(hew_trap_mach)]
pub(crate) mod darwin;
#[cfg(hew_trap_mach)]
pub use darwin::ThreadState;

#[cfg(all(windows, hew_trap_native))]
mod windows;
#[cfg(all(windows, hew_trap_native))]
pub use self::windows::ExceptionContext;

/// Uniform access to the registers of a faulting thread.
///
/// Implementations only touch the memory they wrap.
pub trait RegisterContext {
    /// Program counter of the faulting instruction. Never fails for a
    /// context the OS delivered.
    fn pc(&self) -> usize;

    /// Resume the thread at `pc` instead of re-executing the faulting
    /// instruction.
    fn set_pc(&mut self, pc: usize);

    /// Frame pointer.
    fn fp(&self) -> usize;

    /// Stack pointer.
    fn sp(&self) -> usize;

    /// Link register, on architectures that have one.
    fn lr(&self) -> Option<usize>;
}
