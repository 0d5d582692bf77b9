//! `CONTEXT` accessors for the vectored exception model.

use windows_sys::Win32::System::Diagnostics::Debug::CONTEXT;

use super::RegisterContext;

/// The `ContextRecord` of an `EXCEPTION_POINTERS`.
pub struct ExceptionContext<'a> {
    cx: &'a mut CONTEXT,
}

impl<'a> ExceptionContext<'a> {
    /// Wrap the context record handed to a vectored exception handler.
    ///
    /// # Safety
    ///
    /// `cx` must be the non-null `ContextRecord` of the exception currently
    /// being dispatched, and the result must not outlive the handler call.
    pub unsafe fn from_raw(cx: *mut CONTEXT) -> Self {
        // SAFETY: Caller guarantees `cx` is the live context record.
        let cx = unsafe { &mut *cx };
        Self { cx }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        impl RegisterContext for ExceptionContext<'_> {
            fn pc(&self) -> usize {
                self.cx.Rip as usize
            }
            fn set_pc(&mut self, pc: usize) {
                self.cx.Rip = pc as u64;
            }
            fn fp(&self) -> usize {
                self.cx.Rbp as usize
            }
            fn sp(&self) -> usize {
                self.cx.Rsp as usize
            }
            fn lr(&self) -> Option<usize> {
                None
            }
        }
    } else if #[cfg(target_arch = "aarch64")] {
        impl RegisterContext for ExceptionContext<'_> {
            fn pc(&self) -> usize {
                self.cx.Pc as usize
            }
            fn set_pc(&mut self, pc: usize) {
                self.cx.Pc = pc as u64;
            }
            fn fp(&self) -> usize {
                // SAFETY: X and the named Fp/Lr view alias the same storage.
                unsafe { self.cx.Anonymous.X[29] as usize }
            }
            fn sp(&self) -> usize {
                self.cx.Sp as usize
            }
            fn lr(&self) -> Option<usize> {
                // SAFETY: as above.
                Some(unsafe { self.cx.Anonymous.X[30] as usize })
            }
        }
    }
}
