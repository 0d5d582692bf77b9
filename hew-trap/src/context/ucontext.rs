//! `ucontext_t` accessors for the POSIX signal model.

use std::ffi::c_void;

use super::RegisterContext;

/// The `ucontext_t` a signal handler receives as its third argument.
pub struct SignalContext<'a> {
    uc: &'a mut libc::ucontext_t,
}

impl<'a> SignalContext<'a> {
    /// Wrap the raw context pointer passed to an `SA_SIGINFO` handler.
    ///
    /// # Safety
    ///
    /// `context` must be the non-null `ucontext_t` pointer the kernel passed
    /// to the currently running signal handler, and the returned value must
    /// not outlive that handler invocation.
    pub unsafe fn from_raw(context: *mut c_void) -> Self {
        // SAFETY: Caller guarantees `context` is the live handler ucontext.
        let uc = unsafe { &mut *context.cast::<libc::ucontext_t>() };
        Self { uc }
    }

    /// Wrap an existing `ucontext_t`.
    pub fn new(uc: &'a mut libc::ucontext_t) -> Self {
        Self { uc }
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "x86_64"))] {
        impl RegisterContext for SignalContext<'_> {
            fn pc(&self) -> usize {
                self.uc.uc_mcontext.gregs[libc::REG_RIP as usize] as usize
            }
            fn set_pc(&mut self, pc: usize) {
                self.uc.uc_mcontext.gregs[libc::REG_RIP as usize] = pc as libc::greg_t;
            }
            fn fp(&self) -> usize {
                self.uc.uc_mcontext.gregs[libc::REG_RBP as usize] as usize
            }
            fn sp(&self) -> usize {
                self.uc.uc_mcontext.gregs[libc::REG_RSP as usize] as usize
            }
            fn lr(&self) -> Option<usize> {
                None
            }
        }
    } else if #[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "x86"))] {
        impl RegisterContext for SignalContext<'_> {
            fn pc(&self) -> usize {
                self.uc.uc_mcontext.gregs[libc::REG_EIP as usize] as usize
            }
            fn set_pc(&mut self, pc: usize) {
                self.uc.uc_mcontext.gregs[libc::REG_EIP as usize] = pc as libc::greg_t;
            }
            fn fp(&self) -> usize {
                self.uc.uc_mcontext.gregs[libc::REG_EBP as usize] as usize
            }
            fn sp(&self) -> usize {
                self.uc.uc_mcontext.gregs[libc::REG_ESP as usize] as usize
            }
            fn lr(&self) -> Option<usize> {
                None
            }
        }
    } else if #[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "aarch64"))] {
        impl RegisterContext for SignalContext<'_> {
            fn pc(&self) -> usize {
                self.uc.uc_mcontext.pc as usize
            }
            fn set_pc(&mut self, pc: usize) {
                self.uc.uc_mcontext.pc = pc as _;
            }
            fn fp(&self) -> usize {
                self.uc.uc_mcontext.regs[29] as usize
            }
            fn sp(&self) -> usize {
                self.uc.uc_mcontext.sp as usize
            }
            fn lr(&self) -> Option<usize> {
                Some(self.uc.uc_mcontext.regs[30] as usize)
            }
        }
    } else if #[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "arm"))] {
        impl RegisterContext for SignalContext<'_> {
            fn pc(&self) -> usize {
                self.uc.uc_mcontext.arm_pc as usize
            }
            fn set_pc(&mut self, pc: usize) {
                self.uc.uc_mcontext.arm_pc = pc as _;
            }
            fn fp(&self) -> usize {
                self.uc.uc_mcontext.arm_fp as usize
            }
            fn sp(&self) -> usize {
                self.uc.uc_mcontext.arm_sp as usize
            }
            fn lr(&self) -> Option<usize> {
                Some(self.uc.uc_mcontext.arm_lr as usize)
            }
        }
    } else if #[cfg(all(target_os = "linux", target_arch = "riscv64"))] {
        // __gregs[0] is pc, then x1..x31; s0 (x8) doubles as the frame pointer.
        const REG_PC: usize = 0;
        const REG_RA: usize = 1;
        const REG_SP: usize = 2;
        const REG_S0: usize = 8;

        impl RegisterContext for SignalContext<'_> {
            fn pc(&self) -> usize {
                self.uc.uc_mcontext.__gregs[REG_PC] as usize
            }
            fn set_pc(&mut self, pc: usize) {
                self.uc.uc_mcontext.__gregs[REG_PC] = pc as _;
            }
            fn fp(&self) -> usize {
                self.uc.uc_mcontext.__gregs[REG_S0] as usize
            }
            fn sp(&self) -> usize {
                self.uc.uc_mcontext.__gregs[REG_SP] as usize
            }
            fn lr(&self) -> Option<usize> {
                Some(self.uc.uc_mcontext.__gregs[REG_RA] as usize)
            }
        }
    } else if #[cfg(target_os = "macos")] {
        // Darwin keeps the register file behind `uc_mcontext`, in the same
        // layout `thread_get_state` returns, so defer to that accessor.
        impl SignalContext<'_> {
            fn state(&self) -> &super::ThreadState {
                // SAFETY: the kernel always populates uc_mcontext for a
                // delivered signal.
                unsafe { &(*self.uc.uc_mcontext).__ss }
            }
            fn state_mut(&mut self) -> &mut super::ThreadState {
                // SAFETY: as above.
                unsafe { &mut (*self.uc.uc_mcontext).__ss }
            }
        }

        impl RegisterContext for SignalContext<'_> {
            fn pc(&self) -> usize {
                self.state().pc()
            }
            fn set_pc(&mut self, pc: usize) {
                self.state_mut().set_pc(pc);
            }
            fn fp(&self) -> usize {
                self.state().fp()
            }
            fn sp(&self) -> usize {
                self.state().sp()
            }
            fn lr(&self) -> Option<usize> {
                self.state().lr()
            }
        }
    } else if #[cfg(all(target_os = "freebsd", target_arch = "x86_64"))] {
        impl RegisterContext for SignalContext<'_> {
            fn pc(&self) -> usize {
                self.uc.uc_mcontext.mc_rip as usize
            }
            fn set_pc(&mut self, pc: usize) {
                self.uc.uc_mcontext.mc_rip = pc as _;
            }
            fn fp(&self) -> usize {
                self.uc.uc_mcontext.mc_rbp as usize
            }
            fn sp(&self) -> usize {
                self.uc.uc_mcontext.mc_rsp as usize
            }
            fn lr(&self) -> Option<usize> {
                None
            }
        }
    } else if #[cfg(all(target_os = "freebsd", target_arch = "aarch64"))] {
        impl RegisterContext for SignalContext<'_> {
            fn pc(&self) -> usize {
                self.uc.uc_mcontext.mc_gpregs.gp_elr as usize
            }
            fn set_pc(&mut self, pc: usize) {
                self.uc.uc_mcontext.mc_gpregs.gp_elr = pc as _;
            }
            fn fp(&self) -> usize {
                self.uc.uc_mcontext.mc_gpregs.gp_x[29] as usize
            }
            fn sp(&self) -> usize {
                self.uc.uc_mcontext.mc_gpregs.gp_sp as usize
            }
            fn lr(&self) -> Option<usize> {
                Some(self.uc.uc_mcontext.mc_gpregs.gp_lr as usize)
            }
        }
    } else if #[cfg(all(target_os = "openbsd", target_arch = "x86_64"))] {
        // OpenBSD's ucontext_t is the sigcontext itself.
        impl RegisterContext for SignalContext<'_> {
            fn pc(&self) -> usize {
                self.uc.sc_rip as usize
            }
            fn set_pc(&mut self, pc: usize) {
                self.uc.sc_rip = pc as _;
            }
            fn fp(&self) -> usize {
                self.uc.sc_rbp as usize
            }
            fn sp(&self) -> usize {
                self.uc.sc_rsp as usize
            }
            fn lr(&self) -> Option<usize> {
                None
            }
        }
    } else if #[cfg(all(target_os = "openbsd", target_arch = "aarch64"))] {
        impl RegisterContext for SignalContext<'_> {
            fn pc(&self) -> usize {
                self.uc.sc_elr as usize
            }
            fn set_pc(&mut self, pc: usize) {
                self.uc.sc_elr = pc as _;
            }
            fn fp(&self) -> usize {
                self.uc.sc_x[29] as usize
            }
            fn sp(&self) -> usize {
                self.uc.sc_sp as usize
            }
            fn lr(&self) -> Option<usize> {
                Some(self.uc.sc_lr as usize)
            }
        }
    }
}
