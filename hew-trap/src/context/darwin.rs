//! Darwin thread-state accessors.
//!
//! The signal path sees the register file at `(*uc_mcontext).__ss`; the
//! exception-port path receives the same structure from `thread_get_state`.
//! Both go through [`ThreadState`].

use super::RegisterContext;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Darwin general-purpose register state (`x86_thread_state64_t`).
        pub type ThreadState = libc::__darwin_x86_thread_state64;

        /// `x86_THREAD_STATE64`.
        pub(crate) const THREAD_STATE_FLAVOR: i32 = 4;
        /// `x86_FLOAT_STATE64`.
        pub(crate) const FLOAT_STATE_FLAVOR: i32 = 5;
        /// `x86_FLOAT_STATE64_COUNT`, in 32-bit words.
        pub(crate) const FLOAT_STATE_COUNT: u32 = 131;
        /// `THREAD_STATE_NONE` for this architecture.
        pub(crate) const THREAD_STATE_NONE: i32 = 13;

        impl RegisterContext for ThreadState {
            fn pc(&self) -> usize {
                self.__rip as usize
            }
            fn set_pc(&mut self, pc: usize) {
                self.__rip = pc as u64;
            }
            fn fp(&self) -> usize {
                self.__rbp as usize
            }
            fn sp(&self) -> usize {
                self.__rsp as usize
            }
            fn lr(&self) -> Option<usize> {
                None
            }
        }

        /// Make the suspended thread behave as if it had executed
        /// `call target(arg)` at the faulting instruction, on `stack` when
        /// given (its top address) and on the faulting stack otherwise.
        pub(crate) fn redirect_call(
            state: &mut ThreadState,
            target: usize,
            arg: usize,
            stack: Option<usize>,
        ) {
            let sp = stack.map_or(state.__rsp, |top| top as u64);
            // `target` never returns, so the return-address slot is left
            // unwritten; only the SysV entry alignment (rsp ≡ 8 mod 16) matters.
            state.__rsp = (sp & !15) - 8;
            state.__rdi = arg as u64;
            state.__rip = target as u64;
        }
    } else if #[cfg(target_arch = "aarch64")] {
        /// Darwin general-purpose register state (`arm_thread_state64_t`).
        pub type ThreadState = libc::__darwin_arm_thread_state64;

        /// `ARM_THREAD_STATE64`.
        pub(crate) const THREAD_STATE_FLAVOR: i32 = 6;
        /// `ARM_NEON_STATE64`.
        pub(crate) const FLOAT_STATE_FLAVOR: i32 = 17;
        /// `ARM_NEON_STATE64_COUNT`, in 32-bit words.
        pub(crate) const FLOAT_STATE_COUNT: u32 = 132;
        /// `THREAD_STATE_NONE` for this architecture.
        pub(crate) const THREAD_STATE_NONE: i32 = 5;

        impl RegisterContext for ThreadState {
            fn pc(&self) -> usize {
                self.__pc as usize
            }
            fn set_pc(&mut self, pc: usize) {
                self.__pc = pc as u64;
            }
            fn fp(&self) -> usize {
                self.__fp as usize
            }
            fn sp(&self) -> usize {
                self.__sp as usize
            }
            fn lr(&self) -> Option<usize> {
                Some(self.__lr as usize)
            }
        }

        /// Make the suspended thread behave as if it had executed
        /// `bl target` with `x0 = arg` at the faulting instruction, on
        /// `stack` when given (its top address).
        pub(crate) fn redirect_call(
            state: &mut ThreadState,
            target: usize,
            arg: usize,
            stack: Option<usize>,
        ) {
            if let Some(top) = stack {
                state.__sp = (top & !15) as u64;
            }
            state.__lr = state.__pc;
            state.__x[0] = arg as u64;
            state.__pc = target as u64;
        }
    }
}

/// `ThreadState` size in the 32-bit words `thread_get_state` counts in.
pub(crate) const THREAD_STATE_COUNT: u32 =
    (std::mem::size_of::<ThreadState>() / std::mem::size_of::<u32>()) as u32;

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed() -> ThreadState {
        // SAFETY: thread state is plain old data.
        unsafe { std::mem::zeroed() }
    }

    #[test]
    fn pc_round_trips() {
        let mut state = zeroed();
        state.set_pc(0x1_0000_4000);
        assert_eq!(state.pc(), 0x1_0000_4000);
    }

    #[test]
    fn state_count_matches_kernel_constant() {
        #[cfg(target_arch = "x86_64")]
        assert_eq!(THREAD_STATE_COUNT, 42);
        #[cfg(target_arch = "aarch64")]
        assert_eq!(THREAD_STATE_COUNT, 68);
    }

    #[test]
    fn redirect_moves_onto_the_landing_stack() {
        let mut state = zeroed();
        state.set_pc(0x1_0000_4000);
        #[cfg(target_arch = "x86_64")]
        {
            state.__rsp = 0x7000_0010;
        }
        #[cfg(target_arch = "aarch64")]
        {
            state.__sp = 0x7000_0010;
        }
        redirect_call(&mut state, 0x1_0000_8000, 0xabc0, Some(0x6000_1003));
        assert_eq!(state.pc(), 0x1_0000_8000);
        #[cfg(target_arch = "x86_64")]
        {
            assert_eq!(state.sp(), 0x6000_1000 - 8);
            assert_eq!(state.__rdi, 0xabc0);
        }
        #[cfg(target_arch = "aarch64")]
        {
            assert_eq!(state.sp(), 0x6000_1000);
            assert_eq!(state.__x[0], 0xabc0);
            assert_eq!(state.lr(), Some(0x1_0000_4000));
        }
    }

    #[test]
    fn redirect_without_landing_stack_keeps_the_faulting_stack() {
        let mut state = zeroed();
        #[cfg(target_arch = "x86_64")]
        {
            state.__rsp = 0x7000_0010;
        }
        #[cfg(target_arch = "aarch64")]
        {
            state.__sp = 0x7000_0010;
        }
        redirect_call(&mut state, 0x1_0000_8000, 0, None);
        #[cfg(target_arch = "x86_64")]
        assert_eq!(state.sp(), 0x7000_0010 - 8);
        #[cfg(target_arch = "aarch64")]
        assert_eq!(state.sp(), 0x7000_0010);
    }
}
