//! Installation errors.
//!
//! Nothing on the fault path produces an error value: a fault is resumed,
//! unwound or forwarded. These errors only describe why the runtime cannot
//! rely on fault-based trapping and must fall back to explicit checks.

/// Why [`install_handlers`](crate::install_handlers) did not take effect.
///
/// `Clone` so the cached first outcome can be handed to every later caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstallError {
    /// Disabled through `HEW_TRAP_HANDLERS`.
    #[error("fault-based trapping disabled by configuration")]
    Disabled,
    /// No register-context layout for this OS/architecture pair.
    #[error("fault-based trapping is not supported on this target")]
    Unsupported,
    /// The platform is known to deliver faults incorrectly.
    #[error("signal delivery is known to be broken here: {0}")]
    BrokenPlatform(&'static str),
    /// `sigaction` refused the handler.
    #[error("sigaction({signal}) failed: {}", os_error(.errno))]
    Signal {
        /// Signal number being installed.
        signal: i32,
        /// `errno` reported by the kernel.
        errno: i32,
    },
    /// `AddVectoredExceptionHandler` returned null.
    #[error("AddVectoredExceptionHandler failed: {}", os_error(.0))]
    VectoredHandler(i32),
    /// A Mach call failed while setting up the exception port.
    #[error("{call} failed with kern_return_t {kr}")]
    MachPort {
        /// The Mach routine that failed.
        call: &'static str,
        /// Its `kern_return_t`.
        kr: i32,
    },
    /// The per-thread alternate signal stack could not be set up.
    #[error("alternate signal stack setup failed: {}", os_error(.0))]
    AltStack(i32),
    /// The exception-port listener thread could not be spawned.
    #[error("failed to spawn exception listener thread: {0}")]
    Listener(String),
}

fn os_error(errno: &i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(*errno)
}

impl InstallError {
    /// The current `errno`.
    #[cfg(unix)]
    pub(crate) fn last_errno() -> i32 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }

    /// Capture `errno` for a failed `sigaction(signal, ..)`.
    #[cfg(unix)]
    pub(crate) fn last_signal_error(signal: i32) -> Self {
        Self::Signal {
            signal,
            errno: Self::last_errno(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_failing_call() {
        let err = InstallError::MachPort {
            call: "mach_port_allocate",
            kr: 5,
        };
        assert_eq!(
            err.to_string(),
            "mach_port_allocate failed with kern_return_t 5"
        );
    }

    #[test]
    fn signal_error_includes_os_message() {
        let err = InstallError::Signal {
            signal: 11,
            errno: 22,
        };
        let text = err.to_string();
        assert!(text.starts_with("sigaction(11) failed: "), "{text}");
    }

    #[test]
    fn errors_are_cloneable_for_cached_outcome() {
        let err = InstallError::BrokenPlatform("test");
        assert_eq!(err.clone(), err);
    }
}
