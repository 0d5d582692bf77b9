//! One-time, process-wide handler installation.
//!
//! The first call to [`install_handlers`] decides the outcome for the life
//! of the process; every later call returns the same result. There is no
//! teardown: the handlers and the state they read stay in place until
//! exit.

use std::ffi::c_void;
use std::sync::OnceLock;

use crate::bridge::{Fault, TrapResolver, TrapVerdict};
use crate::config::{self, TrapConfig};
use crate::error::InstallError;
use crate::recovery::RecoveryHandle;
use crate::stats::TrapStats;

/// How faults reach us on this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Model {
    /// POSIX signal handlers.
    #[cfg(all(unix, hew_trap_native))]
    Signals,
    /// Darwin kernel exception ports (plus SIGFPE through signals).
    #[cfg(hew_trap_mach)]
    ExceptionPorts,
    /// Windows vectored exception handler.
    #[cfg(all(windows, hew_trap_native))]
    Vectored,
}

/// Everything the fault path reads, created once at installation.
pub(crate) struct TrapState {
    pub(crate) resolver: &'static dyn TrapResolver,
    pub(crate) stats: TrapStats,
    #[cfg(all(unix, hew_trap_native))]
    pub(crate) previous: crate::chain::PreviousHandlers,
    pub(crate) model: Model,
    pub(crate) alt_stack_size: usize,
}

static STATE: OnceLock<TrapState> = OnceLock::new();
static OUTCOME: OnceLock<Result<(), InstallError>> = OnceLock::new();

/// Process state, once installation has started.
///
/// Published before any handler is registered, so a handler always finds
/// it.
pub(crate) fn state() -> Option<&'static TrapState> {
    STATE.get()
}

/// Process state, only if installation succeeded.
pub(crate) fn installed() -> Option<&'static TrapState> {
    if is_installed() {
        STATE.get()
    } else {
        None
    }
}

/// Whether [`install_handlers`] has succeeded.
pub fn is_installed() -> bool {
    matches!(OUTCOME.get(), Some(Ok(())))
}

/// Install the fault handlers for this process, routing every intercepted
/// fault to `resolver`.
///
/// Idempotent: only the first call installs, and its outcome (including a
/// failure) is returned to every caller. The resolver of later calls is
/// ignored.
pub fn install_handlers(resolver: &'static dyn TrapResolver) -> Result<(), InstallError> {
    OUTCOME
        .get_or_init(|| {
            let config = config::current();
            let result = try_install(resolver, &config);
            match &result {
                Ok(()) => tracing::debug!(?config, "fault handlers installed"),
                Err(err) => tracing::warn!("fault handlers not installed: {err}"),
            }
            result
        })
        .clone()
}

fn try_install(
    resolver: &'static dyn TrapResolver,
    config: &TrapConfig,
) -> Result<(), InstallError> {
    if !config.enabled {
        return Err(InstallError::Disabled);
    }
    if let Some(reason) = platform_defect() {
        return Err(InstallError::BrokenPlatform(reason));
    }
    let model = select_model(config)?;
    let state = STATE.get_or_init(|| TrapState {
        resolver,
        stats: TrapStats::new(),
        #[cfg(all(unix, hew_trap_native))]
        previous: crate::chain::PreviousHandlers::new(),
        model,
        alt_stack_size: config.alt_stack_size,
    });
    register(state)
}

#[cfg_attr(not(hew_trap_mach), allow(unused_variables))]
fn select_model(config: &TrapConfig) -> Result<Model, InstallError> {
    #[cfg(hew_trap_mach)]
    return Ok(if config.mach_ports {
        Model::ExceptionPorts
    } else {
        Model::Signals
    });
    #[cfg(all(unix, hew_trap_native, not(hew_trap_mach)))]
    return Ok(Model::Signals);
    #[cfg(all(windows, hew_trap_native))]
    return Ok(Model::Vectored);
    #[cfg(not(hew_trap_native))]
    return Err(InstallError::Unsupported);
}

fn register(state: &'static TrapState) -> Result<(), InstallError> {
    match state.model {
        #[cfg(all(unix, hew_trap_native))]
        Model::Signals => crate::signals::install(state, crate::chain::TRAP_SIGNALS),
        #[cfg(hew_trap_mach)]
        Model::ExceptionPorts => {
            // Arithmetic exceptions are not routed to the port; they still
            // arrive as SIGFPE.
            crate::signals::install(state, &[libc::SIGFPE])?;
            crate::mach::install(state)
        }
        #[cfg(all(windows, hew_trap_native))]
        Model::Vectored => crate::vectored::install(),
    }
}

/// Known-defective platform, if this is one.
fn platform_defect() -> Option<&'static str> {
    #[cfg(all(target_os = "android", target_arch = "arm"))]
    if kernel_release().is_some_and(|release| kernel_older_than(&release, (3, 4))) {
        return Some("32-bit ARM Android kernels before 3.4 corrupt signal contexts");
    }
    None
}

#[cfg(all(target_os = "android", target_arch = "arm"))]
fn kernel_release() -> Option<String> {
    // SAFETY: uts is a valid out-pointer; uname NUL-terminates its fields.
    unsafe {
        let mut uts: libc::utsname = std::mem::zeroed();
        if libc::uname(&raw mut uts) != 0 {
            return None;
        }
        let release = std::ffi::CStr::from_ptr(uts.release.as_ptr());
        Some(release.to_string_lossy().into_owned())
    }
}

/// Whether a `uname` release string such as `3.0.31-g6fb96c9` is older
/// than `major.minor`. Unparseable releases are assumed current.
#[cfg_attr(
    not(all(target_os = "android", target_arch = "arm")),
    allow(dead_code)
)]
fn kernel_older_than(release: &str, (major, minor): (u32, u32)) -> bool {
    let mut parts = release
        .split(|c: char| !c.is_ascii_digit())
        .map(str::parse::<u32>);
    match (parts.next(), parts.next()) {
        (Some(Ok(maj)), Some(Ok(min))) => (maj, min) < (major, minor),
        _ => false,
    }
}

// ── C ABI ───────────────────────────────────────────────────────────────

/// Verdict returned by a C resolver.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HewTrapVerdict {
    /// One of `HEW_TRAP_NOT_OURS`, `HEW_TRAP_RESOLVED`, `HEW_TRAP_UNWIND`.
    pub kind: i32,
    /// For `HEW_TRAP_UNWIND`: the handle from `hew_trap_fault_take_recovery`.
    pub recovery: *mut c_void,
}

pub const HEW_TRAP_NOT_OURS: i32 = 0;
pub const HEW_TRAP_RESOLVED: i32 = 1;
pub const HEW_TRAP_UNWIND: i32 = 2;

/// C resolver callback. Receives an opaque fault for the
/// `hew_trap_fault_*` accessors.
pub type HewTrapResolveFn = unsafe extern "C" fn(fault: *mut c_void) -> HewTrapVerdict;

struct CResolver(HewTrapResolveFn);

impl TrapResolver for CResolver {
    fn resolve(&self, fault: &mut Fault<'_>) -> TrapVerdict {
        // SAFETY: the callback only uses the fault for this call, through
        // the hew_trap_fault_* accessors.
        let verdict = unsafe { (self.0)(std::ptr::from_mut(fault).cast()) };
        match verdict.kind {
            HEW_TRAP_RESOLVED => TrapVerdict::ResolvedInPlace,
            HEW_TRAP_UNWIND if !verdict.recovery.is_null() => {
                // SAFETY: a non-null recovery is the handle the callback
                // took from this fault.
                TrapVerdict::Unwind(unsafe { RecoveryHandle::from_raw(verdict.recovery) })
            }
            _ => TrapVerdict::NotOurs,
        }
    }
}

static C_RESOLVER: OnceLock<CResolver> = OnceLock::new();

/// Install the fault handlers with a C resolver.
///
/// Returns `true` if handlers are installed, including by an earlier call.
/// A null `resolve` fails without installing.
#[no_mangle]
pub extern "C" fn hew_trap_install_handlers(resolve: Option<HewTrapResolveFn>) -> bool {
    let Some(resolve) = resolve else {
        return is_installed();
    };
    let resolver = C_RESOLVER.get_or_init(|| CResolver(resolve));
    install_handlers(resolver).is_ok()
}
