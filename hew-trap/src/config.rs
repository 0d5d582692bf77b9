//! Environment configuration, read once at installation.
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `HEW_TRAP_HANDLERS` | `0`/`off`/`false` disables fault-based trapping | enabled |
//! | `HEW_TRAP_ALT_STACK_KB` | alternate signal stack size in KiB (64..=8192) | 128 |
//! | `HEW_TRAP_MACH_PORTS` | Darwin: `0` uses signals instead of exception ports | ports |

use std::sync::OnceLock;

/// Default alternate signal stack size in KiB.
const DEFAULT_ALT_STACK_KB: usize = 128;
/// Smallest alternate stack we will register.
const MIN_ALT_STACK_KB: usize = 64;
/// Largest alternate stack we will register.
const MAX_ALT_STACK_KB: usize = 8 * 1024;

/// Fault-trapping configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapConfig {
    /// Whether handlers may be installed at all.
    pub enabled: bool,
    /// Usable size of each thread's alternate signal stack, in bytes.
    pub alt_stack_size: usize,
    /// Use kernel exception ports rather than signals (Darwin only).
    pub mach_ports: bool,
}

impl Default for TrapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            alt_stack_size: DEFAULT_ALT_STACK_KB * 1024,
            mach_ports: cfg!(hew_trap_mach),
        }
    }
}

impl TrapConfig {
    /// Read the configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    ///
    /// Invalid values are reported with `tracing::warn!` and replaced by the
    /// default for that field.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = lookup("HEW_TRAP_HANDLERS") {
            match parse_switch(&val) {
                Some(on) => config.enabled = on,
                None => tracing::warn!("HEW_TRAP_HANDLERS={val} is invalid, leaving traps enabled"),
            }
        }

        if let Some(val) = lookup("HEW_TRAP_ALT_STACK_KB") {
            match val.trim().parse::<usize>() {
                Ok(kb) if kb > 0 => {
                    config.alt_stack_size = kb.clamp(MIN_ALT_STACK_KB, MAX_ALT_STACK_KB) * 1024;
                }
                _ => tracing::warn!(
                    "HEW_TRAP_ALT_STACK_KB={val} is invalid, using {DEFAULT_ALT_STACK_KB} KiB"
                ),
            }
        }

        if let Some(val) = lookup("HEW_TRAP_MACH_PORTS") {
            match parse_switch(&val) {
                Some(on) => config.mach_ports = on && cfg!(hew_trap_mach),
                None => tracing::warn!("HEW_TRAP_MACH_PORTS={val} is invalid, using default"),
            }
        }

        config
    }
}

fn parse_switch(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Some(true),
        "0" | "off" | "false" | "no" => Some(false),
        _ => None,
    }
}

static CONFIG: OnceLock<TrapConfig> = OnceLock::new();

/// The process configuration, read from the environment on first use.
pub fn current() -> TrapConfig {
    *CONFIG.get_or_init(TrapConfig::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn defaults_when_unset() {
        let config = TrapConfig::from_lookup(|_| None);
        assert_eq!(config, TrapConfig::default());
        assert!(config.enabled);
        assert_eq!(config.alt_stack_size, 128 * 1024);
    }

    #[test]
    fn handlers_can_be_switched_off() {
        for val in ["0", "off", "FALSE", " no "] {
            let config = TrapConfig::from_lookup(lookup(&[("HEW_TRAP_HANDLERS", val)]));
            assert!(!config.enabled, "{val:?} should disable");
        }
    }

    #[test]
    fn invalid_switch_keeps_default() {
        let config = TrapConfig::from_lookup(lookup(&[("HEW_TRAP_HANDLERS", "maybe")]));
        assert!(config.enabled);
    }

    #[test]
    fn alt_stack_size_is_clamped() {
        let small = TrapConfig::from_lookup(lookup(&[("HEW_TRAP_ALT_STACK_KB", "8")]));
        assert_eq!(small.alt_stack_size, MIN_ALT_STACK_KB * 1024);

        let large = TrapConfig::from_lookup(lookup(&[("HEW_TRAP_ALT_STACK_KB", "100000")]));
        assert_eq!(large.alt_stack_size, MAX_ALT_STACK_KB * 1024);

        let exact = TrapConfig::from_lookup(lookup(&[("HEW_TRAP_ALT_STACK_KB", "256")]));
        assert_eq!(exact.alt_stack_size, 256 * 1024);
    }

    #[test]
    fn garbage_alt_stack_size_uses_default() {
        for val in ["", "-3", "0", "lots"] {
            let config = TrapConfig::from_lookup(lookup(&[("HEW_TRAP_ALT_STACK_KB", val)]));
            assert_eq!(config.alt_stack_size, DEFAULT_ALT_STACK_KB * 1024, "{val:?}");
        }
    }

    #[test]
    fn mach_ports_only_honoured_where_available() {
        let config = TrapConfig::from_lookup(lookup(&[("HEW_TRAP_MACH_PORTS", "1")]));
        assert_eq!(config.mach_ports, cfg!(hew_trap_mach));

        let config = TrapConfig::from_lookup(lookup(&[("HEW_TRAP_MACH_PORTS", "0")]));
        assert!(!config.mach_ports);
    }
}
