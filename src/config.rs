// src/config.rs

//! Configuration for the display registry.
//!
//! The registry itself never reads files or arguments; whoever owns it builds
//! a `RegistryConfig` and passes it in. Defaults match the conservative
//! behaviour: native locking when it works, X errors intercepted quietly
//! during closes, no connection parked unless a collaborator asks for it.

use log::warn;
use serde::{Deserialize, Serialize};

/// Environment variable holding a JSON-encoded `RegistryConfig`.
pub const CONFIG_ENV_VAR: &str = "XDISPLAY_REGISTRY_CONFIG";
/// Environment variable overriding `debug` ("1"/"true" to enable).
pub const DEBUG_ENV_VAR: &str = "XDISPLAY_REGISTRY_DEBUG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)] // Apply default values for any field missing in the input.
pub struct RegistryConfig {
    /// External debug flag. Gates diagnostic dumps of the active and parked
    /// sets at info level.
    pub debug: bool,
    /// Capture a backtrace when a connection is first opened, shown in dumps.
    pub trace_creation: bool,
    /// The native recursive lock is known to misbehave on this system.
    /// Forces the software lock even when native thread support is up.
    pub native_lock_unreliable: bool,
    /// Reported by `ConnectionRegistry::requires_locking`. Collaborators lock
    /// a connection's call gate around their own native calls when set.
    pub requires_locking: bool,
    /// Flag every freshly opened connection uncloseable, so every release
    /// parks. For drivers that cannot survive any display close before exit.
    pub mark_all_uncloseable: bool,
    /// Keep the error interceptor silent while it guards native closes.
    pub quiet_intercept: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            debug: false,
            trace_creation: false,
            native_lock_unreliable: false,
            requires_locking: true,
            mark_all_uncloseable: false,
            quiet_intercept: true,
        }
    }
}

impl RegistryConfig {
    /// Reads the config from the process environment, falling back to the
    /// defaults for anything missing or malformed.
    pub fn from_env() -> Self {
        Self::from_sources(
            std::env::var(CONFIG_ENV_VAR).ok().as_deref(),
            std::env::var(DEBUG_ENV_VAR).ok().as_deref(),
        )
    }

    fn from_sources(json: Option<&str>, debug: Option<&str>) -> Self {
        let mut config = match json {
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
                warn!("Ignoring malformed {}: {}", CONFIG_ENV_VAR, e);
                RegistryConfig::default()
            }),
            None => RegistryConfig::default(),
        };
        if let Some(flag) = debug {
            config.debug = matches!(flag.trim(), "1" | "true" | "yes" | "on");
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_sources() {
        let config = RegistryConfig::from_sources(None, None);
        assert_eq!(config, RegistryConfig::default());
        assert!(config.requires_locking);
        assert!(config.quiet_intercept);
        assert!(!config.mark_all_uncloseable);
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let config =
            RegistryConfig::from_sources(Some(r#"{"mark_all_uncloseable": true}"#), None);
        assert!(config.mark_all_uncloseable);
        assert!(config.requires_locking);
        assert!(!config.debug);
    }

    #[test]
    fn debug_variable_overrides_json() {
        let config = RegistryConfig::from_sources(Some(r#"{"debug": true}"#), Some("0"));
        assert!(!config.debug);
        let config = RegistryConfig::from_sources(None, Some("true"));
        assert!(config.debug);
    }

    #[test]
    fn malformed_json_falls_back_to_defaults() {
        let config = RegistryConfig::from_sources(Some("{not json"), None);
        assert_eq!(config, RegistryConfig::default());
    }
}
