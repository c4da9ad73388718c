// src/bootstrap.rs

//! One-time process bootstrap.
//!
//! Before any registry is used the process has to decide how native calls are
//! locked, and needs the name the default (`None`) display target resolves
//! to. Both are facts about the process, so they are computed once and cached.

use crate::config::RegistryConfig;
use crate::error::{DisplayError, Result};
use crate::gate::GateMode;
use crate::native::NativeDisplay;
use log::{info, warn};
use once_cell::sync::OnceCell;
use serde::Serialize;

/// Environment facts discovered by the bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapFacts {
    /// Native thread support was initialized successfully.
    pub thread_support: bool,
    /// The bootstrap believed it ran the first native action of the process.
    pub first_action: bool,
    /// Lock mode for per-connection call gates.
    pub gate_mode: GateMode,
    /// What the default target resolved to, e.g. ":0".
    pub default_name: String,
}

/// Runs the bootstrap at most once. Owned by whoever owns the registry.
#[derive(Debug, Default)]
pub struct BootstrapSequencer {
    facts: OnceCell<BootstrapFacts>,
}

impl BootstrapSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initializes on the first call and returns the cached facts on every
    /// later one. Concurrent first calls block until one of them finishes.
    ///
    /// If the default display cannot be opened the error is returned and
    /// nothing is cached, so a later call tries again.
    pub fn init_singleton(
        &self,
        native: &dyn NativeDisplay,
        config: &RegistryConfig,
        first_action: bool,
    ) -> Result<&BootstrapFacts> {
        self.facts
            .get_or_try_init(|| Self::run(native, config, first_action))
    }

    pub fn facts(&self) -> Option<&BootstrapFacts> {
        self.facts.get()
    }

    pub fn is_initialized(&self) -> bool {
        self.facts.get().is_some()
    }

    fn run(
        native: &dyn NativeDisplay,
        config: &RegistryConfig,
        first_action: bool,
    ) -> Result<BootstrapFacts> {
        info!(
            "Bootstrapping display registry (first native action: {}).",
            first_action
        );

        let thread_support = native.init_thread_support(first_action);
        let gate_mode = GateMode::select(thread_support, config.native_lock_unreliable);
        if thread_support && config.native_lock_unreliable {
            info!("Native thread support is up but its lock is flagged unreliable.");
        }

        // Open the default target only to learn its name.
        let probe = native.open(None).ok_or_else(|| DisplayError::OpenFailed {
            name: "<default>".to_string(),
        })?;
        // SAFETY: `probe` was just opened and is never shared, so nothing
        // else can lock or close it.
        let default_name = unsafe { native.query_name(probe) };
        if let Err(e) = unsafe { native.close(probe) } {
            warn!("Closing the default-name probe connection failed: {}", e);
        }

        let facts = BootstrapFacts {
            thread_support,
            first_action,
            gate_mode,
            default_name,
        };
        info!("Bootstrap complete: {:?}", facts);
        Ok(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::mock::{MockNative, NativeCall};
    use std::sync::Arc;
    use test_log::test;

    #[test]
    fn runs_once_and_caches_default_name() {
        let native = MockNative::new().with_default_name(":1");
        let sequencer = BootstrapSequencer::new();
        let config = RegistryConfig::default();

        let facts = sequencer.init_singleton(&native, &config, true).unwrap().clone();
        assert_eq!(facts.default_name, ":1");
        assert!(facts.thread_support);
        assert_eq!(facts.gate_mode, GateMode::NativeLocking);

        let probe = native.closed()[0];
        assert_eq!(
            native.calls(),
            vec![
                NativeCall::InitThreadSupport(true),
                NativeCall::Open(None),
                NativeCall::QueryName(probe),
                NativeCall::Close(probe),
            ]
        );

        let again = sequencer.init_singleton(&native, &config, false).unwrap();
        assert_eq!(*again, facts);
        assert_eq!(native.calls().len(), 4, "second call must not touch native");
        assert_eq!(native.open_count(), 0);
    }

    #[test]
    fn software_mode_without_thread_support() {
        let native = MockNative::new().with_thread_support(false);
        let sequencer = BootstrapSequencer::new();
        let facts = sequencer
            .init_singleton(&native, &RegistryConfig::default(), false)
            .unwrap();
        assert_eq!(facts.gate_mode, GateMode::SoftwareRecursiveLock);
        assert!(!facts.first_action);
    }

    #[test]
    fn software_mode_when_native_lock_unreliable() {
        let native = MockNative::new();
        let config = RegistryConfig {
            native_lock_unreliable: true,
            ..RegistryConfig::default()
        };
        let facts = BootstrapSequencer::new()
            .init_singleton(&native, &config, true)
            .unwrap()
            .clone();
        assert!(facts.thread_support);
        assert_eq!(facts.gate_mode, GateMode::SoftwareRecursiveLock);
    }

    #[test]
    fn failed_probe_is_not_cached() {
        let native = MockNative::new();
        native.refuse_open(":0");
        let sequencer = BootstrapSequencer::new();
        let config = RegistryConfig::default();

        let err = sequencer.init_singleton(&native, &config, true).unwrap_err();
        assert!(matches!(err, DisplayError::OpenFailed { .. }));
        assert!(!sequencer.is_initialized());

        let native = MockNative::new();
        assert!(sequencer.init_singleton(&native, &config, true).is_ok());
        assert!(sequencer.is_initialized());
    }

    #[test]
    fn concurrent_first_calls_bootstrap_once() {
        let native = Arc::new(MockNative::new());
        let sequencer = Arc::new(BootstrapSequencer::new());

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let native = native.clone();
                let sequencer = sequencer.clone();
                std::thread::spawn(move || {
                    sequencer
                        .init_singleton(native.as_ref(), &RegistryConfig::default(), true)
                        .map(|f| f.default_name.clone())
                })
            })
            .collect();

        for worker in workers {
            assert_eq!(worker.join().unwrap().unwrap(), ":0");
        }
        assert_eq!(
            native.count_calls(|c| matches!(c, NativeCall::InitThreadSupport(_))),
            1
        );
    }
}
