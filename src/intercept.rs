// src/intercept.rs

//! Recursive enable-guard for the native error interceptor.
//!
//! Risky native calls (closing a connection, mostly) run with a process-wide
//! error handler installed so a protocol error is logged instead of aborting
//! the process. Calls nest, so the guard counts enables: the handler is
//! installed on 0 -> 1 and removed on 1 -> 0.

use crate::error::{DisplayError, Result};
use crate::native::NativeDisplay;
use log::{debug, error};
use parking_lot::Mutex;
use std::sync::Arc;

pub struct ErrorInterceptGuard {
    native: Arc<dyn NativeDisplay>,
    depth: Mutex<usize>,
}

impl ErrorInterceptGuard {
    pub fn new(native: Arc<dyn NativeDisplay>) -> Self {
        Self {
            native,
            depth: Mutex::new(0),
        }
    }

    /// Adjusts the enable count by one in either direction.
    ///
    /// Disabling at depth zero means some caller disabled twice; that is
    /// reported as [`DisplayError::UnbalancedIntercept`] and the count stays
    /// at zero.
    pub fn set_enabled(&self, on: bool, quiet: bool) -> Result<()> {
        if on {
            self.enable(quiet);
            Ok(())
        } else {
            self.disable()
        }
    }

    // Both halves hold the count across the native call so install/uninstall
    // pairs cannot interleave between threads.
    fn enable(&self, quiet: bool) {
        let mut depth = self.depth.lock();
        if *depth == 0 {
            self.native.install_error_handler(quiet);
        }
        *depth += 1;
        debug!("Error interceptor depth now {}", *depth);
    }

    fn disable(&self) -> Result<()> {
        let mut depth = self.depth.lock();
        if *depth == 0 {
            error!("Error interceptor disabled while not enabled.");
            return Err(DisplayError::UnbalancedIntercept);
        }
        *depth -= 1;
        if *depth == 0 {
            self.native.uninstall_error_handler();
        }
        debug!("Error interceptor depth now {}", *depth);
        Ok(())
    }

    /// Enables the interceptor until the returned scope is dropped.
    pub fn scope(&self, quiet: bool) -> InterceptScope<'_> {
        self.enable(quiet);
        InterceptScope { guard: self }
    }

    pub fn depth(&self) -> usize {
        *self.depth.lock()
    }

    pub fn is_installed(&self) -> bool {
        self.depth() > 0
    }
}

/// Keeps the error interceptor enabled for its lifetime.
pub struct InterceptScope<'a> {
    guard: &'a ErrorInterceptGuard,
}

impl Drop for InterceptScope<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.guard.disable() {
            error!("InterceptScope drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::mock::{MockNative, NativeCall};

    fn guard() -> (Arc<MockNative>, ErrorInterceptGuard) {
        let native = Arc::new(MockNative::new());
        let guard = ErrorInterceptGuard::new(native.clone());
        (native, guard)
    }

    #[test]
    fn installs_once_and_uninstalls_on_last_disable() {
        let (native, guard) = guard();
        guard.set_enabled(true, true).unwrap();
        guard.set_enabled(true, false).unwrap();
        assert_eq!(guard.depth(), 2);
        assert!(native.error_handler_installed());

        guard.set_enabled(false, false).unwrap();
        assert!(native.error_handler_installed());
        guard.set_enabled(false, false).unwrap();
        assert!(!native.error_handler_installed());

        assert_eq!(
            native.calls(),
            vec![
                NativeCall::InstallErrorHandler { quiet: true },
                NativeCall::UninstallErrorHandler
            ]
        );
    }

    #[test]
    fn disable_at_zero_is_fatal() {
        let (native, guard) = guard();
        let err = guard.set_enabled(false, true).unwrap_err();
        assert_eq!(err, DisplayError::UnbalancedIntercept);
        assert!(err.is_fatal());
        assert_eq!(guard.depth(), 0);
        assert!(native.calls().is_empty());
    }

    #[test]
    fn scope_uninstalls_on_early_return() {
        let (native, guard) = guard();

        fn risky(guard: &ErrorInterceptGuard) -> Result<()> {
            let _scope = guard.scope(true);
            assert!(guard.is_installed());
            Err(DisplayError::OpenFailed {
                name: ":9".to_string(),
            })
        }

        assert!(risky(&guard).is_err());
        assert!(!guard.is_installed());
        assert!(!native.error_handler_installed());
    }

    #[test]
    fn nested_scopes_share_one_installation() {
        let (native, guard) = guard();
        {
            let _outer = guard.scope(false);
            {
                let _inner = guard.scope(true);
                assert_eq!(guard.depth(), 2);
            }
            assert!(native.error_handler_installed());
        }
        assert_eq!(
            native.count_calls(|c| matches!(c, NativeCall::InstallErrorHandler { .. })),
            1
        );
        assert!(!native.error_handler_installed());
    }

    #[test]
    fn scope_dropped_after_manual_disable_stays_at_zero() {
        let (native, guard) = guard();
        {
            let _scope = guard.scope(true);
            guard.set_enabled(false, false).unwrap();
            assert!(!native.error_handler_installed());
        }
        assert_eq!(guard.depth(), 0);
        assert_eq!(
            native.count_calls(|c| matches!(c, NativeCall::UninstallErrorHandler)),
            1
        );
    }
}
