// src/native/mod.rs

//! The narrow native layer the registry drives.
//!
//! Everything that actually talks to the display server goes through
//! [`NativeDisplay`]. The registry never assumes the native layer is
//! thread-safe; it serializes calls itself (see [`crate::gate`]).
//!
//! - `xlib`: the real implementation on top of Xlib (feature `xlib`).
//! - `mock`: an in-memory double that records every call, used by tests.

use serde::Serialize;
use std::fmt;
use std::num::NonZeroUsize;

pub mod mock;
#[cfg(feature = "xlib")]
pub mod xlib;

/// Opaque identifier of an open native display connection.
///
/// For Xlib this is the address of the `Display` structure. A null pointer is
/// never a valid handle, which is why the native `open` reports failure as
/// `None` rather than as a zero handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DisplayHandle(NonZeroUsize);

impl DisplayHandle {
    /// Wraps a raw handle value. Returns `None` for zero.
    pub fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(DisplayHandle)
    }

    #[inline]
    pub fn as_raw(self) -> usize {
        self.0.get()
    }
}

impl fmt::Display for DisplayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

/// Contract of the external native layer.
///
/// Implementations may block (a connection over a network transport can take
/// a while to open or close). None of the calls are retried by the registry:
/// open and close are not idempotent at the native level.
///
/// # Safety
///
/// Every method taking a [`DisplayHandle`] is `unsafe`: for Xlib the handle is
/// dereferenced as a `Display` pointer. Callers must pass a handle returned by
/// `open` on the same layer that has not been passed to `close` since.
pub trait NativeDisplay: Send + Sync {
    /// Opens a connection to `name`, or to the platform default when `None`.
    fn open(&self, name: Option<&str>) -> Option<DisplayHandle>;

    /// Closes the connection. After this returns, `handle` must not be used
    /// again, whatever the outcome.
    ///
    /// # Safety
    ///
    /// `handle` must be open on this layer, and no other thread may hold or
    /// be waiting for its lock.
    unsafe fn close(&self, handle: DisplayHandle) -> crate::Result<()>;

    /// # Safety
    ///
    /// `handle` must be open on this layer.
    unsafe fn lock(&self, handle: DisplayHandle);

    /// # Safety
    ///
    /// `handle` must be open on this layer and locked by the calling thread.
    unsafe fn unlock(&self, handle: DisplayHandle);

    /// The server name the connection actually resolved to.
    ///
    /// # Safety
    ///
    /// `handle` must be open on this layer.
    unsafe fn query_name(&self, handle: DisplayHandle) -> String;

    /// Enables native multi-thread support. `first_action` tells the layer
    /// whether this is believed to be the first native call of the process,
    /// which some libraries require. Returns whether support is active.
    fn init_thread_support(&self, first_action: bool) -> bool;

    fn install_error_handler(&self, quiet: bool);

    fn uninstall_error_handler(&self);

    /// Final process-level cleanup, after all connections are closed.
    fn process_teardown(&self);
}
