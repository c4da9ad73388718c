//! Process-wide manager for native display connections.
//!
//! Windowing, visual selection and context setup code all need X display
//! connections, and the native library behind them is fragile: some drivers
//! crash when connections are closed out of order, or closed at all after
//! certain operations, and Xlib is not thread-safe unless told to be.
//!
//! This crate owns that concern:
//! - `registry`: reference-counted pool of named connections, with the
//!   park-instead-of-close workaround for uncloseable connections.
//! - `gate`: reentrant lock collaborators hold around native calls.
//! - `intercept`: recursive guard for the native error interceptor.
//! - `bootstrap`: one-time process setup deciding the lock mode.
//! - `native`: the narrow interface to the native layer, with the Xlib
//!   implementation and a recording mock.
//!
//! ```
//! # use std::sync::Arc;
//! # use xdisplay_registry::{BootstrapSequencer, ConnectionRegistry, RegistryConfig};
//! # use xdisplay_registry::native::mock::MockNative;
//! # fn main() -> xdisplay_registry::Result<()> {
//! // Real programs pass `native::xlib::XlibDisplay` here.
//! let sequencer = BootstrapSequencer::new();
//! let registry = ConnectionRegistry::bootstrap(
//!     &sequencer,
//!     Arc::new(MockNative::new()),
//!     RegistryConfig::default(),
//!     true,
//! )?;
//! let display = registry.acquire_connection(None)?;
//! // ... hold registry.call_gate(display) around native calls ...
//! registry.release_connection(display)?;
//! registry.shutdown(true, false);
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod gate;
pub mod intercept;
pub mod native;
pub mod registry;

pub use bootstrap::{BootstrapFacts, BootstrapSequencer};
pub use config::RegistryConfig;
pub use error::{DisplayError, Result};
pub use gate::{GateGuard, GateMode, NativeCallGate};
pub use intercept::{ErrorInterceptGuard, InterceptScope};
pub use native::{DisplayHandle, NativeDisplay};
pub use registry::{
    ConnectionInfo, ConnectionRegistry, NamedConnection, RegistrySnapshot, DEFAULT_CONNECTION,
};
