// src/error.rs

//! Error type shared by every component of the registry.

use crate::native::DisplayHandle;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisplayError {
    /// The native layer returned no handle for `name`.
    #[error("failed to open display connection '{name}'")]
    OpenFailed { name: String },

    #[error("display {0} is not tracked by the registry")]
    UnknownHandle(DisplayHandle),

    #[error("registry entry keyed {key} holds mismatched handle {stored}")]
    HandleMismatch {
        key: DisplayHandle,
        stored: DisplayHandle,
    },

    #[error("display {0} is not in the active set")]
    NotActive(DisplayHandle),

    #[error("call gate unlocked without a matching lock on this thread")]
    UnbalancedUnlock,

    /// The connection behind a call gate has been closed.
    #[error("call gate used after its display connection was closed")]
    GateRetired,

    #[error("error interceptor disabled more often than enabled")]
    UnbalancedIntercept,

    #[error("closing display {handle} failed with status {status}")]
    CloseFailed { handle: DisplayHandle, status: i32 },
}

impl DisplayError {
    /// Internal-consistency failures. These indicate a logic bug in a caller
    /// or corrupted registry state and must never be retried or ignored.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DisplayError::UnknownHandle(_)
                | DisplayError::HandleMismatch { .. }
                | DisplayError::NotActive(_)
                | DisplayError::UnbalancedUnlock
                | DisplayError::GateRetired
                | DisplayError::UnbalancedIntercept
        )
    }
}

pub type Result<T> = std::result::Result<T, DisplayError>;
