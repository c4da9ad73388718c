// src/registry/connection.rs

use crate::gate::NativeCallGate;
use crate::native::DisplayHandle;
use serde::Serialize;
use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Arc;

/// A native connection tracked by the registry.
pub struct NamedConnection {
    name: String,
    handle: DisplayHandle,
    ref_count: usize,
    uncloseable: bool,
    created_at: Option<Backtrace>,
    gate: Arc<NativeCallGate>,
}

impl NamedConnection {
    pub(crate) fn new(
        name: String,
        handle: DisplayHandle,
        gate: NativeCallGate,
        trace_creation: bool,
    ) -> Self {
        Self {
            name,
            handle,
            ref_count: 0,
            uncloseable: false,
            created_at: trace_creation.then(Backtrace::force_capture),
            gate: Arc::new(gate),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> DisplayHandle {
        self.handle
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn is_uncloseable(&self) -> bool {
        self.uncloseable
    }

    pub fn gate(&self) -> &Arc<NativeCallGate> {
        &self.gate
    }

    pub(crate) fn add_ref(&mut self) {
        self.ref_count += 1;
    }

    /// Never goes below zero; a parked connection revived and released again
    /// sits at zero between uses.
    pub(crate) fn remove_ref(&mut self) {
        self.ref_count = self.ref_count.saturating_sub(1);
    }

    pub(crate) fn mark_uncloseable(&mut self) {
        self.uncloseable = true;
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            name: self.name.clone(),
            handle: self.handle,
            ref_count: self.ref_count,
            uncloseable: self.uncloseable,
            created_at: self.created_at.as_ref().map(|bt| bt.to_string()),
        }
    }
}

impl fmt::Debug for NamedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedConnection")
            .field("name", &self.name)
            .field("handle", &format_args!("{}", self.handle))
            .field("ref_count", &self.ref_count)
            .field("uncloseable", &self.uncloseable)
            .finish()
    }
}

impl fmt::Display for NamedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Display[{}, {}, refCount {}, unCloseable {}]",
            self.name, self.handle, self.ref_count, self.uncloseable
        )
    }
}

/// Snapshot of one connection, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub name: String,
    pub handle: DisplayHandle,
    pub ref_count: usize,
    pub uncloseable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}
