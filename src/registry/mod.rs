// src/registry/mod.rs

//! `ConnectionRegistry` - reference-counted pool of named native connections.
//!
//! Every connection handed out by [`ConnectionRegistry::acquire_connection`]
//! is tracked until it is really closed. Two ordered sets hold the entries:
//!
//! - `active`: connections currently in use by some caller.
//! - `parked`: connections a caller released but which were flagged
//!   uncloseable, so the native resource was deliberately kept open.
//!
//! Parking is a driver workaround. Some drivers corrupt process state when a
//! display connection is closed at all, or closed out of open order, after
//! certain operations ran on it. Instead of closing such a connection the
//! registry keeps it, hands it back to the next caller asking for the same
//! name, and only closes it in a forced [`ConnectionRegistry::shutdown`], in
//! reverse order of parking.
//!
//! Note that acquiring a name that is *active* opens a new native connection;
//! only parked entries are reused by name.

use crate::bootstrap::{BootstrapFacts, BootstrapSequencer};
use crate::config::RegistryConfig;
use crate::error::{DisplayError, Result};
use crate::gate::{GateMode, NativeCallGate};
use crate::intercept::ErrorInterceptGuard;
use crate::native::{DisplayHandle, NativeDisplay};
use log::{debug, error, info, log, log_enabled, warn, Level};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod connection;

pub use connection::{ConnectionInfo, NamedConnection};

/// Connection name that stands for "whatever the default display is".
pub const DEFAULT_CONNECTION: &str = "default";

#[derive(Default)]
struct RegistryState {
    by_handle: HashMap<DisplayHandle, NamedConnection>,
    active: Vec<DisplayHandle>,
    parked: Vec<DisplayHandle>,
}

impl RegistryState {
    fn infos(&self, handles: &[DisplayHandle]) -> Vec<ConnectionInfo> {
        handles
            .iter()
            .filter_map(|h| self.by_handle.get(h).map(NamedConnection::info))
            .collect()
    }
}

/// Serializable view of the whole registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    pub default_name: String,
    pub gate_mode: GateMode,
    pub requires_locking: bool,
    pub active: Vec<ConnectionInfo>,
    pub parked: Vec<ConnectionInfo>,
}

/// Process-wide pool of native display connections.
pub struct ConnectionRegistry {
    native: Arc<dyn NativeDisplay>,
    config: RegistryConfig,
    gate_mode: GateMode,
    default_name: String,
    /// Serializes raw native open/close calls. Independent of `state`, which
    /// is never held across a native call.
    native_gate: NativeCallGate,
    intercept: ErrorInterceptGuard,
    state: Mutex<RegistryState>,
    torn_down: AtomicBool,
}

impl ConnectionRegistry {
    /// Builds a registry from already-discovered bootstrap facts.
    pub fn new(
        native: Arc<dyn NativeDisplay>,
        facts: &BootstrapFacts,
        config: RegistryConfig,
    ) -> Self {
        info!(
            "Connection registry created (default display '{}', gate mode {:?}).",
            facts.default_name, facts.gate_mode
        );
        Self {
            intercept: ErrorInterceptGuard::new(native.clone()),
            native,
            config,
            gate_mode: facts.gate_mode,
            default_name: facts.default_name.clone(),
            native_gate: NativeCallGate::software(),
            state: Mutex::new(RegistryState::default()),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Runs the bootstrap through `sequencer` (a no-op if it already ran) and
    /// builds a registry from its facts.
    pub fn bootstrap(
        sequencer: &BootstrapSequencer,
        native: Arc<dyn NativeDisplay>,
        config: RegistryConfig,
        first_action: bool,
    ) -> Result<Self> {
        let facts = sequencer.init_singleton(native.as_ref(), &config, first_action)?;
        Ok(Self::new(native, facts, config))
    }

    /// Maps `None` and [`DEFAULT_CONNECTION`] to the probed default display
    /// name. Anything else is returned unchanged.
    pub fn normalize_name(&self, name: Option<&str>) -> String {
        match name {
            None | Some(DEFAULT_CONNECTION) => self.default_name.clone(),
            Some(name) => name.to_string(),
        }
    }

    /// Returns a connection to `name`: a parked one with the same name if
    /// there is one, otherwise a freshly opened one.
    pub fn acquire_connection(&self, name: Option<&str>) -> Result<DisplayHandle> {
        let name = self.normalize_name(name);

        if let Some(handle) = self.revive_parked(&name) {
            return Ok(handle);
        }

        let handle = self
            .native_gate
            .with(|| self.native.open(Some(name.as_str())))?
            .ok_or_else(|| DisplayError::OpenFailed { name: name.clone() })?;

        let gate = NativeCallGate::new(self.gate_mode, self.native.clone(), handle);
        let mut conn = NamedConnection::new(name, handle, gate, self.config.trace_creation);
        if self.config.mark_all_uncloseable {
            conn.mark_uncloseable();
        }
        conn.add_ref();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        info!("Opened {}", conn);
        if let Some(stale) = state.by_handle.insert(handle, conn) {
            // The native layer handed out an address we still track. The old
            // entry cannot be valid any more; forget it.
            error!(
                "Native open returned tracked handle {}; dropping stale {}",
                handle, stale
            );
            state.active.retain(|h| *h != handle);
            state.parked.retain(|h| *h != handle);
        }
        state.active.push(handle);
        Ok(handle)
    }

    fn revive_parked(&self, name: &str) -> Option<DisplayHandle> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let pos = state.parked.iter().position(|h| {
            state
                .by_handle
                .get(h)
                .map_or(false, |conn| conn.name() == name)
        })?;
        let handle = state.parked.remove(pos);
        let conn = state.by_handle.get_mut(&handle)?;
        conn.add_ref();
        state.active.push(handle);
        info!("Revived parked {}", conn);
        Some(handle)
    }

    /// Gives back a connection obtained from `acquire_connection`.
    ///
    /// Closeable connections are closed natively; a close failure is logged
    /// and the connection is forgotten anyway, since retrying a close on a
    /// handle in an unknown state risks a double close. Uncloseable ones are
    /// parked instead.
    ///
    /// Releasing a handle that is not active is an internal-consistency error.
    pub fn release_connection(&self, handle: DisplayHandle) -> Result<()> {
        let to_close = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let conn = match state.by_handle.get_mut(&handle) {
                Some(conn) => conn,
                None => {
                    error!("Release of untracked display {}", handle);
                    return Err(DisplayError::UnknownHandle(handle));
                }
            };
            if conn.handle() != handle {
                error!("Registry corruption: key {} holds {}", handle, conn);
                return Err(DisplayError::HandleMismatch {
                    key: handle,
                    stored: conn.handle(),
                });
            }
            let Some(pos) = state.active.iter().position(|h| *h == handle) else {
                error!("Release of display {} which is not active: {}", handle, conn);
                return Err(DisplayError::NotActive(handle));
            };

            conn.remove_ref();
            state.active.remove(pos);

            if conn.is_uncloseable() {
                info!("Parking uncloseable {}", conn);
                state.parked.push(handle);
                None
            } else {
                state.by_handle.remove(&handle)
            }
        };

        if let Some(conn) = to_close {
            self.close_native(&conn);
        }
        Ok(())
    }

    /// Closes `conn` with the error interceptor up. Returns whether the
    /// native close reported success.
    ///
    /// The connection's call gate is retired first, so handed-out gates stop
    /// working instead of locking a closed display.
    fn close_native(&self, conn: &NamedConnection) -> bool {
        if !conn.gate().retire() {
            warn!(
                "Not closing {}: the releasing thread still holds its call gate.",
                conn
            );
            return false;
        }
        let _intercept = self.intercept.scope(self.config.quiet_intercept);
        let closed = self
            .native_gate
            // SAFETY: `conn` has left the registry, so this is the only close
            // of its handle, and its retired gate keeps every other thread
            // off the native lock.
            .with(|| unsafe { self.native.close(conn.handle()) })
            .and_then(|result| result);
        match closed {
            Ok(()) => {
                info!("Closed {}", conn);
                true
            }
            Err(e) => {
                warn!("Closing {} failed, not retrying: {}", conn, e);
                false
            }
        }
    }

    /// Flags a tracked connection so it is parked instead of closed on
    /// release. Returns false if the handle is not tracked.
    pub fn mark_uncloseable(&self, handle: DisplayHandle) -> bool {
        let mut state = self.state.lock();
        match state.by_handle.get_mut(&handle) {
            Some(conn) => {
                conn.mark_uncloseable();
                debug!("Marked uncloseable: {}", conn);
                true
            }
            None => {
                debug!("mark_uncloseable: display {} not tracked", handle);
                false
            }
        }
    }

    /// Reports the registry contents and, when `force` is set, really closes
    /// every parked connection, last parked first, then forgets everything.
    ///
    /// Active connections are never closed here; with `force` they are
    /// abandoned. Returns the number of connections left unclosed.
    ///
    /// Callers must stop using the registry from other threads first.
    pub fn shutdown(&self, force: bool, verbose: bool) -> usize {
        let (active, parked) = {
            let state = self.state.lock();
            (state.active.len(), state.parked.len())
        };

        if verbose || self.config.debug || parked > 0 {
            info!(
                "Registry shutdown (close parked: {}): active (no close attempt): {}, parked (uncloseable): {}",
                force, active, parked
            );
            self.dump_at(Level::Info);
        }

        if !force {
            return active + parked;
        }

        let (abandoned, to_close) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let to_close: Vec<NamedConnection> = state
                .parked
                .drain(..)
                .filter_map(|h| state.by_handle.remove(&h))
                .collect();
            let abandoned = state.active.len();
            state.active.clear();
            state.by_handle.clear();
            (abandoned, to_close)
        };

        if abandoned > 0 {
            warn!(
                "Abandoning {} active connection(s) without closing them.",
                abandoned
            );
        }

        // Reverse open order; some drivers abort otherwise.
        let mut unclosed = abandoned;
        for conn in to_close.iter().rev() {
            if !self.close_native(conn) {
                unclosed += 1;
            }
        }

        if !self.torn_down.swap(true, Ordering::SeqCst) {
            self.native.process_teardown();
        }
        info!("Registry shutdown complete, {} connection(s) left unclosed.", unclosed);
        unclosed
    }

    /// The per-connection gate collaborators hold around their own native
    /// calls on `handle`.
    ///
    /// The gate stays valid only while the connection is open. Once it is
    /// closed, locking the gate fails with [`DisplayError::GateRetired`].
    pub fn call_gate(&self, handle: DisplayHandle) -> Option<Arc<NativeCallGate>> {
        self.state
            .lock()
            .by_handle
            .get(&handle)
            .map(|conn| conn.gate().clone())
    }

    /// The recursive guard the registry wraps every native close in.
    pub fn error_intercept(&self) -> &ErrorInterceptGuard {
        &self.intercept
    }

    /// Point-in-time view of a tracked connection, active or parked.
    pub fn connection_info(&self, handle: DisplayHandle) -> Option<ConnectionInfo> {
        self.state.lock().by_handle.get(&handle).map(NamedConnection::info)
    }

    /// Whether call gates use the native per-connection lock.
    pub fn is_native_lock_available(&self) -> bool {
        self.gate_mode == GateMode::NativeLocking
    }

    /// Whether collaborators are expected to hold a call gate around their
    /// native calls.
    pub fn requires_locking(&self) -> bool {
        self.config.requires_locking
    }

    /// Lock mode decided at bootstrap, shared by every per-connection gate.
    pub fn gate_mode(&self) -> GateMode {
        self.gate_mode
    }

    /// Name the default display resolved to during bootstrap.
    pub fn default_connection_name(&self) -> &str {
        &self.default_name
    }

    /// Configuration the registry was built with.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Number of connections currently handed out.
    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Number of uncloseable connections kept open for reuse.
    pub fn parked_count(&self) -> usize {
        self.state.lock().parked.len()
    }

    /// Copies both sets, in order, into a serializable report.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.lock();
        RegistrySnapshot {
            default_name: self.default_name.clone(),
            gate_mode: self.gate_mode,
            requires_locking: self.config.requires_locking,
            active: state.infos(&state.active),
            parked: state.infos(&state.parked),
        }
    }

    /// Logs the active set; at info level when the debug flag is set.
    pub fn dump_active(&self) {
        let state = self.state.lock();
        Self::dump_list(self.dump_level(), "Active", &state.infos(&state.active));
    }

    /// Logs the parked set; at info level when the debug flag is set.
    pub fn dump_parked(&self) {
        let state = self.state.lock();
        Self::dump_list(self.dump_level(), "Parked", &state.infos(&state.parked));
    }

    fn dump_level(&self) -> Level {
        if self.config.debug {
            Level::Info
        } else {
            Level::Debug
        }
    }

    fn dump_at(&self, level: Level) {
        let state = self.state.lock();
        Self::dump_list(level, "Active", &state.infos(&state.active));
        Self::dump_list(level, "Parked", &state.infos(&state.parked));
    }

    fn dump_list(level: Level, label: &str, entries: &[ConnectionInfo]) {
        if !log_enabled!(level) {
            return;
        }
        log!(level, "{} displays: {}", label, entries.len());
        for (i, info) in entries.iter().enumerate() {
            log!(
                level,
                "  {}: Display[{}, {}, refCount {}, unCloseable {}]",
                i,
                info.name,
                info.handle,
                info.ref_count,
                info.uncloseable
            );
            if let Some(trace) = &info.created_at {
                log!(level, "    created at:\n{}", trace);
            }
        }
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.by_handle.is_empty() {
            warn!(
                "Connection registry dropped with {} active and {} parked connection(s); leaving them to process exit.",
                state.active.len(),
                state.parked.len()
            );
        }
    }
}
