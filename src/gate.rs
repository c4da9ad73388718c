// src/gate.rs

//! `NativeCallGate` - reentrant lock around native display calls.
//!
//! The native layer gives no thread-safety guarantee of its own, so every call
//! that touches connection state is made with a gate held. A gate runs in one
//! of two modes, fixed when it is built:
//!
//! - [`GateMode::NativeLocking`]: the native per-connection lock
//!   (`XLockDisplay`) does the mutual exclusion. It is not reentrant, so the
//!   gate counts nesting itself and only calls the native lock on the outermost
//!   `lock()` and the native unlock on the matching outermost `unlock()`.
//! - [`GateMode::SoftwareRecursiveLock`]: an in-process
//!   `parking_lot::ReentrantMutex`, used when native thread support could not
//!   be initialized or the native lock is known to be unreliable.
//!
//! In both modes nesting is per thread; another thread calling `lock()` blocks
//! until the owner's depth drops back to zero.
//!
//! Gates are shared behind an `Arc` and can outlive their connection. Before
//! the connection is closed the registry retires the gate, which waits out
//! every holder. From then on `lock()` fails with
//! [`DisplayError::GateRetired`] instead of touching a dead handle.

use crate::error::{DisplayError, Result};
use crate::native::{DisplayHandle, NativeDisplay};
use log::{error, trace};
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateMode {
    NativeLocking,
    SoftwareRecursiveLock,
}

impl GateMode {
    /// Native locking needs working native thread support and a native lock
    /// that is not on the known-broken list.
    pub fn select(thread_support: bool, native_lock_unreliable: bool) -> Self {
        if thread_support && !native_lock_unreliable {
            GateMode::NativeLocking
        } else {
            GateMode::SoftwareRecursiveLock
        }
    }
}

enum Strategy {
    Native {
        native: Arc<dyn NativeDisplay>,
        handle: DisplayHandle,
    },
    Software(ReentrantMutex<()>),
}

#[derive(Debug, Default)]
struct Ownership {
    owner: Option<ThreadId>,
    depth: usize,
    /// Threads past the retired check that have not taken the lock yet.
    entering: usize,
    retired: bool,
}

pub struct NativeCallGate {
    strategy: Strategy,
    ownership: Mutex<Ownership>,
    /// Signalled whenever the gate is fully released.
    idle: Condvar,
}

impl NativeCallGate {
    /// Builds a gate for `handle` in the given mode. `handle` must stay open
    /// until the gate is retired.
    pub(crate) fn new(
        mode: GateMode,
        native: Arc<dyn NativeDisplay>,
        handle: DisplayHandle,
    ) -> Self {
        match mode {
            GateMode::NativeLocking => Self::with_strategy(Strategy::Native { native, handle }),
            GateMode::SoftwareRecursiveLock => Self::software(),
        }
    }

    /// A gate backed only by the in-process reentrant lock.
    pub fn software() -> Self {
        Self::with_strategy(Strategy::Software(ReentrantMutex::new(())))
    }

    fn with_strategy(strategy: Strategy) -> Self {
        Self {
            strategy,
            ownership: Mutex::new(Ownership::default()),
            idle: Condvar::new(),
        }
    }

    pub fn mode(&self) -> GateMode {
        match self.strategy {
            Strategy::Native { .. } => GateMode::NativeLocking,
            Strategy::Software(_) => GateMode::SoftwareRecursiveLock,
        }
    }

    /// Acquires the gate, blocking while another thread holds it.
    ///
    /// Fails with [`DisplayError::GateRetired`] once the connection is
    /// closed. A thread already holding the gate can always nest further.
    pub fn lock(&self) -> Result<()> {
        let me = thread::current().id();
        {
            let mut own = self.ownership.lock();
            let reentry = own.owner == Some(me) && own.depth > 0;
            if reentry && matches!(self.strategy, Strategy::Native { .. }) {
                own.depth += 1;
                trace!("gate re-entered, depth {}", own.depth);
                return Ok(());
            }
            if !reentry && own.retired {
                error!("Call gate locked after its connection was closed.");
                return Err(DisplayError::GateRetired);
            }
            own.entering += 1;
        }

        match &self.strategy {
            Strategy::Software(mutex) => {
                // The guard is forgotten here and released by force_unlock in
                // unlock(); the ownership count keeps the pairing honest.
                std::mem::forget(mutex.lock());
            }
            // SAFETY: `entering` stays raised until the lock is held, and
            // retire() waits for it to drop, so the handle is still open.
            Strategy::Native { native, handle } => unsafe { native.lock(*handle) },
        }

        let mut own = self.ownership.lock();
        own.entering -= 1;
        own.owner = Some(me);
        own.depth += 1;
        trace!("gate locked, depth {}", own.depth);
        Ok(())
    }

    /// Releases one level of nesting. The underlying lock is released only
    /// when the calling thread's depth reaches zero.
    pub fn unlock(&self) -> Result<()> {
        let me = thread::current().id();
        let released = {
            let mut own = self.ownership.lock();
            if own.owner != Some(me) || own.depth == 0 {
                error!(
                    "Call gate unlocked without a matching lock (owner {:?}, depth {}, caller {:?}).",
                    own.owner, own.depth, me
                );
                return Err(DisplayError::UnbalancedUnlock);
            }
            own.depth -= 1;
            trace!("gate unlocked, depth {}", own.depth);
            own.depth == 0
        };

        match &self.strategy {
            // SAFETY: the ownership check above proves this thread holds one
            // forgotten guard from lock().
            Strategy::Software(mutex) => unsafe { mutex.force_unlock() },
            Strategy::Native { native, handle } => {
                if released {
                    // SAFETY: this thread took the native lock in lock(), and
                    // the owner is still recorded, which holds off retire().
                    unsafe { native.unlock(*handle) };
                }
            }
        }

        if released {
            let mut own = self.ownership.lock();
            // Another thread may already have taken over a software gate.
            if own.owner == Some(me) && own.depth == 0 {
                own.owner = None;
            }
            self.idle.notify_all();
        }
        Ok(())
    }

    /// Locks and returns a guard that unlocks on drop.
    pub fn enter(&self) -> Result<GateGuard<'_>> {
        self.lock()?;
        Ok(GateGuard { gate: self })
    }

    /// Runs `f` with the gate held.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        let _guard = self.enter()?;
        Ok(f())
    }

    /// Shuts the gate for good ahead of closing its connection.
    ///
    /// Blocks until no thread holds the gate or is waiting to take it. Returns
    /// false, leaving the gate usable, if the calling thread holds it itself;
    /// the connection must then stay open.
    pub(crate) fn retire(&self) -> bool {
        let me = thread::current().id();
        let mut own = self.ownership.lock();
        if own.owner == Some(me) {
            error!(
                "Call gate retired by the thread holding it (depth {}).",
                own.depth
            );
            return false;
        }
        own.retired = true;
        while own.entering > 0 || own.owner.is_some() {
            self.idle.wait(&mut own);
        }
        trace!("gate retired");
        true
    }

    /// Whether the connection behind the gate has been closed.
    pub fn is_retired(&self) -> bool {
        self.ownership.lock().retired
    }

    /// Nesting depth held by the calling thread.
    pub fn depth(&self) -> usize {
        let own = self.ownership.lock();
        if own.owner == Some(thread::current().id()) {
            own.depth
        } else {
            0
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.depth() > 0
    }

    /// Whether any thread holds the gate.
    pub fn is_locked(&self) -> bool {
        self.ownership.lock().owner.is_some()
    }
}

impl fmt::Debug for NativeCallGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let own = self.ownership.lock();
        let mut s = f.debug_struct("NativeCallGate");
        s.field("mode", &self.mode());
        if let Strategy::Native { handle, .. } = &self.strategy {
            s.field("handle", handle);
        }
        s.field("owner", &own.owner)
            .field("depth", &own.depth)
            .field("retired", &own.retired)
            .finish()
    }
}

/// Scoped hold on a [`NativeCallGate`].
pub struct GateGuard<'a> {
    gate: &'a NativeCallGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        // A guard always pairs with its own lock(), so this only fails if a
        // caller unlocked the gate by hand underneath the guard.
        if let Err(e) = self.gate.unlock() {
            error!("GateGuard drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::mock::{MockNative, NativeCall};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use test_log::test;

    fn native_gate() -> (Arc<MockNative>, DisplayHandle, NativeCallGate) {
        let native = Arc::new(MockNative::new());
        let handle = native.open(None).unwrap();
        native.clear_calls();
        let gate = NativeCallGate::new(GateMode::NativeLocking, native.clone(), handle);
        (native, handle, gate)
    }

    #[test]
    fn mode_selection() {
        assert_eq!(GateMode::select(true, false), GateMode::NativeLocking);
        assert_eq!(GateMode::select(true, true), GateMode::SoftwareRecursiveLock);
        assert_eq!(GateMode::select(false, false), GateMode::SoftwareRecursiveLock);
        assert_eq!(GateMode::select(false, true), GateMode::SoftwareRecursiveLock);
    }

    #[test]
    fn native_lock_only_on_outermost_transitions() {
        let (native, handle, gate) = native_gate();

        gate.lock().unwrap();
        gate.lock().unwrap();
        gate.lock().unwrap();
        assert_eq!(native.calls(), vec![NativeCall::Lock(handle)]);
        assert_eq!(gate.depth(), 3);

        gate.unlock().unwrap();
        gate.unlock().unwrap();
        assert!(native.is_locked(handle), "two unlocks must leave it held");
        assert_eq!(native.count_calls(|c| matches!(c, NativeCall::Unlock(_))), 0);

        gate.unlock().unwrap();
        assert!(!native.is_locked(handle));
        assert_eq!(
            native.calls(),
            vec![NativeCall::Lock(handle), NativeCall::Unlock(handle)]
        );
        assert_eq!(gate.depth(), 0);
    }

    #[test]
    fn software_lock_nests_and_releases_on_last_unlock() {
        let gate = Arc::new(NativeCallGate::software());
        gate.lock().unwrap();
        gate.lock().unwrap();
        gate.lock().unwrap();
        gate.unlock().unwrap();
        gate.unlock().unwrap();
        assert!(gate.is_locked());

        let other = gate.clone();
        let blocked = std::thread::spawn(move || {
            if let Strategy::Software(m) = &other.strategy {
                m.try_lock().is_none()
            } else {
                false
            }
        })
        .join()
        .unwrap();
        assert!(blocked, "another thread must not get the lock yet");

        gate.unlock().unwrap();
        assert!(!gate.is_locked());
        if let Strategy::Software(m) = &gate.strategy {
            assert!(!m.is_locked());
        }
    }

    #[test]
    fn unbalanced_unlock_fails_loudly() {
        let gate = NativeCallGate::software();
        assert_eq!(gate.unlock(), Err(DisplayError::UnbalancedUnlock));

        let (native, _handle, gate) = native_gate();
        assert_eq!(gate.unlock(), Err(DisplayError::UnbalancedUnlock));
        assert!(native.calls().is_empty());
    }

    #[test]
    fn unlock_from_non_owner_thread_is_rejected() {
        let gate = Arc::new(NativeCallGate::software());
        gate.lock().unwrap();
        let other = gate.clone();
        let result = std::thread::spawn(move || other.unlock()).join().unwrap();
        assert_eq!(result, Err(DisplayError::UnbalancedUnlock));
        gate.unlock().unwrap();
    }

    #[test]
    fn guard_releases_on_drop() {
        let (native, handle, gate) = native_gate();
        {
            let _outer = gate.enter().unwrap();
            let value = gate
                .with(|| {
                    assert_eq!(gate.depth(), 2);
                    7
                })
                .unwrap();
            assert_eq!(value, 7);
            assert!(native.is_locked(handle));
        }
        assert!(!native.is_locked(handle));
        assert!(!gate.is_locked());
    }

    #[test]
    fn native_gate_blocks_other_threads() {
        let (_native, _handle, gate) = native_gate();
        let gate = Arc::new(gate);
        let entered = Arc::new(AtomicBool::new(false));

        gate.lock().unwrap();
        let worker = {
            let gate = gate.clone();
            let entered = entered.clone();
            std::thread::spawn(move || {
                gate.with(|| entered.store(true, Ordering::SeqCst)).unwrap();
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        gate.unlock().unwrap();
        worker.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn retired_gate_refuses_new_holders() {
        let (native, handle, gate) = native_gate();
        assert!(gate.retire());
        assert!(gate.is_retired());

        assert_eq!(gate.lock(), Err(DisplayError::GateRetired));
        assert_eq!(gate.with(|| ()), Err(DisplayError::GateRetired));
        assert!(native.calls().is_empty(), "no native lock on a dead handle");
        assert!(!native.is_locked(handle));
    }

    #[test]
    fn retire_waits_for_the_current_holder() {
        let (native, handle, gate) = native_gate();
        let gate = Arc::new(gate);
        let retired = Arc::new(AtomicBool::new(false));

        gate.lock().unwrap();
        let closer = {
            let gate = gate.clone();
            let retired = retired.clone();
            std::thread::spawn(move || {
                assert!(gate.retire());
                retired.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!retired.load(Ordering::SeqCst));
        // Nesting still works for the thread already inside.
        gate.with(|| assert_eq!(gate.depth(), 2)).unwrap();
        gate.unlock().unwrap();

        closer.join().unwrap();
        assert!(retired.load(Ordering::SeqCst));
        assert!(!native.is_locked(handle));
        assert_eq!(gate.lock(), Err(DisplayError::GateRetired));
    }

    #[test]
    fn holder_cannot_retire_its_own_gate() {
        let gate = NativeCallGate::software();
        gate.lock().unwrap();
        assert!(!gate.retire());
        assert!(!gate.is_retired());
        gate.unlock().unwrap();
        assert!(gate.retire());
    }
}
