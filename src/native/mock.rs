// src/native/mock.rs

//! In-memory native layer that records every call.
//!
//! Handles are fake addresses; nothing is ever dereferenced. The per-handle
//! lock is a real blocking lock, so call gates in native mode behave across
//! threads the same way they do over Xlib.

use crate::error::{DisplayError, Result};
use crate::native::{DisplayHandle, NativeDisplay};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};

const FIRST_HANDLE: usize = 0x1000;
const HANDLE_STRIDE: usize = 0x10;

/// One recorded native call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeCall {
    Open(Option<String>),
    Close(DisplayHandle),
    Lock(DisplayHandle),
    Unlock(DisplayHandle),
    QueryName(DisplayHandle),
    InitThreadSupport(bool),
    InstallErrorHandler { quiet: bool },
    UninstallErrorHandler,
    ProcessTeardown,
}

struct MockState {
    next_handle: usize,
    open: HashMap<DisplayHandle, String>,
    calls: Vec<NativeCall>,
    refused: HashSet<String>,
    close_status: Option<i32>,
    handler_installed: bool,
}

pub struct MockNative {
    default_name: String,
    thread_support: bool,
    state: Mutex<MockState>,
    locked: Mutex<HashSet<DisplayHandle>>,
    unlocked: Condvar,
}

impl MockNative {
    pub fn new() -> Self {
        Self {
            default_name: ":0".to_string(),
            thread_support: true,
            state: Mutex::new(MockState {
                next_handle: FIRST_HANDLE,
                open: HashMap::new(),
                calls: Vec::new(),
                refused: HashSet::new(),
                close_status: None,
                handler_installed: false,
            }),
            locked: Mutex::new(HashSet::new()),
            unlocked: Condvar::new(),
        }
    }

    /// Name that `open(None)` resolves to.
    pub fn with_default_name(mut self, name: &str) -> Self {
        self.default_name = name.to_string();
        self
    }

    /// Result reported by `init_thread_support`.
    pub fn with_thread_support(mut self, supported: bool) -> Self {
        self.thread_support = supported;
        self
    }

    /// Makes every later open of `name` fail.
    pub fn refuse_open(&self, name: &str) {
        self.state.lock().refused.insert(name.to_string());
    }

    /// Makes every later close report `status`. The connection is still
    /// gone afterwards, as with a real server.
    pub fn fail_closes(&self, status: i32) {
        self.state.lock().close_status = Some(status);
    }

    pub fn calls(&self) -> Vec<NativeCall> {
        self.state.lock().calls.clone()
    }

    pub fn count_calls(&self, pred: impl Fn(&NativeCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Handles passed to `close`, in call order.
    pub fn closed(&self) -> Vec<DisplayHandle> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                NativeCall::Close(h) => Some(*h),
                _ => None,
            })
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().open.len()
    }

    pub fn is_open(&self, handle: DisplayHandle) -> bool {
        self.state.lock().open.contains_key(&handle)
    }

    pub fn is_locked(&self, handle: DisplayHandle) -> bool {
        self.locked.lock().contains(&handle)
    }

    pub fn error_handler_installed(&self) -> bool {
        self.state.lock().handler_installed
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn record(&self, call: NativeCall) {
        self.state.lock().calls.push(call);
    }
}

impl Default for MockNative {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeDisplay for MockNative {
    fn open(&self, name: Option<&str>) -> Option<DisplayHandle> {
        let mut state = self.state.lock();
        state.calls.push(NativeCall::Open(name.map(str::to_string)));

        let resolved = name.unwrap_or(&self.default_name).to_string();
        if state.refused.contains(&resolved) {
            return None;
        }

        let handle = DisplayHandle::from_raw(state.next_handle)?;
        state.next_handle += HANDLE_STRIDE;
        state.open.insert(handle, resolved);
        Some(handle)
    }

    unsafe fn close(&self, handle: DisplayHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(NativeCall::Close(handle));
        let was_open = state.open.remove(&handle).is_some();

        match (was_open, state.close_status) {
            (false, _) => Err(DisplayError::CloseFailed { handle, status: -1 }),
            (true, Some(status)) => Err(DisplayError::CloseFailed { handle, status }),
            (true, None) => Ok(()),
        }
    }

    unsafe fn lock(&self, handle: DisplayHandle) {
        self.record(NativeCall::Lock(handle));
        let mut locked = self.locked.lock();
        while locked.contains(&handle) {
            self.unlocked.wait(&mut locked);
        }
        locked.insert(handle);
    }

    unsafe fn unlock(&self, handle: DisplayHandle) {
        self.record(NativeCall::Unlock(handle));
        self.locked.lock().remove(&handle);
        self.unlocked.notify_all();
    }

    unsafe fn query_name(&self, handle: DisplayHandle) -> String {
        let mut state = self.state.lock();
        state.calls.push(NativeCall::QueryName(handle));
        state.open.get(&handle).cloned().unwrap_or_default()
    }

    fn init_thread_support(&self, first_action: bool) -> bool {
        self.record(NativeCall::InitThreadSupport(first_action));
        self.thread_support
    }

    fn install_error_handler(&self, quiet: bool) {
        let mut state = self.state.lock();
        state.calls.push(NativeCall::InstallErrorHandler { quiet });
        state.handler_installed = true;
    }

    fn uninstall_error_handler(&self) {
        let mut state = self.state.lock();
        state.calls.push(NativeCall::UninstallErrorHandler);
        state.handler_installed = false;
    }

    fn process_teardown(&self) {
        self.record(NativeCall::ProcessTeardown);
    }
}
