// src/native/xlib.rs
#![allow(non_snake_case)] // Allow non-snake case for X11 types

//! [`NativeDisplay`] over Xlib.
//!
//! Handles are the addresses of Xlib `Display` structures. This layer does no
//! bookkeeping of its own; ownership of every pointer lives in the registry.

use crate::error::{DisplayError, Result};
use crate::native::{DisplayHandle, NativeDisplay};
use libc::{c_char, c_int};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use x11::xlib;

type ErrorHandlerFn = unsafe extern "C" fn(*mut xlib::Display, *mut xlib::XErrorEvent) -> c_int;

/// Whether the installed interceptor should stay silent.
static QUIET: AtomicBool = AtomicBool::new(false);

/// Handler that was active before ours was installed; restored on uninstall.
static PREVIOUS_HANDLER: Lazy<Mutex<Option<ErrorHandlerFn>>> = Lazy::new(|| Mutex::new(None));

/// Swallows X protocol errors instead of letting Xlib's default handler
/// terminate the process.
unsafe extern "C" fn intercept_x_error(
    display: *mut xlib::Display,
    event: *mut xlib::XErrorEvent,
) -> c_int {
    if event.is_null() || QUIET.load(Ordering::Relaxed) {
        return 0;
    }
    let ev = &*event;

    let mut buf = [0 as c_char; 256];
    xlib::XGetErrorText(
        display,
        ev.error_code as c_int,
        buf.as_mut_ptr(),
        buf.len() as c_int,
    );
    let text = CStr::from_ptr(buf.as_ptr()).to_string_lossy();

    warn!(
        "Intercepted X error on display {:p}: {} (code {}, request {}.{}, resource {:#x}, serial {})",
        display, text, ev.error_code, ev.request_code, ev.minor_code, ev.resourceid, ev.serial
    );
    0
}

/// The Xlib native layer. Stateless apart from the process-wide error handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct XlibDisplay;

impl XlibDisplay {
    pub fn new() -> Self {
        XlibDisplay
    }

    #[inline]
    fn raw(handle: DisplayHandle) -> *mut xlib::Display {
        handle.as_raw() as *mut xlib::Display
    }
}

impl NativeDisplay for XlibDisplay {
    fn open(&self, name: Option<&str>) -> Option<DisplayHandle> {
        // Passing NULL to XOpenDisplay means it will use the DISPLAY
        // environment variable.
        let c_name = match name.map(CString::new).transpose() {
            Ok(c_name) => c_name,
            Err(_) => {
                warn!("Display name {:?} contains an interior NUL byte.", name);
                return None;
            }
        };
        let name_ptr = c_name.as_ref().map_or(ptr::null(), |n| n.as_ptr());

        // SAFETY: `name_ptr` is null or points into `c_name`, alive until the
        // end of this function.
        let display_ptr = unsafe { xlib::XOpenDisplay(name_ptr) };
        if display_ptr.is_null() {
            warn!(
                "XOpenDisplay({:?}) failed. Check DISPLAY environment variable or X server status.",
                name
            );
            return None;
        }
        debug!("XOpenDisplay({:?}) -> {:p}", name, display_ptr);
        DisplayHandle::from_raw(display_ptr as usize)
    }

    unsafe fn close(&self, handle: DisplayHandle) -> Result<()> {
        // SAFETY: the caller guarantees `handle` came from XOpenDisplay and
        // is still open; nothing touches it after this call.
        let status = unsafe { xlib::XCloseDisplay(Self::raw(handle)) };
        if status != 0 {
            return Err(DisplayError::CloseFailed {
                handle,
                status: status as i32,
            });
        }
        debug!("XCloseDisplay({}) ok", handle);
        Ok(())
    }

    unsafe fn lock(&self, handle: DisplayHandle) {
        // SAFETY: the caller guarantees `handle` is a live Display.
        unsafe { xlib::XLockDisplay(Self::raw(handle)) };
    }

    unsafe fn unlock(&self, handle: DisplayHandle) {
        // SAFETY: the caller guarantees `handle` is a live Display it locked.
        unsafe { xlib::XUnlockDisplay(Self::raw(handle)) };
    }

    unsafe fn query_name(&self, handle: DisplayHandle) -> String {
        // SAFETY: the caller guarantees `handle` is a live Display.
        // XDisplayString returns a pointer owned by it, valid until
        // XCloseDisplay. We copy it out immediately.
        unsafe {
            let name = xlib::XDisplayString(Self::raw(handle));
            if name.is_null() {
                return String::new();
            }
            CStr::from_ptr(name).to_string_lossy().into_owned()
        }
    }

    fn init_thread_support(&self, first_action: bool) -> bool {
        // XInitThreads must be the first Xlib call of the process. Calling it
        // later is undefined behaviour on some Xlib versions, so skip it.
        if !first_action {
            info!("Not the first native action of the process; skipping XInitThreads.");
            return false;
        }
        // SAFETY: no handle involved; ordering is checked above.
        let ok = unsafe { xlib::XInitThreads() } != 0;
        if !ok {
            warn!("XInitThreads failed; native display locking is unavailable.");
        }
        ok
    }

    fn install_error_handler(&self, quiet: bool) {
        QUIET.store(quiet, Ordering::Relaxed);
        // SAFETY: `intercept_x_error` has the signature Xlib expects and
        // never unwinds.
        let previous = unsafe { xlib::XSetErrorHandler(Some(intercept_x_error)) };
        *PREVIOUS_HANDLER.lock() = previous;
        debug!("X error interceptor installed (quiet: {}).", quiet);
    }

    fn uninstall_error_handler(&self) {
        let previous = PREVIOUS_HANDLER.lock().take();
        // SAFETY: `previous` is whatever Xlib handed back on install, or
        // None for its default handler.
        unsafe { xlib::XSetErrorHandler(previous) };
        QUIET.store(false, Ordering::Relaxed);
        debug!("X error interceptor uninstalled.");
    }

    fn process_teardown(&self) {
        // Nothing of ours stays hooked into Xlib past this point.
        if let Some(previous) = PREVIOUS_HANDLER.lock().take() {
            // SAFETY: as in uninstall_error_handler.
            unsafe { xlib::XSetErrorHandler(Some(previous)) };
        }
        info!("Xlib native layer torn down.");
    }
}
