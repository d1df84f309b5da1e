//! C-compatible exports called by the host-side loader

use std::ffi::c_char;

use tracing::instrument;

use vulpes_core::HookEvent;

use crate::tick;

// Plugin metadata - static strings with null terminators for C compatibility
static NAME: &[u8] = b"vulpes\0";
static DESCRIPTION: &[u8] = b"Runtime code patching engine\0";
static URL: &[u8] = b"https://github.com/vulpes-rs/vulpes\0";
static LICENSE: &[u8] = b"MIT\0";
static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();

/// Called when the plugin is loaded
///
/// # Safety
/// - `error` must be a valid pointer to a buffer of at least `maxlen` bytes, or null
#[no_mangle]
#[instrument(skip_all)]
pub unsafe extern "C" fn vulpes_load(error: *mut c_char, maxlen: usize) -> bool {
    match std::panic::catch_unwind(crate::load) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!("Failed to load: {}", e);
            write_error(error, maxlen, &e.to_string());
            false
        }
        Err(_) => {
            write_error(error, maxlen, "Panic during load");
            false
        }
    }
}

/// Called when the plugin is unloaded. Reverts every patch.
#[no_mangle]
#[instrument(skip_all)]
pub extern "C" fn vulpes_unload() -> bool {
    match std::panic::catch_unwind(crate::shutdown) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!("Failed to unload: {}", e);
            false
        }
        Err(_) => {
            tracing::error!("Panic during shutdown");
            false
        }
    }
}

/// Run the `PreTick` hooks. For hosts that drive ticks themselves instead
/// of through the tick cave.
#[no_mangle]
pub extern "C" fn vulpes_before_tick() -> bool {
    tick::dispatch(HookEvent::PreTick);
    true
}

/// Run the `Tick` hooks
#[no_mangle]
pub extern "C" fn vulpes_after_tick() {
    tick::dispatch(HookEvent::Tick);
}

/// Run the hooks of an event by number (0 pre-tick, 1 tick, 2 pre-map-load,
/// 3 map-load). Returns how many hooks ran.
#[no_mangle]
pub extern "C" fn vulpes_fire_event(event: u32) -> usize {
    match HookEvent::from_raw(event) {
        Some(event) => tick::dispatch(event),
        None => {
            tracing::warn!("Unknown event {}", event);
            0
        }
    }
}

// Metadata exports - these return static strings for the loader to display

#[no_mangle]
pub extern "C" fn vulpes_get_name() -> *const c_char {
    NAME.as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn vulpes_get_description() -> *const c_char {
    DESCRIPTION.as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn vulpes_get_url() -> *const c_char {
    URL.as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn vulpes_get_license() -> *const c_char {
    LICENSE.as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn vulpes_get_version() -> *const c_char {
    VERSION.as_ptr() as *const c_char
}

/// Copy `msg` into a C buffer, truncating and always null-terminating
unsafe fn write_error(error: *mut c_char, maxlen: usize, msg: &str) {
    if !error.is_null() && maxlen > 0 {
        let bytes = msg.as_bytes();
        let len = bytes.len().min(maxlen - 1);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), error as *mut u8, len);
        *error.add(len) = 0;
    }
}
