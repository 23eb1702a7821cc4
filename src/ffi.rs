//! FFI bindings for embedding a consumer
//!
//! A renderer written in another language owns the socket and hands received
//! datagrams to `focus_consumer_feed`; this side keeps the sequence filtering,
//! the session machine and the display state. Returned strings are allocated
//! here and must be released with `focus_free_string`.

use serde_json::json;
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;
use std::slice;

use crate::config::ConsumerConfig;
use crate::consumer::{ConsumerAdapter, DashboardSink, Delivery, GameSink};
use crate::error::FocusResult;
use crate::session::SessionMachine;
use crate::types::Role;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

enum Adapter {
    Game(ConsumerAdapter<GameSink>),
    Dashboard(ConsumerAdapter<DashboardSink>),
}

/// Opaque handle to an embedded consumer
pub struct FocusConsumerHandle {
    adapter: Adapter,
    stale_after: f64,
}

impl FocusConsumerHandle {
    fn from_config(config: ConsumerConfig) -> FocusResult<Self> {
        config.validate()?;
        let adapter = match config.role {
            Role::Game => Adapter::Game(ConsumerAdapter::new(
                Role::Game,
                GameSink::new(SessionMachine::new(config.session.clone()), config.auto_start),
            )),
            Role::Dashboard => Adapter::Dashboard(ConsumerAdapter::new(
                Role::Dashboard,
                DashboardSink::new(config.history_len),
            )),
        };
        Ok(Self {
            adapter,
            stale_after: config.stale_after_secs,
        })
    }

    fn feed(&mut self, bytes: &[u8]) -> Delivery {
        match &mut self.adapter {
            Adapter::Game(a) => {
                let now = a.elapsed();
                a.handle_datagram(bytes, now)
            }
            Adapter::Dashboard(a) => {
                let now = a.elapsed();
                a.handle_datagram(bytes, now)
            }
        }
    }

    fn tick(&mut self) {
        let stale_after = self.stale_after;
        match &mut self.adapter {
            Adapter::Game(a) => {
                let now = a.elapsed();
                a.tick(now, stale_after);
            }
            Adapter::Dashboard(a) => {
                let now = a.elapsed();
                a.tick(now, stale_after);
            }
        }
    }

    /// State as JSON; finish records are handed out once
    fn state_json(&mut self) -> FocusResult<String> {
        let value = match &mut self.adapter {
            Adapter::Game(a) => {
                let finished = a.sink_mut().take_finished();
                // other events are not surfaced over the ABI
                a.sink_mut().drain_events();
                json!({
                    "role": Role::Game,
                    "health": a.health(),
                    "stats": a.stats(),
                    "session": a.sink().view(),
                    "finished": finished,
                })
            }
            Adapter::Dashboard(a) => json!({
                "role": Role::Dashboard,
                "health": a.health(),
                "stats": a.stats(),
                "dashboard": a.sink(),
                "ready": a.sink().is_ready(),
            }),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

/// Create a consumer from a JSON `ConsumerConfig`; NULL uses the defaults.
///
/// # Safety
/// - `config_json` must be NULL or a valid null-terminated C string.
/// - The handle must be freed with `focus_consumer_free`.
/// - Returns NULL on error; call `focus_last_error` for the message.
#[no_mangle]
pub unsafe extern "C" fn focus_consumer_new(config_json: *const c_char) -> *mut FocusConsumerHandle {
    clear_last_error();

    let config = if config_json.is_null() {
        ConsumerConfig::default()
    } else {
        let text = match cstr_to_string(config_json) {
            Some(s) => s,
            None => {
                set_last_error("Invalid config string pointer");
                return ptr::null_mut();
            }
        };
        match serde_json::from_str::<ConsumerConfig>(&text) {
            Ok(config) => config,
            Err(e) => {
                set_last_error(&format!("invalid consumer config: {e}"));
                return ptr::null_mut();
            }
        }
    };

    match FocusConsumerHandle::from_config(config) {
        Ok(handle) => Box::into_raw(Box::new(handle)),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Free a consumer.
///
/// # Safety
/// - `consumer` must be NULL or a pointer returned by `focus_consumer_new`.
#[no_mangle]
pub unsafe extern "C" fn focus_consumer_free(consumer: *mut FocusConsumerHandle) {
    if !consumer.is_null() {
        drop(Box::from_raw(consumer));
    }
}

/// Hand one received datagram to the consumer.
///
/// Returns 0 when accepted, 1 when stale, 2 when malformed, -1 on a bad argument.
///
/// # Safety
/// - `consumer` must be a valid pointer returned by `focus_consumer_new`.
/// - `data` must point to `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn focus_consumer_feed(
    consumer: *mut FocusConsumerHandle,
    data: *const u8,
    len: usize,
) -> i32 {
    clear_last_error();

    if consumer.is_null() || data.is_null() {
        set_last_error("Null consumer or data pointer");
        return -1;
    }

    let handle = &mut *consumer;
    match handle.feed(slice::from_raw_parts(data, len)) {
        Delivery::Accepted => 0,
        Delivery::Stale => 1,
        Delivery::Malformed => 2,
    }
}

/// Advance the consumer's clock; call from the render loop.
///
/// # Safety
/// - `consumer` must be a valid pointer returned by `focus_consumer_new`.
#[no_mangle]
pub unsafe extern "C" fn focus_consumer_tick(consumer: *mut FocusConsumerHandle) -> i32 {
    clear_last_error();

    if consumer.is_null() {
        set_last_error("Null consumer pointer");
        return -1;
    }
    (*consumer).tick();
    0
}

/// Start calibration for a game consumer.
///
/// Returns 0 on success, -1 on error.
///
/// # Safety
/// - `consumer` must be a valid pointer returned by `focus_consumer_new`.
#[no_mangle]
pub unsafe extern "C" fn focus_consumer_start(consumer: *mut FocusConsumerHandle) -> i32 {
    clear_last_error();

    if consumer.is_null() {
        set_last_error("Null consumer pointer");
        return -1;
    }

    match &mut (*consumer).adapter {
        Adapter::Game(a) => {
            let now = a.elapsed();
            a.sink_mut().start(now);
            0
        }
        Adapter::Dashboard(_) => {
            set_last_error("dashboard consumers have no session");
            -1
        }
    }
}

/// Return a finished game to idle.
///
/// Returns 0 on success, 1 if the session was not finished, -1 on error.
///
/// # Safety
/// - `consumer` must be a valid pointer returned by `focus_consumer_new`.
#[no_mangle]
pub unsafe extern "C" fn focus_consumer_play_again(consumer: *mut FocusConsumerHandle) -> i32 {
    clear_last_error();

    if consumer.is_null() {
        set_last_error("Null consumer pointer");
        return -1;
    }

    match &mut (*consumer).adapter {
        Adapter::Game(a) => {
            if a.sink_mut().play_again() {
                0
            } else {
                1
            }
        }
        Adapter::Dashboard(_) => {
            set_last_error("dashboard consumers have no session");
            -1
        }
    }
}

/// Current consumer state as JSON.
///
/// For game consumers the `finished` array carries each finish record exactly once.
///
/// # Safety
/// - `consumer` must be a valid pointer returned by `focus_consumer_new`.
/// - Returns a newly allocated string that must be freed with `focus_free_string`.
/// - Returns NULL on error; call `focus_last_error` for the message.
#[no_mangle]
pub unsafe extern "C" fn focus_consumer_state_json(consumer: *mut FocusConsumerHandle) -> *mut c_char {
    clear_last_error();

    if consumer.is_null() {
        set_last_error("Null consumer pointer");
        return ptr::null_mut();
    }

    match (*consumer).state_json() {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Free a string returned by this library.
///
/// # Safety
/// - `ptr` must be NULL or a pointer returned by a `focus_*` function.
#[no_mangle]
pub unsafe extern "C" fn focus_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

/// Last error message on this thread, or NULL.
///
/// # Safety
/// - Valid until the next `focus_*` call on this thread. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn focus_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

/// Library version. Static string, do NOT free.
///
/// # Safety
/// Always safe to call.
#[no_mangle]
pub unsafe extern "C" fn focus_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}
