//! C-compatible FFI bindings for desktop hosts.
//!
//! One client per process, guarded by a mutex, driven by a lazily
//! created tokio runtime. Failures are reported through a process-wide
//! last-error string; the in-process Rust API reports errors on each
//! call instead and never touches this global.

use crate::client::{local_lan_addresses, TunnelClient};
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::sync::{Mutex, OnceLock};
use tokio::runtime::Runtime;

static CLIENT: Mutex<Option<TunnelClient>> = Mutex::new(None);
static LAST_ERROR: Mutex<String> = Mutex::new(String::new());

fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| Runtime::new().expect("failed to create tokio runtime"))
}

fn set_error(msg: String) {
    log::error!("{}", msg);
    *LAST_ERROR.lock().unwrap() = msg;
}

unsafe fn required_str(ptr: *const c_char, what: &str) -> Result<String, String> {
    if ptr.is_null() {
        return Err(format!("{} is null", what));
    }
    Ok(CStr::from_ptr(ptr).to_string_lossy().into_owned())
}

/// Create the process-wide client. Returns 0 on success, -1 on failure
/// (see `dnsveil_get_last_error`).
///
/// # Safety
/// All pointers must be valid NUL-terminated strings or null.
#[no_mangle]
pub unsafe extern "C" fn dnsveil_create_client(
    dns_server: *const c_char,
    tunnel_domain: *const c_char,
    pubkey_hex: *const c_char,
    listen_addr: *const c_char,
) -> c_int {
    let mut client = CLIENT.lock().unwrap();
    if client.is_some() {
        set_error("client already exists".to_string());
        return -1;
    }

    let args = (|| {
        Ok::<_, String>((
            unsafe { required_str(dns_server, "dns_server") }?,
            unsafe { required_str(tunnel_domain, "tunnel_domain") }?,
            unsafe { required_str(pubkey_hex, "pubkey_hex") }?,
            unsafe { required_str(listen_addr, "listen_addr") }?,
        ))
    })();
    let (dns_server, tunnel_domain, pubkey_hex, listen_addr) = match args {
        Ok(args) => args,
        Err(e) => {
            set_error(e);
            return -1;
        }
    };

    match TunnelClient::new(&dns_server, &tunnel_domain, &pubkey_hex, &listen_addr) {
        Ok(created) => {
            *client = Some(created);
            log::info!("dnsveil client created");
            0
        }
        Err(e) => {
            set_error(format!("failed to create client: {}", e));
            -1
        }
    }
}

/// Start the tunnel. Blocks through the handshake. 0 on success.
#[no_mangle]
pub extern "C" fn dnsveil_start() -> c_int {
    let client = CLIENT.lock().unwrap();
    let Some(client) = client.as_ref() else {
        set_error("client not created".to_string());
        return -1;
    };
    match runtime().block_on(client.start()) {
        Ok(()) => {
            log::info!("dnsveil client started");
            0
        }
        Err(e) => {
            set_error(format!("failed to start: {}", e));
            -1
        }
    }
}

/// Stop and discard the client. Always succeeds.
#[no_mangle]
pub extern "C" fn dnsveil_stop() -> c_int {
    let taken = CLIENT.lock().unwrap().take();
    if let Some(client) = taken {
        runtime().block_on(client.stop());
        log::info!("dnsveil client stopped");
    }
    0
}

#[no_mangle]
pub extern "C" fn dnsveil_is_running() -> bool {
    CLIENT
        .lock()
        .unwrap()
        .as_ref()
        .map(|c| c.is_running())
        .unwrap_or(false)
}

/// Enable sharing of the local proxy on the LAN. Takes effect at the
/// next start.
#[no_mangle]
pub extern "C" fn dnsveil_set_share_proxy(enabled: bool) -> c_int {
    let client = CLIENT.lock().unwrap();
    let Some(client) = client.as_ref() else {
        set_error("client not created".to_string());
        return -1;
    };
    client.set_share_proxy(enabled);
    0
}

/// Register a TUN file descriptor for diagnostics.
#[no_mangle]
pub extern "C" fn dnsveil_set_tun_fd(fd: c_int) -> c_int {
    let client = CLIENT.lock().unwrap();
    let Some(client) = client.as_ref() else {
        set_error("client not created".to_string());
        return -1;
    };
    client.set_tun_fd(fd);
    0
}

/// The last error message. Free with `dnsveil_free_string`.
#[no_mangle]
pub extern "C" fn dnsveil_get_last_error() -> *mut c_char {
    let msg = LAST_ERROR.lock().unwrap().clone();
    CString::new(msg).unwrap_or_default().into_raw()
}

/// Comma-joined private IPv4 addresses of this host, or an empty
/// string when none are known. Free with `dnsveil_free_string`.
#[no_mangle]
pub extern "C" fn dnsveil_local_lan_addresses() -> *mut c_char {
    CString::new(local_lan_addresses())
        .unwrap_or_default()
        .into_raw()
}

/// Free a string returned by this library.
///
/// # Safety
/// `s` must have been returned by this library and not freed before.
#[no_mangle]
pub unsafe extern "C" fn dnsveil_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}
