//! TCP Relay
//!
//! Stateful TCP segment rewriting and encryption relay. The relay sits on a
//! host's egress and ingress packet queues and:
//! - encrypts outgoing TCP payloads and decrypts incoming ones
//! - rewrites sequence/ack numbers so ciphertext length changes stay
//!   invisible to both the local TCP stack and the remote peer
//! - detects retransmissions and duplicates and replays their translations
//! - shares per-connection state between the two concurrently running
//!   directions
//!
//! A C ABI is exported for the capture-layer shim that binds the queues.

use std::ffi::CStr;
use std::panic::{self, AssertUnwindSafe};
use std::slice;
use std::sync::{Arc, Once};

// ============================================================================
// Modules
// ============================================================================

pub mod cipher;
pub mod config;
pub mod diag;
pub mod error;
pub mod metrics;
pub mod packet;
pub mod rewriter;
pub mod seq;
pub mod state;
pub mod table;

pub use cipher::{Cipher, PassthroughCipher, SealedCipher};
pub use config::RelayConfig;
pub use diag::{ChannelSink, DiagCategory, DiagEvent, DiagnosticSink, LogSink, MemorySink, Severity};
pub use error::{Anomaly, CipherError, ConfigError, PacketError};
pub use metrics::RelayMetrics;
pub use rewriter::{Relay, Verdict};
pub use state::{ConnectionKey, ConnectionPhase, ConnectionState, Direction};
pub use table::{ConnectionTable, MergeOutcome, SharedConnectionTable};

// ============================================================================
// FFI Enums
// ============================================================================

/// Verdict returned to the capture layer
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketVerdict {
    Drop = 0,
    /// Rewritten packet written to the output buffer
    Accept = 1,
    /// Output buffer too small; `out_len` holds the required size
    BufferTooSmall = 2,
    /// Invalid pointer or caught panic
    Error = 3,
}

// ============================================================================
// Relay Handle
// ============================================================================

/// Opaque handle owned by the capture layer
pub struct RelayHandle {
    relay: Relay,
}

impl RelayHandle {
    fn new(config: RelayConfig, cipher: Arc<dyn Cipher>) -> std::io::Result<Self> {
        let metrics = Arc::new(RelayMetrics::new());
        let sink = Arc::new(ChannelSink::spawn(config.diag_channel_capacity, Arc::clone(&metrics))?);
        let table = Arc::new(SharedConnectionTable::new(config.merge_retries));

        log::info!(
            "Relay created (egress queue {}, ingress queue {}, encryption {})",
            config.egress_queue,
            config.ingress_queue,
            if config.encryption_enabled { "on" } else { "off" }
        );

        Ok(RelayHandle {
            relay: Relay::with_parts(config, table, cipher, sink, metrics),
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Initialize logging (called once)
static INIT_LOGGING: Once = Once::new();

fn init_logging() {
    INIT_LOGGING.call_once(|| {
        // The host may already have installed a logger
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .try_init();
    });
}

unsafe fn parse_config(config_json: *const libc::c_char) -> Option<RelayConfig> {
    if config_json.is_null() {
        return Some(RelayConfig::default());
    }

    let json = CStr::from_ptr(config_json).to_str().ok()?;
    match RelayConfig::from_json(json) {
        Ok(config) => Some(config),
        Err(e) => {
            log::error!("Rejecting relay config: {}", e);
            None
        }
    }
}

unsafe fn build_cipher(key: *const u8, key_len: usize) -> Option<Arc<dyn Cipher>> {
    if key.is_null() {
        return Some(Arc::new(PassthroughCipher));
    }

    let key = slice::from_raw_parts(key, key_len);
    match SealedCipher::new(key) {
        Ok(cipher) => Some(Arc::new(cipher)),
        Err(e) => {
            log::error!("Rejecting relay key: {}", e);
            None
        }
    }
}

/// Shared body of the two packet entry points
unsafe fn handle_packet(
    handle: *const RelayHandle,
    data: *const u8,
    len: usize,
    out: *mut u8,
    out_cap: usize,
    out_len: *mut usize,
    direction: Direction,
) -> PacketVerdict {
    if handle.is_null() || data.is_null() || out.is_null() || out_len.is_null() {
        return PacketVerdict::Error;
    }

    panic::catch_unwind(AssertUnwindSafe(|| {
        let relay = &(*handle).relay;
        let packet = slice::from_raw_parts(data, len);

        let verdict = match direction {
            Direction::Egress => relay.handle_egress(packet),
            Direction::Ingress => relay.handle_ingress(packet),
        };

        match verdict {
            Verdict::Accept(bytes) => {
                *out_len = bytes.len();
                if bytes.len() > out_cap {
                    return PacketVerdict::BufferTooSmall;
                }
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), out, bytes.len());
                PacketVerdict::Accept
            }
            Verdict::Drop => {
                *out_len = 0;
                PacketVerdict::Drop
            }
        }
    }))
    .unwrap_or(PacketVerdict::Error)
}

// ============================================================================
// FFI Functions - Relay Lifecycle
// ============================================================================

/// Create a relay
///
/// # Arguments
/// * `config_json` - JSON config (null-terminated), or null for defaults
/// * `key` - 32-byte ChaCha20-Poly1305 key, or null for pass-through
/// * `key_len` - Length of `key`
///
/// Returns null if the config or key is rejected. The caller must release
/// the handle with `relay_destroy`.
#[no_mangle]
pub unsafe extern "C" fn relay_create(
    config_json: *const libc::c_char,
    key: *const u8,
    key_len: usize,
) -> *mut RelayHandle {
    init_logging();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let config = parse_config(config_json)?;
        let cipher = build_cipher(key, key_len)?;
        RelayHandle::new(config, cipher).ok().map(Box::new)
    }));

    match result {
        Ok(Some(handle)) => Box::into_raw(handle),
        _ => std::ptr::null_mut(),
    }
}

/// Destroy a relay, flushing pending diagnostics
///
/// # Safety
/// The pointer must be valid and created by `relay_create`.
#[no_mangle]
pub unsafe extern "C" fn relay_destroy(handle: *mut RelayHandle) {
    if !handle.is_null() {
        let _ = panic::catch_unwind(AssertUnwindSafe(|| {
            drop(Box::from_raw(handle));
        }));
    }
}

// ============================================================================
// FFI Functions - Packet Path
// ============================================================================

/// Rewrite a packet from the egress queue
///
/// # Arguments
/// * `handle` - Relay handle
/// * `data`, `len` - Raw IPv4 packet
/// * `out`, `out_cap` - Buffer for the rewritten packet
/// * `out_len` - On output: bytes written (or required, on `BufferTooSmall`)
#[no_mangle]
pub unsafe extern "C" fn relay_handle_egress(
    handle: *const RelayHandle,
    data: *const u8,
    len: usize,
    out: *mut u8,
    out_cap: usize,
    out_len: *mut usize,
) -> PacketVerdict {
    handle_packet(handle, data, len, out, out_cap, out_len, Direction::Egress)
}

/// Rewrite a packet from the ingress queue
///
/// Same contract as `relay_handle_egress`.
#[no_mangle]
pub unsafe extern "C" fn relay_handle_ingress(
    handle: *const RelayHandle,
    data: *const u8,
    len: usize,
    out: *mut u8,
    out_cap: usize,
    out_len: *mut usize,
) -> PacketVerdict {
    handle_packet(handle, data, len, out, out_cap, out_len, Direction::Ingress)
}

// ============================================================================
// FFI Functions - Housekeeping
// ============================================================================

/// Evict idle connections; returns how many were removed
///
/// Call periodically (e.g. every few seconds) from the capture loop.
#[no_mangle]
pub unsafe extern "C" fn relay_evict_idle(handle: *const RelayHandle) -> u32 {
    if handle.is_null() {
        return 0;
    }

    panic::catch_unwind(AssertUnwindSafe(|| (*handle).relay.evict_idle().len() as u32)).unwrap_or(0)
}

/// Number of tracked connections
#[no_mangle]
pub unsafe extern "C" fn relay_connection_count(handle: *const RelayHandle) -> u32 {
    if handle.is_null() {
        return 0;
    }

    panic::catch_unwind(AssertUnwindSafe(|| (*handle).relay.table().len() as u32)).unwrap_or(0)
}

/// Configured egress queue number
#[no_mangle]
pub unsafe extern "C" fn relay_egress_queue(handle: *const RelayHandle) -> u16 {
    if handle.is_null() {
        return 0;
    }
    (*handle).relay.config().egress_queue
}

/// Configured ingress queue number
#[no_mangle]
pub unsafe extern "C" fn relay_ingress_queue(handle: *const RelayHandle) -> u16 {
    if handle.is_null() {
        return 0;
    }
    (*handle).relay.config().ingress_queue
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::test_support::build_segment;
    use crate::packet::TcpFlags;
    use std::ffi::CString;
    use std::net::SocketAddrV4;

    fn syn() -> Vec<u8> {
        let host: SocketAddrV4 = "10.0.0.2:40000".parse().unwrap();
        let remote: SocketAddrV4 = "192.168.1.100:443".parse().unwrap();
        let flags = TcpFlags {
            syn: true,
            ..Default::default()
        };
        build_segment(host, remote, 1000, None, flags, b"")
    }

    #[test]
    fn test_relay_create_destroy() {
        unsafe {
            let handle = relay_create(std::ptr::null(), std::ptr::null(), 0);
            assert!(!handle.is_null());
            assert_eq!(relay_egress_queue(handle), 1);
            assert_eq!(relay_ingress_queue(handle), 2);
            assert_eq!(relay_connection_count(handle), 0);
            relay_destroy(handle);
        }
    }

    #[test]
    fn test_relay_create_with_config_and_key() {
        let config = CString::new(r#"{"egress_queue": 10, "ingress_queue": 11}"#).unwrap();
        let key = [9u8; 32];
        unsafe {
            let handle = relay_create(config.as_ptr(), key.as_ptr(), key.len());
            assert!(!handle.is_null());
            assert_eq!(relay_egress_queue(handle), 10);
            assert_eq!(relay_ingress_queue(handle), 11);
            relay_destroy(handle);
        }
    }

    #[test]
    fn test_relay_create_rejects_bad_input() {
        let bad_config = CString::new("{ nope").unwrap();
        let short_key = [1u8; 8];
        unsafe {
            assert!(relay_create(bad_config.as_ptr(), std::ptr::null(), 0).is_null());
            assert!(relay_create(std::ptr::null(), short_key.as_ptr(), short_key.len()).is_null());
        }
    }

    #[test]
    fn test_handle_egress_writes_output() {
        let packet = syn();
        let mut out = [0u8; 1500];
        let mut out_len = 0usize;

        unsafe {
            let handle = relay_create(std::ptr::null(), std::ptr::null(), 0);
            let verdict = relay_handle_egress(
                handle,
                packet.as_ptr(),
                packet.len(),
                out.as_mut_ptr(),
                out.len(),
                &mut out_len,
            );
            assert_eq!(verdict, PacketVerdict::Accept);
            assert_eq!(out_len, packet.len());
            assert_eq!(relay_connection_count(handle), 1);
            relay_destroy(handle);
        }
    }

    #[test]
    fn test_handle_reports_small_buffer() {
        let packet = syn();
        let mut out = [0u8; 8];
        let mut out_len = 0usize;

        unsafe {
            let handle = relay_create(std::ptr::null(), std::ptr::null(), 0);
            let verdict = relay_handle_egress(
                handle,
                packet.as_ptr(),
                packet.len(),
                out.as_mut_ptr(),
                out.len(),
                &mut out_len,
            );
            assert_eq!(verdict, PacketVerdict::BufferTooSmall);
            assert_eq!(out_len, packet.len());
            relay_destroy(handle);
        }
    }

    #[test]
    fn test_handle_ingress_drops_garbage() {
        let garbage = [0x45u8, 0, 0, 4];
        let mut out = [0u8; 64];
        let mut out_len = 99usize;

        unsafe {
            let handle = relay_create(std::ptr::null(), std::ptr::null(), 0);
            let verdict = relay_handle_ingress(
                handle,
                garbage.as_ptr(),
                garbage.len(),
                out.as_mut_ptr(),
                out.len(),
                &mut out_len,
            );
            assert_eq!(verdict, PacketVerdict::Drop);
            assert_eq!(out_len, 0);
            relay_destroy(handle);
        }
    }

    #[test]
    fn test_null_pointers() {
        let mut out_len = 0usize;
        unsafe {
            let verdict = relay_handle_egress(
                std::ptr::null(),
                std::ptr::null(),
                0,
                std::ptr::null_mut(),
                0,
                &mut out_len,
            );
            assert_eq!(verdict, PacketVerdict::Error);
            assert_eq!(relay_evict_idle(std::ptr::null()), 0);
            assert_eq!(relay_connection_count(std::ptr::null()), 0);
            relay_destroy(std::ptr::null_mut());
        }
    }

    #[test]
    fn test_evict_idle_keeps_fresh_connections() {
        let packet = syn();
        let mut out = [0u8; 1500];
        let mut out_len = 0usize;

        unsafe {
            let handle = relay_create(std::ptr::null(), std::ptr::null(), 0);
            relay_handle_egress(handle, packet.as_ptr(), packet.len(), out.as_mut_ptr(), out.len(), &mut out_len);
            assert_eq!(relay_evict_idle(handle), 0);
            assert_eq!(relay_connection_count(handle), 1);
            relay_destroy(handle);
        }
    }
}
