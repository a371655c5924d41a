//! Application-wide constants.
//!
//! This module centralizes the timing/sizing knobs from the design doc so
//! they aren't scattered as magic numbers across `agent` and `coordinator`.
//! Intervals are approximate by design (the design itself says "≈3s",
//! "≈10s"); callers should treat these as defaults, not protocol
//! guarantees.

use std::time::Duration;

// ============================================================================
// RPC core
// ============================================================================

/// Frame separator between JSON objects on the wire.
pub const FRAME_SEPARATOR: &[u8] = b"\r\n";

/// Cadence at which `RpcCore::scan_for_timeouts` should be driven.
pub const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_secs(3);

// ============================================================================
// Liveness
// ============================================================================

/// How often a registered Control agent is expected to `ping`.
pub const PING_INTERVAL: Duration = Duration::from_secs(10);

/// A Control connection is dropped once `now - last_ping` exceeds this.
pub const PING_TIMEOUT: Duration = Duration::from_secs(2 * PING_INTERVAL.as_secs());

/// Agent reconnect backoff.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);

// ============================================================================
// Discovery
// ============================================================================

/// Coordinator LAN discovery broadcast cadence.
pub const DISCOVERY_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);

/// Well-known UDP port agents listen on for discovery datagrams.
pub const DISCOVERY_PORT: u16 = 7873;

/// Prefix every discovery datagram must start with.
pub const DISCOVERY_MAGIC: &str = "OVERLORD";

// ============================================================================
// Logcat
// ============================================================================

/// Maximum size of a Logcat ring buffer, in bytes.
pub const LOGCAT_RING_CAPACITY: usize = 16 * 1024;

// ============================================================================
// File transfer
// ============================================================================

/// How long the HTTP bridge waits for a pending `sid` to rendezvous with a
/// secondary agent connection before giving up on a download/upload.
pub const HANDSHAKE_POLL_TIMEOUT: Duration = Duration::from_secs(20);

/// Poll period while waiting on a pending download/upload rendezvous.
pub const HANDSHAKE_POLL_PERIOD: Duration = Duration::from_millis(200);

// ============================================================================
// Shell
// ============================================================================

/// Token that closes a Shell secondary session's stdin when received on the
/// socket side of the bridge.
pub const STDIN_CLOSED_TOKEN: &[u8] = b"##STDIN_CLOSED####STDIN_CLOSED##";

// ============================================================================
// Network defaults
// ============================================================================

/// Default TCP port the coordinator listens on for agent connections.
pub const DEFAULT_AGENT_PORT: u16 = 4343;

/// Default HTTPS port probed when building the agent's candidate address
/// list (§4.3 step 1).
pub const DEFAULT_HTTPS_PORT: u16 = 4443;

/// Default plaintext HTTP port probed as a candidate fallback.
pub const DEFAULT_HTTP_PORT: u16 = 4343;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_timeout_is_double_the_interval() {
        assert_eq!(PING_TIMEOUT, PING_INTERVAL * 2);
    }

    #[test]
    fn timeout_values_are_reasonable() {
        assert!(TIMEOUT_SWEEP_INTERVAL >= Duration::from_secs(1));
        assert!(PING_INTERVAL >= Duration::from_secs(5));
    }
}
