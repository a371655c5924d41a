//! Machine-id and session-id generation.
//!
//! A session id (`sid`) is a fresh UUIDv4 per connection. A machine id
//! (`mid`) identifies the host running an agent and must be stable across
//! restarts, so it is derived from durable local material the way the
//! teacher derives its repo-scoped hub id (`hub_id_for_repo`, a hash of the
//! repo path): here, the hostname plus a persisted random salt, SHA-256'd
//! down to a short hex string.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generate a fresh session id.
#[must_use]
pub fn new_sid() -> String {
    Uuid::new_v4().to_string()
}

/// Derive a stable machine id from the local hostname and a salt (normally
/// a persisted random value loaded from the agent's config directory, so
/// the id survives restarts but two machines never collide even if they
/// share a hostname).
#[must_use]
pub fn derive_mid(hostname: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(hostname.as_bytes());
    hasher.update(b":");
    hasher.update(salt.as_bytes());
    let digest = hasher.finalize();
    hex_encode(&digest[..16])
}

/// Generate a fresh random salt for a new agent identity.
#[must_use]
pub fn new_salt() -> String {
    Uuid::new_v4().simple().to_string()
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").expect("writing to a String cannot fail");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mid_is_stable_for_same_inputs() {
        let a = derive_mid("host1", "salt1");
        let b = derive_mid("host1", "salt1");
        assert_eq!(a, b);
    }

    #[test]
    fn mid_differs_across_hosts_with_same_salt() {
        let a = derive_mid("host1", "salt1");
        let b = derive_mid("host2", "salt1");
        assert_ne!(a, b);
    }

    #[test]
    fn sid_values_are_unique() {
        let a = new_sid();
        let b = new_sid();
        assert_ne!(a, b);
    }
}
