//! Protocol-level error kinds.
//!
//! §7 distinguishes five abstract error kinds: transport, protocol,
//! registration, timeout, handshake (filesystem errors are returned to the
//! operator verbatim in a response payload and never become a Rust error
//! type of their own). Transport/protocol/timeout faults are ordinary
//! `anyhow::Error` — the caller only needs to log and move on. Registration
//! and handshake faults are distinguished explicitly because callers branch
//! on them (ConnServer converts a `RegistrationError` into a specific wire
//! response string; the HTTP bridge converts a `HandshakeError` into a
//! specific status code).

use std::fmt;

/// Why a `register` frame was rejected (§4.4 registration gate, §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// `mid` was empty.
    EmptyMachineId,
    /// `sid` was empty.
    EmptySessionId,
    /// A Control agent already exists for this `mid` (invariant 4).
    DuplicateMachineId(String),
    /// A Logcat agent already exists for this `(mid, sid)`.
    DuplicateLogcatSession(String, String),
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyMachineId => write!(f, "register: mid must not be empty"),
            Self::EmptySessionId => write!(f, "register: sid must not be empty"),
            Self::DuplicateMachineId(mid) => {
                write!(f, "register: duplicate mid {mid:?}")
            }
            Self::DuplicateLogcatSession(mid, sid) => {
                write!(f, "register: duplicate logcat session ({mid:?}, {sid:?})")
            }
        }
    }
}

impl std::error::Error for RegistrationError {}

/// Why a pending rendezvous (download/upload/stream spawn) never completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// No secondary agent connected within the poll window.
    Timeout,
    /// The target Control agent is not currently registered.
    AgentNotFound(String),
    /// The agent responded to the spawn request with a failure status.
    SpawnRejected(String),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "secondary agent did not connect in time"),
            Self::AgentNotFound(mid) => write!(f, "no control agent registered for mid {mid:?}"),
            Self::SpawnRejected(reason) => write!(f, "agent rejected spawn request: {reason}"),
        }
    }
}

impl std::error::Error for HandshakeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_error_messages_name_the_offending_field() {
        assert!(RegistrationError::EmptyMachineId.to_string().contains("mid"));
        assert!(RegistrationError::EmptySessionId.to_string().contains("sid"));
        assert!(RegistrationError::DuplicateMachineId("m1".into())
            .to_string()
            .contains("m1"));
    }

    #[test]
    fn handshake_error_timeout_message() {
        assert!(HandshakeError::Timeout.to_string().contains("did not connect"));
    }
}
