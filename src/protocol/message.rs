//! Wire types: `Request`/`Response` (§3.3) and the session-mode enumeration.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A request frame. `timeout_s < 0` means fire-and-forget: no responder is
/// recorded and no response is expected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub rid: String,
    pub name: String,
    #[serde(default)]
    pub timeout_s: i64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Request {
    /// Build a request with a UUIDv4 `rid`.
    #[must_use]
    pub fn new(name: impl Into<String>, timeout_s: i64, payload: serde_json::Value) -> Self {
        Self {
            rid: Uuid::new_v4().to_string(),
            name: name.into(),
            timeout_s,
            payload,
        }
    }

    /// A request with a negative timeout is fire-and-forget: the sender
    /// never arms a responder for it.
    #[must_use]
    pub fn is_fire_and_forget(&self) -> bool {
        self.timeout_s < 0
    }
}

/// A response frame, matched to its request by `rid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub rid: String,
    pub status: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Canonical success status string.
pub const STATUS_SUCCESS: &str = "success";
/// Canonical failure status string.
pub const STATUS_FAILED: &str = "failed";

impl Response {
    /// Build a success response.
    #[must_use]
    pub fn success(rid: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            rid: rid.into(),
            status: STATUS_SUCCESS.to_string(),
            payload,
        }
    }

    /// Build a failure response carrying `message` as the status text
    /// (§4.4: "respond with error text on the same rid").
    #[must_use]
    pub fn failure(rid: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rid: rid.into(),
            status: message.into(),
            payload: serde_json::Value::Null,
        }
    }

    /// A `None` response used when `ScanForTimeouts` fires a handler.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

/// Session mode, decided at registration and immutable for the connection
/// (§3.3). Serialized as its variant name in `register.payload.mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionMode {
    Control = 0,
    Terminal = 1,
    Shell = 2,
    Logcat = 3,
    File = 4,
    Forward = 5,
}

impl SessionMode {
    /// Every Control-only gated behavior checks this.
    #[must_use]
    pub fn is_control(self) -> bool {
        matches!(self, Self::Control)
    }

    /// Terminal/Shell/Forward share the "rendezvous with a pending operator
    /// WebSocket" path (§4.4).
    #[must_use]
    pub fn is_stream_mode(self) -> bool {
        matches!(self, Self::Terminal | Self::Shell | Self::Forward)
    }
}

/// Logcat framing format, carried in the registration payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Rewrite `\n` to `\r\n` before sending to subscribers.
    #[default]
    Text,
    /// Pass bytes through unchanged (already terminal-formatted).
    Term,
}

/// Payload of the first frame any agent connection sends (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub mid: String,
    pub sid: String,
    pub mode: SessionMode,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub properties: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip_is_identity() {
        let req = Request::new("ping", 30, serde_json::json!({}));
        let encoded = serde_json::to_string(&req).unwrap();
        let decoded: Request = serde_json::from_str(&encoded).unwrap();
        assert_eq!(req.rid, decoded.rid);
        assert_eq!(req.name, decoded.name);
        assert_eq!(req.timeout_s, decoded.timeout_s);
    }

    #[test]
    fn response_round_trip_is_identity() {
        let res = Response::success("r1", serde_json::json!({"ok": true}));
        let encoded = serde_json::to_string(&res).unwrap();
        let decoded: Response = serde_json::from_str(&encoded).unwrap();
        assert_eq!(res.rid, decoded.rid);
        assert_eq!(res.status, decoded.status);
        assert_eq!(res.payload, decoded.payload);
    }

    #[test]
    fn fire_and_forget_detection() {
        assert!(Request::new("upgrade", -1, serde_json::json!({})).is_fire_and_forget());
        assert!(!Request::new("ping", 30, serde_json::json!({})).is_fire_and_forget());
    }

    #[test]
    fn session_mode_classification() {
        assert!(SessionMode::Control.is_control());
        assert!(SessionMode::Terminal.is_stream_mode());
        assert!(SessionMode::Shell.is_stream_mode());
        assert!(SessionMode::Forward.is_stream_mode());
        assert!(!SessionMode::Logcat.is_stream_mode());
        assert!(!SessionMode::File.is_stream_mode());
    }
}
