//! RPC core (C2): per-connection request/response correlation.
//!
//! Mirrors the shape of the teacher's blocking `BrokerConnection` in
//! `broker::connection` — a synchronous core wrapped by an async reader
//! pump and an event-loop task — but this core is itself transport-agnostic:
//! it owns the frame decoder and the responder map, not the socket. The
//! owning task (agent control loop, or coordinator `ConnServer`) is
//! responsible for actually writing bytes and for driving `scan_for_timeouts`
//! on a timer, matching §4.2's "not itself thread-safe, single owning task"
//! contract.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::{encode_request, encode_response, Frame, FrameDecoder, ParseMode, Request, Response};

/// Called exactly once per tracked request: with `Some(response)` if one
/// arrived before the timeout, or `None` if `scan_for_timeouts` fired first.
pub type ResponseHandler = Box<dyn FnOnce(Option<Response>) + Send>;

struct ResponderEntry {
    request_time: Instant,
    timeout: Duration,
    handler: Option<ResponseHandler>,
}

/// Per-connection RPC state: rolling frame decoder plus the `rid -> responder`
/// map (§3.3 "Responder entry").
#[derive(Default)]
pub struct RpcCore {
    decoder: FrameDecoder,
    responders: HashMap<String, ResponderEntry>,
}

impl RpcCore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `req` for writing, and — unless it is fire-and-forget — record
    /// a responder entry stamped with the current time. `handler == None` is
    /// legal: only the timeout sweep is armed (§4.2).
    pub fn send_request(&mut self, req: &Request, handler: Option<ResponseHandler>) -> Vec<u8> {
        if !req.is_fire_and_forget() {
            self.responders.insert(
                req.rid.clone(),
                ResponderEntry {
                    request_time: Instant::now(),
                    timeout: Duration::from_secs(req.timeout_s.max(0) as u64),
                    handler,
                },
            );
        }
        encode_request(req)
    }

    /// Encode `res` for writing. Responses are never tracked.
    #[must_use]
    pub fn send_response(&self, res: &Response) -> Vec<u8> {
        encode_response(res)
    }

    /// Feed `chunk` through the frame decoder in `mode`. Response frames are
    /// dispatched synchronously to their matching handler (the entry is
    /// removed whether or not a handler was registered); Request frames are
    /// returned to the caller.
    pub fn parse_requests(&mut self, chunk: &[u8], mode: ParseMode) -> Vec<Request> {
        let frames = self.decoder.feed(chunk, mode);
        let mut requests = Vec::with_capacity(frames.len());
        for frame in frames {
            match frame {
                Frame::Request(req) => requests.push(req),
                Frame::Response(res) => self.dispatch_response(res),
            }
        }
        requests
    }

    fn dispatch_response(&mut self, res: Response) {
        match self.responders.remove(&res.rid) {
            Some(entry) => {
                if let Some(handler) = entry.handler {
                    handler(Some(res));
                }
            }
            None => {
                log::debug!("unsolicited response for rid {:?} dropped", res.rid);
            }
        }
    }

    /// Invoke the handler of every responder whose timeout has elapsed with
    /// a `None` response, then remove it. Returns how many fired. Intended
    /// to be driven on a fixed cadence (`constants::TIMEOUT_SWEEP_INTERVAL`).
    pub fn scan_for_timeouts(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .responders
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.request_time) > entry.timeout)
            .map(|(rid, _)| rid.clone())
            .collect();

        for rid in &expired {
            if let Some(entry) = self.responders.remove(rid) {
                if let Some(handler) = entry.handler {
                    handler(None);
                }
            }
        }
        expired.len()
    }

    /// Drop all outstanding responders without invoking their handlers.
    /// Called on reconnect (§4.2).
    pub fn clear_requests(&mut self) {
        self.responders.clear();
    }

    /// Number of outstanding (tracked) responders.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.responders.len()
    }

    /// Drain whatever raw bytes are buffered in the frame decoder without
    /// parsing them (§4.1 Logcat residual hand-off).
    pub fn take_raw_residual(&mut self) -> Vec<u8> {
        self.decoder.take_residual()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn frame_bytes(req: &Request) -> Vec<u8> {
        encode_request(req)
    }

    #[test]
    fn handler_invoked_exactly_once_on_matching_response() {
        let mut core = RpcCore::new();
        let called = Arc::new(AtomicUsize::new(0));
        let called2 = Arc::clone(&called);

        let req = Request::new("ping", 30, serde_json::json!({}));
        let rid = req.rid.clone();
        let _bytes = core.send_request(
            &req,
            Some(Box::new(move |res| {
                called2.fetch_add(1, Ordering::SeqCst);
                assert!(res.is_some());
            })),
        );
        assert_eq!(core.pending_count(), 1);

        let response = Response::success(rid, serde_json::json!({"response": "pong"}));
        let bytes = encode_response(&response);
        let requests = core.parse_requests(&bytes, ParseMode::Multi);
        assert!(requests.is_empty());
        assert_eq!(called.load(Ordering::SeqCst), 1);
        assert_eq!(core.pending_count(), 0);
    }

    #[test]
    fn timeout_sweep_invokes_handler_with_none() {
        let mut core = RpcCore::new();
        let got_none = Arc::new(AtomicBool::new(false));
        let got_none2 = Arc::clone(&got_none);

        let mut req = Request::new("ping", 0, serde_json::json!({}));
        req.timeout_s = 0;
        core.send_request(
            &req,
            Some(Box::new(move |res| {
                got_none2.store(res.is_none(), Ordering::SeqCst);
            })),
        );

        std::thread::sleep(Duration::from_millis(5));
        let fired = core.scan_for_timeouts();
        assert_eq!(fired, 1);
        assert!(got_none.load(Ordering::SeqCst));
        assert_eq!(core.pending_count(), 0);
    }

    #[test]
    fn unsolicited_response_is_dropped_not_an_error() {
        let mut core = RpcCore::new();
        let response = Response::success("never-requested", serde_json::json!(null));
        let bytes = encode_response(&response);
        let requests = core.parse_requests(&bytes, ParseMode::Multi);
        assert!(requests.is_empty());
        assert_eq!(core.pending_count(), 0);
    }

    #[test]
    fn fire_and_forget_request_is_never_tracked() {
        let mut core = RpcCore::new();
        let req = Request::new("upgrade", -1, serde_json::json!({}));
        core.send_request(&req, Some(Box::new(|_| panic!("must never be called"))));
        assert_eq!(core.pending_count(), 0);
    }

    #[test]
    fn clear_requests_drops_without_invoking_handlers() {
        let mut core = RpcCore::new();
        let req = Request::new("terminal", 30, serde_json::json!({}));
        core.send_request(&req, Some(Box::new(|_| panic!("must not fire"))));
        core.clear_requests();
        assert_eq!(core.pending_count(), 0);
    }

    #[test]
    fn requests_are_returned_in_order() {
        let mut core = RpcCore::new();
        let mut bytes = Vec::new();
        bytes.extend(frame_bytes(&Request::new("a", 30, serde_json::json!({}))));
        bytes.extend(frame_bytes(&Request::new("b", 30, serde_json::json!({}))));
        let reqs = core.parse_requests(&bytes, ParseMode::Multi);
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].name, "a");
        assert_eq!(reqs[1].name, "b");
    }
}
