//! Frame codec (C1): `\r\n`-delimited JSON framing over a byte stream.
//!
//! Adapted from the length-prefixed binary decoders in the teacher's
//! `broker::protocol::BrokerFrameDecoder` and `socket::framing::FrameDecoder`
//! — same incremental "feed bytes, drain complete frames, keep the
//! trailing partial" shape, but split on a literal separator instead of a
//! length prefix, and with no upper bound on frame size (the design places
//! none on JSON frames, unlike the 16MB cap those binary frames carry).

use super::message::{Request, Response};

/// One decoded frame: a Request or a Response, disambiguated by the
/// presence of a non-empty `name` field (§4.1).
#[derive(Debug, Clone)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

/// How many frames a single `parse` call should consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Consume every complete frame currently in the buffer.
    Multi,
    /// Consume exactly one frame (valid or malformed) and leave the
    /// remainder of the buffer untouched for a later call. Used by the
    /// registration gate so a Logcat connection's post-register bytes are
    /// not swallowed before the fan-out task takes over (§4.1, §4.4).
    Single,
}

/// Incremental `\r\n`-delimited JSON frame decoder.
///
/// Bytes accumulate in a rolling buffer; `parse` splits on the literal
/// separator, parses each complete segment as JSON, and retains any
/// trailing partial segment for the next call. Malformed segments are
/// logged and dropped — they never desynchronize the stream, because the
/// separator itself is never inspected as JSON.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes currently buffered (including any partial frame).
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Drain and return whatever raw bytes are currently buffered, without
    /// attempting to parse them. Used by the registration gate to hand a
    /// Logcat connection's post-register bytes to the fan-out task verbatim
    /// (§4.1 "pass the rest of the buffer verbatim to the log fan-out").
    pub fn take_residual(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Feed `chunk` into the rolling buffer and parse according to `mode`.
    pub fn feed(&mut self, chunk: &[u8], mode: ParseMode) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        match mode {
            ParseMode::Multi => self.drain_all(),
            ParseMode::Single => self.drain_one().into_iter().collect(),
        }
    }

    /// Drains every complete segment currently buffered, skipping empty and
    /// malformed segments instead of stopping at the first one — a
    /// malformed or empty segment consumes its bytes but never stops the
    /// scan, so later complete frames in the same `feed` call still surface
    /// (§4.1/§8 invariant 3: malformed frames must not desynchronize the
    /// stream).
    fn drain_all(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            match self.drain_one_outcome() {
                DrainOutcome::NoSeparator => break,
                DrainOutcome::Frame(frame) => frames.push(frame),
                DrainOutcome::Empty | DrainOutcome::Malformed => {}
            }
        }
        frames
    }

    /// Consume exactly one complete segment from the buffer, if present.
    /// Returns `None` when no separator has arrived yet, when the segment
    /// consumed was empty, or when it was malformed (logged and dropped) —
    /// in all three cases the buffer still advances past whatever was
    /// consumed except the "no separator" case, which leaves it untouched.
    fn drain_one(&mut self) -> Option<Frame> {
        match self.drain_one_outcome() {
            DrainOutcome::Frame(frame) => Some(frame),
            DrainOutcome::NoSeparator | DrainOutcome::Empty | DrainOutcome::Malformed => None,
        }
    }

    /// Consumes at most one complete segment and reports what happened to
    /// it, so callers that need to keep scanning after a dropped segment
    /// (`drain_all`) can be told apart from callers that stop regardless
    /// (`drain_one`).
    fn drain_one_outcome(&mut self) -> DrainOutcome {
        let Some(sep_pos) = find_separator(&self.buf) else {
            return DrainOutcome::NoSeparator;
        };
        let segment: Vec<u8> = self.buf.drain(..sep_pos + crate::constants::FRAME_SEPARATOR.len()).collect();
        let json_bytes = &segment[..sep_pos];
        if json_bytes.is_empty() {
            return DrainOutcome::Empty;
        }
        match parse_segment(json_bytes) {
            Ok(frame) => DrainOutcome::Frame(frame),
            Err(e) => {
                log::warn!(
                    "dropping malformed frame ({} bytes): {e}",
                    json_bytes.len()
                );
                DrainOutcome::Malformed
            }
        }
    }
}

/// Result of consuming at most one segment from the buffer.
enum DrainOutcome {
    /// No separator found yet; buffer left untouched.
    NoSeparator,
    /// A segment was consumed but it was empty (two separators in a row).
    Empty,
    /// A segment was consumed but failed to parse as a frame.
    Malformed,
    /// A segment was consumed and decoded into a frame.
    Frame(Frame),
}

fn find_separator(buf: &[u8]) -> Option<usize> {
    let sep = crate::constants::FRAME_SEPARATOR;
    buf.windows(sep.len()).position(|w| w == sep)
}

fn parse_segment(json_bytes: &[u8]) -> Result<Frame, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_slice(json_bytes)?;
    let is_request = value
        .get("name")
        .and_then(|v| v.as_str())
        .is_some_and(|s| !s.is_empty());
    if is_request {
        Ok(Frame::Request(serde_json::from_value(value)?))
    } else {
        Ok(Frame::Response(serde_json::from_value(value)?))
    }
}

/// Marshal a `Request` into its wire form, including the trailing
/// separator.
pub fn encode_request(req: &Request) -> Vec<u8> {
    encode(req)
}

/// Marshal a `Response` into its wire form, including the trailing
/// separator.
pub fn encode_response(res: &Response) -> Vec<u8> {
    encode(res)
}

fn encode<T: serde::Serialize>(value: &T) -> Vec<u8> {
    let mut out = serde_json::to_vec(value).expect("frame payload must be serializable");
    out.extend_from_slice(crate::constants::FRAME_SEPARATOR);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{Request, Response};

    fn req_bytes(rid: &str, name: &str) -> Vec<u8> {
        encode_request(&Request::new(name, 30, serde_json::json!({})).with_rid(rid))
    }

    impl Request {
        fn with_rid(mut self, rid: &str) -> Self {
            self.rid = rid.to_string();
            self
        }
    }

    #[test]
    fn single_complete_frame_multi_mode() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&req_bytes("r1", "ping"), ParseMode::Multi);
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], Frame::Request(r) if r.rid == "r1"));
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn partial_frame_is_retained_across_calls() {
        let mut decoder = FrameDecoder::new();
        let bytes = req_bytes("r1", "ping");
        let (first, second) = bytes.split_at(bytes.len() / 2);
        assert!(decoder.feed(first, ParseMode::Multi).is_empty());
        let frames = decoder.feed(second, ParseMode::Multi);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn byte_at_a_time_reassembly() {
        let mut decoder = FrameDecoder::new();
        let bytes = req_bytes("r1", "ping");
        let mut out = Vec::new();
        for b in bytes {
            out.extend(decoder.feed(&[b], ParseMode::Multi));
        }
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn multi_frame_chunk_yields_all_frames_in_order() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = req_bytes("r1", "ping");
        bytes.extend(req_bytes("r2", "register"));
        let frames = decoder.feed(&bytes, ParseMode::Multi);
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], Frame::Request(r) if r.rid == "r1"));
        assert!(matches!(&frames[1], Frame::Request(r) if r.rid == "r2"));
    }

    #[test]
    fn malformed_frame_is_dropped_without_desync() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = b"not json at all".to_vec();
        bytes.extend_from_slice(crate::constants::FRAME_SEPARATOR);
        bytes.extend(req_bytes("r1", "ping"));
        let frames = decoder.feed(&bytes, ParseMode::Multi);
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], Frame::Request(r) if r.rid == "r1"));
    }

    #[test]
    fn response_frame_has_no_name() {
        let mut decoder = FrameDecoder::new();
        let bytes = encode_response(&Response::success("r1", serde_json::json!(null)));
        let frames = decoder.feed(&bytes, ParseMode::Multi);
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], Frame::Response(r) if r.rid == "r1"));
    }

    #[test]
    fn single_mode_consumes_exactly_one_frame_and_preserves_residual() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = req_bytes("r1", "register");
        let residual = b"some raw logcat bytes that are not json".to_vec();
        bytes.extend_from_slice(&residual);

        let frames = decoder.feed(&bytes, ParseMode::Single);
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], Frame::Request(r) if r.rid == "r1"));
        // Residual must be untouched, not truncated (§9 design note b).
        assert_eq!(decoder.buffered_len(), residual.len());
    }

    #[test]
    fn single_mode_without_separator_leaves_buffer_untouched() {
        let mut decoder = FrameDecoder::new();
        let partial = br#"{"rid":"r1","name":"ping""#;
        let frames = decoder.feed(partial, ParseMode::Single);
        assert!(frames.is_empty());
        assert_eq!(decoder.buffered_len(), partial.len());
    }

    #[test]
    fn stream_safety_arbitrary_chunking_preserves_order() {
        let mut whole = Vec::new();
        let mut expected_rids = Vec::new();
        for i in 0..20 {
            let rid = format!("r{i}");
            whole.extend(req_bytes(&rid, "ping"));
            expected_rids.push(rid);
        }

        // Partition into arbitrary-sized chunks.
        let chunk_sizes = [3usize, 7, 1, 40, 2, 11, 500];
        let mut decoder = FrameDecoder::new();
        let mut got_rids = Vec::new();
        let mut offset = 0;
        let mut i = 0;
        while offset < whole.len() {
            let size = chunk_sizes[i % chunk_sizes.len()].min(whole.len() - offset);
            let chunk = &whole[offset..offset + size];
            for frame in decoder.feed(chunk, ParseMode::Multi) {
                if let Frame::Request(r) = frame {
                    got_rids.push(r.rid);
                }
            }
            offset += size;
            i += 1;
        }
        assert_eq!(got_rids, expected_rids);
    }
}
