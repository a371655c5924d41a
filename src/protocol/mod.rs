//! Frame codec and wire types (C1, §4.1, §3.3).

pub mod frame;
pub mod message;

pub use frame::{encode_request, encode_response, Frame, FrameDecoder, ParseMode};
pub use message::{LogFormat, RegisterPayload, Request, Response, SessionMode};
