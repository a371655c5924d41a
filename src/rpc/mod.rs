//! RPC core (C2): request/response correlation over the frame codec, plus
//! the async reader pump that feeds it.

pub mod core;
pub mod reader;

pub use self::core::{ResponseHandler, RpcCore};
pub use reader::{spawn_reader_pump, ReadEvent};
