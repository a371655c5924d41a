//! Coordinator-side modules: the connection server (C4), registries (C5),
//! and the browser bridge (C6).

pub mod bridge;
pub mod conn_server;
pub mod registry;
pub mod ring_buffer;

pub use bridge::{router, AppState};
pub use registry::Registry;
