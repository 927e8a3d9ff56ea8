//! WebSocket Session Management
//!
//! - `protocol`: the JSON message format between client and server.
//! - `session`: the connection lifecycle, from handshake to teardown.
//! - `output`: pipeline stages that deliver frames to the client.

pub mod output;
pub mod protocol;
pub mod session;

pub use session::ws_handler;
