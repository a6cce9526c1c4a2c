//! WebSocket gateway
//!
//! Listener, per-connection read/write loops, handshake, rate limiting, and
//! keepalive supervision.

mod connection;
mod server;

pub use server::{Gateway, GatewayError, Services};
