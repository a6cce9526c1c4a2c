//! Termgate - terminal session gateway
//!
//! Multiplexes interactive terminal sessions (SSH, local shell, container
//! exec) over WebSocket connections with a JSON message protocol, session
//! lifecycle management, flow control, and reconnection semantics.

// Use mimalloc as the global allocator for better performance with
// high-frequency small allocations (WebSocket frames, output buffer chunks)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod gateway;
pub mod protocol;
pub mod services;
pub mod session;
pub mod transport;

pub use config::EngineConfig;
pub use gateway::{Gateway, GatewayError, Services};
