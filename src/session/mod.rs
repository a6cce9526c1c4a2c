//! Session management
//!
//! One logical terminal session per entry, independent of any single
//! WebSocket connection:
//! - Lifecycle state machine with guarded transitions
//! - Single-consumer command queue per session (strict ordering)
//! - Flow-control output buffer with watermark hysteresis
//! - Registry with ownership tracking and reconnect grace windows
//! - Shared reconnect backoff policy

pub mod backoff;
pub mod buffer;
pub mod registry;
pub mod session;
pub mod state;

pub use backoff::{ReconnectError, ReconnectPolicy};
pub use buffer::{FlowControlConfig, FlowSignal, OutputBuffer};
pub use registry::{RegistryError, SessionEntry, SessionRegistry, SessionStats};
pub use session::{spawn_session, SessionCommand, SessionContext, SessionParams};
pub use state::{SessionState, SessionStateMachine, StateError};
