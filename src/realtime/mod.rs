//! Event Gateway
//!
//! Real-time transport over WebSocket:
//! - `protocol`: client/server frame format
//! - `hub`: topic fan-out, optionally relayed through Redis
//! - `notify`: what each engine outcome broadcasts, and to whom
//! - `session`: per-connection action dispatch
//! - `gateway`: HTTP upgrade and socket loop

mod gateway;
mod hub;
mod notify;
pub mod protocol;
mod session;

pub use gateway::ws_handler;
pub use hub::{Envelope, Hub, Topic};
pub use notify::{LifecycleChange, Notification, Notifier};
pub use session::Session;

/// Process-local identifier of one real-time connection
pub type ConnectionId = u64;
