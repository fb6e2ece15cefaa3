//! chedir: workspace event-bus client.
//!
//! Turns a workspace server's asynchronous channel notifications into
//! completion handles that request/response call sites can wait on.
//!
//! - [`transport`]: one duplex text connection per session (WebSocket or in-memory)
//! - [`bus`]: the per-session message bus, its registry and completion adapters
//! - [`workspace`]: REST calls gated on bus events
//! - [`readiness`]: bounded polling before any channel exists

pub mod bus;
pub mod config;
pub mod error;
pub mod instance;
pub mod logger;
pub mod readiness;
pub mod transport;
pub mod workspace;

pub use error::AppError;
