//! Control channel between wrapper processes and the backend.
//!
//! - [`protocol`]: request/response types and newline-delimited JSON framing
//! - [`server`]: the backend's loopback listener and request dispatch
//! - [`client`]: `BridgeClient` for wrapper-to-backend communication
//! - [`auto_start`]: spawn-and-reconnect logic so wrappers never manage
//!   backend lifecycle by hand

pub mod auto_start;
pub mod client;
pub mod protocol;
pub mod server;

pub use auto_start::{ensure_backend, is_backend_running};
pub use client::BridgeClient;
pub use protocol::{Request, Response};
pub use server::{ControlContext, ControlServer};
