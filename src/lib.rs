//! scry: tool bridge and job daemon for virtual tabletop automation.
//!
//! A per-invocation wrapper (`scry serve`) relays a line-delimited JSON
//! tool protocol to a singleton backend (`scryd`), spawning it on demand.
//! The backend owns the one persistent connection to the tabletop
//! application and tracks asynchronous map-generation jobs in memory.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod jobs;
pub mod lock;
pub mod tools;

pub use error::{Result, ScryError};
