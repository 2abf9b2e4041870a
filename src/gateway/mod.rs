//! Gateway to the tabletop application.
//!
//! The backend owns exactly one long-lived WebSocket connection to the
//! tabletop module. [`message`] defines the JSON text-frame envelopes;
//! [`connector`] owns the listener, the single authoritative peer, and the
//! correlated query/response machinery; [`events`] wires pushed job events
//! and scene-creation callbacks to the job queue.

pub mod connector;
pub mod events;
pub mod message;

pub use connector::{Connector, EventHandler, GatewayState};
pub use events::{JobEventRouter, SceneCompletionSink};
pub use message::Envelope;
