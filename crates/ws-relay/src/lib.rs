//! WebSocket rendezvous relay.
//!
//! One provider (a phone that performs real HTTP requests) and any number of
//! consumers connect to the relay, which neither side could reach the other
//! without. The relay authenticates consumers against the provider's shared
//! secret and correlates `proxy_req` / `proxy_res` pairs by request id. It
//! never looks inside the proxied HTTP envelope.
//!
//! # Architecture
//!
//! ```text
//! Consumer A --WS--\                      /--WS-- Provider "P1"
//! Consumer B --WS---> [Router] <-> [Registry]
//!                        |
//!              [Liveness Monitor]
//! ```
//!
//! Every accepted socket becomes a [`Connection`] handle. Inbound frames are
//! parsed once into an [`Inbound`] and dispatched by the [`Router`], which
//! consults the [`Registry`] of providers and forwards the original text to
//! zero, one, or many other handles. The [`LivenessMonitor`] pings every
//! handle each interval and terminates the ones that stayed silent.

pub mod connection;
pub mod envelope;
pub mod error;
pub mod listener;
pub mod liveness;
pub mod registry;
pub mod router;

pub use connection::{Connection, ConnectionId, ConnectionTable, Outbound, Role, SendError};
pub use envelope::{EnvelopeError, Inbound, Registration, Reply, RequestId};
pub use error::RouteError;
pub use listener::{Relay, RelayConfig, DEFAULT_PORT, DEFAULT_SEND_QUEUE};
pub use liveness::{LivenessMonitor, SweepReport, DEFAULT_PING_INTERVAL};
pub use registry::{Registry, RegistryEntry};
pub use router::{Flow, ResponseRouting, Router};
