//! Broadcast relay for duet signaling.
//!
//! Every text or binary frame a client sends is forwarded unchanged to every
//! other connected client. The relay knows nothing about offers, answers or
//! candidates.

pub mod config;
pub mod registry;
pub mod server;
pub mod telemetry;

pub use config::{Cli, RelayConfig};
pub use registry::{BroadcastOutcome, RelayClientHandle, RelayRegistry, RelayStats};
pub use server::{RelayError, RelayServer};
