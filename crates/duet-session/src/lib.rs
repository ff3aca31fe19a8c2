//! Per-call negotiation for duet peers.
//!
//! A [`Negotiator`] owns one [`PeerConnectionSession`] and drives a
//! [`TransportEngine`] through offer/answer and trickled candidates. The
//! [`CallDriver`] actor feeds it one [`SessionEvent`] at a time from a single
//! queue that user intents, relay messages and engine callbacks all share.

pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod negotiator;
pub mod session;
pub mod signaling;

pub use config::CallConfig;
pub use driver::{call_channel, CallDriver, CallHandle, CallIntent, CallQueue, SessionEvent};
pub use engine::{
    Connectivity, EngineEvent, EngineEventSink, LocalMedia, MediaHandle, MediaKind,
    TransportEngine,
};
pub use error::{EngineError, EngineOp, SessionError};
pub use negotiator::{CallEvent, Negotiator};
pub use session::{ConnectionStatus, PeerConnectionSession, Role};
pub use signaling::{SignalingClient, SignalingError};

pub use duet_proto::{IceCandidate, SdpKind, SessionDescription, SignalingMessage};
