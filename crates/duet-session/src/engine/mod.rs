//! The seam between negotiation logic and the media stack.
//!
//! [`TransportEngine`] is everything the negotiator needs from a peer
//! connection. Engines report asynchronous happenings (gathered candidates,
//! connectivity changes, arriving remote tracks) through an
//! [`EngineEventSink`], which feeds the same queue the negotiator drains, so
//! callbacks never touch session state directly.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use duet_proto::{IceCandidate, SessionDescription};

use crate::driver::SessionEvent;
use crate::error::EngineError;

pub mod scripted;
pub mod webrtc;

pub use scripted::{EngineCall, EngineGate, ScriptedEngine};
pub use self::webrtc::WebRtcEngine;

#[async_trait]
pub trait TransportEngine: Send + Sync {
    async fn create_local_media(&self) -> Result<LocalMedia, EngineError>;
    async fn generate_offer(&self) -> Result<SessionDescription, EngineError>;
    async fn generate_answer(&self) -> Result<SessionDescription, EngineError>;
    async fn set_local_description(&self, description: &SessionDescription)
        -> Result<(), EngineError>;
    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError>;
    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError>;
    async fn close(&self) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Opaque reference to a media track owned by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandle {
    pub kind: MediaKind,
    pub track_id: String,
    pub stream_id: String,
}

impl MediaHandle {
    pub fn new(kind: MediaKind, track_id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            kind,
            track_id: track_id.into(),
            stream_id: stream_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    pub video: MediaHandle,
    pub audio: MediaHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    LocalCandidate(IceCandidate),
    Connectivity(Connectivity),
    RemoteStream(MediaHandle),
}

/// Hands engine callbacks to the owning session's queue.
#[derive(Clone)]
pub struct EngineEventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EngineEventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    /// Returns `false` once the session has stopped listening; the event is
    /// dropped in that case.
    pub fn emit(&self, event: EngineEvent) -> bool {
        match self.tx.send(SessionEvent::Engine(event)) {
            Ok(()) => true,
            Err(err) => {
                tracing::trace!(
                    target: "duet::engine",
                    event = ?err.0,
                    "session gone; dropping engine event"
                );
                false
            }
        }
    }
}

impl fmt::Debug for EngineEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineEventSink")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}
