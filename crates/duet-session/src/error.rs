use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    CreateLocalMedia,
    GenerateOffer,
    GenerateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddRemoteCandidate,
    Close,
}

impl EngineOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineOp::CreateLocalMedia => "create_local_media",
            EngineOp::GenerateOffer => "generate_offer",
            EngineOp::GenerateAnswer => "generate_answer",
            EngineOp::SetLocalDescription => "set_local_description",
            EngineOp::SetRemoteDescription => "set_remote_description",
            EngineOp::AddRemoteCandidate => "add_remote_candidate",
            EngineOp::Close => "close",
        }
    }
}

impl fmt::Display for EngineOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine setup failed: {0}")]
    Setup(String),
    #[error("{op} failed: {reason}")]
    Operation { op: EngineOp, reason: String },
    #[error("engine already closed")]
    Closed,
}

impl EngineError {
    pub fn operation(op: EngineOp, reason: impl fmt::Display) -> Self {
        EngineError::Operation {
            op,
            reason: reason.to_string(),
        }
    }
}

/// Outcome of feeding one event to the negotiator. None of these are fatal
/// to the process; the driver logs them and moves on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The event is not valid in the session's current state. Discarded.
    #[error("protocol sequence error: {0}")]
    ProtocolSequence(String),
    #[error("transport error: {0}")]
    Transport(#[from] EngineError),
    #[error("transport lost")]
    TransportLost,
    /// The session already hung up; the event was ignored.
    #[error("session closed")]
    Closed,
}

impl SessionError {
    pub(crate) fn sequence(reason: impl Into<String>) -> Self {
        SessionError::ProtocolSequence(reason.into())
    }
}
