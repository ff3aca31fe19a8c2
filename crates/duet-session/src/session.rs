use std::collections::VecDeque;
use std::fmt;

use duet_proto::{IceCandidate, SessionDescription};

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Idle,
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    New,
    Negotiating,
    Connected,
    Disconnected,
    Closed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::New => "new",
            ConnectionStatus::Negotiating => "negotiating",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Closed => "closed",
        }
    }

    /// The transport came up at least once and the call has not ended.
    pub fn is_established(&self) -> bool {
        matches!(self, ConnectionStatus::Connected | ConnectionStatus::Disconnected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negotiation state of one call.
///
/// Descriptions are tracked per round: each offer/answer exchange (the first
/// one and every renegotiation) starts from empty descriptions and sets each
/// side at most once. Remote candidates that arrive while the current round
/// has no remote description wait in `pending`, in arrival order.
#[derive(Debug, Clone)]
pub struct PeerConnectionSession {
    role: Role,
    status: ConnectionStatus,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    offer_outstanding: bool,
    pending: VecDeque<IceCandidate>,
    max_pending: usize,
    round: u64,
}

impl PeerConnectionSession {
    pub fn new(max_pending: usize) -> Self {
        Self {
            role: Role::Idle,
            status: ConnectionStatus::New,
            local_description: None,
            remote_description: None,
            offer_outstanding: false,
            pending: VecDeque::new(),
            max_pending,
            round: 0,
        }
    }

    /// The terminal state left behind by a hang-up.
    pub fn closed(max_pending: usize) -> Self {
        Self {
            status: ConnectionStatus::Closed,
            ..Self::new(max_pending)
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_closed(&self) -> bool {
        self.status == ConnectionStatus::Closed
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    /// A local offer is out and its answer has not arrived yet.
    pub fn offer_outstanding(&self) -> bool {
        self.offer_outstanding
    }

    pub fn pending_candidates(&self) -> impl Iterator<Item = &IceCandidate> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub(crate) fn assign_role(&mut self, role: Role) -> Result<(), SessionError> {
        if self.role != Role::Idle || self.status != ConnectionStatus::New {
            return Err(SessionError::sequence(format!(
                "role already decided ({:?}, {})",
                self.role, self.status
            )));
        }
        self.role = role;
        Ok(())
    }

    /// Returns whether the status actually changed.
    pub(crate) fn set_status(&mut self, status: ConnectionStatus) -> bool {
        if self.status == status {
            return false;
        }
        self.status = status;
        true
    }

    pub(crate) fn begin_round(&mut self) {
        self.round += 1;
        self.local_description = None;
        self.remote_description = None;
        self.offer_outstanding = false;
    }

    pub(crate) fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), SessionError> {
        if self.local_description.is_some() {
            return Err(SessionError::sequence(format!(
                "local description already set in round {}",
                self.round
            )));
        }
        self.local_description = Some(description);
        Ok(())
    }

    pub(crate) fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), SessionError> {
        if self.remote_description.is_some() {
            return Err(SessionError::sequence(format!(
                "remote description already set in round {}",
                self.round
            )));
        }
        self.remote_description = Some(description);
        Ok(())
    }

    pub(crate) fn set_offer_outstanding(&mut self, outstanding: bool) {
        self.offer_outstanding = outstanding;
    }

    /// Returns `false` when the buffer is full and the candidate was dropped.
    pub(crate) fn buffer_candidate(&mut self, candidate: IceCandidate) -> bool {
        if self.pending.len() >= self.max_pending {
            return false;
        }
        self.pending.push_back(candidate);
        true
    }

    pub(crate) fn take_pending(&mut self) -> VecDeque<IceCandidate> {
        std::mem::take(&mut self.pending)
    }
}
