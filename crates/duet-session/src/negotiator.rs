use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use duet_proto::{IceCandidate, SessionDescription, SignalingMessage};

use crate::config::CallConfig;
use crate::driver::{CallIntent, SessionEvent};
use crate::engine::{Connectivity, EngineEvent, LocalMedia, MediaHandle, TransportEngine};
use crate::error::{EngineError, SessionError};
use crate::session::{ConnectionStatus, PeerConnectionSession, Role};

/// Lifecycle notifications for whoever presents the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    LocalStreamReady(LocalMedia),
    RemoteStreamReady(MediaHandle),
    ConnectionStateChanged(ConnectionStatus),
}

/// Offer/answer state machine for a single call.
///
/// Every operation takes `&mut self`, so the owner (normally a
/// [`CallDriver`](crate::CallDriver)) applies events strictly one after the
/// other. Rejected events leave the session untouched and come back as
/// [`SessionError::ProtocolSequence`]; events for a hung-up session come back
/// as [`SessionError::Closed`].
pub struct Negotiator {
    session: PeerConnectionSession,
    engine: Arc<dyn TransportEngine>,
    outbound: mpsc::UnboundedSender<SignalingMessage>,
    events: mpsc::UnboundedSender<CallEvent>,
    max_pending: usize,
}

impl Negotiator {
    pub fn new(
        engine: Arc<dyn TransportEngine>,
        outbound: mpsc::UnboundedSender<SignalingMessage>,
        events: mpsc::UnboundedSender<CallEvent>,
        config: &CallConfig,
    ) -> Self {
        Self {
            session: PeerConnectionSession::new(config.max_pending_candidates),
            engine,
            outbound,
            events,
            max_pending: config.max_pending_candidates,
        }
    }

    pub fn session(&self) -> &PeerConnectionSession {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    pub async fn handle(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        match event {
            SessionEvent::Intent(CallIntent::StartCall) => self.start_call().await,
            SessionEvent::Intent(CallIntent::EndCall) => self.end_call().await,
            SessionEvent::Intent(CallIntent::Renegotiate) => self.renegotiate().await,
            SessionEvent::Remote(message) => self.handle_remote(message).await,
            SessionEvent::Engine(event) => self.handle_engine(event),
        }
    }

    pub async fn handle_remote(&mut self, message: SignalingMessage) -> Result<(), SessionError> {
        match message {
            SignalingMessage::Offer { sdp } => self.receive_remote_offer(sdp).await,
            SignalingMessage::Answer { sdp } => self.receive_remote_answer(sdp).await,
            SignalingMessage::Candidate(candidate) => {
                self.receive_remote_candidate(candidate).await
            }
        }
    }

    pub fn handle_engine(&mut self, event: EngineEvent) -> Result<(), SessionError> {
        match event {
            EngineEvent::LocalCandidate(candidate) => self.on_local_candidate_generated(candidate),
            EngineEvent::Connectivity(state) => self.on_connectivity(state),
            EngineEvent::RemoteStream(handle) => self.on_remote_stream(handle),
        }
    }

    /// Creates local tracks and announces them.
    pub async fn prepare_media(&mut self) -> Result<LocalMedia, SessionError> {
        self.ensure_open()?;
        let media = self.engine.create_local_media().await?;
        info!(
            target: "duet::negotiation",
            video = %media.video.track_id,
            audio = %media.audio.track_id,
            "local media ready"
        );
        self.emit(CallEvent::LocalStreamReady(media.clone()));
        Ok(media)
    }

    pub async fn start_call(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.session.assign_role(Role::Caller)?;
        self.session.begin_round();
        info!(
            target: "duet::negotiation",
            round = self.session.round(),
            "starting call"
        );
        match self.send_offer().await {
            Ok(()) => {
                self.set_status(ConnectionStatus::Negotiating);
                Ok(())
            }
            Err(SessionError::Transport(err)) => Err(self.abort_round(err, false).await),
            Err(other) => Err(other),
        }
    }

    /// Applies a remote offer and answers it. The first offer makes this
    /// side the callee; an offer on an established call is a renegotiation
    /// and leaves the status alone.
    pub async fn receive_remote_offer(&mut self, sdp: String) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.session.offer_outstanding() {
            return Err(SessionError::sequence(
                "remote offer while our own offer is outstanding",
            ));
        }
        let established = self.session.status().is_established();
        if self.session.role() == Role::Idle {
            self.session.assign_role(Role::Callee)?;
        }
        self.session.begin_round();
        info!(
            target: "duet::negotiation",
            round = self.session.round(),
            renegotiation = established,
            "applying remote offer"
        );
        match self.answer_offer(SessionDescription::offer(sdp)).await {
            Ok(()) => {
                if !established {
                    self.set_status(ConnectionStatus::Negotiating);
                }
                Ok(())
            }
            Err(SessionError::Transport(err)) => Err(self.abort_round(err, established).await),
            Err(other) => Err(other),
        }
    }

    /// Valid only while our offer for the current round is outstanding.
    pub async fn receive_remote_answer(&mut self, sdp: String) -> Result<(), SessionError> {
        self.ensure_open()?;
        if !self.session.offer_outstanding() || self.session.remote_description().is_some() {
            return Err(SessionError::sequence(
                "remote answer without an outstanding offer",
            ));
        }
        let established = self.session.status().is_established();
        let answer = SessionDescription::answer(sdp);
        if let Err(err) = self.engine.set_remote_description(&answer).await {
            return Err(self.abort_round(err, established).await);
        }
        self.session.set_remote_description(answer)?;
        self.session.set_offer_outstanding(false);
        debug!(
            target: "duet::negotiation",
            round = self.session.round(),
            pending = self.session.pending_len(),
            "remote answer applied"
        );
        self.flush_pending().await;
        Ok(())
    }

    pub async fn receive_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.session.remote_description().is_none() {
            if !self.session.buffer_candidate(candidate) {
                return Err(SessionError::sequence(format!(
                    "pending candidate buffer full ({}); candidate dropped",
                    self.max_pending
                )));
            }
            debug!(
                target: "duet::negotiation",
                pending = self.session.pending_len(),
                "buffered remote candidate"
            );
            return Ok(());
        }
        self.flush_pending().await;
        self.engine
            .add_remote_candidate(&candidate)
            .await
            .map_err(SessionError::from)
    }

    pub fn on_local_candidate_generated(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.send(SignalingMessage::Candidate(candidate));
        Ok(())
    }

    pub fn on_connectivity(&mut self, state: Connectivity) -> Result<(), SessionError> {
        self.ensure_open()?;
        match state {
            Connectivity::Connected => self.on_transport_connected(),
            Connectivity::Disconnected | Connectivity::Failed | Connectivity::Closed => {
                self.on_transport_disconnected()
            }
            Connectivity::New | Connectivity::Connecting => {
                debug!(target: "duet::negotiation", ?state, "transport progressing");
                Ok(())
            }
        }
    }

    pub fn on_transport_connected(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.session.status() == ConnectionStatus::New {
            return Err(SessionError::sequence(
                "transport connected before negotiation started",
            ));
        }
        self.set_status(ConnectionStatus::Connected);
        Ok(())
    }

    /// Loss never ends the call; the transport may still recover.
    pub fn on_transport_disconnected(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.session.status() == ConnectionStatus::Connected {
            warn!(
                target: "duet::negotiation",
                error = %SessionError::TransportLost,
                "call degraded"
            );
            self.set_status(ConnectionStatus::Disconnected);
        } else {
            debug!(
                target: "duet::negotiation",
                status = %self.session.status(),
                "transport loss before connection; ignoring"
            );
        }
        Ok(())
    }

    pub fn on_remote_stream(&mut self, handle: MediaHandle) -> Result<(), SessionError> {
        self.ensure_open()?;
        info!(
            target: "duet::negotiation",
            kind = %handle.kind,
            stream = %handle.stream_id,
            "remote stream arrived"
        );
        self.emit(CallEvent::RemoteStreamReady(handle));
        Ok(())
    }

    /// Hangs up. Idempotent.
    pub async fn end_call(&mut self) -> Result<(), SessionError> {
        if self.session.is_closed() {
            debug!(target: "duet::negotiation", "end_call on closed session");
            return Ok(());
        }
        info!(
            target: "duet::negotiation",
            role = ?self.session.role(),
            status = %self.session.status(),
            "ending call"
        );
        self.teardown().await;
        Ok(())
    }

    /// Starts a new offer/answer round from this side on an established call.
    pub async fn renegotiate(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        if !self.session.status().is_established() {
            return Err(SessionError::sequence(
                "renegotiation requires an established call",
            ));
        }
        if self.session.offer_outstanding() {
            return Err(SessionError::sequence("an offer is already outstanding"));
        }
        self.session.begin_round();
        info!(
            target: "duet::negotiation",
            round = self.session.round(),
            "renegotiating"
        );
        match self.send_offer().await {
            Ok(()) => Ok(()),
            Err(SessionError::Transport(err)) => Err(self.abort_round(err, true).await),
            Err(other) => Err(other),
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.session.is_closed() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    async fn send_offer(&mut self) -> Result<(), SessionError> {
        let offer = self.engine.generate_offer().await?;
        self.engine.set_local_description(&offer).await?;
        self.session.set_local_description(offer.clone())?;
        self.session.set_offer_outstanding(true);
        self.send(offer.into_message());
        Ok(())
    }

    async fn answer_offer(&mut self, offer: SessionDescription) -> Result<(), SessionError> {
        self.engine.set_remote_description(&offer).await?;
        self.session.set_remote_description(offer)?;
        self.flush_pending().await;
        let answer = self.engine.generate_answer().await?;
        self.engine.set_local_description(&answer).await?;
        self.session.set_local_description(answer.clone())?;
        self.send(answer.into_message());
        Ok(())
    }

    async fn flush_pending(&mut self) {
        let pending = self.session.take_pending();
        if pending.is_empty() {
            return;
        }
        debug!(
            target: "duet::negotiation",
            count = pending.len(),
            "applying buffered candidates"
        );
        for candidate in pending {
            if let Err(err) = self.engine.add_remote_candidate(&candidate).await {
                warn!(
                    target: "duet::negotiation",
                    error = %err,
                    candidate = %candidate.candidate,
                    "dropping buffered candidate"
                );
            }
        }
    }

    /// A failed round ends a call that never connected; an established call
    /// only degrades.
    async fn abort_round(&mut self, err: EngineError, established: bool) -> SessionError {
        if established {
            warn!(
                target: "duet::negotiation",
                round = self.session.round(),
                error = %err,
                "renegotiation failed"
            );
            self.session.set_offer_outstanding(false);
            self.set_status(ConnectionStatus::Disconnected);
        } else {
            error!(
                target: "duet::negotiation",
                round = self.session.round(),
                error = %err,
                "negotiation failed; closing session"
            );
            self.teardown().await;
        }
        SessionError::Transport(err)
    }

    async fn teardown(&mut self) {
        if let Err(err) = self.engine.close().await {
            warn!(target: "duet::negotiation", error = %err, "engine close failed");
        }
        let discarded = self.session.pending_len();
        if discarded > 0 {
            debug!(
                target: "duet::negotiation",
                discarded, "dropping buffered candidates"
            );
        }
        self.session = PeerConnectionSession::closed(self.max_pending);
        info!(target: "duet::negotiation", status = %ConnectionStatus::Closed, "connection status changed");
        self.emit(CallEvent::ConnectionStateChanged(ConnectionStatus::Closed));
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.session.set_status(status) {
            info!(target: "duet::negotiation", %status, "connection status changed");
            self.emit(CallEvent::ConnectionStateChanged(status));
        }
    }

    fn send(&self, message: SignalingMessage) {
        let kind = message.kind();
        if self.outbound.send(message).is_err() {
            warn!(
                target: "duet::negotiation",
                %kind,
                "signaling channel closed; message dropped"
            );
        }
    }

    fn emit(&self, event: CallEvent) {
        if self.events.send(event).is_err() {
            debug!(target: "duet::negotiation", "no listener for call events");
        }
    }
}
