//! In-memory engine for tests and demos.
//!
//! Records every call, fails operations on request, can hold an operation
//! open until the test releases it, and simulates candidate gathering and
//! connectivity so two negotiators can be wired back to back.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use duet_proto::{IceCandidate, SessionDescription};

use super::{
    Connectivity, EngineEvent, EngineEventSink, LocalMedia, MediaHandle, MediaKind,
    TransportEngine,
};
use crate::error::{EngineError, EngineOp};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreateLocalMedia,
    GenerateOffer,
    GenerateAnswer,
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    AddRemoteCandidate(IceCandidate),
    Close,
}

impl EngineCall {
    pub fn op(&self) -> EngineOp {
        match self {
            EngineCall::CreateLocalMedia => EngineOp::CreateLocalMedia,
            EngineCall::GenerateOffer => EngineOp::GenerateOffer,
            EngineCall::GenerateAnswer => EngineOp::GenerateAnswer,
            EngineCall::SetLocalDescription(_) => EngineOp::SetLocalDescription,
            EngineCall::SetRemoteDescription(_) => EngineOp::SetRemoteDescription,
            EngineCall::AddRemoteCandidate(_) => EngineOp::AddRemoteCandidate,
            EngineCall::Close => EngineOp::Close,
        }
    }
}

/// Holds the next call of one operation open until [`EngineGate::release`].
#[derive(Clone, Default)]
pub struct EngineGate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl EngineGate {
    /// Resolves once the held operation has started.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Default)]
struct Script {
    calls: Vec<EngineCall>,
    failures: HashMap<EngineOp, VecDeque<String>>,
    gates: HashMap<EngineOp, EngineGate>,
    local_candidates: Vec<IceCandidate>,
    sink: Option<EngineEventSink>,
    auto_connect: bool,
    has_local: bool,
    has_remote: bool,
    applied_candidates: usize,
    connected: bool,
    offers: u64,
    answers: u64,
    closed: bool,
}

pub struct ScriptedEngine {
    label: String,
    script: Mutex<Script>,
}

impl ScriptedEngine {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            script: Mutex::new(Script::default()),
        }
    }

    pub fn with_sink(self, sink: EngineEventSink) -> Self {
        self.script.lock().sink = Some(sink);
        self
    }

    /// Candidates announced every time a local description is applied.
    pub fn with_local_candidates(self, candidates: Vec<IceCandidate>) -> Self {
        self.script.lock().local_candidates = candidates;
        self
    }

    /// Reports `Connected` once both descriptions are set and at least one
    /// remote candidate has been applied, followed by a remote video stream.
    pub fn with_auto_connect(self) -> Self {
        self.script.lock().auto_connect = true;
        self
    }

    pub fn fail_next(&self, op: EngineOp, reason: impl Into<String>) {
        self.script
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(reason.into());
    }

    pub fn hold(&self, op: EngineOp) -> EngineGate {
        let gate = EngineGate::default();
        self.script.lock().gates.insert(op, gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.script.lock().calls.clone()
    }

    pub fn call_count(&self, op: EngineOp) -> usize {
        self.script
            .lock()
            .calls
            .iter()
            .filter(|call| call.op() == op)
            .count()
    }

    /// Remote candidates in the order they reached the engine.
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.script
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                EngineCall::AddRemoteCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.script.lock().closed
    }

    /// Pushes an event as if the media stack raised it.
    pub fn report(&self, event: EngineEvent) -> bool {
        let sink = self.script.lock().sink.clone();
        match sink {
            Some(sink) => sink.emit(event),
            None => false,
        }
    }

    async fn enter(&self, call: EngineCall) -> Result<(), EngineError> {
        let op = call.op();
        let gate = {
            let mut script = self.script.lock();
            script.calls.push(call);
            script.gates.remove(&op)
        };
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let mut script = self.script.lock();
        if script.closed && op != EngineOp::Close {
            return Err(EngineError::Closed);
        }
        if let Some(reason) = script.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(EngineError::operation(op, reason));
        }
        Ok(())
    }

    fn emit_all(&self, events: Vec<EngineEvent>) {
        for event in events {
            self.report(event);
        }
    }

    fn connect_if_ready(&self) -> Vec<EngineEvent> {
        let mut script = self.script.lock();
        if !script.auto_connect
            || script.connected
            || !script.has_local
            || !script.has_remote
            || script.applied_candidates == 0
        {
            return Vec::new();
        }
        script.connected = true;
        vec![
            EngineEvent::Connectivity(Connectivity::Connected),
            EngineEvent::RemoteStream(MediaHandle::new(
                MediaKind::Video,
                "video0",
                format!("{}-remote", self.label),
            )),
        ]
    }
}

#[async_trait]
impl TransportEngine for ScriptedEngine {
    async fn create_local_media(&self) -> Result<LocalMedia, EngineError> {
        self.enter(EngineCall::CreateLocalMedia).await?;
        Ok(LocalMedia {
            video: MediaHandle::new(MediaKind::Video, "video0", "localStream"),
            audio: MediaHandle::new(MediaKind::Audio, "audio0", "localStream"),
        })
    }

    async fn generate_offer(&self) -> Result<SessionDescription, EngineError> {
        self.enter(EngineCall::GenerateOffer).await?;
        let round = {
            let mut script = self.script.lock();
            script.offers += 1;
            script.offers
        };
        Ok(SessionDescription::offer(format!(
            "v=0\r\ns={}\r\na=x-offer:{round}\r\n",
            self.label
        )))
    }

    async fn generate_answer(&self) -> Result<SessionDescription, EngineError> {
        self.enter(EngineCall::GenerateAnswer).await?;
        let round = {
            let mut script = self.script.lock();
            script.answers += 1;
            script.answers
        };
        Ok(SessionDescription::answer(format!(
            "v=0\r\ns={}\r\na=x-answer:{round}\r\n",
            self.label
        )))
    }

    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        self.enter(EngineCall::SetLocalDescription(description.clone()))
            .await?;
        let mut events: Vec<EngineEvent> = {
            let mut script = self.script.lock();
            script.has_local = true;
            script
                .local_candidates
                .iter()
                .cloned()
                .map(EngineEvent::LocalCandidate)
                .collect()
        };
        events.extend(self.connect_if_ready());
        self.emit_all(events);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        self.enter(EngineCall::SetRemoteDescription(description.clone()))
            .await?;
        self.script.lock().has_remote = true;
        let events = self.connect_if_ready();
        self.emit_all(events);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError> {
        self.enter(EngineCall::AddRemoteCandidate(candidate.clone()))
            .await?;
        self.script.lock().applied_candidates += 1;
        let events = self.connect_if_ready();
        self.emit_all(events);
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.enter(EngineCall::Close).await?;
        let already_closed = std::mem::replace(&mut self.script.lock().closed, true);
        if !already_closed {
            self.report(EngineEvent::Connectivity(Connectivity::Closed));
        }
        Ok(())
    }
}
