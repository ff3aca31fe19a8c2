//! Session actor.
//!
//! Intents, relay messages and engine callbacks all land on one unbounded
//! queue. The driver applies them to its [`Negotiator`] one at a time; while
//! an engine operation is awaited it keeps draining the queue into a backlog
//! so arrival order is preserved, except that a hang-up cancels the
//! operation outright.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use duet_proto::SignalingMessage;

use crate::engine::{EngineEvent, EngineEventSink};
use crate::error::SessionError;
use crate::negotiator::Negotiator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallIntent {
    StartCall,
    EndCall,
    Renegotiate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Intent(CallIntent),
    Remote(SignalingMessage),
    Engine(EngineEvent),
}

/// Cheap, cloneable entry point into a running session.
#[derive(Clone, Debug)]
pub struct CallHandle {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

pub struct CallQueue {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

pub fn call_channel() -> (CallHandle, CallQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CallHandle { tx }, CallQueue { rx })
}

impl CallHandle {
    pub fn start_call(&self) -> Result<(), SessionError> {
        self.submit(SessionEvent::Intent(CallIntent::StartCall))
    }

    pub fn end_call(&self) -> Result<(), SessionError> {
        self.submit(SessionEvent::Intent(CallIntent::EndCall))
    }

    pub fn renegotiate(&self) -> Result<(), SessionError> {
        self.submit(SessionEvent::Intent(CallIntent::Renegotiate))
    }

    /// Queues a message received from the relay.
    pub fn deliver(&self, message: SignalingMessage) -> Result<(), SessionError> {
        self.submit(SessionEvent::Remote(message))
    }

    /// Fails with [`SessionError::Closed`] once the driver has stopped.
    pub fn submit(&self, event: SessionEvent) -> Result<(), SessionError> {
        self.tx.send(event).map_err(|_| SessionError::Closed)
    }

    /// Sink for the engine bound to this session.
    pub fn engine_events(&self) -> EngineEventSink {
        EngineEventSink::new(self.tx.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct CallDriver {
    negotiator: Negotiator,
    queue: CallQueue,
    backlog: VecDeque<SessionEvent>,
    queue_open: bool,
}

impl CallDriver {
    pub fn new(negotiator: Negotiator, queue: CallQueue) -> Self {
        Self {
            negotiator,
            queue,
            backlog: VecDeque::new(),
            queue_open: true,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        while let Some(event) = self.next_event().await {
            self.dispatch(event).await;
            if self.negotiator.is_closed() {
                let dropped = self.backlog.len();
                info!(
                    target: "duet::driver",
                    dropped, "session closed; driver stopping"
                );
                break;
            }
        }
        debug!(target: "duet::driver", "driver exited");
    }

    async fn next_event(&mut self) -> Option<SessionEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        if !self.queue_open {
            return None;
        }
        self.queue.rx.recv().await
    }

    async fn dispatch(&mut self, event: SessionEvent) {
        trace!(target: "duet::driver", ?event, "dispatching");
        let mut hang_up = false;
        let outcome = {
            let work = self.negotiator.handle(event);
            tokio::pin!(work);
            loop {
                tokio::select! {
                    biased;
                    outcome = &mut work => break Some(outcome),
                    next = self.queue.rx.recv(), if self.queue_open => match next {
                        Some(SessionEvent::Intent(CallIntent::EndCall)) => {
                            hang_up = true;
                            break None;
                        }
                        Some(other) => self.backlog.push_back(other),
                        None => self.queue_open = false,
                    },
                }
            }
        };

        match outcome {
            Some(result) => log_outcome(result),
            None => debug!(
                target: "duet::driver",
                "in-flight operation cancelled by hang-up"
            ),
        }
        if hang_up {
            log_outcome(self.negotiator.end_call().await);
        }
    }
}

fn log_outcome(result: Result<(), SessionError>) {
    match result {
        Ok(()) => {}
        Err(SessionError::Closed) => {
            debug!(target: "duet::driver", "event ignored; session closed");
        }
        Err(err @ SessionError::ProtocolSequence(_)) => {
            warn!(target: "duet::driver", error = %err, "event discarded");
        }
        Err(err) => {
            warn!(target: "duet::driver", error = %err, "event failed");
        }
    }
}
