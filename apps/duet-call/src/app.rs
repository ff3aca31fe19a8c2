use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use duet_session::engine::WebRtcEngine;
use duet_session::{
    call_channel, CallConfig, CallDriver, CallEvent, CallHandle, ConnectionStatus, Negotiator,
    SignalingClient,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Call,
    HangUp,
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    match line.trim().to_ascii_lowercase().as_str() {
        "call" | "c" => Some(Command::Call),
        "hangup" | "hang-up" | "end" | "h" => Some(Command::HangUp),
        "quit" | "exit" | "q" => Some(Command::Quit),
        _ => None,
    }
}

/// Wires a fresh session to the shared relay connection.
async fn new_call(
    config: &CallConfig,
    signaling: &SignalingClient,
    events: mpsc::UnboundedSender<CallEvent>,
) -> Result<CallHandle> {
    let (handle, queue) = call_channel();
    let engine = Arc::new(
        WebRtcEngine::new(config, handle.engine_events())
            .await
            .context("failed to create peer connection")?,
    );
    let mut negotiator = Negotiator::new(engine, signaling.outbound(), events, config);
    negotiator
        .prepare_media()
        .await
        .context("failed to set up local media")?;
    CallDriver::new(negotiator, queue).spawn();
    Ok(handle)
}

pub async fn run(relay_url: &str, config: CallConfig, auto_call: bool) -> Result<()> {
    let (signaling, mut inbound) = SignalingClient::connect(relay_url)
        .await
        .with_context(|| format!("failed to reach relay at {relay_url}"))?;

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut call = new_call(&config, &signaling, events_tx.clone()).await?;
    let mut status = ConnectionStatus::New;
    if auto_call {
        call.start_call().context("session stopped before the call started")?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("ready; type `call`, `hangup` or `quit`");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match parse_command(&line) {
                    Some(Command::Call) => {
                        if status != ConnectionStatus::New {
                            warn!(%status, "already in a call");
                        } else if call.start_call().is_err() {
                            warn!("session is closing; try again");
                        }
                    }
                    Some(Command::HangUp) => {
                        if call.end_call().is_err() {
                            debug!("session already closed");
                        }
                    }
                    Some(Command::Quit) => break,
                    None if line.trim().is_empty() => {}
                    None => warn!(input = %line.trim(), "unknown command"),
                }
            }
            message = inbound.recv() => {
                let Some(message) = message else {
                    warn!("relay connection lost");
                    break;
                };
                if call.deliver(message).is_err() {
                    debug!("no active session; dropping relay message");
                }
            }
            Some(event) = events.recv() => match event {
                CallEvent::LocalStreamReady(media) => {
                    info!(video = %media.video.track_id, audio = %media.audio.track_id, "local stream ready");
                }
                CallEvent::RemoteStreamReady(handle) => {
                    info!(kind = %handle.kind, stream = %handle.stream_id, "remote stream ready");
                }
                CallEvent::ConnectionStateChanged(next) => {
                    info!(status = %next, "call status");
                    status = next;
                    if next == ConnectionStatus::Closed {
                        call = new_call(&config, &signaling, events_tx.clone()).await?;
                        status = ConnectionStatus::New;
                    }
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if call.end_call().is_ok() {
        // Give the driver a moment to close the peer connection.
        tokio::task::yield_now().await;
    }
    info!("bye");
    Ok(())
}
