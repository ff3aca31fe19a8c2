//! WebSocket connection to the relay.
//!
//! Outbound [`SignalingMessage`]s are encoded as text frames. Inbound text and
//! binary frames are decoded and handed to the application; frames that do
//! not decode are logged and dropped.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use duet_proto::{decode, decode_text, encode_text, DecodeError, SignalingMessage};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("relay connect failed: {0}")]
    Connect(String),
    #[error("relay connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("relay connection closed")]
    ChannelClosed,
}

pub struct SignalingClient {
    send_tx: mpsc::UnboundedSender<SignalingMessage>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Connects to the relay. The receiver yields every decodable message
    /// the relay forwards and closes when the relay connection ends.
    pub async fn connect(
        relay_url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingMessage>), SignalingError> {
        let url = parse_relay_url(relay_url)?;
        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| SignalingError::Timeout(CONNECT_TIMEOUT))?
            .map_err(|err| SignalingError::Connect(err.to_string()))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();
        tracing::info!(target: "duet::signaling", relay = %url, "connected to relay");

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SignalingMessage>();

        let writer_handle = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                let kind = message.kind();
                let text = match encode_text(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(
                            target: "duet::signaling",
                            error = %err,
                            "dropping outbound message"
                        );
                        continue;
                    }
                };
                if let Err(err) = ws_write.send(Message::Text(text)).await {
                    tracing::warn!(
                        target: "duet::signaling",
                        error = %err,
                        %kind,
                        "relay send failed"
                    );
                    break;
                }
                tracing::trace!(target: "duet::signaling", %kind, "sent");
            }
            let _ = ws_write.close().await;
        });

        let reader_handle = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let decoded = match frame {
                    Ok(Message::Text(text)) => decode_text(&text),
                    Ok(Message::Binary(data)) => decode(&data),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::warn!(target: "duet::signaling", "relay websocket error: {err}");
                        break;
                    }
                };
                match decoded {
                    Ok(message) => {
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => log_discard(&err),
                }
            }
            tracing::info!(target: "duet::signaling", "relay connection closed");
        });

        Ok((
            Self {
                send_tx,
                tasks: Mutex::new(vec![writer_handle, reader_handle]),
            },
            inbound_rx,
        ))
    }

    pub fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        self.send_tx
            .send(message)
            .map_err(|_| SignalingError::ChannelClosed)
    }

    /// Sender a negotiator can use as its outbound channel.
    pub fn outbound(&self) -> mpsc::UnboundedSender<SignalingMessage> {
        self.send_tx.clone()
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

fn log_discard(err: &DecodeError) {
    match err {
        DecodeError::UnknownType(_) => {
            tracing::warn!(target: "duet::signaling", error = %err, "ignoring unknown message")
        }
        DecodeError::MalformedPayload(_) => {
            tracing::warn!(target: "duet::signaling", error = %err, "discarding malformed frame")
        }
    }
}

fn parse_relay_url(relay_url: &str) -> Result<Url, SignalingError> {
    let url = Url::parse(relay_url).map_err(|err| SignalingError::InvalidUrl {
        url: relay_url.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(SignalingError::InvalidUrl {
            url: relay_url.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}
