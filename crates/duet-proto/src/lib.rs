//! Wire-level signaling messages shared by the duet relay and its peers.
//! Peers exchange offers, answers and trickled ICE candidates as single
//! UTF-8 JSON objects tagged by a `type` field; the relay never looks inside.

mod codec;
mod message;

pub use codec::{decode, decode_text, encode, encode_text, DecodeError, EncodeError};
pub use message::{IceCandidate, MessageKind, SdpKind, SessionDescription, SignalingMessage};
