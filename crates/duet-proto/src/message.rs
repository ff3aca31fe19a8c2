use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Which side of an offer/answer exchange a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

/// An opaque negotiation blob tagged with its role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn into_message(self) -> SignalingMessage {
        match self.kind {
            SdpKind::Offer => SignalingMessage::Offer { sdp: self.sdp },
            SdpKind::Answer => SignalingMessage::Answer { sdp: self.sdp },
        }
    }
}

/// A trickled connectivity candidate.
///
/// `sdp_mline_index` is `None` when the sender did not provide a media-line
/// index; `sdp_mid` may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "sdpMid", default, deserialize_with = "null_as_empty")]
    pub sdp_mid: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl IceCandidate {
    pub fn new(
        candidate: impl Into<String>,
        sdp_mline_index: Option<u16>,
        sdp_mid: impl Into<String>,
    ) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mline_index,
            sdp_mid: sdp_mid.into(),
        }
    }
}

/// One relay frame. Serialized as a JSON object tagged by `type`; candidate
/// fields sit next to the tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Offer,
    Answer,
    Candidate,
}

impl MessageKind {
    pub(crate) fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "offer" => Some(MessageKind::Offer),
            "answer" => Some(MessageKind::Answer),
            "candidate" => Some(MessageKind::Candidate),
            _ => None,
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::Candidate => "candidate",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

impl SignalingMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            SignalingMessage::Offer { .. } => MessageKind::Offer,
            SignalingMessage::Answer { .. } => MessageKind::Answer,
            SignalingMessage::Candidate(_) => MessageKind::Candidate,
        }
    }
}

impl From<SessionDescription> for SignalingMessage {
    fn from(description: SessionDescription) -> Self {
        description.into_message()
    }
}

impl From<IceCandidate> for SignalingMessage {
    fn from(candidate: IceCandidate) -> Self {
        SignalingMessage::Candidate(candidate)
    }
}
