use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Stable identity of a session member (one per user, device or tab)
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of a debate session
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifier of a stored signal document
pub type SignalId = Uuid;

/// Kind of handshake unit carried by a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Offer => f.write_str("offer"),
            SignalKind::Answer => f.write_str("answer"),
            SignalKind::Candidate => f.write_str("candidate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description in the browser's `RTCSessionDescriptionInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Payload of a handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidateInit),
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Offer(_) => SignalKind::Offer,
            SignalPayload::Answer(_) => SignalKind::Answer,
            SignalPayload::Candidate(_) => SignalKind::Candidate,
        }
    }
}

/// A single handshake unit addressed from one participant to another.
///
/// `sequence` is the relay's creation-order marker; it is `None` until the
/// message has been stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalMessage {
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub payload: SignalPayload,
    pub sequence: Option<u64>,
}

impl SignalMessage {
    pub fn new(from: ParticipantId, to: ParticipantId, payload: SignalPayload) -> Self {
        Self {
            from,
            to,
            payload,
            sequence: None,
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.payload.kind()
    }

    /// Convert into the stored document shape
    pub fn to_draft(&self) -> SignalDraft {
        let (sdp, candidate) = match &self.payload {
            SignalPayload::Offer(desc) | SignalPayload::Answer(desc) => (Some(desc.clone()), None),
            SignalPayload::Candidate(candidate) => (None, Some(candidate.clone())),
        };

        SignalDraft {
            from: self.from.clone(),
            to: self.to.clone(),
            kind: self.kind(),
            sdp,
            candidate,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("{kind} signal from {from} is missing its {field} field")]
    MissingField {
        kind: SignalKind,
        from: ParticipantId,
        field: &'static str,
    },

    #[error("{kind} signal from {from} carries a {found:?} description")]
    DescriptionMismatch {
        kind: SignalKind,
        from: ParticipantId,
        found: SdpType,
    },
}

/// Signal document fields written by a sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalDraft {
    pub from: ParticipantId,
    pub to: ParticipantId,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidateInit>,
}

impl SignalDraft {
    /// Validate the draft and turn it into a handshake message
    pub fn into_message(self, sequence: Option<u64>) -> Result<SignalMessage, ProtocolError> {
        let payload = match self.kind {
            SignalKind::Offer | SignalKind::Answer => {
                let desc = self.sdp.ok_or_else(|| ProtocolError::MissingField {
                    kind: self.kind,
                    from: self.from.clone(),
                    field: "sdp",
                })?;
                match (self.kind, desc.sdp_type) {
                    (SignalKind::Offer, SdpType::Offer) => SignalPayload::Offer(desc),
                    (SignalKind::Answer, SdpType::Answer) => SignalPayload::Answer(desc),
                    (kind, found) => {
                        return Err(ProtocolError::DescriptionMismatch {
                            kind,
                            from: self.from,
                            found,
                        });
                    }
                }
            }
            SignalKind::Candidate => {
                let candidate = self.candidate.ok_or_else(|| ProtocolError::MissingField {
                    kind: self.kind,
                    from: self.from.clone(),
                    field: "candidate",
                })?;
                SignalPayload::Candidate(candidate)
            }
        };

        Ok(SignalMessage {
            from: self.from,
            to: self.to,
            payload,
            sequence,
        })
    }
}

/// Signal document as stored by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalDocument {
    pub id: SignalId,
    #[serde(flatten)]
    pub draft: SignalDraft,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    /// Store-wide creation order; ties in `created_at` are broken by this
    pub seq: u64,
}

impl SignalDocument {
    pub fn into_message(self) -> Result<SignalMessage, ProtocolError> {
        self.draft.into_message(Some(self.seq))
    }
}

/// Participant registry document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantDocument {
    pub uid: ParticipantId,
    #[serde(rename = "joinedAt")]
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DebateStatus {
    #[default]
    Lobby,
    Live,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DebateMode {
    #[default]
    Chat,
    Video,
}

/// Debate settings relevant to the video mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DebateState {
    pub status: DebateStatus,
    pub mode: DebateMode,
}

impl DebateState {
    pub fn live_video() -> Self {
        Self {
            status: DebateStatus::Live,
            mode: DebateMode::Video,
        }
    }

    /// Whether peers should be connected in this state
    pub fn wants_video_mesh(&self) -> bool {
        self.status == DebateStatus::Live && self.mode == DebateMode::Video
    }
}

/// ICE server configuration for WebRTC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}
