use std::{cmp::Ordering, fmt};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const MAX_FRAME_BYTES: usize = 64 * 1024;
pub const MAX_TOPIC_LEN: usize = 64;
pub const MAX_TAB_ID_LEN: usize = 64;
pub const MAX_TABS_PER_ORIGIN: usize = 32;

pub const TOPIC_ELECTION: &str = "election";
pub const TOPIC_PRESENCE: &str = "presence";
pub const TOPIC_REPLICATION: &str = "replication";

pub type Term = u64;
pub type Version = u64;
pub type Origin = String;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(String);

impl TabId {
    #[must_use]
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode(bytes))
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let raw = raw.trim();
        if raw.is_empty() || raw.len() > MAX_TAB_ID_LEN {
            return Err(CoreError::InvalidTabId(raw.to_owned()));
        }
        Ok(Self(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub tab_id: TabId,
    pub term: Term,
    pub claimed_at: u64,
}

impl Claim {
    /// Total order used to settle competing claims.
    ///
    /// A higher term always wins. Within one term the lower tab id wins, and
    /// if two ids collide the earlier claim wins.
    pub fn outranks(&self, other: &Claim) -> bool {
        match self.term.cmp(&other.term) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match self.tab_id.cmp(&other.tab_id) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => self.claimed_at < other.claimed_at,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ElectionRecord {
    pub master_id: TabId,
    pub term: Term,
    pub last_heartbeat_at: u64,
}

impl ElectionRecord {
    pub fn from_claim(claim: &Claim, now_ms: u64) -> Self {
        Self {
            master_id: claim.tab_id.clone(),
            term: claim.term,
            last_heartbeat_at: now_ms,
        }
    }

    pub fn is_fresh(&self, now_ms: u64, timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_heartbeat_at) <= timeout_ms
    }

    pub fn claim(&self) -> Claim {
        Claim {
            tab_id: self.master_id.clone(),
            term: self.term,
            claimed_at: self.last_heartbeat_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceBeacon {
    pub tab_id: TabId,
    pub timestamp: u64,
    pub is_active_window: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    pub version: Version,
    pub state: serde_json::Value,
    pub digest: String,
}

impl StateSnapshot {
    pub fn new(version: Version, state: serde_json::Value) -> Self {
        let digest = state_digest(&state);
        Self {
            version,
            state,
            digest,
        }
    }

    pub fn empty() -> Self {
        Self::new(0, serde_json::Value::Object(serde_json::Map::new()))
    }

    pub fn verify(&self) -> Result<(), CoreError> {
        if state_digest(&self.state) != self.digest {
            return Err(CoreError::SnapshotDigestMismatch {
                version: self.version,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum TabMessage {
    Discover {
        from: TabId,
    },
    MasterHere(Claim),
    #[serde(rename_all = "camelCase")]
    Goodbye {
        from: TabId,
        master_term: Option<Term>,
    },
    Beacon(PresenceBeacon),
    ClaimActive {
        from: TabId,
        at: u64,
    },
    #[serde(rename_all = "camelCase")]
    SnapshotRequest {
        from: TabId,
        request_id: u32,
    },
    Snapshot {
        from: TabId,
        term: Term,
        to: Option<TabId>,
        snapshot: StateSnapshot,
    },
    Delta {
        from: TabId,
        term: Term,
        version: Version,
        patch: serde_json::Value,
    },
    Propose {
        from: TabId,
        patch: serde_json::Value,
    },
}

impl TabMessage {
    pub fn topic(&self) -> &'static str {
        match self {
            TabMessage::Discover { .. } | TabMessage::MasterHere(_) | TabMessage::Goodbye { .. } => {
                TOPIC_ELECTION
            }
            TabMessage::Beacon(_) | TabMessage::ClaimActive { .. } => TOPIC_PRESENCE,
            TabMessage::SnapshotRequest { .. }
            | TabMessage::Snapshot { .. }
            | TabMessage::Delta { .. }
            | TabMessage::Propose { .. } => TOPIC_REPLICATION,
        }
    }

    pub fn sender(&self) -> &TabId {
        match self {
            TabMessage::Discover { from }
            | TabMessage::Goodbye { from, .. }
            | TabMessage::ClaimActive { from, .. }
            | TabMessage::SnapshotRequest { from, .. }
            | TabMessage::Snapshot { from, .. }
            | TabMessage::Delta { from, .. }
            | TabMessage::Propose { from, .. } => from,
            TabMessage::MasterHere(claim) => &claim.tab_id,
            TabMessage::Beacon(beacon) => &beacon.tab_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub origin: Origin,
    pub tab_id: TabId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum ControlMessage {
    Hello(Hello),
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub topic: String,
    pub sender: TabId,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Control(ControlMessage),
    Broadcast(Envelope),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Control = 0,
    Broadcast = 1,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid tab id {0:?}")]
    InvalidTabId(String),
    #[error("invalid frame length")]
    InvalidFrameLength,
    #[error("frame of {size} bytes exceeds {max} bytes")]
    FrameTooLarge { size: usize, max: usize },
    #[error("topic must be non-empty and <= 64 bytes")]
    InvalidTopic,
    #[error("unsupported message type {0}")]
    UnsupportedMessageType(u8),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("stale version: got {incoming}, last applied {last_applied}")]
    StaleVersion {
        incoming: Version,
        last_applied: Version,
    },
    #[error("snapshot digest mismatch at version {version}")]
    SnapshotDigestMismatch { version: Version },
}

pub fn validate_version(last_applied: Option<Version>, incoming: Version) -> Result<(), CoreError> {
    if let Some(last) = last_applied
        && incoming <= last
    {
        return Err(CoreError::StaleVersion {
            incoming,
            last_applied: last,
        });
    }
    Ok(())
}

pub fn encode_message(message: &TabMessage) -> Result<Vec<u8>, CoreError> {
    serde_json::to_vec(message).map_err(|err| CoreError::Serialization(err.to_string()))
}

pub fn decode_message(payload: &[u8]) -> Result<TabMessage, CoreError> {
    serde_json::from_slice(payload).map_err(|err| CoreError::Serialization(err.to_string()))
}

pub fn encode_frame(message: &WireMessage) -> Result<Vec<u8>, CoreError> {
    let (message_type, payload) = match message {
        WireMessage::Control(control) => (
            MessageType::Control as u8,
            serde_json::to_vec(control).map_err(|err| CoreError::Serialization(err.to_string()))?,
        ),
        WireMessage::Broadcast(envelope) => {
            (MessageType::Broadcast as u8, encode_envelope(envelope)?)
        }
    };

    let frame_len = 1usize
        .checked_add(payload.len())
        .ok_or(CoreError::InvalidFrameLength)?;
    if frame_len + 4 > MAX_FRAME_BYTES {
        return Err(CoreError::FrameTooLarge {
            size: frame_len + 4,
            max: MAX_FRAME_BYTES,
        });
    }
    let frame_len_u32 = u32::try_from(frame_len).map_err(|_| CoreError::InvalidFrameLength)?;

    let mut out = BytesMut::with_capacity(4 + frame_len);
    out.put_u32_le(frame_len_u32);
    out.put_u8(message_type);
    out.extend_from_slice(&payload);
    Ok(out.to_vec())
}

pub fn decode_frame(frame: &[u8]) -> Result<WireMessage, CoreError> {
    if frame.len() < 5 {
        return Err(CoreError::InvalidFrameLength);
    }
    if frame.len() > MAX_FRAME_BYTES {
        return Err(CoreError::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_BYTES,
        });
    }

    let mut cursor = frame;
    let expected_len = cursor.get_u32_le() as usize;
    if expected_len + 4 != frame.len() {
        return Err(CoreError::InvalidFrameLength);
    }

    let message_type = cursor.get_u8();
    let payload = cursor;

    match message_type {
        x if x == MessageType::Control as u8 => {
            let control: ControlMessage = serde_json::from_slice(payload)
                .map_err(|err| CoreError::Serialization(err.to_string()))?;
            Ok(WireMessage::Control(control))
        }
        x if x == MessageType::Broadcast as u8 => {
            Ok(WireMessage::Broadcast(decode_envelope(payload)?))
        }
        other => Err(CoreError::UnsupportedMessageType(other)),
    }
}

fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, CoreError> {
    // Layout:
    // - topic_len: u16, topic bytes (utf-8)
    // - sender_len: u16, sender bytes (utf-8)
    // - payload_len: u32, payload bytes
    let topic = envelope.topic.as_bytes();
    if topic.is_empty() || topic.len() > MAX_TOPIC_LEN {
        return Err(CoreError::InvalidTopic);
    }
    let sender = envelope.sender.as_str().as_bytes();
    let sender_len = u16::try_from(sender.len()).map_err(|_| CoreError::InvalidFrameLength)?;
    let payload_len =
        u32::try_from(envelope.payload.len()).map_err(|_| CoreError::InvalidFrameLength)?;

    let mut out =
        BytesMut::with_capacity(2 + topic.len() + 2 + sender.len() + 4 + envelope.payload.len());
    out.put_u16_le(topic.len() as u16);
    out.extend_from_slice(topic);
    out.put_u16_le(sender_len);
    out.extend_from_slice(sender);
    out.put_u32_le(payload_len);
    out.extend_from_slice(&envelope.payload);
    Ok(out.to_vec())
}

fn decode_envelope(mut bytes: &[u8]) -> Result<Envelope, CoreError> {
    let topic = take_str(&mut bytes)?;
    if topic.is_empty() || topic.len() > MAX_TOPIC_LEN {
        return Err(CoreError::InvalidTopic);
    }
    let sender = TabId::parse(&take_str(&mut bytes)?)?;

    if bytes.len() < 4 {
        return Err(CoreError::InvalidFrameLength);
    }
    let payload_len = bytes.get_u32_le() as usize;
    if bytes.len() != payload_len {
        return Err(CoreError::InvalidFrameLength);
    }

    Ok(Envelope {
        topic,
        sender,
        payload: bytes.to_vec(),
    })
}

fn take_str(bytes: &mut &[u8]) -> Result<String, CoreError> {
    if bytes.len() < 2 {
        return Err(CoreError::InvalidFrameLength);
    }
    let len = bytes.get_u16_le() as usize;
    if bytes.len() < len {
        return Err(CoreError::InvalidFrameLength);
    }
    let (head, tail) = bytes.split_at(len);
    let value = std::str::from_utf8(head)
        .map_err(|err| CoreError::Serialization(err.to_string()))?
        .to_owned();
    *bytes = tail;
    Ok(value)
}

fn state_digest(state: &serde_json::Value) -> String {
    hex::encode(Sha256::digest(state.to_string().as_bytes()))
}
