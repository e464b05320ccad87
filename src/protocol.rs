use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SwarmError;

/// Identity assigned to a client by the rendezvous service.
///
/// Peer ids are opaque strings; the scheduler only relies on their
/// lexicographic order to scan candidates deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which pieces a peer claims to hold, one flag per piece.
///
/// The wire form is a string of `'0'`/`'1'` characters, one per piece in
/// ascending index order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Bitmap(Vec<bool>);

impl Bitmap {
    pub fn new(pieces: usize) -> Self {
        Self(vec![false; pieces])
    }

    pub fn all_set(pieces: usize) -> Self {
        Self(vec![true; pieces])
    }

    pub fn has(&self, piece: u32) -> bool {
        self.0.get(piece as usize).copied().unwrap_or(false)
    }

    pub fn set(&mut self, piece: u32) {
        if let Some(flag) = self.0.get_mut(piece as usize) {
            *flag = true;
        }
    }

    pub fn set_all(&mut self) {
        self.0.fill(true);
    }

    /// True when every piece is flagged.
    pub fn is_complete(&self) -> bool {
        self.0.iter().all(|flag| *flag)
    }

    pub fn count(&self) -> usize {
        self.0.iter().filter(|flag| **flag).count()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Renders the `'0'`/`'1'` wire string.
    pub fn encode(&self) -> String {
        self.0.iter().map(|flag| if *flag { '1' } else { '0' }).collect()
    }

    /// Parses the `'0'`/`'1'` wire string.
    pub fn decode(s: &str) -> Result<Self, SwarmError> {
        s.chars()
            .map(|c| match c {
                '0' => Ok(false),
                '1' => Ok(true),
                other => Err(SwarmError::ProtocolError(format!(
                    "invalid bitmap character: {:?}",
                    other
                ))),
            })
            .collect::<Result<Vec<bool>, _>>()
            .map(Self)
    }
}

impl TryFrom<String> for Bitmap {
    type Error = SwarmError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::decode(&s)
    }
}

impl From<Bitmap> for String {
    fn from(bitmap: Bitmap) -> Self {
        bitmap.encode()
    }
}

/// File geometry announced by the room creator and distributed by the
/// rendezvous service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub size:       u64,
    pub piece_size: u64,
    pub block_size: u64,
    pub piece_cnt:  u32,
}

/// One entry of the `peer_list` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub bitmap: Bitmap,
}

/// Application-level message exchanged between two peers over a
/// [`PeerLink`](crate::link::PeerLink).
///
/// `request_block` asks for a batch of blocks of one piece; each block is
/// answered individually with a `block` message. Data may arrive in any
/// order and is matched back to the request by `(piece, block)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Ask the remote peer for a batch of blocks of `piece`.
    RequestBlock { piece: u32, blocks: Vec<u32> },
    /// One block of piece data.
    Block {
        piece: u32,
        block: u32,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
}

impl PeerMessage {
    /// Serializes the message for a transport that frames raw bytes.
    pub fn encode(&self) -> Result<Vec<u8>, SwarmError> {
        serde_json::to_vec(self).map_err(|e| SwarmError::ProtocolError(format!("{}", e)))
    }

    /// Parses a framed message received from a peer.
    pub fn decode(buf: &[u8]) -> Result<Self, SwarmError> {
        serde_json::from_slice(buf).map_err(|e| SwarmError::ProtocolError(format!("{}", e)))
    }
}

/// Command sent from the client to the rendezvous service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum SignalCommand {
    /// Create a room for a new shared file.
    NewRoom { file_meta: FileMeta },
    /// Join an existing room.
    JoinRoom { roomid: String },
    /// Ask for the current peer list.
    GetPeerList,
    /// Publish which pieces this client can serve.
    UpdateBitmap { bitmap: String },
}

/// Message received from the rendezvous service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd")]
pub enum SignalMessage {
    /// Assigns the local identity; the client is usable afterwards.
    #[serde(rename = "peerid")]
    PeerAssigned { peerid: PeerId },
    /// Announces the shared file's geometry. Only the first one counts.
    #[serde(rename = "file_meta")]
    FileMeta { file_meta: FileMeta },
    /// Replaces the known peer set and their advertised bitmaps.
    #[serde(rename = "peer_list")]
    PeerList { peer_list: HashMap<PeerId, PeerRecord> },
}

/// Classified inbound signaling traffic.
///
/// The rendezvous channel carries two kinds of payload: its own commands
/// (tagged with `cmd`) and relayed peer-signaling envelopes that only the
/// addressed peer link understands. Envelopes are recognized by the
/// presence of `type` and `origin` without a `cmd` and are forwarded
/// verbatim.
#[derive(Debug, Clone)]
pub enum Inbound {
    Command(SignalMessage),
    Relay {
        origin:  PeerId,
        payload: serde_json::Value,
    },
}

impl Inbound {
    pub fn parse(value: serde_json::Value) -> Result<Self, SwarmError> {
        let obj = value
            .as_object()
            .ok_or_else(|| SwarmError::ProtocolError("signaling message is not an object".into()))?;

        if obj.contains_key("cmd") {
            return serde_json::from_value(value.clone())
                .map(Inbound::Command)
                .map_err(|e| SwarmError::ProtocolError(format!("{}", e)));
        }

        if obj.contains_key("type") {
            let origin = obj
                .get("origin")
                .and_then(|v| v.as_str())
                .ok_or_else(|| SwarmError::ProtocolError("relay envelope without origin".into()))?;
            return Ok(Inbound::Relay {
                origin: PeerId(origin.to_string()),
                payload: value,
            });
        }

        Err(SwarmError::ProtocolError(
            "signaling message has neither cmd nor type".into(),
        ))
    }
}
