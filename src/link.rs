use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SwarmError;
use crate::protocol::{PeerId, PeerMessage, SignalCommand};

/// One established transport session with a remote peer.
///
/// Implementations own connection setup, framing and delivery. The
/// scheduler treats `send` as fire-and-forget: a lost or slow message is
/// recovered by the batch timeout, never by a transport-level ack.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Queue an application message for delivery to the remote peer.
    async fn send(&self, msg: PeerMessage) -> Result<(), SwarmError>;

    /// Hand a relayed signaling envelope (offer/answer/candidate and the
    /// like) to this link's connection machinery.
    async fn deliver_signal(&self, envelope: serde_json::Value) -> Result<(), SwarmError>;

    /// Tear the session down. Implementations report the closure back
    /// through [`ClientHandle::peer_disconnected`](crate::ClientHandle).
    fn close(&self);
}

/// Opens [`PeerLink`]s on demand.
///
/// Links are only opened when a peer is actually selected to serve or be
/// served. With `connect` set the link dials out immediately; without it
/// the link is created passively, waiting for the remote side's
/// signaling to arrive.
pub trait PeerConnector: Send + Sync {
    fn open(&self, local: &PeerId, remote: &PeerId, connect: bool) -> Arc<dyn PeerLink>;
}

/// Outbound half of the signaling connection to the rendezvous service.
///
/// Inbound traffic is injected by the transport through
/// [`ClientHandle::signal`](crate::ClientHandle).
#[async_trait]
pub trait RendezvousChannel: Send + Sync {
    async fn send(&self, cmd: SignalCommand) -> Result<(), SwarmError>;
}
