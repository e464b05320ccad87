//! Client-side coordinator of a peer-to-peer swarm file transfer.
//!
//! A file is split into fixed-size pieces, each split into fixed-size
//! blocks. [`SwarmClient`] decides which blocks to request from which
//! peer, tracks in-flight batches, recovers from slow peers via
//! timeouts, assembles completed pieces into a [`BlockStore`] and serves
//! finished pieces back to the swarm. The peer transport ([`PeerLink`]),
//! the rendezvous/signaling service ([`RendezvousChannel`]) and the byte
//! storage ([`BlockStore`]) are supplied by the embedding application;
//! progress is reported through a stream of [`SwarmEvent`]s.

use std::time::Duration;

mod assembler;
mod client;
mod error;
mod layout;
mod link;
mod protocol;
mod registry;
mod scheduler;
mod store;

pub use client::{ClientHandle, SwarmClient, SwarmEvent};
pub use error::SwarmError;
pub use layout::FileLayout;
pub use link::{PeerConnector, PeerLink, RendezvousChannel};
pub use protocol::{
    Bitmap, FileMeta, Inbound, PeerId, PeerMessage, PeerRecord, SignalCommand, SignalMessage,
};
pub use store::{BlockStore, FileStore, MemoryStore};

pub const REQUEST_BATCH_SIZE: u64 = 1 << 19;  // request up to 512K of data from one peer
pub const MIN_SPEED_LIMIT: u64    = 4 * 1024; // 4kb/s tolerated before a batch times out
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);
