use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::error::SwarmError;
use crate::link::{PeerConnector, PeerLink};
use crate::protocol::{Bitmap, PeerId, PeerRecord};

/// Tracks the swarm as advertised by the rendezvous service: which
/// pieces each peer claims to hold, and the live transport links.
///
/// Bitmaps live in a `BTreeMap` so candidate scans always walk peers in
/// ascending id order; selection must be reproducible across runs.
pub struct PeerRegistry {
    local:     Option<PeerId>,
    bitmaps:   BTreeMap<PeerId, Bitmap>,
    links:     HashMap<PeerId, Arc<dyn PeerLink>>,
    connector: Arc<dyn PeerConnector>,
}

impl PeerRegistry {
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            local: None,
            bitmaps: BTreeMap::new(),
            links: HashMap::new(),
            connector,
        }
    }

    /// Records the identity assigned by the rendezvous service.
    pub fn set_local(&mut self, id: PeerId) {
        self.local = Some(id);
    }

    /// Replaces the advertised bitmaps wholesale from a `peer_list`
    /// message. Links stay untouched; a peer that fell out of the list
    /// simply stops being a candidate.
    pub fn update(&mut self, records: HashMap<PeerId, PeerRecord>) {
        self.bitmaps = records
            .into_iter()
            .map(|(id, record)| (id, record.bitmap))
            .collect();
    }

    pub fn peer_count(&self) -> usize {
        self.bitmaps.len()
    }

    pub fn has_piece(&self, peer: &PeerId, piece: u32) -> bool {
        self.bitmaps.get(peer).is_some_and(|bitmap| bitmap.has(piece))
    }

    /// Peers advertising `piece`, in ascending id order, local excluded.
    pub fn candidates(&self, piece: u32) -> impl Iterator<Item = &PeerId> {
        self.bitmaps
            .keys()
            .filter(move |id| Some(*id) != self.local.as_ref() && self.has_piece(*id, piece))
    }

    /// Returns the link to `peer`, opening one lazily if needed.
    pub fn link(&mut self, peer: &PeerId, connect: bool) -> Result<Arc<dyn PeerLink>, SwarmError> {
        if let Some(link) = self.links.get(peer) {
            return Ok(link.clone());
        }
        let local = self
            .local
            .as_ref()
            .ok_or_else(|| SwarmError::PeerError("local peer id not assigned yet".into()))?;
        debug!(peer = %peer, connect, "opening peer link");
        let link = self.connector.open(local, peer, connect);
        self.links.insert(peer.clone(), link.clone());
        Ok(link)
    }

    /// Drops the link to a disconnected peer. Returns whether one existed.
    pub fn remove_link(&mut self, peer: &PeerId) -> bool {
        let removed = self.links.remove(peer).is_some();
        if removed {
            debug!(peer = %peer, "peer link removed");
        }
        removed
    }
}
