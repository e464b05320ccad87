use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::assembler::PieceAssembler;
use crate::client::{ClientHandle, ClientMsg};
use crate::layout::FileLayout;
use crate::protocol::{PeerId, PeerMessage};
use crate::registry::PeerRegistry;
use crate::{MIN_SPEED_LIMIT, REQUEST_BATCH_SIZE, TICK_INTERVAL};

/// Request state of one block of the active piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockState {
    /// Not yet requested from anyone.
    Unassigned,
    /// Requested from the given peer and not yet answered.
    Pending(PeerId),
    /// Delivered by the peer it was pending on.
    Finished,
}

/// The download side's state machine.
///
/// Owns the piece queue, the active piece's block states and the peer
/// admission sets. One piece is worked on at a time; within it, batches
/// of blocks are requested from one peer each, capped at one outstanding
/// batch per peer. Slow peers are recovered by a per-batch timeout that
/// returns their blocks to the pool.
///
/// Every entry point is a plain method called from the client's event
/// loop; nothing here runs concurrently with anything else, and no
/// failure escapes a scheduling pass. Anything that cannot proceed is
/// logged and retried on a later trigger.
pub struct RequestScheduler {
    layout:        Option<FileLayout>,
    piece_queue:   Vec<u32>,
    cur_piece:     Option<u32>,
    blocks:        Vec<BlockState>,
    assembling:    bool,
    inuse_peers:   HashSet<PeerId>,
    blocked_peers: HashSet<PeerId>,
    tick_pending:  bool,
    handle:        ClientHandle,
}

impl RequestScheduler {
    pub fn new(handle: ClientHandle) -> Self {
        Self {
            layout: None,
            piece_queue: Vec::new(),
            cur_piece: None,
            blocks: Vec::new(),
            assembling: false,
            inuse_peers: HashSet::new(),
            blocked_peers: HashSet::new(),
            tick_pending: false,
            handle,
        }
    }

    /// Queues every piece of a freshly announced file and requests a
    /// first pass. Pieces are enqueued ascending and the queue reversed
    /// once: consumption pops from the back, so pieces activate in
    /// ascending index order.
    pub fn start(&mut self, layout: FileLayout) {
        self.layout = Some(layout);
        self.piece_queue = (0..layout.piece_count).collect();
        self.piece_queue.reverse();
        self.schedule_tick();
    }

    /// Like [`start`](Self::start) but for a client that already holds
    /// the whole file: nothing to download, only to serve.
    pub fn start_seeded(&mut self, layout: FileLayout) {
        self.layout = Some(layout);
        self.piece_queue.clear();
        self.cur_piece = None;
        self.blocks.clear();
    }

    /// Requests a scheduling pass, debounced: the first trigger arms a
    /// trailing-edge timer and further triggers are absorbed until it
    /// fires, so a burst of events costs one pass and the pass always
    /// runs after the last trigger.
    pub fn schedule_tick(&mut self) {
        if self.tick_pending {
            return;
        }
        self.tick_pending = true;
        let handle = self.handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TICK_INTERVAL).await;
            handle.send(ClientMsg::Tick);
        });
    }

    /// One scheduling pass: activate a piece if none is active, finalize
    /// it if it is complete, otherwise pick a batch of unassigned blocks
    /// and a peer to request them from.
    ///
    /// Before file metadata arrives there is nothing to schedule, but the
    /// pass still consumes the pending-trigger flag.
    pub fn tick(&mut self, registry: &mut PeerRegistry, assembler: Option<&mut PieceAssembler>) {
        self.tick_pending = false;
        if self.assembling {
            return;
        }
        let (Some(layout), Some(assembler)) = (self.layout, assembler) else {
            return;
        };

        if self.cur_piece.is_none() {
            let Some(piece) = self.piece_queue.pop() else {
                debug!("no piece left to schedule");
                return;
            };
            self.cur_piece = Some(piece);
            self.blocks = vec![BlockState::Unassigned; layout.blocks_in_piece(piece) as usize];
            assembler.begin_piece(piece);
        }
        let Some(piece) = self.cur_piece else {
            return;
        };

        if self.blocks.iter().all(|b| *b == BlockState::Finished) {
            self.assembling = true;
            assembler.finalize(piece, &self.handle);
            return;
        }

        let limit = (REQUEST_BATCH_SIZE / layout.block_size).max(1) as usize;
        let blocks: Vec<u32> = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, state)| **state == BlockState::Unassigned)
            .map(|(block, _)| block as u32)
            .take(limit)
            .collect();
        if blocks.is_empty() {
            debug!(piece, "nothing left to request, batches in flight");
            return;
        }

        let peer = registry
            .candidates(piece)
            .find(|p| !self.inuse_peers.contains(*p) && !self.blocked_peers.contains(*p))
            .cloned();
        let Some(peer) = peer else {
            debug!(piece, "no available peer, idling until the next trigger");
            return;
        };

        let _ = self.inuse_peers.insert(peer.clone());
        for block in &blocks {
            self.blocks[*block as usize] = BlockState::Pending(peer.clone());
        }
        debug!(piece, peer = %peer, count = blocks.len(), "requesting block batch");

        match registry.link(&peer, true) {
            Ok(link) => {
                let msg = PeerMessage::RequestBlock {
                    piece,
                    blocks: blocks.clone(),
                };
                tokio::spawn(async move {
                    if let Err(e) = link.send(msg).await {
                        warn!("block request send failed: {}", e);
                    }
                });
            }
            // leave the batch pending; the timeout reclaims it
            Err(e) => warn!(peer = %peer, "peer link unavailable: {}", e),
        }

        self.arm_batch_timeout(layout, peer, piece, blocks);
    }

    /// One timer per batch, sized for the slowest tolerated peer: the
    /// batch's byte count over [`MIN_SPEED_LIMIT`].
    fn arm_batch_timeout(&self, layout: FileLayout, peer: PeerId, piece: u32, blocks: Vec<u32>) {
        let timeout =
            Duration::from_millis(layout.block_size * blocks.len() as u64 * 1000 / MIN_SPEED_LIMIT);
        let handle = self.handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            handle.send(ClientMsg::BatchTimeout {
                peer,
                piece,
                blocks,
            });
        });
    }

    /// Reclaims whatever part of a timed-out batch is still pending on
    /// the peer it was sent to. Blocks already delivered or reassigned
    /// are left alone, so a late timer for a settled batch is a no-op.
    pub fn on_batch_timeout(&mut self, peer: &PeerId, piece: u32, blocks: &[u32]) {
        if self.cur_piece != Some(piece) {
            return;
        }
        let mut reverted = 0usize;
        for block in blocks {
            let slot = self.blocks.get_mut(*block as usize);
            if let Some(state) = slot {
                if *state == BlockState::Pending(peer.clone()) {
                    *state = BlockState::Unassigned;
                    reverted += 1;
                }
            }
        }
        if reverted == 0 {
            return;
        }
        debug!(piece, peer = %peer, reverted, "batch timed out");
        if !self.has_pending(peer) {
            let _ = self.inuse_peers.remove(peer);
        }
        self.schedule_tick();
    }

    /// Accepts a delivered block if it matches the exact pending state it
    /// was requested under; anything else (wrong peer, already finished,
    /// piece no longer active) is a stale answer and is dropped.
    pub fn on_block_received(
        &mut self,
        peer: &PeerId,
        piece: u32,
        block: u32,
        data: Bytes,
        assembler: &mut PieceAssembler,
    ) {
        if self.cur_piece != Some(piece) {
            debug!(piece, block, peer = %peer, "block for inactive piece dropped");
            return;
        }
        match self.blocks.get(block as usize) {
            Some(BlockState::Pending(pending)) if pending == peer => {}
            other => {
                debug!(piece, block, peer = %peer, state = ?other, "stale block dropped");
                return;
            }
        }
        self.blocks[block as usize] = BlockState::Finished;
        assembler.store_block(piece, block, data);
        if !self.has_pending(peer) {
            let _ = self.inuse_peers.remove(peer);
        }
        self.schedule_tick();
    }

    /// A dropped link is an immediate forced timeout over every block
    /// pending on that peer.
    pub fn on_peer_disconnected(&mut self, peer: &PeerId) {
        let mut reverted = 0usize;
        for state in &mut self.blocks {
            if *state == BlockState::Pending(peer.clone()) {
                *state = BlockState::Unassigned;
                reverted += 1;
            }
        }
        let _ = self.inuse_peers.remove(peer);
        if reverted > 0 {
            debug!(peer = %peer, reverted, "pending blocks reclaimed from disconnected peer");
            self.schedule_tick();
        }
    }

    /// The active piece's bytes are durable; clear the slot so the next
    /// pass can pull the next piece.
    pub fn on_piece_written(&mut self) {
        self.assembling = false;
        self.cur_piece = None;
        self.blocks.clear();
    }

    /// The finalize write failed: give the piece back to the queue, at
    /// the front so every other piece is attempted before the retry.
    pub fn on_piece_write_failed(&mut self, piece: u32) {
        self.assembling = false;
        self.cur_piece = None;
        self.blocks.clear();
        self.piece_queue.insert(0, piece);
        self.schedule_tick();
    }

    /// Excludes a peer from future selection. Pending batches are left
    /// to the timeout path.
    pub fn block_peer(&mut self, peer: PeerId) {
        let _ = self.blocked_peers.insert(peer);
    }

    pub fn unblock_peer(&mut self, peer: &PeerId) {
        if self.blocked_peers.remove(peer) {
            self.schedule_tick();
        }
    }

    /// True once nothing is queued or active; together with the
    /// assembler's bitmap this is the transfer-finished condition.
    pub fn is_drained(&self) -> bool {
        self.cur_piece.is_none() && self.piece_queue.is_empty()
    }

    fn has_pending(&self, peer: &PeerId) -> bool {
        self.blocks
            .iter()
            .any(|state| matches!(state, BlockState::Pending(p) if p == peer))
    }
}
