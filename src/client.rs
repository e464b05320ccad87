use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::assembler::PieceAssembler;
use crate::layout::FileLayout;
use crate::link::{PeerConnector, RendezvousChannel};
use crate::protocol::{FileMeta, Inbound, PeerId, PeerMessage, SignalCommand, SignalMessage};
use crate::registry::PeerRegistry;
use crate::scheduler::RequestScheduler;
use crate::store::BlockStore;

/// Progress and lifecycle notifications raised toward the embedding
/// application.
#[derive(Debug, Clone, PartialEq)]
pub enum SwarmEvent {
    /// The rendezvous service assigned the local identity.
    Ready { peer_id: PeerId },
    /// The shared file's geometry is known; transfer state exists now.
    FileMetaKnown { meta: FileMeta },
    /// The known peer set changed.
    PeerListUpdated { peers: usize },
    /// One piece is assembled and durably written.
    PieceFinished { piece: u32 },
    /// Every piece is finished. Raised exactly once.
    TransferFinished,
    /// Writing a finished piece failed; the piece was re-queued.
    StorageFailure { piece: u32, reason: String },
}

/// Everything that enters the client loop: transport traffic, commands
/// from the embedding application, and the loop's own deferred wakeups.
#[derive(Debug)]
pub(crate) enum ClientMsg {
    Signal(serde_json::Value),
    PeerMessage { from: PeerId, msg: PeerMessage },
    PeerDisconnected(PeerId),
    Tick,
    BatchTimeout {
        peer:   PeerId,
        piece:  u32,
        blocks: Vec<u32>,
    },
    PieceWritten { piece: u32 },
    PieceWriteFailed { piece: u32, reason: String },
    NewRoom(FileMeta),
    JoinRoom(String),
    RefreshPeerList,
    SeedLocal,
    BlockPeer(PeerId),
    UnblockPeer(PeerId),
    Shutdown,
}

/// Cloneable entry point into the client loop.
///
/// Transport implementations use [`signal`](Self::signal),
/// [`peer_message`](Self::peer_message) and
/// [`peer_disconnected`](Self::peer_disconnected) to inject inbound
/// traffic; the embedding application uses the rest. All of them only
/// enqueue: every state change happens inside [`SwarmClient::run`].
#[derive(Clone)]
pub struct ClientHandle {
    tx: UnboundedSender<ClientMsg>,
}

impl ClientHandle {
    pub(crate) fn send(&self, msg: ClientMsg) {
        // the loop shutting down just means nobody is listening anymore
        let _ = self.tx.send(msg);
    }

    /// Inject one inbound signaling message from the rendezvous service.
    pub fn signal(&self, value: serde_json::Value) {
        self.send(ClientMsg::Signal(value));
    }

    /// Inject one application message received from a peer.
    pub fn peer_message(&self, from: PeerId, msg: PeerMessage) {
        self.send(ClientMsg::PeerMessage { from, msg });
    }

    /// Report a closed peer link.
    pub fn peer_disconnected(&self, peer: PeerId) {
        self.send(ClientMsg::PeerDisconnected(peer));
    }

    /// Create a room for a new shared file.
    pub fn new_room(&self, meta: FileMeta) {
        self.send(ClientMsg::NewRoom(meta));
    }

    /// Join an existing room.
    pub fn join_room(&self, roomid: impl Into<String>) {
        self.send(ClientMsg::JoinRoom(roomid.into()));
    }

    /// Ask the rendezvous service for a fresh peer list.
    pub fn refresh_peer_list(&self) {
        self.send(ClientMsg::RefreshPeerList);
    }

    /// Declare that the local store already holds the complete file and
    /// advertise every piece; turns this client into a pure server.
    pub fn seed_local(&self) {
        self.send(ClientMsg::SeedLocal);
    }

    /// Exclude a peer from download selection.
    pub fn block_peer(&self, peer: PeerId) {
        self.send(ClientMsg::BlockPeer(peer));
    }

    pub fn unblock_peer(&self, peer: PeerId) {
        self.send(ClientMsg::UnblockPeer(peer));
    }

    /// Stop the client loop. Queued messages ahead of this one are
    /// still processed; in-flight timers and sends are abandoned.
    pub fn shutdown(&self) {
        self.send(ClientMsg::Shutdown);
    }
}

/// The coordinator: composes the registry, scheduler and assembler with
/// the rendezvous channel and peer links, and owns every bit of mutable
/// transfer state behind one serialized event loop.
pub struct SwarmClient {
    rx:               UnboundedReceiver<ClientMsg>,
    handle:           ClientHandle,
    channel:          Arc<dyn RendezvousChannel>,
    store:            Arc<dyn BlockStore>,
    registry:         PeerRegistry,
    scheduler:        RequestScheduler,
    assembler:        Option<PieceAssembler>,
    layout:           Option<FileLayout>,
    events:           UnboundedSender<SwarmEvent>,
    finished_emitted: bool,
}

impl SwarmClient {
    /// Wires a client against its three collaborators. Returns the
    /// client (to be driven via [`run`](Self::run)), the handle, and the
    /// public event stream.
    pub fn new(
        channel: Arc<dyn RendezvousChannel>,
        connector: Arc<dyn PeerConnector>,
        store: Arc<dyn BlockStore>,
    ) -> (Self, ClientHandle, UnboundedReceiver<SwarmEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = ClientHandle { tx };
        let client = Self {
            rx,
            handle: handle.clone(),
            channel,
            store,
            registry: PeerRegistry::new(connector),
            scheduler: RequestScheduler::new(handle.clone()),
            assembler: None,
            layout: None,
            events: events_tx,
            finished_emitted: false,
        };
        (client, handle, events_rx)
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Drives the client until [`ClientHandle::shutdown`] is called. All
    /// state lives behind this loop; I/O completions re-enter it as
    /// messages instead of touching state from their own tasks.
    pub async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            if matches!(msg, ClientMsg::Shutdown) {
                break;
            }
            self.handle_msg(msg);
        }
        debug!("client loop stopped");
    }

    fn handle_msg(&mut self, msg: ClientMsg) {
        match msg {
            ClientMsg::Signal(value) => self.on_signal(value),
            ClientMsg::PeerMessage { from, msg } => match msg {
                PeerMessage::RequestBlock { piece, blocks } => {
                    self.on_block_requested(from, piece, blocks)
                }
                PeerMessage::Block { piece, block, data } => {
                    self.on_block_received(from, piece, block, Bytes::from(data))
                }
            },
            ClientMsg::PeerDisconnected(peer) => {
                let _ = self.registry.remove_link(&peer);
                self.scheduler.on_peer_disconnected(&peer);
            }
            ClientMsg::Tick => {
                self.scheduler.tick(&mut self.registry, self.assembler.as_mut());
            }
            ClientMsg::BatchTimeout {
                peer,
                piece,
                blocks,
            } => self.scheduler.on_batch_timeout(&peer, piece, &blocks),
            ClientMsg::PieceWritten { piece } => self.on_piece_written(piece),
            ClientMsg::PieceWriteFailed { piece, reason } => {
                warn!(piece, "piece write failed: {}", reason);
                self.scheduler.on_piece_write_failed(piece);
                self.emit(SwarmEvent::StorageFailure { piece, reason });
            }
            ClientMsg::NewRoom(meta) => {
                self.send_command(SignalCommand::NewRoom { file_meta: meta })
            }
            ClientMsg::JoinRoom(roomid) => self.send_command(SignalCommand::JoinRoom { roomid }),
            ClientMsg::RefreshPeerList => self.send_command(SignalCommand::GetPeerList),
            ClientMsg::SeedLocal => self.on_seed_local(),
            ClientMsg::BlockPeer(peer) => self.scheduler.block_peer(peer),
            ClientMsg::UnblockPeer(peer) => self.scheduler.unblock_peer(&peer),
            // consumed by the run loop
            ClientMsg::Shutdown => {}
        }
    }

    fn on_signal(&mut self, value: serde_json::Value) {
        let inbound = match Inbound::parse(value) {
            Ok(inbound) => inbound,
            Err(e) => {
                debug!("ignoring signaling message: {}", e);
                return;
            }
        };
        match inbound {
            Inbound::Command(SignalMessage::PeerAssigned { peerid }) => {
                info!(peer_id = %peerid, "identity assigned");
                self.registry.set_local(peerid.clone());
                self.emit(SwarmEvent::Ready { peer_id: peerid });
            }
            Inbound::Command(SignalMessage::FileMeta { file_meta }) => {
                if self.layout.is_some() {
                    debug!("file meta already known, ignoring");
                    return;
                }
                let layout = FileLayout::new(
                    file_meta.size,
                    file_meta.piece_size,
                    file_meta.block_size,
                );
                info!(
                    size = file_meta.size,
                    pieces = layout.piece_count,
                    "file meta received"
                );
                self.layout = Some(layout);
                self.assembler = Some(PieceAssembler::new(layout, self.store.clone()));
                self.scheduler.start(layout);
                self.emit(SwarmEvent::FileMetaKnown { meta: file_meta });
            }
            Inbound::Command(SignalMessage::PeerList { peer_list }) => {
                self.registry.update(peer_list);
                let peers = self.registry.peer_count();
                debug!(peers, "peer list updated");
                self.emit(SwarmEvent::PeerListUpdated { peers });
                self.scheduler.schedule_tick();
            }
            Inbound::Relay { origin, payload } => match self.registry.link(&origin, false) {
                Ok(link) => {
                    tokio::spawn(async move {
                        if let Err(e) = link.deliver_signal(payload).await {
                            warn!(peer = %origin, "signal delivery failed: {}", e);
                        }
                    });
                }
                Err(e) => warn!(peer = %origin, "cannot route relay envelope: {}", e),
            },
        }
    }

    fn on_block_received(&mut self, from: PeerId, piece: u32, block: u32, data: Bytes) {
        let Some(assembler) = self.assembler.as_mut() else {
            debug!(piece, block, "block before file meta dropped");
            return;
        };
        self.scheduler
            .on_block_received(&from, piece, block, data, assembler);
    }

    /// The serve side: answer each requested block of a locally finished
    /// piece with its clipped byte range. Requests for pieces this
    /// client does not hold are dropped without a reply; the protocol
    /// has no "don't have" answer and the requester's timeout covers it.
    fn on_block_requested(&mut self, from: PeerId, piece: u32, blocks: Vec<u32>) {
        let (Some(layout), Some(assembler)) = (self.layout, self.assembler.as_ref()) else {
            return;
        };
        if !assembler.is_finished(piece) {
            debug!(piece, peer = %from, "requested piece not held locally");
            return;
        }
        let link = match self.registry.link(&from, false) {
            Ok(link) => link,
            Err(e) => {
                warn!(peer = %from, "cannot serve block request: {}", e);
                return;
            }
        };
        let ranges: Vec<(u32, u64, u64)> = blocks
            .into_iter()
            .filter_map(|block| {
                let (start, end) = layout.block_range(piece, block);
                if start >= end {
                    debug!(piece, block, "requested block outside piece");
                    return None;
                }
                Some((block, start, end))
            })
            .collect();
        let store = self.store.clone();
        tokio::spawn(async move {
            let sends = ranges.into_iter().map(|(block, start, end)| {
                let store = store.clone();
                let link = link.clone();
                async move {
                    match store.read(start, end).await {
                        Ok(data) => {
                            let msg = PeerMessage::Block {
                                piece,
                                block,
                                data: data.to_vec(),
                            };
                            if let Err(e) = link.send(msg).await {
                                warn!(piece, block, "block send failed: {}", e);
                            }
                        }
                        Err(e) => warn!(piece, block, "block read failed: {}", e),
                    }
                }
            });
            futures::future::join_all(sends).await;
        });
    }

    fn on_piece_written(&mut self, piece: u32) {
        let Some(assembler) = self.assembler.as_mut() else {
            return;
        };
        assembler.mark_finished(piece);
        self.scheduler.on_piece_written();
        info!(piece, "piece finished");
        self.emit(SwarmEvent::PieceFinished { piece });
        self.push_bitmap();

        let all_finished = self
            .assembler
            .as_ref()
            .is_some_and(|assembler| assembler.all_finished());
        if all_finished && self.scheduler.is_drained() {
            if !self.finished_emitted {
                self.finished_emitted = true;
                info!("transfer finished");
                self.emit(SwarmEvent::TransferFinished);
            }
        } else {
            self.scheduler.schedule_tick();
        }
    }

    fn on_seed_local(&mut self) {
        let (Some(layout), Some(assembler)) = (self.layout, self.assembler.as_mut()) else {
            warn!("seed_local before file meta, ignoring");
            return;
        };
        assembler.mark_all_finished();
        self.scheduler.start_seeded(layout);
        info!("seeding local file");
        self.push_bitmap();
    }

    /// Publish the finished-piece bitmap to the rendezvous service.
    fn push_bitmap(&self) {
        let Some(assembler) = self.assembler.as_ref() else {
            return;
        };
        self.send_command(SignalCommand::UpdateBitmap {
            bitmap: assembler.bitmap().encode(),
        });
    }

    fn send_command(&self, cmd: SignalCommand) {
        let channel = self.channel.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.send(cmd).await {
                warn!("rendezvous send failed: {}", e);
            }
        });
    }

    fn emit(&self, event: SwarmEvent) {
        let _ = self.events.send(event);
    }
}
