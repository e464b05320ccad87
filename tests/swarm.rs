use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;

use swarmz::{
    BlockStore, ClientHandle, FileLayout, MemoryStore, PeerConnector, PeerId, PeerLink,
    PeerMessage, RendezvousChannel, SignalCommand, SwarmClient, SwarmError, SwarmEvent,
};

const PIECE: u64 = 1024;
const BLOCK: u64 = 256;

type HandleCell = Arc<Mutex<Option<ClientHandle>>>;

/// Records every command pushed to the rendezvous service.
#[derive(Default)]
struct RecordingChannel {
    sent: Mutex<Vec<SignalCommand>>,
}

impl RecordingChannel {
    fn bitmaps(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|cmd| match cmd {
                SignalCommand::UpdateBitmap { bitmap } => Some(bitmap.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl RendezvousChannel for RecordingChannel {
    async fn send(&self, cmd: SignalCommand) -> Result<(), SwarmError> {
        self.sent.lock().unwrap().push(cmd);
        Ok(())
    }
}

/// A remote peer scripted for one test: records traffic addressed to it
/// and, when built with file bytes, answers block requests immediately.
struct ScriptedLink {
    remote:   PeerId,
    layout:   FileLayout,
    file:     Option<Arc<Vec<u8>>>,
    handle:   HandleCell,
    requests: Mutex<Vec<(u32, Vec<u32>)>>,
    blocks:   Mutex<Vec<(u32, u32, Vec<u8>)>>,
    signals:  Mutex<Vec<Value>>,
}

impl ScriptedLink {
    fn new(remote: &str, layout: FileLayout, file: Option<Arc<Vec<u8>>>, handle: HandleCell) -> Arc<Self> {
        Arc::new(Self {
            remote: PeerId::from(remote),
            layout,
            file,
            handle,
            requests: Mutex::new(Vec::new()),
            blocks: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
        })
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerLink for ScriptedLink {
    async fn send(&self, msg: PeerMessage) -> Result<(), SwarmError> {
        match msg {
            PeerMessage::RequestBlock { piece, blocks } => {
                self.requests.lock().unwrap().push((piece, blocks.clone()));
                if let Some(file) = &self.file {
                    let handle = self.handle.lock().unwrap().clone().expect("handle unset");
                    for block in blocks {
                        let (start, end) = self.layout.block_range(piece, block);
                        let data = file[start as usize..end as usize].to_vec();
                        handle.peer_message(
                            self.remote.clone(),
                            PeerMessage::Block { piece, block, data },
                        );
                    }
                }
            }
            PeerMessage::Block { piece, block, data } => {
                self.blocks.lock().unwrap().push((piece, block, data));
            }
        }
        Ok(())
    }

    async fn deliver_signal(&self, envelope: Value) -> Result<(), SwarmError> {
        self.signals.lock().unwrap().push(envelope);
        Ok(())
    }

    fn close(&self) {}
}

#[derive(Default)]
struct TestConnector {
    links:  Mutex<HashMap<PeerId, Arc<ScriptedLink>>>,
    opened: Mutex<Vec<PeerId>>,
}

impl TestConnector {
    fn register(&self, link: Arc<ScriptedLink>) {
        let _ = self.links.lock().unwrap().insert(link.remote.clone(), link);
    }

    fn opened(&self) -> Vec<String> {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.as_str().to_string())
            .collect()
    }
}

impl PeerConnector for TestConnector {
    fn open(&self, _local: &PeerId, remote: &PeerId, _connect: bool) -> Arc<dyn PeerLink> {
        self.opened.lock().unwrap().push(remote.clone());
        self.links
            .lock()
            .unwrap()
            .get(remote)
            .expect("no scripted link registered for peer")
            .clone()
    }
}

struct TestSwarm {
    handle:    ClientHandle,
    events:    UnboundedReceiver<SwarmEvent>,
    channel:   Arc<RecordingChannel>,
    connector: Arc<TestConnector>,
    cell:      HandleCell,
}

fn start_swarm(store: Arc<dyn BlockStore>) -> TestSwarm {
    let channel = Arc::new(RecordingChannel::default());
    let connector = Arc::new(TestConnector::default());
    let cell: HandleCell = Arc::new(Mutex::new(None));
    let (client, handle, events) = SwarmClient::new(channel.clone(), connector.clone(), store);
    *cell.lock().unwrap() = Some(handle.clone());
    tokio::spawn(client.run());
    TestSwarm {
        handle,
        events,
        channel,
        connector,
        cell,
    }
}

fn test_file(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn peerid_msg(id: &str) -> Value {
    json!({"cmd": "peerid", "peerid": id})
}

fn meta_msg(size: u64) -> Value {
    json!({"cmd": "file_meta", "file_meta": {
        "size": size,
        "piece_size": PIECE,
        "block_size": BLOCK,
        "piece_cnt": size.div_ceil(PIECE),
    }})
}

fn peer_list_msg(entries: &[(&str, &str)]) -> Value {
    let mut map = serde_json::Map::new();
    for (id, bits) in entries {
        let _ = map.insert(id.to_string(), json!({"bitmap": bits}));
    }
    json!({"cmd": "peer_list", "peer_list": map})
}

async fn next_event(events: &mut UnboundedReceiver<SwarmEvent>) -> SwarmEvent {
    tokio::time::timeout(Duration::from_secs(600), events.recv())
        .await
        .expect("no event before deadline")
        .expect("event channel closed")
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("never reached: {}", what);
}

/// Full happy path: one serving peer, four pieces with a short tail,
/// pieces finish in ascending order, bytes land in the store and the
/// bitmap is pushed after every piece.
#[tokio::test(start_paused = true)]
async fn downloads_file_from_single_peer() {
    let file = Arc::new(test_file(1024 * 3 + 100));
    let layout = FileLayout::new(file.len() as u64, PIECE, BLOCK);
    let store = Arc::new(MemoryStore::new(file.len() as u64));
    let swarm = start_swarm(store.clone());
    let seeder = ScriptedLink::new("a", layout, Some(file.clone()), swarm.cell.clone());
    swarm.connector.register(seeder.clone());

    swarm.handle.signal(peerid_msg("me"));
    swarm.handle.signal(meta_msg(file.len() as u64));
    swarm.handle.signal(peer_list_msg(&[("a", "1111")]));

    let mut events = swarm.events;
    assert_eq!(
        next_event(&mut events).await,
        SwarmEvent::Ready {
            peer_id: PeerId::from("me")
        }
    );
    assert!(matches!(
        next_event(&mut events).await,
        SwarmEvent::FileMetaKnown { .. }
    ));
    assert_eq!(
        next_event(&mut events).await,
        SwarmEvent::PeerListUpdated { peers: 1 }
    );
    for piece in 0..4 {
        assert_eq!(
            next_event(&mut events).await,
            SwarmEvent::PieceFinished { piece }
        );
    }
    assert_eq!(next_event(&mut events).await, SwarmEvent::TransferFinished);

    assert_eq!(store.snapshot(), *file);
    // one batched request per piece, covering every block of it
    let requests = seeder.requests.lock().unwrap().clone();
    assert_eq!(
        requests,
        vec![
            (0, vec![0, 1, 2, 3]),
            (1, vec![0, 1, 2, 3]),
            (2, vec![0, 1, 2, 3]),
            (3, vec![0]),
        ]
    );
    assert_eq!(
        swarm.channel.bitmaps(),
        vec!["1000", "1100", "1110", "1111"]
    );
}

/// Two capable peers: the scan is deterministic and always lands on the
/// lexicographically lowest peer id.
#[tokio::test(start_paused = true)]
async fn selects_lowest_peer_id() {
    let file = Arc::new(test_file(1024));
    let layout = FileLayout::new(1024, PIECE, BLOCK);
    let store = Arc::new(MemoryStore::new(1024));
    let swarm = start_swarm(store.clone());
    let first = ScriptedLink::new("a", layout, Some(file.clone()), swarm.cell.clone());
    let second = ScriptedLink::new("b", layout, Some(file.clone()), swarm.cell.clone());
    swarm.connector.register(first.clone());
    swarm.connector.register(second.clone());

    swarm.handle.signal(peerid_msg("me"));
    swarm.handle.signal(meta_msg(1024));
    swarm.handle.signal(peer_list_msg(&[("b", "1"), ("a", "1")]));

    let mut events = swarm.events;
    loop {
        if next_event(&mut events).await == SwarmEvent::TransferFinished {
            break;
        }
    }
    assert!(first.request_count() > 0);
    assert_eq!(second.request_count(), 0);
    assert_eq!(swarm.connector.opened(), vec!["a"]);
}

/// A peer that never answers: the batch times out, its blocks return to
/// the pool, the peer leaves the admission set and is re-selected on the
/// next pass. A peer without the piece is never considered.
#[tokio::test(start_paused = true)]
async fn timeout_reassigns_blocks_and_releases_peer() {
    let layout = FileLayout::new(512, PIECE, BLOCK);
    let store = Arc::new(MemoryStore::new(512));
    let swarm = start_swarm(store.clone());
    let silent = ScriptedLink::new("a", layout, None, swarm.cell.clone());
    let empty = ScriptedLink::new("b", layout, None, swarm.cell.clone());
    swarm.connector.register(silent.clone());
    swarm.connector.register(empty.clone());

    swarm.handle.signal(peerid_msg("me"));
    swarm.handle.signal(meta_msg(512));
    swarm.handle.signal(peer_list_msg(&[("a", "1"), ("b", "0")]));

    // re-selection only works if the timeout released the peer
    wait_until("peer re-requested after timeout", || {
        silent.request_count() >= 3
    })
    .await;

    let requests = silent.requests.lock().unwrap().clone();
    for (piece, blocks) in &requests {
        assert_eq!(*piece, 0);
        assert_eq!(*blocks, vec![0, 1]);
    }
    assert_eq!(empty.request_count(), 0);
}

/// Data only counts when the block is pending on the delivering peer:
/// an unsolicited answer from another peer and an out-of-range block are
/// both dropped, and the piece is completed by the real owner.
#[tokio::test(start_paused = true)]
async fn stale_deliveries_are_dropped() {
    let file = Arc::new(test_file(512));
    let layout = FileLayout::new(512, PIECE, BLOCK);
    let store = Arc::new(MemoryStore::new(512));
    let swarm = start_swarm(store.clone());
    let silent = ScriptedLink::new("a", layout, None, swarm.cell.clone());
    swarm.connector.register(silent.clone());

    swarm.handle.signal(peerid_msg("me"));
    swarm.handle.signal(meta_msg(512));
    swarm.handle.signal(peer_list_msg(&[("a", "1")]));

    wait_until("first request sent", || silent.request_count() >= 1).await;

    // wrong peer, wrong block index, then the genuine answers
    swarm.handle.peer_message(
        PeerId::from("b"),
        PeerMessage::Block {
            piece: 0,
            block: 0,
            data: vec![0xBB; 256],
        },
    );
    swarm.handle.peer_message(
        PeerId::from("a"),
        PeerMessage::Block {
            piece: 0,
            block: 9,
            data: vec![0xCC; 256],
        },
    );
    for block in 0..2u32 {
        let (start, end) = layout.block_range(0, block);
        swarm.handle.peer_message(
            PeerId::from("a"),
            PeerMessage::Block {
                piece: 0,
                block,
                data: file[start as usize..end as usize].to_vec(),
            },
        );
    }

    let mut events = swarm.events;
    loop {
        if next_event(&mut events).await == SwarmEvent::TransferFinished {
            break;
        }
    }
    assert_eq!(store.snapshot(), *file);
}

/// The completion event is raised exactly once, no matter how many
/// triggers and duplicate deliveries arrive afterwards.
#[tokio::test(start_paused = true)]
async fn transfer_finished_fires_once() {
    let file = Arc::new(test_file(1024));
    let layout = FileLayout::new(1024, PIECE, BLOCK);
    let store = Arc::new(MemoryStore::new(1024));
    let swarm = start_swarm(store.clone());
    let seeder = ScriptedLink::new("a", layout, Some(file.clone()), swarm.cell.clone());
    swarm.connector.register(seeder.clone());

    swarm.handle.signal(peerid_msg("me"));
    swarm.handle.signal(meta_msg(1024));
    swarm.handle.signal(peer_list_msg(&[("a", "1")]));

    let mut events = swarm.events;
    loop {
        if next_event(&mut events).await == SwarmEvent::TransferFinished {
            break;
        }
    }

    // poke the loop from every direction and let any timers run dry
    swarm.handle.signal(peer_list_msg(&[("a", "1")]));
    swarm.handle.peer_message(
        PeerId::from("a"),
        PeerMessage::Block {
            piece: 0,
            block: 0,
            data: file[0..256].to_vec(),
        },
    );
    tokio::time::sleep(Duration::from_secs(5)).await;

    let mut late = Vec::new();
    while let Ok(event) = events.try_recv() {
        late.push(event);
    }
    assert!(!late.contains(&SwarmEvent::TransferFinished));
}

/// Serve side: requests are ignored until the piece is held locally;
/// afterwards each block is answered with its clipped byte range.
#[tokio::test(start_paused = true)]
async fn serves_blocks_with_clipped_ranges() {
    let file = test_file(1024 * 3 + 100);
    let layout = FileLayout::new(file.len() as u64, PIECE, BLOCK);
    let store = Arc::new(MemoryStore::from_bytes(file.clone()));
    let swarm = start_swarm(store.clone());
    let downloader = ScriptedLink::new("b", layout, None, swarm.cell.clone());
    swarm.connector.register(downloader.clone());

    swarm.handle.signal(peerid_msg("me"));
    swarm.handle.signal(meta_msg(file.len() as u64));

    // nothing is finished yet: the request must vanish without an answer
    swarm.handle.peer_message(
        PeerId::from("b"),
        PeerMessage::RequestBlock {
            piece: 0,
            blocks: vec![0],
        },
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(downloader.blocks.lock().unwrap().is_empty());

    swarm.handle.seed_local();
    wait_until("bitmap pushed after seed_local", || {
        swarm.channel.bitmaps().contains(&"1111".to_string())
    })
    .await;

    swarm.handle.peer_message(
        PeerId::from("b"),
        PeerMessage::RequestBlock {
            piece: 0,
            blocks: vec![0, 1],
        },
    );
    swarm.handle.peer_message(
        PeerId::from("b"),
        PeerMessage::RequestBlock {
            piece: 3,
            blocks: vec![0, 7],
        },
    );

    wait_until("blocks served", || downloader.blocks.lock().unwrap().len() >= 3).await;
    let mut served = downloader.blocks.lock().unwrap().clone();
    served.sort_by_key(|(piece, block, _)| (*piece, *block));
    assert_eq!(served.len(), 3); // block 7 of the tail piece does not exist
    assert_eq!(served[0], (0, 0, file[0..256].to_vec()));
    assert_eq!(served[1], (0, 1, file[256..512].to_vec()));
    // the tail block clips to 100 bytes
    assert_eq!(served[2], (3, 0, file[3072..3172].to_vec()));
}

/// A failed finalize write surfaces a storage failure, re-queues the
/// piece and the transfer still completes on the retry.
#[tokio::test(start_paused = true)]
async fn storage_failure_requeues_piece() {
    struct FlakyStore {
        inner:    MemoryStore,
        failures: Mutex<u32>,
    }

    #[async_trait]
    impl BlockStore for FlakyStore {
        async fn read(&self, start: u64, end: u64) -> Result<Bytes, SwarmError> {
            self.inner.read(start, end).await
        }
        async fn write(&self, data: Bytes, offset: u64) -> Result<(), SwarmError> {
            {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(SwarmError::StorageError("disk on fire".into()));
                }
            }
            self.inner.write(data, offset).await
        }
    }

    let file = Arc::new(test_file(512));
    let layout = FileLayout::new(512, PIECE, BLOCK);
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(512),
        failures: Mutex::new(1),
    });
    let swarm = start_swarm(store.clone());
    let seeder = ScriptedLink::new("a", layout, Some(file.clone()), swarm.cell.clone());
    swarm.connector.register(seeder.clone());

    swarm.handle.signal(peerid_msg("me"));
    swarm.handle.signal(meta_msg(512));
    swarm.handle.signal(peer_list_msg(&[("a", "1")]));

    let mut events = swarm.events;
    let mut saw_failure = false;
    let mut finished_pieces = Vec::new();
    loop {
        match next_event(&mut events).await {
            SwarmEvent::StorageFailure { piece, .. } => {
                assert_eq!(piece, 0);
                saw_failure = true;
            }
            SwarmEvent::PieceFinished { piece } => finished_pieces.push(piece),
            SwarmEvent::TransferFinished => break,
            _ => {}
        }
    }
    assert!(saw_failure);
    assert_eq!(finished_pieces, vec![0]);
    assert!(seeder.request_count() >= 2);
    assert_eq!(store.inner.snapshot(), *file);
}

/// A dropped link counts as an instant timeout: pending blocks return to
/// the pool and the next pass dials the peer again.
#[tokio::test(start_paused = true)]
async fn disconnect_reclaims_pending_blocks() {
    let layout = FileLayout::new(512, PIECE, BLOCK);
    let store = Arc::new(MemoryStore::new(512));
    let swarm = start_swarm(store.clone());
    let silent = ScriptedLink::new("a", layout, None, swarm.cell.clone());
    swarm.connector.register(silent.clone());

    swarm.handle.signal(peerid_msg("me"));
    swarm.handle.signal(meta_msg(512));
    swarm.handle.signal(peer_list_msg(&[("a", "1")]));

    wait_until("first request sent", || silent.request_count() >= 1).await;
    swarm.handle.peer_disconnected(PeerId::from("a"));
    wait_until("peer redialed after disconnect", || {
        silent.request_count() >= 2
    })
    .await;
    assert!(swarm.connector.opened().len() >= 2);
}

/// Relayed signaling envelopes go to the addressed link, not the client.
#[tokio::test(start_paused = true)]
async fn relay_envelopes_reach_their_link() {
    let layout = FileLayout::new(512, PIECE, BLOCK);
    let store = Arc::new(MemoryStore::new(512));
    let swarm = start_swarm(store.clone());
    let link = ScriptedLink::new("c", layout, None, swarm.cell.clone());
    swarm.connector.register(link.clone());

    swarm.handle.signal(peerid_msg("me"));
    swarm
        .handle
        .signal(json!({"type": "offer", "origin": "c", "sdp": "v=0"}));

    wait_until("envelope delivered", || link.signals.lock().unwrap().len() == 1).await;
    let signals = link.signals.lock().unwrap();
    assert_eq!(signals[0]["sdp"], "v=0");
}

/// Only the first file_meta counts; a second one is ignored wholesale.
#[tokio::test(start_paused = true)]
async fn file_meta_first_wins() {
    let file = Arc::new(test_file(512));
    let layout = FileLayout::new(512, PIECE, BLOCK);
    let store = Arc::new(MemoryStore::new(512));
    let swarm = start_swarm(store.clone());
    let seeder = ScriptedLink::new("a", layout, Some(file.clone()), swarm.cell.clone());
    swarm.connector.register(seeder.clone());

    swarm.handle.signal(peerid_msg("me"));
    swarm.handle.signal(meta_msg(512));
    swarm.handle.signal(meta_msg(1024 * 64));
    swarm.handle.signal(peer_list_msg(&[("a", "1")]));

    let mut events = swarm.events;
    let mut meta_events = 0;
    loop {
        match next_event(&mut events).await {
            SwarmEvent::FileMetaKnown { meta } => {
                meta_events += 1;
                assert_eq!(meta.size, 512);
            }
            SwarmEvent::TransferFinished => break,
            _ => {}
        }
    }
    assert_eq!(meta_events, 1);
    assert_eq!(store.snapshot(), *file);
}
