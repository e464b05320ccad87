use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::client::{ClientHandle, ClientMsg};
use crate::layout::FileLayout;
use crate::protocol::Bitmap;
use crate::store::BlockStore;

/// Buffers the active piece's blocks and turns them into durable bytes.
///
/// Blocks arrive in any order and are slotted by index. Finalizing
/// concatenates the slots, hands the span to the [`BlockStore`] from a
/// spawned task, and reports the outcome back into the client loop; a
/// piece only counts as finished once its write has completed.
pub struct PieceAssembler {
    layout:   FileLayout,
    store:    Arc<dyn BlockStore>,
    chunks:   Vec<Option<Bytes>>,
    finished: Bitmap,
}

impl PieceAssembler {
    pub fn new(layout: FileLayout, store: Arc<dyn BlockStore>) -> Self {
        Self {
            layout,
            store,
            chunks: Vec::new(),
            finished: Bitmap::new(layout.piece_count as usize),
        }
    }

    /// Allocates buffer slots for a newly activated piece, discarding
    /// whatever a previously abandoned piece left behind.
    pub fn begin_piece(&mut self, piece: u32) {
        self.chunks = vec![None; self.layout.blocks_in_piece(piece) as usize];
    }

    /// Buffers the payload of one block of the active piece.
    pub fn store_block(&mut self, piece: u32, block: u32, data: Bytes) {
        match self.chunks.get_mut(block as usize) {
            Some(slot) => {
                if slot.is_some() {
                    debug!(piece, block, "block buffered twice, keeping first");
                    return;
                }
                *slot = Some(data);
            }
            None => warn!(piece, block, "block index outside active piece"),
        }
    }

    /// Concatenates the buffered blocks and writes them at the piece's
    /// byte offset. The write runs off-loop; its completion re-enters the
    /// loop as `PieceWritten` / `PieceWriteFailed`.
    pub fn finalize(&mut self, piece: u32, handle: &ClientHandle) {
        let chunks = std::mem::take(&mut self.chunks);
        let mut buf = BytesMut::with_capacity(self.layout.piece_len(piece) as usize);
        for (block, chunk) in chunks.into_iter().enumerate() {
            let Some(chunk) = chunk else {
                warn!(piece, block, "finalize with missing block, dropping piece");
                handle.send(ClientMsg::PieceWriteFailed {
                    piece,
                    reason: format!("block {} missing from buffer", block),
                });
                return;
            };
            buf.extend_from_slice(&chunk);
        }

        let offset = self.layout.piece_offset(piece);
        let store = self.store.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            match store.write(buf.freeze(), offset).await {
                Ok(()) => handle.send(ClientMsg::PieceWritten { piece }),
                Err(e) => handle.send(ClientMsg::PieceWriteFailed {
                    piece,
                    reason: format!("{}", e),
                }),
            }
        });
    }

    pub fn mark_finished(&mut self, piece: u32) {
        self.finished.set(piece);
    }

    /// Flags every piece as already present, for a client seeding a
    /// store that holds the complete file.
    pub fn mark_all_finished(&mut self) {
        self.finished.set_all();
    }

    pub fn is_finished(&self, piece: u32) -> bool {
        self.finished.has(piece)
    }

    pub fn all_finished(&self) -> bool {
        self.finished.is_complete()
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.finished
    }
}
