use std::{collections::HashMap, sync::Arc, sync::atomic::Ordering};

use anyhow::Context;
use tracing::{debug, info, trace, warn};

use crate::{
    assembler::{AssembledPiece, Block, PieceBuffer},
    torrent::TorrentSession,
    type_aliases::BlockRx,
};

enum Outcome {
    Verified,
    HashMismatch,
}

impl TorrentSession {
    pub(super) async fn task_block_consumer(self: Arc<Self>, mut rx: BlockRx) -> anyhow::Result<()> {
        let mut buffers: HashMap<u32, PieceBuffer> = HashMap::new();
        while let Some(block) = rx.recv().await {
            let Some(piece) = self.add_block(&mut buffers, block) else {
                continue;
            };
            self.finish_piece(piece).await;
        }
        Ok(())
    }

    /// Slot the block into its piece buffer. Returns the piece once all its blocks are in.
    fn add_block(
        &self,
        buffers: &mut HashMap<u32, PieceBuffer>,
        block: Block,
    ) -> Option<AssembledPiece> {
        let index = block.piece_index;
        let Some(valid) = self.lengths.validate_piece_index(index) else {
            debug!(piece = index, "block for a piece that doesn't exist");
            return None;
        };
        if self.have.has_piece(index).unwrap_or(true) {
            trace!(piece = index, "block for a piece we already have");
            return None;
        }
        let Some(owner) = self.piece_owners.get(&index).map(|o| *o) else {
            trace!(piece = index, "block for a piece nobody was asked for");
            return None;
        };

        let buf = buffers.entry(index).or_insert_with(|| {
            PieceBuffer::new(
                owner,
                index,
                self.lengths.piece_length(valid),
                self.lengths.default_block_length(),
            )
        });
        if buf.owner() != owner {
            trace!(piece = index, old = ?buf.owner(), new = ?owner, "piece changed hands");
            buf.set_owner(owner);
        }

        let from = block.peer_id;
        let len = block.data.len() as u64;
        if !buf.try_add_block(block) {
            trace!(piece = index, ?from, "block rejected");
            if let Some(p) = self.peers.get(&from) {
                p.client
                    .counters()
                    .discarded_blocks
                    .fetch_add(1, Ordering::Relaxed);
            }
            return None;
        }
        self.counters.fetched_bytes.fetch_add(len, Ordering::Relaxed);
        if !buf.is_complete() {
            return None;
        }
        let mut buf = buffers.remove(&index)?;
        let started = buf.created_at();
        let piece = buf.complete()?;
        trace!(piece = index, took = ?started.elapsed(), "piece assembled");
        Some(piece)
    }

    async fn finish_piece(self: &Arc<Self>, piece: AssembledPiece) {
        let index = piece.piece_index();
        let len = piece.len();
        let started = std::time::Instant::now();

        let outcome = {
            let session = self.clone();
            tokio::task::spawn_blocking(move || -> anyhow::Result<Outcome> {
                let valid = session
                    .lengths
                    .validate_piece_index(index)
                    .context("bug: invalid piece index")?;
                let expected = session
                    .hashes
                    .get(valid)
                    .context("bug: no hash for piece")?;
                if !piece.verify(&expected) {
                    return Ok(Outcome::HashMismatch);
                }
                session
                    .storage
                    .write_piece(session.lengths.piece_offset(valid), &piece)
                    .with_context(|| format!("error writing piece {index}"))?;
                Ok(Outcome::Verified)
            })
            .await
        };

        self.piece_owners.remove(&index);
        self.reservations.release(index);

        match outcome {
            Ok(Ok(Outcome::Verified)) => {
                if let Ok(true) = self.have.mark_have(index) {
                    self.counters.on_piece_verified(len, started.elapsed());
                    debug!(piece = index, "piece verified");
                    self.transmit_haves(index);
                }
            }
            Ok(Ok(Outcome::HashMismatch)) => {
                self.counters.hash_failures.fetch_add(1, Ordering::Relaxed);
                warn!(piece = index, "hash mismatch, piece will be downloaded again");
            }
            Ok(Err(e)) => warn!(piece = index, "{e:#}"),
            Err(e) => warn!(piece = index, "verification task failed: {e:#}"),
        }

        self.piece_done.notify_waiters();
        if self.is_finished() {
            info!("torrent finished");
            self.finished.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use buffers::BufferPool;
    use peerswarm_core::Id20;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        storage::InMemoryStorage,
        tests::test_util::{TestTorrent, random_bytes},
    };

    #[tokio::test]
    async fn test_only_accepted_blocks_count_as_fetched() {
        let torrent = TestTorrent::new(random_bytes(64 * 1024, 11), 32768);
        let storage = Arc::new(InMemoryStorage::new(torrent.lengths.total_length()).unwrap());
        let session = TorrentSession::new(
            Id20::new([1; 20]),
            torrent.leech(storage, Default::default()),
            Default::default(),
            Default::default(),
            CancellationToken::new(),
        )
        .unwrap();
        let (owner, other) = (Id20::new([2; 20]), Id20::new([3; 20]));
        session.piece_owners.insert(0, owner);

        let pool = BufferPool::new(16384, 4);
        let block = |peer_id, begin: u32| Block {
            peer_id,
            piece_index: 0,
            begin,
            data: pool.get_filled(&torrent.data[begin as usize..begin as usize + 16384]),
        };
        let fetched = || session.stats().fetched_bytes;
        let mut buffers = HashMap::new();

        // Not the peer the piece was asked from.
        assert!(session.add_block(&mut buffers, block(other, 0)).is_none());
        assert_eq!(fetched(), 0);

        assert!(session.add_block(&mut buffers, block(owner, 0)).is_none());
        assert_eq!(fetched(), 16384);

        // Same slot again.
        assert!(session.add_block(&mut buffers, block(owner, 0)).is_none());
        assert_eq!(fetched(), 16384);

        let piece = session.add_block(&mut buffers, block(owner, 16384)).unwrap();
        assert_eq!(piece.len(), 32768);
        assert_eq!(fetched(), 32768);
        session.shutdown();
    }
}
