use anyhow::{Context, bail};
use parking_lot::RwLock;

use crate::{assembler::AssembledPiece, storage::TorrentStorage};

/// The whole torrent in one buffer. Used for seeding in tests and small transfers.
pub struct InMemoryStorage {
    data: RwLock<Vec<u8>>,
}

impl InMemoryStorage {
    pub fn new(len: u64) -> anyhow::Result<Self> {
        let len = usize::try_from(len).context("torrent too large to keep in memory")?;
        Ok(Self {
            data: RwLock::new(vec![0; len]),
        })
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    fn range(&self, offset: u64, len: usize) -> anyhow::Result<std::ops::Range<usize>> {
        let total = self.data.read().len();
        let start = usize::try_from(offset)?;
        let end = start.checked_add(len).context("offset overflow")?;
        if end > total {
            bail!("range {start}..{end} out of bounds, storage length is {total}");
        }
        Ok(start..end)
    }
}

impl TorrentStorage for InMemoryStorage {
    fn write_piece(&self, offset: u64, piece: &AssembledPiece) -> anyhow::Result<()> {
        let range = self.range(offset, piece.len() as usize)?;
        let mut g = self.data.write();
        let written = piece.write_range_to(0, &mut g[range]);
        if written != piece.len() as usize {
            bail!("short piece write: {written} of {}", piece.len());
        }
        Ok(())
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data.read()[range]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use buffers::BufferPool;
    use peerswarm_core::Id20;

    use super::*;
    use crate::assembler::{Assembler, Block};

    #[test]
    fn test_write_and_read_back() {
        let pool = BufferPool::new(8, 8);
        let s = InMemoryStorage::new(16).unwrap();

        let mut a = Assembler::new(1, 6, 4);
        for (begin, data) in [(0u32, &b"abcd"[..]), (4, &b"ef"[..])] {
            assert!(a.try_add_block(Block {
                peer_id: Id20::default(),
                piece_index: 1,
                begin,
                data: pool.get_filled(data),
            }));
        }
        let piece = a.complete().unwrap();
        s.write_piece(8, &piece).unwrap();
        assert!(s.write_piece(12, &piece).is_err());

        let mut buf = [0u8; 6];
        s.read(8, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdef");
        assert!(s.read(12, &mut buf).is_err());
        assert_eq!(&s.to_vec()[..8], &[0u8; 8]);
    }
}
