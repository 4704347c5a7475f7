// Piece assembly.
//
// Blocks of one piece arrive in any order, possibly from different peers over time. The
// Assembler slots them by offset, and once every slot is filled hands them over as an
// AssembledPiece, which hashes and copies the piece without ever gluing it into one
// contiguous allocation.

use std::time::Instant;

use buffers::PooledBuf;
use peerswarm_core::{Id20, PeerId};
use sha1w::sha1_of_parts;
use tracing::trace;

/// One received block, on loan from the inbound block pool.
pub struct Block {
    pub peer_id: PeerId,
    pub piece_index: u32,
    pub begin: u32,
    pub data: PooledBuf,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("peer_id", &self.peer_id)
            .field("piece_index", &self.piece_index)
            .field("begin", &self.begin)
            .field("len", &self.data.len())
            .finish()
    }
}

pub struct Assembler {
    piece_index: u32,
    piece_length: u32,
    block_size: u32,
    slots: Vec<Option<PooledBuf>>,
    received: u32,
    completed: bool,
}

impl Assembler {
    pub fn new(piece_index: u32, piece_length: u32, block_size: u32) -> Self {
        let count = piece_length.div_ceil(block_size.max(1));
        Self {
            piece_index,
            piece_length,
            block_size: block_size.max(1),
            slots: (0..count).map(|_| None).collect(),
            received: 0,
            completed: false,
        }
    }

    pub fn piece_index(&self) -> u32 {
        self.piece_index
    }

    pub fn expected_block_count(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn received_count(&self) -> u32 {
        self.received
    }

    fn expected_block_len(&self, slot: u32) -> u32 {
        let begin = slot * self.block_size;
        (self.piece_length - begin).min(self.block_size)
    }

    /// Store the block in its slot. Returns false, dropping the block back to its pool,
    /// if it doesn't belong here: wrong piece, unaligned or out-of-range offset, wrong
    /// size, slot already filled, or the assembler was already completed.
    pub fn try_add_block(&mut self, block: Block) -> bool {
        if self.completed || block.piece_index != self.piece_index {
            return false;
        }
        if block.begin % self.block_size != 0 {
            return false;
        }
        let slot = block.begin / self.block_size;
        if slot >= self.expected_block_count() {
            return false;
        }
        if block.data.len() as u32 != self.expected_block_len(slot) {
            trace!(
                piece = self.piece_index,
                slot,
                len = block.data.len(),
                "block of unexpected size"
            );
            return false;
        }
        let entry = &mut self.slots[slot as usize];
        if entry.is_some() {
            return false;
        }
        *entry = Some(block.data);
        self.received += 1;
        true
    }

    /// All slots filled. Says nothing about the hash.
    pub fn is_complete(&self) -> bool {
        !self.completed && self.received == self.expected_block_count()
    }

    /// Move the blocks out. The assembler is empty afterwards and accepts nothing else.
    pub fn complete(&mut self) -> Option<AssembledPiece> {
        if !self.is_complete() {
            return None;
        }
        self.completed = true;
        let blocks = std::mem::take(&mut self.slots)
            .into_iter()
            .collect::<Option<Vec<_>>>()?;
        Some(AssembledPiece {
            piece_index: self.piece_index,
            len: self.piece_length,
            blocks,
        })
    }
}

/// A full piece, as the ordered list of its blocks.
pub struct AssembledPiece {
    piece_index: u32,
    len: u32,
    blocks: Vec<PooledBuf>,
}

impl AssembledPiece {
    pub fn piece_index(&self) -> u32 {
        self.piece_index
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn verify(&self, expected: &Id20) -> bool {
        let digest = sha1_of_parts(self.blocks.iter().map(|b| &b[..]));
        digest == expected.0
    }

    /// Copy bytes starting at `offset` within the piece into `out`. Returns how many were
    /// copied, which is less than `out.len()` only when the piece ends first.
    pub fn write_range_to(&self, offset: u32, out: &mut [u8]) -> usize {
        let mut skip = offset as usize;
        let mut written = 0;
        for block in self.blocks.iter() {
            if written == out.len() {
                break;
            }
            if skip >= block.len() {
                skip -= block.len();
                continue;
            }
            let src = &block[skip..];
            skip = 0;
            let n = src.len().min(out.len() - written);
            out[written..written + n].copy_from_slice(&src[..n]);
            written += n;
        }
        written
    }

    pub fn write_to(&self, mut w: impl std::io::Write) -> std::io::Result<()> {
        for block in self.blocks.iter() {
            w.write_all(block)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for AssembledPiece {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssembledPiece")
            .field("piece_index", &self.piece_index)
            .field("len", &self.len)
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

/// An Assembler that only takes blocks from the peer it's currently assigned to.
/// The owner changes when the piece gets re-reserved for a different peer.
pub struct PieceBuffer {
    owner: PeerId,
    assembler: Assembler,
    created_at: Instant,
}

impl PieceBuffer {
    pub fn new(owner: PeerId, piece_index: u32, piece_length: u32, block_size: u32) -> Self {
        Self {
            owner,
            assembler: Assembler::new(piece_index, piece_length, block_size),
            created_at: Instant::now(),
        }
    }

    pub fn owner(&self) -> PeerId {
        self.owner
    }

    pub fn set_owner(&mut self, owner: PeerId) {
        self.owner = owner;
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn assembler(&self) -> &Assembler {
        &self.assembler
    }

    pub fn try_add_block(&mut self, block: Block) -> bool {
        if block.peer_id != self.owner {
            return false;
        }
        self.assembler.try_add_block(block)
    }

    pub fn is_complete(&self) -> bool {
        self.assembler.is_complete()
    }

    pub fn complete(&mut self) -> Option<AssembledPiece> {
        self.assembler.complete()
    }
}
