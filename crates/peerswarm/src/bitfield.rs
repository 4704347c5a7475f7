// A thread-safe bit set over piece indices.
//
// Bits are MSB-first within each byte, as on the wire: piece 0 is 0x80 of byte 0.
// Mutations are single atomic read-modify-write operations on the containing byte, so
// concurrent mark/unmark calls never lose an update. Reads are relaxed loads and may be
// slightly stale.

use std::sync::atomic::{AtomicU8, Ordering};

use bytes::BufMut;

use crate::{
    error::{Error, Result},
    piece_selection::ByteView,
    type_aliases::BF,
};

/// Mask of the bits in the last byte that correspond to real pieces.
pub(crate) const fn last_byte_mask(num_pieces: u32) -> u8 {
    match num_pieces % 8 {
        0 => 0xff,
        rem => !(0xffu8 >> rem),
    }
}

pub(crate) const fn bitfield_bytes(num_pieces: u32) -> usize {
    num_pieces.div_ceil(8) as usize
}

const fn bit(index: u32) -> (usize, u8) {
    ((index / 8) as usize, 0x80u8 >> (index % 8))
}

pub struct Bitfield {
    bytes: Box<[AtomicU8]>,
    num_pieces: u32,
}

impl Bitfield {
    /// A bitfield with no pieces set.
    pub fn new(num_pieces: u32) -> Self {
        Self {
            bytes: (0..bitfield_bytes(num_pieces))
                .map(|_| AtomicU8::new(0))
                .collect(),
            num_pieces,
        }
    }

    /// Adopt existing bytes, e.g. restored from disk. Bits past `num_pieces` are cleared.
    pub fn from_bytes(num_pieces: u32, bytes: &[u8]) -> Result<Self> {
        let expected = bitfield_bytes(num_pieces);
        if bytes.len() != expected {
            return Err(Error::BitfieldLength {
                expected,
                received: bytes.len(),
            });
        }
        let bf = Self::new(num_pieces);
        bf.store_masked(bytes);
        Ok(bf)
    }

    fn store_masked(&self, bytes: &[u8]) {
        let mask = last_byte_mask(self.num_pieces);
        let last = self.bytes.len().saturating_sub(1);
        for (i, (dst, src)) in self.bytes.iter().zip(bytes).enumerate() {
            let v = if i == last { *src & mask } else { *src };
            dst.store(v, Ordering::Relaxed);
        }
    }

    /// Check a Bitfield message payload for `num_pieces` pieces: exactly the right size
    /// and no bits set past the last piece.
    pub fn validate_message(num_pieces: u32, bytes: &[u8]) -> Result<()> {
        let expected = bitfield_bytes(num_pieces);
        if bytes.len() != expected {
            return Err(Error::BitfieldLength {
                expected,
                received: bytes.len(),
            });
        }
        if let Some(last) = bytes.last()
            && last & !last_byte_mask(num_pieces) != 0
        {
            return Err(Error::BitfieldTrailingBits);
        }
        Ok(())
    }

    /// Replace the contents with `bytes` as received in a Bitfield message. Nothing
    /// changes unless [`Self::validate_message`] accepts the payload.
    pub fn overwrite_from_message(&self, bytes: &[u8]) -> Result<()> {
        Self::validate_message(self.num_pieces, bytes)?;
        self.store_masked(bytes);
        Ok(())
    }

    pub fn num_pieces(&self) -> u32 {
        self.num_pieces
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    fn check_index(&self, index: u32) -> Result<(usize, u8)> {
        if index >= self.num_pieces {
            return Err(Error::InvalidPieceIndex(index));
        }
        Ok(bit(index))
    }

    pub fn has_piece(&self, index: u32) -> Result<bool> {
        let (byte, mask) = self.check_index(index)?;
        Ok(self.bytes[byte].load(Ordering::Relaxed) & mask != 0)
    }

    /// Set the bit. Returns true if it was previously unset.
    pub fn mark_have(&self, index: u32) -> Result<bool> {
        let (byte, mask) = self.check_index(index)?;
        let prev = self.bytes[byte].fetch_or(mask, Ordering::AcqRel);
        Ok(prev & mask == 0)
    }

    /// Clear the bit. Returns true if it was previously set.
    pub fn unmark_have(&self, index: u32) -> Result<bool> {
        let (byte, mask) = self.check_index(index)?;
        let prev = self.bytes[byte].fetch_and(!mask, Ordering::AcqRel);
        Ok(prev & mask != 0)
    }

    pub fn has_all(&self) -> bool {
        let Some((last, rest)) = self.bytes.split_last() else {
            return true;
        };
        let mask = last_byte_mask(self.num_pieces);
        rest.iter().all(|b| b.load(Ordering::Relaxed) == 0xff)
            && last.load(Ordering::Relaxed) & mask == mask
    }

    pub fn has_none(&self) -> bool {
        self.bytes.iter().all(|b| b.load(Ordering::Relaxed) == 0)
    }

    pub fn count_ones(&self) -> u32 {
        self.bytes
            .iter()
            .map(|b| b.load(Ordering::Relaxed).count_ones())
            .sum()
    }

    /// Fraction of pieces set. An empty bitfield is complete.
    pub fn completion_ratio(&self) -> f64 {
        if self.num_pieces == 0 {
            return 1.;
        }
        self.count_ones() as f64 / self.num_pieces as f64
    }

    pub fn load_byte(&self, index: usize) -> u8 {
        self.bytes
            .get(index)
            .map(|b| b.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn write_to(&self, out: &mut impl BufMut) {
        for b in self.bytes.iter() {
            out.put_u8(b.load(Ordering::Relaxed));
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes.len());
        self.write_to(&mut out);
        out
    }

    pub fn to_bitvec(&self) -> BF {
        let mut bf = BF::from_vec(self.to_bytes());
        bf.truncate(self.num_pieces as usize);
        bf
    }

    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.num_pieces).filter(|i| {
            let (byte, mask) = bit(*i);
            self.bytes[byte].load(Ordering::Relaxed) & mask != 0
        })
    }
}

impl ByteView for Bitfield {
    fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    fn byte(&self, index: usize) -> u8 {
        self.load_byte(index)
    }
}

impl std::fmt::Debug for Bitfield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitfield")
            .field("_ones", &self.count_ones())
            .field("_len", &self.num_pieces)
            .finish()
    }
}
