use crate::{
    constants::BLOCK_SIZE,
    error::{Error, Result},
};

const fn is_power_of_two(x: u64) -> bool {
    (x != 0) && ((x & (x - 1)) == 0)
}

pub const fn ceil_div_u64(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}

pub const fn last_element_size_u64(total: u64, element_size: u64) -> u64 {
    let rem = total % element_size;
    if rem == 0 {
        return element_size;
    }
    rem
}

/// A piece index that was checked against [`Lengths`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValidPieceIndex(u32);

impl std::fmt::Display for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl ValidPieceIndex {
    pub const fn get(&self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub piece_index: ValidPieceIndex,
    pub block_index: u32,
    pub offset: u32,
    pub size: u32,
}

/// Geometry of a torrent: how total bytes split into pieces, and pieces into blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lengths {
    block_length: u32,
    total_length: u64,
    piece_length: u32,
    last_piece_id: u32,
    last_piece_length: u32,
    max_blocks_per_piece: u32,
}

impl Lengths {
    pub fn new(total_length: u64, piece_length: u32, block_length: Option<u32>) -> Result<Self> {
        let block_length = block_length.unwrap_or(BLOCK_SIZE);
        if total_length == 0 {
            return Err(Error::ZeroLength);
        }
        if piece_length == 0 {
            return Err(Error::ZeroPieceLength);
        }
        if !is_power_of_two(block_length as u64) {
            return Err(Error::BlockLengthNotPowerOfTwo(block_length));
        }
        // Short single-piece torrents are fine, the block just gets clamped.
        let block_length = block_length.min(piece_length);
        let total_pieces = ceil_div_u64(total_length, piece_length as u64);
        let total_pieces: u32 = total_pieces.try_into().map_err(|_| Error::TooManyPieces)?;
        Ok(Self {
            block_length,
            piece_length,
            total_length,
            max_blocks_per_piece: ceil_div_u64(piece_length as u64, block_length as u64) as u32,
            last_piece_id: total_pieces - 1,
            last_piece_length: last_element_size_u64(total_length, piece_length as u64) as u32,
        })
    }

    pub const fn piece_bitfield_bytes(&self) -> usize {
        ceil_div_u64(self.total_pieces() as u64, 8) as usize
    }
    pub const fn total_length(&self) -> u64 {
        self.total_length
    }
    pub const fn validate_piece_index(&self, index: u32) -> Option<ValidPieceIndex> {
        if index > self.last_piece_id {
            return None;
        }
        Some(ValidPieceIndex(index))
    }
    pub fn try_validate_piece_index(&self, index: u32) -> Result<ValidPieceIndex> {
        self.validate_piece_index(index)
            .ok_or(Error::InvalidPieceIndex(index))
    }
    pub const fn default_piece_length(&self) -> u32 {
        self.piece_length
    }
    pub const fn default_block_length(&self) -> u32 {
        self.block_length
    }
    pub const fn default_max_blocks_per_piece(&self) -> u32 {
        self.max_blocks_per_piece
    }
    pub const fn last_piece_id(&self) -> ValidPieceIndex {
        ValidPieceIndex(self.last_piece_id)
    }
    pub const fn total_pieces(&self) -> u32 {
        self.last_piece_id + 1
    }
    pub const fn piece_length(&self, index: ValidPieceIndex) -> u32 {
        if index.0 == self.last_piece_id {
            return self.last_piece_length;
        }
        self.piece_length
    }
    pub const fn piece_offset(&self, index: ValidPieceIndex) -> u64 {
        index.0 as u64 * self.piece_length as u64
    }
    pub const fn blocks_per_piece(&self, index: ValidPieceIndex) -> u32 {
        ceil_div_u64(self.piece_length(index) as u64, self.block_length as u64) as u32
    }

    pub fn block_size(&self, piece_index: ValidPieceIndex, block_index: u32) -> Option<u32> {
        if block_index >= self.blocks_per_piece(piece_index) {
            return None;
        }
        let offset = block_index * self.block_length;
        Some(std::cmp::min(
            self.block_length,
            self.piece_length(piece_index) - offset,
        ))
    }

    pub fn iter_block_infos(&self, index: ValidPieceIndex) -> impl Iterator<Item = BlockInfo> {
        let mut remaining = self.piece_length(index);
        let block_size = self.block_length;
        (0u32..).scan(0, move |offset, idx| {
            if remaining == 0 {
                return None;
            }
            let s = std::cmp::min(remaining, block_size);
            let result = BlockInfo {
                piece_index: index,
                block_index: idx,
                size: s,
                offset: *offset,
            };
            *offset += s;
            remaining -= s;
            Some(result)
        })
    }

    /// Validate a (piece, begin, length) triple received in a Piece message.
    pub fn block_info_from_received_data(
        &self,
        index: u32,
        begin: u32,
        len: u32,
    ) -> Option<BlockInfo> {
        let piece_index = self.validate_piece_index(index)?;
        if begin % self.block_length != 0 {
            return None;
        }
        let block_index = begin / self.block_length;
        let expected = self.block_size(piece_index, block_index)?;
        if expected != len {
            return None;
        }
        Some(BlockInfo {
            piece_index,
            block_index,
            offset: begin,
            size: len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_lengths() -> Lengths {
        Lengths::new(1174243328, 262144, None).unwrap()
    }

    #[test]
    fn test_total_pieces() {
        let l = make_lengths();
        assert_eq!(l.total_pieces(), 4480);
        assert_eq!(l.piece_bitfield_bytes(), 560);
    }

    #[test]
    fn test_piece_length() {
        let l = make_lengths();
        let p = l.validate_piece_index(4479).unwrap();
        assert_eq!(l.piece_length(l.validate_piece_index(0).unwrap()), 262144);
        assert_eq!(l.piece_length(p), 100352);
        assert!(l.validate_piece_index(4480).is_none());
        assert_eq!(
            l.try_validate_piece_index(4480),
            Err(Error::InvalidPieceIndex(4480))
        );
    }

    #[test]
    fn test_blocks_in_piece() {
        let l = make_lengths();
        let p = l.validate_piece_index(4479).unwrap();
        assert_eq!(l.blocks_per_piece(l.validate_piece_index(0).unwrap()), 16);
        assert_eq!(l.blocks_per_piece(p), 7);
        assert_eq!(l.block_size(p, 0), Some(16384));
        assert_eq!(l.block_size(p, 6), Some(2048));
        assert_eq!(l.block_size(p, 7), None);
    }

    #[test]
    fn test_block_infos() {
        let l = make_lengths();
        let p = l.validate_piece_index(4479).unwrap();

        let mut it = l.iter_block_infos(p);
        let first = it.next().unwrap();
        let last = it.last().unwrap();

        assert_eq!(
            first,
            BlockInfo {
                piece_index: p,
                block_index: 0,
                size: 16384,
                offset: 0,
            }
        );
        assert_eq!(
            last,
            BlockInfo {
                piece_index: p,
                block_index: 6,
                size: 2048,
                offset: 98304,
            }
        );
    }

    #[test]
    fn test_received_data_validation() {
        let l = make_lengths();
        assert!(l.block_info_from_received_data(0, 0, 16384).is_some());
        assert!(l.block_info_from_received_data(0, 1, 16384).is_none());
        assert!(l.block_info_from_received_data(0, 0, 100).is_none());
        assert!(l.block_info_from_received_data(4479, 98304, 2048).is_some());
        assert!(l.block_info_from_received_data(4479, 98304, 16384).is_none());
        assert!(l.block_info_from_received_data(4480, 0, 16384).is_none());
    }

    #[test]
    fn test_small_torrent_clamps_block() {
        let l = Lengths::new(100, 1024, None).unwrap();
        assert_eq!(l.total_pieces(), 1);
        assert_eq!(l.default_block_length(), 1024);
        let p = l.validate_piece_index(0).unwrap();
        assert_eq!(l.piece_length(p), 100);
        assert_eq!(l.blocks_per_piece(p), 1);
    }

    #[test]
    fn test_invalid_lengths() {
        assert_eq!(Lengths::new(0, 1024, None), Err(Error::ZeroLength));
        assert_eq!(Lengths::new(10, 0, None), Err(Error::ZeroPieceLength));
        assert_eq!(
            Lengths::new(10, 1024, Some(1000)),
            Err(Error::BlockLengthNotPowerOfTwo(1000))
        );
    }
}
