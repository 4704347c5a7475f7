use crate::{
    constants::SHA1_LEN,
    error::{Error, Result},
    hash_id::Id20,
    lengths::{Lengths, ValidPieceIndex},
};

/// Expected SHA-1 of every piece, as the flat concatenation found in torrent metadata.
#[derive(Clone)]
pub struct PieceHashes {
    flat: Box<[u8]>,
}

impl PieceHashes {
    pub fn new(flat: impl Into<Box<[u8]>>, lengths: &Lengths) -> Result<Self> {
        let flat = flat.into();
        if flat.len() % SHA1_LEN != 0 {
            return Err(Error::PieceHashesNotMultipleOf20(flat.len()));
        }
        let count = flat.len() / SHA1_LEN;
        if count != lengths.total_pieces() as usize {
            return Err(Error::PieceHashesCountMismatch {
                expected: lengths.total_pieces(),
                actual: count,
            });
        }
        Ok(Self { flat })
    }

    pub fn len(&self) -> usize {
        self.flat.len() / SHA1_LEN
    }

    pub fn is_empty(&self) -> bool {
        self.flat.is_empty()
    }

    pub fn get(&self, index: ValidPieceIndex) -> Option<Id20> {
        let start = index.get() as usize * SHA1_LEN;
        Id20::from_slice(self.flat.get(start..start + SHA1_LEN)?)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.flat
    }
}

impl std::fmt::Debug for PieceHashes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{} piece hashes>", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get() {
        let l = Lengths::new(3 * 1024, 1024, None).unwrap();
        let mut flat = Vec::new();
        for i in 0..3u8 {
            flat.extend_from_slice(&[i; 20]);
        }
        let h = PieceHashes::new(flat, &l).unwrap();
        assert_eq!(h.len(), 3);
        for i in 0..3u32 {
            let idx = l.validate_piece_index(i).unwrap();
            assert_eq!(h.get(idx), Some(Id20([i as u8; 20])));
        }
    }

    #[test]
    fn test_bad_lengths() {
        let l = Lengths::new(3 * 1024, 1024, None).unwrap();
        assert_eq!(
            PieceHashes::new(vec![0u8; 59], &l).unwrap_err(),
            Error::PieceHashesNotMultipleOf20(59)
        );
        assert_eq!(
            PieceHashes::new(vec![0u8; 40], &l).unwrap_err(),
            Error::PieceHashesCountMismatch {
                expected: 3,
                actual: 2
            }
        );
    }
}
