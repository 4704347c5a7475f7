// Rarest-first piece selection.
//
// For each byte position:
//   candidate = peer_has & !we_have & !reserved & allowed
// Zero bytes are skipped right away, which is the common case late in a download. Among
// the set bits, the piece with the lowest availability wins, ties are broken uniformly
// at random with reservoir sampling. One pass over the bytes, no allocations.

use rand::Rng;

use crate::{bitfield::last_byte_mask, type_aliases::BF};

/// Read access to a bitfield one byte at a time, MSB-first bit order.
/// Bytes past the end read as zero.
pub trait ByteView {
    fn byte_len(&self) -> usize;
    fn byte(&self, index: usize) -> u8;
}

impl ByteView for [u8] {
    fn byte_len(&self) -> usize {
        self.len()
    }

    fn byte(&self, index: usize) -> u8 {
        self.get(index).copied().unwrap_or(0)
    }
}

impl ByteView for Vec<u8> {
    fn byte_len(&self) -> usize {
        self.len()
    }

    fn byte(&self, index: usize) -> u8 {
        self.as_slice().byte(index)
    }
}

impl ByteView for BF {
    fn byte_len(&self) -> usize {
        self.as_raw_slice().len()
    }

    fn byte(&self, index: usize) -> u8 {
        self.as_raw_slice().byte(index)
    }
}

/// How many peers hold a piece.
pub trait AvailabilityView {
    fn availability(&self, index: u32) -> u32;
}

impl AvailabilityView for [u32] {
    fn availability(&self, index: u32) -> u32 {
        self.get(index as usize).copied().unwrap_or(0)
    }
}

impl AvailabilityView for Vec<u32> {
    fn availability(&self, index: u32) -> u32 {
        self.as_slice().availability(index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceSuggestion {
    /// Request this piece from the peer.
    Piece(u32),
    /// Nothing to ask this peer for right now, but we are still missing pieces.
    NoneAvailable,
    /// We have every piece.
    Complete,
}

impl PieceSuggestion {
    pub fn piece(self) -> Option<u32> {
        match self {
            PieceSuggestion::Piece(p) => Some(p),
            _ => None,
        }
    }
}

/// Everything selection looks at. `None` inputs don't restrict anything.
#[derive(Clone, Copy)]
pub struct SelectionInput<'a> {
    pub ours: &'a dyn ByteView,
    pub peer: &'a dyn ByteView,
    pub reserved: Option<&'a dyn ByteView>,
    pub availability: Option<&'a dyn AvailabilityView>,
    pub allowed: Option<&'a dyn ByteView>,
    pub num_pieces: u32,
}

impl<'a> SelectionInput<'a> {
    pub fn new(ours: &'a dyn ByteView, peer: &'a dyn ByteView, num_pieces: u32) -> Self {
        Self {
            ours,
            peer,
            reserved: None,
            availability: None,
            allowed: None,
            num_pieces,
        }
    }

    pub fn reserved(mut self, reserved: &'a dyn ByteView) -> Self {
        self.reserved = Some(reserved);
        self
    }

    pub fn availability(mut self, availability: &'a dyn AvailabilityView) -> Self {
        self.availability = Some(availability);
        self
    }

    pub fn allowed(mut self, allowed: &'a dyn ByteView) -> Self {
        self.allowed = Some(allowed);
        self
    }
}

pub fn suggest_piece(input: &SelectionInput<'_>, rng: &mut impl Rng) -> PieceSuggestion {
    let num_bytes = input.num_pieces.div_ceil(8) as usize;
    let tail_mask = last_byte_mask(input.num_pieces);

    let mut best: Option<(u32, u32)> = None;
    let mut ties = 0u32;
    let mut we_have_all = true;

    for byte_idx in 0..num_bytes {
        let byte_mask = if byte_idx + 1 == num_bytes {
            tail_mask
        } else {
            0xff
        };

        let ours = input.ours.byte(byte_idx);
        if ours & byte_mask != byte_mask {
            we_have_all = false;
        }

        let mut candidate = input.peer.byte(byte_idx) & !ours & byte_mask;
        if let Some(reserved) = input.reserved {
            candidate &= !reserved.byte(byte_idx);
        }
        if let Some(allowed) = input.allowed {
            candidate &= allowed.byte(byte_idx);
        }
        if candidate == 0 {
            continue;
        }

        while candidate != 0 {
            let bit = candidate.leading_zeros();
            candidate &= !(0x80u8 >> bit);
            let index = byte_idx as u32 * 8 + bit;
            let avail = input
                .availability
                .map(|a| a.availability(index))
                .unwrap_or(0);

            match best {
                Some((_, best_avail)) if avail > best_avail => {}
                Some((_, best_avail)) if avail == best_avail => {
                    ties += 1;
                    if rng.random_ratio(1, ties) {
                        best = Some((index, avail));
                    }
                }
                _ => {
                    best = Some((index, avail));
                    ties = 1;
                }
            }
        }
    }

    match best {
        Some((index, _)) => PieceSuggestion::Piece(index),
        None if we_have_all => PieceSuggestion::Complete,
        None => PieceSuggestion::NoneAvailable,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::{SeedableRng, rngs::SmallRng};

    use super::*;
    use crate::bitfield::Bitfield;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(42)
    }

    #[test]
    fn test_single_allowed_bit_is_chosen() {
        let n = 29u32;
        let peer = vec![0xffu8; 4];
        let ours = vec![0u8; 4];
        for i in 0..n {
            let mut allowed = vec![0u8; 4];
            allowed[(i / 8) as usize] = 0x80 >> (i % 8);
            let input = SelectionInput::new(&ours, &peer, n).allowed(&allowed);
            assert_eq!(suggest_piece(&input, &mut rng()), PieceSuggestion::Piece(i));
        }
    }

    #[test]
    fn test_rarest_wins() {
        let availability = vec![10u32, 10, 5, 5, 1, 10, 10, 10];
        let peer = vec![0xffu8];
        let ours = vec![0u8];
        // Pieces 2, 3, 4.
        let allowed = vec![0b0011_1000u8];
        let mut rng = rand::rng();
        for _ in 0..1000 {
            let input = SelectionInput::new(&ours, &peer, 8)
                .availability(&availability)
                .allowed(&allowed);
            assert_eq!(suggest_piece(&input, &mut rng), PieceSuggestion::Piece(4));
        }
    }

    #[test]
    fn test_ties_are_spread() {
        let availability = vec![3u32; 16];
        let peer = vec![0xffu8, 0xff];
        let ours = vec![0u8, 0];
        let mut rng = rng();
        let mut seen = HashSet::new();
        for _ in 0..2000 {
            let input = SelectionInput::new(&ours, &peer, 16).availability(&availability);
            seen.insert(suggest_piece(&input, &mut rng).piece().unwrap());
        }
        assert_eq!(seen.len(), 16);
    }

    #[test]
    fn test_reserved_and_owned_are_excluded() {
        let peer = vec![0xffu8];
        let ours = vec![0b1111_0000u8];
        let reserved = vec![0b0000_1110u8];
        let input = SelectionInput::new(&ours, &peer, 8).reserved(&reserved);
        assert_eq!(suggest_piece(&input, &mut rng()), PieceSuggestion::Piece(7));
    }

    #[test]
    fn test_trailing_bits_are_ignored() {
        // 5 pieces, we have them all, the peer claims bits past the end.
        let peer = vec![0xffu8];
        let ours = vec![0b1111_1000u8];
        let input = SelectionInput::new(&ours, &peer, 5);
        assert_eq!(suggest_piece(&input, &mut rng()), PieceSuggestion::Complete);
    }

    #[test]
    fn test_none_available_vs_complete() {
        let ours = vec![0b1010_0000u8];
        let peer = vec![0b1010_0000u8];
        let input = SelectionInput::new(&ours, &peer, 3);
        assert_eq!(
            suggest_piece(&input, &mut rng()),
            PieceSuggestion::NoneAvailable
        );

        // Everything left is reserved.
        let peer = vec![0xe0u8];
        let reserved = vec![0x40u8];
        let input = SelectionInput::new(&ours, &peer, 3).reserved(&reserved);
        assert_eq!(
            suggest_piece(&input, &mut rng()),
            PieceSuggestion::NoneAvailable
        );
    }

    #[test]
    fn test_last_two_pieces_scenario() {
        let n = 2106u32;
        assert_eq!(n.div_ceil(8), 264);
        let peer = Bitfield::from_bytes(n, &vec![0xff; 264]).unwrap();
        let ours = Bitfield::new(n);
        for i in 0..2104 {
            ours.mark_have(i).unwrap();
        }

        let suggest = |ours: &Bitfield| {
            let input = SelectionInput::new(ours, &peer, n);
            suggest_piece(&input, &mut rng())
        };

        let first = suggest(&ours).piece().unwrap();
        assert!(first == 2104 || first == 2105);
        ours.mark_have(2104).unwrap();
        assert_eq!(suggest(&ours), PieceSuggestion::Piece(2105));
        ours.mark_have(2105).unwrap();
        assert_eq!(suggest(&ours), PieceSuggestion::Complete);
        assert_eq!(suggest(&ours).piece(), None);
    }

    #[test]
    fn test_short_views_read_as_zero() {
        // Peer bitfield shorter than expected: missing bytes mean "doesn't have".
        let peer = vec![0x00u8];
        let ours = vec![0u8, 0];
        let input = SelectionInput::new(&ours, &peer, 16);
        assert_eq!(
            suggest_piece(&input, &mut rng()),
            PieceSuggestion::NoneAvailable
        );
    }
}
