use std::sync::atomic::{AtomicU32, Ordering};

use crate::{bitfield::Bitfield, piece_selection::AvailabilityView};

/// How many connected peers are known to hold each piece. This is the rarity signal for
/// piece selection.
///
/// Counters are only changed through atomic increments and decrements. Reads are
/// unsynchronized; a stale count makes selection slightly worse, never wrong.
pub struct PieceAvailability {
    counts: Box<[AtomicU32]>,
}

impl PieceAvailability {
    pub fn new(num_pieces: u32) -> Self {
        Self {
            counts: (0..num_pieces).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Out-of-range indices read as zero.
    pub fn get(&self, index: u32) -> u32 {
        self.counts
            .get(index as usize)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn increment(&self, index: u32) {
        if let Some(c) = self.counts.get(index as usize) {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Decrement, saturating at zero.
    pub fn decrement(&self, index: u32) {
        if let Some(c) = self.counts.get(index as usize) {
            let _ = c.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        }
    }

    pub fn on_have(&self, index: u32) {
        self.increment(index)
    }

    pub fn on_bitfield(&self, bitfield: &Bitfield) {
        for i in bitfield.iter_set() {
            self.increment(i);
        }
    }

    /// Forget everything a departing peer had.
    pub fn on_peer_disconnected(&self, bitfield: &Bitfield) {
        for i in bitfield.iter_set() {
            self.decrement(i);
        }
    }

    pub fn snapshot(&self) -> Vec<u32> {
        self.counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }
}

impl AvailabilityView for PieceAvailability {
    fn availability(&self, index: u32) -> u32 {
        self.get(index)
    }
}

impl std::fmt::Debug for PieceAvailability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<availability of {} pieces>", self.counts.len())
    }
}
