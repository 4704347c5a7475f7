// Time-boxed exclusive claims on pieces, so that several peers aren't asked for the same
// piece at once.
//
// The reserved set is itself a Bitfield so selection can read it lock-free. Deadlines live
// in a min-heap drained by a single maintenance loop. A heap entry only expires a piece if
// it still matches the deadline recorded for it, so an old entry can't cut short a newer
// reservation of the same piece.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use tokio::{sync::Notify, time::Instant};
use tracing::trace;

use crate::bitfield::Bitfield;

/// How long a reservation lasts, as a function of how much of the torrent we have.
/// Stuck pieces get re-offered faster near the end.
#[serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReservationPolicy {
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub max_ttl: Duration,
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub min_ttl: Duration,
    /// At and above this completion ratio the TTL is `min_ttl`.
    pub endgame_threshold: f64,
}

impl Default for ReservationPolicy {
    fn default() -> Self {
        Self {
            max_ttl: Duration::from_secs(10),
            min_ttl: Duration::from_secs(1),
            endgame_threshold: 0.8,
        }
    }
}

impl ReservationPolicy {
    /// Linear from `max_ttl` at 0% to `min_ttl` at `endgame_threshold`.
    pub fn ttl(&self, completion: f64) -> Duration {
        if !(self.endgame_threshold > 0.) || completion >= self.endgame_threshold {
            return self.min_ttl;
        }
        let t = completion.max(0.) / self.endgame_threshold;
        let max = self.max_ttl.as_secs_f64();
        let min = self.min_ttl.as_secs_f64();
        Duration::from_secs_f64(max - (max - min) * t)
    }
}

#[derive(Default)]
struct Timers {
    heap: BinaryHeap<Reverse<(Instant, u32)>>,
    deadlines: HashMap<u32, Instant>,
}

pub struct PieceReservations {
    reserved: Bitfield,
    timers: Mutex<Timers>,
    changed: Notify,
}

impl PieceReservations {
    pub fn new(num_pieces: u32) -> Self {
        Self {
            reserved: Bitfield::new(num_pieces),
            timers: Mutex::new(Timers::default()),
            changed: Notify::new(),
        }
    }

    /// Claim the piece for `ttl`. Fails if it's already claimed or out of range.
    pub fn try_reserve(&self, index: u32, ttl: Duration) -> bool {
        let mut timers = self.timers.lock();
        match self.reserved.mark_have(index) {
            Ok(true) => {}
            Ok(false) | Err(_) => return false,
        }
        let deadline = Instant::now() + ttl;
        timers.deadlines.insert(index, deadline);
        timers.heap.push(Reverse((deadline, index)));
        drop(timers);
        self.changed.notify_one();
        true
    }

    /// Drop the claim early, e.g. when the piece was verified or failed verification.
    pub fn release(&self, index: u32) -> bool {
        let mut timers = self.timers.lock();
        timers.deadlines.remove(&index);
        self.reserved.unmark_have(index).unwrap_or(false)
    }

    pub fn is_reserved(&self, index: u32) -> bool {
        self.reserved.has_piece(index).unwrap_or(false)
    }

    pub fn reserved(&self) -> &Bitfield {
        &self.reserved
    }

    pub fn len(&self) -> usize {
        self.timers.lock().deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// When the earliest live reservation runs out.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut timers = self.timers.lock();
        Self::discard_stale(&mut timers);
        timers.heap.peek().map(|Reverse((d, _))| *d)
    }

    fn discard_stale(timers: &mut Timers) {
        while let Some(Reverse((deadline, index))) = timers.heap.peek().copied() {
            if timers.deadlines.get(&index) == Some(&deadline) {
                return;
            }
            timers.heap.pop();
        }
    }

    /// Expire everything due at `now`. Returns the pieces that were released.
    pub fn expire_due(&self, now: Instant) -> Vec<u32> {
        let mut expired = Vec::new();
        let mut timers = self.timers.lock();
        while let Some(Reverse((deadline, index))) = timers.heap.peek().copied() {
            if deadline > now {
                break;
            }
            timers.heap.pop();
            if timers.deadlines.get(&index) != Some(&deadline) {
                continue;
            }
            timers.deadlines.remove(&index);
            if self.reserved.unmark_have(index).unwrap_or(false) {
                expired.push(index);
            }
        }
        expired
    }

    /// Maintenance loop: sleeps until the earliest deadline and expires what's due.
    /// Runs until dropped, spawn it with a cancellation token.
    pub async fn run_expiry(&self) -> anyhow::Result<()> {
        loop {
            let changed = self.changed.notified();
            let expired = self.expire_due(Instant::now());
            if !expired.is_empty() {
                trace!(?expired, "reservations expired");
            }
            match self.next_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {},
                        _ = changed => {},
                    }
                }
                None => changed.await,
            }
        }
    }
}

impl std::fmt::Debug for PieceReservations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceReservations")
            .field("reserved", &self.reserved)
            .finish()
    }
}
