use std::{
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::Duration,
};

use serde::Serialize;

#[derive(Default, Debug)]
pub struct PeerCounters {
    pub fetched_bytes: AtomicU64,
    pub fetched_blocks: AtomicU32,
    pub uploaded_bytes: AtomicU64,
    pub uploaded_blocks: AtomicU32,
    pub discarded_blocks: AtomicU32,
}

#[derive(Debug, Serialize, Default, Clone, Copy, PartialEq, Eq)]
pub struct PeerStatsSnapshot {
    pub fetched_bytes: u64,
    pub fetched_blocks: u32,
    pub uploaded_bytes: u64,
    pub uploaded_blocks: u32,
    pub discarded_blocks: u32,
}

impl PeerCounters {
    pub fn on_block_received(&self, len: usize) {
        self.fetched_bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.fetched_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_block_uploaded(&self, len: usize) {
        self.uploaded_bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.uploaded_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PeerStatsSnapshot {
        PeerStatsSnapshot {
            fetched_bytes: self.fetched_bytes.load(Ordering::Relaxed),
            fetched_blocks: self.fetched_blocks.load(Ordering::Relaxed),
            uploaded_bytes: self.uploaded_bytes.load(Ordering::Relaxed),
            uploaded_blocks: self.uploaded_blocks.load(Ordering::Relaxed),
            discarded_blocks: self.discarded_blocks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default, Debug)]
pub struct TorrentCounters {
    pub verified_pieces: AtomicU32,
    pub verified_bytes: AtomicU64,
    pub hash_failures: AtomicU32,
    pub fetched_bytes: AtomicU64,
    pub uploaded_bytes: AtomicU64,
    pub total_piece_download_ms: AtomicU64,
}

impl TorrentCounters {
    pub fn on_piece_verified(&self, len: u32, took: Duration) {
        self.verified_pieces.fetch_add(1, Ordering::Relaxed);
        self.verified_bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.total_piece_download_ms
            .fetch_add(took.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, connected_peers: usize) -> TorrentStatsSnapshot {
        TorrentStatsSnapshot {
            verified_pieces: self.verified_pieces.load(Ordering::Relaxed),
            verified_bytes: self.verified_bytes.load(Ordering::Relaxed),
            hash_failures: self.hash_failures.load(Ordering::Relaxed),
            fetched_bytes: self.fetched_bytes.load(Ordering::Relaxed),
            uploaded_bytes: self.uploaded_bytes.load(Ordering::Relaxed),
            total_piece_download_ms: self.total_piece_download_ms.load(Ordering::Relaxed),
            connected_peers,
        }
    }
}

#[derive(Debug, Serialize, Default, Clone, Copy, PartialEq, Eq)]
pub struct TorrentStatsSnapshot {
    pub verified_pieces: u32,
    pub verified_bytes: u64,
    pub hash_failures: u32,
    pub fetched_bytes: u64,
    pub uploaded_bytes: u64,
    pub total_piece_download_ms: u64,
    pub connected_peers: usize,
}

impl TorrentStatsSnapshot {
    pub fn average_piece_download_time(&self) -> Option<Duration> {
        if self.verified_pieces == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(
            self.total_piece_download_ms as f64 / self.verified_pieces as f64 / 1000f64,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes() {
        let c = TorrentCounters::default();
        c.on_piece_verified(100, Duration::from_millis(30));
        c.on_piece_verified(100, Duration::from_millis(10));
        let s = c.snapshot(3);
        assert_eq!(
            s.average_piece_download_time().map(|d| d.as_millis()),
            Some(20)
        );
        let json = serde_json::to_value(s).unwrap();
        assert_eq!(json["verified_bytes"], 200);
        assert_eq!(json["connected_peers"], 3);
    }
}
