//!
//! The core of a BitTorrent client: everything between a TCP socket and verified pieces in
//! storage.
//!
//! # Quick usage example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use peerswarm::*;
//! use peerswarm_core::{lengths::Lengths, piece_hashes::PieceHashes};
//!
//! tokio_test::block_on(async {
//!     let swarm = SwarmManager::new(SwarmOptions {
//!         listen: Some(ListenerOptions::default()),
//!         ..Default::default()
//!     })
//!     .await
//!     .unwrap();
//!
//!     let lengths = Lengths::new(1 << 20, 1 << 16, None).unwrap();
//!     let hashes = PieceHashes::new(vec![0u8; 20 * 16], &lengths).unwrap();
//!     let info_hash = "cab507494d02ebb1178b38f2e9d7be299c86b862".parse().unwrap();
//!     let torrent = swarm
//!         .add_torrent(AddTorrent {
//!             info_hash,
//!             lengths,
//!             hashes,
//!             storage: Arc::new(InMemoryStorage::new(1 << 20).unwrap()),
//!             have: InitialHave::Nothing,
//!             options: Default::default(),
//!         })
//!         .await
//!         .unwrap();
//!     swarm
//!         .add_peer_addr(info_hash, "127.0.0.1:6881".parse().unwrap())
//!         .unwrap();
//!     torrent.wait_until_finished().await;
//! })
//! ```
//!
//! # Overview
//! [`SwarmManager`] owns the torrents and all connections. Each torrent is a
//! [`TorrentSession`]. Connections are [`peer_wire::PeerWireClient`]s; which piece to ask
//! a peer for next is decided by [`piece_selection::suggest_piece`].

pub mod assembler;
pub mod availability;
pub mod bitfield;
mod error;
pub mod handshake;
mod listen;
pub mod peer_wire;
pub mod piece_selection;
pub mod read_buf;
pub mod reservation;
pub mod stats;
pub mod storage;
mod swarm;
mod torrent;
#[cfg(feature = "tracing-subscriber-utils")]
pub mod tracing_subscriber_config_utils;
mod type_aliases;

pub use error::{Error, HandshakeError, Result};
pub use listen::ListenerOptions;
pub use peer_wire::PeerConnectionOptions;
pub use reservation::ReservationPolicy;
pub use storage::{InMemoryStorage, TorrentStorage};
pub use swarm::{SwarmManager, SwarmOptions};
pub use torrent::{AddTorrent, InitialHave, PeerSession, TorrentSession, TorrentSessionOptions};
pub use type_aliases::BF;

pub use buffers::*;
pub use peerswarm_core::peer_id::*;
pub use peerswarm_core::{Id20, InfoHash, PeerId};


/// The cargo version of peerswarm.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
