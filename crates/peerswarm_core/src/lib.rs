pub mod constants;
pub mod error;
pub mod hash_id;
pub mod lengths;
pub mod peer_id;
pub mod piece_hashes;
pub mod spawn_utils;

pub use error::Error;
pub use hash_id::{Id20, InfoHash, PeerId};
