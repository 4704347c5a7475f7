/// The block size everyone requests in practice.
pub const BLOCK_SIZE: u32 = 16384;

/// Requests bigger than this are refused when uploading.
pub const MAX_REQUEST_LEN: u32 = 128 * 1024;

/// Length of a SHA-1 digest, and so of every InfoHash and PeerId.
pub const SHA1_LEN: usize = 20;
