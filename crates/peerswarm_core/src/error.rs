#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("torrent with 0 length is useless")]
    ZeroLength,
    #[error("piece length must be > 0")]
    ZeroPieceLength,
    #[error("block length {0} is not a power of 2")]
    BlockLengthNotPowerOfTwo(u32),
    #[error("torrent has too many pieces")]
    TooManyPieces,
    #[error("invalid piece index {0}")]
    InvalidPieceIndex(u32),
    #[error("piece hashes length {0} is not a multiple of 20")]
    PieceHashesNotMultipleOf20(usize),
    #[error("expected hashes for {expected} pieces, got {actual}")]
    PieceHashesCountMismatch { expected: u32, actual: usize },
}

pub type Result<T> = core::result::Result<T, Error>;
