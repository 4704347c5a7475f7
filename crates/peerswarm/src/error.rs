use peer_binary_protocol::MessageDeserializeError;
use peerswarm_core::{InfoHash, PeerId};

/// Why a handshake attempt failed. Any of these ends the attempt; nothing is retried here.
#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
    #[error("no handshake received")]
    NoResponse,
    #[error("bad protocol string length prefix {0}")]
    BadLengthPrefix(u8),
    #[error("protocol string doesn't match BitTorrent v1")]
    ProtocolMismatch,
    #[error("connection closed inside the reserved bytes")]
    ShortReserved,
    #[error("connection closed inside the info hash")]
    ShortInfoHash,
    #[error("connection closed inside the peer id")]
    ShortPeerId,
    #[error("info hash {0:?} is not served here")]
    UnknownInfoHash(InfoHash),
    #[error("handshake cancelled")]
    Cancelled,
    #[error("transport error: {0:#}")]
    Transport(#[source] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("error writing: {0:#}")]
    Write(#[source] std::io::Error),
    #[error("error reading: {0:#}")]
    Read(#[source] std::io::Error),
    #[error("error connecting: {0:#}")]
    Connect(#[source] std::io::Error),

    #[error("timeout {0}")]
    Timeout(&'static str),

    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("error deserializing message: {0:#}")]
    Deserialize(
        #[from]
        #[source]
        MessageDeserializeError,
    ),

    #[error("read buffer is full. need_additional_bytes={need_additional_bytes}")]
    ReadBufFull { need_additional_bytes: usize },

    #[error("bitfield has unexpected size. Got {received}, expected {expected}")]
    BitfieldLength { expected: usize, received: usize },
    #[error("bitfield has bits set past the last piece")]
    BitfieldTrailingBits,

    #[error("invalid piece index {0}")]
    InvalidPieceIndex(u32),

    #[error(transparent)]
    Core(#[from] peerswarm_core::Error),

    #[error("channel closed")]
    ChannelClosed,

    #[error("torrent {0:?} not found")]
    TorrentNotFound(InfoHash),
    #[error("torrent {0:?} already added")]
    TorrentAlreadyExists(InfoHash),

    #[error("peer {0:?} is already connected")]
    DuplicatePeer(PeerId),
    #[error("connecting to ourselves")]
    ConnectingToOurselves,

    #[error("storage error: {0:#}")]
    Storage(#[source] anyhow::Error),

    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = core::result::Result<T, Error>;
