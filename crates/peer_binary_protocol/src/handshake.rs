use bytes::BufMut;
use peerswarm_core::Id20;

pub const PSTR_BT1: &[u8; 19] = b"BitTorrent protocol";

const PSTR_START: usize = 1;
const RESERVED_START: usize = PSTR_START + PSTR_BT1.len();
const INFO_HASH_START: usize = RESERVED_START + 8;
const PEER_ID_START: usize = INFO_HASH_START + 20;

/// Length of the fixed BitTorrent v1 handshake.
pub const HANDSHAKE_LEN: usize = PEER_ID_START + 20;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum HandshakeDeserializeError {
    #[error("no handshake bytes received")]
    Empty,
    #[error("protocol string length should be 19, but received {0}")]
    BadLengthPrefix(u8),
    #[error("protocol string doesn't match BitTorrent v1")]
    ProtocolMismatch,
    #[error("handshake truncated inside the protocol string")]
    ShortProtocolString,
    #[error("handshake truncated inside the reserved bytes")]
    ShortReserved,
    #[error("handshake truncated inside the info hash")]
    ShortInfoHash,
    #[error("handshake truncated inside the peer id")]
    ShortPeerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: Id20,
    pub peer_id: Id20,
}

impl Handshake {
    /// Our handshake. We advertise no protocol extensions.
    pub fn new(info_hash: Id20, peer_id: Id20) -> Handshake {
        Handshake {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extended(&self) -> bool {
        self.reserved[5] & 0x10 > 0
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved[7] & 0x01 > 0
    }

    pub fn serialize(&self, out: &mut impl BufMut) {
        out.put_u8(PSTR_BT1.len() as u8);
        out.put_slice(PSTR_BT1);
        out.put_slice(&self.reserved);
        out.put_slice(&self.info_hash.0);
        out.put_slice(&self.peer_id.0);
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        self.serialize(&mut &mut out[..]);
        out
    }

    /// Parse a handshake from the start of `b`. On success returns the handshake and
    /// how many bytes it took. If `b` is too short the error says which field was cut off,
    /// after validating whatever prefix is present.
    pub fn deserialize(b: &[u8]) -> Result<(Handshake, usize), HandshakeDeserializeError> {
        use HandshakeDeserializeError as E;

        let pstr_len = *b.first().ok_or(E::Empty)?;
        if pstr_len as usize != PSTR_BT1.len() {
            return Err(E::BadLengthPrefix(pstr_len));
        }

        let pstr_available = &b[PSTR_START..b.len().min(RESERVED_START)];
        if pstr_available != &PSTR_BT1[..pstr_available.len()] {
            return Err(E::ProtocolMismatch);
        }
        if b.len() < RESERVED_START {
            return Err(E::ShortProtocolString);
        }

        let reserved: [u8; 8] = b
            .get(RESERVED_START..INFO_HASH_START)
            .and_then(|s| s.try_into().ok())
            .ok_or(E::ShortReserved)?;
        let info_hash = b
            .get(INFO_HASH_START..PEER_ID_START)
            .and_then(Id20::from_slice)
            .ok_or(E::ShortInfoHash)?;
        let peer_id = b
            .get(PEER_ID_START..HANDSHAKE_LEN)
            .and_then(Id20::from_slice)
            .ok_or(E::ShortPeerId)?;

        Ok((
            Handshake {
                reserved,
                info_hash,
                peer_id,
            },
            HANDSHAKE_LEN,
        ))
    }
}
