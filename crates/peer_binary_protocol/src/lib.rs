// BitTorrent peer wire protocol: handshake and message framing.
//
// Pure parsing and serialization, no I/O. Can be used outside of peerswarm.

pub mod handshake;

use buffers::ByteBuf;
use byteorder::{BE, ByteOrder};
use bytes::BufMut;
use peerswarm_core::constants::{BLOCK_SIZE, MAX_REQUEST_LEN};

pub use handshake::{HANDSHAKE_LEN, Handshake, HandshakeDeserializeError, PSTR_BT1};

const INTEGER_LEN: usize = 4;
const MSGID_LEN: usize = 1;
pub const LEN_PREFIX_LEN: usize = INTEGER_LEN;
const PREAMBLE_LEN: usize = INTEGER_LEN + MSGID_LEN;
pub const PIECE_MESSAGE_PREAMBLE_LEN: usize = PREAMBLE_LEN + INTEGER_LEN * 2;
pub const PIECE_MESSAGE_DEFAULT_LEN: usize = PIECE_MESSAGE_PREAMBLE_LEN + BLOCK_SIZE as usize;

/// Largest length prefix accepted by default: a maximum-size block or a bitfield of
/// about two million pieces, whichever is larger.
pub const MAX_MSG_LEN: u32 = 1 << 18;

const LEN_PREFIX_KEEPALIVE: u32 = 0;
const LEN_PREFIX_NO_PAYLOAD: u32 = 1;
const LEN_PREFIX_HAVE: u32 = 5;
const LEN_PREFIX_PIECE: u32 = 9;
const LEN_PREFIX_REQUEST: u32 = 13;

const MSGID_CHOKE: u8 = 0;
const MSGID_UNCHOKE: u8 = 1;
const MSGID_INTERESTED: u8 = 2;
const MSGID_NOT_INTERESTED: u8 = 3;
const MSGID_HAVE: u8 = 4;
const MSGID_BITFIELD: u8 = 5;
const MSGID_REQUEST: u8 = 6;
const MSGID_PIECE: u8 = 7;
const MSGID_CANCEL: u8 = 8;

const _: () = assert!(MAX_MSG_LEN >= LEN_PREFIX_PIECE + MAX_REQUEST_LEN);

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum MessageDeserializeError {
    #[error("not enough data to deserialize {1}: expected at least {0} more bytes")]
    NotEnoughData(usize, &'static str),
    /// The frame is complete and well-formed, but we don't speak this message.
    /// `frame_len` bytes may be skipped to get to the next message.
    #[error("unsupported message id {msg_id}")]
    UnsupportedMessageId { msg_id: u8, frame_len: usize },
    #[error("incorrect len prefix for message id {msg_id}, expected {expected}, received {received}")]
    IncorrectLenPrefix {
        received: u32,
        expected: u32,
        msg_id: u8,
    },
    #[error("message length {received} exceeds maximum of {max}")]
    MessageTooLong { received: u32, max: u32 },
}

/// Inspect the length prefix at the start of `buf` and return the total length of the
/// frame including the prefix. Fails with `NotEnoughData` until the whole frame is
/// buffered.
pub fn frame_len(buf: &[u8], max_len: u32) -> Result<usize, MessageDeserializeError> {
    let len_prefix = match buf.get(..LEN_PREFIX_LEN) {
        Some(b) => BE::read_u32(b),
        None => {
            return Err(MessageDeserializeError::NotEnoughData(
                LEN_PREFIX_LEN - buf.len(),
                "length prefix",
            ));
        }
    };
    if len_prefix > max_len {
        return Err(MessageDeserializeError::MessageTooLong {
            received: len_prefix,
            max: max_len,
        });
    }
    let total = LEN_PREFIX_LEN + len_prefix as usize;
    if buf.len() < total {
        return Err(MessageDeserializeError::NotEnoughData(
            total - buf.len(),
            "message",
        ));
    }
    Ok(total)
}

/// Write the header of a Piece message carrying `block_len` bytes. The caller appends
/// the block itself, e.g. straight from storage.
pub fn serialize_piece_preamble(
    index: u32,
    begin: u32,
    block_len: u32,
    out: &mut impl BufMut,
) -> usize {
    out.put_u32(LEN_PREFIX_PIECE + block_len);
    out.put_u8(MSGID_PIECE);
    out.put_u32(index);
    out.put_u32(begin);
    PIECE_MESSAGE_PREAMBLE_LEN
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl Request {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }

    fn serialize(&self, out: &mut impl BufMut) {
        out.put_u32(self.index);
        out.put_u32(self.begin);
        out.put_u32(self.length);
    }

    fn deserialize(b: &[u8; 12]) -> Self {
        Self {
            index: BE::read_u32(&b[0..4]),
            begin: BE::read_u32(&b[4..8]),
            length: BE::read_u32(&b[8..12]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece<B> {
    pub index: u32,
    pub begin: u32,
    pub block: B,
}

impl<B> Piece<B> {
    pub fn from_data<T>(index: u32, begin: u32, block: T) -> Piece<B>
    where
        B: From<T>,
    {
        Piece {
            index,
            begin,
            block: B::from(block),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<B> {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(B),
    Request(Request),
    Piece(Piece<B>),
    Cancel(Request),
}

pub type MessageBorrowed<'a> = Message<ByteBuf<'a>>;

impl<B> Message<B> {
    pub fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keepalive",
            Message::Choke => "choke",
            Message::Unchoke => "unchoke",
            Message::Interested => "interested",
            Message::NotInterested => "not_interested",
            Message::Have(_) => "have",
            Message::Bitfield(_) => "bitfield",
            Message::Request(_) => "request",
            Message::Piece(_) => "piece",
            Message::Cancel(_) => "cancel",
        }
    }
}

impl<B> Message<B>
where
    B: AsRef<[u8]>,
{
    pub fn len_prefix_and_msg_id(&self) -> (u32, Option<u8>) {
        match self {
            Message::KeepAlive => (LEN_PREFIX_KEEPALIVE, None),
            Message::Choke => (LEN_PREFIX_NO_PAYLOAD, Some(MSGID_CHOKE)),
            Message::Unchoke => (LEN_PREFIX_NO_PAYLOAD, Some(MSGID_UNCHOKE)),
            Message::Interested => (LEN_PREFIX_NO_PAYLOAD, Some(MSGID_INTERESTED)),
            Message::NotInterested => (LEN_PREFIX_NO_PAYLOAD, Some(MSGID_NOT_INTERESTED)),
            Message::Have(_) => (LEN_PREFIX_HAVE, Some(MSGID_HAVE)),
            Message::Bitfield(b) => (1 + b.as_ref().len() as u32, Some(MSGID_BITFIELD)),
            Message::Request(_) => (LEN_PREFIX_REQUEST, Some(MSGID_REQUEST)),
            Message::Cancel(_) => (LEN_PREFIX_REQUEST, Some(MSGID_CANCEL)),
            Message::Piece(p) => (
                LEN_PREFIX_PIECE + p.block.as_ref().len() as u32,
                Some(MSGID_PIECE),
            ),
        }
    }

    /// Total bytes this message occupies on the wire.
    pub fn wire_len(&self) -> usize {
        LEN_PREFIX_LEN + self.len_prefix_and_msg_id().0 as usize
    }

    /// Append the framed message to `out`. Returns the number of bytes written.
    pub fn serialize(&self, out: &mut impl BufMut) -> usize {
        let (lp, msg_id) = self.len_prefix_and_msg_id();
        out.put_u32(lp);
        if let Some(msg_id) = msg_id {
            out.put_u8(msg_id);
        }

        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have(index) => out.put_u32(*index),
            Message::Bitfield(b) => out.put_slice(b.as_ref()),
            Message::Request(r) | Message::Cancel(r) => r.serialize(out),
            Message::Piece(p) => {
                out.put_u32(p.index);
                out.put_u32(p.begin);
                out.put_slice(p.block.as_ref());
            }
        }
        LEN_PREFIX_LEN + lp as usize
    }
}

impl<'a> Message<ByteBuf<'a>> {
    /// Decode one message from the start of `buf`, borrowing payloads from it. Returns the
    /// message and the number of bytes it took.
    pub fn deserialize(buf: &'a [u8]) -> Result<(Self, usize), MessageDeserializeError> {
        Self::deserialize_with_max_len(buf, MAX_MSG_LEN)
    }

    pub fn deserialize_with_max_len(
        buf: &'a [u8],
        max_len: u32,
    ) -> Result<(Self, usize), MessageDeserializeError> {
        let total = frame_len(buf, max_len)?;
        let len_prefix = (total - LEN_PREFIX_LEN) as u32;
        if len_prefix == LEN_PREFIX_KEEPALIVE {
            return Ok((Message::KeepAlive, total));
        }

        let msg_id = buf[LEN_PREFIX_LEN];
        let payload = &buf[PREAMBLE_LEN..total];

        let check_exact = |expected: u32| {
            if len_prefix != expected {
                return Err(MessageDeserializeError::IncorrectLenPrefix {
                    received: len_prefix,
                    expected,
                    msg_id,
                });
            }
            Ok(())
        };
        let check_min = |expected: u32| {
            if len_prefix < expected {
                return Err(MessageDeserializeError::IncorrectLenPrefix {
                    received: len_prefix,
                    expected,
                    msg_id,
                });
            }
            Ok(())
        };

        let msg = match msg_id {
            MSGID_CHOKE => {
                check_exact(LEN_PREFIX_NO_PAYLOAD)?;
                Message::Choke
            }
            MSGID_UNCHOKE => {
                check_exact(LEN_PREFIX_NO_PAYLOAD)?;
                Message::Unchoke
            }
            MSGID_INTERESTED => {
                check_exact(LEN_PREFIX_NO_PAYLOAD)?;
                Message::Interested
            }
            MSGID_NOT_INTERESTED => {
                check_exact(LEN_PREFIX_NO_PAYLOAD)?;
                Message::NotInterested
            }
            MSGID_HAVE => {
                check_exact(LEN_PREFIX_HAVE)?;
                Message::Have(BE::read_u32(payload))
            }
            MSGID_BITFIELD => Message::Bitfield(ByteBuf(payload)),
            MSGID_REQUEST | MSGID_CANCEL => {
                check_exact(LEN_PREFIX_REQUEST)?;
                let fixed: &[u8; 12] = payload.try_into().map_err(|_| {
                    MessageDeserializeError::NotEnoughData(12 - payload.len(), "request")
                })?;
                let request = Request::deserialize(fixed);
                if msg_id == MSGID_REQUEST {
                    Message::Request(request)
                } else {
                    Message::Cancel(request)
                }
            }
            MSGID_PIECE => {
                // <len=0009+X>: 1 for the id, 8 for index and begin, X for the block.
                check_min(LEN_PREFIX_PIECE + 1)?;
                Message::Piece(Piece {
                    index: BE::read_u32(&payload[0..4]),
                    begin: BE::read_u32(&payload[4..8]),
                    block: ByteBuf(&payload[8..]),
                })
            }
            msg_id => {
                return Err(MessageDeserializeError::UnsupportedMessageId {
                    msg_id,
                    frame_len: total,
                });
            }
        };
        Ok((msg, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message<&[u8]>) -> Vec<u8> {
        let mut out = Vec::new();
        let written = msg.serialize(&mut out);
        assert_eq!(written, out.len());
        assert_eq!(written, msg.wire_len());
        out
    }

    #[test]
    fn test_request_roundtrip_boundaries() {
        for (index, begin, length) in [
            (0, 0, 0),
            (0, 0, BLOCK_SIZE),
            (1, 16384, MAX_REQUEST_LEN),
            (u32::MAX, u32::MAX, u32::MAX),
        ] {
            let buf = roundtrip(Message::Request(Request::new(index, begin, length)));
            assert_eq!(buf.len(), 17);
            let (msg, len) = MessageBorrowed::deserialize(&buf).unwrap();
            assert_eq!(len, 17);
            assert_eq!(msg, Message::Request(Request::new(index, begin, length)));
        }
    }

    #[test]
    fn test_cancel_uses_its_own_id() {
        let buf = roundtrip(Message::Cancel(Request::new(3, 4, 5)));
        assert_eq!(buf[4], MSGID_CANCEL);
        let (msg, _) = MessageBorrowed::deserialize(&buf).unwrap();
        assert_eq!(msg, Message::Cancel(Request::new(3, 4, 5)));
    }

    #[test]
    fn test_no_payload_messages() {
        for (msg, id) in [
            (Message::Choke, MSGID_CHOKE),
            (Message::Unchoke, MSGID_UNCHOKE),
            (Message::Interested, MSGID_INTERESTED),
            (Message::NotInterested, MSGID_NOT_INTERESTED),
        ] {
            let buf = roundtrip(msg.clone());
            assert_eq!(buf, vec![0, 0, 0, 1, id]);
            let (decoded, len) = MessageBorrowed::deserialize(&buf).unwrap();
            assert_eq!(len, 5);
            assert_eq!(decoded.name(), msg.name());
        }
    }

    #[test]
    fn test_keepalive() {
        let buf = roundtrip(Message::KeepAlive);
        assert_eq!(buf, vec![0, 0, 0, 0]);
        let (msg, len) = MessageBorrowed::deserialize(&buf).unwrap();
        assert_eq!(msg, Message::KeepAlive);
        assert_eq!(len, 4);
    }

    #[test]
    fn test_piece_and_preamble_agree() {
        let block = [7u8; 100];
        let buf = roundtrip(Message::Piece(Piece::from_data(2, 16384, &block[..])));

        let mut preamble = Vec::new();
        let n = serialize_piece_preamble(2, 16384, 100, &mut preamble);
        assert_eq!(n, PIECE_MESSAGE_PREAMBLE_LEN);
        assert_eq!(&buf[..n], &preamble[..]);

        let (msg, len) = MessageBorrowed::deserialize(&buf).unwrap();
        assert_eq!(len, buf.len());
        match msg {
            Message::Piece(p) => {
                assert_eq!((p.index, p.begin), (2, 16384));
                assert_eq!(p.block.0, &block[..]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_deserialize_leaves_next_message() {
        let mut buf = roundtrip(Message::Have(42));
        buf.extend(roundtrip(Message::Bitfield(&[0b1010_0000][..])));
        let (first, len) = MessageBorrowed::deserialize(&buf).unwrap();
        assert_eq!(first, Message::Have(42));
        let (second, len2) = MessageBorrowed::deserialize(&buf[len..]).unwrap();
        assert_eq!(second, Message::Bitfield(ByteBuf(&[0b1010_0000])));
        assert_eq!(len + len2, buf.len());
    }

    #[test]
    fn test_partial_frames_need_more_data() {
        let buf = roundtrip(Message::Request(Request::new(1, 2, 3)));
        for cut in 0..buf.len() {
            match MessageBorrowed::deserialize(&buf[..cut]) {
                Err(MessageDeserializeError::NotEnoughData(missing, _)) => {
                    assert!(missing > 0);
                    if cut >= LEN_PREFIX_LEN {
                        assert_eq!(missing, buf.len() - cut);
                    }
                }
                other => panic!("cut={cut}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_wrong_len_prefix() {
        // Have with a 6-byte payload.
        let buf = [0, 0, 0, 6, MSGID_HAVE, 0, 0, 0, 1, 0];
        assert_eq!(
            MessageBorrowed::deserialize(&buf),
            Err(MessageDeserializeError::IncorrectLenPrefix {
                received: 6,
                expected: 5,
                msg_id: MSGID_HAVE
            })
        );
        // Choke with a payload byte.
        let buf = [0, 0, 0, 2, MSGID_CHOKE, 0];
        assert!(matches!(
            MessageBorrowed::deserialize(&buf),
            Err(MessageDeserializeError::IncorrectLenPrefix { .. })
        ));
        // Piece without a block.
        let buf = [0, 0, 0, 9, MSGID_PIECE, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            MessageBorrowed::deserialize(&buf),
            Err(MessageDeserializeError::IncorrectLenPrefix { .. })
        ));
    }

    #[test]
    fn test_too_long() {
        let buf = (MAX_MSG_LEN + 1).to_be_bytes();
        assert_eq!(
            MessageBorrowed::deserialize(&buf),
            Err(MessageDeserializeError::MessageTooLong {
                received: MAX_MSG_LEN + 1,
                max: MAX_MSG_LEN
            })
        );
        assert!(matches!(
            MessageBorrowed::deserialize_with_max_len(&[0, 0, 0, 5, MSGID_HAVE, 0, 0, 0, 1], 4),
            Err(MessageDeserializeError::MessageTooLong { .. })
        ));
    }

    #[test]
    fn test_unsupported_message_is_skippable() {
        // Port message (id 9) followed by unchoke.
        let buf = [0, 0, 0, 3, 9, 0x1a, 0xe1, 0, 0, 0, 1, MSGID_UNCHOKE];
        let frame_len = match MessageBorrowed::deserialize(&buf) {
            Err(MessageDeserializeError::UnsupportedMessageId { msg_id: 9, frame_len }) => {
                frame_len
            }
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(frame_len, 7);
        let (msg, _) = MessageBorrowed::deserialize(&buf[frame_len..]).unwrap();
        assert_eq!(msg, Message::Unchoke);
    }
}
