use std::time::Duration;

use peer_binary_protocol::{
    HANDSHAKE_LEN, Handshake, HandshakeDeserializeError, LEN_PREFIX_LEN, MAX_MSG_LEN,
    MessageBorrowed, MessageDeserializeError, frame_len,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::error::{Error, HandshakeError, Result};

pub(crate) async fn with_timeout<T>(
    name: &'static str,
    timeout_value: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout_value, fut).await {
        Ok(v) => v,
        Err(_) => Err(Error::Timeout(name)),
    }
}

/// Buffer for reading framed messages off a socket.
///
/// Unconsumed bytes always live in one contiguous range, so a decoded message can borrow
/// its payload straight out of the buffer. When a frame doesn't fit in the tail, the
/// pending bytes are moved to the front first.
pub struct ReadBuf {
    buf: Box<[u8]>,
    start: usize,
    end: usize,
}

impl Default for ReadBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadBuf {
    /// Large enough for the biggest message we accept by default.
    pub fn new() -> Self {
        Self::with_max_message_len(MAX_MSG_LEN)
    }

    pub fn with_max_message_len(max_len: u32) -> Self {
        let cap = (max_len as usize + LEN_PREFIX_LEN).max(HANDSHAKE_LEN);
        Self {
            buf: vec![0u8; cap].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes received but not consumed yet.
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    fn consume(&mut self, len: usize) {
        self.start += len;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.buf.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }

    /// One read() call into the free tail. Returns 0 on EOF.
    async fn read_some(&mut self, conn: &mut (impl AsyncRead + Unpin)) -> std::io::Result<usize> {
        let n = conn.read(&mut self.buf[self.end..]).await?;
        self.end += n;
        Ok(n)
    }

    /// Read until at least `need` more bytes are buffered.
    async fn fill(
        &mut self,
        conn: &mut (impl AsyncRead + Unpin),
        timeout: Duration,
        need: usize,
    ) -> Result<()> {
        if self.end + need > self.buf.len() {
            self.compact();
        }
        if self.end + need > self.buf.len() {
            return Err(Error::ReadBufFull {
                need_additional_bytes: need,
            });
        }
        let target = self.end + need;
        while self.end < target {
            let n = with_timeout("reading", timeout, async {
                self.read_some(conn).await.map_err(Error::Read)
            })
            .await?;
            if n == 0 {
                return Err(Error::PeerDisconnected);
            }
        }
        Ok(())
    }

    /// Read the peer's handshake. Must be the first thing read from a connection. Bytes
    /// the peer sent after the handshake stay buffered for [`Self::read_message`].
    pub async fn read_handshake(
        &mut self,
        mut conn: impl AsyncRead + Unpin,
        timeout: Duration,
    ) -> std::result::Result<Handshake, HandshakeError> {
        let read = async {
            loop {
                let short = match Handshake::deserialize(self.pending()) {
                    Ok((h, size)) => {
                        self.consume(size);
                        return Ok(h);
                    }
                    Err(HandshakeDeserializeError::BadLengthPrefix(b)) => {
                        return Err(HandshakeError::BadLengthPrefix(b));
                    }
                    Err(HandshakeDeserializeError::ProtocolMismatch) => {
                        return Err(HandshakeError::ProtocolMismatch);
                    }
                    Err(e) => e,
                };
                let n = self
                    .read_some(&mut conn)
                    .await
                    .map_err(HandshakeError::Transport)?;
                if n == 0 {
                    return Err(match short {
                        HandshakeDeserializeError::ShortReserved => HandshakeError::ShortReserved,
                        HandshakeDeserializeError::ShortInfoHash => HandshakeError::ShortInfoHash,
                        HandshakeDeserializeError::ShortPeerId => HandshakeError::ShortPeerId,
                        // A truncated protocol string never proved to be ours.
                        HandshakeDeserializeError::ShortProtocolString => {
                            HandshakeError::ProtocolMismatch
                        }
                        _ => HandshakeError::NoResponse,
                    });
                }
            }
        };
        match tokio::time::timeout(timeout, read).await {
            Ok(r) => r,
            Err(_) => Err(HandshakeError::NoResponse),
        }
    }

    /// Read the next message, borrowing its payload from the buffer.
    ///
    /// Frames with message ids we don't speak are skipped. Anything else that fails to
    /// decode is an error and the connection should be dropped.
    pub async fn read_message(
        &mut self,
        mut conn: impl AsyncRead + Unpin,
        timeout: Duration,
        max_len: u32,
    ) -> Result<MessageBorrowed<'_>> {
        let total = loop {
            match frame_len(self.pending(), max_len) {
                Ok(total) => match MessageBorrowed::deserialize_with_max_len(self.pending(), max_len) {
                    Ok(_) => break total,
                    Err(MessageDeserializeError::UnsupportedMessageId { msg_id, frame_len }) => {
                        debug!(msg_id, frame_len, "skipping unsupported message");
                        self.consume(frame_len);
                    }
                    Err(e) => return Err(e.into()),
                },
                Err(MessageDeserializeError::NotEnoughData(need, _)) => {
                    self.fill(&mut conn, timeout, need).await?;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let start = self.start;
        self.consume(total);
        // consume() may have reset the indices, the bytes are still there.
        let (msg, _) =
            MessageBorrowed::deserialize_with_max_len(&self.buf[start..start + total], max_len)?;
        Ok(msg)
    }
}
