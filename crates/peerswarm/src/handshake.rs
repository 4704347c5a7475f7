use std::{net::SocketAddr, time::Duration};

use peer_binary_protocol::Handshake;
use peerswarm_core::{InfoHash, PeerId};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{error::HandshakeError, read_buf::ReadBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A connected socket that hasn't exchanged handshakes yet.
#[derive(Debug)]
pub struct HalfOpenConnection<S> {
    pub stream: S,
    pub addr: SocketAddr,
    pub direction: Direction,
    /// Only known up front when we dialed.
    pub info_hash: Option<InfoHash>,
}

impl<S> HalfOpenConnection<S> {
    pub fn inbound(stream: S, addr: SocketAddr) -> Self {
        Self {
            stream,
            addr,
            direction: Direction::Inbound,
            info_hash: None,
        }
    }

    pub fn outbound(stream: S, addr: SocketAddr, info_hash: InfoHash) -> Self {
        Self {
            stream,
            addr,
            direction: Direction::Outbound,
            info_hash: Some(info_hash),
        }
    }
}

async fn write_handshake(
    conn: &mut (impl AsyncWrite + Unpin),
    info_hash: InfoHash,
    peer_id: PeerId,
) -> Result<(), HandshakeError> {
    let ours = Handshake::new(info_hash, peer_id).to_bytes();
    conn.write_all(&ours)
        .await
        .map_err(HandshakeError::Transport)?;
    conn.flush().await.map_err(HandshakeError::Transport)
}

async fn with_cancel<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T, HandshakeError>>,
) -> Result<T, HandshakeError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(HandshakeError::Cancelled),
        r = fut => r,
    }
}

/// Send our handshake, then wait for the peer's and check it's for the same torrent.
///
/// The returned buffer holds anything the peer sent right after its handshake. It is sized
/// for messages up to `max_message_len` and meant to be reused for the rest of the
/// connection.
pub async fn outbound_handshake<S>(
    conn: &mut S,
    info_hash: InfoHash,
    peer_id: PeerId,
    timeout: Duration,
    max_message_len: u32,
    cancel: &CancellationToken,
) -> Result<(Handshake, ReadBuf), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_cancel(cancel, async {
        tokio::time::timeout(timeout, write_handshake(conn, info_hash, peer_id))
            .await
            .map_err(|_| HandshakeError::NoResponse)??;
        trace!("sent handshake");

        let mut read_buf = ReadBuf::with_max_message_len(max_message_len);
        let theirs = read_buf.read_handshake(&mut *conn, timeout).await?;
        if theirs.info_hash != info_hash {
            return Err(HandshakeError::UnknownInfoHash(theirs.info_hash));
        }
        trace!(peer_id = ?theirs.peer_id, "received handshake");
        Ok((theirs, read_buf))
    })
    .await
}

/// Wait for the peer's handshake, and only reply if `is_served` knows its info hash.
pub async fn inbound_handshake<S>(
    conn: &mut S,
    peer_id: PeerId,
    is_served: impl Fn(&InfoHash) -> bool,
    timeout: Duration,
    max_message_len: u32,
    cancel: &CancellationToken,
) -> Result<(Handshake, ReadBuf), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_cancel(cancel, async {
        let mut read_buf = ReadBuf::with_max_message_len(max_message_len);
        let theirs = read_buf.read_handshake(&mut *conn, timeout).await?;
        trace!(peer_id = ?theirs.peer_id, info_hash = ?theirs.info_hash, "received handshake");
        if !is_served(&theirs.info_hash) {
            return Err(HandshakeError::UnknownInfoHash(theirs.info_hash));
        }
        tokio::time::timeout(timeout, write_handshake(conn, theirs.info_hash, peer_id))
            .await
            .map_err(|_| HandshakeError::NoResponse)??;
        Ok((theirs, read_buf))
    })
    .await
}

#[cfg(test)]
mod tests {
    use peer_binary_protocol::{MAX_MSG_LEN, Message};
    use peerswarm_core::Id20;
    use tokio::io::AsyncReadExt;

    use super::*;

    const T: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_outbound_meets_inbound() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let info_hash = Id20::new([7; 20]);
        let (pa, pb) = (Id20::new([1; 20]), Id20::new([2; 20]));
        let cancel = CancellationToken::new();

        let (out, inb) = tokio::join!(
            outbound_handshake(&mut a, info_hash, pa, T, MAX_MSG_LEN, &cancel),
            inbound_handshake(&mut b, pb, |h| *h == info_hash, T, MAX_MSG_LEN, &cancel),
        );
        let (theirs, _) = out.unwrap();
        assert_eq!(theirs.peer_id, pb);
        assert_eq!(theirs.info_hash, info_hash);
        let (theirs, _) = inb.unwrap();
        assert_eq!(theirs.peer_id, pa);
    }

    #[tokio::test]
    async fn test_inbound_unknown_info_hash_gets_no_reply() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        a.write_all(&Handshake::new(Id20::new([9; 20]), Id20::new([1; 20])).to_bytes())
            .await
            .unwrap();
        let r = inbound_handshake(
            &mut b,
            Id20::new([2; 20]),
            |_| false,
            T,
            MAX_MSG_LEN,
            &cancel,
        )
        .await;
        assert!(matches!(r, Err(HandshakeError::UnknownInfoHash(h)) if h == Id20::new([9; 20])));
        drop(b);
        let mut rest = Vec::new();
        a.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_outbound_wrong_info_hash() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        b.write_all(&Handshake::new(Id20::new([9; 20]), Id20::new([1; 20])).to_bytes())
            .await
            .unwrap();
        let r = outbound_handshake(
            &mut a,
            Id20::new([8; 20]),
            Id20::new([2; 20]),
            T,
            MAX_MSG_LEN,
            &cancel,
        )
        .await;
        assert!(matches!(r, Err(HandshakeError::UnknownInfoHash(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_is_not_a_timeout() {
        let (mut a, _b) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        let fut = outbound_handshake(
            &mut a,
            Id20::new([8; 20]),
            Id20::new([2; 20]),
            T,
            MAX_MSG_LEN,
            &cancel,
        );
        let canceller = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        };
        let (r, _) = tokio::join!(fut, canceller);
        assert!(matches!(r, Err(HandshakeError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_is_no_response() {
        let (mut a, _b) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        let r = outbound_handshake(
            &mut a,
            Id20::new([8; 20]),
            Id20::new([2; 20]),
            T,
            MAX_MSG_LEN,
            &cancel,
        )
        .await;
        assert!(matches!(r, Err(HandshakeError::NoResponse)));
    }

    #[tokio::test]
    async fn test_read_buf_fits_raised_message_limit() {
        let (mut a, mut b) = tokio::io::duplex(1 << 20);
        let info_hash = Id20::new([7; 20]);
        let cancel = CancellationToken::new();
        let big = vec![0x55u8; 300_000];
        let mut frame = Vec::new();
        Message::<&[u8]>::Bitfield(&big[..]).serialize(&mut frame);
        let remote = async {
            b.write_all(&Handshake::new(info_hash, Id20::new([1; 20])).to_bytes())
                .await
                .unwrap();
            b.write_all(&frame).await.unwrap();
        };
        let (r, _) = tokio::join!(
            outbound_handshake(&mut a, info_hash, Id20::new([2; 20]), T, 1 << 20, &cancel),
            remote,
        );
        let (_, mut read_buf) = r.unwrap();
        match read_buf.read_message(&mut a, T, 1 << 20).await.unwrap() {
            Message::Bitfield(bits) => assert_eq!(bits.len(), 300_000),
            m => panic!("unexpected {m:?}"),
        }
    }
}
