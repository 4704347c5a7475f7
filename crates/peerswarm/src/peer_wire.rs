// One connected peer.
//
// Two loops run per connection. The read pump decodes frames in order and dispatches them:
// state changes are applied in place, Piece payloads go to the block consumer, Request
// and Cancel go to the upload servicer. The write pump drains a bounded queue of
// serialized packets to the socket. Either one finishing ends the connection.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use buffers::BufferPool;
use parking_lot::Mutex;
use peer_binary_protocol::{MAX_MSG_LEN, Message, MessageBorrowed, Request};
use peerswarm_core::PeerId;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::{Notify, mpsc},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    assembler::Block,
    availability::PieceAvailability,
    bitfield::Bitfield,
    error::{Error, Result},
    read_buf::{ReadBuf, with_timeout},
    stats::PeerCounters,
    type_aliases::{BlockTx, PreparedPacket},
};

#[serde_as]
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct PeerConnectionOptions {
    /// Silence longer than this drops the peer.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub read_timeout: Duration,

    #[serde_as(as = "serde_with::DurationSeconds")]
    pub write_timeout: Duration,

    #[serde_as(as = "serde_with::DurationSeconds")]
    pub keep_alive_interval: Duration,

    /// Packets queued for the write pump before senders have to wait.
    pub outbound_queue_len: usize,

    pub max_message_len: u32,
}

impl Default for PeerConnectionOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(180),
            write_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(120),
            outbound_queue_len: 64,
            max_message_len: MAX_MSG_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadRequestKind {
    Request,
    Cancel,
}

#[derive(Debug, Clone, Copy)]
pub struct UploadRequest {
    pub peer_id: PeerId,
    pub kind: UploadRequestKind,
    pub request: Request,
}

/// Where the read pump sends what it can't handle itself. Shared by all peers of a torrent.
#[derive(Clone)]
pub struct PeerWireSinks {
    pub blocks: BlockTx,
    pub uploads: mpsc::Sender<UploadRequest>,
    pub availability: Arc<PieceAvailability>,
    pub block_pool: BufferPool,
}

#[derive(Debug, Clone, Copy)]
pub struct Timestamps {
    pub connected_at: Instant,
    pub last_received: Instant,
    pub last_choke_change: Option<Instant>,
    pub last_interest_change: Option<Instant>,
}

/// Choke and interest flags in both directions, plus what the peer has.
pub struct PeerWireState {
    /// The peer is choking us.
    am_choked: AtomicBool,
    /// We are choking the peer.
    peer_choked: AtomicBool,
    /// We told the peer we want something.
    am_interested: AtomicBool,
    peer_interested: AtomicBool,
    /// Set once a Bitfield or Have arrived, i.e. `bitfield` means something.
    knows_pieces: AtomicBool,
    bitfield: Bitfield,
    timestamps: Mutex<Timestamps>,
    changed: Notify,
}

impl PeerWireState {
    fn new(num_pieces: u32) -> Self {
        let now = Instant::now();
        Self {
            am_choked: AtomicBool::new(true),
            peer_choked: AtomicBool::new(true),
            am_interested: AtomicBool::new(false),
            peer_interested: AtomicBool::new(false),
            knows_pieces: AtomicBool::new(false),
            bitfield: Bitfield::new(num_pieces),
            timestamps: Mutex::new(Timestamps {
                connected_at: now,
                last_received: now,
                last_choke_change: None,
                last_interest_change: None,
            }),
            changed: Notify::new(),
        }
    }

    pub fn am_choked(&self) -> bool {
        self.am_choked.load(Ordering::Acquire)
    }

    pub fn peer_choked(&self) -> bool {
        self.peer_choked.load(Ordering::Acquire)
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested.load(Ordering::Acquire)
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested.load(Ordering::Acquire)
    }

    pub fn knows_pieces(&self) -> bool {
        self.knows_pieces.load(Ordering::Acquire)
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn timestamps(&self) -> Timestamps {
        *self.timestamps.lock()
    }

    fn set_flag(&self, flag: &AtomicBool, value: bool, interest: bool) {
        if flag.swap(value, Ordering::AcqRel) == value {
            return;
        }
        let now = Instant::now();
        let mut ts = self.timestamps.lock();
        if interest {
            ts.last_interest_change = Some(now);
        } else {
            ts.last_choke_change = Some(now);
        }
        drop(ts);
        self.changed.notify_waiters();
    }

    fn set_knows_pieces(&self) {
        self.knows_pieces.store(true, Ordering::Release);
        self.changed.notify_waiters();
    }

    async fn wait_until(&self, cond: impl Fn(&Self) -> bool) {
        loop {
            let changed = self.changed.notified();
            if cond(self) {
                return;
            }
            changed.await;
        }
    }

    /// Resolves once we know something about the peer's pieces.
    pub async fn wait_for_bitfield(&self) {
        self.wait_until(|s| s.knows_pieces()).await
    }

    pub async fn wait_for_unchoke(&self) {
        self.wait_until(|s| !s.am_choked()).await
    }

    /// Resolves on the next Have, Bitfield, choke or interest change.
    pub async fn changed(&self) {
        self.changed.notified().await
    }
}

/// Handle to a live connection. Messages sent through it are serialized right away and
/// queued for the write pump.
pub struct PeerWireClient {
    addr: SocketAddr,
    peer_id: PeerId,
    options: PeerConnectionOptions,
    state: PeerWireState,
    tx: mpsc::Sender<PreparedPacket>,
    packet_pool: BufferPool,
    counters: PeerCounters,
    cancel: CancellationToken,
}

impl PeerWireClient {
    pub fn new(
        addr: SocketAddr,
        peer_id: PeerId,
        num_pieces: u32,
        options: PeerConnectionOptions,
        packet_pool: BufferPool,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<PreparedPacket>) {
        let (tx, rx) = mpsc::channel(options.outbound_queue_len.max(1));
        let client = Self {
            addr,
            peer_id,
            options,
            state: PeerWireState::new(num_pieces),
            tx,
            packet_pool,
            counters: Default::default(),
            cancel,
        };
        (client, rx)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn state(&self) -> &PeerWireState {
        &self.state
    }

    pub fn counters(&self) -> &PeerCounters {
        &self.counters
    }

    pub fn packet_pool(&self) -> &BufferPool {
        &self.packet_pool
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_disconnected(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop both pumps. Queued packets are discarded.
    pub fn disconnect(&self) {
        self.cancel.cancel()
    }

    /// Queue a message, waiting while the queue is full.
    pub async fn send<B: AsRef<[u8]>>(&self, msg: &Message<B>) -> Result<()> {
        let mut packet = self.packet_pool.get();
        msg.serialize(packet.bytes_mut());
        self.send_packet(packet).await?;
        match msg {
            Message::Interested => self.state.set_flag(&self.state.am_interested, true, true),
            Message::NotInterested => self.state.set_flag(&self.state.am_interested, false, true),
            Message::Choke => self.state.set_flag(&self.state.peer_choked, true, false),
            Message::Unchoke => self.state.set_flag(&self.state.peer_choked, false, false),
            _ => {}
        }
        Ok(())
    }

    /// Queue an already serialized message.
    pub async fn send_packet(&self, packet: PreparedPacket) -> Result<()> {
        tokio::select! {
            r = self.tx.send(packet) => r.map_err(|_| Error::ChannelClosed),
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Tell the peer whether we want anything from it, if that changed.
    pub async fn set_interested(&self, interested: bool) -> Result<()> {
        if self.state.am_interested() == interested {
            return Ok(());
        }
        let msg: Message<&[u8]> = if interested {
            Message::Interested
        } else {
            Message::NotInterested
        };
        self.send(&msg).await
    }

    /// Run the connection until either side stops or the client is disconnected.
    ///
    /// `read_buf` must be the buffer the handshake was read with. When this returns, the
    /// outbound queue is closed and drained, and the peer's pieces no longer count
    /// towards availability.
    pub async fn run<S>(
        &self,
        stream: S,
        read_buf: ReadBuf,
        mut rx: mpsc::Receiver<PreparedPacket>,
        sinks: &PeerWireSinks,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let result = {
            let reader = self.read_pump(&mut read_half, read_buf, sinks);
            let writer = self.write_pump(&mut write_half, &mut rx);
            tokio::select! {
                r = reader => {
                    trace!("reader is done, exiting");
                    r
                }
                r = writer => {
                    trace!("writer is done, exiting");
                    r
                }
                _ = self.cancel.cancelled() => {
                    debug!("disconnect requested");
                    Ok(())
                }
            }
        };

        self.cancel.cancel();
        rx.close();
        let mut dropped = 0;
        while let Ok(packet) = rx.try_recv() {
            drop(packet);
            dropped += 1;
        }
        if dropped > 0 {
            trace!(dropped, "discarded queued packets");
        }
        sinks
            .availability
            .on_peer_disconnected(self.state.bitfield());
        result
    }

    async fn write_pump(
        &self,
        w: &mut (impl AsyncWrite + Unpin),
        rx: &mut mpsc::Receiver<PreparedPacket>,
    ) -> Result<()> {
        loop {
            let packet = match tokio::time::timeout(self.options.keep_alive_interval, rx.recv())
                .await
            {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    trace!("outbound queue closed");
                    return Ok(());
                }
                Err(_) => {
                    trace!("sending keep-alive");
                    let mut packet = self.packet_pool.get();
                    Message::<&[u8]>::KeepAlive.serialize(packet.bytes_mut());
                    packet
                }
            };
            with_timeout("writing", self.options.write_timeout, async {
                w.write_all(&packet).await.map_err(Error::Write)
            })
            .await?;
        }
    }

    async fn read_pump(
        &self,
        r: &mut (impl AsyncRead + Unpin),
        mut read_buf: ReadBuf,
        sinks: &PeerWireSinks,
    ) -> Result<()> {
        loop {
            let msg = read_buf
                .read_message(
                    &mut *r,
                    self.options.read_timeout,
                    self.options.max_message_len,
                )
                .await?;
            self.state.timestamps.lock().last_received = Instant::now();
            self.on_message(msg, sinks).await?;
        }
    }

    async fn on_message(&self, msg: MessageBorrowed<'_>, sinks: &PeerWireSinks) -> Result<()> {
        trace!(msg = msg.name(), "received");
        let state = &self.state;
        match msg {
            Message::KeepAlive => {}
            Message::Choke => state.set_flag(&state.am_choked, true, false),
            Message::Unchoke => state.set_flag(&state.am_choked, false, false),
            Message::Interested => state.set_flag(&state.peer_interested, true, true),
            Message::NotInterested => state.set_flag(&state.peer_interested, false, true),
            Message::Have(index) => {
                match state.bitfield.mark_have(index) {
                    Ok(true) => sinks.availability.on_have(index),
                    Ok(false) => {}
                    Err(_) => {
                        warn!(index, "peer sent have for a piece we don't know about, ignoring");
                        return Ok(());
                    }
                }
                state.set_knows_pieces();
            }
            Message::Bitfield(b) => {
                // Validate before touching availability.
                Bitfield::validate_message(state.bitfield.num_pieces(), &b)?;
                sinks.availability.on_peer_disconnected(&state.bitfield);
                state.bitfield.overwrite_from_message(&b)?;
                sinks.availability.on_bitfield(&state.bitfield);
                trace!(pieces = state.bitfield.count_ones(), "peer bitfield");
                state.set_knows_pieces();
            }
            Message::Request(request) => {
                self.forward_upload(sinks, UploadRequestKind::Request, request)
                    .await?
            }
            Message::Cancel(request) => {
                self.forward_upload(sinks, UploadRequestKind::Cancel, request)
                    .await?
            }
            Message::Piece(piece) => {
                let data = sinks.block_pool.get_filled(&piece.block);
                self.counters.on_block_received(data.len());
                sinks
                    .blocks
                    .send(Block {
                        peer_id: self.peer_id,
                        piece_index: piece.index,
                        begin: piece.begin,
                        data,
                    })
                    .await
                    .map_err(|_| Error::ChannelClosed)?;
            }
        }
        Ok(())
    }

    async fn forward_upload(
        &self,
        sinks: &PeerWireSinks,
        kind: UploadRequestKind,
        request: Request,
    ) -> Result<()> {
        sinks
            .uploads
            .send(UploadRequest {
                peer_id: self.peer_id,
                kind,
                request,
            })
            .await
            .map_err(|_| Error::ChannelClosed)
    }
}

impl std::fmt::Debug for PeerWireClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerWireClient")
            .field("addr", &self.addr)
            .field("peer_id", &self.peer_id)
            .finish()
    }
}
