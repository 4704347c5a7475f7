// Everything that belongs to one torrent: what we have, who's connected, what's in flight.
//
// ## Tasks
// Per torrent:
// - "block_consumer" drains Piece payloads from all peers, assembles pieces, verifies them
//   and writes them to storage.
// - "uploader" serves Request messages from all peers out of storage.
// - "reservation_expiry" releases piece reservations whose TTL ran out.
//
// Per peer, one "manage_peer" task runs two futures through tokio::select:
// - the PeerWireClient pumps, which talk to the network;
// - the requester, which picks pieces for this peer and asks for their blocks.
//
// ## Shared state
// There is no torrent-wide lock. Bitfields and availability are atomics, peers and piece
// owners are DashMaps, reservations have their own small mutex.

mod consumer;
mod requester;
mod uploader;

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use buffers::BufferPool;
use dashmap::{DashMap, DashSet, mapref::entry::Entry};
use futures::{StreamExt, stream::FuturesUnordered};
use peer_binary_protocol::{Handshake, Message, PIECE_MESSAGE_DEFAULT_LEN};
use peerswarm_core::{
    InfoHash, PeerId,
    constants::{BLOCK_SIZE, MAX_REQUEST_LEN},
    lengths::Lengths,
    piece_hashes::PieceHashes,
    spawn_utils::{spawn, spawn_with_cancel},
};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Notify, mpsc},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, info, trace};

use crate::{
    availability::PieceAvailability,
    bitfield::Bitfield,
    error::{Error, Result},
    peer_wire::{PeerConnectionOptions, PeerWireClient, PeerWireSinks},
    read_buf::ReadBuf,
    reservation::{PieceReservations, ReservationPolicy},
    stats::{TorrentCounters, TorrentStatsSnapshot},
    storage::TorrentStorage,
    type_aliases::BF,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentSessionOptions {
    /// Size of the blocks we request. Must be a power of two, clamped to the piece length.
    pub block_size: u32,
    /// Received blocks waiting for the consumer, shared by all peers.
    pub block_channel_len: usize,
    /// Requests waiting for the uploader, shared by all peers.
    pub upload_channel_len: usize,
    /// Requests asking for more than this are a protocol violation.
    pub max_request_len: u32,
    /// Idle buffers kept per pool.
    pub max_pooled_buffers: usize,
    /// Only download pieces set here, e.g. the pieces of selected files.
    #[serde(skip)]
    pub allowed_pieces: Option<BF>,
}

impl Default for TorrentSessionOptions {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            block_channel_len: 256,
            upload_channel_len: 256,
            max_request_len: MAX_REQUEST_LEN,
            max_pooled_buffers: 128,
            allowed_pieces: None,
        }
    }
}

/// What we already have when the torrent is added.
#[derive(Debug, Clone, Default)]
pub enum InitialHave {
    #[default]
    Nothing,
    /// Bitfield bytes saved earlier.
    Restored(Vec<u8>),
    /// Hash every piece in storage.
    Check,
}

pub struct AddTorrent {
    pub info_hash: InfoHash,
    pub lengths: Lengths,
    pub hashes: PieceHashes,
    pub storage: Arc<dyn TorrentStorage>,
    pub have: InitialHave,
    pub options: TorrentSessionOptions,
}

/// A live connection and the task running it.
pub struct PeerSession {
    pub client: Arc<PeerWireClient>,
    pub task: tokio::task::JoinHandle<()>,
}

pub struct TorrentSession {
    info_hash: InfoHash,
    peer_id: PeerId,
    lengths: Lengths,
    hashes: PieceHashes,
    storage: Arc<dyn TorrentStorage>,
    options: TorrentSessionOptions,
    peer_options: PeerConnectionOptions,
    reservation_policy: ReservationPolicy,

    have: Bitfield,
    availability: Arc<PieceAvailability>,
    reservations: Arc<PieceReservations>,
    /// The peer each in-flight piece was last requested from.
    piece_owners: DashMap<u32, PeerId>,

    peers: DashMap<PeerId, PeerSession>,
    discovered: DashSet<SocketAddr>,
    connecting: DashSet<SocketAddr>,

    sinks: PeerWireSinks,
    packet_pool: BufferPool,
    counters: TorrentCounters,

    piece_done: Notify,
    finished: Notify,
    paused: AtomicBool,

    cancel: CancellationToken,
    span: tracing::Span,
}

impl TorrentSession {
    pub(crate) fn new(
        peer_id: PeerId,
        add: AddTorrent,
        peer_options: PeerConnectionOptions,
        reservation_policy: ReservationPolicy,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let AddTorrent {
            info_hash,
            lengths,
            hashes,
            storage,
            have,
            options,
        } = add;
        // Requests and assembly follow the configured block size.
        let lengths = Lengths::new(
            lengths.total_length(),
            lengths.default_piece_length(),
            Some(options.block_size),
        )?;
        let num_pieces = lengths.total_pieces();

        let have = match have {
            InitialHave::Restored(bytes) => Bitfield::from_bytes(num_pieces, &bytes)?,
            InitialHave::Nothing | InitialHave::Check => Bitfield::new(num_pieces),
        };
        if let Some(allowed) = &options.allowed_pieces
            && allowed.len() != num_pieces as usize
        {
            return Err(Error::BitfieldLength {
                expected: num_pieces as usize,
                received: allowed.len(),
            });
        }

        let (blocks_tx, blocks_rx) = mpsc::channel(options.block_channel_len.max(1));
        let (uploads_tx, uploads_rx) = mpsc::channel(options.upload_channel_len.max(1));
        let availability = Arc::new(PieceAvailability::new(num_pieces));
        let block_size = lengths.default_block_length() as usize;
        let sinks = PeerWireSinks {
            blocks: blocks_tx,
            uploads: uploads_tx,
            availability: availability.clone(),
            block_pool: BufferPool::new(block_size, options.max_pooled_buffers),
        };

        let session = Arc::new(Self {
            info_hash,
            peer_id,
            lengths,
            hashes,
            storage,
            peer_options,
            reservation_policy,
            have,
            availability,
            reservations: Arc::new(PieceReservations::new(num_pieces)),
            piece_owners: DashMap::new(),
            peers: DashMap::new(),
            discovered: DashSet::new(),
            connecting: DashSet::new(),
            sinks,
            packet_pool: BufferPool::new(PIECE_MESSAGE_DEFAULT_LEN, options.max_pooled_buffers),
            counters: Default::default(),
            piece_done: Notify::new(),
            finished: Notify::new(),
            paused: AtomicBool::new(false),
            span: error_span!(parent: None, "torrent", info_hash = ?info_hash),
            cancel,
            options,
        });

        session.spawn(
            error_span!(parent: session.span.clone(), "block_consumer"),
            session.clone().task_block_consumer(blocks_rx),
        );
        session.spawn(
            error_span!(parent: session.span.clone(), "uploader"),
            session.clone().task_uploader(uploads_rx),
        );
        session.spawn(error_span!(parent: session.span.clone(), "reservation_expiry"), {
            let reservations = session.reservations.clone();
            async move { reservations.run_expiry().await }
        });

        Ok(session)
    }

    pub(crate) fn spawn(
        &self,
        span: tracing::Span,
        fut: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    ) {
        spawn_with_cancel(span, self.cancel.clone(), fut);
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn lengths(&self) -> &Lengths {
        &self.lengths
    }

    pub fn have(&self) -> &Bitfield {
        &self.have
    }

    pub fn availability(&self) -> &PieceAvailability {
        &self.availability
    }

    pub fn reservations(&self) -> &PieceReservations {
        &self.reservations
    }

    pub fn stats(&self) -> TorrentStatsSnapshot {
        self.counters.snapshot(self.peers.len())
    }

    pub fn peers(&self) -> &DashMap<PeerId, PeerSession> {
        &self.peers
    }

    pub fn live_peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// We have every piece we want.
    pub fn is_finished(&self) -> bool {
        match &self.options.allowed_pieces {
            Some(allowed) => allowed
                .iter_ones()
                .all(|i| self.have.has_piece(i as u32).unwrap_or(false)),
            None => self.have.has_all(),
        }
    }

    pub async fn wait_until_finished(&self) {
        loop {
            let finished = self.finished.notified();
            if self.is_finished() {
                return;
            }
            finished.await;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Stop downloading and uploading. Connections are dropped on the next reconcile.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::AcqRel) {
            info!(parent: &self.span, "paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::AcqRel) {
            info!(parent: &self.span, "resumed");
        }
    }

    /// Remember a peer address, e.g. from a tracker. Returns false if it was known.
    pub fn add_peer_addr(&self, addr: SocketAddr) -> bool {
        self.discovered.insert(addr)
    }

    /// Hash every piece in storage and mark the good ones. Blocking.
    pub fn check_existing_pieces(&self) -> anyhow::Result<u32> {
        let mut buf = vec![0u8; self.lengths.default_piece_length() as usize];
        let mut good = 0;
        for index in 0..self.lengths.total_pieces() {
            let Some(valid) = self.lengths.validate_piece_index(index) else {
                continue;
            };
            let len = self.lengths.piece_length(valid) as usize;
            self.storage
                .read(self.lengths.piece_offset(valid), &mut buf[..len])?;
            let Some(expected) = self.hashes.get(valid) else {
                continue;
            };
            if sha1w::sha1_of_parts([&buf[..len]]) == expected.0 {
                self.have.mark_have(index)?;
                good += 1;
            }
        }
        debug!(parent: &self.span, good, total = self.lengths.total_pieces(), "checked existing pieces");
        Ok(good)
    }

    /// Promote a handshaked connection to a running peer. The first connection from a
    /// given peer id wins, later ones are refused.
    pub(crate) fn add_peer<S>(
        self: &Arc<Self>,
        stream: S,
        addr: SocketAddr,
        handshake: Handshake,
        read_buf: ReadBuf,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer_id = handshake.peer_id;
        if peer_id == self.peer_id {
            return Err(Error::ConnectingToOurselves);
        }
        let vacant = match self.peers.entry(peer_id) {
            Entry::Occupied(_) => return Err(Error::DuplicatePeer(peer_id)),
            Entry::Vacant(v) => v,
        };

        let (client, rx) = PeerWireClient::new(
            addr,
            peer_id,
            self.lengths.total_pieces(),
            self.peer_options,
            self.packet_pool.clone(),
            self.cancel.child_token(),
        );
        let client = Arc::new(client);

        // Not spawn_with_cancel: the pumps watch the client's token themselves and have
        // cleanup to do on the way out.
        let task = spawn(
            error_span!(parent: self.span.clone(), "manage_peer", peer = %addr),
            {
                let session = self.clone();
                let client = client.clone();
                async move {
                    session
                        .task_manage_peer(client, stream, read_buf, rx)
                        .await
                }
            },
        );
        vacant.insert(PeerSession { client, task });
        debug!(parent: &self.span, %addr, ?peer_id, "peer is live");
        Ok(())
    }

    async fn task_manage_peer<S>(
        self: Arc<Self>,
        client: Arc<PeerWireClient>,
        stream: S,
        read_buf: ReadBuf,
        rx: mpsc::Receiver<crate::type_aliases::PreparedPacket>,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let requester = async {
            self.send_initial_messages(&client).await?;
            self.task_peer_requester(&client).await?;
            // Nothing to fetch from this peer any more, it can still fetch from us.
            std::future::pending::<()>().await;
            Ok::<_, Error>(())
        }
        .instrument(error_span!("requester"));

        let pump = client.run(stream, read_buf, rx, &self.sinks);
        tokio::pin!(pump);
        let result = tokio::select! {
            r = &mut pump => r,
            r = requester => {
                if let Err(e) = &r {
                    trace!("requester finished: {e:#}");
                }
                client.disconnect();
                pump.await
            }
        };

        self.on_peer_closed(&client);
        match result {
            Ok(()) | Err(Error::Cancelled) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Our bitfield if we have anything, then unchoke: everyone may download from us.
    async fn send_initial_messages(&self, client: &PeerWireClient) -> Result<()> {
        if !self.have.has_none() {
            client
                .send(&Message::Bitfield(self.have.to_bytes()))
                .await?;
            trace!("sent bitfield");
        }
        client.send(&Message::<&[u8]>::Unchoke).await
    }

    fn on_peer_closed(&self, client: &Arc<PeerWireClient>) {
        let peer_id = client.peer_id();
        self.peers
            .remove_if(&peer_id, |_, s| Arc::ptr_eq(&s.client, client));

        // Whatever we were waiting for from this peer can go to someone else.
        let owned: Vec<u32> = self
            .piece_owners
            .iter()
            .filter(|e| *e.value() == peer_id)
            .map(|e| *e.key())
            .collect();
        for index in owned {
            if self
                .piece_owners
                .remove_if(&index, |_, owner| *owner == peer_id)
                .is_some()
            {
                self.reservations.release(index);
            }
        }
        self.piece_done.notify_waiters();
        debug!(parent: &self.span, addr = %client.addr(), ?peer_id, "peer closed");
    }

    /// Tell every connected peer that doesn't have it yet that we now have `index`.
    fn transmit_haves(&self, index: u32) {
        let mut unordered: FuturesUnordered<_> = self
            .peers
            .iter()
            .filter(|p| !p.client.state().bitfield().has_piece(index).unwrap_or(true))
            .map(|p| {
                let client = p.client.clone();
                async move {
                    // Dead peers are cleaned up elsewhere.
                    let _ = client.send(&Message::<&[u8]>::Have(index)).await;
                }
            })
            .collect();

        if unordered.is_empty() {
            trace!(piece = index, "no peers to transmit Have to");
            return;
        }

        self.spawn(
            error_span!(
                parent: self.span.clone(),
                "transmit_haves",
                piece = index,
                count = unordered.len()
            ),
            async move {
                while unordered.next().await.is_some() {}
                Ok(())
            },
        );
    }

    /// Disconnect every peer. Used when the torrent is paused or removed.
    pub(crate) fn drop_all_peers(&self) {
        for p in self.peers.iter() {
            p.client.disconnect();
        }
        self.peers.clear();
    }

    /// Forget peers whose task already ended.
    pub(crate) fn remove_finished_peers(&self) -> usize {
        let before = self.peers.len();
        self.peers.retain(|_, p| !p.task.is_finished());
        before - self.peers.len()
    }

    /// Discovered addresses we aren't connected or connecting to.
    pub(crate) fn addrs_to_dial(&self, cap: usize) -> Vec<SocketAddr> {
        let busy = self.peers.len() + self.connecting.len();
        let budget = cap.saturating_sub(busy);
        if budget == 0 {
            return Vec::new();
        }
        let connected: std::collections::HashSet<SocketAddr> =
            self.peers.iter().map(|p| p.client.addr()).collect();
        self.discovered
            .iter()
            .map(|a| *a)
            .filter(|a| !connected.contains(a) && !self.connecting.contains(a))
            .take(budget)
            .collect()
    }

    pub(crate) fn start_connecting(&self, addr: SocketAddr) -> bool {
        self.connecting.insert(addr)
    }

    pub(crate) fn done_connecting(&self, addr: SocketAddr) {
        self.connecting.remove(&addr);
    }

    /// Stop everything this torrent runs.
    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
        self.peers.clear();
    }
}

impl std::fmt::Debug for TorrentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentSession")
            .field("info_hash", &self.info_hash)
            .field("have", &self.have)
            .field("peers", &self.peers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use peer_binary_protocol::MAX_MSG_LEN;
    use peerswarm_core::Id20;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::{
        storage::InMemoryStorage,
        tests::test_util::{TestTorrent, random_bytes},
    };

    fn leech_session(
        torrent: &TestTorrent,
        options: TorrentSessionOptions,
    ) -> Result<Arc<TorrentSession>> {
        let storage = Arc::new(InMemoryStorage::new(torrent.lengths.total_length()).unwrap());
        TorrentSession::new(
            Id20::new([1; 20]),
            torrent.leech(storage, options),
            Default::default(),
            Default::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_block_size_sets_request_length() {
        let torrent = TestTorrent::new(random_bytes(64 * 1024, 5), 32768);
        let options = TorrentSessionOptions {
            block_size: 4096,
            ..Default::default()
        };
        let session = leech_session(&torrent, options).unwrap();
        assert_eq!(session.lengths().default_block_length(), 4096);

        let (local, mut remote) = tokio::io::duplex(1 << 16);
        session
            .add_peer(
                local,
                "127.0.0.1:1".parse().unwrap(),
                Handshake::new(torrent.info_hash, Id20::new([2; 20])),
                ReadBuf::new(),
            )
            .unwrap();

        // The remote has both pieces and lets us download.
        let mut out = Vec::new();
        Message::<&[u8]>::Bitfield(&[0xc0][..]).serialize(&mut out);
        Message::<&[u8]>::Unchoke.serialize(&mut out);
        remote.write_all(&out).await.unwrap();

        let mut rb = ReadBuf::new();
        let mut requests = Vec::new();
        while requests.len() < 8 {
            let msg = rb
                .read_message(&mut remote, Duration::from_secs(5), MAX_MSG_LEN)
                .await
                .unwrap();
            if let Message::Request(r) = msg {
                requests.push(r);
            }
        }
        let index = requests[0].index;
        assert!(requests.iter().all(|r| r.index == index && r.length == 4096));
        let begins: Vec<u32> = requests.iter().map(|r| r.begin).collect();
        assert_eq!(begins, (0..8).map(|i| i * 4096).collect::<Vec<u32>>());
        session.shutdown();
    }

    #[tokio::test]
    async fn test_block_size_must_be_power_of_two() {
        let torrent = TestTorrent::new(random_bytes(64 * 1024, 6), 32768);
        let options = TorrentSessionOptions {
            block_size: 5000,
            ..Default::default()
        };
        assert!(matches!(
            leech_session(&torrent, options),
            Err(Error::Core(_))
        ));
    }
}
