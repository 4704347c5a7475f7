// Owns every torrent session and every connection attempt.
//
// Connections start half-open: a socket that hasn't finished the handshake. Half-open
// attempts, inbound and outbound, share one semaphore. If no permit is free the attempt
// is dropped on the spot. A successful handshake hands the socket to the torrent, which
// keeps it until either side goes away.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use peerswarm_core::{
    InfoHash, PeerId,
    peer_id::generate_peer_id,
    spawn_utils::spawn_with_cancel,
};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::{OwnedSemaphorePermit, Semaphore},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, info, trace, warn};

use crate::{
    error::{Error, HandshakeError, Result},
    handshake::{HalfOpenConnection, inbound_handshake, outbound_handshake},
    listen::{ListenerOptions, accept},
    peer_wire::PeerConnectionOptions,
    reservation::ReservationPolicy,
    torrent::{AddTorrent, InitialHave, TorrentSession},
};

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmOptions {
    /// Generated if not set.
    pub peer_id: Option<PeerId>,

    /// Don't accept incoming connections if not set.
    pub listen: Option<ListenerOptions>,

    /// Connections that haven't completed the handshake yet, inbound and outbound.
    pub max_half_open: usize,

    #[serde_as(as = "serde_with::DurationSeconds")]
    pub reconcile_interval: Duration,

    pub max_peers_per_torrent: usize,

    /// Covers both the TCP connect and the handshake.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub connect_timeout: Duration,

    #[serde_as(as = "serde_with::DurationSeconds")]
    pub handshake_timeout: Duration,

    pub peer_connection: PeerConnectionOptions,
    pub reservation: ReservationPolicy,
}

impl Default for SwarmOptions {
    fn default() -> Self {
        Self {
            peer_id: None,
            listen: None,
            max_half_open: 50,
            reconcile_interval: Duration::from_secs(5),
            max_peers_per_torrent: 50,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            peer_connection: Default::default(),
            reservation: Default::default(),
        }
    }
}

pub struct SwarmManager {
    peer_id: PeerId,
    options: SwarmOptions,
    torrents: DashMap<InfoHash, Arc<TorrentSession>>,
    half_open: Arc<Semaphore>,
    listen_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    span: tracing::Span,
}

impl SwarmManager {
    /// Bind the listener if configured and start the background tasks.
    pub async fn new(options: SwarmOptions) -> anyhow::Result<Arc<Self>> {
        let peer_id = options.peer_id.unwrap_or_else(generate_peer_id);
        let span = error_span!(parent: None, "swarm", peer_id = ?peer_id);

        let listener = match &options.listen {
            Some(l) => Some(l.start().await?),
            None => None,
        };

        let swarm = Arc::new(Self {
            peer_id,
            half_open: Arc::new(Semaphore::new(options.max_half_open)),
            listen_addr: listener.as_ref().map(|l| l.addr),
            torrents: DashMap::new(),
            cancel: CancellationToken::new(),
            span,
            options,
        });

        if let Some(listener) = listener {
            spawn_with_cancel(
                error_span!(parent: swarm.span.clone(), "tcp_listen", addr = %listener.addr),
                swarm.cancel.clone(),
                swarm.clone().task_listener(listener.tcp_socket),
            );
        }
        spawn_with_cancel(
            error_span!(parent: swarm.span.clone(), "reconcile"),
            swarm.cancel.clone(),
            swarm.clone().task_reconcile(),
        );
        Ok(swarm)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn options(&self) -> &SwarmOptions {
        &self.options
    }

    /// Where the listener ended up, if there is one.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// Half-open slots not taken right now.
    pub fn available_half_open(&self) -> usize {
        self.half_open.available_permits()
    }

    pub fn get(&self, info_hash: InfoHash) -> Option<Arc<TorrentSession>> {
        self.torrents.get(&info_hash).map(|t| t.clone())
    }

    pub fn torrents(&self) -> Vec<Arc<TorrentSession>> {
        self.torrents.iter().map(|t| t.clone()).collect()
    }

    /// Whether an incoming handshake for this info hash may be answered.
    pub fn is_served(&self, info_hash: &InfoHash) -> bool {
        self.torrents
            .get(info_hash)
            .is_some_and(|t| !t.is_paused())
    }

    pub async fn add_torrent(&self, add: AddTorrent) -> Result<Arc<TorrentSession>> {
        let info_hash = add.info_hash;
        if self.torrents.contains_key(&info_hash) {
            return Err(Error::TorrentAlreadyExists(info_hash));
        }
        let check = matches!(add.have, InitialHave::Check);
        let session = TorrentSession::new(
            self.peer_id,
            add,
            self.options.peer_connection,
            self.options.reservation,
            self.cancel.child_token(),
        )?;

        if check {
            let s = session.clone();
            let checked = tokio::task::spawn_blocking(move || s.check_existing_pieces())
                .await
                .map_err(|e| Error::Storage(e.into()))
                .and_then(|r| r.map_err(Error::Storage));
            if let Err(e) = checked {
                session.shutdown();
                return Err(e);
            }
        }

        match self.torrents.entry(info_hash) {
            Entry::Occupied(_) => {
                session.shutdown();
                Err(Error::TorrentAlreadyExists(info_hash))
            }
            Entry::Vacant(v) => {
                v.insert(session.clone());
                info!(parent: &self.span, ?info_hash, have = session.have().count_ones(), "added torrent");
                Ok(session)
            }
        }
    }

    pub fn remove_torrent(&self, info_hash: InfoHash) -> Result<Arc<TorrentSession>> {
        let (_, session) = self
            .torrents
            .remove(&info_hash)
            .ok_or(Error::TorrentNotFound(info_hash))?;
        session.drop_all_peers();
        session.shutdown();
        info!(parent: &self.span, ?info_hash, "removed torrent");
        Ok(session)
    }

    /// Remember a peer address for a torrent. It's dialed on the next reconcile.
    pub fn add_peer_addr(&self, info_hash: InfoHash, addr: SocketAddr) -> Result<bool> {
        let session = self.get(info_hash).ok_or(Error::TorrentNotFound(info_hash))?;
        Ok(session.add_peer_addr(addr))
    }

    fn try_acquire_half_open(&self) -> Option<OwnedSemaphorePermit> {
        self.half_open.clone().try_acquire_owned().ok()
    }

    /// Take an accepted socket through the handshake in the background. Returns false if
    /// it was dropped because all half-open slots are busy.
    pub fn accept_incoming<S>(self: &Arc<Self>, stream: S, addr: SocketAddr) -> bool
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Some(permit) = self.try_acquire_half_open() else {
            debug!(parent: &self.span, %addr, "too many half-open connections, dropping incoming");
            return false;
        };
        spawn_with_cancel(
            error_span!(parent: self.span.clone(), "incoming", %addr),
            self.cancel.clone(),
            self.clone()
                .task_incoming(HalfOpenConnection::inbound(stream, addr), permit),
        );
        true
    }

    async fn task_incoming<S>(
        self: Arc<Self>,
        conn: HalfOpenConnection<S>,
        permit: OwnedSemaphorePermit,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let HalfOpenConnection {
            mut stream, addr, ..
        } = conn;
        let handshake = inbound_handshake(
            &mut stream,
            self.peer_id,
            |ih| self.is_served(ih),
            self.options.handshake_timeout,
            self.options.peer_connection.max_message_len,
            &self.cancel,
        )
        .await;
        drop(permit);

        let (handshake, read_buf) = match handshake {
            Ok(h) => h,
            Err(HandshakeError::Cancelled) => return Ok(()),
            Err(e) => {
                debug!("incoming handshake failed: {e:#}");
                return Ok(());
            }
        };
        let Some(session) = self.get(handshake.info_hash) else {
            debug!("torrent went away during the handshake");
            return Ok(());
        };
        if let Err(e) = session.add_peer(stream, addr, handshake, read_buf) {
            debug!("not adding incoming peer: {e:#}");
        }
        Ok(())
    }

    /// Dial `addr` for a torrent in the background. Returns false if the attempt was
    /// dropped because all half-open slots are busy.
    pub(crate) fn connect_outgoing(
        self: &Arc<Self>,
        session: Arc<TorrentSession>,
        addr: SocketAddr,
    ) -> bool {
        let Some(permit) = self.try_acquire_half_open() else {
            trace!(parent: &self.span, %addr, "too many half-open connections, not dialing");
            return false;
        };
        spawn_with_cancel(
            error_span!(parent: self.span.clone(), "outgoing", %addr),
            session.cancellation_token().clone(),
            {
                let this = self.clone();
                async move {
                    let r = this.task_outgoing(&session, addr, permit).await;
                    session.done_connecting(addr);
                    match r {
                        Ok(()) | Err(Error::Cancelled | Error::Handshake(HandshakeError::Cancelled)) => {}
                        Err(e) => debug!("outgoing connection failed: {e:#}"),
                    }
                    Ok(())
                }
            },
        );
        true
    }

    async fn task_outgoing(
        &self,
        session: &Arc<TorrentSession>,
        addr: SocketAddr,
        permit: OwnedSemaphorePermit,
    ) -> Result<()> {
        let info_hash = session.info_hash();
        let connect = async {
            let stream = TcpStream::connect(addr).await.map_err(Error::Connect)?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!("error setting TCP_NODELAY: {e:#}");
            }
            let mut conn = HalfOpenConnection::outbound(stream, addr, info_hash);
            let (handshake, read_buf) = outbound_handshake(
                &mut conn.stream,
                info_hash,
                self.peer_id,
                self.options.handshake_timeout,
                self.options.peer_connection.max_message_len,
                session.cancellation_token(),
            )
            .await?;
            Ok::<_, Error>((conn.stream, handshake, read_buf))
        };
        let (stream, handshake, read_buf) =
            tokio::time::timeout(self.options.connect_timeout, connect)
                .await
                .map_err(|_| Error::Timeout("connect"))??;
        drop(permit);

        if session.is_paused() {
            return Ok(());
        }
        session.add_peer(stream, addr, handshake, read_buf)
    }

    /// One pass of bringing every torrent's connections in line with what it needs.
    pub fn reconcile(self: &Arc<Self>) {
        for session in self.torrents() {
            if session.is_paused() {
                if session.live_peer_count() > 0 {
                    debug!(parent: &self.span, info_hash = ?session.info_hash(), "paused, dropping all peers");
                    session.drop_all_peers();
                }
                continue;
            }

            let removed = session.remove_finished_peers();
            if removed > 0 {
                trace!(parent: &self.span, info_hash = ?session.info_hash(), removed, "removed dead peers");
            }

            if session.is_finished() {
                continue;
            }
            for addr in session.addrs_to_dial(self.options.max_peers_per_torrent) {
                if !session.start_connecting(addr) {
                    continue;
                }
                if !self.connect_outgoing(session.clone(), addr) {
                    session.done_connecting(addr);
                    // Nothing will free up before the next round.
                    return;
                }
            }
        }
    }

    async fn task_reconcile(self: Arc<Self>) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.options.reconcile_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.reconcile();
        }
    }

    async fn task_listener(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            match accept(&listener).await {
                Ok((stream, addr)) => {
                    trace!(%addr, "accepted connection");
                    self.accept_incoming(stream, addr);
                }
                Err(e) => {
                    // Usually out of file descriptors, give it a moment.
                    warn!("{e:#}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Stop all torrents and background tasks.
    pub fn stop(&self) {
        for t in self.torrents.iter() {
            t.drop_all_peers();
            t.shutdown();
        }
        self.torrents.clear();
        self.cancel.cancel();
        info!(parent: &self.span, "stopped");
    }
}

#[cfg(test)]
mod tests {
    use peer_binary_protocol::{HANDSHAKE_LEN, Handshake};
    use peerswarm_core::Id20;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::tests::test_util::{TestTorrent, random_bytes, setup_test_logging, wait_until};

    const T: Duration = Duration::from_secs(5);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    async fn swarm_with_torrent(options: SwarmOptions) -> (Arc<SwarmManager>, TestTorrent) {
        let torrent = TestTorrent::new(random_bytes(100_000, 7), 16384);
        let swarm = SwarmManager::new(options).await.unwrap();
        swarm.add_torrent(torrent.seed()).await.unwrap();
        (swarm, torrent)
    }

    /// Handshake with the swarm as `peer_id` and return our end once it answered.
    async fn connect_as(
        swarm: &Arc<SwarmManager>,
        info_hash: InfoHash,
        peer_id: PeerId,
        port: u16,
    ) -> DuplexStream {
        let (mut ours, theirs) = tokio::io::duplex(1 << 20);
        assert!(swarm.accept_incoming(theirs, addr(port)));
        ours.write_all(&Handshake::new(info_hash, peer_id).to_bytes())
            .await
            .unwrap();
        let mut reply = [0u8; HANDSHAKE_LEN];
        tokio::time::timeout(T, ours.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        let (h, _) = Handshake::deserialize(&reply).unwrap();
        assert_eq!(h.info_hash, info_hash);
        assert_eq!(h.peer_id, swarm.peer_id());
        ours
    }

    /// Read until EOF, ignoring whatever arrives first.
    async fn wait_closed(stream: &mut DuplexStream) {
        let mut buf = vec![0u8; 1 << 16];
        tokio::time::timeout(T, async {
            while stream.read(&mut buf).await.unwrap_or(0) > 0 {}
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_half_open_limit_drops_instead_of_queueing() {
        setup_test_logging();
        let swarm = SwarmManager::new(SwarmOptions {
            max_half_open: 1,
            handshake_timeout: Duration::from_secs(60),
            ..Default::default()
        })
        .await
        .unwrap();

        let (silent, theirs) = tokio::io::duplex(1024);
        assert!(swarm.accept_incoming(theirs, addr(1)));
        assert_eq!(swarm.available_half_open(), 0);

        let (_other, theirs) = tokio::io::duplex(1024);
        assert!(!swarm.accept_incoming(theirs, addr(2)));

        // The silent peer hanging up ends its handshake and frees the slot.
        drop(silent);
        wait_until(
            || {
                if swarm.available_half_open() != 1 {
                    anyhow::bail!("slot not released yet");
                }
                Ok(())
            },
            T,
        )
        .await
        .unwrap();
        swarm.stop();
    }

    #[test]
    fn test_options_fill_in_defaults() {
        let opts: SwarmOptions =
            serde_json::from_str(r#"{"max_half_open": 10, "connect_timeout": 2}"#).unwrap();
        assert_eq!(opts.max_half_open, 10);
        assert_eq!(opts.connect_timeout, Duration::from_secs(2));
        assert_eq!(opts.reconcile_interval, Duration::from_secs(5));
        assert_eq!(opts.max_peers_per_torrent, 50);
        assert!(opts.listen.is_none());
    }

    #[tokio::test]
    async fn test_add_same_torrent_twice() {
        let (swarm, torrent) = swarm_with_torrent(Default::default()).await;
        let err = swarm.add_torrent(torrent.seed()).await.unwrap_err();
        assert!(matches!(err, Error::TorrentAlreadyExists(ih) if ih == torrent.info_hash));
        swarm.stop();
    }

    #[tokio::test]
    async fn test_remove_torrent() {
        let (swarm, torrent) = swarm_with_torrent(Default::default()).await;
        let session = swarm.remove_torrent(torrent.info_hash).unwrap();
        assert!(session.cancellation_token().is_cancelled());
        assert!(swarm.get(torrent.info_hash).is_none());
        assert!(!swarm.is_served(&torrent.info_hash));
        assert!(matches!(
            swarm.remove_torrent(torrent.info_hash),
            Err(Error::TorrentNotFound(_))
        ));
        swarm.stop();
    }

    #[tokio::test]
    async fn test_unknown_info_hash_is_not_answered() {
        let (swarm, _torrent) = swarm_with_torrent(Default::default()).await;
        let (mut ours, theirs) = tokio::io::duplex(1024);
        assert!(swarm.accept_incoming(theirs, addr(1)));
        ours.write_all(&Handshake::new(Id20::new([0xee; 20]), Id20::new([1; 20])).to_bytes())
            .await
            .unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(T, ours.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        swarm.stop();
    }

    #[tokio::test]
    async fn test_connection_to_ourselves_is_dropped() {
        let (swarm, torrent) = swarm_with_torrent(Default::default()).await;
        let mut conn = connect_as(&swarm, torrent.info_hash, swarm.peer_id(), 1).await;
        wait_closed(&mut conn).await;
        assert_eq!(swarm.get(torrent.info_hash).unwrap().live_peer_count(), 0);
        swarm.stop();
    }

    #[tokio::test]
    async fn test_first_connection_per_peer_id_wins() {
        setup_test_logging();
        let (swarm, torrent) = swarm_with_torrent(Default::default()).await;
        let session = swarm.get(torrent.info_hash).unwrap();
        let peer_id = Id20::new([3; 20]);

        let _first = connect_as(&swarm, torrent.info_hash, peer_id, 1).await;
        wait_until(
            || {
                if session.live_peer_count() != 1 {
                    anyhow::bail!("peer not promoted yet");
                }
                Ok(())
            },
            T,
        )
        .await
        .unwrap();

        let mut second = connect_as(&swarm, torrent.info_hash, peer_id, 2).await;
        wait_closed(&mut second).await;

        let live = session.peers().get(&peer_id).unwrap().client.addr();
        assert_eq!(live, addr(1));
        assert_eq!(session.live_peer_count(), 1);
        swarm.stop();
    }

    #[tokio::test]
    async fn test_paused_torrent_drops_peers_on_reconcile() {
        let (swarm, torrent) = swarm_with_torrent(Default::default()).await;
        let session = swarm.get(torrent.info_hash).unwrap();
        let mut conn = connect_as(&swarm, torrent.info_hash, Id20::new([4; 20]), 1).await;
        wait_until(
            || {
                if session.live_peer_count() != 1 {
                    anyhow::bail!("peer not promoted yet");
                }
                Ok(())
            },
            T,
        )
        .await
        .unwrap();

        session.pause();
        assert!(!swarm.is_served(&torrent.info_hash));
        swarm.reconcile();
        assert_eq!(session.live_peer_count(), 0);
        wait_closed(&mut conn).await;

        session.resume();
        assert!(swarm.is_served(&torrent.info_hash));
        swarm.stop();
    }

    #[tokio::test]
    async fn test_reconcile_dials_discovered_peers() {
        setup_test_logging();
        let listener = TcpListener::bind(addr(0)).await.unwrap();
        let listen_addr = listener.local_addr().unwrap();

        let torrent = TestTorrent::new(random_bytes(100_000, 8), 16384);
        let swarm = SwarmManager::new(SwarmOptions {
            reconcile_interval: Duration::from_secs(3600),
            ..Default::default()
        })
        .await
        .unwrap();
        let add = crate::AddTorrent {
            have: InitialHave::Nothing,
            storage: Arc::new(crate::InMemoryStorage::new(100_000).unwrap()),
            ..torrent.seed()
        };
        swarm.add_torrent(add).await.unwrap();
        assert!(swarm.add_peer_addr(torrent.info_hash, listen_addr).unwrap());
        assert!(!swarm.add_peer_addr(torrent.info_hash, listen_addr).unwrap());

        swarm.reconcile();
        let (mut stream, _) = tokio::time::timeout(T, listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut theirs = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut theirs).await.unwrap();
        let (h, _) = Handshake::deserialize(&theirs).unwrap();
        assert_eq!(h.info_hash, torrent.info_hash);
        assert_eq!(h.peer_id, swarm.peer_id());

        // Already connecting, a second reconcile doesn't dial again.
        swarm.reconcile();
        assert!(
            tokio::time::timeout(Duration::from_millis(200), listener.accept())
                .await
                .is_err()
        );
        swarm.stop();
    }
}
