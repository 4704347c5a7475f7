use std::time::Duration;

use peer_binary_protocol::{Message, Request};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use tracing::{debug, trace};

use crate::{
    bitfield::Bitfield,
    error::Result,
    peer_wire::PeerWireClient,
    piece_selection::{PieceSuggestion, SelectionInput, suggest_piece},
    torrent::TorrentSession,
};

// When there is nothing to ask a peer for, look again at least this often.
const NOTHING_TO_REQUEST_RECHECK: Duration = Duration::from_secs(1);

impl TorrentSession {
    fn suggest_for(&self, peer: &Bitfield, reserved: bool, rng: &mut impl Rng) -> PieceSuggestion {
        let mut input = SelectionInput::new(&self.have, peer, self.lengths.total_pieces())
            .availability(&*self.availability);
        if reserved {
            input = input.reserved(self.reservations.reserved());
        }
        if let Some(allowed) = &self.options.allowed_pieces {
            input = input.allowed(allowed);
        }
        suggest_piece(&input, rng)
    }

    /// Keep this peer busy with one piece at a time until we're done or it goes away.
    pub(super) async fn task_peer_requester(&self, client: &PeerWireClient) -> Result<()> {
        let state = client.state();
        state.wait_for_bitfield().await;
        let mut rng = SmallRng::from_rng(&mut rand::rng());

        loop {
            if self.is_finished() {
                client.set_interested(false).await?;
                if state.bitfield().has_all() {
                    debug!("both we and the peer have everything, disconnecting");
                    client.disconnect();
                }
                return Ok(());
            }
            if self.is_paused() {
                return Ok(());
            }

            let index = match self.suggest_for(state.bitfield(), true, &mut rng) {
                PieceSuggestion::Piece(index) => index,
                PieceSuggestion::Complete | PieceSuggestion::NoneAvailable => {
                    // Maybe everything it has is just reserved by other peers right now.
                    let wanted = self
                        .suggest_for(state.bitfield(), false, &mut rng)
                        .piece()
                        .is_some();
                    client.set_interested(wanted).await?;
                    let piece_done = self.piece_done.notified();
                    tokio::select! {
                        _ = state.changed() => {},
                        _ = piece_done => {},
                        _ = tokio::time::sleep(NOTHING_TO_REQUEST_RECHECK) => {},
                    }
                    continue;
                }
            };

            client.set_interested(true).await?;
            if state.am_choked() {
                trace!("waiting for unchoke");
                state.wait_for_unchoke().await;
                continue;
            }

            let Some(valid) = self.lengths.validate_piece_index(index) else {
                continue;
            };
            let ttl = self
                .reservation_policy
                .ttl(self.have.completion_ratio());
            if !self.reservations.try_reserve(index, ttl) {
                // Lost the race to another peer's requester.
                continue;
            }
            self.piece_owners.insert(index, client.peer_id());
            let deadline = tokio::time::Instant::now() + ttl;

            for block in self.lengths.iter_block_infos(valid) {
                client
                    .send(&Message::<&[u8]>::Request(Request::new(
                        index,
                        block.offset,
                        block.size,
                    )))
                    .await?;
            }
            trace!(piece = index, ?ttl, "requested piece");

            loop {
                let piece_done = self.piece_done.notified();
                if self.have.has_piece(index).unwrap_or(false)
                    || !self.reservations.is_reserved(index)
                {
                    break;
                }
                if tokio::time::timeout_at(deadline, piece_done).await.is_err() {
                    debug!(piece = index, "reservation ran out before the piece arrived");
                    break;
                }
            }
        }
    }
}
