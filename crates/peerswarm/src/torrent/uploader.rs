use std::{collections::VecDeque, sync::Arc, sync::atomic::Ordering};

use anyhow::Context;
use peer_binary_protocol::{Request, serialize_piece_preamble};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::{
    peer_wire::{UploadRequest, UploadRequestKind},
    torrent::TorrentSession,
};

impl TorrentSession {
    /// Serve Request messages from all peers, in arrival order. A Cancel drops the
    /// matching request if it's still queued.
    pub(super) async fn task_uploader(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<UploadRequest>,
    ) -> anyhow::Result<()> {
        let mut queue: VecDeque<UploadRequest> = VecDeque::new();
        loop {
            if queue.is_empty() {
                match rx.recv().await {
                    Some(r) => enqueue(&mut queue, r),
                    None => return Ok(()),
                }
            }
            while let Ok(r) = rx.try_recv() {
                enqueue(&mut queue, r);
            }
            let Some(next) = queue.pop_front() else {
                continue;
            };
            self.serve(next).await;
        }
    }

    fn is_valid_request(&self, r: &Request) -> bool {
        let Some(valid) = self.lengths.validate_piece_index(r.index) else {
            return false;
        };
        if r.length == 0 || r.length > self.options.max_request_len {
            return false;
        }
        match r.begin.checked_add(r.length) {
            Some(end) => end <= self.lengths.piece_length(valid),
            None => false,
        }
    }

    async fn serve(self: &Arc<Self>, r: UploadRequest) {
        let Some(client) = self.peers.get(&r.peer_id).map(|p| p.client.clone()) else {
            trace!(peer_id = ?r.peer_id, "requesting peer is gone");
            return;
        };
        let req = r.request;
        if self.is_paused() {
            return;
        }
        if !self.is_valid_request(&req) {
            warn!(addr = %client.addr(), ?req, "invalid request, disconnecting");
            client.disconnect();
            return;
        }
        if !self.have.has_piece(req.index).unwrap_or(false) {
            debug!(addr = %client.addr(), piece = req.index, "peer requested a piece we don't have");
            return;
        }
        if client.state().peer_choked() {
            trace!(?req, "ignoring request from a choked peer");
            return;
        }

        let mut packet = client.packet_pool().get();
        let preamble_len =
            serialize_piece_preamble(req.index, req.begin, req.length, packet.bytes_mut());
        packet.resize(preamble_len + req.length as usize);

        let packet = {
            let session = self.clone();
            tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
                let valid = session
                    .lengths
                    .validate_piece_index(req.index)
                    .context("bug: invalid piece index")?;
                let offset = session.lengths.piece_offset(valid) + req.begin as u64;
                session
                    .storage
                    .read(offset, &mut packet[preamble_len..])
                    .with_context(|| format!("error reading {req:?} from storage"))?;
                Ok(packet)
            })
            .await
        };
        let packet = match packet {
            Ok(Ok(p)) => p,
            Ok(Err(e)) => {
                warn!("{e:#}");
                return;
            }
            Err(e) => {
                warn!("upload read task failed: {e:#}");
                return;
            }
        };

        if client.send_packet(packet).await.is_err() {
            return;
        }
        client.counters().on_block_uploaded(req.length as usize);
        self.counters
            .uploaded_bytes
            .fetch_add(req.length as u64, Ordering::Relaxed);
    }
}

fn enqueue(queue: &mut VecDeque<UploadRequest>, r: UploadRequest) {
    match r.kind {
        UploadRequestKind::Request => queue.push_back(r),
        UploadRequestKind::Cancel => {
            queue.retain(|q| !(q.peer_id == r.peer_id && q.request == r.request));
        }
    }
}
