//! A download session: the content being downloaded and the peers it is
//! downloaded from.
//!
//! Everything in here runs on the task that owns the [`Download`], which
//! serializes the access to the content and the availability of the swarm.
//! Connections hand over the bytes they receive with [`Download::receive`]
//! and ask for more work with [`Download::request_blocks`].
//!
//! Chunks are read and written through the [`Storage`] of the content in the
//! same call that completes them. [`DiskStorage`](crate::content::storage::DiskStorage)
//! does blocking file I/O, so a session over it must run off the worker
//! threads of the runtime, for example inside
//! [`tokio::task::spawn_blocking`] or on a dedicated thread.
use std::{net::SocketAddr, time::Duration};

use bytes::Bytes;
use hashbrown::HashMap;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::{
    bitfield::{Bitfield, VczBitfield},
    check,
    config::Config,
    content::{storage::Storage, Content, Priority},
    counter::Counter,
    error::Error,
    peer::Peer,
    piece::{Piece, BLOCK_LEN},
    ranges::Ranges,
    swarm::{PeerHandle, Swarm},
    wire::Message,
};

/// Requests that were not answered after this long are given back, so that
/// other peers can be asked.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A chunk that is being assembled from blocks.
#[derive(Debug)]
struct PartialChunk {
    /// Byte spans of the chunk that were received.
    received: Ranges<u32>,
    /// Byte spans of the chunk that were requested and not received yet.
    requested: Ranges<u32>,
    data: Vec<u8>,
}

impl PartialChunk {
    fn new(len: u32) -> Self {
        Self {
            received: Ranges::default(),
            requested: Ranges::default(),
            data: vec![0; len as usize],
        }
    }
}

pub struct Download<S: Storage> {
    content: Content<S>,
    swarm: Swarm,
    pending: HashMap<u32, PartialChunk>,
    counter: Counter,
    max_message_size: u32,
    /// Outstanding requests to each peer.
    max_requests: usize,
    /// Queued requests from each peer.
    max_incoming_requests: usize,
}

impl<S: Storage> Download<S> {
    /// Message size and request limits are taken from `config`.
    ///
    /// # Panics
    /// If the content is not open.
    pub fn new(content: Content<S>, config: &Config, now: Instant) -> Self {
        assert!(content.is_open(), "a download needs an open content");

        let swarm = Swarm::new(content.chunk_total() as usize);

        Self {
            content,
            swarm,
            pending: HashMap::new(),
            counter: Counter::new(now),
            max_message_size: config.max_message_size,
            max_requests: config.max_requests as usize,
            max_incoming_requests: config.max_incoming_requests as usize,
        }
    }

    pub fn content(&self) -> &Content<S> {
        &self.content
    }

    pub fn content_mut(&mut self) -> &mut Content<S> {
        &mut self.content
    }

    pub fn swarm(&self) -> &Swarm {
        &self.swarm
    }

    pub fn counter(&self) -> &Counter {
        &self.counter
    }

    pub fn peer(&self, handle: PeerHandle) -> Option<&Peer> {
        self.swarm.get(handle)
    }

    pub fn peer_mut(&mut self, handle: PeerHandle) -> Option<&mut Peer> {
        self.swarm.get_mut(handle)
    }

    /// Chunks being assembled.
    pub fn pending(&self) -> impl Iterator<Item = u32> + '_ {
        self.pending.keys().copied()
    }

    pub fn is_done(&self) -> bool {
        self.content.is_done()
    }

    /// Add a newly connected peer, and queue our bitfield to it.
    pub fn add_peer(&mut self, addr: SocketAddr) -> PeerHandle {
        let chunks = self.content.chunk_total() as usize;
        let mut peer = Peer::new(addr, chunks, self.max_message_size);

        if let Some(bitfield) = self.content.bitfield() {
            if bitfield.any() {
                peer.send(Message::Bitfield(Bytes::copy_from_slice(
                    bitfield.as_raw_slice(),
                )));
            }
        }

        let handle = self.swarm.insert(peer);
        debug!("new peer {addr} {handle:?}");
        handle
    }

    /// Drop a peer and give back every block that was requested from it.
    pub fn remove_peer(&mut self, handle: PeerHandle) -> Option<Peer> {
        let peer = self.swarm.remove(handle)?;
        self.release_requests(peer.outgoing_requests.iter().map(|(p, _)| p));
        Some(peer)
    }

    /// Queue an unchoke, the peer is allowed to download from us.
    pub fn unchoke(&mut self, handle: PeerHandle) -> Result<(), Error> {
        let peer =
            self.swarm.get_mut(handle).ok_or(Error::PeerNotFound(handle))?;

        if peer.state.am_choking {
            peer.state.am_choking = false;
            peer.send(Message::Unchoke);
        }

        Ok(())
    }

    /// Handle the bytes that a peer sent us.
    ///
    /// Every complete message is handled in order. Blocks are assembled into
    /// chunks and every chunk that passes the hash check is written and
    /// marked done.
    ///
    /// On a protocol error the peer is removed and the error returned.
    #[tracing::instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub fn receive(
        &mut self,
        handle: PeerHandle,
        bytes: &[u8],
        now: Instant,
    ) -> Result<(), Error> {
        let peer =
            self.swarm.get_mut(handle).ok_or(Error::PeerNotFound(handle))?;
        peer.inbox.extend_from_slice(bytes);

        loop {
            let r = match self.next_message(handle) {
                Ok(Some(msg)) => self.handle_message(handle, msg, now),
                Ok(None) => return Ok(()),
                Err(e) => Err(e),
            };

            if let Err(e) = r {
                if e.is_protocol() {
                    warn!("dropping peer {handle:?}: {e}");
                    self.remove_peer(handle);
                }
                return Err(e);
            }
        }
    }

    /// Answer every block that the peer requested and did not cancel,
    /// returns how many were queued.
    pub fn serve_requests(
        &mut self,
        handle: PeerHandle,
    ) -> Result<usize, Error> {
        let peer =
            self.swarm.get_mut(handle).ok_or(Error::PeerNotFound(handle))?;
        let requests = std::mem::take(&mut peer.incoming_requests);

        let mut blocks = Vec::with_capacity(requests.len());
        let mut chunk: Option<(u32, Vec<u8>)> = None;

        for piece in requests {
            let Some(index) = piece.chunk() else { continue };

            // consecutive requests are usually for the same chunk.
            if chunk.as_ref().map(|(i, _)| *i) != Some(index) {
                chunk = Some((index, self.content.read_chunk(index)?));
            }
            let Some((_, bytes)) = &chunk else { continue };

            let block = Bytes::copy_from_slice(
                &bytes[piece.offset as usize..piece.end() as usize],
            );
            blocks.push(Message::Piece(piece, block));
        }

        let served = blocks.len();
        let peer =
            self.swarm.get_mut(handle).ok_or(Error::PeerNotFound(handle))?;

        for block in blocks {
            peer.send(block);
        }

        trace!("served {served} blocks to {}", peer.addr);

        Ok(served)
    }

    /// Pick up to `n` blocks to request from the peer, queue the requests and
    /// return them. No more than `max_requests` are ever in flight to a peer.
    ///
    /// Chunks that are already being assembled come first, then chunks with a
    /// higher priority, then the rarest. Blocks that were received or are
    /// requested from any peer are never picked.
    pub fn request_blocks(
        &mut self,
        handle: PeerHandle,
        n: usize,
        now: Instant,
    ) -> Result<Vec<Piece>, Error> {
        let peer = self.swarm.get(handle).ok_or(Error::PeerNotFound(handle))?;

        let n = n.min(
            self.max_requests.saturating_sub(peer.outgoing_requests.len()),
        );

        if peer.state.peer_choking || n == 0 {
            return Ok(Vec::new());
        }

        let Some(local) = self.content.bitfield() else {
            panic!("the content of a download was closed");
        };

        let mut order = self.swarm.rarest(handle, local)?;
        order.retain(|i| self.chunk_priority(*i as u32) != Priority::Off);
        order.sort_by_key(|i| {
            let index = *i as u32;
            (
                !self.pending.contains_key(&index),
                std::cmp::Reverse(self.chunk_priority(index)),
            )
        });

        let mut requests = Vec::with_capacity(n);

        'chunks: for index in order {
            let index = index as u32;
            let len = self.content.chunk_length(index);
            let partial = self
                .pending
                .entry(index)
                .or_insert_with(|| PartialChunk::new(len));

            for offset in (0..len).step_by(BLOCK_LEN as usize) {
                let end = (offset + BLOCK_LEN).min(len);

                if partial.received.covers(offset, end)
                    || partial.requested.covers(offset, end)
                {
                    continue;
                }

                partial.requested.insert(offset, end);
                requests.push(Piece::new(index as i32, offset, end - offset));

                if requests.len() == n {
                    break 'chunks;
                }
            }
        }

        let peer =
            self.swarm.get_mut(handle).ok_or(Error::PeerNotFound(handle))?;

        for piece in &requests {
            peer.outgoing_requests.push((*piece, now));
            peer.send(Message::Request(*piece));
        }

        trace!("requested {} blocks from {}", requests.len(), peer.addr);

        Ok(requests)
    }

    /// Refresh the transfer rates and give back the requests that timed out.
    pub fn tick(&mut self, now: Instant) {
        self.counter.update_rates(now);

        let mut timed_out = Vec::new();

        for (handle, peer) in self.swarm.iter_mut() {
            peer.outgoing_requests.retain(|(piece, requested_at)| {
                let elapsed = now.saturating_duration_since(*requested_at);
                let expired = elapsed >= REQUEST_TIMEOUT;
                if expired {
                    debug!("{handle:?} block {piece:?} timed out");
                    timed_out.push(*piece);
                }
                !expired
            });
        }

        self.release_requests(timed_out.iter());
    }

    /// Frame the next message of the inbox of the peer.
    fn next_message(
        &mut self,
        handle: PeerHandle,
    ) -> Result<Option<Message>, Error> {
        let peer =
            self.swarm.get_mut(handle).ok_or(Error::PeerNotFound(handle))?;
        let content = &self.content;
        let pending = &self.pending;

        let skipped_before = peer.reader.skipped();

        let msg = peer.reader.advance(&mut peer.inbox, |piece| {
            wants_block(content, pending, piece)
        })?;

        let skipped = peer.reader.skipped() - skipped_before;
        if skipped > 0 {
            self.counter.wasted.record(skipped);
        }

        Ok(msg)
    }

    fn handle_message(
        &mut self,
        handle: PeerHandle,
        msg: Message,
        now: Instant,
    ) -> Result<(), Error> {
        let chunks = self.content.chunk_total();
        let peer =
            self.swarm.get_mut(handle).ok_or(Error::PeerNotFound(handle))?;

        if msg == Message::KeepAlive {
            trace!("< keepalive");
            return Ok(());
        }

        let first = peer.messages_received == 0;
        peer.messages_received += 1;

        match msg {
            Message::KeepAlive => {}
            Message::Bitfield(bytes) => {
                if !first {
                    return Err(Error::UnexpectedBitfield);
                }

                let bitfield = Bitfield::from_wire(&bytes, chunks as usize)?;

                debug!(
                    "< bitfield len: {} ones: {}",
                    bitfield.len(),
                    bitfield.count_ones()
                );

                self.swarm.set_bitfield(handle, bitfield)?;
                self.update_interest(handle);
            }
            Message::Have(index) => {
                if index >= chunks {
                    return Err(Error::PieceIndexInvalid(index));
                }

                trace!("< have {index}");

                if self.swarm.have(handle, index as usize)? {
                    self.update_interest(handle);
                }
            }
            Message::Choke => {
                debug!("< choke");
                peer.state.peer_choking = true;
                let in_flight: Vec<Piece> = peer
                    .outgoing_requests
                    .drain(..)
                    .map(|(piece, _)| piece)
                    .collect();
                self.release_requests(in_flight.iter());
            }
            Message::Unchoke => {
                debug!("< unchoke");
                peer.state.peer_choking = false;
            }
            Message::Interested => {
                debug!("< interested");
                peer.state.peer_interested = true;
            }
            Message::NotInterested => {
                debug!("< not_interested");
                peer.state.peer_interested = false;
            }
            Message::Request(piece) => {
                trace!("< request {piece:?}");
                self.handle_request(handle, piece)?;
            }
            Message::Cancel(piece) => {
                trace!("< cancel {piece:?}");
                peer.incoming_requests.retain(|p| *p != piece);
            }
            Message::Piece(piece, block) => {
                self.handle_block(handle, piece, block)?;
            }
            Message::Port(port) => {
                trace!("< port {port}");
            }
            Message::Extended(id, payload) => {
                trace!("< extended {id} with {} bytes", payload.len());
            }
        }

        Ok(())
    }

    /// Queue a request of the peer, if we have the block, we're not choking
    /// them and their queue is not full.
    fn handle_request(
        &mut self,
        handle: PeerHandle,
        piece: Piece,
    ) -> Result<(), Error> {
        let servable = piece.is_acceptable_request()
            && piece.chunk().is_some_and(|index| {
                self.content.has(index)
                    && piece.end() <= self.content.chunk_length(index)
            });

        let peer =
            self.swarm.get_mut(handle).ok_or(Error::PeerNotFound(handle))?;

        if peer.state.am_choking || !servable {
            debug!("ignoring request {piece:?}");
            return Ok(());
        }

        if peer.incoming_requests.len() >= self.max_incoming_requests {
            debug!("request queue of {} is full, ignoring {piece:?}", peer.addr);
            return Ok(());
        }

        if !peer.incoming_requests.contains(&piece) {
            peer.incoming_requests.push(piece);
        }

        Ok(())
    }

    fn handle_block(
        &mut self,
        handle: PeerHandle,
        piece: Piece,
        block: Bytes,
    ) -> Result<(), Error> {
        let Some(index) = piece.chunk() else {
            return Err(Error::PieceIndexInvalid(piece.index as u32));
        };

        let len = self.content.chunk_length(index);

        if piece.length == 0 || piece.end() > len {
            return Err(Error::BlockInvalid {
                index,
                offset: piece.offset,
                len: piece.length,
            });
        }

        if let Some(peer) = self.swarm.get_mut(handle) {
            peer.remove_request(&piece);
        }

        let Some(partial) = self.pending.get_mut(&index) else {
            return Ok(());
        };

        partial.data[piece.offset as usize..piece.end() as usize]
            .copy_from_slice(&block);
        partial.received.insert(piece.offset, piece.end());
        partial.requested.erase(piece.offset, piece.end());

        self.counter.downloaded.record(piece.length as u64);

        if partial.received.covers(0, len) {
            self.finish_chunk(index)?;
        }

        Ok(())
    }

    /// Verify, write and mark a chunk that was fully received.
    fn finish_chunk(&mut self, index: u32) -> Result<(), Error> {
        let Some(partial) = self.pending.remove(&index) else {
            return Ok(());
        };

        // the same blocks could still be in flight from other peers.
        for (_, peer) in self.swarm.iter_mut() {
            peer.outgoing_requests
                .retain(|(p, _)| p.chunk() != Some(index));
        }

        if !check::verify(&self.content, index, &partial.data) {
            warn!("chunk {index} failed the hash check");
            self.counter.wasted.record(partial.data.len() as u64);
            return Ok(());
        }

        self.content.write_chunk(index, &partial.data)?;
        self.content.mark_done(index);

        let handles: Vec<PeerHandle> =
            self.swarm.iter().map(|(h, _)| h).collect();

        for handle in handles {
            if let Some(peer) = self.swarm.get_mut(handle) {
                if !peer.has(index as usize) {
                    peer.send(Message::Have(index));
                }
            }
            self.update_interest(handle);
        }

        if self.content.is_done() {
            info!("downloaded {} bytes", self.content.total_size());
        }

        Ok(())
    }

    /// Send Interested or NotInterested when it changed.
    fn update_interest(&mut self, handle: PeerHandle) {
        let Some(local) = self.content.bitfield() else { return };
        let Some(peer) = self.swarm.get_mut(handle) else { return };

        let interested = peer
            .bitfield
            .iter_ones()
            .any(|i| !local.get(i).is_some_and(|b| *b));

        if interested != peer.state.am_interested {
            peer.state.am_interested = interested;
            peer.send(if interested {
                Message::Interested
            } else {
                Message::NotInterested
            });
        }
    }

    /// Make the spans of these requests available to be requested again.
    fn release_requests<'a>(&mut self, pieces: impl Iterator<Item = &'a Piece>) {
        let mut released: HashMap<u32, Ranges<u32>> = HashMap::new();

        for piece in pieces {
            let Some(index) = piece.chunk() else { continue };
            if piece.length > 0 {
                released
                    .entry(index)
                    .or_default()
                    .insert(piece.offset, piece.end());
            }
        }

        for (index, spans) in released {
            if let Some(partial) = self.pending.get_mut(&index) {
                partial.requested.intersect(&spans);
            }
        }
    }

    /// The highest priority of the files that the chunk touches.
    fn chunk_priority(&self, index: u32) -> Priority {
        self.content
            .chunk_spans(index)
            .iter()
            .map(|span| self.content.files()[span.file].priority())
            .max()
            .unwrap_or_default()
    }
}

/// If a block is worth reading: it belongs to a chunk being assembled and
/// was not received yet.
fn wants_block<S: Storage>(
    content: &Content<S>,
    pending: &HashMap<u32, PartialChunk>,
    piece: &Piece,
) -> bool {
    let Some(index) = piece.chunk() else { return false };

    index < content.chunk_total()
        && !content.has(index)
        && piece.length > 0
        && pending
            .get(&index)
            .is_some_and(|p| !p.received.covers(piece.offset, piece.end()))
}
