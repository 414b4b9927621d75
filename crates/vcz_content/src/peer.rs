//! State of a connection with a remote peer.
//!
//! There is no socket in here: the transport feeds received bytes to
//! [`Download::receive`](crate::download::Download::receive) and sends what
//! [`Peer::take_outbox`] returns, encoded with
//! [`MessageCodec`](crate::wire::codec::MessageCodec).
use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::time::Instant;

use crate::{
    bitfield::{Bitfield, VczBitfield},
    piece::Piece,
    wire::{read::ProtocolRead, Message},
};

/// Choke and interest flags of both sides of a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerState {
    /// If we're choking, we don't allow the peer to download from us.
    pub am_choking: bool,

    /// If we're interested, peer has pieces that we don't have.
    pub am_interested: bool,

    /// If peer is choking, we can't download pieces from them.
    pub peer_choking: bool,

    /// If peer is interested in us, they mean to download pieces that we have.
    pub peer_interested: bool,
}

impl Default for PeerState {
    /// By default, both sides of the connection start off as choked and not
    /// interested in the other.
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

#[derive(Debug)]
pub struct Peer {
    pub addr: SocketAddr,
    pub state: PeerState,
    /// Chunks that the peer has, always one bit per chunk.
    pub(crate) bitfield: Bitfield,
    pub(crate) reader: ProtocolRead,
    /// Received bytes that were not framed yet.
    pub(crate) inbox: BytesMut,
    /// Messages waiting to be sent to the peer.
    pub(crate) outbox: Vec<Message>,
    /// Blocks we requested and when.
    pub(crate) outgoing_requests: Vec<(Piece, Instant)>,
    /// Blocks the peer requested from us.
    pub(crate) incoming_requests: Vec<Piece>,
    /// Messages received, not counting keep-alives.
    pub(crate) messages_received: u64,
}

impl Peer {
    /// `max_message_size` bounds the declared length of every message that
    /// the peer sends.
    pub fn new(addr: SocketAddr, chunks: usize, max_message_size: u32) -> Self {
        Self {
            addr,
            state: PeerState::default(),
            bitfield: Bitfield::from_piece(chunks),
            reader: ProtocolRead::new(max_message_size),
            inbox: BytesMut::new(),
            outbox: Vec::new(),
            outgoing_requests: Vec::new(),
            incoming_requests: Vec::new(),
            messages_received: 0,
        }
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn has(&self, index: usize) -> bool {
        self.bitfield.get(index).is_some_and(|b| *b)
    }

    pub fn reader(&self) -> &ProtocolRead {
        &self.reader
    }

    pub fn outgoing_requests(&self) -> impl Iterator<Item = &Piece> {
        self.outgoing_requests.iter().map(|(p, _)| p)
    }

    pub fn incoming_requests(&self) -> &[Piece] {
        &self.incoming_requests
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    pub fn send(&mut self, msg: Message) {
        self.outbox.push(msg);
    }

    /// Take every message queued for this peer, in order.
    pub fn take_outbox(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbox)
    }

    /// Remove a request we sent, returns false if it was never sent.
    pub(crate) fn remove_request(&mut self, piece: &Piece) -> bool {
        let before = self.outgoing_requests.len();
        self.outgoing_requests.retain(|(p, _)| p != piece);
        before != self.outgoing_requests.len()
    }
}
