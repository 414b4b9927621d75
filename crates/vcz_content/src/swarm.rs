//! The peers of a download and how many of them have each chunk.
//!
//! Peers live in an arena and are addressed by [`PeerHandle`]s. A handle
//! carries the generation of its slot, so a handle to a peer that was removed
//! never resolves to the peer that took its slot later.
use tracing::debug;

use crate::{
    availability::BitfieldCounter, bitfield::Bitfield, error::Error,
    peer::Peer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    peer: Option<Peer>,
}

/// Arena of peers that keeps the availability of every chunk in sync with
/// the bitfields of the peers in it.
#[derive(Debug)]
pub struct Swarm {
    slots: Vec<Slot>,
    free: Vec<u32>,
    availability: BitfieldCounter,
    len: usize,
}

impl Swarm {
    pub fn new(chunks: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            availability: BitfieldCounter::new(chunks),
            len: 0,
        }
    }

    /// Add a peer. Whatever it has in its bitfield counts as available.
    ///
    /// # Panics
    /// If the bitfield of the peer does not have one bit per chunk.
    pub fn insert(&mut self, peer: Peer) -> PeerHandle {
        self.availability.inc(&peer.bitfield);
        self.len += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.peer = Some(peer);
            return PeerHandle { index, generation: slot.generation };
        }

        self.slots.push(Slot { generation: 0, peer: Some(peer) });
        PeerHandle { index: self.slots.len() as u32 - 1, generation: 0 }
    }

    /// Remove a peer, its chunks are no longer available. Every handle to it
    /// becomes stale.
    pub fn remove(&mut self, handle: PeerHandle) -> Option<Peer> {
        let slot = self.slot_mut(handle)?;
        let peer = slot.peer.take()?;

        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        self.availability.dec(&peer.bitfield);

        debug!("removed peer {}", peer.addr);

        Some(peer)
    }

    pub fn get(&self, handle: PeerHandle) -> Option<&Peer> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.peer.as_ref())
    }

    pub fn get_mut(&mut self, handle: PeerHandle) -> Option<&mut Peer> {
        self.slot_mut(handle).and_then(|s| s.peer.as_mut())
    }

    pub fn contains(&self, handle: PeerHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerHandle, &Peer)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            let handle =
                PeerHandle { index: i as u32, generation: s.generation };
            s.peer.as_ref().map(|p| (handle, p))
        })
    }

    pub fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = (PeerHandle, &mut Peer)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, s)| {
            let handle =
                PeerHandle { index: i as u32, generation: s.generation };
            s.peer.as_mut().map(|p| (handle, p))
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Replace the bitfield of a peer.
    ///
    /// # Panics
    /// If `bitfield` does not have one bit per chunk.
    pub fn set_bitfield(
        &mut self,
        handle: PeerHandle,
        bitfield: Bitfield,
    ) -> Result<(), Error> {
        let Some(peer) = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.peer.as_mut())
        else {
            return Err(Error::PeerNotFound(handle));
        };

        self.availability.dec(&peer.bitfield);
        self.availability.inc(&bitfield);
        peer.bitfield = bitfield;

        Ok(())
    }

    /// The peer announced that it has a chunk, returns false if we already
    /// knew.
    pub fn have(
        &mut self,
        handle: PeerHandle,
        index: usize,
    ) -> Result<bool, Error> {
        let Some(peer) = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.peer.as_mut())
        else {
            return Err(Error::PeerNotFound(handle));
        };

        if peer.bitfield[index] {
            return Ok(false);
        }

        peer.bitfield.set(index, true);
        self.availability.inc_piece(index);

        Ok(true)
    }

    pub fn availability(&self) -> &BitfieldCounter {
        &self.availability
    }

    /// The chunks that the peer has and `local` doesn't, rarest first.
    pub fn rarest(
        &self,
        handle: PeerHandle,
        local: &Bitfield,
    ) -> Result<Vec<usize>, Error> {
        let peer = self.get(handle).ok_or(Error::PeerNotFound(handle))?;

        let candidates = peer
            .bitfield
            .iter_ones()
            .filter(|i| !local.get(*i).is_some_and(|b| *b));

        Ok(self.availability.rarest(candidates))
    }

    fn slot_mut(&mut self, handle: PeerHandle) -> Option<&mut Slot> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
    }
}
