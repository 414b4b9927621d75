//! The (index, offset, length) triple carried by request and piece messages.
use bytes::{BufMut, BytesMut};
use tokio::io;

/// The default block_len that most clients support, some clients drop
/// the connection on blocks larger than this value.
///
/// The last block of a chunk might be smaller.
pub const BLOCK_LEN: u32 = 16384;

/// A sub-range of a chunk.
///
/// When we ask a peer for data, we send this in a "Request" message, and when
/// a peer sends us data, the "Piece" message carries the same triple where
/// `length` is the size of the payload that follows it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Piece {
    /// The chunk this piece belongs to, `-1` means invalid.
    pub index: i32,
    /// The zero-based byte offset into the chunk.
    pub offset: u32,
    /// The length in bytes.
    pub length: u32,
}

impl Default for Piece {
    fn default() -> Self {
        Self { index: -1, offset: 0, length: 0 }
    }
}

impl Piece {
    pub fn new(index: i32, offset: u32, length: u32) -> Self {
        Self { index, offset, length }
    }

    pub fn is_valid(&self) -> bool {
        self.index >= 0
    }

    /// The chunk index, if this piece is valid.
    pub fn chunk(&self) -> Option<u32> {
        u32::try_from(self.index).ok()
    }

    /// One past the last byte of this piece, relative to the chunk. Saturates
    /// for the nonsense that a peer might send.
    pub fn end(&self) -> u32 {
        self.offset.saturating_add(self.length)
    }

    /// Like most clients, we only honour requests of at most 16 KiB.
    pub fn is_acceptable_request(&self) -> bool {
        self.is_valid() && self.length > 0 && self.length <= BLOCK_LEN
    }

    /// Encodes the triple in the network binary protocol's format into the
    /// given buffer.
    pub fn encode(&self, buf: &mut BytesMut) -> io::Result<()> {
        let index = u32::try_from(self.index)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        buf.put_u32(index);
        buf.put_u32(self.offset);
        buf.put_u32(self.length);
        Ok(())
    }
}
