//! Messages of the peer wire protocol.
//!
//! Every message is framed as `<length u32><id u8><payload>`, where `length`
//! counts the id and the payload. A length of zero is a keep-alive.
pub mod codec;
pub mod read;

use bytes::Bytes;

use crate::piece::Piece;

/// 2MiB maximum message size.
pub const MAX_MESSAGE_SIZE: u32 = 2 * 1024 * 1024;

/// Declared length of a piece message without its payload:
/// `<id=7><index><offset>`.
pub const PIECE_HEADER_LEN: u32 = 9;

/// The IDs of the [`Message`]s.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        Ok(match value {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            9 => Port,
            20 => Extended,
            v => return Err(v),
        })
    }
}

impl MessageId {
    /// If a message with this id can have the declared `length`.
    ///
    /// Messages with a fixed payload must match it exactly, the others must
    /// at least hold their header.
    pub fn accepts_length(self, length: u32) -> bool {
        use MessageId::*;
        match self {
            Choke | Unchoke | Interested | NotInterested => length == 1,
            Have => length == 1 + 4,
            Request | Cancel => length == 1 + 4 + 4 + 4,
            Port => length == 1 + 2,
            Piece => length >= PIECE_HEADER_LEN,
            Bitfield => length >= 1,
            Extended => length >= 2,
        }
    }
}

/// Messages exchanged after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    /// The raw bytes, validated against the chunk count by whoever knows it.
    Bitfield(Bytes),
    Request(Piece),
    Piece(Piece, Bytes),
    Cancel(Piece),
    /// DHT port.
    Port(u16),
    /// The first value is the extended message id.
    Extended(u8, Bytes),
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        Some(match self {
            Message::KeepAlive => return None,
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have(_) => MessageId::Have,
            Message::Bitfield(_) => MessageId::Bitfield,
            Message::Request(_) => MessageId::Request,
            Message::Piece(..) => MessageId::Piece,
            Message::Cancel(_) => MessageId::Cancel,
            Message::Port(_) => MessageId::Port,
            Message::Extended(..) => MessageId::Extended,
        })
    }

    /// Size of the framed message, including the length prefix.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        match self {
            Message::KeepAlive => 4,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => 4 + 1,
            Message::Have(_) => 4 + 1 + 4,
            Message::Bitfield(b) => 4 + 1 + b.len(),
            Message::Request(_) | Message::Cancel(_) => 4 + 1 + 4 + 4 + 4,
            Message::Piece(_, block) => 4 + 1 + 4 + 4 + block.len(),
            Message::Port(_) => 4 + 1 + 2,
            Message::Extended(_, payload) => 4 + 1 + 1 + payload.len(),
        }
    }
}
