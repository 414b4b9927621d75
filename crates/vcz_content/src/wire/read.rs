//! Incremental framing of the bytes that a peer sends us.
use std::mem;

use bytes::{Buf, BytesMut};
use tracing::{trace, warn};

use super::{Message, MessageId, MAX_MESSAGE_SIZE, PIECE_HEADER_LEN};
use crate::{error::Error, piece::Piece};

/// Where [`ProtocolRead`] is in the current message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum State {
    /// Between messages.
    #[default]
    Idle,
    /// Waiting for the 4 byte length prefix.
    Length,
    /// Waiting for the id byte.
    Type,
    /// Waiting for the whole payload of a message that is not a piece.
    Msg,
    /// Waiting for the whole payload of a bitfield.
    Bitfield,
    /// Reading a piece we want. Before its header is read, the current piece
    /// is invalid.
    ReadPiece,
    /// Discarding the rest of a message we don't want.
    SkipPiece,
}

/// Per connection state machine that turns a stream of bytes into
/// [`Message`]s, consuming bytes as soon as they are available.
///
/// Nothing ever blocks in here. When the buffer runs out in the middle of a
/// message, [`advance`](Self::advance) returns `Ok(None)` and continues where
/// it stopped on the next call.
#[derive(Debug, Clone)]
pub struct ProtocolRead {
    state: State,
    /// Declared length of the current message.
    length: u32,
    /// Id of the current message, meaningful after [`State::Type`].
    id: MessageId,
    /// The piece being read in [`State::ReadPiece`].
    piece: Piece,
    /// Bytes left to discard in [`State::SkipPiece`].
    remaining: u32,
    max: u32,
    skipped: u64,
}

impl Default for ProtocolRead {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl ProtocolRead {
    /// `max` bounds the declared length of every message.
    pub fn new(max: u32) -> Self {
        Self {
            state: State::Idle,
            length: 0,
            id: MessageId::Choke,
            piece: Piece::default(),
            remaining: 0,
            max,
            skipped: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Declared length of the current message.
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Total of payload bytes that were discarded without being parsed.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Read `<index><offset><length>` of a request or cancel message.
    ///
    /// The caller guarantees that 12 bytes are available.
    pub fn read_request(&self, buf: &mut impl Buf) -> Result<Piece, Error> {
        let index = read_index(buf)?;
        let offset = buf.get_u32();
        let length = buf.get_u32();
        Ok(Piece { index, offset, length })
    }

    /// Read `<index><offset>` of a piece message. The length of the piece is
    /// what is left of the declared length after the header.
    ///
    /// The caller guarantees that 8 bytes are available.
    pub fn read_piece(&self, buf: &mut impl Buf) -> Result<Piece, Error> {
        // checked before touching the buffer, the subtraction below can't
        // underflow.
        if self.length < PIECE_HEADER_LEN {
            return Err(Error::MessageLength {
                id: MessageId::Piece as u8,
                len: self.length,
            });
        }

        let index = read_index(buf)?;
        let offset = buf.get_u32();
        Ok(Piece { index, offset, length: self.length - PIECE_HEADER_LEN })
    }

    /// Consume as many bytes of `buf` as needed to produce the next message.
    ///
    /// `want` is asked about every piece message once its header is read,
    /// when it returns false the payload is skipped and no message is
    /// produced for it. Messages with an unknown id are skipped as well.
    ///
    /// A protocol error leaves the state machine in an unspecified state, the
    /// connection must be dropped.
    pub fn advance(
        &mut self,
        buf: &mut BytesMut,
        mut want: impl FnMut(&Piece) -> bool,
    ) -> Result<Option<Message>, Error> {
        loop {
            match self.state {
                State::Idle => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    self.state = State::Length;
                }
                State::Length => {
                    if buf.len() < 4 {
                        return Ok(None);
                    }

                    let length = buf.get_u32();

                    if length == 0 {
                        self.state = State::Idle;
                        return Ok(Some(Message::KeepAlive));
                    }

                    if length > self.max {
                        return Err(Error::MessageTooLarge {
                            len: length,
                            max: self.max,
                        });
                    }

                    self.length = length;
                    self.state = State::Type;
                }
                State::Type => {
                    if buf.is_empty() {
                        return Ok(None);
                    }

                    let raw = buf[0];

                    let Ok(id) = MessageId::try_from(raw) else {
                        warn!("unknown message_id {raw}, skipping it");
                        buf.advance(1);
                        self.skip(self.length - 1);
                        continue;
                    };

                    if !id.accepts_length(self.length) {
                        return Err(Error::MessageLength {
                            id: raw,
                            len: self.length,
                        });
                    }

                    buf.advance(1);
                    self.id = id;
                    self.state = match id {
                        MessageId::Bitfield => State::Bitfield,
                        MessageId::Piece => {
                            self.piece = Piece::default();
                            State::ReadPiece
                        }
                        _ => State::Msg,
                    };
                }
                State::Msg => {
                    let payload = self.length as usize - 1;
                    if buf.len() < payload {
                        return Ok(None);
                    }

                    let msg = self.read_msg(buf, payload)?;
                    self.state = State::Idle;
                    return Ok(Some(msg));
                }
                State::Bitfield => {
                    let payload = self.length as usize - 1;
                    if buf.len() < payload {
                        buf.reserve(payload - buf.len());
                        return Ok(None);
                    }

                    self.state = State::Idle;
                    return Ok(Some(Message::Bitfield(
                        buf.split_to(payload).freeze(),
                    )));
                }
                State::ReadPiece => {
                    if !self.piece.is_valid() {
                        if buf.len() < 8 {
                            return Ok(None);
                        }

                        let piece = self.read_piece(buf)?;

                        if !want(&piece) {
                            trace!("skipping {piece:?}");
                            self.skip(piece.length);
                            continue;
                        }

                        self.piece = piece;
                    }

                    let len = self.piece.length as usize;
                    if buf.len() < len {
                        buf.reserve(len - buf.len());
                        return Ok(None);
                    }

                    let block = buf.split_to(len).freeze();
                    let piece = mem::take(&mut self.piece);
                    self.state = State::Idle;
                    return Ok(Some(Message::Piece(piece, block)));
                }
                State::SkipPiece => {
                    let n = buf.len().min(self.remaining as usize);
                    buf.advance(n);
                    self.remaining -= n as u32;
                    self.skipped += n as u64;

                    if self.remaining > 0 {
                        return Ok(None);
                    }
                    self.state = State::Idle;
                }
            }
        }
    }

    fn skip(&mut self, bytes: u32) {
        self.remaining = bytes;
        self.piece = Piece::default();
        self.state = State::SkipPiece;
    }

    /// Parse a fixed size message, or an extended message, whose whole
    /// payload is in `buf`.
    fn read_msg(
        &self,
        buf: &mut BytesMut,
        payload: usize,
    ) -> Result<Message, Error> {
        Ok(match self.id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                let index = buf.get_u32();
                if index > i32::MAX as u32 {
                    return Err(Error::PieceIndexInvalid(index));
                }
                Message::Have(index)
            }
            MessageId::Request => Message::Request(self.read_request(buf)?),
            MessageId::Cancel => Message::Cancel(self.read_request(buf)?),
            MessageId::Port => Message::Port(buf.get_u16()),
            MessageId::Extended => {
                let ext_id = buf.get_u8();
                Message::Extended(ext_id, buf.split_to(payload - 1).freeze())
            }
            MessageId::Bitfield | MessageId::Piece => {
                unreachable!("{:?} has a state of its own", self.id)
            }
        })
    }
}

fn read_index(buf: &mut impl Buf) -> Result<i32, Error> {
    let index = buf.get_u32();
    i32::try_from(index).map_err(|_| Error::PieceIndexInvalid(index))
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;

    fn piece_msg(index: u32, offset: u32, block: &[u8]) -> Vec<u8> {
        let mut v = Vec::new();
        v.put_u32(PIECE_HEADER_LEN + block.len() as u32);
        v.put_u8(MessageId::Piece as u8);
        v.put_u32(index);
        v.put_u32(offset);
        v.extend_from_slice(block);
        v
    }

    #[test]
    fn keep_alive() {
        let mut reader = ProtocolRead::default();
        let mut buf = BytesMut::from(&[0, 0, 0, 0, 0, 0][..]);

        let msg = reader.advance(&mut buf, |_| true).unwrap();
        assert_eq!(msg, Some(Message::KeepAlive));
        assert_eq!(reader.state(), State::Idle);
        // only the prefix of the keep-alive was consumed.
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn piece_length_is_declared_minus_header() {
        let mut reader = ProtocolRead::default();
        let block = vec![7u8; 16384];
        let mut buf = BytesMut::from(&piece_msg(3, 16384, &block)[..]);

        let msg = reader.advance(&mut buf, |_| true).unwrap();
        let Some(Message::Piece(piece, data)) = msg else {
            panic!("expected a piece");
        };

        assert_eq!(reader.length(), 9 + 16384);
        assert_eq!(piece, Piece::new(3, 16384, 16384));
        assert_eq!(data.len(), 16384);
        assert!(buf.is_empty());
        assert_eq!(reader.state(), State::Idle);
    }

    #[test]
    fn short_piece_is_a_protocol_error() {
        let mut reader = ProtocolRead::default();
        let mut buf = BytesMut::new();
        buf.put_u32(8);
        buf.put_u8(MessageId::Piece as u8);
        buf.put_u32(0);
        buf.put_u32(0);

        let err = reader.advance(&mut buf, |_| true).unwrap_err();
        assert!(matches!(err, Error::MessageLength { id: 7, len: 8 }));
        assert!(err.is_protocol());
    }

    #[test]
    fn read_piece_checks_length_first() {
        let mut reader = ProtocolRead::default();
        reader.length = 4;
        let mut buf = &[0u8; 8][..];

        assert!(reader.read_piece(&mut buf).is_err());
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn wrong_fixed_length() {
        let mut reader = ProtocolRead::default();
        // a choke with a payload.
        let mut buf = BytesMut::from(&[0, 0, 0, 2, 0, 0][..]);
        assert!(matches!(
            reader.advance(&mut buf, |_| true),
            Err(Error::MessageLength { id: 0, len: 2 })
        ));
    }

    #[test]
    fn too_large() {
        let mut reader = ProtocolRead::new(100);
        let mut buf = BytesMut::new();
        buf.put_u32(101);
        assert!(matches!(
            reader.advance(&mut buf, |_| true),
            Err(Error::MessageTooLarge { len: 101, max: 100 })
        ));
    }

    #[test]
    fn fragmented_input() {
        let mut reader = ProtocolRead::default();

        let mut stream = Vec::new();
        stream.extend(piece_msg(1, 0, &[1, 2, 3, 4, 5]));
        stream.extend([0, 0, 0, 13, 6, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 64, 0]);
        stream.extend([0, 0, 0, 5, 4, 0, 0, 0, 9]);

        let mut buf = BytesMut::new();
        let mut msgs = Vec::new();

        // feed one byte at a time.
        for byte in stream {
            buf.put_u8(byte);
            while let Some(msg) = reader.advance(&mut buf, |_| true).unwrap() {
                msgs.push(msg);
            }
        }

        assert_eq!(msgs, vec![
            Message::Piece(
                Piece::new(1, 0, 5),
                bytes::Bytes::from_static(&[1, 2, 3, 4, 5])
            ),
            Message::Request(Piece::new(2, 0, 16384)),
            Message::Have(9),
        ]);
        assert_eq!(reader.state(), State::Idle);
    }

    #[test]
    fn skip_unwanted_piece() {
        let mut reader = ProtocolRead::default();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&piece_msg(0, 0, &[1; 100]));
        buf.extend_from_slice(&[0, 0, 0, 1, 1]);

        let mut asked = Vec::new();
        let msg = reader
            .advance(&mut buf, |p| {
                asked.push(*p);
                false
            })
            .unwrap();

        // the piece was discarded and the next message is framed correctly.
        assert_eq!(msg, Some(Message::Unchoke));
        assert_eq!(asked, vec![Piece::new(0, 0, 100)]);
        assert_eq!(reader.skipped(), 100);
        assert!(buf.is_empty());
    }

    #[test]
    fn skip_across_calls() {
        let mut reader = ProtocolRead::default();
        let msg = piece_msg(0, 0, &[1; 100]);

        let mut buf = BytesMut::from(&msg[..50]);
        assert_eq!(reader.advance(&mut buf, |_| false).unwrap(), None);
        assert_eq!(reader.state(), State::SkipPiece);

        buf.extend_from_slice(&msg[50..]);
        assert_eq!(reader.advance(&mut buf, |_| false).unwrap(), None);
        assert_eq!(reader.state(), State::Idle);
        assert_eq!(reader.skipped(), 100);
    }

    #[test]
    fn unknown_id_is_skipped() {
        let mut reader = ProtocolRead::default();
        let mut buf =
            BytesMut::from(&[0, 0, 0, 3, 42, 1, 2, 0, 0, 0, 1, 2][..]);

        let msg = reader.advance(&mut buf, |_| true).unwrap();
        assert_eq!(msg, Some(Message::Interested));
    }

    #[test]
    fn negative_index() {
        let mut reader = ProtocolRead::default();
        let mut buf = BytesMut::from(&piece_msg(u32::MAX, 0, &[0])[..]);
        assert!(matches!(
            reader.advance(&mut buf, |_| true),
            Err(Error::PieceIndexInvalid(u32::MAX))
        ));
    }

    #[test]
    fn bitfield_and_extended() {
        let mut reader = ProtocolRead::default();
        let mut buf = BytesMut::from(
            &[0, 0, 0, 3, 5, 0xff, 0x80, 0, 0, 0, 4, 20, 1, 9, 9][..],
        );

        assert_eq!(
            reader.advance(&mut buf, |_| true).unwrap(),
            Some(Message::Bitfield(bytes::Bytes::from_static(&[0xff, 0x80])))
        );
        assert_eq!(
            reader.advance(&mut buf, |_| true).unwrap(),
            Some(Message::Extended(1, bytes::Bytes::from_static(&[9, 9])))
        );
    }
}
