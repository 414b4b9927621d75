use bytes::{BufMut, BytesMut};
use tokio::io;
use tokio_util::codec::{Decoder, Encoder};

use super::{read::ProtocolRead, Message, MessageId};
use crate::error::Error;

/// Frames [`Message`]s on a byte stream, on top of [`ProtocolRead`].
///
/// The decoder accepts every piece, connections that need to skip pieces
/// drive a [`ProtocolRead`] directly.
#[derive(Debug, Clone, Default)]
pub struct MessageCodec {
    reader: ProtocolRead,
}

impl MessageCodec {
    /// `max` bounds the declared length of every decoded message.
    pub fn new(max: u32) -> Self {
        Self { reader: ProtocolRead::new(max) }
    }

    pub fn reader(&self) -> &ProtocolRead {
        &self.reader
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        buf.reserve(item.len());

        match item {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have(index) => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(index);
            }
            Message::Bitfield(bitfield) => {
                buf.put_u32(1 + bitfield.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&bitfield);
            }
            // <len=0013><id=6><index><begin><length>
            Message::Request(piece) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Request as u8);
                piece.encode(buf)?;
            }
            Message::Piece(piece, block) => {
                let index = u32::try_from(piece.index).map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidInput, e)
                })?;

                buf.put_u32(1 + 4 + 4 + block.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(index);
                buf.put_u32(piece.offset);
                buf.extend_from_slice(&block);
            }
            Message::Cancel(piece) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Cancel as u8);
                piece.encode(buf)?;
            }
            Message::Port(port) => {
                buf.put_u32(1 + 2);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
            Message::Extended(ext_id, payload) => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(ext_id);
                buf.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        self.reader.advance(buf, |_| true)
    }
}
