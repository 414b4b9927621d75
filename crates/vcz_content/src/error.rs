use std::io;

use thiserror::Error;

use crate::swarm::PeerHandle;

/// Errors that a correct caller can still run into.
///
/// Protocol errors come from untrusted peer input and must be handled by
/// closing that peer's connection. Storage errors come from the file system
/// during `open`. Contract violations by the caller are not represented here,
/// they panic.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Message with id `{id}` cannot have a declared length of {len}")]
    MessageLength { id: u8, len: u32 },

    #[error("Message length of {len} exceeds the maximum of {max} bytes")]
    MessageTooLarge { len: u32, max: u32 },

    #[error("The piece index {0} is out of range")]
    PieceIndexInvalid(u32),

    #[error("Bitfield has {got} bytes, but the torrent needs {expected}")]
    BitfieldLength { expected: usize, got: usize },

    #[error("Bitfield has spare bits set past the last piece")]
    BitfieldSpareBits,

    #[error("The peer sent a bitfield that was not its first message")]
    UnexpectedBitfield,

    #[error(
        "The peer sent a block of {len} bytes at offset {offset}, which does \
         not fit chunk {index}"
    )]
    BlockInvalid { index: u32, offset: u32, len: u32 },

    #[error("The given peer handle is stale or was never issued: {0:?}")]
    PeerNotFound(PeerHandle),

    #[error(
        "The hash list has {len} bytes, which is not 20 bytes for each of \
         the {chunks} chunks"
    )]
    HashLengthInvalid { len: usize, chunks: u32 },

    #[error("IO error")]
    IO(#[from] io::Error),

    #[error(
        "Could not open the file `{0}`. Please make sure the program has \
         permission to access it"
    )]
    FileOpenError(String),

    #[error("Could not resize the file `{0}` to its declared size")]
    FileResizeError(String),

    #[error(
        "Tried to load $HOME but could not find it. Please make sure you have \
         a $HOME env and that this program has the permission to create dirs."
    )]
    HomeInvalid,

    #[error("Error while trying to load configuration: `{0}")]
    FromConfigError(#[from] config::ConfigError),

    #[error("Could not serialize the configuration: `{0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

impl Error {
    /// If the error was caused by the remote peer, and the connection with it
    /// must be closed.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::MessageLength { .. }
                | Self::MessageTooLarge { .. }
                | Self::PieceIndexInvalid(_)
                | Self::BitfieldLength { .. }
                | Self::BitfieldSpareBits
                | Self::UnexpectedBitfield
                | Self::BlockInvalid { .. }
        )
    }
}
