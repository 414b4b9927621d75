use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Could not parse the manifest: `{0}`")]
    Manifest(#[from] toml::de::Error),

    #[error("The hash of chunk {0} is not valid hex: `{1}`")]
    Hex(usize, hex::FromHexError),

    #[error("The hash of chunk {index} has {len} bytes instead of 20")]
    HashLength { index: usize, len: usize },

    #[error("The chunk size of the manifest cannot be zero")]
    ChunkSize,

    #[error(transparent)]
    Content(#[from] vcz_content::error::Error),

    #[error("IO error: `{0}`")]
    IO(#[from] io::Error),
}
