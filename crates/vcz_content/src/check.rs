//! SHA-1 verification of chunks.
use tracing::{debug, info};

use crate::{
    content::{storage::Storage, Content},
    error::Error,
};

/// If the SHA-1 of `bytes` is the expected hash of the chunk.
pub fn verify<S: Storage>(content: &Content<S>, index: u32, bytes: &[u8]) -> bool {
    let mut hash = sha1_smol::Sha1::new();
    hash.update(bytes);
    let hash = hash.digest().bytes();

    let ok = hash[..] == *content.get_hash(index);

    if !ok {
        debug!("chunk {index} hash mismatch: {}", hex::encode(hash));
    }

    ok
}

/// Read every chunk that is not done yet, and mark it done if its hash is
/// correct. Returns how many chunks were marked.
///
/// # Panics
/// If the content is not open.
#[tracing::instrument(skip(content), fields(root = ?content.root_dir()))]
pub fn recheck<S: Storage>(content: &mut Content<S>) -> Result<u32, Error> {
    let mut marked = 0;

    for index in 0..content.chunk_total() {
        if content.has(index) {
            continue;
        }

        let bytes = content.read_chunk(index)?;

        if verify(content, index, &bytes) {
            content.mark_done(index);
            marked += 1;
        }
    }

    info!("{marked} chunks passed the hash check");

    Ok(marked)
}
