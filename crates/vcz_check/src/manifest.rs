//! Description of the files of a torrent, in TOML.
//!
//! ```toml
//! name = "debian"
//! chunk_size = 262144
//! hashes = ["6e3a...", "..."]
//!
//! [[files]]
//! path = "debian.iso"
//! size = 659554304
//! ```
use std::path::{Path, PathBuf};

use serde::Deserialize;
use vcz_content::content::{storage::Storage, Content, HASH_LEN};

use crate::error::Error;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Name of the dir that holds the files.
    pub name: String,
    pub chunk_size: u32,
    /// SHA-1 of every chunk, hex encoded.
    pub hashes: Vec<String>,
    pub files: Vec<ManifestFile>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ManifestFile {
    /// Relative to the dir of the torrent.
    pub path: PathBuf,
    pub size: u64,
}

impl Manifest {
    pub fn from_toml(s: &str) -> Result<Self, Error> {
        let manifest: Manifest = toml::from_str(s)?;

        if manifest.chunk_size == 0 {
            return Err(Error::ChunkSize);
        }

        Ok(manifest)
    }

    /// The concatenated hashes of every chunk.
    pub fn hash_list(&self) -> Result<Vec<u8>, Error> {
        let mut list = Vec::with_capacity(self.hashes.len() * HASH_LEN);

        for (index, hash) in self.hashes.iter().enumerate() {
            let bytes = hex::decode(hash).map_err(|e| Error::Hex(index, e))?;

            if bytes.len() != HASH_LEN {
                return Err(Error::HashLength { index, len: bytes.len() });
            }

            list.extend(bytes);
        }

        Ok(list)
    }

    /// A closed content with every file of the manifest, rooted at
    /// `<download_dir>/<name>`.
    pub fn content<S: Storage>(
        &self,
        storage: S,
        download_dir: &Path,
    ) -> Result<Content<S>, Error> {
        let mut content = Content::new(storage, self.chunk_size);

        content.set_root_dir(download_dir.join(&self.name));
        content.set_complete_hash(self.hash_list()?);

        for file in &self.files {
            content.add_file(&file.path, file.size);
        }

        Ok(content)
    }
}
