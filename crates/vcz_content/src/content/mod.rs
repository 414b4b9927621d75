//! The files of a torrent and which of its chunks are done.
//!
//! [`Content`] maps the logical byte stream of a torrent onto its files,
//! owns the bitfield of chunks that were verified and written, and keeps a
//! counter of completed chunks for every file.
//!
//! # Lifecycle
//!
//! Files, the hash list and the root dir are configured first. [`Content::open`]
//! validates the configuration, opens every file through the [`Storage`] and
//! allocates the bitfield. After that only the runtime state changes, through
//! [`Content::mark_done`]. [`Content::close`] drops the runtime state but keeps
//! the configuration, so the content can be opened again.
pub mod storage;

use std::{
    ops::Range,
    path::{Path, PathBuf},
};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, VczBitfield},
    error::Error,
};
use storage::{OpenFlags, Storage};

/// Length of a SHA-1 digest in the hash list.
pub const HASH_LEN: usize = 20;

/// Download priority of a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Do not download.
    Off,
    #[default]
    Normal,
    High,
}

/// A file of the torrent, in torrent order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentFile {
    path: PathBuf,
    size: u64,
    /// Offset of the first byte of this file in the torrent stream.
    offset: u64,
    /// Chunks that hold at least one byte of this file.
    range: Range<u32>,
    /// How many chunks of `range` are done.
    completed: u32,
    priority: Priority,
}

impl ContentFile {
    /// Path relative to the root dir of the content.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn range(&self) -> Range<u32> {
        self.range.clone()
    }

    pub fn completed(&self) -> u32 {
        self.completed
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn is_done(&self) -> bool {
        self.completed as usize == self.range.len()
    }
}

/// A contiguous run of bytes of one file, belonging to a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    /// Index of the file in [`Content::files`].
    pub file: usize,
    /// Offset inside of the file.
    pub offset: u64,
    pub len: u64,
}

pub struct Content<S: Storage> {
    storage: S,
    /// One per file, only while open.
    handles: Vec<S::Handle>,
    files: Vec<ContentFile>,
    total_size: u64,
    chunk_size: u32,
    /// `Some` only while open.
    bitfield: Option<Bitfield>,
    completed: u32,
    root_dir: PathBuf,
    hash: Vec<u8>,
    allocate: bool,
    done_tx: watch::Sender<bool>,
}

impl<S: Storage> Content<S> {
    pub fn new(storage: S, chunk_size: u32) -> Self {
        assert!(chunk_size > 0, "chunk size cannot be zero");

        let (done_tx, _) = watch::channel(false);

        Self {
            storage,
            handles: Vec::new(),
            files: Vec::new(),
            total_size: 0,
            chunk_size,
            bitfield: None,
            completed: 0,
            root_dir: PathBuf::new(),
            hash: Vec::new(),
            allocate: false,
            done_tx,
        }
    }

    pub fn is_open(&self) -> bool {
        self.bitfield.is_some()
    }

    /// Append a file to the end of the torrent stream.
    ///
    /// # Panics
    /// If the content is open.
    pub fn add_file(&mut self, path: impl Into<PathBuf>, size: u64) {
        self.assert_closed("add_file");

        let chunk_size = self.chunk_size as u64;
        let offset = self.total_size;
        let begin = offset / chunk_size;
        let end = if size == 0 {
            begin
        } else {
            (offset + size).div_ceil(chunk_size)
        };

        assert!(
            end <= i32::MAX as u64,
            "the content cannot have more than {} chunks",
            i32::MAX
        );

        self.files.push(ContentFile {
            path: path.into(),
            size,
            offset,
            range: begin as u32..end as u32,
            completed: 0,
            priority: Priority::default(),
        });

        self.total_size += size;
    }

    /// The concatenated SHA-1 hashes of every chunk.
    ///
    /// # Panics
    /// If the content is open.
    pub fn set_complete_hash(&mut self, hash: Vec<u8>) {
        self.assert_closed("set_complete_hash");
        self.hash = hash;
    }

    /// # Panics
    /// If the content is open.
    pub fn set_root_dir(&mut self, root_dir: impl Into<PathBuf>) {
        self.assert_closed("set_root_dir");
        self.root_dir = root_dir.into();
    }

    /// If `open` should resize every file to its declared size.
    ///
    /// # Panics
    /// If the content is open.
    pub fn set_allocate(&mut self, allocate: bool) {
        self.assert_closed("set_allocate");
        self.allocate = allocate;
    }

    pub fn set_priority(&mut self, file: usize, priority: Priority) {
        self.files[file].priority = priority;
    }

    /// Validate the hash list, open every file and allocate the bitfield.
    ///
    /// On error, every file that was opened is closed again and the content
    /// stays closed.
    ///
    /// # Panics
    /// If the content is already open.
    #[tracing::instrument(skip(self), fields(root = ?self.root_dir))]
    pub fn open(&mut self) -> Result<(), Error> {
        self.assert_closed("open");

        let chunks = self.chunk_total();

        if self.hash.len() % HASH_LEN != 0
            || self.hash.len() / HASH_LEN != chunks as usize
        {
            return Err(Error::HashLengthInvalid {
                len: self.hash.len(),
                chunks,
            });
        }

        self.storage.create_dir(&self.root_dir)?;

        let mut handles = Vec::with_capacity(self.files.len());

        for file in &self.files {
            match open_file(
                &mut self.storage,
                &self.root_dir,
                file,
                self.allocate,
            ) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    warn!("could not open {:?}: {e}", file.path);
                    for handle in handles {
                        self.storage.close(handle);
                    }
                    return Err(e);
                }
            }
        }

        self.handles = handles;
        self.bitfield = Some(Bitfield::from_piece(chunks as usize));
        self.reset_completion();

        info!(
            "opened {} files, {} bytes in {chunks} chunks",
            self.files.len(),
            self.total_size
        );

        Ok(())
    }

    /// Close every file and drop the bitfield. Files and configuration are
    /// kept. Closing a content that is not open does nothing.
    pub fn close(&mut self) {
        if !self.is_open() {
            return;
        }

        for handle in self.handles.drain(..) {
            self.storage.close(handle);
        }

        self.bitfield = None;
        self.reset_completion();

        debug!("closed");
    }

    /// If every file on the storage has exactly its declared size.
    ///
    /// # Panics
    /// If the storage does not hold one open handle per file, which is the
    /// case for a content with files that is not open.
    pub fn is_correct_size(&self) -> Result<bool, Error> {
        assert_eq!(
            self.files.len(),
            self.handles.len(),
            "storage does not hold one handle per file"
        );

        for (file, handle) in self.files.iter().zip(&self.handles) {
            let on_disk = self.storage.file_size(handle)?;
            if on_disk != file.size {
                debug!(
                    "{:?} has {on_disk} bytes, expected {}",
                    file.path, file.size
                );
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Mark a verified and written chunk as done.
    ///
    /// Sets its bit, increments the completed count of every file that the
    /// chunk touches and, when this was the last chunk, notifies every
    /// [`subscribe`](Self::subscribe)r.
    ///
    /// # Panics
    /// If the content is not open, if `index` is out of range, or if the
    /// chunk was already marked.
    pub fn mark_done(&mut self, index: u32) {
        let chunks = self.chunk_total();

        let Some(bitfield) = self.bitfield.as_mut() else {
            panic!("mark_done({index}) called on content that is not open");
        };

        assert!(index < chunks, "chunk {index} is out of range 0..{chunks}");
        assert!(
            !bitfield[index as usize],
            "chunk {index} was already marked done"
        );

        bitfield.set(index as usize, true);
        self.completed += 1;

        for file in self
            .files
            .iter_mut()
            .skip_while(|f| f.range.end <= index)
            .take_while(|f| f.range.start <= index)
        {
            if file.range.contains(&index) {
                file.completed += 1;
            }
        }

        debug!("chunk {index} done, {}/{chunks}", self.completed);

        if self.completed == chunks {
            info!("download complete");
            self.done_tx.send_replace(true);
        }
    }

    /// The expected SHA-1 hash of a chunk.
    ///
    /// # Panics
    /// If the content is not open or if `index` is out of range.
    pub fn get_hash(&self, index: u32) -> &[u8] {
        assert!(self.is_open(), "get_hash({index}) on content that is not open");
        assert!(index < self.chunk_total(), "chunk {index} is out of range");

        let begin = index as usize * HASH_LEN;
        &self.hash[begin..begin + HASH_LEN]
    }

    /// Watch the download-complete notification. The value flips to `true`
    /// once, when the last chunk is marked done, and back to `false` when the
    /// content is closed.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    /// If the chunk is done, false when the content is not open.
    pub fn has(&self, index: u32) -> bool {
        self.bitfield
            .as_ref()
            .and_then(|b| b.get(index as usize).map(|bit| *bit))
            .unwrap_or(false)
    }

    pub fn bitfield(&self) -> Option<&Bitfield> {
        self.bitfield.as_ref()
    }

    pub fn completed_chunks(&self) -> u32 {
        self.completed
    }

    pub fn is_done(&self) -> bool {
        self.is_open() && self.completed == self.chunk_total()
    }

    /// How many bytes of the torrent are in done chunks.
    pub fn bytes_completed(&self) -> u64 {
        let chunks = self.chunk_total();
        let mut bytes = self.completed as u64 * self.chunk_size as u64;

        // the last chunk might be shorter.
        if chunks > 0 && self.has(chunks - 1) {
            bytes -= (self.chunk_size - self.chunk_length(chunks - 1)) as u64;
        }

        bytes
    }

    pub fn chunk_total(&self) -> u32 {
        self.total_size.div_ceil(self.chunk_size as u64) as u32
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Size of a chunk in bytes, only the last one can be smaller than
    /// `chunk_size`.
    pub fn chunk_length(&self, index: u32) -> u32 {
        let chunks = self.chunk_total();
        assert!(index < chunks, "chunk {index} is out of range 0..{chunks}");

        if index == chunks - 1 {
            (self.total_size - index as u64 * self.chunk_size as u64) as u32
        } else {
            self.chunk_size
        }
    }

    /// The bytes of every file that make up a chunk, in order.
    pub fn chunk_spans(&self, index: u32) -> Vec<FileSpan> {
        let begin = index as u64 * self.chunk_size as u64;
        let end = begin + self.chunk_length(index) as u64;

        self.files
            .iter()
            .enumerate()
            .skip_while(|(_, f)| f.range.end <= index)
            .take_while(|(_, f)| f.range.start <= index)
            .filter(|(_, f)| f.range.contains(&index))
            .map(|(i, f)| {
                let first = begin.max(f.offset);
                let last = end.min(f.offset + f.size);
                FileSpan { file: i, offset: first - f.offset, len: last - first }
            })
            .collect()
    }

    /// Find the file that holds the byte at `offset` of the torrent stream,
    /// and the offset of that byte inside of the file.
    pub fn file_position(&self, offset: u64) -> Option<(usize, u64)> {
        self.files
            .iter()
            .position(|f| f.size > 0 && offset < f.offset + f.size)
            .map(|i| (i, offset - self.files[i].offset))
    }

    /// Read a chunk through the storage. Bytes past the end of a file that
    /// is shorter than declared are zeroes.
    ///
    /// # Panics
    /// If the content is not open.
    pub fn read_chunk(&mut self, index: u32) -> Result<Vec<u8>, Error> {
        assert!(self.is_open(), "read_chunk({index}) on content that is not open");

        let mut buf = vec![0u8; self.chunk_length(index) as usize];
        let mut pos = 0;

        for span in self.chunk_spans(index) {
            let len = span.len as usize;
            self.storage.read(
                &self.handles[span.file],
                span.offset,
                &mut buf[pos..pos + len],
            )?;
            pos += len;
        }

        Ok(buf)
    }

    /// Write a whole chunk through the storage.
    ///
    /// # Panics
    /// If the content is not open, or if `bytes` is not exactly as long as
    /// the chunk.
    pub fn write_chunk(
        &mut self,
        index: u32,
        bytes: &[u8],
    ) -> Result<(), Error> {
        assert!(self.is_open(), "write_chunk({index}) on content that is not open");
        assert_eq!(
            bytes.len(),
            self.chunk_length(index) as usize,
            "chunk {index} has a different length"
        );

        let mut pos = 0;

        for span in self.chunk_spans(index) {
            let len = span.len as usize;
            self.storage.write(
                &self.handles[span.file],
                span.offset,
                &bytes[pos..pos + len],
            )?;
            pos += len;
        }

        Ok(())
    }

    pub fn files(&self) -> &[ContentFile] {
        &self.files
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    fn reset_completion(&mut self) {
        self.completed = 0;
        for file in &mut self.files {
            file.completed = 0;
        }
        self.done_tx.send_replace(false);
    }

    fn assert_closed(&self, op: &str) {
        assert!(!self.is_open(), "{op} cannot be called on open content");
    }
}

/// Create the parent dirs of `file` and open it, resizing it to its declared
/// size if `allocate` is set.
fn open_file<S: Storage>(
    storage: &mut S,
    root_dir: &Path,
    file: &ContentFile,
    allocate: bool,
) -> Result<S::Handle, Error> {
    let path = root_dir.join(&file.path);

    if let Some(parent) = path.parent() {
        if parent != root_dir {
            storage.create_dir(parent)?;
        }
    }

    let handle = storage.open_file(&path, OpenFlags::READ_WRITE_CREATE)?;

    if allocate {
        let resized = match storage.file_size(&handle) {
            Ok(size) if size == file.size => true,
            Ok(_) => storage.resize(&handle, file.size),
            Err(_) => false,
        };

        if !resized {
            storage.close(handle);
            return Err(Error::FileResizeError(path.display().to_string()));
        }
    }

    Ok(handle)
}
