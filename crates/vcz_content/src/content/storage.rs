//! The file system as seen by [`Content`](super::Content).
//!
//! Content never touches files directly, every directory and file it needs
//! goes through a [`Storage`]. [`DiskStorage`] is the real thing,
//! [`MemoryStorage`] keeps everything in memory and can be told to fail.
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::error::Error;

/// How a file should be opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Create the file if it does not exist.
    pub create: bool,
    /// Open for writing as well as reading.
    pub write: bool,
}

impl OpenFlags {
    pub const READ_WRITE_CREATE: Self = Self { create: true, write: true };
}

pub trait Storage {
    type Handle;

    /// Create a directory and all of its parents, succeeding if it already
    /// exists.
    fn create_dir(&mut self, path: &Path) -> Result<(), Error>;

    fn open_file(
        &mut self,
        path: &Path,
        flags: OpenFlags,
    ) -> Result<Self::Handle, Error>;

    /// Grow or shrink the file to `size` bytes, returns false on failure.
    fn resize(&mut self, handle: &Self::Handle, size: u64) -> bool;

    /// The size that the file currently has on disk.
    fn file_size(&self, handle: &Self::Handle) -> Result<u64, Error>;

    fn write(
        &mut self,
        handle: &Self::Handle,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), Error>;

    /// Read up to `buf.len()` bytes at `offset`, returns how many were read,
    /// which is less than requested only when the file ends first.
    fn read(
        &mut self,
        handle: &Self::Handle,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, Error>;

    fn close(&mut self, handle: Self::Handle);
}

/// Files on the local file system.
#[derive(Debug, Default)]
pub struct DiskStorage;

impl Storage for DiskStorage {
    type Handle = File;

    fn create_dir(&mut self, path: &Path) -> Result<(), Error> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn open_file(
        &mut self,
        path: &Path,
        flags: OpenFlags,
    ) -> Result<Self::Handle, Error> {
        debug!("opening {path:?}");

        OpenOptions::new()
            .read(true)
            .write(flags.write)
            .create(flags.create)
            .truncate(false)
            .open(path)
            .map_err(|_| Error::FileOpenError(path.display().to_string()))
    }

    fn resize(&mut self, handle: &Self::Handle, size: u64) -> bool {
        handle.set_len(size).is_ok()
    }

    fn file_size(&self, handle: &Self::Handle) -> Result<u64, Error> {
        Ok(handle.metadata()?.len())
    }

    fn write(
        &mut self,
        handle: &Self::Handle,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), Error> {
        let mut file = handle;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(())
    }

    fn read(
        &mut self,
        handle: &Self::Handle,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        let mut file = handle;
        file.seek(SeekFrom::Start(offset))?;

        let mut read = 0;
        while read < buf.len() {
            match file.read(&mut buf[read..])? {
                0 => break,
                n => read += n,
            }
        }
        Ok(read)
    }

    fn close(&mut self, handle: Self::Handle) {
        drop(handle);
    }
}

/// Files kept in memory, addressed by their index of creation.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    pub dirs: Vec<PathBuf>,
    pub files: Vec<(PathBuf, Vec<u8>)>,
    /// Opening this path fails, to exercise error paths.
    pub fail_open: Option<PathBuf>,
    /// Resizing the file at this path fails.
    pub fail_resize: Option<PathBuf>,
    /// Creating this dir fails.
    pub fail_dir: Option<PathBuf>,
    /// How many handles are currently open.
    pub open_handles: usize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bytes of the file at `path`, if it was ever created.
    pub fn get(&self, path: impl AsRef<Path>) -> Option<&[u8]> {
        self.files
            .iter()
            .find(|(p, _)| p == path.as_ref())
            .map(|(_, bytes)| bytes.as_slice())
    }

    /// Create or replace the file at `path` with `bytes`.
    pub fn put(&mut self, path: impl Into<PathBuf>, bytes: Vec<u8>) {
        let path = path.into();
        match self.files.iter_mut().find(|(p, _)| *p == path) {
            Some((_, old)) => *old = bytes,
            None => self.files.push((path, bytes)),
        }
    }
}

impl Storage for MemoryStorage {
    type Handle = usize;

    fn create_dir(&mut self, path: &Path) -> Result<(), Error> {
        if self.fail_dir.as_deref() == Some(path) {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied).into());
        }

        if !self.dirs.iter().any(|d| d == path) {
            self.dirs.push(path.to_owned());
        }
        Ok(())
    }

    fn open_file(
        &mut self,
        path: &Path,
        flags: OpenFlags,
    ) -> Result<Self::Handle, Error> {
        if self.fail_open.as_deref() == Some(path) {
            return Err(Error::FileOpenError(path.display().to_string()));
        }

        let handle = match self.files.iter().position(|(p, _)| p == path) {
            Some(i) => i,
            None if flags.create => {
                self.files.push((path.to_owned(), Vec::new()));
                self.files.len() - 1
            }
            None => {
                return Err(Error::FileOpenError(path.display().to_string()))
            }
        };

        self.open_handles += 1;
        Ok(handle)
    }

    fn resize(&mut self, handle: &Self::Handle, size: u64) -> bool {
        let Ok(size) = usize::try_from(size) else { return false };

        if self.fail_resize.as_ref() == Some(&self.files[*handle].0) {
            return false;
        }

        self.files[*handle].1.resize(size, 0);
        true
    }

    fn file_size(&self, handle: &Self::Handle) -> Result<u64, Error> {
        Ok(self.files[*handle].1.len() as u64)
    }

    fn write(
        &mut self,
        handle: &Self::Handle,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), Error> {
        let file = &mut self.files[*handle].1;
        let begin = offset as usize;
        let end = begin + bytes.len();

        if file.len() < end {
            file.resize(end, 0);
        }
        file[begin..end].copy_from_slice(bytes);
        Ok(())
    }

    fn read(
        &mut self,
        handle: &Self::Handle,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        let file = &self.files[*handle].1;
        let begin = (offset as usize).min(file.len());
        let n = buf.len().min(file.len() - begin);
        buf[..n].copy_from_slice(&file[begin..begin + n]);
        Ok(n)
    }

    fn close(&mut self, _handle: Self::Handle) {
        self.open_handles -= 1;
    }
}
