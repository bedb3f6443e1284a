//! The virtual filestore capability interface (CFDP Blue Book 727.0-B-5
//! plus the two concrete implementations this crate ships: a native
//! implementation backed by `std::fs`, and a root-restricted wrapper around
//! any other implementation.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use cfdp_pdu::ChecksumType;

#[derive(Debug, thiserror::Error)]
pub enum FilestoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown file handle {0}")]
    UnknownHandle(FileHandle),
    #[error("path {0} escapes the configured filestore root")]
    PathEscapesRoot(PathBuf),
    #[error("checksum type {0:?} is not supported by this filestore")]
    UnsupportedChecksumType(ChecksumType),
}

pub type FilestoreResult<T> = Result<T, FilestoreError>;

/// An opaque handle to a file opened through a [`VirtualFilestore`]. Carries
/// no meaning outside the filestore implementation that issued it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHandle(u64);

/// Capability interface for every filesystem operation the Source and
/// Destination Handlers need. Implementations are expected to tolerate
/// concurrent use across handlers, so all methods take `&self`.
pub trait VirtualFilestore: std::fmt::Debug {
    fn open_read(&self, path: &Path) -> FilestoreResult<FileHandle>;
    fn open_write(&self, path: &Path, truncate: bool) -> FilestoreResult<FileHandle>;
    fn close(&self, handle: FileHandle) -> FilestoreResult<()>;

    fn read(&self, handle: FileHandle, offset: u64, len: usize) -> FilestoreResult<Vec<u8>>;
    fn write(&self, handle: FileHandle, offset: u64, data: &[u8]) -> FilestoreResult<()>;

    /// Creates `path`, creating any missing parent directory first.
    fn create_file(&self, path: &Path) -> FilestoreResult<()>;
    fn delete_file(&self, path: &Path) -> FilestoreResult<()>;
    fn rename(&self, src: &Path, dst: &Path) -> FilestoreResult<()>;
    fn append(&self, src: &Path, dst: &Path) -> FilestoreResult<()>;
    fn create_directory(&self, path: &Path) -> FilestoreResult<()>;
    fn remove_directory(&self, path: &Path) -> FilestoreResult<()>;
    /// Atomically overwrites `dst` with the contents of `src`.
    fn replace(&self, src: &Path, dst: &Path) -> FilestoreResult<()>;

    fn file_size(&self, path: &Path) -> FilestoreResult<u64>;

    fn calculate_checksum(
        &self,
        checksum_type: ChecksumType,
        path: &Path,
        offset: u64,
        len: u64,
    ) -> FilestoreResult<u32>;

    fn verify_checksum(
        &self,
        expected: u32,
        checksum_type: ChecksumType,
        path: &Path,
        offset: u64,
        len: u64,
    ) -> FilestoreResult<bool> {
        Ok(self.calculate_checksum(checksum_type, path, offset, len)? == expected)
    }
}

const MODULAR_CHUNK: usize = 64 * 1024;

/// Computes the CRC-32 (per the CCITT-compatible polynomial the Blue Book
/// specifies) or Modular checksum of `reader` for `len` bytes, skipping
/// `offset` logical chunk accounting is the caller's job — the reader must
/// already be positioned at `offset`.
pub(crate) fn checksum_over_reader(
    checksum_type: ChecksumType,
    mut reader: impl Read,
    len: u64,
) -> std::io::Result<u32> {
    match checksum_type {
        ChecksumType::Null => Ok(0),
        ChecksumType::Crc32 => {
            let crc = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
            let mut digest = crc.digest();
            let mut remaining = len;
            let mut buf = [0u8; MODULAR_CHUNK];
            while remaining > 0 {
                let chunk = remaining.min(buf.len() as u64) as usize;
                reader.read_exact(&mut buf[..chunk])?;
                digest.update(&buf[..chunk]);
                remaining -= chunk as u64;
            }
            Ok(digest.finalize())
        }
        ChecksumType::Modular => {
            let mut sum: u32 = 0;
            let mut remaining = len;
            let mut buf = [0u8; MODULAR_CHUNK];
            let mut word_pos = 0usize;
            let mut word = [0u8; 4];
            while remaining > 0 {
                let chunk = remaining.min(buf.len() as u64) as usize;
                reader.read_exact(&mut buf[..chunk])?;
                for &byte in &buf[..chunk] {
                    word[word_pos] = byte;
                    word_pos += 1;
                    if word_pos == 4 {
                        sum = sum.wrapping_add(u32::from_be_bytes(word));
                        word_pos = 0;
                        word = [0u8; 4];
                    }
                }
                remaining -= chunk as u64;
            }
            if word_pos > 0 {
                sum = sum.wrapping_add(u32::from_be_bytes(word));
            }
            Ok(sum)
        }
    }
}

/// `std::fs`-backed filestore. One process may share a single instance
/// across both handlers; open handles are tracked in an internal table so
/// `FileHandle` values stay small and `Copy`.
#[derive(Debug, Default)]
pub struct NativeFilestore {
    next_handle: AtomicU64,
    open_files: Mutex<HashMap<FileHandle, File>>,
}

impl NativeFilestore {
    pub fn new() -> Self {
        Self::default()
    }

    fn io_err(path: &Path, source: std::io::Error) -> FilestoreError {
        FilestoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn take_handle(&self, handle: FileHandle) -> FilestoreResult<File> {
        self.open_files
            .lock()
            .unwrap()
            .remove(&handle)
            .ok_or(FilestoreError::UnknownHandle(handle))
    }
}

impl VirtualFilestore for NativeFilestore {
    fn open_read(&self, path: &Path) -> FilestoreResult<FileHandle> {
        let file = File::open(path).map_err(|e| Self::io_err(path, e))?;
        let handle = FileHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.open_files.lock().unwrap().insert(handle, file);
        Ok(handle)
    }

    fn open_write(&self, path: &Path, truncate: bool) -> FilestoreResult<FileHandle> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| Self::io_err(parent, e))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(truncate)
            .open(path)
            .map_err(|e| Self::io_err(path, e))?;
        let handle = FileHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.open_files.lock().unwrap().insert(handle, file);
        Ok(handle)
    }

    fn close(&self, handle: FileHandle) -> FilestoreResult<()> {
        self.take_handle(handle)?;
        Ok(())
    }

    fn read(&self, handle: FileHandle, offset: u64, len: usize) -> FilestoreResult<Vec<u8>> {
        let mut files = self.open_files.lock().unwrap();
        let file = files
            .get_mut(&handle)
            .ok_or(FilestoreError::UnknownHandle(handle))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Self::io_err(Path::new(""), e))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .map_err(|e| Self::io_err(Path::new(""), e))?;
        Ok(buf)
    }

    fn write(&self, handle: FileHandle, offset: u64, data: &[u8]) -> FilestoreResult<()> {
        let mut files = self.open_files.lock().unwrap();
        let file = files
            .get_mut(&handle)
            .ok_or(FilestoreError::UnknownHandle(handle))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Self::io_err(Path::new(""), e))?;
        file.write_all(data)
            .map_err(|e| Self::io_err(Path::new(""), e))
    }

    fn create_file(&self, path: &Path) -> FilestoreResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| Self::io_err(parent, e))?;
            }
        }
        File::create(path).map_err(|e| Self::io_err(path, e))?;
        Ok(())
    }

    fn delete_file(&self, path: &Path) -> FilestoreResult<()> {
        fs::remove_file(path).map_err(|e| Self::io_err(path, e))
    }

    fn rename(&self, src: &Path, dst: &Path) -> FilestoreResult<()> {
        fs::rename(src, dst).map_err(|e| Self::io_err(src, e))
    }

    fn append(&self, src: &Path, dst: &Path) -> FilestoreResult<()> {
        let mut src_file = File::open(src).map_err(|e| Self::io_err(src, e))?;
        let mut dst_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dst)
            .map_err(|e| Self::io_err(dst, e))?;
        std::io::copy(&mut src_file, &mut dst_file).map_err(|e| Self::io_err(src, e))?;
        Ok(())
    }

    fn create_directory(&self, path: &Path) -> FilestoreResult<()> {
        fs::create_dir_all(path).map_err(|e| Self::io_err(path, e))
    }

    fn remove_directory(&self, path: &Path) -> FilestoreResult<()> {
        fs::remove_dir(path).map_err(|e| Self::io_err(path, e))
    }

    fn replace(&self, src: &Path, dst: &Path) -> FilestoreResult<()> {
        fs::copy(src, dst).map_err(|e| Self::io_err(src, e))?;
        Ok(())
    }

    fn file_size(&self, path: &Path) -> FilestoreResult<u64> {
        Ok(fs::metadata(path).map_err(|e| Self::io_err(path, e))?.len())
    }

    fn calculate_checksum(
        &self,
        checksum_type: ChecksumType,
        path: &Path,
        offset: u64,
        len: u64,
    ) -> FilestoreResult<u32> {
        let mut file = File::open(path).map_err(|e| Self::io_err(path, e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Self::io_err(path, e))?;
        checksum_over_reader(checksum_type, &mut file, len).map_err(|e| Self::io_err(path, e))
    }
}

/// Wraps another [`VirtualFilestore`] and rejects any path that, once
/// joined to `root` and lexically normalized, would resolve outside of it.
/// Rejections surface as [`FilestoreError::PathEscapesRoot`], which
/// `cfdp-core`'s handlers translate into a `FILESTORE_REJECTION` condition
/// code.
#[derive(Debug)]
pub struct RestrictedFilestore<FS> {
    root: PathBuf,
    inner: FS,
}

impl<FS: VirtualFilestore> RestrictedFilestore<FS> {
    pub fn new(root: impl Into<PathBuf>, inner: FS) -> Self {
        Self {
            root: root.into(),
            inner,
        }
    }

    fn confine(&self, path: &Path) -> FilestoreResult<PathBuf> {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let normalized = normalize_lexically(&joined);
        let normalized_root = normalize_lexically(&self.root);
        if !normalized.starts_with(&normalized_root) {
            return Err(FilestoreError::PathEscapesRoot(path.to_path_buf()));
        }
        Ok(normalized)
    }
}

/// Resolves `.`/`..` components without touching the filesystem (the path
/// need not exist yet, e.g. for `create_file`).
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

impl<FS: VirtualFilestore> VirtualFilestore for RestrictedFilestore<FS> {
    fn open_read(&self, path: &Path) -> FilestoreResult<FileHandle> {
        self.inner.open_read(&self.confine(path)?)
    }

    fn open_write(&self, path: &Path, truncate: bool) -> FilestoreResult<FileHandle> {
        self.inner.open_write(&self.confine(path)?, truncate)
    }

    fn close(&self, handle: FileHandle) -> FilestoreResult<()> {
        self.inner.close(handle)
    }

    fn read(&self, handle: FileHandle, offset: u64, len: usize) -> FilestoreResult<Vec<u8>> {
        self.inner.read(handle, offset, len)
    }

    fn write(&self, handle: FileHandle, offset: u64, data: &[u8]) -> FilestoreResult<()> {
        self.inner.write(handle, offset, data)
    }

    fn create_file(&self, path: &Path) -> FilestoreResult<()> {
        self.inner.create_file(&self.confine(path)?)
    }

    fn delete_file(&self, path: &Path) -> FilestoreResult<()> {
        self.inner.delete_file(&self.confine(path)?)
    }

    fn rename(&self, src: &Path, dst: &Path) -> FilestoreResult<()> {
        self.inner.rename(&self.confine(src)?, &self.confine(dst)?)
    }

    fn append(&self, src: &Path, dst: &Path) -> FilestoreResult<()> {
        self.inner.append(&self.confine(src)?, &self.confine(dst)?)
    }

    fn create_directory(&self, path: &Path) -> FilestoreResult<()> {
        self.inner.create_directory(&self.confine(path)?)
    }

    fn remove_directory(&self, path: &Path) -> FilestoreResult<()> {
        self.inner.remove_directory(&self.confine(path)?)
    }

    fn replace(&self, src: &Path, dst: &Path) -> FilestoreResult<()> {
        self.inner.replace(&self.confine(src)?, &self.confine(dst)?)
    }

    fn file_size(&self, path: &Path) -> FilestoreResult<u64> {
        self.inner.file_size(&self.confine(path)?)
    }

    fn calculate_checksum(
        &self,
        checksum_type: ChecksumType,
        path: &Path,
        offset: u64,
        len: u64,
    ) -> FilestoreResult<u32> {
        self.inner
            .calculate_checksum(checksum_type, &self.confine(path)?, offset, len)
    }
}

/// In-memory filestore used by this crate's own tests (and available to
/// downstream test suites) so handler tests never touch the real
/// filesystem.
#[derive(Debug, Default)]
pub struct InMemoryFilestore {
    next_handle: AtomicU64,
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    open_files: Mutex<HashMap<FileHandle, PathBuf>>,
}

impl InMemoryFilestore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds `path` with `contents`, as if it had been written by a prior
    /// transfer. Test-only convenience, not part of the trait contract.
    pub fn seed(&self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
        self.files.lock().unwrap().insert(path.into(), contents.into());
    }

    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }
}

impl VirtualFilestore for InMemoryFilestore {
    fn open_read(&self, path: &Path) -> FilestoreResult<FileHandle> {
        if !self.files.lock().unwrap().contains_key(path) {
            return Err(FilestoreError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        let handle = FileHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.open_files
            .lock()
            .unwrap()
            .insert(handle, path.to_path_buf());
        Ok(handle)
    }

    fn open_write(&self, path: &Path, truncate: bool) -> FilestoreResult<FileHandle> {
        let mut files = self.files.lock().unwrap();
        if truncate || !files.contains_key(path) {
            files.insert(path.to_path_buf(), Vec::new());
        }
        drop(files);
        let handle = FileHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.open_files
            .lock()
            .unwrap()
            .insert(handle, path.to_path_buf());
        Ok(handle)
    }

    fn close(&self, handle: FileHandle) -> FilestoreResult<()> {
        self.open_files
            .lock()
            .unwrap()
            .remove(&handle)
            .ok_or(FilestoreError::UnknownHandle(handle))?;
        Ok(())
    }

    fn read(&self, handle: FileHandle, offset: u64, len: usize) -> FilestoreResult<Vec<u8>> {
        let open_files = self.open_files.lock().unwrap();
        let path = open_files
            .get(&handle)
            .ok_or(FilestoreError::UnknownHandle(handle))?;
        let files = self.files.lock().unwrap();
        let data = files.get(path).ok_or(FilestoreError::Io {
            path: path.clone(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })?;
        let start = offset as usize;
        Ok(data[start..start + len].to_vec())
    }

    fn write(&self, handle: FileHandle, offset: u64, data: &[u8]) -> FilestoreResult<()> {
        let open_files = self.open_files.lock().unwrap();
        let path = open_files
            .get(&handle)
            .ok_or(FilestoreError::UnknownHandle(handle))?;
        let mut files = self.files.lock().unwrap();
        let entry = files.entry(path.clone()).or_default();
        let end = offset as usize + data.len();
        if entry.len() < end {
            entry.resize(end, 0);
        }
        entry[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn create_file(&self, path: &Path) -> FilestoreResult<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), Vec::new());
        Ok(())
    }

    fn delete_file(&self, path: &Path) -> FilestoreResult<()> {
        self.files
            .lock()
            .unwrap()
            .remove(path)
            .ok_or_else(|| FilestoreError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })?;
        Ok(())
    }

    fn rename(&self, src: &Path, dst: &Path) -> FilestoreResult<()> {
        let mut files = self.files.lock().unwrap();
        let data = files.remove(src).ok_or_else(|| FilestoreError::Io {
            path: src.to_path_buf(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })?;
        files.insert(dst.to_path_buf(), data);
        Ok(())
    }

    fn append(&self, src: &Path, dst: &Path) -> FilestoreResult<()> {
        let mut files = self.files.lock().unwrap();
        let data = files
            .get(src)
            .ok_or_else(|| FilestoreError::Io {
                path: src.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })?
            .clone();
        files.entry(dst.to_path_buf()).or_default().extend(data);
        Ok(())
    }

    fn create_directory(&self, _path: &Path) -> FilestoreResult<()> {
        Ok(())
    }

    fn remove_directory(&self, _path: &Path) -> FilestoreResult<()> {
        Ok(())
    }

    fn replace(&self, src: &Path, dst: &Path) -> FilestoreResult<()> {
        let mut files = self.files.lock().unwrap();
        let data = files
            .get(src)
            .ok_or_else(|| FilestoreError::Io {
                path: src.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })?
            .clone();
        files.insert(dst.to_path_buf(), data);
        Ok(())
    }

    fn file_size(&self, path: &Path) -> FilestoreResult<u64> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|d| d.len() as u64)
            .ok_or_else(|| FilestoreError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
    }

    fn calculate_checksum(
        &self,
        checksum_type: ChecksumType,
        path: &Path,
        offset: u64,
        len: u64,
    ) -> FilestoreResult<u32> {
        let files = self.files.lock().unwrap();
        let data = files.get(path).ok_or_else(|| FilestoreError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })?;
        let start = offset as usize;
        let end = start + len as usize;
        let slice = &data[start..end];
        checksum_over_reader(checksum_type, slice, len).map_err(|e| FilestoreError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_write_read_round_trip() {
        let fs = InMemoryFilestore::new();
        let handle = fs.open_write(Path::new("a.bin"), true).unwrap();
        fs.write(handle, 0, &[1, 2, 3, 4]).unwrap();
        fs.close(handle).unwrap();
        let read_handle = fs.open_read(Path::new("a.bin")).unwrap();
        let data = fs.read(read_handle, 0, 4).unwrap();
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn null_checksum_is_always_zero() {
        let fs = InMemoryFilestore::new();
        fs.seed("a.bin", vec![0xffu8; 16]);
        let checksum = fs
            .calculate_checksum(ChecksumType::Null, Path::new("a.bin"), 0, 16)
            .unwrap();
        assert_eq!(checksum, 0);
    }

    #[test]
    fn crc32_checksum_matches_crc_crate() {
        let fs = InMemoryFilestore::new();
        fs.seed("a.bin", b"123456789".to_vec());
        let checksum = fs
            .calculate_checksum(ChecksumType::Crc32, Path::new("a.bin"), 0, 9)
            .unwrap();
        let crc = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
        assert_eq!(checksum, crc.checksum(b"123456789"));
    }

    #[test]
    fn restricted_filestore_rejects_path_escape() {
        let restricted = RestrictedFilestore::new("/sandbox", InMemoryFilestore::new());
        let err = restricted
            .create_file(Path::new("../escape.bin"))
            .unwrap_err();
        assert!(matches!(err, FilestoreError::PathEscapesRoot(_)));
    }

    #[test]
    fn restricted_filestore_allows_paths_within_root() {
        let restricted = RestrictedFilestore::new("/sandbox", InMemoryFilestore::new());
        restricted.create_file(Path::new("incoming/file.bin")).unwrap();
        assert!(restricted
            .inner
            .files
            .lock()
            .unwrap()
            .contains_key(Path::new("/sandbox/incoming/file.bin")));
    }
}
