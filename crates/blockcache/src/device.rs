//! Block devices
//!
//! - [`MemoryDevice`]: RAM-backed, with fault injection and I/O counters
//! - [`FileDevice`]: positioned I/O on a regular file or a block device

use crate::transport::BlockDevice;
use blockcache_common::{BlockNumber, Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

#[derive(Default)]
struct Faults {
    reads: HashMap<BlockNumber, ErrorKind>,
    writes: HashMap<BlockNumber, ErrorKind>,
    flush: Option<ErrorKind>,
}

/// RAM-backed block device
pub struct MemoryDevice {
    data: RwLock<Vec<u8>>,
    faults: Mutex<Faults>,
    reads: AtomicU64,
    writes: AtomicU64,
    flushes: AtomicU64,
}

impl MemoryDevice {
    /// Create a zero-filled device of `size` bytes
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            data: RwLock::new(vec![0u8; size]),
            faults: Mutex::new(Faults::default()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Make every read of `block` fail with `kind`
    pub fn fail_reads(&self, block: BlockNumber, kind: ErrorKind) {
        self.faults.lock().reads.insert(block, kind);
    }

    /// Make every write of `block` fail with `kind`
    pub fn fail_writes(&self, block: BlockNumber, kind: ErrorKind) {
        self.faults.lock().writes.insert(block, kind);
    }

    /// Make `flush` fail with `kind`
    pub fn fail_flush(&self, kind: ErrorKind) {
        self.faults.lock().flush = Some(kind);
    }

    /// Remove every injected fault
    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Successful and failed reads so far
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Successful and failed writes so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Flushes so far
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Copy raw device bytes, bypassing any cache
    pub fn contents(&self, offset: usize, len: usize) -> Vec<u8> {
        self.data.read()[offset..offset + len].to_vec()
    }

    /// Overwrite raw device bytes, bypassing any cache
    pub fn fill(&self, offset: usize, bytes: &[u8]) {
        self.data.write()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn range(&self, block: BlockNumber, len: usize) -> io::Result<std::ops::Range<usize>> {
        let start = usize::try_from(block)
            .ok()
            .and_then(|b| b.checked_mul(len))
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "block number overflow"))?;
        let end = start + len;
        if end > self.data.read().len() {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("block {block} is beyond the end of the device"),
            ));
        }
        Ok(start..end)
    }
}

impl BlockDevice for MemoryDevice {
    fn device_size(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> io::Result<()> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if let Some(kind) = self.faults.lock().reads.get(&block) {
            return Err(io::Error::new(*kind, "injected read fault"));
        }
        let range = self.range(block, buf.len())?;
        buf.copy_from_slice(&self.data.read()[range]);
        Ok(())
    }

    fn write_block(&self, block: BlockNumber, buf: &[u8]) -> io::Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if let Some(kind) = self.faults.lock().writes.get(&block) {
            return Err(io::Error::new(*kind, "injected write fault"));
        }
        let range = self.range(block, buf.len())?;
        self.data.write()[range].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        match self.faults.lock().flush {
            Some(kind) => Err(io::Error::new(kind, "injected flush fault")),
            None => Ok(()),
        }
    }
}

/// Block device over a file or a raw block device node
pub struct FileDevice {
    file: File,
    path: String,
    size: u64,
    read_only: bool,
}

impl FileDevice {
    /// Open an existing file or device
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .map_err(|e| Error::invalid_argument(format!("failed to open {path_str}: {e}")))?;

        let size = if Self::is_block_device(&path) {
            Self::block_device_size(&file, &path_str)?
        } else {
            file.metadata()?.len()
        };

        info!(path = %path_str, size, read_only, "opened file device");
        Ok(Self {
            file,
            path: path_str,
            size,
            read_only,
        })
    }

    /// Create (or truncate) a regular file of `size` bytes
    ///
    /// Block device nodes are opened as-is and keep their own size.
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        if Self::is_block_device(&path) {
            return Self::open(path, false);
        }
        let path_str = path.as_ref().to_string_lossy().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::invalid_argument(format!("failed to create {path_str}: {e}")))?;
        file.set_len(size)?;

        info!(path = %path_str, size, "created file device");
        Ok(Self {
            file,
            path: path_str,
            size,
            read_only: false,
        })
    }

    /// Path the device was opened from
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[cfg(unix)]
    fn is_block_device(path: impl AsRef<Path>) -> bool {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(path).is_ok_and(|m| m.file_type().is_block_device())
    }

    #[cfg(not(unix))]
    fn is_block_device(_path: impl AsRef<Path>) -> bool {
        false
    }

    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::os::unix::io::AsRawFd;

        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

        let mut size: u64 = 0;
        // SAFETY: BLKGETSIZE64 writes one u64 through the provided pointer.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
        if ret == -1 {
            return Err(Error::invalid_argument(format!(
                "failed to get block device size for {path}: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(size)
    }

    #[cfg(not(target_os = "linux"))]
    fn block_device_size(file: &File, _path: &str) -> Result<u64> {
        use std::io::{Seek, SeekFrom};
        let mut f = file;
        let size = f.seek(SeekFrom::End(0))?;
        f.seek(SeekFrom::Start(0))?;
        Ok(size)
    }

    fn offset(block: BlockNumber, len: usize) -> io::Result<u64> {
        block
            .checked_mul(len as u64)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "block number overflow"))
    }
}

impl BlockDevice for FileDevice {
    fn device_size(&self) -> u64 {
        self.size
    }

    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> io::Result<()> {
        let offset = Self::offset(block, buf.len())?;
        read_exact_at(&self.file, buf, offset)
    }

    fn write_block(&self, block: BlockNumber, buf: &[u8]) -> io::Result<()> {
        if self.read_only {
            return Err(io::Error::new(
                ErrorKind::PermissionDenied,
                format!("{} is read-only", self.path),
            ));
        }
        let offset = Self::offset(block, buf.len())?;
        if offset + buf.len() as u64 > self.size {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("block {block} is beyond the end of {}", self.path),
            ));
        }
        write_all_at(&self.file, buf, offset)
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ));
            }
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ));
            }
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_memory_device_read_write() {
        let device = MemoryDevice::new(4096);
        device.write_block(2, &[7u8; 512]).unwrap();

        let mut buf = [0u8; 512];
        device.read_block(2, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 512]);
        assert_eq!(device.contents(1024, 4), vec![7, 7, 7, 7]);
        assert_eq!(device.read_count(), 1);
        assert_eq!(device.write_count(), 1);
    }

    #[test]
    fn test_memory_device_bounds() {
        let device = MemoryDevice::new(1024);
        let mut buf = [0u8; 512];
        let err = device.read_block(2, &mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_memory_device_faults() {
        let device = MemoryDevice::new(4096);
        device.fail_reads(1, ErrorKind::TimedOut);
        device.fail_writes(2, ErrorKind::PermissionDenied);
        device.fail_flush(ErrorKind::Other);

        let mut buf = [0u8; 512];
        assert_eq!(device.read_block(1, &mut buf).unwrap_err().kind(), ErrorKind::TimedOut);
        assert_eq!(
            device.write_block(2, &buf).unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );
        assert!(device.flush().is_err());

        device.clear_faults();
        device.read_block(1, &mut buf).unwrap();
        device.write_block(2, &buf).unwrap();
        device.flush().unwrap();
    }

    #[test]
    fn test_file_device_round_trip() {
        let temp = NamedTempFile::new().unwrap();
        {
            let device = FileDevice::create(temp.path(), 16 * 1024).unwrap();
            assert_eq!(device.device_size(), 16 * 1024);
            device.write_block(3, &[0x5Au8; 4096]).unwrap();
            device.flush().unwrap();
        }

        let device = FileDevice::open(temp.path(), true).unwrap();
        let mut buf = vec![0u8; 4096];
        device.read_block(3, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x5A));

        let err = device.write_block(0, &buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_file_device_rejects_write_past_end() {
        let temp = NamedTempFile::new().unwrap();
        let device = FileDevice::create(temp.path(), 4096).unwrap();
        let err = device.write_block(1, &[0u8; 4096]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }
}
