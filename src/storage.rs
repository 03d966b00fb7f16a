//! Byte-addressable access to the backing device.
//!
//! A [`Storage`] owns its file descriptor; dropping it closes the device.
//! Block devices and regular image files are handled the same way.
//!
//! A writable storage holds an exclusive `flock` on the file for its whole
//! lifetime, and block devices are additionally opened with `O_EXCL`, so a
//! second writable open of the same device fails with `EBUSY`.

use crate::error::{CryptError, ErrorCategory, ErrorKind, Errno, Result};
use std::fs::{File, OpenOptions, TryLockError};
use std::io::{self, Seek, SeekFrom};
use std::os::unix::fs::{FileExt, FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct Storage {
    path: PathBuf,
    file: File,
    size: u64,
    block_device: bool,
    writable: bool,
}

impl Storage {
    /// Open `path` for reading and writing.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, true)
    }

    /// Open `path` without write access, e.g. for inspecting a header backup.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        Self::open_with(path, false)
    }

    fn open_with(path: &Path, writable: bool) -> Result<Self> {
        let metadata = std::fs::metadata(path).map_err(|e| open_error(path, e))?;
        let file_type = metadata.file_type();
        if !(file_type.is_file() || file_type.is_block_device()) {
            return Err(CryptError::with_kind(
                ErrorCategory::NotFound,
                Errno::NotBlockDevice,
                ErrorKind::DeviceNotFound,
                format!("{} is not a block device or image file", path.display()),
            ));
        }

        let mut options = OpenOptions::new();
        options.read(true).write(writable);
        if writable && file_type.is_block_device() {
            options.custom_flags(libc::O_EXCL);
        }
        let mut file = options.open(path).map_err(|e| open_error(path, e))?;

        let locked = if writable {
            file.try_lock()
        } else {
            file.try_lock_shared()
        };
        match locked {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(CryptError::with_kind(
                    ErrorCategory::Busy,
                    Errno::Busy,
                    ErrorKind::DeviceBusy,
                    format!("{} is in use by another handle", path.display()),
                ));
            }
            Err(TryLockError::Error(e)) => {
                return Err(CryptError::io(format!("failed to lock {}", path.display()), e));
            }
        }

        // Block devices report a zero length in metadata; seeking works for both.
        let size = file
            .seek(SeekFrom::End(0))
            .map_err(|e| CryptError::io(format!("failed to size {}", path.display()), e))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
            block_device: file_type.is_block_device(),
            writable,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the device in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_block_device(&self) -> bool {
        self.block_device
    }

    /// Fill `buf` from `offset`. Reading past the end of the device is an error.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        self.file.read_exact_at(buf, offset).map_err(|e| {
            CryptError::io(
                format!(
                    "failed to read {} bytes at offset {offset} from {}",
                    buf.len(),
                    self.path.display()
                ),
                e,
            )
        })
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(CryptError::with_kind(
                ErrorCategory::Invalid,
                Errno::NotPermitted,
                ErrorKind::PermissionDenied,
                format!("{} was opened read-only", self.path.display()),
            ));
        }
        self.check_range(offset, data.len())?;
        self.file.write_all_at(data, offset).map_err(|e| {
            CryptError::io(
                format!(
                    "failed to write {} bytes at offset {offset} to {}",
                    data.len(),
                    self.path.display()
                ),
                e,
            )
        })
    }

    /// Flush written data to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| CryptError::io(format!("failed to sync {}", self.path.display()), e))
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(CryptError::with_kind(
                ErrorCategory::Invalid,
                Errno::Invalid,
                ErrorKind::DeviceTooSmall,
                format!(
                    "access of {len} bytes at offset {offset} is beyond the end of {} ({} bytes)",
                    self.path.display(),
                    self.size
                ),
            )),
        }
    }
}

fn open_error(path: &Path, err: io::Error) -> CryptError {
    if err.kind() == io::ErrorKind::ResourceBusy {
        return CryptError::with_kind_and_source(
            ErrorCategory::Busy,
            Errno::Busy,
            ErrorKind::DeviceBusy,
            format!("{} is in use", path.display()),
            err,
        );
    }
    CryptError::io(format!("cannot open device {}", path.display()), err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_open_reports_size() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("disk.img");
        fs::write(&path, vec![0u8; 8192]).unwrap();

        let storage = Storage::open(&path).unwrap();
        assert_eq!(storage.size(), 8192);
        assert!(!storage.is_block_device());
        assert_eq!(storage.path(), path.as_path());
    }

    #[test]
    fn test_missing_path_is_enotblk() {
        let temp_dir = TempDir::new().unwrap();
        let err = Storage::open(&temp_dir.path().join("missing")).unwrap_err();
        assert_eq!(err.code(), -15);
        assert_eq!(err.category, ErrorCategory::NotFound);
    }

    #[test]
    fn test_directory_is_enotblk() {
        let temp_dir = TempDir::new().unwrap();
        let err = Storage::open(temp_dir.path()).unwrap_err();
        assert_eq!(err.code(), -15);
    }

    #[test]
    fn test_write_then_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("disk.img");
        fs::write(&path, vec![0u8; 4096]).unwrap();

        let mut storage = Storage::open(&path).unwrap();
        storage.write_at(100, b"hello").unwrap();
        storage.sync().unwrap();

        let mut buf = [0u8; 5];
        storage.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_out_of_range_access_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("disk.img");
        fs::write(&path, vec![0u8; 512]).unwrap();

        let mut storage = Storage::open(&path).unwrap();
        let err = storage.write_at(510, b"four").unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::DeviceTooSmall));
        // Nothing was written past the end.
        assert_eq!(fs::metadata(&path).unwrap().len(), 512);
    }

    #[test]
    fn test_second_writable_open_is_busy() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("disk.img");
        fs::write(&path, vec![0u8; 512]).unwrap();

        let first = Storage::open(&path).unwrap();
        let err = Storage::open(&path).unwrap_err();
        assert_eq!(err.code(), -16);
        assert_eq!(err.category, ErrorCategory::Busy);
        assert_eq!(err.kind, Some(ErrorKind::DeviceBusy));
        assert_eq!(Storage::open_read_only(&path).unwrap_err().code(), -16);

        drop(first);
        Storage::open(&path).unwrap();
    }

    #[test]
    fn test_read_only_opens_share() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("backup.bin");
        fs::write(&path, vec![0u8; 512]).unwrap();

        let _first = Storage::open_read_only(&path).unwrap();
        Storage::open_read_only(&path).unwrap();
        assert_eq!(Storage::open(&path).unwrap_err().code(), -16);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("disk.img");
        fs::write(&path, vec![0u8; 512]).unwrap();

        let mut storage = Storage::open_read_only(&path).unwrap();
        let err = storage.write_at(0, b"x").unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::PermissionDenied));
    }
}
