//! Device-mapper backends.
//!
//! Activation builds a [`MappingRequest`] and hands it to a [`DeviceMapper`].
//! [`DmsetupBackend`] drives the kernel through the `dmsetup` and `losetup`
//! binaries; [`MappingTable`] keeps mappings in process and is what tests use.

mod command;
mod dmsetup;
mod memory;

pub use dmsetup::DmsetupBackend;
pub use memory::{ActiveMapping, MappingTable};

use crate::activate::ActivateFlags;
use crate::cipher::CipherSpec;
use crate::error::{CryptError, ErrorCategory, ErrorKind, Errno, Result};
use crate::volume_key::VolumeKey;
use std::fmt;
use std::path::Path;
use zeroize::Zeroizing;

/// Longest mapping name the kernel accepts.
pub const DM_NAME_MAX: usize = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    Inactive,
    Active,
    /// Active and held open by another user.
    Busy,
}

impl fmt::Display for MappingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => f.write_str("inactive"),
            Self::Active => f.write_str("active"),
            Self::Busy => f.write_str("active and is in use"),
        }
    }
}

/// Everything a backend needs to create one dm-crypt mapping.
#[derive(Debug)]
pub struct MappingRequest<'a> {
    pub name: &'a str,
    /// Backing device or image file.
    pub device: &'a Path,
    pub cipher: &'a CipherSpec,
    pub key: &'a VolumeKey,
    /// Payload start on `device`, in sectors.
    pub offset: u64,
    /// Mapping length, in sectors.
    pub size: u64,
    pub flags: ActivateFlags,
    pub uuid: Option<String>,
}

impl MappingRequest<'_> {
    /// dm-crypt table line for `source`, the block device actually mapped.
    /// Contains the volume key in hex.
    pub fn table(&self, source: &Path) -> Zeroizing<String> {
        let mut table = Zeroizing::new(format!(
            "0 {} crypt {} {} 0 {} {}",
            self.size,
            self.cipher,
            self.key.to_hex().as_str(),
            source.display(),
            self.offset
        ));
        if self.flags.contains(ActivateFlags::ALLOW_DISCARDS) {
            table.push_str(" 1 allow_discards");
        }
        table.push('\n');
        table
    }
}

/// Creates, removes and queries named mappings.
pub trait DeviceMapper: fmt::Debug + Send + Sync {
    fn create(&self, request: &MappingRequest<'_>) -> Result<()>;

    fn remove(&self, name: &str) -> Result<()>;

    fn status(&self, name: &str) -> Result<MappingState>;
}

/// Reject names the kernel would refuse before any work is done.
pub fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > DM_NAME_MAX || name.contains('/') || name == "." || name == ".."
    {
        return Err(CryptError::invalid(
            ErrorKind::InternalInvariant,
            format!("`{name}` is not a valid mapping name"),
        ));
    }
    Ok(())
}

pub(crate) fn mapping_exists(name: &str) -> CryptError {
    CryptError::with_kind(
        ErrorCategory::Busy,
        Errno::Exists,
        ErrorKind::MappingExists,
        format!("device {name} already exists"),
    )
}

pub(crate) fn mapping_not_found(name: &str) -> CryptError {
    CryptError::with_kind(
        ErrorCategory::NotFound,
        Errno::NoDevice,
        ErrorKind::MappingNotFound,
        format!("device {name} is not active"),
    )
}

pub(crate) fn mapping_busy(name: &str) -> CryptError {
    CryptError::with_kind(
        ErrorCategory::Busy,
        Errno::Busy,
        ErrorKind::MappingBusy,
        format!("device {name} is still in use"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_table_line() {
        let cipher = CipherSpec::new("aes", "xts-plain64", 32).unwrap();
        let key = VolumeKey::from_bytes(&[0xAB; 32]);
        let device = PathBuf::from("/tmp/disk.img");
        let request = MappingRequest {
            name: "vol",
            device: &device,
            cipher: &cipher,
            key: &key,
            offset: 4096,
            size: 4096,
            flags: ActivateFlags::READONLY,
            uuid: None,
        };

        let table = request.table(Path::new("/dev/loop7"));
        assert_eq!(
            table.as_str(),
            format!("0 4096 crypt aes-xts-plain64 {} 0 /dev/loop7 4096\n", "ab".repeat(32))
        );
    }

    #[test]
    fn test_table_with_discards() {
        let cipher = CipherSpec::new("aes", "xts-plain64", 32).unwrap();
        let key = VolumeKey::from_bytes(&[0u8; 32]);
        let device = PathBuf::from("/dev/sdb");
        let request = MappingRequest {
            name: "vol",
            device: &device,
            cipher: &cipher,
            key: &key,
            offset: 4096,
            size: 100,
            flags: ActivateFlags::ALLOW_DISCARDS,
            uuid: None,
        };
        assert!(request.table(&device).ends_with(" 1 allow_discards\n"));
    }

    #[test]
    fn test_check_name() {
        assert!(check_name("testDeviceName").is_ok());
        assert_eq!(check_name("").unwrap_err().code(), -22);
        assert!(check_name("a/b").is_err());
        assert!(check_name(&"x".repeat(DM_NAME_MAX + 1)).is_err());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(mapping_exists("x").code(), -17);
        assert_eq!(mapping_not_found("x").code(), -19);
        assert_eq!(mapping_busy("x").code(), -16);
    }
}
