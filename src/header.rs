//! Format-independent view of an on-disk volume header.

use crate::cipher::CipherSpec;
use crate::error::Result;
use crate::kdf::{HashAlgorithm, KdfTuning};
use crate::params::FormatType;
use crate::storage::Storage;
use crate::volume_key::VolumeKey;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlotStatus {
    Inactive,
    Active,
}

impl fmt::Display for KeySlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => f.write_str("DISABLED"),
            Self::Active => f.write_str("ENABLED"),
        }
    }
}

/// Slot selector for operations that accept "any slot".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Slot {
    /// The lowest free slot when adding, every active slot when unlocking.
    #[default]
    Any,
    Index(usize),
}

impl From<usize> for Slot {
    fn from(index: usize) -> Self {
        Slot::Index(index)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Any => f.write_str("any"),
            Slot::Index(index) => write!(f, "{index}"),
        }
    }
}

/// Per-slot details shown by `dump`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySlotInfo {
    pub index: usize,
    pub status: KeySlotStatus,
    pub iterations: u32,
    pub salt: Vec<u8>,
    /// Start of the key material area, in sectors.
    pub material_offset: u64,
    pub stripes: u32,
}

/// Operations the device handle needs from a loaded or freshly created header.
///
/// Mutating methods leave `self` unchanged when they fail.
pub trait VolumeHeader: fmt::Debug + Send {
    fn format_type(&self) -> FormatType;

    fn uuid(&self) -> &str;

    fn cipher(&self) -> &CipherSpec;

    fn hash(&self) -> HashAlgorithm;

    fn volume_key_size(&self) -> usize {
        self.cipher().key_size()
    }

    /// Start of the encrypted payload, in 512-byte sectors.
    fn payload_offset(&self) -> u64;

    /// Bytes from the start of the device up to the payload: the header plus
    /// every key material area.
    fn header_size(&self) -> u64;

    /// Iterations of the volume key digest.
    fn digest_iterations(&self) -> u32;

    fn keyslot_max(&self) -> usize;

    fn keyslot_info(&self, index: usize) -> Result<KeySlotInfo>;

    fn keyslot_status(&self, index: usize) -> Result<KeySlotStatus> {
        self.keyslot_info(index).map(|info| info.status)
    }

    /// Check `key` against the stored digest.
    fn verify_volume_key(&self, key: &VolumeKey) -> Result<()>;

    /// Bind `passphrase` to `key` in slot `index`, writing key material and
    /// then the header to `storage`.
    fn add_keyslot(
        &mut self,
        storage: &mut Storage,
        index: usize,
        key: &VolumeKey,
        passphrase: &[u8],
        tuning: &mut KdfTuning,
    ) -> Result<()>;

    /// Recover the volume key from slot `index`.
    fn open_keyslot(&self, storage: &Storage, index: usize, passphrase: &[u8]) -> Result<VolumeKey>;

    /// Disable slot `index` and wipe its key material.
    fn destroy_keyslot(&mut self, storage: &mut Storage, index: usize) -> Result<()>;

    /// Serialized header region as written by a fresh format: header fields
    /// followed by zeroed key material areas, `header_size()` bytes long.
    fn region_bytes(&self) -> Vec<u8>;

    /// Write only the header fields, leaving key material untouched.
    fn write_header(&self, storage: &mut Storage) -> Result<()>;
}
