//! cryptdev - LUKS1 volume formatting, key-slot management and dm-crypt activation
//!
//! A [`Device`] wraps a block device or image file. Format or load a header,
//! bind passphrases to key slots, then activate the payload as a
//! device-mapper target through a [`dm::DeviceMapper`] backend.

#![forbid(unsafe_code)]

pub mod activate;
pub mod afsplit;
pub mod backup;
pub mod cipher;
pub mod config;
pub mod device;
pub mod dm;
pub mod error;
pub mod header;
pub mod kdf;
pub mod keyslot;
pub mod logging;
pub mod luks1;
pub mod params;
pub mod passphrase;
pub mod storage;
pub mod volume_key;

pub use activate::ActivateFlags;
pub use config::Config;
pub use device::{Device, DeviceOptions};
pub use dm::{DeviceMapper, DmsetupBackend, MappingState, MappingTable};
pub use error::{CryptError, Errno, ErrorCategory, ErrorKind, Result};
pub use header::{KeySlotInfo, KeySlotStatus, Slot, VolumeHeader};
pub use params::{FillDefaultValues, FormatParams, FormatType, GenericParams, Luks1Params};
pub use volume_key::VolumeKey;
