//! Activation: exposing the decrypted payload as a named mapping.

use crate::device::Device;
use crate::dm::{self, MappingRequest, MappingState};
use crate::error::{CryptError, ErrorKind, Result};
use crate::header::Slot;
use crate::volume_key::VolumeKey;
use log::info;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Options for a new mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActivateFlags(u32);

impl ActivateFlags {
    pub const READONLY: Self = Self(1 << 0);
    pub const ALLOW_DISCARDS: Self = Self(1 << 3);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ActivateFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ActivateFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ActivateFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::READONLY) {
            names.push("readonly");
        }
        if self.contains(Self::ALLOW_DISCARDS) {
            names.push("discards");
        }
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join(","))
        }
    }
}

impl Device {
    /// Unlock with `passphrase` and map the payload as `name`.
    ///
    /// With `name == None` only the passphrase is checked. Returns the slot
    /// that unlocked.
    pub fn activate_by_passphrase(
        &mut self,
        name: Option<&str>,
        slot: Slot,
        passphrase: &[u8],
        flags: ActivateFlags,
    ) -> Result<usize> {
        self.require_header()?;
        if let Some(name) = name {
            self.check_name_free(name)?;
        }

        let (index, key) = self.unlock(slot, passphrase)?;
        match name {
            Some(name) => self.create_mapping(name, &key, flags)?,
            None => info!("passphrase for {} matches key slot {index}", self.path().display()),
        }
        Ok(index)
    }

    /// Map the payload as `name` using a volume key directly.
    ///
    /// `None` uses the key resident on the handle. With `name == None` only
    /// the key is checked.
    pub fn activate_by_volume_key(
        &mut self,
        name: Option<&str>,
        volume_key: Option<&[u8]>,
        flags: ActivateFlags,
    ) -> Result<()> {
        let header = self.require_header()?;
        let key = match volume_key {
            Some(bytes) => {
                let key = VolumeKey::from_bytes(bytes);
                header.verify_volume_key(&key)?;
                key
            }
            None => self.volume_key.clone().ok_or_else(|| {
                CryptError::invalid(
                    ErrorKind::NoVolumeKey,
                    "no volume key is resident on this handle",
                )
            })?,
        };

        if let Some(name) = name {
            self.check_name_free(name)?;
            self.create_mapping(name, &key, flags)?;
        }
        Ok(())
    }

    /// Remove the mapping `name`.
    pub fn deactivate(&mut self, name: &str) -> Result<()> {
        dm::check_name(name)?;
        self.mapper.remove(name)?;
        info!("deactivated {name}");
        Ok(())
    }

    pub fn status(&self, name: &str) -> Result<MappingState> {
        dm::check_name(name)?;
        self.mapper.status(name)
    }

    fn check_name_free(&self, name: &str) -> Result<()> {
        dm::check_name(name)?;
        match self.mapper.status(name)? {
            MappingState::Inactive => Ok(()),
            MappingState::Active | MappingState::Busy => Err(dm::mapping_exists(name)),
        }
    }

    fn create_mapping(&self, name: &str, key: &VolumeKey, flags: ActivateFlags) -> Result<()> {
        let header = self.require_header()?;
        let total_sectors = self.storage.size() / crate::cipher::SECTOR_SIZE as u64;
        let offset = header.payload_offset();
        let size = total_sectors.saturating_sub(offset);
        if size == 0 {
            return Err(CryptError::invalid(
                ErrorKind::DeviceTooSmall,
                format!("{} has no room for a payload after its header", self.path().display()),
            ));
        }

        let uuid = format!(
            "CRYPT-{}-{}-{name}",
            header.format_type(),
            header.uuid().replace('-', "")
        );
        let request = MappingRequest {
            name,
            device: self.storage.path(),
            cipher: header.cipher(),
            key,
            offset,
            size,
            flags,
            uuid: Some(uuid),
        };
        self.mapper.create(&request)?;

        info!(
            "activated {name} from {} ({size} sectors, flags {flags})",
            self.path().display()
        );
        Ok(())
    }
}
