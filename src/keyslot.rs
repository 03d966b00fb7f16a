//! Key slot management on a [`Device`].

use crate::device::Device;
use crate::error::{CryptError, ErrorKind, Result};
use crate::header::{KeySlotStatus, Slot};
use crate::volume_key::VolumeKey;
use log::{debug, info};

impl Device {
    /// Number of key slots the loaded format provides.
    pub fn keyslot_max(&self) -> Result<usize> {
        Ok(self.require_header()?.keyslot_max())
    }

    pub fn keyslot_status(&self, index: usize) -> Result<KeySlotStatus> {
        self.require_header()?.keyslot_status(index)
    }

    /// Bind `passphrase` to the volume key in `slot` and return the slot used.
    ///
    /// `volume_key == None` uses the key left resident by [`Device::format`];
    /// an explicit key must match the header digest.
    pub fn add_passphrase_by_volume_key(
        &mut self,
        slot: Slot,
        volume_key: Option<&[u8]>,
        passphrase: &[u8],
    ) -> Result<usize> {
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
                    "no volume key is resident on this handle; pass one explicitly",
                )
            })?,
        };

        let index = self.free_slot(slot)?;
        self.bind(index, &key, passphrase)?;
        Ok(index)
    }

    /// Unlock with `existing` and bind `new` to the same volume key.
    pub fn add_passphrase_by_passphrase(
        &mut self,
        slot: Slot,
        existing: &[u8],
        new: &[u8],
    ) -> Result<usize> {
        let (unlocked, key) = self.unlock(Slot::Any, existing)?;
        let index = self.free_slot(slot)?;
        self.bind(index, &key, new)?;
        debug!("key slot {index} added using the passphrase of slot {unlocked}");
        Ok(index)
    }

    /// Disable slot `index` and wipe its key material. Other slots keep
    /// their numbers.
    pub fn destroy_keyslot(&mut self, index: usize) -> Result<()> {
        let path = self.path().to_path_buf();
        let header = self.header.as_mut().ok_or_else(|| no_header(&path))?;
        header.destroy_keyslot(&mut self.storage, index)?;
        info!("destroyed key slot {index} on {}", path.display());
        Ok(())
    }

    /// Recover the volume key with `passphrase`.
    pub fn volume_key_get(&self, slot: Slot, passphrase: &[u8]) -> Result<VolumeKey> {
        self.unlock(slot, passphrase).map(|(_, key)| key)
    }

    /// Try `slot`, or every active slot in order for [`Slot::Any`].
    pub(crate) fn unlock(&self, slot: Slot, passphrase: &[u8]) -> Result<(usize, VolumeKey)> {
        let header = self.require_header()?;
        match slot {
            Slot::Index(index) => header
                .open_keyslot(&self.storage, index, passphrase)
                .map(|key| (index, key)),
            Slot::Any => {
                for index in 0..header.keyslot_max() {
                    if header.keyslot_status(index)? != KeySlotStatus::Active {
                        continue;
                    }
                    match header.open_keyslot(&self.storage, index, passphrase) {
                        Ok(key) => return Ok((index, key)),
                        Err(err) if err.kind == Some(ErrorKind::PassphraseMismatch) => {
                            debug!("key slot {index} does not match");
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(CryptError::invalid(
                    ErrorKind::PassphraseMismatch,
                    "no key available with this passphrase",
                ))
            }
        }
    }

    fn free_slot(&self, slot: Slot) -> Result<usize> {
        let header = self.require_header()?;
        match slot {
            Slot::Index(index) => match header.keyslot_status(index)? {
                KeySlotStatus::Inactive => Ok(index),
                KeySlotStatus::Active => Err(CryptError::invalid(
                    ErrorKind::SlotOccupied,
                    format!("key slot {index} is already in use"),
                )),
            },
            Slot::Any => (0..header.keyslot_max())
                .find(|&index| matches!(header.keyslot_status(index), Ok(KeySlotStatus::Inactive)))
                .ok_or_else(|| {
                    CryptError::invalid(
                        ErrorKind::NoFreeSlot,
                        format!("all {} key slots are in use", header.keyslot_max()),
                    )
                }),
        }
    }

    fn bind(&mut self, index: usize, key: &VolumeKey, passphrase: &[u8]) -> Result<()> {
        let path = self.path().to_path_buf();
        let header = self.header.as_mut().ok_or_else(|| no_header(&path))?;
        header.add_keyslot(&mut self.storage, index, key, passphrase, &mut self.tuning)?;
        info!("added key slot {index} to {}", path.display());
        Ok(())
    }
}

fn no_header(path: &std::path::Path) -> CryptError {
    CryptError::invalid(
        ErrorKind::NoHeader,
        format!("{} has no loaded header; format or load it first", path.display()),
    )
}
