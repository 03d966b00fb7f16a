use super::{DeviceMapper, MappingRequest, MappingState};
use crate::activate::ActivateFlags;
use crate::error::{CryptError, ErrorCategory, ErrorKind, Errno, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

/// A mapping recorded by [`MappingTable`]. The key itself is not kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMapping {
    pub name: String,
    pub device: PathBuf,
    /// `cipher-mode` as it would appear in the dm table.
    pub cipher: String,
    pub offset: u64,
    pub size: u64,
    pub flags: ActivateFlags,
    pub uuid: Option<String>,
    open_count: u32,
}

impl ActiveMapping {
    pub fn read_only(&self) -> bool {
        self.flags.contains(ActivateFlags::READONLY)
    }
}

/// In-process mapping registry.
///
/// Clones share state, so a test can keep one handle for inspection and
/// give another to the device under test.
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    inner: Arc<Mutex<HashMap<String, ActiveMapping>>>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<ActiveMapping> {
        self.lock().ok()?.get(name).cloned()
    }

    /// Sorted names of every active mapping.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Simulate another user opening the mapping, so removal reports busy.
    pub fn hold(&self, name: &str) -> Result<()> {
        let mut map = self.lock()?;
        let mapping = map.get_mut(name).ok_or_else(|| super::mapping_not_found(name))?;
        mapping.open_count += 1;
        Ok(())
    }

    pub fn release(&self, name: &str) -> Result<()> {
        let mut map = self.lock()?;
        let mapping = map.get_mut(name).ok_or_else(|| super::mapping_not_found(name))?;
        mapping.open_count = mapping.open_count.saturating_sub(1);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, ActiveMapping>>> {
        self.inner.lock().map_err(|_| {
            CryptError::with_kind(
                ErrorCategory::Internal,
                Errno::Io,
                ErrorKind::InternalInvariant,
                "mapping table lock poisoned",
            )
        })
    }
}

impl DeviceMapper for MappingTable {
    fn create(&self, request: &MappingRequest<'_>) -> Result<()> {
        let mut map = self.lock()?;
        if map.contains_key(request.name) {
            return Err(super::mapping_exists(request.name));
        }
        map.insert(
            request.name.to_string(),
            ActiveMapping {
                name: request.name.to_string(),
                device: request.device.to_path_buf(),
                cipher: request.cipher.to_string(),
                offset: request.offset,
                size: request.size,
                flags: request.flags,
                uuid: request.uuid.clone(),
                open_count: 0,
            },
        );
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        let mut map = self.lock()?;
        let open_count = map
            .get(name)
            .map(|mapping| mapping.open_count)
            .ok_or_else(|| super::mapping_not_found(name))?;
        if open_count > 0 {
            return Err(super::mapping_busy(name));
        }
        map.remove(name);
        Ok(())
    }

    fn status(&self, name: &str) -> Result<MappingState> {
        let map = self.lock()?;
        Ok(match map.get(name) {
            None => MappingState::Inactive,
            Some(mapping) if mapping.open_count > 0 => MappingState::Busy,
            Some(_) => MappingState::Active,
        })
    }
}
