//! The device handle: storage, loaded header and resident volume key.

use crate::config::Config;
use crate::dm::{DeviceMapper, DmsetupBackend};
use crate::error::{CryptError, ErrorKind, Result};
use crate::header::VolumeHeader;
use crate::kdf::KdfTuning;
use crate::params::{FillDefaultValues, FormatParams, FormatType, GenericParams};
use crate::storage::Storage;
use crate::volume_key::VolumeKey;
use log::info;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// How a [`Device`] talks to device-mapper and how hard it derives keys.
#[derive(Clone)]
pub struct DeviceOptions {
    pub mapper: Arc<dyn DeviceMapper>,
    pub iteration_time: Duration,
}

impl DeviceOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            mapper: Arc::new(DmsetupBackend::from_config(config)),
            iteration_time: config.kdf.iteration_time(),
        }
    }

    /// Swap in another backend, e.g. a [`crate::dm::MappingTable`].
    pub fn with_mapper(mut self, mapper: Arc<dyn DeviceMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_iteration_time(mut self, iteration_time: Duration) -> Self {
        self.iteration_time = iteration_time;
        self
    }
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl fmt::Debug for DeviceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceOptions")
            .field("mapper", &self.mapper)
            .field("iteration_time", &self.iteration_time)
            .finish()
    }
}

/// An opened block device or image file.
///
/// Starts untyped; [`Device::format`] or [`Device::load`] attach a header.
/// The storage is closed when the handle is dropped.
pub struct Device {
    pub(crate) storage: Storage,
    pub(crate) header: Option<Box<dyn VolumeHeader>>,
    pub(crate) volume_key: Option<VolumeKey>,
    pub(crate) mapper: Arc<dyn DeviceMapper>,
    pub(crate) tuning: KdfTuning,
}

impl Device {
    /// Open `path` with the `dmsetup` backend and default KDF timing.
    pub fn init<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::init_with(path, DeviceOptions::default())
    }

    pub fn init_with<P: AsRef<Path>>(path: P, options: DeviceOptions) -> Result<Self> {
        let storage = Storage::open(path.as_ref())?;
        Ok(Self {
            storage,
            header: None,
            volume_key: None,
            mapper: options.mapper,
            tuning: KdfTuning::new(options.iteration_time),
        })
    }

    pub fn path(&self) -> &Path {
        self.storage.path()
    }

    /// Device size in bytes.
    pub fn size(&self) -> u64 {
        self.storage.size()
    }

    pub fn format_type(&self) -> Option<FormatType> {
        self.header.as_ref().map(|header| header.format_type())
    }

    /// Format tag, or `""` before format or load.
    pub fn type_name(&self) -> &str {
        self.format_type().map(|t| t.as_str()).unwrap_or("")
    }

    pub fn uuid(&self) -> Option<&str> {
        self.header.as_ref().map(|header| header.uuid())
    }

    pub fn header(&self) -> Option<&dyn VolumeHeader> {
        self.header.as_deref()
    }

    pub fn has_volume_key(&self) -> bool {
        self.volume_key.is_some()
    }

    pub fn iteration_time(&self) -> Duration {
        self.tuning.iteration_time()
    }

    pub fn set_iteration_time(&mut self, iteration_time: Duration) {
        self.tuning.set_iteration_time(iteration_time);
    }

    /// Write a fresh header with a new random volume key.
    ///
    /// Both parameter sets are filled with defaults in place. Nothing is
    /// written unless every check passes; on success the volume key stays
    /// resident on the handle and no key slot is active.
    pub fn format<P>(&mut self, params: &mut P, generic: &mut GenericParams) -> Result<()>
    where
        P: FormatParams + ?Sized,
    {
        params.fill_default_values();
        generic.fill_default_values();

        let volume_key = VolumeKey::generate(generic.volume_key_size);
        let header = params.create_header(generic, &volume_key, self.storage.size(), &mut self.tuning)?;

        self.storage.write_at(0, &header.region_bytes())?;
        self.storage.sync()?;

        info!(
            "formatted {} as {} ({}, {}, uuid {})",
            self.path().display(),
            header.format_type(),
            header.cipher(),
            header.hash().name(),
            header.uuid()
        );
        self.header = Some(header);
        self.volume_key = Some(volume_key);
        Ok(())
    }

    /// Read and validate the header already on the device.
    ///
    /// A resident volume key is kept only if it matches the loaded header.
    pub fn load<P>(&mut self, params: &mut P) -> Result<()>
    where
        P: FormatParams + ?Sized,
    {
        params.fill_default_values();
        let header = params.read_header(&self.storage)?;

        if let Some(key) = &self.volume_key {
            if header.verify_volume_key(key).is_err() {
                self.volume_key = None;
            }
        }
        info!(
            "loaded {} header from {} (uuid {})",
            header.format_type(),
            self.path().display(),
            header.uuid()
        );
        self.header = Some(header);
        Ok(())
    }

    /// Explicitly release the handle. Dropping it has the same effect.
    pub fn close(self) {
        drop(self);
    }

    pub(crate) fn require_header(&self) -> Result<&dyn VolumeHeader> {
        self.header.as_deref().ok_or_else(|| {
            CryptError::invalid(
                ErrorKind::NoHeader,
                format!(
                    "{} has no loaded header; format or load it first",
                    self.path().display()
                ),
            )
        })
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.storage.path())
            .field("size", &self.storage.size())
            .field("type", &self.type_name())
            .field("volume_key", &self.volume_key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dm::MappingTable;
    use crate::error::ErrorCategory;
    use crate::params::Luks1Params;
    use std::fs;
    use tempfile::TempDir;

    fn options() -> DeviceOptions {
        DeviceOptions::default()
            .with_mapper(Arc::new(MappingTable::new()))
            .with_iteration_time(Duration::from_millis(1))
    }

    fn image(dir: &TempDir, len: usize) -> std::path::PathBuf {
        let path = dir.path().join("disk.img");
        fs::write(&path, vec![0u8; len]).unwrap();
        path
    }

    #[test]
    fn test_init_is_untyped() {
        let temp_dir = TempDir::new().unwrap();
        let device = Device::init_with(image(&temp_dir, 4096), options()).unwrap();
        assert_eq!(device.type_name(), "");
        assert_eq!(device.size(), 4096);
        assert!(device.header().is_none());
        assert_eq!(device.require_header().unwrap_err().kind, Some(ErrorKind::NoHeader));
    }

    #[test]
    fn test_format_fills_params_and_keeps_key() {
        let temp_dir = TempDir::new().unwrap();
        let mut device = Device::init_with(image(&temp_dir, 4 << 20), options()).unwrap();
        let mut params = Luks1Params::default();
        let mut generic = GenericParams::default();

        device.format(&mut params, &mut generic).unwrap();

        assert_eq!(device.type_name(), "LUKS1");
        assert_eq!(params.hash, "sha256");
        assert_eq!(generic.cipher_mode, "xts-plain64");
        assert!(device.has_volume_key());
        assert!(device.uuid().is_some());
    }

    #[test]
    fn test_load_drops_foreign_volume_key() {
        let temp_dir = TempDir::new().unwrap();
        let path = image(&temp_dir, 4 << 20);

        let mut first = Device::init_with(&path, options()).unwrap();
        first
            .format(&mut Luks1Params::default(), &mut GenericParams::default())
            .unwrap();
        first.load(&mut Luks1Params::default()).unwrap();
        assert!(first.has_volume_key());

        // Copy a header with another volume key over the device. The lock is
        // advisory, so a plain write still lands.
        let other_path = temp_dir.path().join("other.img");
        fs::write(&other_path, vec![0u8; 4 << 20]).unwrap();
        let mut other = Device::init_with(&other_path, options()).unwrap();
        other
            .format(&mut Luks1Params::default(), &mut GenericParams::default())
            .unwrap();
        let region = fs::read(&other_path).unwrap();
        fs::write(&path, &region).unwrap();

        first.load(&mut Luks1Params::default()).unwrap();
        assert!(!first.has_volume_key());
        assert_eq!(first.uuid(), other.uuid());
    }

    #[test]
    fn test_second_handle_is_busy() {
        let temp_dir = TempDir::new().unwrap();
        let path = image(&temp_dir, 4 << 20);

        let first = Device::init_with(&path, options()).unwrap();
        let err = Device::init_with(&path, options()).unwrap_err();
        assert_eq!(err.code(), -16);
        assert_eq!(err.category, ErrorCategory::Busy);

        first.close();
        Device::init_with(&path, options()).unwrap();
    }

    #[test]
    fn test_load_of_blank_image_is_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let mut device = Device::init_with(image(&temp_dir, 4 << 20), options()).unwrap();
        let err = device.load(&mut Luks1Params::default()).unwrap_err();
        assert_eq!(err.category, ErrorCategory::Corrupt);
        assert_eq!(err.code(), -22);
        assert_eq!(device.type_name(), "");
    }

    #[test]
    fn test_format_through_trait_object() {
        let temp_dir = TempDir::new().unwrap();
        let mut device = Device::init_with(image(&temp_dir, 4 << 20), options()).unwrap();
        let mut params: Box<dyn FormatParams> = Box::new(Luks1Params::default());
        device
            .format(params.as_mut(), &mut GenericParams::default())
            .unwrap();
        assert_eq!(device.format_type(), Some(FormatType::Luks1));
    }
}
