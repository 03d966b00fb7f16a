//! Format parameters and their default-value policy.
//!
//! Every parameter struct follows the same contract: a zero value is a valid
//! request for "use the defaults", and [`FillDefaultValues::fill_default_values`]
//! replaces only the fields the caller left empty.

use crate::error::{CryptError, ErrorKind, Result};
use crate::header::VolumeHeader;
use crate::kdf::KdfTuning;
use crate::luks1::{self, Luks1Header};
use crate::storage::Storage;
use crate::volume_key::VolumeKey;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_CIPHER: &str = "aes";
pub const DEFAULT_CIPHER_MODE: &str = "xts-plain64";
pub const DEFAULT_VOLUME_KEY_SIZE: usize = 256 / 8;
pub const DEFAULT_LUKS1_HASH: &str = "sha256";
/// One MiB in 512-byte sectors.
pub const DEFAULT_LUKS1_ALIGNMENT: u64 = 2048;

/// In-place normalization of zero/empty fields to format-defined defaults.
pub trait FillDefaultValues {
    /// Replace zero/empty fields with defaults. Never touches fields the
    /// caller has already set, and calling it twice is the same as once.
    fn fill_default_values(&mut self);
}

/// On-disk header layouts known to this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatType {
    Luks1,
}

impl FormatType {
    /// The format tag reported by [`crate::Device::type_name`].
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Luks1 => "LUKS1",
        }
    }
}

impl fmt::Display for FormatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormatType {
    type Err = CryptError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "luks1" | "luks" => Ok(Self::Luks1),
            other => Err(CryptError::invalid(
                ErrorKind::UnsupportedAlgorithm,
                format!("unknown volume format `{other}`"),
            )),
        }
    }
}

/// Capability every format-specific parameter struct provides to the
/// format engine.
pub trait FormatParams: FillDefaultValues + fmt::Debug {
    fn format_type(&self) -> FormatType;

    /// Number of key slots a header of this format provides.
    fn keyslot_max(&self) -> usize;

    /// Fail unless `index` names a slot this format provides.
    fn check_keyslot(&self, index: usize) -> Result<()> {
        if index < self.keyslot_max() {
            return Ok(());
        }
        Err(CryptError::invalid(
            ErrorKind::SlotOutOfRange,
            format!(
                "key slot {index} is invalid, {} has slots 0-{}",
                self.format_type(),
                self.keyslot_max() - 1
            ),
        ))
    }

    /// Build a fresh header for `volume_key` on a device of `device_size`
    /// bytes. Nothing is written to the device.
    fn create_header(
        &self,
        generic: &GenericParams,
        volume_key: &VolumeKey,
        device_size: u64,
        tuning: &mut KdfTuning,
    ) -> Result<Box<dyn VolumeHeader>>;

    /// Read and validate an existing header of this format from `storage`.
    fn read_header(&self, storage: &Storage) -> Result<Box<dyn VolumeHeader>>;
}

/// Parameters shared by every format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenericParams {
    /// Cipher algorithm name, e.g. `aes`.
    pub cipher: String,
    /// Block mode and IV generator, e.g. `xts-plain64`.
    pub cipher_mode: String,
    /// Volume key size in bytes.
    pub volume_key_size: usize,
}

impl FillDefaultValues for GenericParams {
    fn fill_default_values(&mut self) {
        if self.cipher.is_empty() {
            self.cipher = DEFAULT_CIPHER.to_string();
        }

        if self.cipher_mode.is_empty() {
            self.cipher_mode = DEFAULT_CIPHER_MODE.to_string();
        }

        if self.volume_key_size == 0 {
            self.volume_key_size = DEFAULT_VOLUME_KEY_SIZE;
        }
    }
}

/// LUKS1-specific parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Luks1Params {
    /// Hash used for PBKDF2, the volume key digest and the AF splitter.
    pub hash: String,
    /// Payload alignment in 512-byte sectors.
    pub data_alignment: u64,
}

impl FillDefaultValues for Luks1Params {
    fn fill_default_values(&mut self) {
        if self.hash.is_empty() {
            self.hash = DEFAULT_LUKS1_HASH.to_string();
        }

        if self.data_alignment == 0 {
            self.data_alignment = DEFAULT_LUKS1_ALIGNMENT;
        }
    }
}

impl FormatParams for Luks1Params {
    fn format_type(&self) -> FormatType {
        FormatType::Luks1
    }

    fn keyslot_max(&self) -> usize {
        luks1::LUKS_NUMKEYS
    }

    fn create_header(
        &self,
        generic: &GenericParams,
        volume_key: &VolumeKey,
        device_size: u64,
        tuning: &mut KdfTuning,
    ) -> Result<Box<dyn VolumeHeader>> {
        let header = Luks1Header::create(self, generic, volume_key, device_size, tuning)?;
        Ok(Box::new(header))
    }

    fn read_header(&self, storage: &Storage) -> Result<Box<dyn VolumeHeader>> {
        // The hash declared by the header wins; `self.hash` only matters when
        // creating a header.
        let header = luks1::read_from(storage)?;
        Ok(Box::new(header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_params_fill_all_fields() {
        let mut params = GenericParams::default();

        params.fill_default_values();

        assert_eq!(params.cipher, "aes");
        assert_eq!(params.cipher_mode, "xts-plain64");
        assert_eq!(params.volume_key_size, 256 / 8);
    }

    #[test]
    fn test_generic_params_fill_no_fields() {
        let mut params = GenericParams {
            cipher: "twofish".to_string(),
            cipher_mode: "ecb".to_string(),
            volume_key_size: 16,
        };

        params.fill_default_values();

        assert_eq!(params.cipher, "twofish");
        assert_eq!(params.cipher_mode, "ecb");
        assert_eq!(params.volume_key_size, 16);
    }

    #[test]
    fn test_generic_params_fill_is_idempotent() {
        let mut once = GenericParams {
            cipher_mode: "ecb".to_string(),
            ..GenericParams::default()
        };
        once.fill_default_values();
        let mut twice = once.clone();
        twice.fill_default_values();

        assert_eq!(once, twice);
        assert_eq!(twice.cipher, "aes");
        assert_eq!(twice.cipher_mode, "ecb");
    }

    #[test]
    fn test_luks1_keyslot_range() {
        let params = Luks1Params::default();
        assert_eq!(params.keyslot_max(), 8);
        params.check_keyslot(0).unwrap();
        params.check_keyslot(7).unwrap();

        let err = params.check_keyslot(8).unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::SlotOutOfRange));
        assert_eq!(err.code(), -22);
    }

    #[test]
    fn test_luks1_params_fill_all_fields() {
        let mut params = Luks1Params::default();

        params.fill_default_values();

        assert_eq!(params.hash, "sha256");
        assert_eq!(params.data_alignment, 2048);
    }

    #[test]
    fn test_luks1_params_fill_no_fields() {
        let mut params = Luks1Params {
            hash: "sha1".to_string(),
            data_alignment: 8,
        };

        params.fill_default_values();

        assert_eq!(params.hash, "sha1");
        assert_eq!(params.data_alignment, 8);
    }

    #[test]
    fn test_format_type_tag() {
        assert_eq!(FormatType::Luks1.as_str(), "LUKS1");
        assert_eq!("luks1".parse::<FormatType>().unwrap(), FormatType::Luks1);
        assert_eq!("LUKS".parse::<FormatType>().unwrap(), FormatType::Luks1);
        assert_eq!("luks3".parse::<FormatType>().unwrap_err().code(), -22);
    }
}
