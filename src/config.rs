//! Configuration model and loading.

use crate::error::{CryptError, ErrorCategory, ErrorKind, Errno, Result};
use crate::kdf::DEFAULT_ITERATION_TIME;
use log::debug;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/cryptdev.toml";
pub const CONFIG_PATH_ENV: &str = "CRYPTDEV_CONFIG";

/// Key derivation knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KdfCfg {
    /// Target PBKDF2 time per key slot. Zero means the minimum iteration count.
    #[serde(default = "default_iteration_time_ms")]
    pub iteration_time_ms: u64,
}

fn default_iteration_time_ms() -> u64 {
    DEFAULT_ITERATION_TIME.as_millis() as u64
}

impl KdfCfg {
    pub fn iteration_time(&self) -> Duration {
        Duration::from_millis(self.iteration_time_ms)
    }
}

impl Default for KdfCfg {
    fn default() -> Self {
        Self {
            iteration_time_ms: default_iteration_time_ms(),
        }
    }
}

/// Where to find the device-mapper helpers and how long to wait for them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceMapperCfg {
    #[serde(default)]
    pub dmsetup_path: Option<String>,

    #[serde(default)]
    pub losetup_path: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

impl DeviceMapperCfg {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DeviceMapperCfg {
    fn default() -> Self {
        Self {
            dmsetup_path: None,
            losetup_path: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub kdf: KdfCfg,

    #[serde(default)]
    pub device_mapper: DeviceMapperCfg,
}

impl Config {
    /// Path from `CRYPTDEV_CONFIG`, falling back to [`DEFAULT_CONFIG_PATH`].
    pub fn default_path() -> PathBuf {
        env::var_os(CONFIG_PATH_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Read and validate a TOML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            CryptError::with_kind_and_source(
                ErrorCategory::Invalid,
                Errno::Invalid,
                ErrorKind::Config,
                format!("failed to read config {}", path.display()),
                e,
            )
        })?;
        let cfg = Self::from_toml(&contents)
            .map_err(|e| {
                let msg = format!("invalid config {}: {}", path.display(), e.message());
                e.with_context(msg)
            })?;
        debug!("loaded config from {}", path.display());
        Ok(cfg)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match fs::metadata(path) {
            Ok(_) => Self::load(path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("no config at {}; using defaults", path.display());
                Ok(Self::default())
            }
            Err(err) => Err(CryptError::with_kind_and_source(
                ErrorCategory::Invalid,
                Errno::Invalid,
                ErrorKind::Config,
                format!("cannot access config {}", path.display()),
                err,
            )),
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(contents).map_err(|e| {
            CryptError::with_kind_and_source(
                ErrorCategory::Invalid,
                Errno::Invalid,
                ErrorKind::Config,
                e.message().to_string(),
                e,
            )
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.device_mapper.timeout_secs == 0 {
            return Err(CryptError::invalid(
                ErrorKind::Config,
                "device_mapper.timeout_secs must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.kdf.iteration_time(), Duration::from_millis(2000));
        assert_eq!(cfg.device_mapper.timeout(), Duration::from_secs(10));
        assert!(cfg.device_mapper.dmsetup_path.is_none());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let cfg = Config::from_toml("[kdf]\niteration_time_ms = 50\n").unwrap();
        assert_eq!(cfg.kdf.iteration_time_ms, 50);
        assert_eq!(cfg.device_mapper, DeviceMapperCfg::default());
    }

    #[test]
    fn test_full_file() {
        let cfg = Config::from_toml(
            r#"
[kdf]
iteration_time_ms = 0

[device_mapper]
dmsetup_path = "/opt/dm/dmsetup"
losetup_path = "/opt/dm/losetup"
timeout_secs = 30
"#,
        )
        .unwrap();
        assert_eq!(cfg.kdf.iteration_time(), Duration::ZERO);
        assert_eq!(cfg.device_mapper.dmsetup_path.as_deref(), Some("/opt/dm/dmsetup"));
        assert_eq!(cfg.device_mapper.timeout_secs, 30);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = Config::from_toml("[kdf]\niteration_time = 5\n").unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::Config));
        assert_eq!(err.code(), -22);

        assert!(Config::from_toml("[logging]\nlevel = \"debug\"\n").is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = Config::from_toml("[device_mapper]\ntimeout_secs = 0\n").unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::Config));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let cfg = Config::load_or_default(temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn test_load_reads_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cryptdev.toml");
        fs::write(&path, "[device_mapper]\ntimeout_secs = 5\n").unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.device_mapper.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_reports_path_on_parse_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cryptdev.toml");
        fs::write(&path, "[kdf\n").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(err.message().contains("cryptdev.toml"));
        assert_eq!(err.kind, Some(ErrorKind::Config));
    }
}
