//! Header backup and restore.
//!
//! A backup is a byte copy of the whole header region, key material
//! included, so it unlocks with the passphrases valid when it was taken.

use crate::device::Device;
use crate::error::{CryptError, ErrorCategory, ErrorKind, Errno, Result};
use crate::params::FormatParams;
use crate::storage::Storage;
use log::info;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

impl Device {
    /// Copy the header region to a new file at `path` with mode 0600.
    ///
    /// The file appears atomically and is never overwritten.
    pub fn header_backup(&self, path: &Path) -> Result<()> {
        let header = self.require_header()?;
        let mut region = Zeroizing::new(vec![0u8; header.header_size() as usize]);
        self.storage.read_at(0, &mut region)?;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut temp_file = NamedTempFile::new_in(dir)
            .map_err(|e| CryptError::io(format!("failed to create a temporary file in {}", dir.display()), e))?;
        temp_file
            .write_all(&region)
            .map_err(|e| CryptError::io("failed to write header backup", e))?;
        // Flush and fsync so the rename below always exposes a complete file.
        temp_file
            .flush()
            .map_err(|e| CryptError::io("failed to flush header backup", e))?;
        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| CryptError::io("failed to sync header backup", e))?;

        let mut perms = temp_file
            .as_file()
            .metadata()
            .map_err(|e| CryptError::io("failed to stat header backup", e))?
            .permissions();
        perms.set_mode(0o600);
        temp_file
            .as_file()
            .set_permissions(perms)
            .map_err(|e| CryptError::io("failed to restrict header backup permissions", e))?;

        temp_file.persist_noclobber(path).map_err(|e| {
            if e.error.kind() == io::ErrorKind::AlreadyExists {
                CryptError::with_kind_and_source(
                    ErrorCategory::Invalid,
                    Errno::Exists,
                    ErrorKind::Io,
                    format!("requested header backup file {} already exists", path.display()),
                    e.error,
                )
            } else {
                CryptError::io(format!("failed to create {}", path.display()), e.error)
            }
        })?;

        info!(
            "backed up {} header of {} to {}",
            header.format_type(),
            self.path().display(),
            path.display()
        );
        Ok(())
    }

    /// Overwrite the device's header region with the backup at `path`.
    ///
    /// The backup must hold a valid header of the `params` format whose
    /// region exactly fills the file and fits on the device.
    pub fn header_restore<P>(&mut self, params: &mut P, path: &Path) -> Result<()>
    where
        P: FormatParams + ?Sized,
    {
        params.fill_default_values();
        let backup = Storage::open_read_only(path)?;
        let header = params.read_header(&backup).map_err(|e| {
            let msg = format!("{} is not a valid header backup: {}", path.display(), e.message());
            e.with_context(msg)
        })?;

        if backup.size() != header.header_size() {
            return Err(CryptError::corrupt(format!(
                "backup file {} is {} bytes but its header region is {} bytes",
                path.display(),
                backup.size(),
                header.header_size()
            )));
        }
        if header.header_size() > self.storage.size() {
            return Err(CryptError::invalid(
                ErrorKind::DeviceTooSmall,
                format!(
                    "header backup needs {} bytes but {} has {}",
                    header.header_size(),
                    self.path().display(),
                    self.storage.size()
                ),
            ));
        }

        let mut region = Zeroizing::new(vec![0u8; header.header_size() as usize]);
        backup.read_at(0, &mut region)?;
        self.storage.write_at(0, &region)?;
        self.storage.sync()?;

        if let Some(key) = &self.volume_key {
            if header.verify_volume_key(key).is_err() {
                self.volume_key = None;
            }
        }
        info!(
            "restored {} header {} to {} from {}",
            header.format_type(),
            header.uuid(),
            self.path().display(),
            path.display()
        );
        self.header = Some(header);
        Ok(())
    }
}
