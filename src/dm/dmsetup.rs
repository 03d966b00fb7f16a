use super::command::{HelperCommand, classify_failure};
use super::{DeviceMapper, MappingRequest, MappingState};
use crate::activate::ActivateFlags;
use crate::config::Config;
use crate::error::{CryptError, ErrorKind, Result};
use log::{debug, warn};
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Kernel device-mapper through the `dmsetup` binary.
///
/// Image files are attached to a loop device first. The loop device is
/// detached right after the mapping is created, which the kernel defers
/// until the mapping releases it.
#[derive(Debug, Clone)]
pub struct DmsetupBackend {
    dmsetup_path: Option<String>,
    losetup_path: Option<String>,
    timeout: Duration,
}

impl DmsetupBackend {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dmsetup_path: config.device_mapper.dmsetup_path.clone(),
            losetup_path: config.device_mapper.losetup_path.clone(),
            timeout: config.device_mapper.timeout(),
        }
    }

    fn dmsetup(&self) -> Result<HelperCommand> {
        HelperCommand::resolve("dmsetup", self.dmsetup_path.as_deref(), self.timeout)
    }

    fn losetup(&self) -> Result<HelperCommand> {
        HelperCommand::resolve("losetup", self.losetup_path.as_deref(), self.timeout)
    }

    fn attach_loop(&self, image: &Path, read_only: bool) -> Result<PathBuf> {
        let losetup = self.losetup()?;
        let image_arg = image.to_string_lossy();
        let mut args = vec!["--find", "--show"];
        if read_only {
            args.push("--read-only");
        }
        args.push(image_arg.as_ref());

        let out = losetup.run(&args, None)?;
        if !out.success() {
            return Err(classify_failure(
                &format!("losetup could not attach {}", image.display()),
                &out,
            ));
        }
        let loop_dev = out.stdout.trim();
        if loop_dev.is_empty() {
            return Err(CryptError::invalid(
                ErrorKind::ExternalCommand,
                format!("losetup attached {} but printed no device", image.display()),
            ));
        }
        debug!("attached {} to {loop_dev}", image.display());
        Ok(PathBuf::from(loop_dev))
    }

    fn detach_loop(&self, loop_dev: &Path) {
        let detached = self.losetup().and_then(|losetup| {
            let arg = loop_dev.to_string_lossy();
            let out = losetup.run(&["-d", arg.as_ref()], None)?;
            if out.success() {
                Ok(())
            } else {
                Err(classify_failure(&format!("losetup -d {arg}"), &out))
            }
        });
        if let Err(err) = detached {
            warn!(
                "failed to detach {}; it will stay attached after the mapping is removed: {err}",
                loop_dev.display()
            );
        }
    }
}

impl Default for DmsetupBackend {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl DeviceMapper for DmsetupBackend {
    fn create(&self, request: &MappingRequest<'_>) -> Result<()> {
        let dmsetup = self.dmsetup()?;
        let read_only = request.flags.contains(ActivateFlags::READONLY);

        let metadata = fs::metadata(request.device).map_err(|e| {
            CryptError::io(format!("cannot stat {}", request.device.display()), e)
        })?;
        let loop_dev = if metadata.file_type().is_block_device() {
            None
        } else {
            Some(self.attach_loop(request.device, read_only)?)
        };
        let source = loop_dev.as_deref().unwrap_or(request.device);

        let mut args = vec!["create", request.name];
        if read_only {
            args.push("--readonly");
        }
        if let Some(uuid) = request.uuid.as_deref() {
            args.push("--uuid");
            args.push(uuid);
        }

        let table = request.table(source);
        debug!(
            "{} create {} over {} ({} sectors at offset {})",
            dmsetup.binary().display(),
            request.name,
            source.display(),
            request.size,
            request.offset
        );
        let result = dmsetup.run(&args, Some(table.as_bytes()));

        if let Some(loop_dev) = &loop_dev {
            self.detach_loop(loop_dev);
        }

        let out = result?;
        if out.success() {
            Ok(())
        } else {
            Err(classify_failure(
                &format!("dmsetup could not create mapping `{}`", request.name),
                &out,
            ))
        }
    }

    fn remove(&self, name: &str) -> Result<()> {
        let out = self.dmsetup()?.run(&["remove", name], None)?;
        if out.success() {
            return Ok(());
        }
        let err = classify_failure(&format!("dmsetup could not remove mapping `{name}`"), &out);
        if err.kind == Some(ErrorKind::MappingNotFound) {
            return Err(super::mapping_not_found(name));
        }
        Err(err)
    }

    fn status(&self, name: &str) -> Result<MappingState> {
        let out = self
            .dmsetup()?
            .run(&["info", "-c", "--noheadings", "-o", "open", name], None)?;
        if out.success() {
            return parse_open_count(name, &out.stdout);
        }

        let err = classify_failure(&format!("dmsetup info {name}"), &out);
        if err.kind == Some(ErrorKind::MappingNotFound) {
            Ok(MappingState::Inactive)
        } else {
            Err(err)
        }
    }
}

fn parse_open_count(name: &str, stdout: &str) -> Result<MappingState> {
    let count: u32 = stdout.trim().parse().map_err(|_| {
        CryptError::invalid(
            ErrorKind::ExternalCommand,
            format!("unexpected dmsetup info output for {name}: `{}`", stdout.trim()),
        )
    })?;
    Ok(if count > 0 {
        MappingState::Busy
    } else {
        MappingState::Active
    })
}
