use std::error::Error as StdError;
use std::fmt;
use std::io;

use thiserror::Error;

/// Broad failure class. Callers that need to branch should prefer
/// [`CryptError::code`], which is stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    /// The device path is unusable, or a mapping name has no active entry.
    NotFound,

    /// The caller asked for something impossible: occupied slot, wrong
    /// passphrase, unknown algorithm, undersized device.
    Invalid,

    /// The device or mapping name is held by someone else.
    Busy,

    /// The on-disk header failed validation.
    Corrupt,

    /// Any failure that cannot be confidently attributed to another
    /// category, including I/O errors from the underlying device.
    Internal,
}

/// Fine-grained condition flags for consumers that want to branch on error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The storage path does not exist or cannot be used as a device.
    DeviceNotFound,
    /// The device is smaller than the header region of the requested format.
    DeviceTooSmall,
    /// The device is already opened exclusively by another handle or process.
    DeviceBusy,
    /// No mapping with the requested name is active.
    MappingNotFound,
    /// A mapping with the requested name already exists.
    MappingExists,
    /// The mapping is held open and cannot be removed.
    MappingBusy,
    /// A cipher, mode, key size or hash is not known to the registry.
    UnsupportedAlgorithm,
    /// The requested key slot already holds a passphrase.
    SlotOccupied,
    /// The requested key slot holds no passphrase.
    SlotInactive,
    /// The requested key slot index is outside the format's slot table.
    SlotOutOfRange,
    /// Every key slot is occupied.
    NoFreeSlot,
    /// The passphrase did not unlock any eligible key slot.
    PassphraseMismatch,
    /// A supplied volume key does not match the header digest.
    VolumeKeyMismatch,
    /// An operation needs a header, but neither format nor load has succeeded.
    NoHeader,
    /// An operation needs the volume key resident on the handle.
    NoVolumeKey,
    /// The header magic, version or layout is invalid.
    HeaderInvalid,
    /// Passphrase could not be obtained from the configured reader.
    PassphraseUnavailable,
    /// An external helper (`dmsetup`, `losetup`) could not be run or failed.
    ExternalCommand,
    /// The caller lacks the privileges for the requested operation.
    PermissionDenied,
    /// Configuration could not be read or parsed.
    Config,
    /// Unexpected state reached within cryptdev logic.
    InternalInvariant,
    /// Interaction with the device, filesystem or stdin failed.
    Io,
}

/// POSIX error numbers surfaced to callers as negative codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Errno {
    /// EPERM
    NotPermitted,
    /// EIO
    Io,
    /// EACCES
    AccessDenied,
    /// ENOTBLK
    NotBlockDevice,
    /// EBUSY
    Busy,
    /// EEXIST
    Exists,
    /// ENODEV
    NoDevice,
    /// EINVAL
    Invalid,
    /// ETIMEDOUT
    TimedOut,
}

impl Errno {
    pub fn value(self) -> i32 {
        match self {
            Errno::NotPermitted => 1,
            Errno::Io => 5,
            Errno::AccessDenied => 13,
            Errno::NotBlockDevice => 15,
            Errno::Busy => 16,
            Errno::Exists => 17,
            Errno::NoDevice => 19,
            Errno::Invalid => 22,
            Errno::TimedOut => 110,
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Errno::NotPermitted => "EPERM",
            Errno::Io => "EIO",
            Errno::AccessDenied => "EACCES",
            Errno::NotBlockDevice => "ENOTBLK",
            Errno::Busy => "EBUSY",
            Errno::Exists => "EEXIST",
            Errno::NoDevice => "ENODEV",
            Errno::Invalid => "EINVAL",
            Errno::TimedOut => "ETIMEDOUT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("{msg}")]
pub struct CryptError {
    /// Broad error category, always provided.
    pub category: ErrorCategory,
    /// Optional specific condition tag for consumers that need to
    /// branch their behavior. Any code consuming errors MUST handle
    /// the absence of a defined kind.
    pub kind: Option<ErrorKind>,
    errno: Errno,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    msg: String,
}

impl CryptError {
    /// Creates a new error with a required category, errno and display message.
    pub fn new(category: ErrorCategory, errno: Errno, msg: impl Into<String>) -> Self {
        Self {
            category,
            kind: None,
            errno,
            source: None,
            msg: msg.into(),
        }
    }

    /// Creates a new error that also tags the failure with a kind.
    pub fn with_kind(
        category: ErrorCategory,
        errno: Errno,
        kind: ErrorKind,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            category,
            kind: Some(kind),
            errno,
            source: None,
            msg: msg.into(),
        }
    }

    /// Creates a new error that carries both a kind tag and the originating source error.
    pub fn with_kind_and_source(
        category: ErrorCategory,
        errno: Errno,
        kind: ErrorKind,
        msg: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            category,
            kind: Some(kind),
            errno,
            source: Some(Box::new(source)),
            msg: msg.into(),
        }
    }

    /// `Invalid` / `EINVAL` shorthand, the most common failure in this crate.
    pub fn invalid(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorCategory::Invalid, Errno::Invalid, kind, msg)
    }

    /// `Corrupt` / `EINVAL` shorthand for header validation failures.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::with_kind(
            ErrorCategory::Corrupt,
            Errno::Invalid,
            ErrorKind::HeaderInvalid,
            msg,
        )
    }

    /// Wraps an I/O error, mapping the OS error class onto the crate taxonomy.
    pub fn io(msg: impl Into<String>, err: io::Error) -> Self {
        let (category, errno, kind) = match err.kind() {
            io::ErrorKind::NotFound => (
                ErrorCategory::NotFound,
                Errno::NotBlockDevice,
                ErrorKind::DeviceNotFound,
            ),
            io::ErrorKind::PermissionDenied => (
                ErrorCategory::Invalid,
                Errno::AccessDenied,
                ErrorKind::PermissionDenied,
            ),
            io::ErrorKind::ResourceBusy => (ErrorCategory::Busy, Errno::Busy, ErrorKind::Io),
            _ => (ErrorCategory::Internal, Errno::Io, ErrorKind::Io),
        };
        Self::with_kind_and_source(category, errno, kind, msg, err)
    }

    /// The negative errno carried by this error, e.g. `-22` for `EINVAL`.
    pub fn code(&self) -> i32 {
        -self.errno.value()
    }

    pub fn errno(&self) -> Errno {
        self.errno
    }

    /// The user-facing message carried by the error.
    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Returns the preserved source error if present.
    pub fn source_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// Wraps the current error with a higher-level message while preserving
    /// the original as source. Category, kind and code are carried over.
    pub fn with_context(self, msg: impl Into<String>) -> Self {
        let category = self.category;
        let kind = self.kind;
        let errno = self.errno;
        Self {
            category,
            kind,
            errno,
            source: Some(Box::new(self)),
            msg: msg.into(),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, CryptError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_is_negative_errno() {
        let err = CryptError::invalid(ErrorKind::SlotOccupied, "slot 0 is in use");
        assert_eq!(err.code(), -22);
        assert_eq!(err.category, ErrorCategory::Invalid);
        assert_eq!(err.kind, Some(ErrorKind::SlotOccupied));
    }

    #[test]
    fn test_context_preserves_code_and_kind() {
        let err = CryptError::with_kind(
            ErrorCategory::NotFound,
            Errno::NoDevice,
            ErrorKind::MappingNotFound,
            "no mapping",
        )
        .with_context("deactivate failed");

        assert_eq!(err.code(), -19);
        assert_eq!(err.kind, Some(ErrorKind::MappingNotFound));
        assert_eq!(err.message(), "deactivate failed");
        assert_eq!(err.source_error().unwrap().to_string(), "no mapping");
    }

    #[test]
    fn test_io_not_found_maps_to_enotblk() {
        let err = CryptError::io(
            "open failed",
            io::Error::new(io::ErrorKind::NotFound, "missing"),
        );
        assert_eq!(err.code(), -15);
        assert_eq!(err.category, ErrorCategory::NotFound);
    }

    #[test]
    fn test_io_permission_maps_to_eacces() {
        let err = CryptError::io(
            "open failed",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.code(), -13);
        assert_eq!(err.kind, Some(ErrorKind::PermissionDenied));
    }
}
