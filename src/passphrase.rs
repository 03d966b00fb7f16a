//! Passphrase sources for the command line.

use crate::error::{CryptError, ErrorCategory, ErrorKind, Errno, Result};
use std::fs::File;
use std::io::{self, IsTerminal, Read, Write};
use std::path::Path;
use zeroize::Zeroizing;

/// Something that can produce a passphrase on request.
pub trait PassphraseReader {
    /// Read a passphrase as arbitrary bytes (not necessarily UTF-8).
    ///
    /// `prompt` is shown by interactive sources and ignored by the rest.
    fn read_passphrase(&mut self, prompt: &str) -> Result<Zeroizing<Vec<u8>>>;
}

/// Returns a fixed passphrase.
pub struct ConstantPassphraseReader {
    passphrase: Zeroizing<Vec<u8>>,
}

impl ConstantPassphraseReader {
    pub fn new(passphrase: Vec<u8>) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase),
        }
    }
}

impl PassphraseReader for ConstantPassphraseReader {
    fn read_passphrase(&mut self, _prompt: &str) -> Result<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new((*self.passphrase).clone()))
    }
}

/// Reads the whole of any `io::Read` source. Trailing newlines are kept, as
/// with key files.
pub struct ReaderPassphraseReader {
    reader: Box<dyn Read>,
}

impl ReaderPassphraseReader {
    pub fn new(reader: Box<dyn Read>) -> Self {
        Self { reader }
    }

    /// Key file at `path`, or stdin for `-`.
    pub fn from_key_file(path: &Path) -> Result<Self> {
        if path == Path::new("-") {
            return Ok(Self::new(Box::new(io::stdin())));
        }
        let file = File::open(path).map_err(|e| {
            CryptError::with_kind_and_source(
                ErrorCategory::Invalid,
                Errno::Invalid,
                ErrorKind::PassphraseUnavailable,
                format!("failed to open key file {}", path.display()),
                e,
            )
        })?;
        Ok(Self::new(Box::new(file)))
    }
}

impl PassphraseReader for ReaderPassphraseReader {
    fn read_passphrase(&mut self, _prompt: &str) -> Result<Zeroizing<Vec<u8>>> {
        let mut data = Zeroizing::new(Vec::new());
        self.reader.read_to_end(&mut data).map_err(|e| {
            CryptError::with_kind_and_source(
                ErrorCategory::Internal,
                Errno::Io,
                ErrorKind::PassphraseUnavailable,
                format!("error reading passphrase: {e}"),
                e,
            )
        })?;
        Ok(data)
    }
}

/// Prompts on the terminal with echo disabled.
#[derive(Debug, Default)]
pub struct TerminalPassphraseReader {
    verify: bool,
}

impl TerminalPassphraseReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask twice and fail unless both entries match.
    pub fn verifying() -> Self {
        Self { verify: true }
    }

    fn prompt_once(prompt: &str) -> Result<Zeroizing<Vec<u8>>> {
        let mut stderr = io::stderr();
        stderr
            .write_all(prompt.as_bytes())
            .and_then(|_| stderr.flush())
            .map_err(|e| {
                CryptError::with_kind_and_source(
                    ErrorCategory::Internal,
                    Errno::Io,
                    ErrorKind::Io,
                    format!("failed to write prompt: {e}"),
                    e,
                )
            })?;

        // rpassword hands back a plain String; move it straight into a zeroizing buffer.
        let passphrase = rpassword::read_password().map_err(|e| {
            CryptError::with_kind_and_source(
                ErrorCategory::Internal,
                Errno::Io,
                ErrorKind::PassphraseUnavailable,
                format!("failure reading passphrase: {e}"),
                e,
            )
        })?;
        Ok(Zeroizing::new(passphrase.into_bytes()))
    }
}

impl PassphraseReader for TerminalPassphraseReader {
    /// Terminal input is limited to UTF-8; use a key file for anything else.
    fn read_passphrase(&mut self, prompt: &str) -> Result<Zeroizing<Vec<u8>>> {
        if !io::stdin().is_terminal() {
            return Err(CryptError::with_kind(
                ErrorCategory::Invalid,
                Errno::Invalid,
                ErrorKind::PassphraseUnavailable,
                "cannot read passphrase from terminal - stdin is not a terminal; use --key-file",
            ));
        }

        let passphrase = Self::prompt_once(prompt)?;
        if self.verify {
            let again = Self::prompt_once("Verify passphrase: ")?;
            if *again != *passphrase {
                return Err(CryptError::invalid(
                    ErrorKind::PassphraseMismatch,
                    "passphrases do not match",
                ));
            }
        }
        Ok(passphrase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_constant_reader() {
        let mut reader = ConstantPassphraseReader::new(b"test123".to_vec());
        assert_eq!(&*reader.read_passphrase("ignored").unwrap(), b"test123");
        assert_eq!(&*reader.read_passphrase("ignored").unwrap(), b"test123");
    }

    /// Needs a human at the terminal:
    ///
    /// cargo test test_terminal_reader_interactive -- --ignored --nocapture
    #[test]
    #[ignore]
    fn test_terminal_reader_interactive() {
        let mut reader = TerminalPassphraseReader::verifying();
        let passphrase = reader.read_passphrase("Enter a test passphrase: ").unwrap();
        assert!(!passphrase.is_empty(), "Expected non-empty passphrase");
    }

    #[test]
    fn test_reader_passphrase_reader() {
        let data = b"mypassword";
        let mut reader = ReaderPassphraseReader::new(Box::new(&data[..]));
        assert_eq!(&*reader.read_passphrase("").unwrap(), b"mypassword");
    }

    #[test]
    fn test_reader_keeps_newline_and_binary() {
        let data: &[u8] = &[0xff, 0xfe, 0x00, b'\n'];
        let mut reader = ReaderPassphraseReader::new(Box::new(data));
        assert_eq!(&*reader.read_passphrase("").unwrap(), data);
    }

    #[test]
    fn test_key_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("key");
        fs::write(&path, b"from file").unwrap();

        let mut reader = ReaderPassphraseReader::from_key_file(&path).unwrap();
        assert_eq!(&*reader.read_passphrase("").unwrap(), b"from file");
    }

    #[test]
    fn test_missing_key_file() {
        let temp_dir = TempDir::new().unwrap();
        let err = ReaderPassphraseReader::from_key_file(&temp_dir.path().join("nope"))
            .err()
            .unwrap();
        assert_eq!(err.kind, Some(ErrorKind::PassphraseUnavailable));
    }
}
