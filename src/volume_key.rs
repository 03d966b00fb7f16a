use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;
use zeroize::Zeroizing;

/// The symmetric key that encrypts volume data.
///
/// Wiped from memory on drop. `Debug` never prints key bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct VolumeKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl VolumeKey {
    /// Generate a fresh random key of `size` bytes from the OS RNG.
    pub fn generate(size: usize) -> Self {
        let mut bytes = Zeroizing::new(vec![0u8; size]);
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: Zeroizing::new(bytes.to_vec()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Lowercase hex rendering, as the kernel expects it in a dm-crypt table.
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.as_bytes()))
    }
}

impl fmt::Debug for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolumeKey({} bytes)", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_has_requested_size() {
        let key = VolumeKey::generate(32);
        assert_eq!(key.len(), 32);
        assert_ne!(key.as_bytes(), &[0u8; 32][..]);
    }

    #[test]
    fn test_debug_redacts_bytes() {
        let key = VolumeKey::from_bytes(&[0xAB; 16]);
        let rendered = format!("{key:?}");
        assert_eq!(rendered, "VolumeKey(16 bytes)");
        assert!(!rendered.contains("ab"));
    }

    #[test]
    fn test_hex_rendering() {
        let key = VolumeKey::from_bytes(&[0x00, 0x0f, 0xff]);
        assert_eq!(key.to_hex().as_str(), "000fff");
    }
}
