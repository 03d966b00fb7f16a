//! Anti-forensic information splitter.
//!
//! Expands a key into `stripes` blocks so that destroying any single block
//! on disk makes the key unrecoverable. Layout and diffusion follow the
//! LUKS1 on-disk format so headers interoperate with the kernel tooling.

use crate::error::{CryptError, ErrorKind, Result};
use crate::kdf::HashAlgorithm;
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

/// Stripe count mandated by LUKS1.
pub const LUKS_STRIPES: usize = 4000;

/// Size in bytes of the split material for a `key_len`-byte key.
pub fn split_size(key_len: usize, stripes: usize) -> usize {
    key_len * stripes
}

/// Split `key` into `stripes` blocks of `key.len()` bytes.
pub fn split(key: &[u8], stripes: usize, hash: HashAlgorithm) -> Result<Zeroizing<Vec<u8>>> {
    if stripes == 0 {
        return Err(CryptError::invalid(
            ErrorKind::InternalInvariant,
            "anti-forensic split needs at least one stripe",
        ));
    }
    let block = key.len();
    let mut out = Zeroizing::new(vec![0u8; split_size(block, stripes)]);
    let mut buf = Zeroizing::new(vec![0u8; block]);

    OsRng.fill_bytes(&mut out[..block * (stripes - 1)]);
    for stripe in out[..block * (stripes - 1)].chunks(block) {
        xor_into(&mut buf, stripe);
        diffuse(&mut buf, hash);
    }

    let last = &mut out[block * (stripes - 1)..];
    for ((dst, a), b) in last.iter_mut().zip(buf.iter()).zip(key.iter()) {
        *dst = a ^ b;
    }
    Ok(out)
}

/// Recover a `key_len`-byte key from split `material`.
pub fn merge(
    material: &[u8],
    key_len: usize,
    stripes: usize,
    hash: HashAlgorithm,
) -> Result<Zeroizing<Vec<u8>>> {
    if stripes == 0 || material.len() < split_size(key_len, stripes) {
        return Err(CryptError::corrupt(format!(
            "key material of {} bytes is too short for {stripes} stripes of {key_len} bytes",
            material.len()
        )));
    }
    let mut buf = Zeroizing::new(vec![0u8; key_len]);

    for stripe in material[..key_len * (stripes - 1)].chunks(key_len) {
        xor_into(&mut buf, stripe);
        diffuse(&mut buf, hash);
    }

    let last = &material[key_len * (stripes - 1)..key_len * stripes];
    let mut key = Zeroizing::new(vec![0u8; key_len]);
    for ((dst, a), b) in key.iter_mut().zip(buf.iter()).zip(last.iter()) {
        *dst = a ^ b;
    }
    Ok(key)
}

fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Hash each digest-sized block of `buf` with its big-endian index as prefix.
/// A trailing partial block takes the leading bytes of its digest.
fn diffuse(buf: &mut [u8], hash: HashAlgorithm) {
    let digest_size = hash.digest_size();
    for (index, block) in buf.chunks_mut(digest_size).enumerate() {
        let iv = (index as u32).to_be_bytes();
        let digest = Zeroizing::new(hash.digest(&[&iv, block]));
        let len = block.len();
        block.copy_from_slice(&digest[..len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_then_merge_recovers_key() {
        let key: Vec<u8> = (0..32).collect();
        let material = split(&key, LUKS_STRIPES, HashAlgorithm::Sha256).unwrap();
        assert_eq!(material.len(), 32 * LUKS_STRIPES);

        let merged = merge(&material, 32, LUKS_STRIPES, HashAlgorithm::Sha256).unwrap();
        assert_eq!(&merged[..], &key[..]);
    }

    #[test]
    fn test_partial_digest_block() {
        // 48-byte key with sha256 leaves a 16-byte tail block in diffusion.
        let key = vec![0xC3u8; 48];
        let material = split(&key, 16, HashAlgorithm::Sha256).unwrap();
        let merged = merge(&material, 48, 16, HashAlgorithm::Sha256).unwrap();
        assert_eq!(&merged[..], &key[..]);
    }

    #[test]
    fn test_damaged_stripe_destroys_key() {
        let key = vec![0x42u8; 32];
        let mut material = split(&key, 64, HashAlgorithm::Sha512).unwrap();
        material[5] ^= 0x01;

        let merged = merge(&material, 32, 64, HashAlgorithm::Sha512).unwrap();
        assert_ne!(&merged[..], &key[..]);
    }

    #[test]
    fn test_merge_rejects_short_material() {
        let err = merge(&[0u8; 10], 32, 2, HashAlgorithm::Sha256).unwrap_err();
        assert_eq!(err.code(), -22);
    }
}
