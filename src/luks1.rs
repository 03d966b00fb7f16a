//! LUKS1 on-disk header.
//!
//! A 592-byte big-endian header at sector 0, followed by eight key material
//! areas aligned to 4 KiB, followed by the payload. Each active key slot
//! stores the volume key AF-split into 4000 stripes and encrypted with a key
//! derived from its passphrase.

use crate::afsplit::{self, LUKS_STRIPES};
use crate::cipher::{CipherSpec, SECTOR_SIZE};
use crate::error::{CryptError, ErrorKind, Result};
use crate::header::{KeySlotInfo, KeySlotStatus, VolumeHeader};
use crate::kdf::{HashAlgorithm, KdfTuning};
use crate::params::{FormatType, GenericParams, Luks1Params};
use crate::storage::Storage;
use crate::volume_key::VolumeKey;
use log::debug;
use rand::RngCore;
use rand::rngs::OsRng;
use uuid::Uuid;
use zeroize::Zeroizing;

pub const LUKS_MAGIC: [u8; 6] = [b'L', b'U', b'K', b'S', 0xba, 0xbe];
pub const LUKS1_HEADER_SIZE: usize = 592;
pub const LUKS_NUMKEYS: usize = 8;

const LUKS_VERSION: u16 = 1;
const LUKS_DIGEST_SIZE: usize = 20;
const LUKS_SALT_SIZE: usize = 32;
const KEY_ENABLED: u32 = 0x00AC_71F3;
const KEY_DISABLED: u32 = 0x0000_DEAD;
const NAME_LEN: usize = 32;
const UUID_LEN: usize = 40;
const KEYSLOT_ALIGN_SECTORS: u64 = 4096 / SECTOR_SIZE as u64;

const OFF_VERSION: usize = 6;
const OFF_CIPHER_NAME: usize = 8;
const OFF_CIPHER_MODE: usize = 40;
const OFF_HASH_SPEC: usize = 72;
const OFF_PAYLOAD: usize = 104;
const OFF_KEY_BYTES: usize = 108;
const OFF_MK_DIGEST: usize = 112;
const OFF_MK_SALT: usize = 132;
const OFF_MK_ITERATIONS: usize = 164;
const OFF_UUID: usize = 168;
const OFF_KEYBLOCKS: usize = 208;
const KEYBLOCK_SIZE: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KeyBlock {
    active: bool,
    iterations: u32,
    salt: [u8; LUKS_SALT_SIZE],
    /// In sectors.
    material_offset: u32,
    stripes: u32,
}

impl KeyBlock {
    fn disabled(material_offset: u32) -> Self {
        Self {
            active: false,
            iterations: 0,
            salt: [0u8; LUKS_SALT_SIZE],
            material_offset,
            stripes: LUKS_STRIPES as u32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Luks1Header {
    cipher: CipherSpec,
    hash: HashAlgorithm,
    payload_offset: u32,
    mk_digest: [u8; LUKS_DIGEST_SIZE],
    mk_digest_salt: [u8; LUKS_SALT_SIZE],
    mk_digest_iterations: u32,
    uuid: String,
    keyblocks: [KeyBlock; LUKS_NUMKEYS],
}

/// Sectors occupied by one key material area.
fn material_sectors(key_bytes: usize) -> u64 {
    (afsplit::split_size(key_bytes, LUKS_STRIPES) as u64).div_ceil(SECTOR_SIZE as u64)
}

impl Luks1Header {
    /// Lay out a fresh header for `volume_key`. Every key slot starts disabled.
    pub fn create(
        params: &Luks1Params,
        generic: &GenericParams,
        volume_key: &VolumeKey,
        device_size: u64,
        tuning: &mut KdfTuning,
    ) -> Result<Self> {
        let cipher = CipherSpec::new(&generic.cipher, &generic.cipher_mode, generic.volume_key_size)?;
        let hash = HashAlgorithm::from_name(&params.hash)?;
        if volume_key.len() != cipher.key_size() {
            return Err(CryptError::invalid(
                ErrorKind::VolumeKeyMismatch,
                format!(
                    "volume key is {} bytes but {cipher} expects {}",
                    volume_key.len(),
                    cipher.key_size()
                ),
            ));
        }
        if params.data_alignment == 0 {
            return Err(CryptError::invalid(
                ErrorKind::InternalInvariant,
                "data alignment must be at least one sector",
            ));
        }

        let area = material_sectors(cipher.key_size());
        let mut keyblocks = [KeyBlock::disabled(0); LUKS_NUMKEYS];
        let mut sector = KEYSLOT_ALIGN_SECTORS;
        for block in keyblocks.iter_mut() {
            block.material_offset = sector as u32;
            sector = (sector + area).next_multiple_of(KEYSLOT_ALIGN_SECTORS);
        }
        let payload_offset = sector.next_multiple_of(params.data_alignment);
        let payload_offset = u32::try_from(payload_offset).map_err(|_| {
            CryptError::invalid(
                ErrorKind::InternalInvariant,
                format!("payload offset of {payload_offset} sectors does not fit a LUKS1 header"),
            )
        })?;

        let header_size = payload_offset as u64 * SECTOR_SIZE as u64;
        if device_size < header_size {
            return Err(CryptError::invalid(
                ErrorKind::DeviceTooSmall,
                format!(
                    "device of {device_size} bytes is smaller than the {header_size}-byte LUKS1 header region"
                ),
            ));
        }

        let mut mk_digest_salt = [0u8; LUKS_SALT_SIZE];
        OsRng.fill_bytes(&mut mk_digest_salt);
        let mk_digest_iterations = tuning.digest_iterations(hash);
        let mk_digest = volume_key_digest(hash, volume_key, &mk_digest_salt, mk_digest_iterations);

        let header = Self {
            cipher,
            hash,
            payload_offset,
            mk_digest,
            mk_digest_salt,
            mk_digest_iterations,
            uuid: Uuid::new_v4().to_string(),
            keyblocks,
        };
        debug!(
            "created LUKS1 header {}: {} {}, payload at sector {}",
            header.uuid,
            header.cipher,
            hash.name(),
            payload_offset
        );
        Ok(header)
    }

    /// Parse and validate the 592-byte header at the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < LUKS1_HEADER_SIZE {
            return Err(CryptError::corrupt(format!(
                "{} bytes is too short for a LUKS1 header",
                bytes.len()
            )));
        }
        if bytes[..LUKS_MAGIC.len()] != LUKS_MAGIC {
            return Err(CryptError::corrupt("device is not a LUKS device"));
        }
        let version = get_u16(bytes, OFF_VERSION);
        if version != LUKS_VERSION {
            return Err(CryptError::corrupt(format!(
                "unsupported LUKS version {version}"
            )));
        }

        let cipher_name = get_str(bytes, OFF_CIPHER_NAME, NAME_LEN)?;
        let cipher_mode = get_str(bytes, OFF_CIPHER_MODE, NAME_LEN)?;
        let hash_spec = get_str(bytes, OFF_HASH_SPEC, NAME_LEN)?;
        let key_bytes = get_u32(bytes, OFF_KEY_BYTES);
        let cipher = CipherSpec::new(&cipher_name, &cipher_mode, key_bytes as usize)?;
        let hash = HashAlgorithm::from_name(&hash_spec)?;

        let mk_digest_iterations = get_u32(bytes, OFF_MK_ITERATIONS);
        if mk_digest_iterations == 0 {
            return Err(CryptError::corrupt("volume key digest has zero iterations"));
        }

        let mut keyblocks = [KeyBlock::disabled(0); LUKS_NUMKEYS];
        for (index, block) in keyblocks.iter_mut().enumerate() {
            let base = OFF_KEYBLOCKS + index * KEYBLOCK_SIZE;
            block.active = match get_u32(bytes, base) {
                KEY_ENABLED => true,
                KEY_DISABLED => false,
                other => {
                    return Err(CryptError::corrupt(format!(
                        "key slot {index} has invalid state {other:#010x}"
                    )));
                }
            };
            block.iterations = get_u32(bytes, base + 4);
            block.salt = get_array(bytes, base + 8);
            block.material_offset = get_u32(bytes, base + 40);
            block.stripes = get_u32(bytes, base + 44);

            if block.stripes as usize != LUKS_STRIPES {
                return Err(CryptError::corrupt(format!(
                    "key slot {index} uses {} stripes, expected {LUKS_STRIPES}",
                    block.stripes
                )));
            }
            if block.active && block.iterations == 0 {
                return Err(CryptError::corrupt(format!(
                    "key slot {index} is active with zero iterations"
                )));
            }
        }

        let header = Self {
            cipher,
            hash,
            payload_offset: get_u32(bytes, OFF_PAYLOAD),
            mk_digest: get_array(bytes, OFF_MK_DIGEST),
            mk_digest_salt: get_array(bytes, OFF_MK_SALT),
            mk_digest_iterations,
            uuid: get_str(bytes, OFF_UUID, UUID_LEN)?,
            keyblocks,
        };
        header.check_layout()?;
        Ok(header)
    }

    /// Serialize the 592-byte header.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; LUKS1_HEADER_SIZE];
        buf[..LUKS_MAGIC.len()].copy_from_slice(&LUKS_MAGIC);
        buf[OFF_VERSION..OFF_VERSION + 2].copy_from_slice(&LUKS_VERSION.to_be_bytes());
        put_str(&mut buf, OFF_CIPHER_NAME, NAME_LEN, self.cipher.cipher_name());
        put_str(&mut buf, OFF_CIPHER_MODE, NAME_LEN, self.cipher.mode_name());
        put_str(&mut buf, OFF_HASH_SPEC, NAME_LEN, self.hash.name());
        put_u32(&mut buf, OFF_PAYLOAD, self.payload_offset);
        put_u32(&mut buf, OFF_KEY_BYTES, self.cipher.key_size() as u32);
        buf[OFF_MK_DIGEST..OFF_MK_DIGEST + LUKS_DIGEST_SIZE].copy_from_slice(&self.mk_digest);
        buf[OFF_MK_SALT..OFF_MK_SALT + LUKS_SALT_SIZE].copy_from_slice(&self.mk_digest_salt);
        put_u32(&mut buf, OFF_MK_ITERATIONS, self.mk_digest_iterations);
        put_str(&mut buf, OFF_UUID, UUID_LEN, &self.uuid);

        for (index, block) in self.keyblocks.iter().enumerate() {
            let base = OFF_KEYBLOCKS + index * KEYBLOCK_SIZE;
            put_u32(&mut buf, base, if block.active { KEY_ENABLED } else { KEY_DISABLED });
            put_u32(&mut buf, base + 4, block.iterations);
            buf[base + 8..base + 8 + LUKS_SALT_SIZE].copy_from_slice(&block.salt);
            put_u32(&mut buf, base + 40, block.material_offset);
            put_u32(&mut buf, base + 44, block.stripes);
        }
        buf
    }

    /// Key material areas must sit between the header and the payload without
    /// overlapping each other.
    fn check_layout(&self) -> Result<()> {
        let area = material_sectors(self.cipher.key_size());
        let header_sectors = (LUKS1_HEADER_SIZE as u64).div_ceil(SECTOR_SIZE as u64);

        let mut ranges: Vec<(usize, u64, u64)> = self
            .keyblocks
            .iter()
            .enumerate()
            .map(|(index, block)| {
                let start = block.material_offset as u64;
                (index, start, start + area)
            })
            .collect();

        for &(index, start, end) in &ranges {
            if start < header_sectors || end > self.payload_offset as u64 {
                return Err(CryptError::corrupt(format!(
                    "key slot {index} material at sectors {start}..{end} lies outside the key area \
                     (payload at sector {})",
                    self.payload_offset
                )));
            }
        }

        ranges.sort_by_key(|&(_, start, _)| start);
        for pair in ranges.windows(2) {
            let (a, _, a_end) = pair[0];
            let (b, b_start, _) = pair[1];
            if a_end > b_start {
                return Err(CryptError::corrupt(format!(
                    "key slots {a} and {b} have overlapping key material"
                )));
            }
        }
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<&KeyBlock> {
        self.keyblocks.get(index).ok_or_else(|| {
            CryptError::invalid(
                ErrorKind::SlotOutOfRange,
                format!("key slot {index} is invalid, LUKS1 has slots 0-{}", LUKS_NUMKEYS - 1),
            )
        })
    }

    fn material_len(&self) -> usize {
        material_sectors(self.cipher.key_size()) as usize * SECTOR_SIZE
    }

    fn material_offset_bytes(block: &KeyBlock) -> u64 {
        block.material_offset as u64 * SECTOR_SIZE as u64
    }

    fn derive_slot_key(&self, passphrase: &[u8], block: &KeyBlock) -> Zeroizing<Vec<u8>> {
        let mut key = Zeroizing::new(vec![0u8; self.cipher.key_size()]);
        self.hash.pbkdf2(passphrase, &block.salt, block.iterations, &mut key);
        key
    }

    fn digest_matches(&self, key: &VolumeKey) -> bool {
        if key.len() != self.cipher.key_size() {
            return false;
        }
        let digest = volume_key_digest(
            self.hash,
            key,
            &self.mk_digest_salt,
            self.mk_digest_iterations,
        );
        digest
            .iter()
            .zip(self.mk_digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl VolumeHeader for Luks1Header {
    fn format_type(&self) -> FormatType {
        FormatType::Luks1
    }

    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn cipher(&self) -> &CipherSpec {
        &self.cipher
    }

    fn hash(&self) -> HashAlgorithm {
        self.hash
    }

    fn payload_offset(&self) -> u64 {
        self.payload_offset as u64
    }

    fn header_size(&self) -> u64 {
        self.payload_offset as u64 * SECTOR_SIZE as u64
    }

    fn digest_iterations(&self) -> u32 {
        self.mk_digest_iterations
    }

    fn keyslot_max(&self) -> usize {
        LUKS_NUMKEYS
    }

    fn keyslot_info(&self, index: usize) -> Result<KeySlotInfo> {
        let block = self.check_index(index)?;
        Ok(KeySlotInfo {
            index,
            status: if block.active {
                KeySlotStatus::Active
            } else {
                KeySlotStatus::Inactive
            },
            iterations: block.iterations,
            salt: block.salt.to_vec(),
            material_offset: block.material_offset as u64,
            stripes: block.stripes,
        })
    }

    fn verify_volume_key(&self, key: &VolumeKey) -> Result<()> {
        if self.digest_matches(key) {
            Ok(())
        } else {
            Err(CryptError::invalid(
                ErrorKind::VolumeKeyMismatch,
                "volume key does not match the header digest",
            ))
        }
    }

    fn add_keyslot(
        &mut self,
        storage: &mut Storage,
        index: usize,
        key: &VolumeKey,
        passphrase: &[u8],
        tuning: &mut KdfTuning,
    ) -> Result<()> {
        let mut block = *self.check_index(index)?;
        if block.active {
            return Err(CryptError::invalid(
                ErrorKind::SlotOccupied,
                format!("key slot {index} is already in use"),
            ));
        }
        self.verify_volume_key(key)?;

        OsRng.fill_bytes(&mut block.salt);
        block.iterations = tuning.keyslot_iterations(self.hash);
        block.stripes = LUKS_STRIPES as u32;

        let slot_key = self.derive_slot_key(passphrase, &block);
        let split = afsplit::split(key.as_bytes(), LUKS_STRIPES, self.hash)?;
        let mut material = Zeroizing::new(vec![0u8; self.material_len()]);
        material[..split.len()].copy_from_slice(&split);
        self.cipher.encrypt_sectors(&slot_key, &mut material, 0)?;

        // Material first: the slot stays disabled on disk until the header lands.
        storage.write_at(Self::material_offset_bytes(&block), &material)?;
        block.active = true;
        let mut updated = self.clone();
        updated.keyblocks[index] = block;
        updated.write_header(storage)?;

        debug!(
            "key slot {index} enabled with {} pbkdf2-{} iterations",
            block.iterations,
            self.hash.name()
        );
        *self = updated;
        Ok(())
    }

    fn open_keyslot(&self, storage: &Storage, index: usize, passphrase: &[u8]) -> Result<VolumeKey> {
        let block = self.check_index(index)?;
        if !block.active {
            return Err(CryptError::invalid(
                ErrorKind::SlotInactive,
                format!("key slot {index} is not active"),
            ));
        }

        let slot_key = self.derive_slot_key(passphrase, block);
        let mut material = Zeroizing::new(vec![0u8; self.material_len()]);
        storage.read_at(Self::material_offset_bytes(block), &mut material)?;
        self.cipher.decrypt_sectors(&slot_key, &mut material, 0)?;
        let merged = afsplit::merge(
            &material,
            self.cipher.key_size(),
            block.stripes as usize,
            self.hash,
        )?;

        let key = VolumeKey::from_bytes(&merged);
        if !self.digest_matches(&key) {
            return Err(CryptError::invalid(
                ErrorKind::PassphraseMismatch,
                format!("no key available in slot {index} with this passphrase"),
            ));
        }
        Ok(key)
    }

    fn destroy_keyslot(&mut self, storage: &mut Storage, index: usize) -> Result<()> {
        let block = *self.check_index(index)?;
        if !block.active {
            return Err(CryptError::invalid(
                ErrorKind::SlotInactive,
                format!("key slot {index} is not active"),
            ));
        }

        let mut updated = self.clone();
        updated.keyblocks[index] = KeyBlock::disabled(block.material_offset);
        updated.write_header(storage)?;
        *self = updated;

        let mut noise = vec![0u8; self.material_len()];
        OsRng.fill_bytes(&mut noise);
        storage
            .write_at(Self::material_offset_bytes(&block), &noise)
            .map_err(|e| e.with_context(format!("key slot {index} disabled but its key material was not wiped")))?;
        storage.sync()?;
        debug!("key slot {index} destroyed");
        Ok(())
    }

    fn region_bytes(&self) -> Vec<u8> {
        let mut region = vec![0u8; self.header_size() as usize];
        region[..LUKS1_HEADER_SIZE].copy_from_slice(&self.encode());
        region
    }

    fn write_header(&self, storage: &mut Storage) -> Result<()> {
        storage.write_at(0, &self.encode())?;
        storage.sync()
    }
}

/// Read and validate the LUKS1 header stored on `storage`.
pub fn read_from(storage: &Storage) -> Result<Luks1Header> {
    if storage.size() < LUKS1_HEADER_SIZE as u64 {
        return Err(CryptError::corrupt(format!(
            "{} is too small to hold a LUKS1 header",
            storage.path().display()
        )));
    }
    let mut buf = vec![0u8; LUKS1_HEADER_SIZE];
    storage.read_at(0, &mut buf)?;
    let header = Luks1Header::decode(&buf).map_err(|e| {
        let msg = format!("{}: {}", storage.path().display(), e.message());
        e.with_context(msg)
    })?;

    if header.header_size() > storage.size() {
        return Err(CryptError::corrupt(format!(
            "LUKS1 header region of {} bytes exceeds {} ({} bytes)",
            header.header_size(),
            storage.path().display(),
            storage.size()
        )));
    }
    Ok(header)
}

fn volume_key_digest(
    hash: HashAlgorithm,
    key: &VolumeKey,
    salt: &[u8],
    iterations: u32,
) -> [u8; LUKS_DIGEST_SIZE] {
    let mut digest = [0u8; LUKS_DIGEST_SIZE];
    hash.pbkdf2(key.as_bytes(), salt, iterations, &mut digest);
    digest
}

fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(get_array(buf, offset))
}

fn get_array<const N: usize>(buf: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[offset..offset + N]);
    out
}

fn get_str(buf: &[u8], offset: usize, len: usize) -> Result<String> {
    let field = &buf[offset..offset + len];
    let end = field.iter().position(|&b| b == 0).unwrap_or(len);
    std::str::from_utf8(&field[..end])
        .map(str::to_string)
        .map_err(|_| CryptError::corrupt(format!("header field at offset {offset} is not valid text")))
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Copy `value` into a NUL-terminated field of `len` bytes.
fn put_str(buf: &mut [u8], offset: usize, len: usize, value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(len - 1);
    buf[offset..offset + n].copy_from_slice(&bytes[..n]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::FillDefaultValues;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    const FOUR_MIB: u64 = 4 * 1024 * 1024;

    fn default_params() -> (Luks1Params, GenericParams) {
        let mut params = Luks1Params::default();
        params.fill_default_values();
        let mut generic = GenericParams::default();
        generic.fill_default_values();
        (params, generic)
    }

    fn fast_tuning() -> KdfTuning {
        KdfTuning::new(Duration::ZERO)
    }

    fn create_default() -> (Luks1Header, VolumeKey) {
        let (params, generic) = default_params();
        let key = VolumeKey::generate(generic.volume_key_size);
        let header =
            Luks1Header::create(&params, &generic, &key, FOUR_MIB, &mut fast_tuning()).unwrap();
        (header, key)
    }

    fn formatted_image(dir: &TempDir, header: &Luks1Header) -> Storage {
        let path = dir.path().join("disk.img");
        fs::write(&path, vec![0u8; FOUR_MIB as usize]).unwrap();
        let mut storage = Storage::open(&path).unwrap();
        storage.write_at(0, &header.region_bytes()).unwrap();
        storage
    }

    #[test]
    fn test_default_layout() {
        let (header, _) = create_default();
        let offsets: Vec<u32> = header.keyblocks.iter().map(|b| b.material_offset).collect();
        assert_eq!(offsets, vec![8, 264, 520, 776, 1032, 1288, 1544, 1800]);
        assert_eq!(header.payload_offset(), 4096);
        assert_eq!(header.header_size(), 2 * 1024 * 1024);
        assert!(header.keyblocks.iter().all(|b| !b.active));
    }

    #[test]
    fn test_small_alignment_packs_payload() {
        let (mut params, generic) = default_params();
        params.data_alignment = 8;
        let key = VolumeKey::generate(32);
        let header =
            Luks1Header::create(&params, &generic, &key, FOUR_MIB, &mut fast_tuning()).unwrap();
        assert_eq!(header.payload_offset(), 2056);
    }

    #[test]
    fn test_create_rejects_small_device() {
        let (params, generic) = default_params();
        let key = VolumeKey::generate(32);
        let err = Luks1Header::create(&params, &generic, &key, 1024 * 1024, &mut fast_tuning())
            .unwrap_err();
        assert_eq!(err.code(), -22);
        assert_eq!(err.kind, Some(ErrorKind::DeviceTooSmall));
    }

    #[test]
    fn test_encode_layout_and_decode() {
        let (header, key) = create_default();
        let bytes = header.encode();

        assert_eq!(bytes.len(), LUKS1_HEADER_SIZE);
        assert_eq!(&bytes[..6], &LUKS_MAGIC);
        assert_eq!(&bytes[6..8], &[0, 1]);
        assert_eq!(&bytes[8..11], b"aes");
        assert_eq!(&bytes[40..51], b"xts-plain64");
        assert_eq!(&bytes[72..78], b"sha256");
        assert_eq!(get_u32(&bytes, OFF_KEY_BYTES), 32);
        assert_eq!(get_u32(&bytes, OFF_KEYBLOCKS), KEY_DISABLED);

        let decoded = Luks1Header::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        decoded.verify_volume_key(&key).unwrap();
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let err = Luks1Header::decode(&[0u8; LUKS1_HEADER_SIZE]).unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::HeaderInvalid));
        assert_eq!(err.code(), -22);
    }

    #[test]
    fn test_decode_rejects_unknown_slot_state() {
        let (header, _) = create_default();
        let mut bytes = header.encode();
        put_u32(&mut bytes, OFF_KEYBLOCKS + 3 * KEYBLOCK_SIZE, 0x1234_5678);
        let err = Luks1Header::decode(&bytes).unwrap_err();
        assert!(err.message().contains("key slot 3"));
    }

    #[test]
    fn test_decode_rejects_overlapping_material() {
        let (header, _) = create_default();
        let mut bytes = header.encode();
        put_u32(&mut bytes, OFF_KEYBLOCKS + KEYBLOCK_SIZE + 40, 100);
        let err = Luks1Header::decode(&bytes).unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::HeaderInvalid));
    }

    #[test]
    fn test_wrong_volume_key_rejected() {
        let (header, _) = create_default();
        let err = header
            .verify_volume_key(&VolumeKey::generate(32))
            .unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::VolumeKeyMismatch));
    }

    #[test]
    fn test_keyslot_add_open_destroy() {
        let temp_dir = TempDir::new().unwrap();
        let (mut header, key) = create_default();
        let mut storage = formatted_image(&temp_dir, &header);
        let mut tuning = fast_tuning();

        header
            .add_keyslot(&mut storage, 2, &key, b"hunter2", &mut tuning)
            .unwrap();
        assert_eq!(header.keyslot_status(2).unwrap(), KeySlotStatus::Active);
        assert_eq!(header.keyslot_status(0).unwrap(), KeySlotStatus::Inactive);

        let reloaded = read_from(&storage).unwrap();
        assert_eq!(reloaded, header);

        let opened = reloaded.open_keyslot(&storage, 2, b"hunter2").unwrap();
        assert_eq!(opened, key);

        let err = reloaded.open_keyslot(&storage, 2, b"wrong").unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::PassphraseMismatch));
        assert_eq!(err.code(), -22);

        header.destroy_keyslot(&mut storage, 2).unwrap();
        assert_eq!(header.keyslot_status(2).unwrap(), KeySlotStatus::Inactive);
        let reloaded = read_from(&storage).unwrap();
        assert_eq!(reloaded.keyslot_status(2).unwrap(), KeySlotStatus::Inactive);
    }

    #[test]
    fn test_occupied_slot_rejected_without_change() {
        let temp_dir = TempDir::new().unwrap();
        let (mut header, key) = create_default();
        let mut storage = formatted_image(&temp_dir, &header);
        let mut tuning = fast_tuning();

        header
            .add_keyslot(&mut storage, 0, &key, b"one", &mut tuning)
            .unwrap();
        let before = header.clone();
        let err = header
            .add_keyslot(&mut storage, 0, &key, b"two", &mut tuning)
            .unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::SlotOccupied));
        assert_eq!(header, before);
        header.open_keyslot(&storage, 0, b"one").unwrap();
    }

    #[test]
    fn test_slot_index_out_of_range() {
        let (header, _) = create_default();
        let err = header.keyslot_status(LUKS_NUMKEYS).unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::SlotOutOfRange));
    }

    #[test]
    fn test_read_from_rejects_truncated_region() {
        let temp_dir = TempDir::new().unwrap();
        let (header, _) = create_default();
        let path = temp_dir.path().join("short.img");
        fs::write(&path, header.encode()).unwrap();

        let storage = Storage::open(&path).unwrap();
        let err = read_from(&storage).unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::Corrupt);
    }
}
