//! Hash registry and PBKDF2 key derivation.
//!
//! LUKS1 names its hash in the header; everything that hashes (slot KDF,
//! volume key digest, AF diffusion) goes through [`HashAlgorithm`].

use crate::error::{CryptError, ErrorKind, Result};
use log::debug;
use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Floor for every iteration count written to a header.
pub const MIN_ITERATIONS: u32 = 1000;

/// Default target unlock time for a key slot.
pub const DEFAULT_ITERATION_TIME: Duration = Duration::from_millis(2000);

/// Benchmark runs stop once a single run takes at least this long.
const BENCH_MIN_DURATION: Duration = Duration::from_millis(20);

/// Upper bound on benchmark iterations so a pathological clock can't hang us.
const BENCH_MAX_ITERATIONS: u32 = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// Default of older cryptsetup releases; accepted for existing volumes.
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Look up a hash by its LUKS header name (case-insensitive).
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            other => Err(CryptError::invalid(
                ErrorKind::UnsupportedAlgorithm,
                format!("hash `{other}` is not supported"),
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    pub fn digest_size(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// PBKDF2-HMAC over this hash, filling `out`.
    pub fn pbkdf2(&self, password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) {
        match self {
            Self::Sha1 => pbkdf2_hmac::<Sha1>(password, salt, iterations, out),
            Self::Sha256 => pbkdf2_hmac::<Sha256>(password, salt, iterations, out),
            Self::Sha384 => pbkdf2_hmac::<Sha384>(password, salt, iterations, out),
            Self::Sha512 => pbkdf2_hmac::<Sha512>(password, salt, iterations, out),
        }
    }

    /// Plain digest over the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            Self::Sha1 => digest_parts::<Sha1>(parts),
            Self::Sha256 => digest_parts::<Sha256>(parts),
            Self::Sha384 => digest_parts::<Sha384>(parts),
            Self::Sha512 => digest_parts::<Sha512>(parts),
        }
    }
}

fn digest_parts<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = D::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

/// Per-handle PBKDF2 calibration.
///
/// Benchmarks each hash at most once and converts the configured iteration
/// time into iteration counts.
#[derive(Debug, Clone)]
pub struct KdfTuning {
    iteration_time: Duration,
    rates: HashMap<HashAlgorithm, u64>,
}

impl KdfTuning {
    pub fn new(iteration_time: Duration) -> Self {
        Self {
            iteration_time,
            rates: HashMap::new(),
        }
    }

    pub fn iteration_time(&self) -> Duration {
        self.iteration_time
    }

    pub fn set_iteration_time(&mut self, iteration_time: Duration) {
        self.iteration_time = iteration_time;
    }

    /// Iterations for a key slot of `hash`.
    pub fn keyslot_iterations(&mut self, hash: HashAlgorithm) -> u32 {
        self.iterations(hash, 1)
    }

    /// Iterations for the volume key digest; LUKS1 spends an eighth of the
    /// slot budget here.
    pub fn digest_iterations(&mut self, hash: HashAlgorithm) -> u32 {
        self.iterations(hash, 8)
    }

    fn iterations(&mut self, hash: HashAlgorithm, divisor: u64) -> u32 {
        let millis = self.iteration_time.as_millis() as u64;
        if millis == 0 {
            return MIN_ITERATIONS;
        }
        let rate = self.rate(hash);
        let wanted = rate.saturating_mul(millis) / divisor;
        wanted.clamp(MIN_ITERATIONS as u64, u32::MAX as u64) as u32
    }

    /// Iterations per millisecond for `hash` on this machine.
    fn rate(&mut self, hash: HashAlgorithm) -> u64 {
        if let Some(rate) = self.rates.get(&hash) {
            return *rate;
        }
        let rate = benchmark(hash);
        debug!("pbkdf2-{} benchmark: {} iterations/ms", hash.name(), rate);
        self.rates.insert(hash, rate);
        rate
    }
}

impl Default for KdfTuning {
    fn default() -> Self {
        Self::new(DEFAULT_ITERATION_TIME)
    }
}

fn benchmark(hash: HashAlgorithm) -> u64 {
    let password = b"cryptdev-benchmark";
    let salt = [0u8; 32];
    let mut out = [0u8; 32];
    let mut iterations = MIN_ITERATIONS;

    loop {
        let start = Instant::now();
        hash.pbkdf2(password, &salt, iterations, &mut out);
        let elapsed = start.elapsed();

        if elapsed >= BENCH_MIN_DURATION || iterations >= BENCH_MAX_ITERATIONS {
            let micros = elapsed.as_micros().max(1);
            let rate = (iterations as u128 * 1000) / micros;
            return (rate as u64).max(1);
        }
        iterations = iterations.saturating_mul(2);
    }
}
