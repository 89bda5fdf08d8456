//! User-supplied entropy accumulation.
//!
//! Callers feed batches of raw bytes (for example pointer movement samples).
//! Each batch is absorbed into a BLAKE2b-512 pool and credited with a
//! conservative estimate: the smallest min-entropy per byte among the raw
//! bytes and their first and second differences, normalised to `[0, 1]` and
//! halved, so no byte ever counts for more than half a bit. Counters, sweeps
//! and constant batches score zero, and a periodic batch earns at most half a
//! bit per distinct four-byte window. A batch with the same byte histogram as
//! one already credited (a repeat, rotation or reordering) counts for nothing.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Blake2b512, Digest};
use std::collections::HashSet;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use tvault_common::{EngineError, ErrorCode};

/// Default number of bits required before a seed can be taken.
pub const DEFAULT_TARGET_BITS: u32 = 512;

/// Upper bound on credited bits per input byte.
const MAX_BITS_PER_BYTE: f64 = 0.5;

/// Window length used to cap periodic batches.
const PERIOD_WINDOW: usize = 4;

/// Length of an extracted seed.
pub const SEED_LENGTH: usize = 64;

/// Seed drawn from the accumulator.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EntropySeed([u8; SEED_LENGTH]);

impl EntropySeed {
    pub fn as_bytes(&self) -> &[u8; SEED_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for EntropySeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntropySeed([REDACTED])")
    }
}

/// Accumulates entropy batches until a target is reached.
pub struct EntropyAccumulator {
    pool: Blake2b512,
    bits: f64,
    target_bits: u32,
    /// Histogram fingerprints of credited batches.
    seen: HashSet<[u8; 32]>,
}

impl EntropyAccumulator {
    pub fn new(target_bits: u32) -> Self {
        Self {
            pool: Blake2b512::new(),
            bits: 0.0,
            target_bits: target_bits.max(1),
            seen: HashSet::new(),
        }
    }

    /// Absorb a batch and return the running estimate, capped at the target.
    pub fn add_batch(&mut self, bytes: &[u8]) -> u32 {
        if bytes.is_empty() {
            return self.bits();
        }

        self.pool.update((bytes.len() as u64).to_le_bytes());
        self.pool.update(bytes);

        // Nothing more to credit; keep mixing without growing `seen`.
        if self.is_ready() {
            return self.bits();
        }

        if self.seen.insert(histogram_fingerprint(bytes)) {
            self.bits = (self.bits + estimate_bits(bytes)).min(self.target_bits as f64);
        }
        self.bits()
    }

    /// Current estimate in whole bits.
    pub fn bits(&self) -> u32 {
        self.bits.floor() as u32
    }

    pub fn target_bits(&self) -> u32 {
        self.target_bits
    }

    pub fn is_ready(&self) -> bool {
        self.bits() >= self.target_bits
    }

    /// Extract the pool as a seed and reset.
    ///
    /// # Errors
    /// - `EntropyInsufficient` if the target has not been reached; the pool is
    ///   left untouched in that case
    pub fn take_seed(&mut self) -> Result<EntropySeed, EngineError> {
        if !self.is_ready() {
            return Err(EngineError::new(ErrorCode::EntropyInsufficient).with_details(format!(
                "{} of {} bits collected",
                self.bits(),
                self.target_bits
            )));
        }

        let pool = std::mem::replace(&mut self.pool, Blake2b512::new());
        let mut seed = [0u8; SEED_LENGTH];
        seed.copy_from_slice(&pool.finalize());
        self.reset();
        Ok(EntropySeed(seed))
    }

    /// Discard everything collected so far.
    pub fn reset(&mut self) {
        self.pool = Blake2b512::new();
        self.bits = 0.0;
        self.seen.clear();
    }
}

impl Default for EntropyAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_BITS)
    }
}

impl fmt::Debug for EntropyAccumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntropyAccumulator")
            .field("bits", &self.bits())
            .field("target_bits", &self.target_bits)
            .finish()
    }
}

fn histogram(bytes: &[u8]) -> [u32; 256] {
    let mut counts = [0u32; 256];
    for &b in bytes {
        counts[b as usize] += 1;
    }
    counts
}

/// Order-independent fingerprint of a batch.
fn histogram_fingerprint(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b::<U32>::new();
    for count in histogram(bytes) {
        hasher.update(count.to_le_bytes());
    }
    let mut fingerprint = [0u8; 32];
    fingerprint.copy_from_slice(&hasher.finalize());
    fingerprint
}

/// Min-entropy per symbol of `values`, or `None` when empty.
fn min_entropy(values: &[u8]) -> Option<f64> {
    let max = histogram(values).into_iter().max().filter(|&m| m > 0)?;
    Some(-(max as f64 / values.len() as f64).log2())
}

fn differences(values: &[u8]) -> Vec<u8> {
    values.windows(2).map(|w| w[1].wrapping_sub(w[0])).collect()
}

/// Conservative estimate of the entropy contributed by `bytes`.
///
/// Batches shorter than one window score zero.
pub fn estimate_bits(bytes: &[u8]) -> f64 {
    if bytes.len() < PERIOD_WINDOW {
        return 0.0;
    }

    let first = differences(bytes);
    let second = differences(&first);
    let per_symbol = [bytes, &first[..], &second[..]]
        .into_iter()
        .filter_map(min_entropy)
        .fold(f64::INFINITY, f64::min);

    let per_byte = (per_symbol / 8.0).clamp(0.0, 1.0) * MAX_BITS_PER_BYTE;
    let windows = bytes.windows(PERIOD_WINDOW).collect::<HashSet<_>>().len();
    (per_byte * bytes.len() as f64).min(windows as f64 * MAX_BITS_PER_BYTE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};

    fn noise(seed: u64, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        StdRng::seed_from_u64(seed).fill_bytes(&mut bytes);
        bytes
    }

    #[test]
    fn test_constant_input_contributes_nothing() {
        let mut acc = EntropyAccumulator::default();
        assert_eq!(acc.add_batch(&[0x55; 4096]), 0);
        assert_eq!(estimate_bits(&[0u8; 10]), 0.0);
    }

    #[test]
    fn test_duplicate_batches_not_counted_twice() {
        let mut acc = EntropyAccumulator::default();
        let batch = noise(1, 64);
        let first = acc.add_batch(&batch);
        assert!(first > 0);
        assert_eq!(acc.add_batch(&batch), first);
    }

    #[test]
    fn test_random_batch_capped_at_half_bit_per_byte() {
        let batch = noise(7, 256);
        let bits = estimate_bits(&batch);
        assert!(bits > 64.0, "credited {bits}");
        assert!(bits <= 128.0);
    }

    #[test]
    fn test_counter_sweep_contributes_nothing() {
        let sweep: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
        assert_eq!(estimate_bits(&sweep), 0.0);

        let mut acc = EntropyAccumulator::new(512);
        assert_eq!(acc.add_batch(&sweep), 0);
        let stride: Vec<u8> = (0..1024u32).map(|i| (i * 37) as u8).collect();
        assert_eq!(acc.add_batch(&stride), 0);
        assert!(!acc.is_ready());
    }

    #[test]
    fn test_slow_pointer_track_is_deflated() {
        // Coordinates that creep forward by 0 or 1 each sample.
        let track: Vec<u8> = (0..1024u32).map(|i| (i / 2 + i / 3) as u8).collect();
        assert!(estimate_bits(&track) < 0.1 * track.len() as f64);
    }

    #[test]
    fn test_periodic_pattern_is_capped() {
        let pattern: Vec<u8> = [3u8, 200, 17, 90].repeat(256);
        assert!(estimate_bits(&pattern) <= 2.0);

        let mut acc = EntropyAccumulator::new(512);
        let mut bits = 0;
        for period in 2..40u8 {
            let cycle: Vec<u8> = (0..period).map(|i| i.wrapping_mul(97) ^ period).collect();
            bits = acc.add_batch(&cycle.repeat(1024 / period as usize));
        }
        assert!(bits < 512, "credited {bits}");
    }

    #[test]
    fn test_rotated_copies_not_counted_again() {
        let mut acc = EntropyAccumulator::new(512);
        let batch = noise(11, 256);
        let first = acc.add_batch(&batch);
        assert!(first > 0);
        for shift in 1..64 {
            let mut rotated = batch.clone();
            rotated.rotate_left(shift);
            assert_eq!(acc.add_batch(&rotated), first);
        }
        let mut reversed = batch.clone();
        reversed.reverse();
        assert_eq!(acc.add_batch(&reversed), first);
        assert!(!acc.is_ready());
    }

    #[test]
    fn test_stops_tracking_batches_once_ready() {
        let mut acc = EntropyAccumulator::new(64);
        let mut seed = 0;
        while !acc.is_ready() {
            acc.add_batch(&noise(seed, 256));
            seed += 1;
        }
        let tracked = acc.seen.len();
        for extra in 100..200 {
            assert_eq!(acc.add_batch(&noise(extra, 256)), 64);
        }
        assert_eq!(acc.seen.len(), tracked);
    }

    #[test]
    fn test_reaches_target_and_caps() {
        let mut acc = EntropyAccumulator::new(256);
        let mut bits = 0;
        for seed in 0..10 {
            bits = acc.add_batch(&noise(seed, 256));
        }
        assert_eq!(bits, 256);
        assert!(acc.is_ready());
    }

    #[test]
    fn test_take_seed_below_target_fails() {
        let mut acc = EntropyAccumulator::default();
        acc.add_batch(&noise(3, 16));
        let err = acc.take_seed().unwrap_err();
        assert_eq!(err.code(), ErrorCode::EntropyInsufficient);
        assert!(acc.bits() > 0);
    }

    #[test]
    fn test_take_seed_resets() {
        let mut acc = EntropyAccumulator::new(64);
        for seed in 0..4 {
            acc.add_batch(&noise(seed, 256));
        }
        let seed = acc.take_seed().unwrap();
        assert_eq!(seed.as_bytes().len(), SEED_LENGTH);
        assert_eq!(acc.bits(), 0);
        assert!(acc.take_seed().is_err());

        // A batch seen before the reset counts again afterwards.
        assert!(acc.add_batch(&noise(0, 256)) > 0);
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_half_bit_per_byte(batches in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..512), 0..16)
        ) {
            let mut acc = EntropyAccumulator::new(u32::MAX);
            let total: usize = batches.iter().map(Vec::len).sum();
            let mut last = 0;
            for batch in &batches {
                let bits = acc.add_batch(batch);
                prop_assert!(bits >= last);
                last = bits;
            }
            prop_assert!(acc.bits() as f64 <= total as f64 * MAX_BITS_PER_BYTE);
        }
    }
}
