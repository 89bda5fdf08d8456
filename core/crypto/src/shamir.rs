//! Shamir secret sharing of master keys over GF(256).
//!
//! Each share is signed with a BLAKE2b-256 digest binding it to the
//! container it was issued for, so shares from another container, or
//! altered shares, are rejected before interpolation.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use sharks::Sharks;
use std::collections::BTreeMap;
use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::keys::{MasterKey, KEY_LENGTH};
use tvault_common::{ContainerId, EngineError, ErrorCode};

/// Length of a share signature.
pub const SIGNATURE_LENGTH: usize = 32;

const SIGNATURE_DOMAIN: &[u8] = b"tvault:share:v1";

/// Errors from splitting or reconstructing a master key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShamirError {
    #[error("Number of shares must be greater than zero")]
    SharesEqualZero,

    #[error("Threshold must be greater than zero")]
    ThresholdEqualZero,

    #[error("Number of shares must be at least two")]
    SharesLessThanTwo,

    #[error("Threshold must be at least two")]
    ThresholdLessThanTwo,

    #[error("Number of shares cannot exceed 255")]
    SharesGreaterThan255,

    #[error("Threshold cannot exceed 255")]
    ThresholdGreaterThan255,

    #[error("Number of shares must be greater than or equal to threshold")]
    SharesLessThanThreshold,

    #[error("Share {0} has an invalid signature")]
    SignatureInvalid(u8),

    #[error("Need {required} distinct shares, got {provided}")]
    NotEnoughShares { required: u8, provided: usize },

    #[error("Shamir split failed: {0}")]
    Split(String),

    #[error("Share recovery failed: {0}")]
    Recover(String),
}

impl ShamirError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ShamirError::SharesEqualZero => ErrorCode::ShamirSharesEqualZero,
            ShamirError::ThresholdEqualZero => ErrorCode::ShamirThresholdEqualZero,
            ShamirError::SharesLessThanTwo => ErrorCode::ShamirSharesLessThanTwo,
            ShamirError::ThresholdLessThanTwo => ErrorCode::ShamirThresholdLessThanTwo,
            ShamirError::SharesGreaterThan255 => ErrorCode::ShamirSharesGreaterThan255,
            ShamirError::ThresholdGreaterThan255 => ErrorCode::ShamirThresholdGreaterThan255,
            ShamirError::SharesLessThanThreshold => ErrorCode::ShamirSharesLessThanThreshold,
            ShamirError::SignatureInvalid(_) => ErrorCode::ShamirShareSignatureInvalid,
            ShamirError::NotEnoughShares { .. } => ErrorCode::ShamirNotEnoughShares,
            ShamirError::Split(_) => ErrorCode::SealShamirSplit,
            ShamirError::Recover(_) => ErrorCode::UnsealRestoreMasterKey,
        }
    }
}

impl From<ShamirError> for EngineError {
    fn from(err: ShamirError) -> Self {
        let code = err.code();
        EngineError::wrap(code, err)
    }
}

/// One share of a split master key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Share {
    index: u8,
    value: Vec<u8>,
    signature: [u8; SIGNATURE_LENGTH],
}

impl Share {
    /// Assemble a share from decoded token parts. The signature is not checked here.
    pub fn from_parts(index: u8, value: Vec<u8>, signature: [u8; SIGNATURE_LENGTH]) -> Self {
        Self {
            index,
            value,
            signature,
        }
    }

    fn signed(index: u8, value: Vec<u8>, id: &ContainerId) -> Self {
        let signature = sign(id, index, &value);
        Self {
            index,
            value,
            signature,
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.signature
    }

    /// Whether this share was issued for container `id` and is unaltered.
    pub fn verify(&self, id: &ContainerId) -> bool {
        let expected = sign(id, self.index, &self.value);
        expected.ct_eq(&self.signature).into()
    }
}

impl fmt::Debug for Share {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Share")
            .field("index", &self.index)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

fn sign(id: &ContainerId, index: u8, value: &[u8]) -> [u8; SIGNATURE_LENGTH] {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(SIGNATURE_DOMAIN);
    hasher.update(id.as_bytes());
    hasher.update([index]);
    hasher.update(value);

    let mut out = [0u8; SIGNATURE_LENGTH];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Check share count and threshold, reporting the first violated rule.
///
/// Rules are checked in a fixed order so callers always see the same error
/// for the same input.
pub fn validate_params(shares: u32, threshold: u32) -> Result<(), ShamirError> {
    if shares == 0 {
        return Err(ShamirError::SharesEqualZero);
    }
    if threshold == 0 {
        return Err(ShamirError::ThresholdEqualZero);
    }
    if shares < 2 {
        return Err(ShamirError::SharesLessThanTwo);
    }
    if threshold < 2 {
        return Err(ShamirError::ThresholdLessThanTwo);
    }
    if shares > 255 {
        return Err(ShamirError::SharesGreaterThan255);
    }
    if threshold > 255 {
        return Err(ShamirError::ThresholdGreaterThan255);
    }
    if shares < threshold {
        return Err(ShamirError::SharesLessThanThreshold);
    }
    Ok(())
}

/// Split `master` into `shares` signed shares, any `threshold` of which
/// reconstruct it.
///
/// # Postconditions
/// - Share indices are `1..=shares`
///
/// # Errors
/// - Parameter violations, see [`validate_params`]
pub fn split(
    master: &MasterKey,
    threshold: u32,
    shares: u32,
    id: &ContainerId,
) -> Result<Vec<Share>, ShamirError> {
    validate_params(shares, threshold)?;

    let dealer = Sharks(threshold as u8).dealer(master.as_bytes());
    let issued: Vec<Share> = dealer
        .take(shares as usize)
        .map(|share| {
            let mut bytes: Vec<u8> = (&share).into();
            let index = bytes[0];
            let value = bytes[1..].to_vec();
            bytes.zeroize();
            Share::signed(index, value, id)
        })
        .collect();

    if issued.len() != shares as usize {
        return Err(ShamirError::Split(format!(
            "expected {} shares, got {}",
            shares,
            issued.len()
        )));
    }
    Ok(issued)
}

/// Reconstruct the master key from signed shares.
///
/// # Preconditions
/// - `threshold` is the value recorded when the shares were issued
///
/// # Postconditions
/// - Any `threshold` distinct valid shares yield the same key
///
/// # Errors
/// - `SignatureInvalid` if any share is not signed for `id`
/// - `NotEnoughShares` if fewer than `threshold` distinct indices remain
pub fn reconstruct(
    shares: &[Share],
    threshold: u8,
    id: &ContainerId,
) -> Result<MasterKey, ShamirError> {
    if let Some(bad) = shares.iter().find(|s| !s.verify(id)) {
        return Err(ShamirError::SignatureInvalid(bad.index));
    }

    let distinct: BTreeMap<u8, &Share> = shares.iter().map(|s| (s.index, s)).collect();
    if threshold == 0 || distinct.len() < threshold as usize {
        return Err(ShamirError::NotEnoughShares {
            required: threshold,
            provided: distinct.len(),
        });
    }

    let points = distinct
        .values()
        .take(threshold as usize)
        .map(|s| {
            let mut bytes = Vec::with_capacity(1 + s.value.len());
            bytes.push(s.index);
            bytes.extend_from_slice(&s.value);
            let point = sharks::Share::try_from(bytes.as_slice())
                .map_err(|e| ShamirError::Recover(e.to_string()));
            bytes.zeroize();
            point
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut secret = Sharks(threshold)
        .recover(&points)
        .map_err(|e| ShamirError::Recover(e.to_string()))?;

    let key = MasterKey::from_slice(&secret).ok_or_else(|| {
        ShamirError::Recover(format!(
            "recovered key has wrong length: {} (expected {})",
            secret.len(),
            KEY_LENGTH
        ))
    });
    secret.zeroize();
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn master() -> MasterKey {
        MasterKey::from_bytes(core::array::from_fn(|i| i as u8 * 7 + 3))
    }

    #[test]
    fn test_validation_order() {
        assert_eq!(validate_params(0, 0), Err(ShamirError::SharesEqualZero));
        assert_eq!(validate_params(3, 0), Err(ShamirError::ThresholdEqualZero));
        assert_eq!(validate_params(1, 1), Err(ShamirError::SharesLessThanTwo));
        assert_eq!(validate_params(3, 1), Err(ShamirError::ThresholdLessThanTwo));
        assert_eq!(validate_params(256, 300), Err(ShamirError::SharesGreaterThan255));
        assert_eq!(validate_params(255, 256), Err(ShamirError::ThresholdGreaterThan255));
        assert_eq!(validate_params(2, 3), Err(ShamirError::SharesLessThanThreshold));
        assert_eq!(validate_params(255, 255), Ok(()));
        assert_eq!(validate_params(2, 2), Ok(()));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ShamirError::SharesLessThanThreshold.code().as_u16(), 0x009);
        assert_eq!(ShamirError::ThresholdGreaterThan255.code().as_u16(), 0x013);
    }

    #[test]
    fn test_split_indices_and_signatures() {
        let id = ContainerId::generate();
        let shares = split(&master(), 3, 5, &id).unwrap();

        let indices: Vec<u8> = shares.iter().map(Share::index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
        assert!(shares.iter().all(|s| s.verify(&id)));
        assert!(shares.iter().all(|s| s.value().len() == KEY_LENGTH));
    }

    #[test]
    fn test_reconstruct_with_threshold() {
        let id = ContainerId::generate();
        let shares = split(&master(), 3, 5, &id).unwrap();

        let key = reconstruct(&shares[1..4], 3, &id).unwrap();
        assert_eq!(key.as_bytes(), master().as_bytes());

        let key = reconstruct(&shares, 3, &id).unwrap();
        assert_eq!(key.as_bytes(), master().as_bytes());
    }

    #[test]
    fn test_too_few_shares() {
        let id = ContainerId::generate();
        let shares = split(&master(), 3, 5, &id).unwrap();

        let err = reconstruct(&shares[..2], 3, &id).unwrap_err();
        assert_eq!(err, ShamirError::NotEnoughShares { required: 3, provided: 2 });
    }

    #[test]
    fn test_duplicates_collapse() {
        let id = ContainerId::generate();
        let shares = split(&master(), 3, 5, &id).unwrap();

        let dupes = vec![shares[0].clone(), shares[0].clone(), shares[1].clone()];
        let err = reconstruct(&dupes, 3, &id).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ShamirNotEnoughShares);
    }

    #[test]
    fn test_foreign_share_rejected() {
        let id = ContainerId::generate();
        let other = ContainerId::generate();
        let mine = split(&master(), 2, 3, &id).unwrap();
        let theirs = split(&master(), 2, 3, &other).unwrap();

        let mixed = vec![mine[0].clone(), theirs[1].clone()];
        assert_eq!(
            reconstruct(&mixed, 2, &id).unwrap_err(),
            ShamirError::SignatureInvalid(2)
        );
    }

    #[test]
    fn test_altered_share_rejected() {
        let id = ContainerId::generate();
        let shares = split(&master(), 2, 3, &id).unwrap();

        let mut value = shares[0].value().to_vec();
        value[0] ^= 1;
        let forged = Share::from_parts(1, value, *shares[0].signature());
        assert!(!forged.verify(&id));
        assert!(reconstruct(&[forged, shares[1].clone()], 2, &id).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_any_k_subset_reconstructs(
            n in 2u32..12,
            k_off in 0u32..12,
            picks in proptest::collection::vec(any::<prop::sample::Index>(), 12)
        ) {
            let k = 2 + k_off % (n - 1);
            let id = ContainerId::generate();
            let key = master();
            let shares = split(&key, k, n, &id).unwrap();

            let mut pool: Vec<Share> = shares.clone();
            let mut subset = Vec::new();
            for pick in picks.iter().take(k as usize) {
                subset.push(pool.remove(pick.index(pool.len())));
            }

            let restored = reconstruct(&subset, k as u8, &id).unwrap();
            prop_assert_eq!(restored.as_bytes(), key.as_bytes());

            subset.pop();
            prop_assert!(reconstruct(&subset, k as u8, &id).is_err());
        }
    }
}
