use alloy::primitives::{Address, B256, Signature};
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::{
    error::OracleError,
    protos::oracle::v1::{PartialSignature, Report},
};

/// Domain tag mixed into every report digest.
const REPORT_DIGEST_DOMAIN: &[u8] = b"oracle.v1.report";

/// Milliseconds since the Unix epoch.
pub fn current_timestamp() -> Result<u64, OracleError> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as u64)
}

pub fn generate_job_id() -> Uuid {
    Uuid::new_v4()
}

pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Canonical digest every peer signs for a report.
///
/// SHA-256 over a domain tag followed by a little-endian framing of the report identity,
/// values, observers and distributed public key. Strings and lists are length-prefixed.
///
/// The round is deliberately absent: the report is fixed per epoch, so a partial signature
/// stays valid when a later round's leader redistributes the same report.
pub fn compute_report_digest(report: &Report, distributed_public_key: &[u8]) -> B256 {
    let mut hasher = Sha256::new();
    hasher.update(REPORT_DIGEST_DOMAIN);
    hasher.update((report.chain_id.len() as u64).to_le_bytes());
    hasher.update(report.chain_id.as_bytes());
    hasher.update((report.request_id.len() as u64).to_le_bytes());
    hasher.update(report.request_id.as_bytes());
    hasher.update(report.epoch.to_le_bytes());
    hasher.update((report.values.len() as u64).to_le_bytes());
    for value in &report.values {
        hasher.update(value.to_le_bytes());
    }
    hasher.update((report.observers.len() as u64).to_le_bytes());
    for index in &report.observers {
        hasher.update(index.to_le_bytes());
    }
    hasher.update(distributed_public_key);
    B256::from_slice(&hasher.finalize())
}

/// Checks that `partial` was produced over `digest` by the signer registered at its index.
pub fn verify_partial_signature(
    partial: &PartialSignature,
    digest: &B256,
    signers: &[Address],
) -> Result<bool, OracleError> {
    if partial.signature.is_empty() {
        return Err(OracleError::EmptySignature);
    }
    let Some(expected) = signers.get(partial.index as usize) else {
        return Err(OracleError::InvalidPeerIndex {
            index: partial.index,
            peer_count: signers.len(),
        });
    };

    let signature_bytes: [u8; 65] =
        partial
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| OracleError::MismatchedLength {
                expect: 65,
                actual: partial.signature.len(),
            })?;
    let signature = Signature::from_raw_array(&signature_bytes)?;
    let recovered = signature.recover_address_from_prehash(digest)?;
    Ok(recovered == *expected)
}

/// Moves a stale reference timestamp forward by whole `window`s until it lies after `now`.
///
/// Applying it twice gives the same result as applying it once.
pub fn advance_reference(reference: u64, window: u64, now: u64) -> u64 {
    if window == 0 || reference > now {
        return reference;
    }
    let behind = now - reference;
    let steps = behind / window + 1;
    reference.saturating_add(steps.saturating_mul(window))
}

pub fn validate_threshold(
    name: &str,
    threshold: usize,
    peer_count: usize,
) -> Result<(), OracleError> {
    if threshold == 0 {
        return Err(OracleError::InvalidConfiguration(format!(
            "{name} must be greater than 0"
        )));
    }
    if threshold > peer_count {
        return Err(OracleError::InvalidConfiguration(format!(
            "{name} ({threshold}) exceeds peer count ({peer_count})"
        )));
    }
    Ok(())
}

pub fn validate_window(name: &str, window: Duration) -> Result<(), OracleError> {
    if window.is_zero() {
        return Err(OracleError::InvalidConfiguration(format!(
            "{name} must be greater than 0"
        )));
    }
    Ok(())
}
