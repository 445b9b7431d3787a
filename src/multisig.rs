//! Threshold aggregation of partial report signatures.
//!
//! [`MultiSignature`] accumulates one partial signature per peer index over a fixed report
//! digest and reports "enough" exactly once. [`ReportSigner`] is the seam to the local key
//! share; [`EcdsaReportSigner`] signs with a secp256k1 key, in which case the aggregate is
//! the ordered set of threshold-many signatures the target chain verifies.

use alloy::{
    primitives::{Address, B256},
    signers::local::PrivateKeySigner,
};
use alloy_signer::Signer;
use std::collections::BTreeMap;

use crate::{error::OracleError, protos::oracle::v1::PartialSignature};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiSignatureProgress {
    /// This index was already recorded; nothing changed.
    Duplicate,
    /// Recorded, threshold not reached yet.
    Pending { count: usize },
    /// Recorded and this partial crossed the threshold. Returned once per accumulator.
    Enough,
    /// Recorded after the threshold was already crossed.
    AlreadyEnough,
}

/// Signatures the target chain needs, ordered by signer index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateSignature {
    pub digest: B256,
    pub signatures: Vec<PartialSignature>,
}

#[derive(Debug, Clone)]
pub struct MultiSignature {
    digest: B256,
    threshold: usize,
    partials: BTreeMap<u32, Vec<u8>>,
    enough_reported: bool,
}

impl MultiSignature {
    pub fn new(digest: B256, threshold: usize) -> Self {
        Self {
            digest,
            threshold,
            partials: BTreeMap::new(),
            enough_reported: false,
        }
    }

    pub fn digest(&self) -> &B256 {
        &self.digest
    }

    pub fn count(&self) -> usize {
        self.partials.len()
    }

    pub fn is_enough(&self) -> bool {
        self.partials.len() >= self.threshold
    }

    /// Records `partial`; re-processing the same index is a no-op.
    pub fn process(&mut self, partial: PartialSignature) -> MultiSignatureProgress {
        if self.partials.contains_key(&partial.index) {
            return MultiSignatureProgress::Duplicate;
        }
        self.partials.insert(partial.index, partial.signature);

        if !self.is_enough() {
            return MultiSignatureProgress::Pending {
                count: self.partials.len(),
            };
        }
        if self.enough_reported {
            return MultiSignatureProgress::AlreadyEnough;
        }
        self.enough_reported = true;
        MultiSignatureProgress::Enough
    }

    /// The first `threshold` signatures by index, once enough were collected.
    pub fn aggregate(&self) -> Option<AggregateSignature> {
        if !self.is_enough() {
            return None;
        }
        let signatures = self
            .partials
            .iter()
            .take(self.threshold)
            .map(|(index, signature)| PartialSignature {
                index: *index,
                signature: signature.clone(),
            })
            .collect();
        Some(AggregateSignature {
            digest: self.digest,
            signatures,
        })
    }
}

/// Local key share used to produce partial signatures.
#[async_trait::async_trait]
pub trait ReportSigner: Send + Sync + 'static {
    fn address(&self) -> Address;

    async fn sign_digest(&self, digest: &B256) -> Result<Vec<u8>, OracleError>;
}

pub struct EcdsaReportSigner {
    signer: PrivateKeySigner,
}

impl EcdsaReportSigner {
    pub fn new(signer: PrivateKeySigner) -> Self {
        Self { signer }
    }

    pub fn from_secret(secret: &str) -> Result<Self, OracleError> {
        let signer = secret
            .trim()
            .parse::<PrivateKeySigner>()
            .map_err(|e| OracleError::InvalidSignerSecret(e.to_string()))?;
        Ok(Self::new(signer))
    }
}

#[async_trait::async_trait]
impl ReportSigner for EcdsaReportSigner {
    fn address(&self) -> Address {
        self.signer.address()
    }

    async fn sign_digest(&self, digest: &B256) -> Result<Vec<u8>, OracleError> {
        let signature = self.signer.sign_hash(digest).await?;
        Ok(signature.as_bytes().to_vec())
    }
}
