use alloy::{primitives::Address, signers::local::PrivateKeySigner};
use std::{collections::HashMap, time::Duration};

use crate::{
    error::OracleError,
    utils::{validate_threshold, validate_window},
};

/// How the delay between retries grows with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * attempt`
    Linear,
    /// `base * attempt^2`
    Quadratic,
}

/// Per-chain consensus parameters.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub chain_id: String,
    /// Observations the leader needs before it may generate the report.
    pub observations_threshold: usize,
    /// Partial signatures the leader needs before it may transmit.
    pub partial_signatures_threshold: usize,
    /// Hex-encoded secp256k1 key this node signs reports with on this chain.
    pub signer_secret: String,
    /// Group key the target chain verifies the aggregate against.
    pub distributed_public_key: Vec<u8>,
    /// Signer address of every peer, in peer order.
    pub signers: Vec<Address>,
}

impl ChainConfig {
    pub fn builder(chain_id: impl Into<String>) -> ChainConfigBuilder {
        ChainConfigBuilder::new(chain_id)
    }

    pub fn signer(&self) -> Result<PrivateKeySigner, OracleError> {
        self.signer_secret
            .trim()
            .parse::<PrivateKeySigner>()
            .map_err(|e| OracleError::InvalidSignerSecret(e.to_string()))
    }

    /// Validate against the size of the peer set and the local position in it.
    pub fn validate(&self, peer_count: usize, local_index: u32) -> Result<(), OracleError> {
        if self.chain_id.is_empty() {
            return Err(OracleError::InvalidConfiguration(
                "chain_id must not be empty".to_string(),
            ));
        }
        validate_threshold("observations_threshold", self.observations_threshold, peer_count)?;
        validate_threshold(
            "partial_signatures_threshold",
            self.partial_signatures_threshold,
            peer_count,
        )?;
        if self.signers.len() != peer_count {
            return Err(OracleError::InvalidConfiguration(format!(
                "chain {} lists {} signers for {} peers",
                self.chain_id,
                self.signers.len(),
                peer_count
            )));
        }
        let signer = self.signer()?;
        if self.signers.get(local_index as usize) != Some(&signer.address()) {
            return Err(OracleError::InvalidConfiguration(format!(
                "signer secret of chain {} does not match signer #{local_index}",
                self.chain_id
            )));
        }
        Ok(())
    }
}

pub struct ChainConfigBuilder {
    config: ChainConfig,
}

impl ChainConfigBuilder {
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self {
            config: ChainConfig {
                chain_id: chain_id.into(),
                observations_threshold: 1,
                partial_signatures_threshold: 1,
                signer_secret: String::new(),
                distributed_public_key: Vec::new(),
                signers: Vec::new(),
            },
        }
    }

    pub fn with_observations_threshold(mut self, threshold: usize) -> Self {
        self.config.observations_threshold = threshold;
        self
    }

    pub fn with_partial_signatures_threshold(mut self, threshold: usize) -> Self {
        self.config.partial_signatures_threshold = threshold;
        self
    }

    pub fn with_signer_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.signer_secret = secret.into();
        self
    }

    pub fn with_distributed_public_key(mut self, key: Vec<u8>) -> Self {
        self.config.distributed_public_key = key;
        self
    }

    pub fn with_signers(mut self, signers: Vec<Address>) -> Self {
        self.config.signers = signers;
        self
    }

    /// Shape checks that do not need the peer set; the node re-validates on construction.
    pub fn validate(&self) -> Result<(), OracleError> {
        let peer_count = self.config.signers.len();
        validate_threshold(
            "observations_threshold",
            self.config.observations_threshold,
            peer_count,
        )?;
        validate_threshold(
            "partial_signatures_threshold",
            self.config.partial_signatures_threshold,
            peer_count,
        )?;
        self.config.signer()?;
        Ok(())
    }

    pub fn build(self) -> Result<ChainConfig, OracleError> {
        self.validate()?;
        Ok(self.config)
    }
}

/// Timer windows and retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Window of a round: observation collection, report receipt and transmit waits.
    pub observation_collect_timeout_window: Duration,
    /// How long to wait for the transmit transaction to be mined.
    pub check_request_end_timeout_window: Duration,
    /// Base delay of the retry provider.
    pub retry_timeout: Duration,
    /// Maximum retries of a step; `None` retries until success.
    pub retry_count: Option<u32>,
    pub retry_backoff: Backoff,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            observation_collect_timeout_window: Duration::from_secs(60),
            check_request_end_timeout_window: Duration::from_secs(180),
            retry_timeout: Duration::from_secs(60),
            retry_count: Some(3),
            retry_backoff: Backoff::Linear,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), OracleError> {
        validate_window(
            "observation_collect_timeout_window",
            self.observation_collect_timeout_window,
        )?;
        validate_window(
            "check_request_end_timeout_window",
            self.check_request_end_timeout_window,
        )?;
        validate_window("retry_timeout", self.retry_timeout)?;
        Ok(())
    }

    pub fn with_observation_collect_timeout_window(mut self, window: Duration) -> Self {
        self.observation_collect_timeout_window = window;
        self
    }

    pub fn with_check_request_end_timeout_window(mut self, window: Duration) -> Self {
        self.check_request_end_timeout_window = window;
        self
    }

    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = timeout;
        self
    }

    pub fn with_retry_timeout_minutes(self, minutes: u64) -> Self {
        self.with_retry_timeout(Duration::from_secs(minutes * 60))
    }

    pub fn with_retry_count(mut self, count: Option<u32>) -> Self {
        self.retry_count = count;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Backoff) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

/// Node-wide configuration.
#[derive(Debug, Clone, Default)]
pub struct OracleConfig {
    pub chains: HashMap<String, ChainConfig>,
    pub scheduler: SchedulerConfig,
    /// Expiry of persisted reports and data messages; requests never expire.
    pub record_ttl: Option<Duration>,
}

impl OracleConfig {
    pub fn builder() -> OracleConfigBuilder {
        OracleConfigBuilder::default()
    }

    pub fn chain(&self, chain_id: &str) -> Result<&ChainConfig, OracleError> {
        self.chains
            .get(chain_id)
            .ok_or_else(|| OracleError::UnknownChain(chain_id.to_string()))
    }

    pub fn validate(&self, peer_count: usize, local_index: u32) -> Result<(), OracleError> {
        if self.chains.is_empty() {
            return Err(OracleError::InvalidConfiguration(
                "at least one chain must be configured".to_string(),
            ));
        }
        for chain in self.chains.values() {
            chain.validate(peer_count, local_index)?;
        }
        self.scheduler.validate()
    }
}

#[derive(Default)]
pub struct OracleConfigBuilder {
    config: OracleConfig,
}

impl OracleConfigBuilder {
    pub fn with_chain(mut self, chain: ChainConfig) -> Self {
        self.config.chains.insert(chain.chain_id.clone(), chain);
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.config.scheduler = scheduler;
        self
    }

    pub fn with_record_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.config.record_ttl = ttl;
        self
    }

    pub fn build(self) -> Result<OracleConfig, OracleError> {
        if self.config.chains.is_empty() {
            return Err(OracleError::InvalidConfiguration(
                "at least one chain must be configured".to_string(),
            ));
        }
        self.config.scheduler.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(i: u8) -> String {
        format!("{:064x}", i as u64 + 1)
    }

    fn signers(n: u8) -> Vec<Address> {
        (0..n)
            .map(|i| secret(i).parse::<PrivateKeySigner>().unwrap().address())
            .collect()
    }

    #[test]
    fn chain_config_builds_and_validates() {
        let config = ChainConfig::builder("aelf")
            .with_observations_threshold(3)
            .with_partial_signatures_threshold(3)
            .with_signer_secret(secret(1))
            .with_signers(signers(4))
            .build()
            .unwrap();

        assert!(config.validate(4, 1).is_ok());
        // Secret belongs to peer 1, not peer 2.
        assert!(matches!(
            config.validate(4, 2),
            Err(OracleError::InvalidConfiguration(_))
        ));
        // Signer list must cover the whole peer set.
        assert!(config.validate(5, 1).is_err());
    }

    #[test]
    fn chain_config_rejects_bad_thresholds_and_secret() {
        let too_high = ChainConfig::builder("aelf")
            .with_observations_threshold(5)
            .with_signer_secret(secret(0))
            .with_signers(signers(4))
            .build();
        assert!(matches!(too_high, Err(OracleError::InvalidConfiguration(_))));

        let bad_secret = ChainConfig::builder("aelf")
            .with_signer_secret("not-a-key")
            .with_signers(signers(1))
            .build();
        assert!(matches!(bad_secret, Err(OracleError::InvalidSignerSecret(_))));
    }

    #[test]
    fn scheduler_config_rejects_zero_windows() {
        let config =
            SchedulerConfig::default().with_observation_collect_timeout_window(Duration::ZERO);
        assert!(config.validate().is_err());
        assert!(SchedulerConfig::default().validate().is_ok());
        assert_eq!(
            SchedulerConfig::default()
                .with_retry_timeout_minutes(2)
                .retry_timeout,
            Duration::from_secs(120)
        );
    }

    #[test]
    fn oracle_config_requires_a_chain() {
        assert!(OracleConfig::builder().build().is_err());
    }
}
