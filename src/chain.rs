//! Collaborators the engine talks to outside the peer network.

use crate::{
    error::OracleError,
    protos::oracle::v1::{Request, TransmitPayload},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Mined,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub status: TransactionStatus,
    pub error: Option<String>,
}

impl TransactionResult {
    pub fn pending() -> Self {
        Self {
            status: TransactionStatus::Pending,
            error: None,
        }
    }

    pub fn mined() -> Self {
        Self {
            status: TransactionStatus::Mined,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TransactionStatus::Failed,
            error: Some(error.into()),
        }
    }
}

/// Target chain access.
#[async_trait::async_trait]
pub trait ChainClient: Send + Sync + 'static {
    /// Latest epoch the chain has started for oracle requests.
    async fn get_latest_round(&self, chain_id: &str) -> Result<u64, OracleError>;

    /// Job specification committed by the transaction that started the request.
    async fn get_commitment(
        &self,
        chain_id: &str,
        transaction_id: &str,
        request_id: &str,
    ) -> Result<Vec<u8>, OracleError>;

    /// Submits the signed report; returns the transaction id.
    async fn submit_transmit(
        &self,
        chain_id: &str,
        payload: TransmitPayload,
    ) -> Result<String, OracleError>;

    async fn get_transaction_result(
        &self,
        chain_id: &str,
        transaction_id: &str,
    ) -> Result<TransactionResult, OracleError>;
}

/// Produces this node's reading for a request.
#[async_trait::async_trait]
pub trait ObservationSource: Send + Sync + 'static {
    /// `Ok(None)` means nothing to contribute for this request right now.
    async fn observe(&self, request: &Request) -> Result<Option<i64>, OracleError>;
}
