use alloy::primitives::SignatureError;

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("Mismatched length: expected {expect}, actual {actual}")]
    MismatchedLength { expect: usize, actual: usize },

    #[error("Request not found")]
    RequestNotFound,
    #[error("Unknown chain: {0}")]
    UnknownChain(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Invalid signer secret: {0}")]
    InvalidSignerSecret(String),

    #[error("Invalid peer index {index} for a peer set of {peer_count}")]
    InvalidPeerIndex { index: u32, peer_count: usize },
    #[error("Peer message carries no body")]
    EmptyMessageBody,
    #[error("Peer message addressed from the local node")]
    SelfMessage,

    #[error("Empty signature")]
    EmptySignature,
    #[error("Invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),
    #[error("Failed to sign report digest: {0}")]
    FailedToSignMessage(#[from] alloy_signer::Error),

    #[error("Failed to decode record: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("Storage failure: {0}")]
    Storage(String),
    #[error("Chain call failed: {0}")]
    Chain(String),
    #[error("Transport failure: {0}")]
    Transport(String),
    #[error("Observation source failed: {0}")]
    ObservationSource(String),

    #[error("Failed to get current time")]
    FailedToGetCurrentTime(#[from] std::time::SystemTimeError),
}
