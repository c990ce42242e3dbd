//! Node communication: the RPC gateway contract and the work template codec.

pub mod client;
pub mod template;

use async_trait::async_trait;
use thiserror::Error;

use crate::miner::Candidate;

pub use client::{ClientConfig, JsonRpcClient};
pub use template::{BlockHash, BlockTemplateResponse, TemplateError, TemplateId, WorkTemplate};

/// Errors returned by the node gateway.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcError {
    #[error("authentication rejected by node (HTTP {status})")]
    Auth { status: u16 },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("node error {code}: {message}")]
    Node { code: i64, message: String },

    #[error("failed to decode node response: {0}")]
    Decode(String),

    #[error("node rejected reward address: {0}")]
    InvalidAddress(String),

    #[error("invalid block template: {0}")]
    Template(#[from] TemplateError),
}

impl RpcError {
    /// Errors that retrying will not fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RpcError::Auth { .. } | RpcError::InvalidAddress(_))
    }
}

/// Result of handing a block to the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected(String),
}

/// Calls the miner makes against a full node.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Fetch fresh work. The returned template has revision zero.
    async fn get_template(&self) -> Result<WorkTemplate, RpcError>;

    /// Hash of the current chain tip.
    async fn get_tip_hash(&self) -> Result<BlockHash, RpcError>;

    /// Submit the block built from `template` with the candidate's nonces.
    async fn submit_block(
        &self,
        template: &WorkTemplate,
        candidate: &Candidate,
    ) -> Result<SubmitOutcome, RpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(RpcError::Auth { status: 401 }.is_fatal());
        assert!(RpcError::InvalidAddress("bad".into()).is_fatal());
        assert!(!RpcError::Timeout.is_fatal());
        assert!(!RpcError::Network("refused".into()).is_fatal());
        assert!(!RpcError::Node { code: -10, message: "IBD".into() }.is_fatal());
    }
}
