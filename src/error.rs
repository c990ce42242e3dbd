use thiserror::Error;

use crate::chain::{RpcError, TemplateError, TemplateId};

/// Errors that stop the mining loop.
#[derive(Debug, Error)]
pub enum MinerError {
    /// The node rejected us in a way that retrying cannot fix
    #[error("fatal RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// Every work index of the template has been handed out
    #[error("search space exhausted for template {template}")]
    SearchSpaceExhausted { template: TemplateId },

    /// Locally built work could not be assembled
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    /// The worker thread pool could not be built
    #[error("worker pool error: {0}")]
    WorkerPool(String),
}
