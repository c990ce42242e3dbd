// Library exports for veco_miner

pub mod chain;
pub mod config;
pub mod error;
pub mod miner;
pub mod orchestrator;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use chain::{JsonRpcClient, NodeRpc};
pub use error::MinerError;
pub use orchestrator::{MiningOrchestrator, OrchestratorConfig};
