pub mod engine;
pub mod hasher;
pub mod partition;
pub mod solution;
pub mod worker;

pub use engine::{BenchmarkReport, MiningEngine, RoundReport};
pub use hasher::{PowHasher, Sha256d};
pub use partition::{NonceRange, NoncePartitioner};
pub use solution::Candidate;
pub use worker::{RoundSignals, WorkerOutcome};
