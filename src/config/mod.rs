use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::chain::ClientConfig;
use crate::orchestrator::calibration::MAX_ITERATIONS_PER_THREAD;
use crate::orchestrator::{IterationMode, OrchestratorConfig, RetryPolicy};

pub const MAX_THREADS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("miner.address is required")]
    EmptyAddress,
    #[error("miner.threads must be between 1 and {max}, got {0}", max = MAX_THREADS)]
    ThreadCount(usize),
    #[error("miner.iterations_per_thread must be at least 1")]
    ZeroIterations,
    #[error("miner.iterations_per_thread must be at most {max}, got {0}", max = MAX_ITERATIONS_PER_THREAD)]
    TooManyIterations(u64),
    #[error("miner.target_round_secs must be at least 1")]
    ZeroRoundTarget,
    #[error("miner.stale_check_interval_ms must be at least 1")]
    ZeroStaleCheck,
    #[error("rpc.port must not be 0")]
    ZeroPort,
    #[error("rpc.timeout_secs must be at least 1")]
    ZeroTimeout,
    #[error("retry.initial_delay_ms ({initial}) exceeds retry.max_delay_ms ({max})")]
    RetryDelays { initial: u64, max: u64 },
    #[error("retry.submit_attempts must be at least 1")]
    ZeroSubmitAttempts,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rpc: RpcConfig,
    pub miner: MinerConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    // Prefer VECO_RPC_PASSWORD over storing this in the file
    pub password: String,
    pub tls: bool,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    /// Reward address, resolved to a script by the node
    pub address: String,
    pub threads: usize,
    /// Fixed work per thread per round; unset means auto-calibrate
    pub iterations_per_thread: Option<u64>,
    pub target_round_secs: u64,
    pub stale_check_interval_ms: u64,
    /// Startup benchmark length; 0 disables it
    pub benchmark_millis: u64,
    pub stats_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub submit_attempts: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 26920,
            username: String::new(),
            password: String::new(),
            tls: false,
            timeout_secs: 30,
        }
    }
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            threads: num_cpus::get(),
            iterations_per_thread: None,
            target_round_secs: 30,
            stale_check_interval_ms: 2000,
            benchmark_millis: 2000,
            stats_interval_secs: 60,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            submit_attempts: 5,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.miner.address.trim().is_empty() {
            return Err(ConfigError::EmptyAddress);
        }
        if self.miner.threads == 0 || self.miner.threads > MAX_THREADS {
            return Err(ConfigError::ThreadCount(self.miner.threads));
        }
        match self.miner.iterations_per_thread {
            Some(0) => return Err(ConfigError::ZeroIterations),
            Some(n) if n > MAX_ITERATIONS_PER_THREAD => {
                return Err(ConfigError::TooManyIterations(n))
            }
            _ => {}
        }
        if self.miner.target_round_secs == 0 {
            return Err(ConfigError::ZeroRoundTarget);
        }
        if self.miner.stale_check_interval_ms == 0 {
            return Err(ConfigError::ZeroStaleCheck);
        }
        if self.rpc.port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if self.rpc.timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::RetryDelays {
                initial: self.retry.initial_delay_ms,
                max: self.retry.max_delay_ms,
            });
        }
        if self.retry.submit_attempts == 0 {
            return Err(ConfigError::ZeroSubmitAttempts);
        }
        Ok(())
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            host: self.rpc.host.clone(),
            port: self.rpc.port,
            username: self.rpc.username.clone(),
            password: self.rpc.password.clone(),
            tls: self.rpc.tls,
            timeout: Duration::from_secs(self.rpc.timeout_secs),
            address: self.miner.address.clone(),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let iterations = match self.miner.iterations_per_thread {
            Some(iterations) => IterationMode::Fixed(iterations),
            None => IterationMode::Auto,
        };
        let benchmark_duration =
            (self.miner.benchmark_millis > 0).then(|| Duration::from_millis(self.miner.benchmark_millis));

        OrchestratorConfig {
            threads: self.miner.threads,
            iterations,
            target_round_duration: Duration::from_secs(self.miner.target_round_secs),
            stale_check_interval: Duration::from_millis(self.miner.stale_check_interval_ms),
            benchmark_duration,
            stats_interval: Duration::from_secs(self.miner.stats_interval_secs),
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                submit_attempts: self.retry.submit_attempts,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut config = Config::default();
        config.miner.address = "VdMPvn7vUTSzbYjiMDs1jku9wAh1Ri2Y1A".to_string();
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.rpc.port, 26920);
        assert_eq!(config.rpc.timeout_secs, 30);
        assert_eq!(config.miner.target_round_secs, 30);
        assert_eq!(config.miner.iterations_per_thread, None);
        assert!(config.miner.threads >= 1);
        assert_eq!(config.validate(), Err(ConfigError::EmptyAddress));
        assert_eq!(valid().validate(), Ok(()));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veco.toml");

        let mut config = valid();
        config.miner.iterations_per_thread = Some(5000);
        config.rpc.tls = true;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(
            &path,
            "[rpc]\nusername = \"miner\"\n\n[miner]\naddress = \"Vabc\"\nthreads = 3\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.rpc.username, "miner");
        assert_eq!(config.rpc.port, 26920);
        assert_eq!(config.miner.threads, 3);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = valid();
        config.miner.threads = 0;
        assert_eq!(config.validate(), Err(ConfigError::ThreadCount(0)));

        let mut config = valid();
        config.miner.threads = MAX_THREADS + 1;
        assert!(matches!(config.validate(), Err(ConfigError::ThreadCount(_))));

        let mut config = valid();
        config.miner.iterations_per_thread = Some(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroIterations));

        let mut config = valid();
        config.miner.iterations_per_thread = Some(u64::MAX);
        assert_eq!(config.validate(), Err(ConfigError::TooManyIterations(u64::MAX)));

        let mut config = valid();
        config.miner.threads = MAX_THREADS;
        config.miner.iterations_per_thread = Some(MAX_ITERATIONS_PER_THREAD);
        assert_eq!(config.validate(), Ok(()));

        let mut config = valid();
        config.miner.target_round_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroRoundTarget));

        let mut config = valid();
        config.rpc.port = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroPort));

        let mut config = valid();
        config.rpc.timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroTimeout));

        let mut config = valid();
        config.retry.initial_delay_ms = 60_000;
        assert!(matches!(config.validate(), Err(ConfigError::RetryDelays { .. })));

        let mut config = valid();
        config.retry.submit_attempts = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroSubmitAttempts));
    }

    #[test]
    fn test_orchestrator_config_mapping() {
        let mut config = valid();
        config.miner.iterations_per_thread = Some(1000);
        config.miner.benchmark_millis = 0;

        let orch = config.orchestrator_config();
        assert_eq!(orch.iterations, IterationMode::Fixed(1000));
        assert_eq!(orch.benchmark_duration, None);
        assert_eq!(orch.target_round_duration, Duration::from_secs(30));
        assert_eq!(orch.retry.submit_attempts, 5);

        let client = config.client_config();
        assert_eq!(client.url(), "http://127.0.0.1:26920/");
        assert_eq!(client.address, config.miner.address);
    }
}
