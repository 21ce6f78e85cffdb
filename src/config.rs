use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PyplnError, Result};

/// Longest period accepted for a timer, so deadlines never overflow.
pub const MAX_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Turn a seconds value from the wire or the command line into a timer
/// period, rejecting anything not in `(0, MAX_INTERVAL]`.
pub fn interval_from_secs(name: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|period| !period.is_zero() && *period <= MAX_INTERVAL)
        .ok_or_else(|| {
            PyplnError::Config(format!(
                "{} must be more than 0 and at most {} seconds, got {}",
                name,
                MAX_INTERVAL.as_secs(),
                secs
            ))
        })
}

/// Connection parameters for the file-backed document store.
///
/// Handed to every broker inside [`Configuration`], so all hosts must see the
/// same `path` (a shared or network mount when brokers run on several hosts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
    #[serde(rename = "documents collection")]
    pub documents_collection: String,
    #[serde(rename = "blobs collection")]
    pub blobs_collection: String,
    #[serde(rename = "monitoring collection")]
    pub monitoring_collection: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pypln-data"),
            documents_collection: "documents".to_string(),
            blobs_collection: "files".to_string(),
            monitoring_collection: "monitoring".to_string(),
        }
    }
}

/// Configuration object served by the manager on `get configuration`.
///
/// Immutable for a broker's lifetime; re-fetched only on restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub store: StoreConfig,
    /// Seconds between two monitoring snapshots.
    #[serde(rename = "monitoring interval")]
    pub monitoring_interval: f64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            monitoring_interval: 60.0,
        }
    }
}

impl Configuration {
    pub fn monitoring_interval(&self) -> Result<Duration> {
        interval_from_secs("monitoring interval", self.monitoring_interval)
    }
}

/// How the manager treats jobs handed out but never reported back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// An assigned job is never handed out again.
    #[default]
    AtMostOnce,
    /// An assigned job without a completion after `redeliver_after` goes back
    /// to the front of the queue.
    AtLeastOnce { redeliver_after: Duration },
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub api_addr: SocketAddr,
    pub broadcast_addr: SocketAddr,
    pub configuration: Configuration,
    pub delivery: DeliveryMode,
    pub max_jobs: usize,
    pub sweep_interval_ms: u64,
    /// How long completed jobs are remembered so duplicate completions are
    /// acknowledged without a second broadcast.
    pub finished_retention_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            api_addr: SocketAddr::from(([127, 0, 0, 1], 5555)),
            broadcast_addr: SocketAddr::from(([127, 0, 0, 1], 5556)),
            configuration: Configuration::default(),
            delivery: DeliveryMode::default(),
            max_jobs: 10_000,
            sweep_interval_ms: 1_000,
            finished_retention_secs: 600,
        }
    }
}

impl ManagerConfig {
    pub fn new(api_addr: SocketAddr, broadcast_addr: SocketAddr) -> Self {
        Self {
            api_addr,
            broadcast_addr,
            ..Default::default()
        }
    }

    pub fn with_configuration(mut self, configuration: Configuration) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_sweep_interval_ms(mut self, sweep_interval_ms: u64) -> Self {
        self.sweep_interval_ms = sweep_interval_ms;
        self
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn finished_retention(&self) -> Duration {
        Duration::from_secs(self.finished_retention_secs)
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Upper bound on concurrently running worker processes.
    pub max_concurrency: usize,
    /// Sleep between two supervisor iterations.
    pub poll_interval_ms: u64,
    /// Time a worker gets to exit after SIGTERM before it is killed.
    pub kill_grace_ms: u64,
    /// Extra attempts for a completion notice that failed in transport.
    pub notify_retries: u32,
    pub notify_retry_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_concurrency(),
            poll_interval_ms: 50,
            kill_grace_ms: 500,
            notify_retries: 3,
            notify_retry_delay_ms: 100,
        }
    }
}

impl BrokerConfig {
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 || self.poll_interval() > MAX_INTERVAL {
            return Err(PyplnError::Config(format!(
                "poll interval must be more than 0 and at most {} ms, got {}",
                MAX_INTERVAL.as_millis(),
                self.poll_interval_ms
            )));
        }
        Ok(())
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Bounded wait on the broadcast channel per loop iteration.
    pub poll_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 100,
        }
    }
}

impl PipelineConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Number of CPU cores on this host, at least 1.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
