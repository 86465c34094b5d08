use envconfig::Envconfig;
use std::net::SocketAddr;
use std::time::Duration;
use validator::Validate;

use crate::error::Result;

#[derive(Debug, Envconfig, Validate, Clone)]
pub struct Config {
    /// Server bind address
    #[envconfig(from = "BIND_ADDR", default = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Seconds between idle sweeps of the bucket store
    #[envconfig(from = "SWEEP_INTERVAL_SECS", default = "300")]
    #[validate(range(min = 1))]
    pub sweep_interval_secs: u64,

    /// Seconds without an admitted request before a bucket is evicted
    #[envconfig(from = "IDLE_THRESHOLD_SECS", default = "900")]
    #[validate(range(min = 1))]
    pub idle_threshold_secs: u64,

    /// Log level for the admission crate when RUST_LOG is unset
    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    /// Wrap the router in an HTTP trace layer
    #[envconfig(from = "ENABLE_TRACING", default = "true")]
    pub enable_tracing: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Config::init_from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            sweep_interval_secs: 300,
            idle_threshold_secs: 900,
            log_level: "info".to_string(),
            enable_tracing: true,
        }
    }
}
