use anyhow::{Context, Result};
use ripple_common::FeedLimits;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;

// Node service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Number of shards (one publisher each) of the demo table.
    pub shards: u32,
    // Local consumers subscribed to the demo table.
    pub consumers: usize,
    // Delay between synthetic writes.
    pub write_interval_ms: u64,
    // Bound of each local subscriber queue.
    pub subscriber_queue_capacity: usize,
    // Bound of each transport mailbox.
    pub mailbox_capacity: usize,
    // Max frame size accepted by the transport.
    pub max_frame_bytes: usize,
}

const DEFAULT_SHARDS: u32 = 4;
const DEFAULT_CONSUMERS: usize = 2;
const DEFAULT_WRITE_INTERVAL_MS: u64 = 250;

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct NodeConfigOverride {
    metrics_bind: Option<String>,
    shards: Option<u32>,
    consumers: Option<usize>,
    write_interval_ms: Option<u64>,
    subscriber_queue_capacity: Option<usize>,
    mailbox_capacity: Option<usize>,
    max_frame_bytes: Option<usize>,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        let limits = FeedLimits::default();
        let metrics_bind = std::env::var("RIPPLE_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse RIPPLE_METRICS_BIND")?;
        let shards = read_env("RIPPLE_SHARDS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_SHARDS);
        // Zero consumers is allowed: the writer then runs against an empty feed set.
        let consumers = read_env("RIPPLE_CONSUMERS").unwrap_or(DEFAULT_CONSUMERS);
        let write_interval_ms = read_env("RIPPLE_WRITE_INTERVAL_MS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_WRITE_INTERVAL_MS);
        let subscriber_queue_capacity = read_env("RIPPLE_SUBSCRIBER_QUEUE_CAPACITY")
            .filter(|value| *value > 0)
            .unwrap_or(limits.subscriber_queue_capacity);
        let mailbox_capacity = read_env("RIPPLE_MAILBOX_CAPACITY")
            .filter(|value| *value > 0)
            .unwrap_or(limits.mailbox_capacity);
        let max_frame_bytes = read_env("RIPPLE_MAX_FRAME_BYTES")
            .filter(|value| *value > 0)
            .unwrap_or(limits.max_frame_bytes);
        Ok(Self {
            metrics_bind,
            shards,
            consumers,
            write_interval_ms,
            subscriber_queue_capacity,
            mailbox_capacity,
            max_frame_bytes,
        })
    }

    /// Environment first, then the YAML file at `config_path` or `RIPPLE_NODE_CONFIG`.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env()?;
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("RIPPLE_NODE_CONFIG").ok());
        if let Some(path) = override_path {
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read node config: {path}"))?;
            let override_cfg: NodeConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse node config yaml")?;
            override_cfg.apply(&mut config)?;
        }
        config.limits().validate().context("validate node config")?;
        Ok(config)
    }

    pub fn limits(&self) -> FeedLimits {
        FeedLimits {
            subscriber_queue_capacity: self.subscriber_queue_capacity,
            mailbox_capacity: self.mailbox_capacity,
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

impl NodeConfigOverride {
    fn apply(self, config: &mut NodeConfig) -> Result<()> {
        if let Some(value) = self.metrics_bind {
            config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = self.shards
            && value > 0
        {
            config.shards = value;
        }
        if let Some(value) = self.consumers {
            config.consumers = value;
        }
        if let Some(value) = self.write_interval_ms
            && value > 0
        {
            config.write_interval_ms = value;
        }
        if let Some(value) = self.subscriber_queue_capacity
            && value > 0
        {
            config.subscriber_queue_capacity = value;
        }
        if let Some(value) = self.mailbox_capacity
            && value > 0
        {
            config.mailbox_capacity = value;
        }
        if let Some(value) = self.max_frame_bytes
            && value > 0
        {
            config.max_frame_bytes = value;
        }
        Ok(())
    }
}

fn read_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
}
