//! Configuration for the edge agent.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use edged_reconcile::BackoffPolicy;

use crate::engine::EngineConfig;
use crate::gc::GcPolicy;

/// Edge agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Node name; also the hostname given to containers.
    pub node_name: String,

    /// Docker daemon socket.
    pub docker_socket: PathBuf,

    /// Timeout for individual Docker API calls.
    pub docker_timeout: Duration,

    /// JSON file listing the pods desired on this node.
    pub manifest_path: PathBuf,

    /// How often the manifest is re-read and every pod re-synced.
    pub sync_interval: Duration,

    /// How often garbage collection runs.
    pub gc_interval: Duration,

    /// Garbage collection policy.
    pub gc: GcPolicy,

    /// Grace period when stopping containers.
    pub stop_grace_period: Duration,

    /// Start backoff.
    pub backoff: BackoffPolicy,

    /// Workers per pool (additions and removals each get this many).
    pub workers: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let node_name = lookup("EDGED_NODE_NAME")
            .or_else(|| lookup("HOSTNAME"))
            .unwrap_or_else(|| "localhost".to_string());

        let docker_socket = lookup("EDGED_DOCKER_SOCKET")
            .unwrap_or_else(|| "/var/run/docker.sock".to_string())
            .into();

        let manifest_path = lookup("EDGED_MANIFEST_PATH")
            .unwrap_or_else(|| "/etc/edged/pods.json".to_string())
            .into();

        let secs = |key: &str, default: u64| -> Result<Duration> {
            Ok(Duration::from_secs(parse_or(&lookup, key, default)?))
        };

        let gc = GcPolicy {
            min_age: secs("EDGED_GC_MIN_AGE", 60)?,
            max_per_pod_container: parse_or(&lookup, "EDGED_GC_MAX_PER_POD", 1)?,
            max_containers: parse_or(&lookup, "EDGED_GC_MAX_CONTAINERS", -1)?,
            max_concurrent_deletions: parse_or(&lookup, "EDGED_GC_CONCURRENCY", 4)?,
        };

        let backoff = BackoffPolicy {
            base: secs("EDGED_BACKOFF_BASE", 10)?,
            max: secs("EDGED_BACKOFF_MAX", 300)?,
        };

        let log_level = lookup("EDGED_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            node_name,
            docker_socket,
            docker_timeout: secs("EDGED_DOCKER_TIMEOUT", 120)?,
            manifest_path,
            sync_interval: secs("EDGED_SYNC_INTERVAL", 10)?,
            gc_interval: secs("EDGED_GC_INTERVAL", 60)?,
            gc,
            stop_grace_period: secs("EDGED_STOP_GRACE_PERIOD", 30)?,
            backoff,
            workers: parse_or(&lookup, "EDGED_WORKERS", 4)?,
            log_level,
        })
    }

    /// Settings for the container engine.
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            hostname: self.node_name.clone(),
            stop_grace_period: self.stop_grace_period,
            backoff: self.backoff.clone(),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value {:?} for {}", raw, key)),
        None => Ok(default),
    }
}
