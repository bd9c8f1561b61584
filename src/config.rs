//! TOML configuration for the sync service.
//!
//! Every field has a default, so an empty file is a valid configuration that
//! mirrors all topics of a broker on `localhost:1883` into `uns_graph.db`.

use serde::{Deserialize, Serialize};
use std::{fs::read_to_string, net::SocketAddr, path::Path, time::Duration};

use crate::{
    error::SyncError,
    mutation::{MutationBuilder, DEFAULT_NODE_TYPES},
    paths::{PathParser, DEFAULT_MAX_DEPTH, MULTI_LEVEL_WILDCARD, PATH_SEPARATOR, SINGLE_LEVEL_WILDCARD},
    payload::{PayloadRules, DEFAULT_TIMESTAMP_KEY, DEFAULT_VALUE_KEY},
    queue::BackpressurePolicy,
    retry::RetryPolicy,
};

pub const ENV_TRANSPORT_USERNAME: &str = "UNS_TRANSPORT_USERNAME";
pub const ENV_TRANSPORT_PASSWORD: &str = "UNS_TRANSPORT_PASSWORD";
pub const ENV_STORE_PATH: &str = "UNS_STORE_PATH";
const REDACTED: &str = "********";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub transport: TransportConfig,
    pub store: StoreConfig,
    pub retry: RetryConfig,
    pub ingest: IngestConfig,
    pub namespace: NamespaceConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    /// Generated as `uns-graph-sync-<uuid>` when absent.
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Subscription filters; `+` and `#` wildcards allowed.
    pub topics: Vec<String>,
    pub qos: u8,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            host: "localhost".to_string(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            topics: vec![MULTI_LEVEL_WILDCARD.to_string()],
            qos: 1,
            keep_alive_secs: 30,
            clean_session: true,
        }
    }
}

/// Graph store endpoint and session limits.
///
/// The endpoint is a SQLite file path. SQLite has no credentials, so there are
/// no store username or password fields; only the transport carries them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub path: String,
    pub pool_size: usize,
    pub acquire_timeout_ms: u64,
    pub probe_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            path: "uns_graph.db".to_string(),
            pool_size: 4,
            acquire_timeout_ms: 5_000,
            probe_interval_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        RetryConfig {
            base_delay_ms: policy.base_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            max_attempts: policy.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureKind {
    #[default]
    BoundedWait,
    DropOldest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    pub queue_capacity: usize,
    pub backpressure: BackpressureKind,
    /// Only used by `bounded_wait`.
    pub enqueue_timeout_ms: u64,
    pub workers: usize,
    pub shutdown_timeout_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            queue_capacity: 1_024,
            backpressure: BackpressureKind::BoundedWait,
            enqueue_timeout_ms: 1_000,
            workers: 4,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl IngestConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NamespaceConfig {
    pub max_depth: usize,
    /// Node type label per depth, root first.
    pub node_types: Vec<String>,
    pub value_key: String,
    pub timestamp_key: String,
    pub ignored_attributes: Vec<String>,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        NamespaceConfig {
            max_depth: DEFAULT_MAX_DEPTH,
            node_types: DEFAULT_NODE_TYPES.iter().map(|t| t.to_string()).collect(),
            value_key: DEFAULT_VALUE_KEY.to_string(),
            timestamp_key: DEFAULT_TIMESTAMP_KEY.to_string(),
            ignored_attributes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            enabled: true,
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl SyncConfig {
    /// Read, apply environment overrides and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<SyncConfig, SyncError> {
        tracing::debug!("Reading configuration from {:?}", path.as_ref());
        let content = read_to_string(path.as_ref()).map_err(|e| {
            SyncError::Config(format!("cannot read {:?}: {e}", path.as_ref()))
        })?;
        let mut config = SyncConfig::from_toml_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<SyncConfig, SyncError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, SyncError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Empty values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(username) = lookup(ENV_TRANSPORT_USERNAME) {
            self.transport.username = Some(username);
        }
        if let Some(password) = lookup(ENV_TRANSPORT_PASSWORD) {
            tracing::debug!("Using transport password from {ENV_TRANSPORT_PASSWORD}");
            self.transport.password = Some(password);
        }
        if let Some(path) = lookup(ENV_STORE_PATH) {
            self.store.path = path;
        }
    }

    /// Copy with secrets masked, safe to print or log.
    pub fn redacted(&self) -> SyncConfig {
        let mut config = self.clone();
        if config.transport.password.is_some() {
            config.transport.password = Some(REDACTED.to_string());
        }
        config
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        let invalid = |msg: String| Err(SyncError::Config(msg));

        if self.transport.host.trim().is_empty() {
            return invalid("transport.host must not be empty".to_string());
        }
        if self.transport.port == 0 {
            return invalid("transport.port must not be 0".to_string());
        }
        if self.transport.qos > 2 {
            return invalid(format!("transport.qos must be 0, 1 or 2, got {}", self.transport.qos));
        }
        if self.transport.topics.is_empty() {
            return invalid("transport.topics must list at least one filter".to_string());
        }
        for filter in self.transport.topics.iter() {
            check_filter(filter)?;
        }
        if self.transport.username.is_none() && self.transport.password.is_some() {
            return invalid("transport.password requires transport.username".to_string());
        }

        if self.store.path.trim().is_empty() {
            return invalid("store.path must not be empty".to_string());
        }
        if self.store.pool_size == 0 {
            return invalid("store.pool_size must be at least 1".to_string());
        }
        if self.store.probe_interval_ms == 0 {
            return invalid("store.probe_interval_ms must be at least 1".to_string());
        }

        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return invalid(format!(
                "retry.multiplier must be a finite number >= 1.0, got {}",
                self.retry.multiplier
            ));
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return invalid("retry.max_delay_ms must not be below retry.base_delay_ms".to_string());
        }

        if self.ingest.queue_capacity == 0 {
            return invalid("ingest.queue_capacity must be at least 1".to_string());
        }
        if self.ingest.workers == 0 {
            return invalid("ingest.workers must be at least 1".to_string());
        }

        if self.namespace.max_depth == 0 {
            return invalid("namespace.max_depth must be at least 1".to_string());
        }
        if self.namespace.node_types.is_empty() {
            return invalid("namespace.node_types must list at least one label".to_string());
        }
        if self.namespace.value_key == self.namespace.timestamp_key {
            return invalid(format!(
                "namespace.value_key and namespace.timestamp_key are both '{}'",
                self.namespace.value_key
            ));
        }

        if self.health.enabled {
            self.health_addr()?;
        }
        Ok(())
    }

    pub fn health_addr(&self) -> Result<SocketAddr, SyncError> {
        self.health.bind.parse().map_err(|e| {
            SyncError::Config(format!("health.bind '{}' is not an address: {e}", self.health.bind))
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry.base_delay_ms),
            self.retry.multiplier,
            Duration::from_millis(self.retry.max_delay_ms),
            self.retry.max_attempts,
        )
    }

    pub fn backpressure_policy(&self) -> BackpressurePolicy {
        match self.ingest.backpressure {
            BackpressureKind::BoundedWait => BackpressurePolicy::BoundedWait {
                timeout: Duration::from_millis(self.ingest.enqueue_timeout_ms),
            },
            BackpressureKind::DropOldest => BackpressurePolicy::DropOldest,
        }
    }

    pub fn path_parser(&self) -> PathParser {
        PathParser::new(self.namespace.max_depth)
    }

    pub fn payload_rules(&self) -> PayloadRules {
        PayloadRules {
            value_key: self.namespace.value_key.clone(),
            timestamp_key: self.namespace.timestamp_key.clone(),
            ignored_attributes: self.namespace.ignored_attributes.clone(),
        }
    }

    pub fn mutation_builder(&self) -> MutationBuilder {
        MutationBuilder::new(self.namespace.node_types.clone())
    }
}

/// A subscription filter: non-empty levels, `+` alone in its level, `#` alone
/// and last.
fn check_filter(filter: &str) -> Result<(), SyncError> {
    let invalid = |why: &str| Err(SyncError::Config(format!("topic filter '{filter}' {why}")));
    if filter.is_empty() {
        return invalid("is empty");
    }
    let levels = filter.split(PATH_SEPARATOR).collect::<Vec<_>>();
    for (idx, level) in levels.iter().enumerate() {
        if level.contains(MULTI_LEVEL_WILDCARD)
            && (*level != MULTI_LEVEL_WILDCARD || idx + 1 != levels.len())
        {
            return invalid("may only use '#' as the whole last level");
        }
        if level.contains(SINGLE_LEVEL_WILDCARD) && *level != SINGLE_LEVEL_WILDCARD {
            return invalid("may only use '+' as a whole level");
        }
    }
    Ok(())
}
