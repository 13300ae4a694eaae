//! Server configuration, read once at startup.

use crate::Result;
use crate::error::{ConfigError, Error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Which properties an UPDATE writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Only loaded properties whose value differs from the old-values snapshot.
    #[default]
    ChangedOnly,
    /// Every loaded, updatable property.
    AllLoaded,
}

/// How UPDATE/DELETE detect concurrent modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyMode {
    /// Compare (and bump) the version column. Types without one fall back to `None`.
    #[default]
    Version,
    /// Compare every loaded property against its old value.
    AllProperties,
    /// No optimistic check beyond the id.
    None,
}

/// Caching behaviour for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Cache beans by id.
    pub bean_cache: bool,
    /// Cache query results for this type.
    pub query_cache: bool,
    /// Hand out shared snapshots instead of per-retrieval copies.
    pub read_only: bool,
    /// Maximum entries per cache region; 0 means unbounded.
    pub max_size: usize,
    /// Drop entries not accessed for this long; 0 disables.
    pub max_idle_ms: u64,
    /// Drop entries older than this; 0 disables.
    pub max_ttl_ms: u64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            bean_cache: false,
            query_cache: false,
            read_only: false,
            max_size: 10_000,
            max_idle_ms: 600_000,  // 10 minutes
            max_ttl_ms: 3_600_000, // 1 hour
        }
    }
}

impl CachePolicy {
    /// Caching disabled.
    pub fn none() -> Self {
        Self::default()
    }

    /// Bean and query caching enabled with default limits.
    pub fn cached() -> Self {
        Self {
            bean_cache: true,
            query_cache: true,
            ..Self::default()
        }
    }

    pub fn bean_cache(mut self, enabled: bool) -> Self {
        self.bean_cache = enabled;
        self
    }

    pub fn query_cache(mut self, enabled: bool) -> Self {
        self.query_cache = enabled;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn max_size(mut self, n: usize) -> Self {
        self.max_size = n;
        self
    }

    pub fn max_idle(mut self, ms: u64) -> Self {
        self.max_idle_ms = ms;
        self
    }

    pub fn max_ttl(mut self, ms: u64) -> Self {
        self.max_ttl_ms = ms;
        self
    }

    pub fn idle_limit(&self) -> Option<Duration> {
        (self.max_idle_ms > 0).then(|| Duration::from_millis(self.max_idle_ms))
    }

    pub fn ttl_limit(&self) -> Option<Duration> {
        (self.max_ttl_ms > 0).then(|| Duration::from_millis(self.max_ttl_ms))
    }

    pub fn is_cached(&self) -> bool {
        self.bean_cache || self.query_cache
    }
}

/// Server-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Default lazy-load batch size, before rounding to a canonical size.
    pub lazy_batch_size: usize,
    /// Pending lazy-load requests kept per batch key before the oldest are dropped.
    pub max_pending_lazy: usize,
    pub update_policy: UpdatePolicy,
    pub concurrency_mode: ConcurrencyMode,
    /// Worker threads for background queries.
    pub background_workers: usize,
    /// Generated statements kept per server.
    pub statement_cache_capacity: usize,
    /// Cache policy for entity types without an override or descriptor policy.
    pub default_cache: CachePolicy,
    /// Per-entity cache policy overrides, keyed by entity name.
    pub entity_cache: HashMap<String, CachePolicy>,
    /// Single-id lazy loads per key before an N+1 warning is logged; 0 disables.
    pub n1_warn_threshold: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            lazy_batch_size: 20,
            max_pending_lazy: 1_000,
            update_policy: UpdatePolicy::ChangedOnly,
            concurrency_mode: ConcurrencyMode::Version,
            background_workers: 4,
            statement_cache_capacity: 1_000,
            default_cache: CachePolicy::none(),
            entity_cache: HashMap::new(),
            n1_warn_threshold: 10,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ServerConfig = serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid server config: {e}"),
                source: Some(Box::new(e)),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| {
            Err(Error::Config(ConfigError {
                message: message.to_string(),
                source: None,
            }))
        };
        if self.lazy_batch_size == 0 {
            return fail("lazy_batch_size must be at least 1");
        }
        if self.max_pending_lazy == 0 {
            return fail("max_pending_lazy must be at least 1");
        }
        if self.background_workers == 0 {
            return fail("background_workers must be at least 1");
        }
        if self.statement_cache_capacity == 0 {
            return fail("statement_cache_capacity must be at least 1");
        }
        Ok(())
    }

    pub fn lazy_batch_size(mut self, n: usize) -> Self {
        self.lazy_batch_size = n;
        self
    }

    pub fn max_pending_lazy(mut self, n: usize) -> Self {
        self.max_pending_lazy = n;
        self
    }

    pub fn update_policy(mut self, policy: UpdatePolicy) -> Self {
        self.update_policy = policy;
        self
    }

    pub fn concurrency_mode(mut self, mode: ConcurrencyMode) -> Self {
        self.concurrency_mode = mode;
        self
    }

    pub fn background_workers(mut self, n: usize) -> Self {
        self.background_workers = n;
        self
    }

    pub fn statement_cache_capacity(mut self, n: usize) -> Self {
        self.statement_cache_capacity = n;
        self
    }

    pub fn default_cache(mut self, policy: CachePolicy) -> Self {
        self.default_cache = policy;
        self
    }

    /// Override the cache policy of one entity type.
    pub fn entity_cache(mut self, entity: impl Into<String>, policy: CachePolicy) -> Self {
        self.entity_cache.insert(entity.into(), policy);
        self
    }

    pub fn n1_warn_threshold(mut self, n: usize) -> Self {
        self.n1_warn_threshold = n;
        self
    }

    /// Effective cache policy: config override, then descriptor policy, then default.
    pub fn cache_policy_for(&self, entity: &str, declared: Option<&CachePolicy>) -> CachePolicy {
        self.entity_cache
            .get(entity)
            .or(declared)
            .unwrap_or(&self.default_cache)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = ServerConfig::from_json(
            r#"{
                "lazy_batch_size": 50,
                "update_policy": "all_loaded",
                "concurrency_mode": "all_properties",
                "entity_cache": { "customer": { "bean_cache": true, "read_only": true } }
            }"#,
        )
        .unwrap();
        assert_eq!(config.lazy_batch_size, 50);
        assert_eq!(config.update_policy, UpdatePolicy::AllLoaded);
        assert_eq!(config.concurrency_mode, ConcurrencyMode::AllProperties);
        assert_eq!(config.background_workers, 4);
        let customer = config.cache_policy_for("customer", None);
        assert!(customer.bean_cache && customer.read_only);
        assert_eq!(customer.max_size, 10_000);
    }

    #[test]
    fn test_validation_rejects_zero() {
        assert!(matches!(
            ServerConfig::from_json(r#"{ "lazy_batch_size": 0 }"#),
            Err(Error::Config(_))
        ));
        assert!(ServerConfig::new().background_workers(0).validate().is_err());
        assert!(ServerConfig::new().statement_cache_capacity(0).validate().is_err());
        assert!(ServerConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_cache_policy_resolution() {
        let declared = CachePolicy::cached().max_size(5);
        let config = ServerConfig::new().entity_cache("order", CachePolicy::none());
        assert!(!config.cache_policy_for("order", Some(&declared)).bean_cache);
        assert_eq!(config.cache_policy_for("line", Some(&declared)).max_size, 5);
        assert!(!config.cache_policy_for("line", None).is_cached());
    }
}
