//! Configuration module
//!
//! This module defines the platform configuration: connection string, pool
//! bounds, cache settings, feature toggles and backup settings. Values are
//! layered as defaults, then `config.toml`, then environment variables.

pub mod storage;

use crate::error::{Result, TenantForgeError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Connection pool settings shared by every module pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Connections kept open per pool
    pub min: u32,
    /// Upper bound of connections per pool
    pub max: u32,
    /// How long `acquire()` waits before `ConnectionAcquireTimeout`
    pub acquire_timeout_ms: u64,
    /// Idle connections are closed after this long
    pub idle_timeout_ms: u64,
    /// Engine-side statement timeout
    pub statement_timeout_ms: u64,
    /// Period of the background health check
    pub health_check_interval_ms: u64,
    /// A health check slower than this counts as a failure
    pub unhealthy_latency_ms: u64,
    /// Consecutive failed checks before a pool is marked unhealthy
    pub unhealthy_after_failures: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min: 2,
            max: 10,
            acquire_timeout_ms: 30_000,
            idle_timeout_ms: 600_000,
            statement_timeout_ms: 30_000,
            health_check_interval_ms: 30_000,
            unhealthy_latency_ms: 1_000,
            unhealthy_after_failures: 3,
        }
    }
}

/// Cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Remote store URL (`redis://...`); the in-process store is used when absent
    pub url: Option<String>,
    /// Default entry TTL in seconds
    pub default_ttl_secs: u64,
    /// `maxmemory-policy` applied to the remote store at startup
    pub max_memory_policy: String,
    /// Prefix applied to every remote key
    pub key_prefix: String,
    /// Remote payloads above this many bytes are gzip-compressed
    pub compression_threshold: usize,
    /// Maximum number of entries in the local level
    pub local_capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            url: None,
            default_ttl_secs: 300,
            max_memory_policy: "allkeys-lru".to_string(),
            key_prefix: "tf:".to_string(),
            compression_threshold: 1024,
            local_capacity: 1000,
        }
    }
}

/// Feature toggles for the optional subsystems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureToggles {
    pub migrations: bool,
    pub isolation: bool,
    pub caching: bool,
    pub security: bool,
    pub backup: bool,
    pub partitioning: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            migrations: true,
            isolation: true,
            caching: true,
            security: true,
            backup: true,
            partitioning: true,
        }
    }
}

/// Backup settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Directory receiving backup artifacts
    pub directory: PathBuf,
    /// Backups older than this are pruned
    pub retention_days: u32,
    /// Gzip artifacts after the dump
    pub compress: bool,
    /// Re-read and checksum each artifact right after writing it
    pub verify_after_backup: bool,
    /// Dump utility (`pg_dump`)
    pub dump_command: String,
    /// SQL client used for incremental export and restore (`psql`)
    pub restore_command: String,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("backups"),
            retention_days: 30,
            compress: true,
            verify_after_backup: true,
            dump_command: "pg_dump".to_string(),
            restore_command: "psql".to_string(),
        }
    }
}

/// Isolation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationSettings {
    /// Table every tenant column references
    pub organization_table: String,
    /// Role granted the RLS bypass policy
    pub service_role: String,
}

impl Default for IsolationSettings {
    fn default() -> Self {
        Self {
            organization_table: "public.organizations".to_string(),
            service_role: "platform_service".to_string(),
        }
    }
}

/// Complete platform configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// PostgreSQL connection string
    pub database_url: String,
    pub pool: PoolSettings,
    pub cache: CacheSettings,
    pub features: FeatureToggles,
    /// Root directory holding one migrations folder per module
    pub migrations_dir: PathBuf,
    pub backup: BackupSettings,
    pub isolation: IsolationSettings,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            pool: PoolSettings::default(),
            cache: CacheSettings::default(),
            features: FeatureToggles::default(),
            migrations_dir: PathBuf::from("migrations"),
            backup: BackupSettings::default(),
            isolation: IsolationSettings::default(),
        }
    }
}

impl PlatformConfig {
    /// Build the configuration from `config.toml` (if present) and the
    /// process environment, including a `.env` file in the working directory.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = storage::load()?.unwrap_or_default();
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values found through `lookup` (normally the environment)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.cache.url = Some(url);
        }

        override_parsed(&lookup, "TENANT_FORGE_POOL_MIN", &mut self.pool.min)?;
        override_parsed(&lookup, "TENANT_FORGE_POOL_MAX", &mut self.pool.max)?;
        override_parsed(
            &lookup,
            "TENANT_FORGE_POOL_ACQUIRE_TIMEOUT_MS",
            &mut self.pool.acquire_timeout_ms,
        )?;
        override_parsed(
            &lookup,
            "TENANT_FORGE_POOL_IDLE_TIMEOUT_MS",
            &mut self.pool.idle_timeout_ms,
        )?;
        override_parsed(
            &lookup,
            "TENANT_FORGE_STATEMENT_TIMEOUT_MS",
            &mut self.pool.statement_timeout_ms,
        )?;

        override_parsed(&lookup, "TENANT_FORGE_CACHE_DEFAULT_TTL", &mut self.cache.default_ttl_secs)?;
        override_parsed(
            &lookup,
            "TENANT_FORGE_CACHE_COMPRESSION_THRESHOLD",
            &mut self.cache.compression_threshold,
        )?;
        if let Some(prefix) = lookup("TENANT_FORGE_CACHE_KEY_PREFIX") {
            self.cache.key_prefix = prefix;
        }
        if let Some(policy) = lookup("TENANT_FORGE_CACHE_MAX_MEMORY_POLICY") {
            self.cache.max_memory_policy = policy;
        }

        override_parsed(&lookup, "TENANT_FORGE_FEATURE_MIGRATIONS", &mut self.features.migrations)?;
        override_parsed(&lookup, "TENANT_FORGE_FEATURE_ISOLATION", &mut self.features.isolation)?;
        override_parsed(&lookup, "TENANT_FORGE_FEATURE_CACHING", &mut self.features.caching)?;
        override_parsed(&lookup, "TENANT_FORGE_FEATURE_SECURITY", &mut self.features.security)?;
        override_parsed(&lookup, "TENANT_FORGE_FEATURE_BACKUP", &mut self.features.backup)?;
        override_parsed(
            &lookup,
            "TENANT_FORGE_FEATURE_PARTITIONING",
            &mut self.features.partitioning,
        )?;

        if let Some(dir) = lookup("TENANT_FORGE_MIGRATIONS_DIR") {
            self.migrations_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("TENANT_FORGE_BACKUP_DIR") {
            self.backup.directory = PathBuf::from(dir);
        }
        override_parsed(
            &lookup,
            "TENANT_FORGE_BACKUP_RETENTION_DAYS",
            &mut self.backup.retention_days,
        )?;

        Ok(())
    }

    /// Reject configurations the platform cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(TenantForgeError::Config(
                "database_url is required (set DATABASE_URL)".to_string(),
            ));
        }
        if self.pool.max == 0 {
            return Err(TenantForgeError::Config("pool.max must be > 0".to_string()));
        }
        if self.pool.min > self.pool.max {
            return Err(TenantForgeError::Config(format!(
                "pool.min ({}) must not exceed pool.max ({})",
                self.pool.min, self.pool.max
            )));
        }
        if self.cache.default_ttl_secs == 0 {
            return Err(TenantForgeError::Config(
                "cache.default_ttl_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, name: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| TenantForgeError::Config(format!("{} has an invalid value: {}", name, raw)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PlatformConfig::default();
        assert_eq!(config.pool.max, 10);
        assert!(config.features.caching);
        assert_eq!(config.cache.key_prefix, "tf:");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = PlatformConfig::default();
        config
            .apply_overrides(lookup_from(&[
                ("DATABASE_URL", "postgres://localhost/platform"),
                ("TENANT_FORGE_POOL_MIN", "1"),
                ("TENANT_FORGE_POOL_MAX", "1"),
                ("TENANT_FORGE_FEATURE_BACKUP", "false"),
                ("REDIS_URL", "redis://localhost:6379"),
            ]))
            .unwrap();

        assert_eq!(config.database_url, "postgres://localhost/platform");
        assert_eq!(config.pool.min, 1);
        assert_eq!(config.pool.max, 1);
        assert!(!config.features.backup);
        assert_eq!(config.cache.url.as_deref(), Some("redis://localhost:6379"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let mut config = PlatformConfig::default();
        let result = config.apply_overrides(lookup_from(&[("TENANT_FORGE_POOL_MAX", "lots")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_pool_bounds() {
        let mut config = PlatformConfig {
            database_url: "postgres://localhost/platform".to_string(),
            ..Default::default()
        };
        config.pool.min = 5;
        config.pool.max = 2;
        assert!(config.validate().is_err());

        config.database_url.clear();
        config.pool.min = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_keeps_sections() {
        let raw = r#"
            database_url = "postgres://localhost/platform"
            [pool]
            max = 4
            [features]
            partitioning = false
        "#;
        let config: PlatformConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.pool.max, 4);
        assert_eq!(config.pool.min, 2);
        assert!(!config.features.partitioning);
        assert!(config.features.migrations);
    }
}
