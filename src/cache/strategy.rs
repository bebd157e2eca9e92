//! Cache strategies
//!
//! A strategy decides how long entries live, which levels they are written
//! to and when writes invalidate them. Strategies are keyed by
//! `(module, table)`; a table strategy wins over the module-wide strategy,
//! which wins over the global default.

use crate::database::connection::ModulePool;
use crate::database::value::SqlValue;
use crate::error::{Result, TenantForgeError};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::str::FromStr;

/// When cached entries are invalidated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationMode {
    /// Entries only expire by TTL
    Time,
    /// Writes through the façade invalidate the module
    Write,
    /// Only explicit invalidation calls remove entries
    Manual,
    /// TTL expiry plus write invalidation
    Hybrid,
}

impl InvalidationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationMode::Time => "time",
            InvalidationMode::Write => "write",
            InvalidationMode::Manual => "manual",
            InvalidationMode::Hybrid => "hybrid",
        }
    }

    pub fn invalidates_on_write(&self) -> bool {
        matches!(self, InvalidationMode::Write | InvalidationMode::Hybrid)
    }
}

impl FromStr for InvalidationMode {
    type Err = TenantForgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "time" => Ok(InvalidationMode::Time),
            "write" => Ok(InvalidationMode::Write),
            "manual" => Ok(InvalidationMode::Manual),
            "hybrid" => Ok(InvalidationMode::Hybrid),
            other => Err(TenantForgeError::InvalidInput(format!(
                "unknown invalidation mode: {}",
                other
            ))),
        }
    }
}

/// Which cache levels an entry lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLevel {
    Local,
    Remote,
    Both,
}

impl CacheLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLevel::Local => "local",
            CacheLevel::Remote => "remote",
            CacheLevel::Both => "both",
        }
    }

    pub fn uses_local(&self) -> bool {
        matches!(self, CacheLevel::Local | CacheLevel::Both)
    }

    pub fn uses_remote(&self) -> bool {
        matches!(self, CacheLevel::Remote | CacheLevel::Both)
    }
}

impl FromStr for CacheLevel {
    type Err = TenantForgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(CacheLevel::Local),
            "remote" => Ok(CacheLevel::Remote),
            "both" => Ok(CacheLevel::Both),
            other => Err(TenantForgeError::InvalidInput(format!(
                "unknown cache level: {}",
                other
            ))),
        }
    }
}

/// Caching rules for a module or one of its tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStrategy {
    pub module_name: String,
    /// `None` applies to the whole module
    pub table_name: Option<String>,
    pub ttl_secs: u64,
    pub invalidation: InvalidationMode,
    pub level: CacheLevel,
    /// Tags added to every entry written under this strategy
    pub tags: Vec<String>,
}

impl CacheStrategy {
    /// Module-wide strategy
    pub fn for_module(module: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            module_name: module.into(),
            table_name: None,
            ttl_secs,
            invalidation: InvalidationMode::Hybrid,
            level: CacheLevel::Both,
            tags: Vec::new(),
        }
    }

    /// Strategy for one table of a module
    pub fn for_table(module: impl Into<String>, table: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            table_name: Some(table.into()),
            ..Self::for_module(module, ttl_secs)
        }
    }

    pub fn with_level(mut self, level: CacheLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_invalidation(mut self, invalidation: InvalidationMode) -> Self {
        self.invalidation = invalidation;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

type StrategyKey = (String, Option<String>);

/// Concurrent lookup table of strategies with precedence resolution
#[derive(Debug)]
pub struct StrategyTable {
    default_ttl_secs: u64,
    strategies: DashMap<StrategyKey, CacheStrategy>,
}

impl StrategyTable {
    pub fn new(default_ttl_secs: u64) -> Self {
        Self {
            default_ttl_secs,
            strategies: DashMap::new(),
        }
    }

    pub fn insert(&self, strategy: CacheStrategy) {
        let key = (strategy.module_name.clone(), strategy.table_name.clone());
        self.strategies.insert(key, strategy);
    }

    pub fn remove_module(&self, module: &str) {
        self.strategies.retain(|(m, _), _| m != module);
    }

    /// Resolve the effective strategy: table, then module, then default
    pub fn resolve(&self, module: Option<&str>, table: Option<&str>) -> CacheStrategy {
        let Some(module) = module else {
            return self.default_strategy("");
        };

        if let Some(table) = table {
            let key = (module.to_string(), Some(table.to_string()));
            if let Some(strategy) = self.strategies.get(&key) {
                return strategy.clone();
            }
        }
        if let Some(strategy) = self.strategies.get(&(module.to_string(), None)) {
            return strategy.clone();
        }
        self.default_strategy(module)
    }

    fn default_strategy(&self, module: &str) -> CacheStrategy {
        CacheStrategy::for_module(module, self.default_ttl_secs)
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

pub(crate) const PLATFORM_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS platform.cache_strategies (
    module_name TEXT NOT NULL,
    table_name TEXT NOT NULL DEFAULT '',
    ttl_secs BIGINT NOT NULL,
    invalidation TEXT NOT NULL,
    level TEXT NOT NULL,
    tags TEXT[] NOT NULL DEFAULT '{}',
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (module_name, table_name)
);
"#;

/// Upsert a strategy into `platform.cache_strategies`
pub async fn save_strategy(pool: &ModulePool, strategy: &CacheStrategy) -> Result<()> {
    pool.execute(
        "INSERT INTO platform.cache_strategies (module_name, table_name, ttl_secs, invalidation, level, tags)
         VALUES ($1, $2, $3, $4, $5, $6::text[])
         ON CONFLICT (module_name, table_name) DO UPDATE
         SET ttl_secs = EXCLUDED.ttl_secs,
             invalidation = EXCLUDED.invalidation,
             level = EXCLUDED.level,
             tags = EXCLUDED.tags,
             updated_at = now()",
        &[
            SqlValue::from(strategy.module_name.as_str()),
            SqlValue::from(strategy.table_name.clone().unwrap_or_default()),
            SqlValue::Int(strategy.ttl_secs as i64),
            SqlValue::from(strategy.invalidation.as_str()),
            SqlValue::from(strategy.level.as_str()),
            SqlValue::TextArray(strategy.tags.clone()),
        ],
    )
    .await?;
    Ok(())
}

/// Read every persisted strategy
pub async fn load_strategies(pool: &ModulePool) -> Result<Vec<CacheStrategy>> {
    let rows = pool
        .query(
            "SELECT module_name, table_name, ttl_secs, invalidation, level, tags
             FROM platform.cache_strategies",
            &[],
        )
        .await?;

    rows.iter()
        .map(|row| -> Result<CacheStrategy> {
            let table: String = row.try_get("table_name")?;
            let invalidation: String = row.try_get("invalidation")?;
            let level: String = row.try_get("level")?;
            Ok(CacheStrategy {
                module_name: row.try_get("module_name")?,
                table_name: (!table.is_empty()).then_some(table),
                ttl_secs: row.try_get::<i64, _>("ttl_secs")?.max(0) as u64,
                invalidation: invalidation.parse()?,
                level: level.parse()?,
                tags: row.try_get("tags")?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence() {
        let table = StrategyTable::new(300);
        table.insert(CacheStrategy::for_module("vendas", 60).with_level(CacheLevel::Remote));
        table.insert(CacheStrategy::for_table("vendas", "clientes", 10).with_level(CacheLevel::Local));

        let specific = table.resolve(Some("vendas"), Some("clientes"));
        assert_eq!(specific.ttl_secs, 10);
        assert_eq!(specific.level, CacheLevel::Local);

        let module = table.resolve(Some("vendas"), Some("pedidos"));
        assert_eq!(module.ttl_secs, 60);
        assert_eq!(module.level, CacheLevel::Remote);

        let fallback = table.resolve(Some("estoque"), None);
        assert_eq!(fallback.ttl_secs, 300);
        assert_eq!(fallback.level, CacheLevel::Both);
        assert_eq!(fallback.invalidation, InvalidationMode::Hybrid);
    }

    #[test]
    fn test_invalidates_on_write() {
        assert!(InvalidationMode::Write.invalidates_on_write());
        assert!(InvalidationMode::Hybrid.invalidates_on_write());
        assert!(!InvalidationMode::Time.invalidates_on_write());
        assert!(!InvalidationMode::Manual.invalidates_on_write());
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("manual".parse::<InvalidationMode>().unwrap(), InvalidationMode::Manual);
        assert_eq!("both".parse::<CacheLevel>().unwrap(), CacheLevel::Both);
        assert!("sometimes".parse::<CacheLevel>().is_err());
    }

    #[test]
    fn test_remove_module() {
        let table = StrategyTable::new(300);
        table.insert(CacheStrategy::for_module("vendas", 60));
        table.insert(CacheStrategy::for_table("vendas", "clientes", 10));
        table.insert(CacheStrategy::for_module("estoque", 60));
        table.remove_module("vendas");
        assert_eq!(table.len(), 1);
    }
}
