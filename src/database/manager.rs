//! Database Manager
//!
//! The platform root: builds the pool manager, cache and every subsystem
//! manager enabled in the configuration, bootstraps the `platform` schema
//! and owns the module lifecycle (provision, migrate, activate, tear down).

use crate::backup::{BackupManager, PgBackupCatalog, PgDumpExecutor};
use crate::cache::{strategy, CacheManager, CacheStrategy};
use crate::config::PlatformConfig;
use crate::database::connection::{ModulePool, PoolManager, PoolMetrics};
use crate::database::registry::{ModuleRegistration, ModuleRegistry, ModuleState, Provisioning};
use crate::database::schema::quote_ident;
use crate::database::value::SqlValue;
use crate::error::{Result, TenantForgeError};
use crate::events::{EventBus, PlatformEvent};
use crate::isolation::{IsolationConfig, IsolationManager};
use crate::migration::{MigrationEngine, MigrationRunReport};
use crate::partition::PartitionManager;
use crate::query::QueryFacade;
use crate::security::SecurityManager;
use serde::Serialize;
use sqlx::Row;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};

const MODULES_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS platform.modules (
    module_name TEXT PRIMARY KEY,
    registration JSONB NOT NULL,
    isolation JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

/// Aggregate health reported by [`DatabaseManager::health`]
#[derive(Debug, Clone, Serialize)]
pub struct PlatformHealth {
    pub healthy: bool,
    pub pools: Vec<PoolMetrics>,
    pub cache_connected: bool,
}

/// Result of [`DatabaseManager::create_module`]
#[derive(Debug, Clone, Serialize)]
pub struct ModuleProvisioned {
    pub registration: ModuleRegistration,
    /// `None` when the module was already active or migrations are disabled
    pub migrations: Option<MigrationRunReport>,
}

/// Database Manager
///
/// One instance per platform process. Subsystems disabled in
/// [`crate::config::FeatureToggles`] are not constructed and their
/// accessors return a configuration error.
pub struct DatabaseManager {
    config: PlatformConfig,
    events: EventBus,
    pools: Arc<PoolManager>,
    registry: Arc<ModuleRegistry>,
    cache: Option<Arc<CacheManager>>,
    isolation: Option<Arc<IsolationManager>>,
    migrations: Option<Arc<MigrationEngine>>,
    security: Option<Arc<SecurityManager>>,
    partitions: Option<Arc<PartitionManager>>,
    backups: Option<Arc<BackupManager>>,
    facade: Arc<QueryFacade>,
    closed: AtomicBool,
}

impl DatabaseManager {
    /// Build the platform from `config` and bootstrap its storage
    ///
    /// # Arguments
    /// * `config` - Validated platform configuration
    ///
    /// # Example
    /// ```no_run
    /// use tenant_forge::config::PlatformConfig;
    /// use tenant_forge::database::manager::DatabaseManager;
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let platform = DatabaseManager::connect(PlatformConfig::load()?).await?;
    ///     platform.shutdown().await;
    ///     Ok(())
    /// }
    /// ```
    #[instrument(skip_all)]
    pub async fn connect(config: PlatformConfig) -> Result<Self> {
        config.validate()?;
        let events = EventBus::default();
        let pools = Arc::new(PoolManager::new(
            config.database_url.clone(),
            config.pool.clone(),
            events.clone(),
        ));

        let platform_pool = pools.default_pool().await?;
        bootstrap(&platform_pool).await?;

        let features = &config.features;
        let cache = if features.caching {
            let cache = Arc::new(CacheManager::connect(config.cache.clone(), events.clone()).await?);
            match strategy::load_strategies(&platform_pool).await {
                Ok(strategies) => strategies.into_iter().for_each(|s| cache.set_strategy(s)),
                Err(e) => warn!(error = %e, "cache strategies not loaded"),
            }
            cache.start_health_checks(Duration::from_millis(config.pool.health_check_interval_ms));
            Some(cache)
        } else {
            None
        };

        let isolation = if features.isolation {
            let isolation = Arc::new(IsolationManager::new(pools.clone(), config.isolation.clone()));
            isolation.ensure_organization_table().await?;
            Some(isolation)
        } else {
            None
        };

        let migrations = features
            .migrations
            .then(|| Arc::new(MigrationEngine::new(pools.clone())));
        let security = features
            .security
            .then(|| Arc::new(SecurityManager::new(pools.clone())));

        let partitions = if features.partitioning {
            let partitions = Arc::new(PartitionManager::new(
                pools.clone(),
                Some(config.isolation.service_role.clone()),
            ));
            if let Err(e) = partitions.load_configs().await {
                warn!(error = %e, "partition configs not loaded");
            }
            Some(partitions)
        } else {
            None
        };

        let backups = features.backup.then(|| {
            Arc::new(BackupManager::new(
                pools.clone(),
                config.backup.clone(),
                Arc::new(PgBackupCatalog::new(pools.clone())),
                Arc::new(PgDumpExecutor::new(
                    config.backup.dump_command.clone(),
                    config.backup.restore_command.clone(),
                )),
            ))
        });

        let registry = Arc::new(ModuleRegistry::new());
        let mut facade = QueryFacade::new(pools.clone(), registry.clone());
        if let Some(cache) = &cache {
            facade = facade.with_cache(cache.clone());
        }
        if let Some(isolation) = &isolation {
            facade = facade.with_isolation(isolation.clone());
        }
        if let Some(security) = &security {
            facade = facade.with_security(security.clone());
        }

        let manager = Self {
            config,
            events,
            pools,
            registry,
            cache,
            isolation,
            migrations,
            security,
            partitions,
            backups,
            facade: Arc::new(facade),
            closed: AtomicBool::new(false),
        };

        let restored = manager.reload_modules(&platform_pool).await?;
        manager.pools.start_health_checks();
        info!(modules = restored, "platform ready");
        Ok(manager)
    }

    async fn reload_modules(&self, pool: &ModulePool) -> Result<usize> {
        let rows = pool
            .query("SELECT registration, isolation FROM platform.modules ORDER BY module_name", &[])
            .await?;

        let mut restored = 0;
        for row in &rows {
            let registration: sqlx::types::Json<ModuleRegistration> = row.try_get("registration")?;
            let isolation: sqlx::types::Json<IsolationConfig> = row.try_get("isolation")?;
            let (registration, isolation) = (registration.0, isolation.0);

            if registration.state != ModuleState::Active {
                warn!(
                    module = %registration.module_name,
                    state = %registration.state,
                    "module was left mid-lifecycle, create it again to finish"
                );
                continue;
            }
            self.attach(&registration.module_name, &registration.schema_name);
            if let Some(manager) = &self.isolation {
                manager.restore_config(isolation).await;
            }
            self.registry.restore(registration).await;
            restored += 1;
        }
        Ok(restored)
    }

    fn attach(&self, module: &str, schema: &str) {
        if let Some(engine) = &self.migrations {
            engine.set_schema(module, schema);
        }
        if let Some(backups) = &self.backups {
            backups.set_schema(module, schema);
        }
    }

    async fn persist(&self, registration: &ModuleRegistration, isolation: &IsolationConfig) -> Result<()> {
        let pool = self.pools.default_pool().await?;
        pool.execute(
            "INSERT INTO platform.modules (module_name, registration, isolation)
             VALUES ($1, $2, $3)
             ON CONFLICT (module_name) DO UPDATE
             SET registration = EXCLUDED.registration, isolation = EXCLUDED.isolation, updated_at = now()",
            &[
                SqlValue::from(registration.module_name.as_str()),
                SqlValue::Json(serde_json::to_value(registration)?),
                SqlValue::Json(serde_json::to_value(isolation)?),
            ],
        )
        .await?;
        Ok(())
    }

    fn announce(&self, module: &str, state: ModuleState) {
        self.events.emit(PlatformEvent::ModuleStateChanged {
            module: module.to_string(),
            state: state.as_str().to_string(),
        });
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TenantForgeError::Shutdown);
        }
        Ok(())
    }

    /// Provision a module: schema and isolation setup, then its migrations
    /// from `migrations_dir/<module>`, then `Active`.
    ///
    /// An already active module is returned unchanged. A failed setup leaves
    /// nothing registered so the call can be retried.
    #[instrument(skip_all, fields(module = %config.module_name))]
    pub async fn create_module(&self, config: IsolationConfig) -> Result<ModuleProvisioned> {
        self.ensure_open()?;
        config.validate()?;

        let registration = match self
            .registry
            .provision(&config.module_name, &config.schema_name)
            .await?
        {
            Provisioning::AlreadyActive(registration) => {
                return Ok(ModuleProvisioned {
                    registration,
                    migrations: None,
                })
            }
            Provisioning::Started(registration) => registration,
        };
        self.announce(&config.module_name, ModuleState::Provisioning);

        match self.provision(&config, &registration).await {
            Ok(migrations) => {
                let registration = self
                    .registry
                    .transition(&config.module_name, ModuleState::Active)
                    .await?;
                self.persist(&registration, &config).await?;
                self.announce(&config.module_name, ModuleState::Active);
                info!(schema = %config.schema_name, "module active");
                Ok(ModuleProvisioned {
                    registration,
                    migrations,
                })
            }
            Err(e) => {
                error!(error = %e, "module provisioning failed");
                self.registry.remove(&config.module_name).await;
                if let Some(isolation) = &self.isolation {
                    isolation.forget_module(&config.module_name).await;
                }
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        config: &IsolationConfig,
        registration: &ModuleRegistration,
    ) -> Result<Option<MigrationRunReport>> {
        match &self.isolation {
            Some(isolation) => isolation.register_module(config.clone()).await?,
            None => {
                let pool = self.pools.pool(&config.module_name).await?;
                pool.execute_script(&format!(
                    "CREATE SCHEMA IF NOT EXISTS {}",
                    quote_ident(&config.schema_name)?
                ))
                .await?;
            }
        }
        self.attach(&config.module_name, &config.schema_name);
        self.persist(registration, config).await?;

        let Some(engine) = &self.migrations else {
            return Ok(None);
        };
        let dir = self.config.migrations_dir.join(&config.module_name);
        let discovered = engine.discover(&config.module_name, &dir).await?;
        if discovered.is_empty() {
            return Ok(None);
        }
        engine.register(&discovered).await?;
        Ok(Some(engine.run(&config.module_name, None).await?))
    }

    /// Drain a module and release its resources. The schema and its data
    /// are kept.
    #[instrument(skip(self))]
    pub async fn teardown_module(&self, module: &str) -> Result<()> {
        self.ensure_open()?;
        let registration = self.registry.transition(module, ModuleState::Draining).await?;
        self.announce(module, ModuleState::Draining);

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.invalidate_module(module, "module teardown").await {
                warn!(error = %e, "cache invalidation failed");
            }
            cache.drop_strategies(module);
        }
        self.pools.remove(module).await;
        if let Some(isolation) = &self.isolation {
            isolation.forget_module(module).await;
        }
        if let Some(partitions) = &self.partitions {
            partitions.forget_schema(&registration.schema_name).await;
        }

        let pool = self.pools.default_pool().await?;
        pool.execute(
            "DELETE FROM platform.modules WHERE module_name = $1",
            &[SqlValue::from(module)],
        )
        .await?;
        self.registry.remove(module).await;
        self.announce(module, ModuleState::Unregistered);
        info!("module torn down");
        Ok(())
    }

    /// Set and persist a cache strategy
    pub async fn set_cache_strategy(&self, cache_strategy: CacheStrategy) -> Result<()> {
        let cache = feature(&self.cache, "caching")?;
        let pool = self.pools.default_pool().await?;
        strategy::save_strategy(&pool, &cache_strategy).await?;
        cache.set_strategy(cache_strategy);
        Ok(())
    }

    pub async fn health(&self) -> PlatformHealth {
        let pools = self.pools.metrics().await;
        PlatformHealth {
            healthy: !self.pools.is_closed() && pools.iter().all(|p| p.healthy),
            pools,
            cache_connected: self.cache.as_ref().is_some_and(|c| c.is_connected()),
        }
    }

    /// Stop background tasks and drain every pool. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(cache) = &self.cache {
            cache.shutdown();
        }
        self.pools.shutdown().await;
        info!("platform shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Observe platform events
    pub fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn query(&self) -> &Arc<QueryFacade> {
        &self.facade
    }

    pub fn cache(&self) -> Result<&Arc<CacheManager>> {
        feature(&self.cache, "caching")
    }

    pub fn isolation(&self) -> Result<&Arc<IsolationManager>> {
        feature(&self.isolation, "isolation")
    }

    pub fn migrations(&self) -> Result<&Arc<MigrationEngine>> {
        feature(&self.migrations, "migrations")
    }

    pub fn security(&self) -> Result<&Arc<SecurityManager>> {
        feature(&self.security, "security")
    }

    pub fn partitions(&self) -> Result<&Arc<PartitionManager>> {
        feature(&self.partitions, "partitioning")
    }

    pub fn backups(&self) -> Result<&Arc<BackupManager>> {
        feature(&self.backups, "backup")
    }
}

fn feature<'a, T>(slot: &'a Option<Arc<T>>, name: &str) -> Result<&'a Arc<T>> {
    slot.as_ref()
        .ok_or_else(|| TenantForgeError::Config(format!("the {} feature is disabled", name)))
}

/// Create the `platform` schema and every bookkeeping table
async fn bootstrap(pool: &ModulePool) -> Result<()> {
    let script = [
        "CREATE SCHEMA IF NOT EXISTS platform;",
        MODULES_DDL,
        strategy::PLATFORM_DDL,
        crate::migration::PLATFORM_DDL,
        crate::security::PLATFORM_DDL,
        crate::partition::PLATFORM_DDL,
        crate::backup::PLATFORM_DDL,
    ]
    .concat();
    pool.execute_script(&script).await?;
    info!("platform schema ready");
    Ok(())
}
