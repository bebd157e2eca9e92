//! Where backup records live

use super::metadata::{BackupMetadata, RestorePoint};
use crate::database::connection::PoolManager;
use crate::database::value::SqlValue;
use crate::error::Result;
use async_trait::async_trait;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub(crate) const PLATFORM_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS platform.backups (
    id UUID PRIMARY KEY,
    module_name TEXT NOT NULL,
    backup_type TEXT NOT NULL,
    status TEXT NOT NULL,
    base_backup_id UUID,
    started_at TIMESTAMPTZ NOT NULL,
    metadata JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS backups_module_idx ON platform.backups (module_name, started_at);
CREATE TABLE IF NOT EXISTS platform.restore_points (
    id UUID PRIMARY KEY,
    module_name TEXT NOT NULL,
    point_time TIMESTAMPTZ NOT NULL,
    point JSONB NOT NULL
);
"#;

/// Storage for backup metadata and restore points
#[async_trait]
pub trait BackupCatalog: Send + Sync {
    /// Insert or replace a backup record
    async fn save(&self, backup: &BackupMetadata) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<BackupMetadata>>;
    /// Backups of a module, oldest first
    async fn list(&self, module: &str) -> Result<Vec<BackupMetadata>>;
    async fn delete(&self, id: Uuid) -> Result<()>;
    async fn save_restore_point(&self, point: &RestorePoint) -> Result<()>;
    /// Restore points of a module, oldest first
    async fn restore_points(&self, module: &str) -> Result<Vec<RestorePoint>>;
}

/// Catalog kept in the `platform` schema
pub struct PgBackupCatalog {
    pools: Arc<PoolManager>,
}

impl PgBackupCatalog {
    pub fn new(pools: Arc<PoolManager>) -> Self {
        Self { pools }
    }
}

#[async_trait]
impl BackupCatalog for PgBackupCatalog {
    async fn save(&self, backup: &BackupMetadata) -> Result<()> {
        let pool = self.pools.default_pool().await?;
        pool.execute(
            "INSERT INTO platform.backups (id, module_name, backup_type, status, base_backup_id, started_at, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO UPDATE
             SET status = EXCLUDED.status, base_backup_id = EXCLUDED.base_backup_id, metadata = EXCLUDED.metadata",
            &[
                SqlValue::Uuid(backup.id),
                SqlValue::from(backup.module_name.as_str()),
                SqlValue::from(backup.backup_type.as_str()),
                SqlValue::from(backup.status.as_str()),
                backup.base_backup_id.map_or(SqlValue::Null, SqlValue::Uuid),
                SqlValue::Timestamp(backup.started_at),
                SqlValue::Json(serde_json::to_value(backup)?),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<BackupMetadata>> {
        let pool = self.pools.default_pool().await?;
        let rows = pool
            .query("SELECT metadata FROM platform.backups WHERE id = $1", &[SqlValue::Uuid(id)])
            .await?;
        match rows.first() {
            Some(row) => {
                let metadata: sqlx::types::Json<BackupMetadata> = row.try_get("metadata")?;
                Ok(Some(metadata.0))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, module: &str) -> Result<Vec<BackupMetadata>> {
        let pool = self.pools.default_pool().await?;
        let rows = pool
            .query(
                "SELECT metadata FROM platform.backups WHERE module_name = $1 ORDER BY started_at",
                &[SqlValue::from(module)],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let metadata: sqlx::types::Json<BackupMetadata> = row.try_get("metadata")?;
                Ok(metadata.0)
            })
            .collect()
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let pool = self.pools.default_pool().await?;
        pool.execute("DELETE FROM platform.backups WHERE id = $1", &[SqlValue::Uuid(id)])
            .await?;
        Ok(())
    }

    async fn save_restore_point(&self, point: &RestorePoint) -> Result<()> {
        let pool = self.pools.default_pool().await?;
        pool.execute(
            "INSERT INTO platform.restore_points (id, module_name, point_time, point) VALUES ($1, $2, $3, $4)",
            &[
                SqlValue::Uuid(point.id),
                SqlValue::from(point.module_name.as_str()),
                SqlValue::Timestamp(point.timestamp),
                SqlValue::Json(serde_json::to_value(point)?),
            ],
        )
        .await?;
        Ok(())
    }

    async fn restore_points(&self, module: &str) -> Result<Vec<RestorePoint>> {
        let pool = self.pools.default_pool().await?;
        let rows = pool
            .query(
                "SELECT point FROM platform.restore_points WHERE module_name = $1 ORDER BY point_time",
                &[SqlValue::from(module)],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let point: sqlx::types::Json<RestorePoint> = row.try_get("point")?;
                Ok(point.0)
            })
            .collect()
    }
}

/// In-process catalog, for tests and embedded use
#[derive(Default)]
pub struct MemoryBackupCatalog {
    backups: RwLock<HashMap<Uuid, BackupMetadata>>,
    points: RwLock<Vec<RestorePoint>>,
}

impl MemoryBackupCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackupCatalog for MemoryBackupCatalog {
    async fn save(&self, backup: &BackupMetadata) -> Result<()> {
        self.backups.write().await.insert(backup.id, backup.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<BackupMetadata>> {
        Ok(self.backups.read().await.get(&id).cloned())
    }

    async fn list(&self, module: &str) -> Result<Vec<BackupMetadata>> {
        let mut backups: Vec<BackupMetadata> = self
            .backups
            .read()
            .await
            .values()
            .filter(|b| b.module_name == module)
            .cloned()
            .collect();
        backups.sort_by_key(|b| b.started_at);
        Ok(backups)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.backups.write().await.remove(&id);
        Ok(())
    }

    async fn save_restore_point(&self, point: &RestorePoint) -> Result<()> {
        self.points.write().await.push(point.clone());
        Ok(())
    }

    async fn restore_points(&self, module: &str) -> Result<Vec<RestorePoint>> {
        let mut points: Vec<RestorePoint> = self
            .points
            .read()
            .await
            .iter()
            .filter(|p| p.module_name == module)
            .cloned()
            .collect();
        points.sort_by_key(|p| p.timestamp);
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::metadata::BackupType;
    use chrono::Duration;

    #[tokio::test]
    async fn test_memory_catalog_roundtrip() {
        let catalog = MemoryBackupCatalog::new();
        let mut older = BackupMetadata::running("vendas", "module_vendas", BackupType::Full, "a".into());
        older.started_at -= Duration::hours(1);
        let newer = BackupMetadata::running("vendas", "module_vendas", BackupType::Incremental, "b".into());
        let other = BackupMetadata::running("estoque", "module_estoque", BackupType::Full, "c".into());

        for backup in [&newer, &older, &other] {
            catalog.save(backup).await.unwrap();
        }

        let listed = catalog.list("vendas").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, older.id);

        catalog.delete(older.id).await.unwrap();
        assert!(catalog.get(older.id).await.unwrap().is_none());
        assert_eq!(catalog.get(newer.id).await.unwrap(), Some(newer));
    }
}
