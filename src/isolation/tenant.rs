//! Tenant context
//!
//! The identity every isolated statement runs under. Row-level policies
//! read these values back through `current_setting(...)`.

use crate::error::{Result, TenantForgeError};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;

pub const CURRENT_TENANT: &str = "app.current_tenant";
pub const CURRENT_USER: &str = "app.current_user";
pub const CURRENT_ORGANIZATION: &str = "app.current_organization";
pub const CURRENT_ROLES: &str = "app.current_roles";
pub const CURRENT_PERMISSIONS: &str = "app.current_permissions";

/// How long bound settings live on the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingScope {
    /// Until the surrounding transaction ends
    Transaction,
    /// Until reset or the connection closes
    Session,
}

/// Tenant, user and authorization context of a caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Default::default()
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    /// Setting name/value pairs; the organization defaults to the tenant
    pub fn settings(&self) -> Vec<(&'static str, String)> {
        vec![
            (CURRENT_TENANT, self.tenant_id.clone()),
            (CURRENT_USER, self.user_id.clone().unwrap_or_default()),
            (
                CURRENT_ORGANIZATION,
                self.organization_id
                    .clone()
                    .unwrap_or_else(|| self.tenant_id.clone()),
            ),
            (CURRENT_ROLES, self.roles.join(",")),
            (CURRENT_PERMISSIONS, self.permissions.join(",")),
        ]
    }

    /// Bind the context on a connection. Values are bound parameters.
    pub async fn apply(&self, conn: &mut PgConnection, scope: SettingScope) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(TenantForgeError::InvalidInput(
                "tenant context requires a tenant id".to_string(),
            ));
        }

        let is_local = scope == SettingScope::Transaction;
        let mut query = sqlx::query(
            "SELECT set_config($1, $2, $11), set_config($3, $4, $11), set_config($5, $6, $11), \
             set_config($7, $8, $11), set_config($9, $10, $11)",
        );
        for (name, value) in self.settings() {
            query = query.bind(name).bind(value);
        }
        query
            .bind(is_local)
            .execute(conn)
            .await
            .map_err(|e| TenantForgeError::query("tenant_context", 0, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let ctx = TenantContext::new("org-1").user("u-7").roles(["admin", "sales"]);
        let settings = ctx.settings();

        assert_eq!(settings[0], (CURRENT_TENANT, "org-1".to_string()));
        assert_eq!(settings[1], (CURRENT_USER, "u-7".to_string()));
        assert_eq!(settings[2], (CURRENT_ORGANIZATION, "org-1".to_string()));
        assert_eq!(settings[3], (CURRENT_ROLES, "admin,sales".to_string()));
        assert_eq!(settings[4], (CURRENT_PERMISSIONS, String::new()));
    }

    #[test]
    fn test_explicit_organization() {
        let ctx = TenantContext::new("org-1").organization("holding-9");
        assert_eq!(ctx.settings()[2].1, "holding-9");
    }
}
