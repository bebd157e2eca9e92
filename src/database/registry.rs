//! Module registry
//!
//! Tracks which modules the platform hosts and where each one is in its
//! lifecycle. The registry is owned by the platform instance; nothing here is
//! process-global.

use crate::error::{Result, TenantForgeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

/// Default schema for a module: `module_<name>`
pub fn schema_name_for(module: &str) -> String {
    format!("module_{}", module)
}

/// Lifecycle of a hosted module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Unregistered,
    Provisioning,
    Active,
    Draining,
}

impl ModuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Unregistered => "unregistered",
            ModuleState::Provisioning => "provisioning",
            ModuleState::Active => "active",
            ModuleState::Draining => "draining",
        }
    }

    /// States only move forward; a provisioning module may also be drained
    /// when its setup fails.
    pub fn can_transition_to(&self, next: ModuleState) -> bool {
        matches!(
            (self, next),
            (ModuleState::Unregistered, ModuleState::Provisioning)
                | (ModuleState::Provisioning, ModuleState::Active)
                | (ModuleState::Provisioning, ModuleState::Draining)
                | (ModuleState::Active, ModuleState::Draining)
        )
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hosted module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRegistration {
    pub module_name: String,
    pub schema_name: String,
    pub state: ModuleState,
    pub registered_at: DateTime<Utc>,
}

/// Outcome of [`ModuleRegistry::provision`]
#[derive(Debug, Clone, PartialEq)]
pub enum Provisioning {
    /// The module was unknown and is now provisioning
    Started(ModuleRegistration),
    /// The module is already active; nothing to do
    AlreadyActive(ModuleRegistration),
}

/// In-memory registry of hosted modules
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, ModuleRegistration>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a module into `Provisioning`, or report that it is already active
    pub async fn provision(&self, module: &str, schema: &str) -> Result<Provisioning> {
        let mut modules = self.modules.write().await;
        if let Some(existing) = modules.get(module) {
            return match existing.state {
                ModuleState::Active => Ok(Provisioning::AlreadyActive(existing.clone())),
                state => Err(TenantForgeError::InvalidInput(format!(
                    "module '{}' is {}",
                    module, state
                ))),
            };
        }

        let registration = ModuleRegistration {
            module_name: module.to_string(),
            schema_name: schema.to_string(),
            state: ModuleState::Provisioning,
            registered_at: Utc::now(),
        };
        modules.insert(module.to_string(), registration.clone());
        Ok(Provisioning::Started(registration))
    }

    /// Restore a registration loaded from storage
    pub async fn restore(&self, registration: ModuleRegistration) {
        self.modules
            .write()
            .await
            .insert(registration.module_name.clone(), registration);
    }

    /// Advance a module's state
    pub async fn transition(&self, module: &str, next: ModuleState) -> Result<ModuleRegistration> {
        let mut modules = self.modules.write().await;
        let registration = modules
            .get_mut(module)
            .ok_or_else(|| TenantForgeError::ModuleNotRegistered(module.to_string()))?;

        if !registration.state.can_transition_to(next) {
            return Err(TenantForgeError::InvalidInput(format!(
                "module '{}' cannot move from {} to {}",
                module, registration.state, next
            )));
        }
        registration.state = next;
        Ok(registration.clone())
    }

    pub async fn get(&self, module: &str) -> Option<ModuleRegistration> {
        self.modules.read().await.get(module).cloned()
    }

    /// The registration of an active module
    pub async fn require_active(&self, module: &str) -> Result<ModuleRegistration> {
        match self.get(module).await {
            Some(registration) if registration.state == ModuleState::Active => Ok(registration),
            _ => Err(TenantForgeError::ModuleNotRegistered(module.to_string())),
        }
    }

    /// All registrations, sorted by module name
    pub async fn list(&self) -> Vec<ModuleRegistration> {
        let mut modules: Vec<_> = self.modules.read().await.values().cloned().collect();
        modules.sort_by(|a, b| a.module_name.cmp(&b.module_name));
        modules
    }

    pub async fn remove(&self, module: &str) -> Option<ModuleRegistration> {
        self.modules.write().await.remove(module)
    }
}
