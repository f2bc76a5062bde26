//! Idle policy resolution
//!
//! The host picks one provider at startup for its deployment scope:
//! a fixed policy from configuration, or the admin-managed policy stored
//! at site or network scope.

use crate::config::IdlePolicy;
use crate::error::IdleError;
use crate::store::ActivityStore;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Where an administrator's settings live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyScope {
    /// Settings owned by a single site
    Site(String),
    /// Settings shared by every site in the network
    Network,
}

impl fmt::Display for PolicyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyScope::Site(site_id) => write!(f, "site {}", site_id),
            PolicyScope::Network => write!(f, "network"),
        }
    }
}

/// Source of the policy in effect for the current request
#[async_trait]
pub trait PolicyProvider: Send + Sync {
    async fn policy(&self) -> Result<IdlePolicy, IdleError>;
}

/// Policy fixed at startup
#[derive(Debug, Clone)]
pub struct FixedPolicyProvider {
    policy: IdlePolicy,
}

impl FixedPolicyProvider {
    pub fn new(policy: IdlePolicy) -> Self {
        Self {
            policy: policy.normalized(),
        }
    }
}

impl Default for FixedPolicyProvider {
    fn default() -> Self {
        Self::new(IdlePolicy::default())
    }
}

#[async_trait]
impl PolicyProvider for FixedPolicyProvider {
    async fn policy(&self) -> Result<IdlePolicy, IdleError> {
        Ok(self.policy.clone())
    }
}

/// Admin-managed policy kept as JSON in the store
#[derive(Clone)]
pub struct StoredPolicyProvider {
    store: Arc<dyn ActivityStore>,
    key: String,
    scope: PolicyScope,
}

impl StoredPolicyProvider {
    pub fn new(store: Arc<dyn ActivityStore>, key_prefix: &str, scope: PolicyScope) -> Self {
        let key = match &scope {
            PolicyScope::Site(site_id) => format!("{}site:{}:policy", key_prefix, site_id),
            PolicyScope::Network => format!("{}network:policy", key_prefix),
        };
        Self { store, key, scope }
    }

    pub fn scope(&self) -> &PolicyScope {
        &self.scope
    }

    /// Store key the settings are read from
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Persist new settings, normalized, and return what was stored
    pub async fn save_policy(&self, policy: IdlePolicy) -> Result<IdlePolicy, IdleError> {
        let policy = policy.normalized();
        let value = serde_json::to_string(&policy)?;
        self.store.set(&self.key, &value).await?;

        info!(
            "Saved idle policy for {}: {}s, silent={}",
            self.scope, policy.max_idle_seconds, policy.silent_logout
        );

        Ok(policy)
    }
}

#[async_trait]
impl PolicyProvider for StoredPolicyProvider {
    async fn policy(&self) -> Result<IdlePolicy, IdleError> {
        let Some(raw) = self.store.get(&self.key).await? else {
            return Ok(IdlePolicy::default());
        };

        match serde_json::from_str::<IdlePolicy>(&raw) {
            Ok(policy) => Ok(policy.normalized()),
            Err(e) => {
                warn!("Unreadable idle policy for {}, using defaults: {}", self.scope, e);
                Ok(IdlePolicy::default())
            }
        }
    }
}
