//! Idle activity tracking
//!
//! Keeps one "last active" unix timestamp per principal and classifies it
//! against the idle window:
//! - `NoRecord` when nothing usable is stored
//! - `Fresh` inside the window (the record is refreshed unless the request is exempt)
//! - `Expired` once the window has elapsed (the record is left for the caller to clear)

use crate::error::IdleError;
use crate::models::{ActivityRecord, Outcome, PrincipalId};
use crate::store::ActivityStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Activity tracker for principals
#[derive(Clone)]
pub struct ActivityTracker {
    store: Arc<dyn ActivityStore>,
    key_prefix: String,
}

impl ActivityTracker {
    /// Create new activity tracker
    pub fn new(store: Arc<dyn ActivityStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    /// Classify the principal's idle state.
    ///
    /// The session expires once `now` is past `stored + max_idle`; a request
    /// landing exactly on the deadline is still fresh.
    ///
    /// A fresh, non-exempt evaluation refreshes the record to `now`. The
    /// refresh never moves the stored time backwards.
    pub async fn evaluate(
        &self,
        principal_id: &PrincipalId,
        now: DateTime<Utc>,
        max_idle: Duration,
        exempt: bool,
    ) -> Result<Outcome, IdleError> {
        let Some(stored) = self.read_timestamp(principal_id).await? else {
            return Ok(Outcome::NoRecord);
        };

        let expired = match stored.checked_add_signed(max_idle) {
            Some(deadline) => now > deadline,
            None => false,
        };

        if expired {
            debug!("Principal {} idle since {}", principal_id, stored);
            return Ok(Outcome::Expired);
        }

        if !exempt && now.timestamp() > stored.timestamp() {
            self.write_timestamp(principal_id, now).await?;
        }

        Ok(Outcome::Fresh)
    }

    /// Unconditionally set the last activity time
    pub async fn touch(&self, principal_id: &PrincipalId, now: DateTime<Utc>) -> Result<(), IdleError> {
        self.write_timestamp(principal_id, now).await?;
        debug!("Touched activity for principal {}", principal_id);
        Ok(())
    }

    /// Remove the principal's record. Clearing an absent record is a no-op.
    pub async fn clear(&self, principal_id: &PrincipalId) -> Result<(), IdleError> {
        self.store.delete(&self.activity_key(principal_id)).await
    }

    /// Get last activity timestamp for principal
    pub async fn last_active(&self, principal_id: &PrincipalId) -> Result<Option<DateTime<Utc>>, IdleError> {
        self.read_timestamp(principal_id).await
    }

    /// Current record for principal
    pub async fn record(&self, principal_id: &PrincipalId) -> Result<ActivityRecord, IdleError> {
        Ok(ActivityRecord {
            principal_id: principal_id.clone(),
            last_active_at: self.read_timestamp(principal_id).await?,
        })
    }

    /// Time left before the principal goes idle.
    ///
    /// `None` without a record, zero once the window has elapsed.
    pub async fn time_until_idle(
        &self,
        principal_id: &PrincipalId,
        now: DateTime<Utc>,
        max_idle: Duration,
    ) -> Result<Option<Duration>, IdleError> {
        let Some(stored) = self.read_timestamp(principal_id).await? else {
            return Ok(None);
        };

        let remaining = match stored.checked_add_signed(max_idle) {
            Some(deadline) => deadline - now,
            None => Duration::MAX,
        };

        Ok(Some(remaining.max(Duration::zero())))
    }

    /// Store key for a principal's activity record
    pub fn activity_key(&self, principal_id: &PrincipalId) -> String {
        format!("{}{}.last_active_time", self.key_prefix, principal_id)
    }

    async fn read_timestamp(&self, principal_id: &PrincipalId) -> Result<Option<DateTime<Utc>>, IdleError> {
        let key = self.activity_key(principal_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };

        let parsed = raw
            .parse::<u64>()
            .ok()
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0));

        if parsed.is_none() {
            warn!("Malformed activity record for principal {}: {:?}", principal_id, raw);
        }

        Ok(parsed)
    }

    async fn write_timestamp(&self, principal_id: &PrincipalId, now: DateTime<Utc>) -> Result<(), IdleError> {
        let key = self.activity_key(principal_id);
        let secs = now.timestamp().max(0);
        self.store.set(&key, &secs.to_string()).await
    }
}
