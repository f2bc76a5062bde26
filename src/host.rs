//! Host session invalidation
//!
//! The guard never owns credentials; on forced logout it asks the host to
//! drop them through [`SessionHost`].

use crate::error::IdleError;
use crate::models::{Principal, PrincipalId};
use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::debug;
use uuid::Uuid;

/// Host capability to end an authenticated session
#[async_trait]
pub trait SessionHost: Send + Sync {
    async fn invalidate_session(&self, principal: &Principal) -> Result<(), IdleError>;
}

/// Invalidates sessions kept in redis as `<prefix><session_id>` keys, with a
/// per-user set of session ids under `<prefix>user:<user_id>`
#[derive(Clone)]
pub struct RedisSessionHost {
    redis: redis::aio::ConnectionManager,
    key_prefix: String,
}

impl RedisSessionHost {
    /// Create a host adapter; the usual prefix is "session:"
    pub fn new(redis: redis::aio::ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self {
            redis,
            key_prefix: key_prefix.into(),
        }
    }

    async fn delete_session(&self, user_id: &PrincipalId, session_id: Uuid) -> Result<(), IdleError> {
        let mut redis = self.redis.clone();

        let _: () = redis
            .srem(self.user_sessions_key(user_id), session_id.to_string())
            .await
            .map_err(host_err)?;
        let _: () = redis.del(self.session_key(&session_id)).await.map_err(host_err)?;

        debug!("Deleted session {} for user {}", session_id, user_id);
        Ok(())
    }

    async fn delete_all_user_sessions(&self, user_id: &PrincipalId) -> Result<(), IdleError> {
        let mut redis = self.redis.clone();
        let key = self.user_sessions_key(user_id);
        let session_ids: Vec<String> = redis.smembers(&key).await.map_err(host_err)?;

        for id_str in session_ids {
            let _: () = redis
                .del(format!("{}{}", self.key_prefix, id_str))
                .await
                .map_err(host_err)?;
        }
        let _: () = redis.del(&key).await.map_err(host_err)?;

        debug!("Deleted all sessions for user {}", user_id);
        Ok(())
    }

    fn session_key(&self, session_id: &Uuid) -> String {
        format!("{}{}", self.key_prefix, session_id)
    }

    fn user_sessions_key(&self, user_id: &PrincipalId) -> String {
        format!("{}user:{}", self.key_prefix, user_id)
    }
}

fn host_err(err: redis::RedisError) -> IdleError {
    IdleError::HostSession(err.to_string())
}

#[async_trait]
impl SessionHost for RedisSessionHost {
    async fn invalidate_session(&self, principal: &Principal) -> Result<(), IdleError> {
        match principal.session_id {
            Some(session_id) => self.delete_session(&principal.id, session_id).await,
            None => self.delete_all_user_sessions(&principal.id).await,
        }
    }
}
