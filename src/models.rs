use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque user identifier, as the host's auth layer spells it
///
/// Hosts with UUID users and hosts with numeric users both map onto this;
/// the tracker only ever formats it into store keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(String);

impl PrincipalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for PrincipalId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

impl From<u64> for PrincipalId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PrincipalId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for PrincipalId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Authenticated identity handed to the guard by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// User ID
    pub id: PrincipalId,

    /// Host session backing this request, if the host tracks one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

impl Principal {
    pub fn new(id: impl Into<PrincipalId>) -> Self {
        Self {
            id: id.into(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

/// Last-activity record for one principal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub principal_id: PrincipalId,

    /// `None` when nothing (or nothing parseable) is stored
    pub last_active_at: Option<DateTime<Utc>>,
}

/// Classification of a principal's idle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// No usable timestamp stored
    NoRecord,
    /// Within the idle window
    Fresh,
    /// Idle window exceeded
    Expired,
}

/// What the host should do with the current request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardSignal {
    /// Keep processing the request as-is
    Continue,
    /// Stop processing and send the user to this URL
    Redirect(String),
    /// Drop the authenticated context and render the request as anonymous
    TerminateAsAnonymous,
}
