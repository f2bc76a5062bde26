use serde::{Deserialize, Serialize};
use tracing::warn;

/// Smallest idle window an administrator may configure, in seconds
pub const MIN_IDLE_SECONDS: u64 = 60;

/// Idle window used when none (or an invalid one) is configured
pub const DEFAULT_IDLE_SECONDS: u64 = 60 * 60;

pub const DEFAULT_IDLE_MESSAGE: &str = "You have been logged out due to inactivity.";

/// Idle logout policy, as exposed by the admin settings surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdlePolicy {
    /// Seconds without activity before a session is expired (default: 3600, min: 60)
    pub max_idle_seconds: u64,

    /// Notice appended to the login form after an idle logout
    pub idle_message: String,

    /// Terminate the authenticated context without redirecting (default: false)
    pub silent_logout: bool,
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self {
            max_idle_seconds: DEFAULT_IDLE_SECONDS,
            idle_message: DEFAULT_IDLE_MESSAGE.to_string(),
            silent_logout: false,
        }
    }
}

impl IdlePolicy {
    /// Clamp out-of-range settings back to their defaults
    pub fn normalized(mut self) -> Self {
        if self.max_idle_seconds < MIN_IDLE_SECONDS {
            warn!(
                "Idle time of {}s is below the {}s floor, using default {}s",
                self.max_idle_seconds, MIN_IDLE_SECONDS, DEFAULT_IDLE_SECONDS
            );
            self.max_idle_seconds = DEFAULT_IDLE_SECONDS;
        }
        self
    }

    /// Idle window as a chrono duration
    pub fn max_idle(&self) -> chrono::Duration {
        let secs = i64::try_from(self.max_idle_seconds).unwrap_or(i64::MAX);
        chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX)
    }
}

/// Idle logout service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    /// Key prefix for activity records and stored policies (default: "idle_logout:")
    pub key_prefix: String,

    /// Login page the user is sent to after an idle logout (default: "/login")
    pub login_url: String,

    /// Request paths treated as background polling; they never refresh the idle timer
    pub exempt_paths: Vec<String>,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            key_prefix: "idle_logout:".to_string(),
            login_url: "/login".to_string(),
            exempt_paths: vec!["/heartbeat".to_string()],
        }
    }
}
