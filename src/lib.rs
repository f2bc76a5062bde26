pub mod activity;
pub mod config;
pub mod error;
pub mod guard;
pub mod host;
pub mod middleware;
pub mod models;
pub mod policy;
pub mod store;

// Re-export commonly used types
pub use activity::ActivityTracker;
pub use config::{IdleConfig, IdlePolicy};
pub use error::IdleError;
pub use guard::{idle_flag_from_query, render_login_notice, SessionGuard};
pub use host::{RedisSessionHost, SessionHost};
pub use middleware::{idle_logout_middleware, IdleLoggedOut, IdleMiddlewareState};
pub use models::{ActivityRecord, GuardSignal, Outcome, Principal, PrincipalId};
pub use policy::{FixedPolicyProvider, PolicyProvider, PolicyScope, StoredPolicyProvider};
pub use store::{ActivityStore, MemoryActivityStore, RedisActivityStore};
