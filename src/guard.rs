//! Idle session guard
//!
//! Runs the idle check for each lifecycle event of an authenticated session:
//! - every request: initialize, refresh, or force logout
//! - login: start a new idle window
//! - logout: drop the tracked timestamp

use crate::activity::ActivityTracker;
use crate::config::IdleConfig;
use crate::error::IdleError;
use crate::host::SessionHost;
use crate::models::{GuardSignal, Outcome, Principal};
use crate::policy::PolicyProvider;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::{form_urlencoded, Position, Url};

/// Query parameter set on the login redirect after an idle logout
pub const IDLE_QUERY_PARAM: &str = "idle";

/// Base used to resolve path-only login URLs
const RELATIVE_BASE: &str = "http://localhost/";

/// Session guard wiring the tracker, policy and host together
#[derive(Clone)]
pub struct SessionGuard {
    tracker: Arc<ActivityTracker>,
    policies: Arc<dyn PolicyProvider>,
    host: Arc<dyn SessionHost>,
    idle_redirect_url: String,
}

impl SessionGuard {
    /// Fails when `config.login_url` is neither an absolute URL nor a path
    pub fn new(
        tracker: Arc<ActivityTracker>,
        policies: Arc<dyn PolicyProvider>,
        host: Arc<dyn SessionHost>,
        config: &IdleConfig,
    ) -> Result<Self, IdleError> {
        Ok(Self {
            tracker,
            policies,
            host,
            idle_redirect_url: with_idle_marker(&config.login_url)?,
        })
    }

    pub fn tracker(&self) -> &ActivityTracker {
        &self.tracker
    }

    /// Check the idle state for one request.
    ///
    /// `is_exempt_activity` marks background traffic (polling, keep-alives):
    /// a fresh exempt request neither refreshes nor ends the session. An
    /// expired session is logged out whether or not the request is exempt.
    ///
    /// Errors only come from reading the policy or the record, or from
    /// writing a fresh record. Once a session is judged expired the logout
    /// signal is always returned, even if the host or the store fail to
    /// forget it.
    pub async fn on_request(
        &self,
        principal: Option<&Principal>,
        now: DateTime<Utc>,
        is_exempt_activity: bool,
    ) -> Result<GuardSignal, IdleError> {
        let Some(principal) = principal else {
            return Ok(GuardSignal::Continue);
        };

        let policy = self.policies.policy().await?;
        let outcome = self
            .tracker
            .evaluate(&principal.id, now, policy.max_idle(), is_exempt_activity)
            .await?;

        match outcome {
            Outcome::NoRecord => {
                self.tracker.touch(&principal.id, now).await?;
                Ok(GuardSignal::Continue)
            }
            Outcome::Fresh => Ok(GuardSignal::Continue),
            Outcome::Expired => {
                info!(
                    "User {} idle for more than {}s, logging out",
                    principal.id, policy.max_idle_seconds
                );

                if let Err(e) = self.host.invalidate_session(principal).await {
                    error!("Failed to invalidate session of idle user {}: {:?}", principal.id, e);
                }
                if let Err(e) = self.on_logout(principal).await {
                    warn!("Failed to clear activity of idle user {}: {:?}", principal.id, e);
                }

                if policy.silent_logout {
                    Ok(GuardSignal::TerminateAsAnonymous)
                } else {
                    Ok(GuardSignal::Redirect(self.idle_redirect_url.clone()))
                }
            }
        }
    }

    /// Start a fresh idle window, replacing any record from an earlier session
    pub async fn on_login(&self, principal: &Principal, now: DateTime<Utc>) -> Result<(), IdleError> {
        self.tracker.touch(&principal.id, now).await?;
        info!("Idle window started for user {}", principal.id);
        Ok(())
    }

    /// Forget the principal's activity. Safe to call more than once.
    pub async fn on_logout(&self, principal: &Principal) -> Result<(), IdleError> {
        self.tracker.clear(&principal.id).await?;
        debug!("Cleared activity for user {}", principal.id);
        Ok(())
    }

    /// Login form message, with the idle notice appended when `idle_flag` is set
    pub async fn render_login_notice(
        &self,
        base_message: &str,
        idle_flag: bool,
    ) -> Result<String, IdleError> {
        if !idle_flag {
            return Ok(base_message.to_string());
        }

        let policy = self.policies.policy().await?;
        Ok(render_login_notice(base_message, idle_flag, &policy.idle_message))
    }

    /// Login URL carrying the idle marker
    pub fn idle_redirect_url(&self) -> &str {
        &self.idle_redirect_url
    }
}

/// Add `idle=1` to the query of an absolute URL or a path, ahead of any fragment
fn with_idle_marker(login_url: &str) -> Result<String, IdleError> {
    let invalid = |e: url::ParseError| {
        IdleError::Configuration(format!("login URL {:?}: {}", login_url, e))
    };

    match Url::parse(login_url) {
        Ok(mut url) => {
            url.query_pairs_mut().append_pair(IDLE_QUERY_PARAM, "1");
            Ok(url.to_string())
        }
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = Url::parse(RELATIVE_BASE).map_err(invalid)?;
            let mut url = base.join(login_url).map_err(invalid)?;
            url.query_pairs_mut().append_pair(IDLE_QUERY_PARAM, "1");
            Ok(url[Position::BeforePath..].to_string())
        }
        Err(e) => Err(invalid(e)),
    }
}

/// Append `<p class="message">idle_message</p>` to `base_message` when `idle_flag` is set
pub fn render_login_notice(base_message: &str, idle_flag: bool, idle_message: &str) -> String {
    if !idle_flag {
        return base_message.to_string();
    }
    format!(
        "{}<p class=\"message\">{}</p>",
        base_message,
        newlines_to_breaks(idle_message)
    )
}

/// Whether a raw query string carries a non-empty idle marker
pub fn idle_flag_from_query(query: Option<&str>) -> bool {
    let Some(query) = query else {
        return false;
    };

    form_urlencoded::parse(query.as_bytes())
        .filter(|(name, _)| name == IDLE_QUERY_PARAM)
        .any(|(_, value)| !value.is_empty() && value != "0")
}

fn newlines_to_breaks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                out.push_str("<br />\r");
                if chars.peek() == Some(&'\n') {
                    chars.next();
                    out.push('\n');
                }
            }
            '\n' => out.push_str("<br />\n"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdlePolicy;
    use crate::models::PrincipalId;
    use crate::policy::FixedPolicyProvider;
    use crate::store::{ActivityStore, MemoryActivityStore};
    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingHost {
        invalidated: Mutex<Vec<PrincipalId>>,
    }

    #[async_trait]
    impl SessionHost for RecordingHost {
        async fn invalidate_session(&self, principal: &Principal) -> Result<(), IdleError> {
            self.invalidated.lock().await.push(principal.id.clone());
            Ok(())
        }
    }

    struct FailingHost;

    #[async_trait]
    impl SessionHost for FailingHost {
        async fn invalidate_session(&self, _principal: &Principal) -> Result<(), IdleError> {
            Err(IdleError::HostSession("down".to_string()))
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    /// Reads from the wrapped store, fails every write
    struct ReadOnlyStore(MemoryActivityStore);

    #[async_trait]
    impl ActivityStore for ReadOnlyStore {
        async fn get(&self, key: &str) -> Result<Option<String>, IdleError> {
            self.0.get(key).await
        }

        async fn set(&self, _key: &str, _value: &str) -> Result<(), IdleError> {
            Err(IdleError::StoreUnavailable("read-only replica".to_string()))
        }

        async fn delete(&self, _key: &str) -> Result<(), IdleError> {
            Err(IdleError::StoreUnavailable("read-only replica".to_string()))
        }
    }

    struct UnreachableStore;

    #[async_trait]
    impl ActivityStore for UnreachableStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, IdleError> {
            Err(IdleError::StoreUnavailable("connection refused".to_string()))
        }

        async fn set(&self, _key: &str, _value: &str) -> Result<(), IdleError> {
            Err(IdleError::StoreUnavailable("connection refused".to_string()))
        }

        async fn delete(&self, _key: &str) -> Result<(), IdleError> {
            Err(IdleError::StoreUnavailable("connection refused".to_string()))
        }
    }

    fn build_guard(
        store: Arc<dyn ActivityStore>,
        host: Arc<dyn SessionHost>,
        policy: IdlePolicy,
        login_url: &str,
    ) -> Result<SessionGuard, IdleError> {
        let config = IdleConfig {
            login_url: login_url.to_string(),
            ..IdleConfig::default()
        };
        let tracker = Arc::new(ActivityTracker::new(store, &config.key_prefix));
        SessionGuard::new(tracker, Arc::new(FixedPolicyProvider::new(policy)), host, &config)
    }

    fn guard_with(policy: IdlePolicy) -> (SessionGuard, Arc<RecordingHost>, MemoryActivityStore) {
        let store = MemoryActivityStore::new();
        let host = Arc::new(RecordingHost::default());
        let guard = build_guard(Arc::new(store.clone()), host.clone(), policy, "/login").unwrap();
        (guard, host, store)
    }

    fn redirect_for(login_url: &str) -> Result<String, IdleError> {
        let guard = build_guard(
            Arc::new(MemoryActivityStore::new()),
            Arc::new(RecordingHost::default()),
            IdlePolicy::default(),
            login_url,
        )?;
        Ok(guard.idle_redirect_url().to_string())
    }

    #[tokio::test]
    async fn test_anonymous_request_is_noop() {
        let (guard, host, store) = guard_with(IdlePolicy::default());

        let signal = guard.on_request(None, at(10), false).await.unwrap();
        assert_eq!(signal, GuardSignal::Continue);
        assert!(store.is_empty().await);
        assert!(host.invalidated.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_first_request_initializes_record() {
        let (guard, _, _) = guard_with(IdlePolicy::default());
        let user = Principal::new(Uuid::new_v4());

        let signal = guard.on_request(Some(&user), at(50), false).await.unwrap();
        assert_eq!(signal, GuardSignal::Continue);
        assert_eq!(guard.tracker().last_active(&user.id).await.unwrap(), Some(at(50)));
    }

    #[tokio::test]
    async fn test_login_refresh_then_expire() {
        let (guard, host, _) = guard_with(IdlePolicy::default());
        let user = Principal::new(Uuid::new_v4());

        guard.on_login(&user, at(0)).await.unwrap();

        let signal = guard.on_request(Some(&user), at(3000), false).await.unwrap();
        assert_eq!(signal, GuardSignal::Continue);
        assert_eq!(guard.tracker().last_active(&user.id).await.unwrap(), Some(at(3000)));

        let signal = guard.on_request(Some(&user), at(6601), false).await.unwrap();
        assert_eq!(signal, GuardSignal::Redirect("/login?idle=1".to_string()));
        assert_eq!(*host.invalidated.lock().await, vec![user.id.clone()]);
        assert_eq!(guard.tracker().last_active(&user.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_redirect_notice() {
        let (guard, _, _) = guard_with(IdlePolicy::default());
        let user = Principal::new(Uuid::new_v4());
        guard.on_login(&user, at(0)).await.unwrap();

        let signal = guard.on_request(Some(&user), at(4000), false).await.unwrap();
        assert_eq!(signal, GuardSignal::Redirect("/login?idle=1".to_string()));

        let notice = guard.render_login_notice("", true).await.unwrap();
        assert_eq!(
            notice,
            r#"<p class="message">You have been logged out due to inactivity.</p>"#
        );
    }

    #[tokio::test]
    async fn test_silent_logout() {
        let (guard, host, _) = guard_with(IdlePolicy {
            silent_logout: true,
            ..IdlePolicy::default()
        });
        let user = Principal::new(Uuid::new_v4());
        guard.on_login(&user, at(0)).await.unwrap();

        let signal = guard.on_request(Some(&user), at(4000), false).await.unwrap();
        assert_eq!(signal, GuardSignal::TerminateAsAnonymous);
        assert_eq!(host.invalidated.lock().await.len(), 1);
        assert_eq!(guard.tracker().last_active(&user.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_exempt_request_keeps_timestamp() {
        let (guard, host, _) = guard_with(IdlePolicy::default());
        let user = Principal::new(Uuid::new_v4());
        guard.on_login(&user, at(0)).await.unwrap();

        let signal = guard.on_request(Some(&user), at(3000), true).await.unwrap();
        assert_eq!(signal, GuardSignal::Continue);
        assert_eq!(guard.tracker().last_active(&user.id).await.unwrap(), Some(at(0)));
        assert!(host.invalidated.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_exempt_request_still_expires() {
        let (guard, host, _) = guard_with(IdlePolicy::default());
        let user = Principal::new(Uuid::new_v4());
        guard.on_login(&user, at(0)).await.unwrap();

        let signal = guard.on_request(Some(&user), at(3601), true).await.unwrap();
        assert_eq!(signal, GuardSignal::Redirect("/login?idle=1".to_string()));
        assert_eq!(host.invalidated.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_record_is_repaired() {
        let (guard, _, store) = guard_with(IdlePolicy::default());
        let user = Principal::new(Uuid::new_v4());
        let key = guard.tracker().activity_key(&user.id);
        store.set(&key, "").await.unwrap();

        let signal = guard.on_request(Some(&user), at(77), false).await.unwrap();
        assert_eq!(signal, GuardSignal::Continue);
        assert_eq!(store.get(&key).await.unwrap(), Some("77".to_string()));
    }

    #[tokio::test]
    async fn test_login_overrides_stale_record() {
        let (guard, host, _) = guard_with(IdlePolicy::default());
        let user = Principal::new(Uuid::new_v4());
        guard.tracker().touch(&user.id, at(0)).await.unwrap();

        guard.on_login(&user, at(10_000)).await.unwrap();
        let signal = guard.on_request(Some(&user), at(10_100), false).await.unwrap();
        assert_eq!(signal, GuardSignal::Continue);
        assert!(host.invalidated.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let (guard, _, store) = guard_with(IdlePolicy::default());
        let user = Principal::new(Uuid::new_v4());
        guard.on_login(&user, at(0)).await.unwrap();

        guard.on_logout(&user).await.unwrap();
        guard.on_logout(&user).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_host_failure_still_logs_out() {
        let store = MemoryActivityStore::new();
        let guard = build_guard(
            Arc::new(store.clone()),
            Arc::new(FailingHost),
            IdlePolicy::default(),
            "/login",
        )
        .unwrap();
        let user = Principal::new(Uuid::new_v4());
        guard.on_login(&user, at(0)).await.unwrap();

        let signal = guard.on_request(Some(&user), at(5000), false).await.unwrap();
        assert_eq!(signal, GuardSignal::Redirect("/login?idle=1".to_string()));
        assert_eq!(guard.tracker().last_active(&user.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unreachable_store_is_reported() {
        let guard = build_guard(
            Arc::new(UnreachableStore),
            Arc::new(RecordingHost::default()),
            IdlePolicy::default(),
            "/login",
        )
        .unwrap();
        let user = Principal::new(Uuid::new_v4());

        let result = guard.on_request(Some(&user), at(100), false).await;
        assert!(matches!(result, Err(IdleError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_failed_refresh_does_not_extend_window() {
        let inner = MemoryActivityStore::new();
        let guard = build_guard(
            Arc::new(ReadOnlyStore(inner.clone())),
            Arc::new(RecordingHost::default()),
            IdlePolicy::default(),
            "/login",
        )
        .unwrap();
        let user = Principal::new(Uuid::new_v4());
        let key = guard.tracker().activity_key(&user.id);
        inner.set(&key, "0").await.unwrap();

        let result = guard.on_request(Some(&user), at(3000), false).await;
        assert!(matches!(result, Err(IdleError::StoreUnavailable(_))));
        assert_eq!(inner.get(&key).await.unwrap(), Some("0".to_string()));
    }

    #[tokio::test]
    async fn test_failed_clear_still_logs_out() {
        let inner = MemoryActivityStore::new();
        let host = Arc::new(RecordingHost::default());
        let guard = build_guard(
            Arc::new(ReadOnlyStore(inner.clone())),
            host.clone(),
            IdlePolicy::default(),
            "/login",
        )
        .unwrap();
        let user = Principal::new(Uuid::new_v4());
        inner.set(&guard.tracker().activity_key(&user.id), "0").await.unwrap();

        let signal = guard.on_request(Some(&user), at(5000), false).await.unwrap();
        assert_eq!(signal, GuardSignal::Redirect("/login?idle=1".to_string()));
        assert_eq!(*host.invalidated.lock().await, vec![user.id.clone()]);
    }

    #[tokio::test]
    async fn test_custom_idle_window() {
        let (guard, _, _) = guard_with(IdlePolicy {
            max_idle_seconds: 60,
            ..IdlePolicy::default()
        });
        let user = Principal::new(Uuid::new_v4());
        guard.on_login(&user, at(0)).await.unwrap();

        let signal = guard.on_request(Some(&user), at(59), false).await.unwrap();
        assert_eq!(signal, GuardSignal::Continue);
        let signal = guard.on_request(Some(&user), at(119), false).await.unwrap();
        assert_eq!(signal, GuardSignal::Continue);
        let signal = guard.on_request(Some(&user), at(180), false).await.unwrap();
        assert!(matches!(signal, GuardSignal::Redirect(_)));
    }

    #[test]
    fn test_redirect_urls() {
        assert_eq!(redirect_for("/login").unwrap(), "/login?idle=1");
        assert_eq!(
            redirect_for("https://example.com/login?next=/home").unwrap(),
            "https://example.com/login?next=/home&idle=1"
        );
        assert_eq!(
            redirect_for("https://example.com/wp-login.php").unwrap(),
            "https://example.com/wp-login.php?idle=1"
        );
    }

    #[test]
    fn test_redirect_marker_goes_before_fragment() {
        assert_eq!(redirect_for("/login#form").unwrap(), "/login?idle=1#form");
        assert_eq!(
            redirect_for("https://example.com/login?lang=pt#form").unwrap(),
            "https://example.com/login?lang=pt&idle=1#form"
        );
    }

    #[test]
    fn test_invalid_login_url_is_rejected() {
        let result = redirect_for("http://[::1/login");
        assert!(matches!(result, Err(IdleError::Configuration(_))));
    }

    #[test]
    fn test_render_notice() {
        assert_eq!(render_login_notice("Welcome", false, "bye"), "Welcome");
        assert_eq!(
            render_login_notice("Welcome", true, "Line one\nLine two"),
            "Welcome<p class=\"message\">Line one<br />\nLine two</p>"
        );
        assert_eq!(
            render_login_notice("", true, "a\r\nb"),
            "<p class=\"message\">a<br />\r\nb</p>"
        );
    }

    #[tokio::test]
    async fn test_notice_without_flag_is_unchanged() {
        let (guard, _, _) = guard_with(IdlePolicy::default());
        let notice = guard.render_login_notice("<p>Hello</p>", false).await.unwrap();
        assert_eq!(notice, "<p>Hello</p>");
    }

    #[test]
    fn test_idle_flag_from_query() {
        assert!(idle_flag_from_query(Some("idle=1")));
        assert!(idle_flag_from_query(Some("redirect_to=%2F&idle=yes")));
        assert!(!idle_flag_from_query(Some("idle=")));
        assert!(!idle_flag_from_query(Some("idle")));
        assert!(!idle_flag_from_query(Some("idle=0")));
        assert!(!idle_flag_from_query(Some("idler=1")));
        assert!(!idle_flag_from_query(None));
    }

    #[test]
    fn test_idle_flag_is_percent_decoded() {
        assert!(idle_flag_from_query(Some("%69dle=1")));
        assert!(idle_flag_from_query(Some("next=%2Fhome&idle=%31")));
        assert!(!idle_flag_from_query(Some("idle=%30")));
        assert!(idle_flag_from_query(Some("idle=on+ce")));
    }
}
