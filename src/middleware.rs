//! Axum middleware for idle logout
//!
//! Runs the session guard on every request:
//! - Reads the `Principal` the host's auth layer put in request extensions
//! - Classifies background traffic as exempt activity
//! - Redirects expired sessions to the login page, or strips the principal
//!   when the policy asks for a silent logout

use crate::config::IdleConfig;
use crate::guard::SessionGuard;
use crate::models::{GuardSignal, Principal};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Decides whether a request is background activity
pub type ExemptClassifier = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Marker inserted into extensions after a silent idle logout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleLoggedOut;

/// Middleware state
#[derive(Clone)]
pub struct IdleMiddlewareState {
    /// Session guard
    pub guard: SessionGuard,
    /// Exempt activity classifier
    pub exempt: ExemptClassifier,
}

impl IdleMiddlewareState {
    /// State treating the configured heartbeat paths as exempt
    pub fn new(guard: SessionGuard, config: &IdleConfig) -> Self {
        Self {
            guard,
            exempt: path_classifier(config.exempt_paths.clone()),
        }
    }

    /// Replace the exempt classifier
    pub fn with_classifier(mut self, exempt: ExemptClassifier) -> Self {
        self.exempt = exempt;
        self
    }
}

/// Classifier matching request paths exactly or by `path/` prefix
pub fn path_classifier(paths: Vec<String>) -> ExemptClassifier {
    Arc::new(move |req: &Request| {
        let path = req.uri().path();
        paths.iter().any(|exempt| {
            path == exempt.as_str()
                || path
                    .strip_prefix(exempt.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    })
}

/// Idle logout middleware
///
/// The guard only errors before it has judged the session expired (policy or
/// record unreadable, refresh not written). Those failures are logged and the
/// request proceeds; the idle window is simply not extended. Expired sessions
/// always get the logout signal.
pub async fn idle_logout_middleware(
    State(state): State<Arc<IdleMiddlewareState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(principal) = req.extensions().get::<Principal>().cloned() else {
        return next.run(req).await;
    };

    let exempt = (state.exempt)(&req);

    let signal = match state.guard.on_request(Some(&principal), Utc::now(), exempt).await {
        Ok(signal) => signal,
        Err(e) => {
            warn!("Idle check failed for user {}: {:?}", principal.id, e);
            return next.run(req).await;
        }
    };

    match signal {
        GuardSignal::Continue => next.run(req).await,
        GuardSignal::Redirect(url) => {
            debug!("Redirecting idle user {} to {}", principal.id, url);
            Redirect::to(&url).into_response()
        }
        GuardSignal::TerminateAsAnonymous => {
            req.extensions_mut().remove::<Principal>();
            req.extensions_mut().insert(IdleLoggedOut);
            next.run(req).await
        }
    }
}
