//! Route gateway: merges every endpoint's subrouter and attaches shared state.
//!
//! `main.rs` only calls [`router`]; individual endpoints stay private to
//! their sibling modules.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use axum::Router;
use sqlx::PgPool;

use crate::{Config, Notifier};

mod downsample;
mod health;
mod ingest;
mod latest;

// ---

/// State shared by all handlers. Every field is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    // ---
    pub pool: PgPool,
    pub config: Config,
    pub notifier: Notifier,
}

pub fn router(pool: PgPool, config: Config) -> Router {
    // ---
    let notifier = Notifier::new(config.pushover.clone());

    Router::new()
        .merge(ingest::router())
        .merge(downsample::router())
        .merge(latest::router())
        .merge(health::router())
        .with_state(AppState {
            pool,
            config,
            notifier,
        })
}

/// Check `Authorization: Bearer <token>` when a token is configured.
pub(crate) fn bearer_ok(headers: &HeaderMap, expected: Option<&str>) -> bool {
    // ---
    let Some(expected) = expected else {
        return true;
    };
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_check() {
        // ---
        let mut headers = HeaderMap::new();
        assert!(bearer_ok(&headers, None));
        assert!(!bearer_ok(&headers, Some("s3cret")));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert!(bearer_ok(&headers, Some("s3cret")));
        assert!(!bearer_ok(&headers, Some("other")));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("s3cret"));
        assert!(!bearer_ok(&headers, Some("s3cret")));
    }
}
