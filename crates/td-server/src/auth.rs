//! Bearer-token authentication.
//!
//! Implemented as an axum function middleware rather than a hand-rolled
//! tower service: the policy lives in [`BearerAuth`], a small value the
//! router installs via `middleware::from_fn_with_state`. With no token
//! configured every request passes (local development mode); with one, the
//! `Authorization: Bearer <token>` header must match in constant time.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use subtle::ConstantTimeEq;

// ---------------------------------------------------------------------------
// BearerAuth
// ---------------------------------------------------------------------------

/// The configured credential, shared across requests.
#[derive(Clone, Default)]
pub struct BearerAuth {
    token: Option<Arc<str>>,
}

impl BearerAuth {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()).map(Arc::from),
        }
    }

    /// No token configured: everything passes.
    pub fn is_open(&self) -> bool {
        self.token.is_none()
    }

    /// Decide on the raw `Authorization` header value.
    fn accepts(&self, authorization: Option<&str>) -> bool {
        let Some(expected) = &self.token else {
            return true;
        };
        let Some(provided) = authorization.and_then(|v| v.strip_prefix("Bearer ")) else {
            return false;
        };
        provided.as_bytes().ct_eq(expected.as_bytes()).into()
    }
}

/// The middleware function. Install with
/// `middleware::from_fn_with_state(BearerAuth::new(token), require_bearer)`.
pub async fn require_bearer(
    State(auth): State<BearerAuth>,
    request: Request,
    next: Next,
) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if !auth.accepts(authorization) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "unauthorized"})),
        )
            .into_response();
    }
    next.run(request).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    #[test]
    fn open_mode_accepts_any_header() {
        let auth = BearerAuth::new(None);
        assert!(auth.is_open());
        assert!(auth.accepts(None));
        assert!(auth.accepts(Some("Bearer whatever")));
        assert!(auth.accepts(Some("garbage")));

        // Empty string means unconfigured too.
        assert!(BearerAuth::new(Some(String::new())).is_open());
    }

    #[test]
    fn configured_token_requires_exact_bearer() {
        let auth = BearerAuth::new(Some("secret123".into()));
        assert!(!auth.is_open());
        assert!(auth.accepts(Some("Bearer secret123")));
        assert!(!auth.accepts(None));
        assert!(!auth.accepts(Some("Bearer wrong")));
        assert!(!auth.accepts(Some("Bearer secret1234")));
        assert!(!auth.accepts(Some("secret123"))); // missing scheme
        assert!(!auth.accepts(Some("bearer secret123"))); // scheme is case-sensitive
    }

    #[tokio::test]
    async fn middleware_returns_401_envelope() {
        let app = Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(axum::middleware::from_fn_with_state(
                BearerAuth::new(Some("secret123".into())),
                require_bearer,
            ));

        let denied = app
            .clone()
            .oneshot(HttpRequest::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
        let bytes = axum::body::to_bytes(denied.into_body(), 1 << 16).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"], "unauthorized");

        let allowed = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/ping")
                    .header("Authorization", "Bearer secret123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }
}
