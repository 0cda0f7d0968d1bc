use axum::{extract::Request, http::header, middleware::Next, response::IntoResponse};

/// Hardening headers for an authorization server.
///
/// Authorization codes travel in redirect URLs, so the referrer is never
/// leaked to third parties. Protocol responses carrying credentials are
/// marked uncacheable unless the handler already chose a policy.
pub async fn security_headers_middleware(req: Request, next: Next) -> impl IntoResponse {
    let path = req.uri().path().to_string();
    let is_public_metadata = path.ends_with("/.well-known/jwks.json")
        || path.ends_with("/.well-known/openid-configuration")
        || path == "/.well-known/openapi.json";

    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        header::HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        header::HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        header::HeaderValue::from_static("no-referrer"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        header::HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert(
        header::X_FRAME_OPTIONS,
        header::HeaderValue::from_static("DENY"),
    );

    if !is_public_metadata && !headers.contains_key(header::CACHE_CONTROL) {
        headers.insert(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static("no-store"),
        );
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, middleware::from_fn, routing::get};
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/token", get(|| async { "ok" }))
            .route(
                "/.well-known/jwks.json",
                get(|| async { ([(header::CACHE_CONTROL, "public, max-age=3600")], "{}") }),
            )
            .layer(from_fn(security_headers_middleware))
    }

    #[tokio::test]
    async fn test_protocol_responses_are_not_cached() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
        assert_eq!(response.headers()[header::REFERRER_POLICY], "no-referrer");
    }

    #[tokio::test]
    async fn test_jwks_keeps_its_cache_policy() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/.well-known/jwks.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "public, max-age=3600"
        );
    }
}
