//! Test helpers for identity-service integration tests.
//!
//! Every test gets its own in-memory workspace directory, store provider,
//! task queue and event sink, wired through the real router.

#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, Response, StatusCode},
    Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use identity_service::{
    build_router,
    config::{
        DatabaseConfig, Environment, IdentityConfig, OidcConfig, RedisConfig, SecurityConfig,
        WorkerConfig, WorkspacePoolConfig,
    },
    models::{Client, ClientType, SanitizedUser, Workspace},
    services::{
        admin::{ClientLifetimes, NewClient},
        MemoryEventSink, MemoryTaskQueue, RbacPropagator, TenantContext, TenantResolver,
        WorkspaceContext,
    },
    store::memory::{MemoryStoreProvider, MemoryWorkspaceDirectory},
    utils::Password,
    workers::{RetryPolicy, WorkerPool},
    AppState,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

pub const TEST_ADMIN_API_KEY: &str = "test-admin-key-0123456789";
pub const HOST: &str = "acme.test";
pub const ISSUER: &str = "http://acme.test";
pub const REDIRECT_URI: &str = "https://app.example.com/callback";
pub const USER_EMAIL: &str = "ada@example.com";
pub const USER_PASSWORD: &str = "correct-horse-battery";
pub const CODE_VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

pub fn test_config() -> IdentityConfig {
    IdentityConfig {
        common: service_core::config::Config::default(),
        environment: Environment::Dev,
        service_name: "identity-service-test".to_string(),
        service_version: "0.0.0".to_string(),
        log_level: "error".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: "postgres://unused".to_string(),
            max_connections: 1,
            min_connections: 0,
        },
        workspaces: WorkspacePoolConfig {
            max_cached_pools: 4,
            max_connections_per_pool: 1,
            acquire_timeout_seconds: 1,
        },
        redis: RedisConfig {
            url: "redis://unused".to_string(),
            key_prefix: "test".to_string(),
        },
        worker: WorkerConfig {
            concurrency: 1,
            ..WorkerConfig::default()
        },
        oidc: OidcConfig {
            public_scheme: "http".to_string(),
            cookie_secure: false,
            ..OidcConfig::default()
        },
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            admin_api_key: TEST_ADMIN_API_KEY.to_string(),
        },
    }
}

pub struct TestClient {
    pub client: Client,
    pub secret: String,
}

/// Application over in-memory backends, seeded with a workspace on
/// `acme.test`, its default tenant, a first-party confidential client, a
/// third-party confidential client, a public client and one user.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub queue: Arc<MemoryTaskQueue>,
    pub events: Arc<MemoryEventSink>,
    pub provider: Arc<MemoryStoreProvider>,
    pub workers: WorkerPool,
    pub ws: WorkspaceContext,
    pub tenant: TenantContext,
    pub first_party: TestClient,
    pub third_party: TestClient,
    pub public: TestClient,
    pub user: SanitizedUser,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let config = test_config();
        let directory = Arc::new(MemoryWorkspaceDirectory::new());
        let workspace = Workspace::new("Acme".into(), HOST.into(), "ws_acme".into());
        directory.insert(workspace).await;

        let provider = Arc::new(MemoryStoreProvider::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let events = Arc::new(MemoryEventSink::new());
        let resolver = TenantResolver::new(
            directory,
            provider.clone(),
            config.oidc.public_scheme.clone(),
        );

        let state = AppState::new(config.clone(), resolver.clone(), queue.clone(), events.clone());
        let workers = WorkerPool::new(
            &config.worker,
            queue.clone(),
            resolver.clone(),
            RbacPropagator::new(events.clone()),
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            add_jitter: false,
        });

        let ws = resolver
            .resolve_workspace(Some(HOST))
            .await
            .expect("workspace should resolve");
        let tenant = state
            .admin
            .create_tenant(&ws, "main", "Main".into(), true, None)
            .await
            .expect("default tenant");

        let first_party =
            create_client(&state, &ws, &tenant, ClientType::Confidential, true).await;
        let third_party =
            create_client(&state, &ws, &tenant, ClientType::Confidential, false).await;
        let public = create_client(&state, &ws, &tenant, ClientType::Public, true).await;

        let user = state
            .admin
            .create_user(
                &ws,
                tenant.tenant.tenant_id,
                USER_EMAIL,
                &Password::new(USER_PASSWORD.to_string()),
                true,
                Some(serde_json::json!({ "given_name": "Ada" })),
            )
            .await
            .expect("user");

        TestApp {
            router: build_router(state.clone()),
            state,
            queue,
            events,
            provider,
            workers,
            ws,
            tenant,
            first_party,
            third_party,
            public,
            user,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send(
            Request::builder()
                .uri(uri)
                .header(header::HOST, HOST)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn post_form(
        &self,
        uri: &str,
        cookies: &[String],
        authorization: Option<&str>,
        form: &[(&str, &str)],
    ) -> Response<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::HOST, HOST)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        if !cookies.is_empty() {
            builder = builder.header(header::COOKIE, cookies.join("; "));
        }
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        let body = serde_urlencoded::to_string(form).unwrap();
        self.send(builder.body(Body::from(body)).unwrap()).await
    }

    pub async fn get_with_cookies(&self, uri: &str, cookies: &[String]) -> Response<Body> {
        let mut builder = Request::builder().uri(uri).header(header::HOST, HOST);
        if !cookies.is_empty() {
            builder = builder.header(header::COOKIE, cookies.join("; "));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    /// Authorize and log in with the seeded user. Returns the final
    /// response and every cookie the browser holds afterwards.
    pub async fn authorize_and_login(
        &self,
        prefix: &str,
        client: &Client,
        extra: &[(&str, &str)],
    ) -> (Response<Body>, Vec<String>) {
        let response = self.get(&authorize_uri(prefix, client, extra)).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert!(location(&response).ends_with("/login"));
        let mut cookies = set_cookies(&response);

        let response = self
            .post_form(
                &format!("{}/login", prefix),
                &cookies,
                None,
                &[("email", USER_EMAIL), ("password", USER_PASSWORD)],
            )
            .await;
        merge_cookies(&mut cookies, set_cookies(&response));
        (response, cookies)
    }

    /// Full first-party flow up to the authorization code.
    pub async fn obtain_code(&self, extra: &[(&str, &str)]) -> String {
        let (response, _) = self
            .authorize_and_login("", &self.first_party.client, extra)
            .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        query_param(&location(&response), "code").expect("code in redirect")
    }

    /// Redeem a code for the first-party client using HTTP Basic auth.
    pub async fn exchange_code(&self, code: &str) -> Response<Body> {
        let basic = basic_auth(&self.first_party.client.client_id, &self.first_party.secret);
        self.post_form(
            "/token",
            &[],
            Some(&basic),
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", REDIRECT_URI),
            ],
        )
        .await
    }

    /// Obtain a token response for the first-party client.
    pub async fn obtain_tokens(&self) -> Value {
        let code = self.obtain_code(&[]).await;
        let response = self.exchange_code(&code).await;
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await
    }

    pub fn admin_request(&self, method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, HOST)
            .header("x-admin-api-key", TEST_ADMIN_API_KEY);
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }
}

async fn create_client(
    state: &AppState,
    ws: &WorkspaceContext,
    tenant: &TenantContext,
    client_type: ClientType,
    first_party: bool,
) -> TestClient {
    let (client, secret) = state
        .admin
        .create_client(
            ws,
            tenant.tenant.tenant_id,
            NewClient {
                name: format!("{:?} client", client_type),
                client_type,
                redirect_uris: vec![REDIRECT_URI.to_string()],
                first_party,
                encrypt_jwk: None,
                lifetimes: ClientLifetimes::default(),
            },
        )
        .await
        .expect("client");
    TestClient { client, secret }
}

pub fn authorize_uri(prefix: &str, client: &Client, extra: &[(&str, &str)]) -> String {
    let mut params: Vec<(&str, &str)> = vec![
        ("response_type", "code"),
        ("client_id", client.client_id.as_str()),
        ("redirect_uri", REDIRECT_URI),
        ("scope", "openid email profile"),
        ("state", "xyz"),
        ("nonce", "n-0S6_WzA2Mj"),
    ];
    for (key, value) in extra {
        params.retain(|(k, _)| k != key);
        params.push((key, value));
    }
    format!(
        "{}/authorize?{}",
        prefix,
        serde_urlencoded::to_string(&params).unwrap()
    )
}

pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

pub fn basic_auth(client_id: &str, secret: &str) -> String {
    use base64::engine::general_purpose::STANDARD;
    format!("Basic {}", STANDARD.encode(format!("{}:{}", client_id, secret)))
}

pub fn location(response: &Response<Body>) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .expect("location header")
        .to_str()
        .unwrap()
        .to_string()
}

/// `name=value` pairs from every Set-Cookie header; removals are skipped.
pub fn set_cookies(response: &Response<Body>) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .filter(|pair| !pair.ends_with('='))
        .map(str::to_string)
        .collect()
}

pub fn merge_cookies(jar: &mut Vec<String>, fresh: Vec<String>) {
    for cookie in fresh {
        let name = cookie.split('=').next().unwrap_or_default().to_string();
        jar.retain(|c| !c.starts_with(&format!("{}=", name)));
        jar.push(cookie);
    }
}

pub fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split_once(|c| c == '?' || c == '#')?.1;
    let pairs: HashMap<String, String> = serde_urlencoded::from_str(query).ok()?;
    pairs.get(name).cloned()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Decode a JWT payload without verifying it.
pub fn jwt_claims(token: &str) -> Value {
    let payload = token.split('.').nth(1).expect("jwt payload");
    serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap()
}
