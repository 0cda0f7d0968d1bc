pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod store;
pub mod utils;
pub mod workers;

use std::sync::Arc;

use service_core::axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, patch, post, put},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{request_id_middleware, security_headers_middleware};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{
    openapi::security::{ApiKey, ApiKeyValue, HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

use crate::config::IdentityConfig;
use crate::middleware::ADMIN_API_KEY_HEADER;
use crate::services::{
    AdminService, AuthenticationFlow, CodeExchanger, EventSink, KeyStore, RefreshService,
    RoleService, TaskQueue, TenantResolver, TokenService,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::well_known::openid_configuration,
        handlers::well_known::jwks,
        handlers::auth::authorize::authorize,
        handlers::auth::login::login_page,
        handlers::auth::login::login,
        handlers::auth::consent::consent_page,
        handlers::auth::consent::consent,
        handlers::oauth::token,
        handlers::oauth::userinfo,
        handlers::admin::tenants::list_tenants,
        handlers::admin::tenants::create_tenant,
        handlers::admin::tenants::rotate_tenant_key,
        handlers::admin::clients::create_client,
        handlers::admin::users::create_user,
        handlers::admin::users::assign_role,
        handlers::admin::users::unassign_role,
        handlers::admin::users::add_user_permission,
        handlers::admin::users::list_user_permissions,
        handlers::admin::roles::create_permission,
        handlers::admin::roles::create_role,
        handlers::admin::roles::update_role,
        handlers::admin::roles::delete_role,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::OAuthErrorResponse,
            dtos::auth::LoginForm,
            dtos::auth::LoginPageResponse,
            dtos::auth::ConsentAction,
            dtos::auth::ConsentForm,
            dtos::auth::ConsentPageResponse,
            dtos::oauth::TokenRequest,
            dtos::oauth::UserInfoResponse,
            dtos::oauth::DiscoveryDocument,
            dtos::admin::CreateTenantRequest,
            dtos::admin::TenantResponse,
            dtos::admin::RotateKeyResponse,
            dtos::admin::CreateClientRequest,
            dtos::admin::CreateClientResponse,
            dtos::admin::CreateUserRequest,
            dtos::admin::CreatePermissionRequest,
            dtos::admin::CreateRoleRequest,
            dtos::admin::UpdateRoleRequest,
            dtos::admin::AddUserPermissionRequest,
            dtos::admin::MembershipResponse,
            dtos::admin::UserPermissionsResponse,
            services::TokenResponse,
            models::ClientType,
            models::SanitizedUser,
            models::Role,
            models::Permission,
            models::Jwk,
            models::JwkSet,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "OpenID Connect", description = "Authorization code flow, tokens and user claims"),
        (name = "Admin", description = "Workspace administration"),
        (name = "Well-Known", description = "Per-tenant provider metadata"),
        (name = "Observability", description = "Service health"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_token",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
            components.add_security_scheme(
                "admin_api_key",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new(ADMIN_API_KEY_HEADER))),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: IdentityConfig,
    pub resolver: TenantResolver,
    pub flow: AuthenticationFlow,
    pub tokens: TokenService,
    pub exchanger: CodeExchanger,
    pub refresher: RefreshService,
    pub admin: AdminService,
    pub roles: RoleService,
    pub queue: Arc<dyn TaskQueue>,
}

impl AppState {
    /// Wire the request-path services over the given backends.
    pub fn new(
        config: IdentityConfig,
        resolver: TenantResolver,
        queue: Arc<dyn TaskQueue>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let keys = KeyStore::new(config.oidc.retained_signing_keys);
        let tokens = TokenService::new(keys.clone());
        Self {
            flow: AuthenticationFlow::new(&config.oidc),
            exchanger: CodeExchanger::new(tokens.clone()),
            refresher: RefreshService::new(tokens.clone()),
            admin: AdminService::new(resolver.clone(), keys, events.clone()),
            roles: RoleService::new(queue.clone(), events),
            tokens,
            resolver,
            queue,
            config,
        }
    }
}

/// Endpoints every tenant exposes, mounted at the root for the default
/// tenant and under `/{tenant_slug}` for the others.
fn oidc_routes() -> Router<AppState> {
    Router::new()
        .route("/authorize", get(handlers::auth::authorize))
        .route(
            "/login",
            get(handlers::auth::login_page).post(handlers::auth::login),
        )
        .route(
            "/consent",
            get(handlers::auth::consent_page).post(handlers::auth::consent),
        )
        .route("/token", post(handlers::oauth::token))
        .route(
            "/userinfo",
            get(handlers::oauth::userinfo).post(handlers::oauth::userinfo),
        )
        .route(
            "/.well-known/openid-configuration",
            get(handlers::well_known::openid_configuration),
        )
        .route("/.well-known/jwks.json", get(handlers::well_known::jwks))
}

pub fn build_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route(
            "/admin/tenants",
            get(handlers::admin::list_tenants).post(handlers::admin::create_tenant),
        )
        .route(
            "/admin/tenants/:tenant_id/keys/rotate",
            post(handlers::admin::rotate_tenant_key),
        )
        .route(
            "/admin/tenants/:tenant_id/clients",
            post(handlers::admin::create_client),
        )
        .route(
            "/admin/tenants/:tenant_id/users",
            post(handlers::admin::create_user),
        )
        .route("/admin/permissions", post(handlers::admin::create_permission))
        .route("/admin/roles", post(handlers::admin::create_role))
        .route(
            "/admin/roles/:role_id",
            patch(handlers::admin::update_role).delete(handlers::admin::delete_role),
        )
        .route(
            "/admin/users/:user_id/roles/:role_id",
            put(handlers::admin::assign_role).delete(handlers::admin::unassign_role),
        )
        .route(
            "/admin/users/:user_id/permissions",
            get(handlers::admin::list_user_permissions).post(handlers::admin::add_user_permission),
        )
        .layer(from_fn_with_state(
            state.clone(),
            middleware::admin_auth_middleware,
        ));

    let allowed_origins = state
        .config
        .security
        .allowed_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(origin = %o, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<HeaderValue>>();

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/.well-known/openapi.json",
            get(|| async { service_core::axum::Json(ApiDoc::openapi()) }),
        )
        .merge(admin_routes)
        .merge(oidc_routes())
        .nest(
            &format!("/:{}", middleware::TENANT_SLUG_PARAM),
            oidc_routes(),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri().path(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(allowed_origins)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::PATCH,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    header::AUTHORIZATION,
                    header::CONTENT_TYPE,
                    HeaderName::from_static(ADMIN_API_KEY_HEADER),
                ]),
        )
}

/// Service health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 503, description = "Task queue unreachable")
    ),
    tag = "Observability"
)]
pub async fn health_check(
    service_core::axum::extract::State(state): service_core::axum::extract::State<AppState>,
) -> Result<service_core::axum::Json<serde_json::Value>, AppError> {
    state.queue.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Task queue health check failed");
        AppError::ServiceUnavailable(e.to_string())
    })?;

    Ok(service_core::axum::Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "environment": format!("{:?}", state.config.environment),
        "checks": {
            "queue": "up"
        }
    })))
}
