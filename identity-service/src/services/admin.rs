use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::models::{Client, ClientType, Jwk, SanitizedUser, Tenant, User};
use crate::services::error::ServiceError;
use crate::services::events::{publish, EventSink, EventType, WebhookEvent};
use crate::services::keys::{generate_tenant_key, KeyStore};
use crate::services::tenant::{TenantContext, TenantResolver, WorkspaceContext};
use crate::utils::password::{hash_password, Password};

/// Lifetimes the caller may override on a new client; `None` keeps the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientLifetimes {
    pub authorization_code_seconds: Option<i32>,
    pub access_id_token_seconds: Option<i32>,
    pub refresh_token_seconds: Option<i32>,
}

#[derive(Debug)]
pub struct NewClient {
    pub name: String,
    pub client_type: ClientType,
    pub redirect_uris: Vec<String>,
    pub first_party: bool,
    pub encrypt_jwk: Option<String>,
    pub lifetimes: ClientLifetimes,
}

/// First path segments owned by fixed routes; a tenant slug cannot shadow them.
const RESERVED_SLUGS: &[&str] = &[
    "admin",
    "health",
    "authorize",
    "token",
    "userinfo",
    "login",
    "consent",
];

/// Workspace-scoped management of tenants, their keys, clients and users.
#[derive(Clone)]
pub struct AdminService {
    resolver: TenantResolver,
    keys: KeyStore,
    events: Arc<dyn EventSink>,
}

fn check_encryption_key(jwk: Option<&str>) -> Result<(), ServiceError> {
    if let Some(raw) = jwk {
        Jwk::parse_encryption_key(raw).map_err(|e| {
            ServiceError::Invalid(format!("invalid encrypt_jwk: {}", e))
        })?;
    }
    Ok(())
}

impl AdminService {
    pub fn new(resolver: TenantResolver, keys: KeyStore, events: Arc<dyn EventSink>) -> Self {
        Self {
            resolver,
            keys,
            events,
        }
    }

    pub async fn list_tenants(
        &self,
        ws: &WorkspaceContext,
    ) -> Result<Vec<TenantContext>, ServiceError> {
        Ok(ws
            .store
            .list_tenants()
            .await?
            .into_iter()
            .map(|tenant| self.resolver.tenant_context(ws, tenant))
            .collect())
    }

    pub async fn tenant(
        &self,
        ws: &WorkspaceContext,
        tenant_id: Uuid,
    ) -> Result<TenantContext, ServiceError> {
        let tenant = ws
            .store
            .get_tenant(tenant_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("tenant {}", tenant_id)))?;
        Ok(self.resolver.tenant_context(ws, tenant))
    }

    /// Creates the tenant together with its first signing key.
    #[instrument(skip(self, ws, encrypt_jwk), fields(workspace_id = %ws.workspace.workspace_id))]
    pub async fn create_tenant(
        &self,
        ws: &WorkspaceContext,
        slug: &str,
        name: String,
        is_default: bool,
        encrypt_jwk: Option<String>,
    ) -> Result<TenantContext, ServiceError> {
        let slug = slug.trim().to_lowercase();
        if !slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ServiceError::Invalid(
                "slug may only contain letters, digits, '-' and '_'".into(),
            ));
        }
        if slug.is_empty() || RESERVED_SLUGS.contains(&slug.as_str()) {
            return Err(ServiceError::Invalid(format!("slug '{}' is reserved", slug)));
        }
        check_encryption_key(encrypt_jwk.as_deref())?;

        let mut tenant = Tenant::new(slug, name, is_default);
        tenant.encrypt_jwk = encrypt_jwk;
        let key = generate_tenant_key(tenant.tenant_id).await?;
        let tenant = ws.store.create_tenant(tenant, key).await?;

        publish(
            self.events.as_ref(),
            WebhookEvent::new(
                EventType::TenantCreated,
                ws.workspace.workspace_id,
                tenant.tenant_id,
                serde_json::json!({ "slug": tenant.slug, "name": tenant.name }),
            )
            .for_tenant(tenant.tenant_id),
        )
        .await;
        info!(tenant_id = %tenant.tenant_id, slug = %tenant.slug, "Tenant created");
        Ok(self.resolver.tenant_context(ws, tenant))
    }

    pub async fn rotate_tenant_key(
        &self,
        ws: &WorkspaceContext,
        tenant_id: Uuid,
    ) -> Result<String, ServiceError> {
        let ctx = self.tenant(ws, tenant_id).await?;
        let kid = self.keys.rotate(&ctx).await?;
        publish(
            self.events.as_ref(),
            WebhookEvent::new(
                EventType::TenantUpdated,
                ws.workspace.workspace_id,
                tenant_id,
                serde_json::json!({ "kid": kid }),
            )
            .for_tenant(tenant_id),
        )
        .await;
        Ok(kid)
    }

    /// Returns the client and its plaintext secret. Only the hash is kept.
    #[instrument(skip(self, ws, request), fields(workspace_id = %ws.workspace.workspace_id))]
    pub async fn create_client(
        &self,
        ws: &WorkspaceContext,
        tenant_id: Uuid,
        request: NewClient,
    ) -> Result<(Client, String), ServiceError> {
        let ctx = self.tenant(ws, tenant_id).await?;
        check_encryption_key(request.encrypt_jwk.as_deref())?;

        let (mut client, secret) = Client::new(
            ctx.tenant.tenant_id,
            request.name,
            request.client_type,
            request.redirect_uris,
            request.first_party,
        );
        client.encrypt_jwk = request.encrypt_jwk;
        let lifetimes = request.lifetimes;
        if let Some(seconds) = lifetimes.authorization_code_seconds {
            client.authorization_code_lifetime_seconds = seconds;
        }
        if let Some(seconds) = lifetimes.access_id_token_seconds {
            client.access_id_token_lifetime_seconds = seconds;
        }
        if let Some(seconds) = lifetimes.refresh_token_seconds {
            client.refresh_token_lifetime_seconds = seconds;
        }

        let client = ctx.store.create_client(client).await?;
        publish(
            self.events.as_ref(),
            WebhookEvent::new(
                EventType::ClientCreated,
                ws.workspace.workspace_id,
                client.client_pk,
                serde_json::json!({
                    "client_id": client.client_id,
                    "name": client.name,
                    "client_type": client.client_type,
                }),
            )
            .for_tenant(tenant_id),
        )
        .await;
        info!(
            tenant_id = %tenant_id,
            client_id = %client.client_id,
            client_type = %client.client_type,
            "Client created"
        );
        Ok((client, secret))
    }

    pub async fn create_user(
        &self,
        ws: &WorkspaceContext,
        tenant_id: Uuid,
        email: &str,
        password: &Password,
        email_verified: bool,
        fields: Option<serde_json::Value>,
    ) -> Result<SanitizedUser, ServiceError> {
        let ctx = self.tenant(ws, tenant_id).await?;
        let fields = match fields {
            None => serde_json::Value::Object(Default::default()),
            Some(value @ serde_json::Value::Object(_)) => value,
            Some(_) => {
                return Err(ServiceError::Invalid(
                    "fields must be a JSON object".into(),
                ))
            }
        };

        let mut user = User::new(
            ctx.tenant.tenant_id,
            email.trim().to_lowercase(),
            hash_password(password)?,
        );
        user.email_verified = email_verified;
        user.fields = fields;
        let user = ctx.store.create_user(user).await?;
        info!(tenant_id = %tenant_id, user_id = %user.user_id, "User created");
        Ok(user.sanitized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Workspace;
    use crate::services::events::MemoryEventSink;
    use crate::store::memory::{MemoryStoreProvider, MemoryWorkspaceDirectory};
    use crate::store::StoreError;

    async fn setup() -> (AdminService, WorkspaceContext, Arc<MemoryEventSink>) {
        let workspace = Workspace::new("Acme".into(), "acme.test".into(), "ws_acme".into());
        let directory = Arc::new(MemoryWorkspaceDirectory::new());
        directory.insert(workspace.clone()).await;
        let provider = Arc::new(MemoryStoreProvider::new());
        let resolver = TenantResolver::new(directory, provider, "https".into());
        let ws = resolver.workspace_context(workspace).await.unwrap();
        let events = Arc::new(MemoryEventSink::new());
        (
            AdminService::new(resolver, KeyStore::new(2), events.clone()),
            ws,
            events,
        )
    }

    #[tokio::test]
    async fn test_create_tenant_generates_key_and_issuer() {
        let (admin, ws, events) = setup().await;
        let ctx = admin
            .create_tenant(&ws, "Beta", "Beta".into(), false, None)
            .await
            .unwrap();

        assert_eq!(ctx.tenant.slug, "beta");
        assert_eq!(ctx.issuer, "https://acme.test/beta");
        let keys = ws.store.list_tenant_keys(ctx.tenant.tenant_id).await.unwrap();
        assert_eq!(keys.iter().filter(|k| k.is_current).count(), 1);
        assert_eq!(events.of_type(EventType::TenantCreated).await.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_slug_conflicts() {
        let (admin, ws, _) = setup().await;
        admin
            .create_tenant(&ws, "main", "Main".into(), true, None)
            .await
            .unwrap();
        let result = admin
            .create_tenant(&ws, "main", "Other".into(), false, None)
            .await;
        assert!(matches!(result, Err(ServiceError::Store(StoreError::Conflict(_)))));
    }

    #[tokio::test]
    async fn test_reserved_slug_is_rejected() {
        let (admin, ws, _) = setup().await;
        let result = admin
            .create_tenant(&ws, "admin", "Admin".into(), false, None)
            .await;
        assert!(matches!(result, Err(ServiceError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_create_client_applies_lifetimes_and_hides_secret() {
        let (admin, ws, events) = setup().await;
        let ctx = admin
            .create_tenant(&ws, "main", "Main".into(), true, None)
            .await
            .unwrap();
        let (client, secret) = admin
            .create_client(
                &ws,
                ctx.tenant.tenant_id,
                NewClient {
                    name: "web".into(),
                    client_type: ClientType::Confidential,
                    redirect_uris: vec!["https://app.test/cb".into()],
                    first_party: false,
                    encrypt_jwk: None,
                    lifetimes: ClientLifetimes {
                        access_id_token_seconds: Some(300),
                        ..Default::default()
                    },
                },
            )
            .await
            .unwrap();

        assert_eq!(client.access_id_token_lifetime_seconds, 300);
        assert_ne!(client.client_secret_hash, secret);
        assert!(client.verify_secret(&secret));
        assert_eq!(events.of_type(EventType::ClientCreated).await.len(), 1);
    }

    #[tokio::test]
    async fn test_create_user_for_unknown_tenant_is_not_found() {
        let (admin, ws, _) = setup().await;
        let result = admin
            .create_user(
                &ws,
                Uuid::new_v4(),
                "a@example.com",
                &Password::new("password123".into()),
                false,
                None,
            )
            .await;
        assert!(matches!(result, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rotate_key_keeps_one_current() {
        let (admin, ws, _) = setup().await;
        let ctx = admin
            .create_tenant(&ws, "main", "Main".into(), true, None)
            .await
            .unwrap();
        let kid = admin
            .rotate_tenant_key(&ws, ctx.tenant.tenant_id)
            .await
            .unwrap();

        let keys = ws.store.list_tenant_keys(ctx.tenant.tenant_id).await.unwrap();
        let current: Vec<_> = keys.iter().filter(|k| k.is_current).collect();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].kid, kid);
        assert_eq!(keys.len(), 2);
    }
}
