//! Per-tenant RS256 signing keys and their public JWKS form.
//!
//! Private keys are stored as PKCS#8 PEM in the workspace store. Parsed
//! `jsonwebtoken` keys are cached by `(workspace, kid)`; a kid is never
//! reused, so cache entries never go stale.

use dashmap::DashMap;
use jsonwebtoken::{DecodingKey, EncodingKey};
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::models::{Client, Jwk, JwkSet, TenantKey};
use crate::services::error::ServiceError;
use crate::services::tenant::TenantContext;
use crate::utils::crypto::b64url;

const RSA_KEY_BITS: usize = 2048;

/// A tenant key parsed for signing and verification.
pub struct LoadedKey {
    pub kid: String,
    pub is_current: bool,
    pub encoding_key: EncodingKey,
    pub decoding_key: DecodingKey,
    pub public_jwk: Jwk,
}

impl LoadedKey {
    pub fn from_tenant_key(key: &TenantKey) -> Result<Self, anyhow::Error> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(&key.private_key_pem)
            .map_err(|e| anyhow::anyhow!("Failed to parse signing key {}: {}", key.kid, e))?;

        let n = b64url(&private_key.n().to_bytes_be());
        let e = b64url(&private_key.e().to_bytes_be());

        let encoding_key = EncodingKey::from_rsa_pem(key.private_key_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to load signing key {}: {}", key.kid, e))?;
        let decoding_key = DecodingKey::from_rsa_components(&n, &e)
            .map_err(|e| anyhow::anyhow!("Failed to load verification key {}: {}", key.kid, e))?;

        Ok(Self {
            kid: key.kid.clone(),
            is_current: key.is_current,
            encoding_key,
            decoding_key,
            public_jwk: Jwk::rsa_signing(key.kid.clone(), n, e),
        })
    }
}

/// Generate a fresh RSA-2048 key for a tenant. Runs on the blocking pool.
pub async fn generate_tenant_key(tenant_id: Uuid) -> Result<TenantKey, anyhow::Error> {
    tokio::task::spawn_blocking(move || {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
            .map_err(|e| anyhow::anyhow!("Failed to generate RSA key: {}", e))?;
        let pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| anyhow::anyhow!("Failed to encode RSA key: {}", e))?;

        let mut kid_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut kid_bytes);

        Ok(TenantKey {
            kid: hex::encode(kid_bytes),
            tenant_id,
            private_key_pem: pem.as_str().to_owned(),
            is_current: true,
            created_utc: chrono::Utc::now(),
        })
    })
    .await
    .map_err(|e| anyhow::anyhow!("Key generation task failed: {}", e))?
}

#[derive(Clone)]
pub struct KeyStore {
    cache: Arc<DashMap<(Uuid, String), Arc<LoadedKey>>>,
    retained_keys: usize,
}

impl KeyStore {
    pub fn new(retained_keys: usize) -> Self {
        Self {
            cache: Arc::new(DashMap::new()),
            retained_keys,
        }
    }

    fn load(&self, workspace_id: Uuid, key: &TenantKey) -> Result<Arc<LoadedKey>, ServiceError> {
        let cache_key = (workspace_id, key.kid.clone());
        if let Some(loaded) = self.cache.get(&cache_key) {
            if loaded.is_current == key.is_current {
                return Ok(loaded.clone());
            }
        }
        let loaded = Arc::new(LoadedKey::from_tenant_key(key)?);
        self.cache.insert(cache_key, loaded.clone());
        Ok(loaded)
    }

    /// Current key first, then retained keys.
    pub async fn verification_keys(
        &self,
        ctx: &TenantContext,
    ) -> Result<Vec<Arc<LoadedKey>>, ServiceError> {
        let keys = ctx.store.list_tenant_keys(ctx.tenant.tenant_id).await?;
        keys.iter()
            .map(|key| self.load(ctx.workspace.workspace_id, key))
            .collect()
    }

    pub async fn signing_key(&self, ctx: &TenantContext) -> Result<Arc<LoadedKey>, ServiceError> {
        self.verification_keys(ctx)
            .await?
            .into_iter()
            .find(|key| key.is_current)
            .ok_or_else(|| {
                ServiceError::Internal(anyhow::anyhow!(
                    "Tenant {} has no current signing key",
                    ctx.tenant.tenant_id
                ))
            })
    }

    pub async fn find_verification_key(
        &self,
        ctx: &TenantContext,
        kid: &str,
    ) -> Result<Option<Arc<LoadedKey>>, ServiceError> {
        Ok(self
            .verification_keys(ctx)
            .await?
            .into_iter()
            .find(|key| key.kid == kid))
    }

    pub async fn jwks(&self, ctx: &TenantContext) -> Result<JwkSet, ServiceError> {
        let keys = self.verification_keys(ctx).await?;
        Ok(JwkSet {
            keys: keys.iter().map(|key| key.public_jwk.clone()).collect(),
        })
    }

    /// The client's encryption key, falling back to the tenant's.
    pub fn encryption_key(
        &self,
        ctx: &TenantContext,
        client: &Client,
    ) -> Result<Option<Jwk>, ServiceError> {
        client
            .encrypt_jwk
            .as_deref()
            .or(ctx.tenant.encrypt_jwk.as_deref())
            .map(Jwk::parse_encryption_key)
            .transpose()
            .map_err(ServiceError::Internal)
    }

    /// Replace the current signing key; the previous one stays published for
    /// verification until pushed out by later rotations.
    pub async fn rotate(&self, ctx: &TenantContext) -> Result<String, ServiceError> {
        let key = generate_tenant_key(ctx.tenant.tenant_id).await?;
        let kid = key.kid.clone();
        ctx.store.rotate_tenant_key(key, self.retained_keys).await?;
        info!(
            tenant_id = %ctx.tenant.tenant_id,
            kid = %kid,
            "Tenant signing key rotated"
        );
        Ok(kid)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::tenant_key;
    use super::*;
    use crate::models::{ClientType, Tenant, Workspace};
    use crate::store::memory::MemoryWorkspaceStore;
    use crate::store::WorkspaceStore;

    async fn context() -> TenantContext {
        let store = Arc::new(MemoryWorkspaceStore::new());
        let tenant = Tenant::new("main".into(), "Main".into(), true);
        store
            .create_tenant(tenant.clone(), tenant_key(tenant.tenant_id, "k1"))
            .await
            .unwrap();
        TenantContext {
            workspace: Workspace::new("Acme".into(), "acme.test".into(), "ws_acme".into()),
            tenant,
            store,
            issuer: "https://acme.test".into(),
        }
    }

    #[test]
    fn test_loaded_key_exports_public_jwk_only() {
        let key = LoadedKey::from_tenant_key(&tenant_key(Uuid::new_v4(), "k1")).unwrap();
        let jwk = serde_json::to_value(&key.public_jwk).unwrap();
        assert_eq!(jwk["kty"], "RSA");
        assert_eq!(jwk["kid"], "k1");
        assert_eq!(jwk["alg"], "RS256");
        assert_eq!(jwk["e"], "AQAB");
        assert!(jwk.get("d").is_none());
    }

    #[tokio::test]
    async fn test_signing_key_is_current_key() {
        let ctx = context().await;
        let keys = KeyStore::new(2);
        let signing = keys.signing_key(&ctx).await.unwrap();
        assert_eq!(signing.kid, "k1");
        assert_eq!(keys.jwks(&ctx).await.unwrap().keys.len(), 1);
    }

    #[tokio::test]
    async fn test_rotation_keeps_previous_key_published() {
        let ctx = context().await;
        let keys = KeyStore::new(1);
        let new_kid = keys.rotate(&ctx).await.unwrap();

        assert_eq!(keys.signing_key(&ctx).await.unwrap().kid, new_kid);
        let published: Vec<String> = keys
            .jwks(&ctx)
            .await
            .unwrap()
            .keys
            .into_iter()
            .filter_map(|k| k.kid)
            .collect();
        assert_eq!(published, vec![new_kid, "k1".to_string()]);
        assert!(keys.find_verification_key(&ctx, "k1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_client_encryption_key_overrides_tenant_key() {
        let mut ctx = context().await;
        ctx.tenant.encrypt_jwk =
            Some(r#"{"kty":"RSA","use":"enc","kid":"tenant","n":"AQ","e":"AQAB"}"#.into());
        let (mut client, _) = Client::new(
            ctx.tenant.tenant_id,
            "App".into(),
            ClientType::Confidential,
            vec![],
            false,
        );
        let keys = KeyStore::new(2);
        let tenant_jwk = keys.encryption_key(&ctx, &client).unwrap().unwrap();
        assert_eq!(tenant_jwk.kid.as_deref(), Some("tenant"));

        client.encrypt_jwk = Some(r#"{"kty":"RSA","kid":"client","n":"AQ","e":"AQAB"}"#.into());
        let client_jwk = keys.encryption_key(&ctx, &client).unwrap().unwrap();
        assert_eq!(client_jwk.kid.as_deref(), Some("client"));
    }
}
