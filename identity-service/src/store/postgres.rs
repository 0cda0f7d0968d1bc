//! PostgreSQL implementation of the workspace store.
//!
//! A `PgWorkspaceStore` owns a pool whose connections have `search_path` set
//! to the workspace schema, so the SQL below never names a schema.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use tracing::instrument;
use uuid::Uuid;

use super::{PurgeReport, StoreError, StoreResult, WorkspaceDirectory, WorkspaceStore};
use crate::models::{
    Acr, AuthorizationCode, Client, CodeChallengeMethod, Grant, LoginSession, Permission, Prompt,
    RefreshRotation, RefreshToken, ResponseMode, Role, SessionToken, Tenant, TenantKey, User,
    UserPermission, Workspace,
};

const TENANT_COLUMNS: &str = "tenant_id, slug, name, is_default, encrypt_jwk, created_utc";
const CLIENT_COLUMNS: &str = "client_pk, tenant_id, name, client_id, client_secret_hash, client_type, \
     first_party, redirect_uris, encrypt_jwk, authorization_code_lifetime_seconds, \
     access_id_token_lifetime_seconds, refresh_token_lifetime_seconds, created_utc";
const USER_COLUMNS: &str =
    "user_id, tenant_id, email, email_verified, hashed_password, fields, created_utc";
const REFRESH_COLUMNS: &str = "token_hash, family_id, tenant_id, client_pk, user_id, scope, acr, \
     authenticated_at, expires_at, created_utc";

/// Translate driver errors into the store's vocabulary.
fn map_db_error(context: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            StoreError::Conflict(format!("{}: {}", context, db_err.message()))
        }
        sqlx::Error::Database(ref db_err) if db_err.is_foreign_key_violation() => {
            StoreError::NotFound(format!("{}: {}", context, db_err.message()))
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(format!("{}: {}", context, e))
        }
        other => StoreError::Unexpected(anyhow::anyhow!("{}: {}", context, other)),
    }
}

fn parse_column<T>(value: &str) -> StoreResult<T>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e: String| StoreError::Unexpected(anyhow::anyhow!("corrupt column: {}", e)))
}

fn parse_acr(value: i16) -> StoreResult<Acr> {
    Acr::try_from(value)
        .map_err(|e| StoreError::Unexpected(anyhow::anyhow!("corrupt column: {}", e)))
}

#[derive(FromRow)]
struct LoginSessionRow {
    token: String,
    tenant_id: Uuid,
    client_pk: Uuid,
    response_type: String,
    response_mode: String,
    redirect_uri: String,
    scope: Vec<String>,
    prompt: Option<String>,
    state: Option<String>,
    nonce: Option<String>,
    acr_requested: Option<i16>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    authenticated_user_id: Option<Uuid>,
    authenticated_acr: Option<i16>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<LoginSessionRow> for LoginSession {
    type Error = StoreError;

    fn try_from(row: LoginSessionRow) -> Result<Self, Self::Error> {
        Ok(LoginSession {
            token: row.token,
            tenant_id: row.tenant_id,
            client_pk: row.client_pk,
            response_type: row.response_type,
            response_mode: parse_column::<ResponseMode>(&row.response_mode)?,
            redirect_uri: row.redirect_uri,
            scope: row.scope,
            prompt: row.prompt.as_deref().map(parse_column::<Prompt>).transpose()?,
            state: row.state,
            nonce: row.nonce,
            acr_requested: row.acr_requested.map(parse_acr).transpose()?,
            code_challenge: row.code_challenge,
            code_challenge_method: row
                .code_challenge_method
                .as_deref()
                .map(parse_column::<CodeChallengeMethod>)
                .transpose()?,
            authenticated_user_id: row.authenticated_user_id,
            authenticated_acr: row.authenticated_acr.map(parse_acr).transpose()?,
            expires_at: row.expires_at,
        })
    }
}

#[derive(FromRow)]
struct AuthorizationCodeRow {
    code_hash: String,
    c_hash: String,
    tenant_id: Uuid,
    client_pk: Uuid,
    user_id: Uuid,
    redirect_uri: String,
    scope: Vec<String>,
    authenticated_at: DateTime<Utc>,
    nonce: Option<String>,
    acr: i16,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<AuthorizationCodeRow> for AuthorizationCode {
    type Error = StoreError;

    fn try_from(row: AuthorizationCodeRow) -> Result<Self, Self::Error> {
        Ok(AuthorizationCode {
            code_hash: row.code_hash,
            c_hash: row.c_hash,
            tenant_id: row.tenant_id,
            client_pk: row.client_pk,
            user_id: row.user_id,
            redirect_uri: row.redirect_uri,
            scope: row.scope,
            authenticated_at: row.authenticated_at,
            nonce: row.nonce,
            acr: parse_acr(row.acr)?,
            code_challenge: row.code_challenge,
            code_challenge_method: row
                .code_challenge_method
                .as_deref()
                .map(parse_column::<CodeChallengeMethod>)
                .transpose()?,
            expires_at: row.expires_at,
        })
    }
}

/// Store backed by one workspace schema.
#[derive(Clone)]
pub struct PgWorkspaceStore {
    pool: PgPool,
}

impl PgWorkspaceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl WorkspaceStore for PgWorkspaceStore {
    // ==================== Tenants & keys ====================

    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>> {
        sqlx::query_as::<_, Tenant>(&format!(
            "SELECT {} FROM tenants ORDER BY slug",
            TENANT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error("list tenants"))
    }

    async fn get_tenant(&self, tenant_id: Uuid) -> StoreResult<Option<Tenant>> {
        sqlx::query_as::<_, Tenant>(&format!(
            "SELECT {} FROM tenants WHERE tenant_id = $1",
            TENANT_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error("get tenant"))
    }

    async fn get_default_tenant(&self) -> StoreResult<Option<Tenant>> {
        sqlx::query_as::<_, Tenant>(&format!(
            "SELECT {} FROM tenants WHERE is_default",
            TENANT_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error("get default tenant"))
    }

    async fn get_tenant_by_slug(&self, slug: &str) -> StoreResult<Option<Tenant>> {
        sqlx::query_as::<_, Tenant>(&format!(
            "SELECT {} FROM tenants WHERE slug = $1",
            TENANT_COLUMNS
        ))
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error("get tenant by slug"))
    }

    #[instrument(skip(self, tenant, key), fields(tenant_slug = %tenant.slug))]
    async fn create_tenant(&self, tenant: Tenant, key: TenantKey) -> StoreResult<Tenant> {
        let mut tx = self.pool.begin().await.map_err(map_db_error("begin"))?;

        let created = sqlx::query_as::<_, Tenant>(&format!(
            r#"
            INSERT INTO tenants (tenant_id, slug, name, is_default, encrypt_jwk, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            TENANT_COLUMNS
        ))
        .bind(tenant.tenant_id)
        .bind(&tenant.slug)
        .bind(&tenant.name)
        .bind(tenant.is_default)
        .bind(&tenant.encrypt_jwk)
        .bind(tenant.created_utc)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error("create tenant"))?;

        sqlx::query(
            r#"
            INSERT INTO tenant_keys (kid, tenant_id, private_key_pem, is_current, created_utc)
            VALUES ($1, $2, $3, TRUE, $4)
            "#,
        )
        .bind(&key.kid)
        .bind(created.tenant_id)
        .bind(&key.private_key_pem)
        .bind(key.created_utc)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error("create tenant key"))?;

        tx.commit().await.map_err(map_db_error("commit"))?;
        Ok(created)
    }

    async fn list_tenant_keys(&self, tenant_id: Uuid) -> StoreResult<Vec<TenantKey>> {
        sqlx::query_as::<_, TenantKey>(
            r#"
            SELECT kid, tenant_id, private_key_pem, is_current, created_utc
            FROM tenant_keys
            WHERE tenant_id = $1
            ORDER BY is_current DESC, created_utc DESC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error("list tenant keys"))
    }

    #[instrument(skip(self, key), fields(tenant_id = %key.tenant_id, kid = %key.kid))]
    async fn rotate_tenant_key(&self, key: TenantKey, retain: usize) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_db_error("begin"))?;

        sqlx::query("UPDATE tenant_keys SET is_current = FALSE WHERE tenant_id = $1 AND is_current")
            .bind(key.tenant_id)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error("retire tenant key"))?;

        sqlx::query(
            r#"
            INSERT INTO tenant_keys (kid, tenant_id, private_key_pem, is_current, created_utc)
            VALUES ($1, $2, $3, TRUE, $4)
            "#,
        )
        .bind(&key.kid)
        .bind(key.tenant_id)
        .bind(&key.private_key_pem)
        .bind(key.created_utc)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error("insert tenant key"))?;

        sqlx::query(
            r#"
            DELETE FROM tenant_keys
            WHERE tenant_id = $1
              AND kid NOT IN (
                SELECT kid FROM tenant_keys
                WHERE tenant_id = $1
                ORDER BY is_current DESC, created_utc DESC
                LIMIT $2
              )
            "#,
        )
        .bind(key.tenant_id)
        .bind((retain + 1) as i64)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error("prune tenant keys"))?;

        tx.commit().await.map_err(map_db_error("commit"))?;
        Ok(())
    }

    // ==================== Clients & users ====================

    async fn create_client(&self, client: Client) -> StoreResult<Client> {
        sqlx::query_as::<_, Client>(&format!(
            r#"
            INSERT INTO clients ({cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {cols}
            "#,
            cols = CLIENT_COLUMNS
        ))
        .bind(client.client_pk)
        .bind(client.tenant_id)
        .bind(&client.name)
        .bind(&client.client_id)
        .bind(&client.client_secret_hash)
        .bind(client.client_type.as_str())
        .bind(client.first_party)
        .bind(&client.redirect_uris)
        .bind(&client.encrypt_jwk)
        .bind(client.authorization_code_lifetime_seconds)
        .bind(client.access_id_token_lifetime_seconds)
        .bind(client.refresh_token_lifetime_seconds)
        .bind(client.created_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error("create client"))
    }

    async fn get_client(&self, tenant_id: Uuid, client_pk: Uuid) -> StoreResult<Option<Client>> {
        sqlx::query_as::<_, Client>(&format!(
            "SELECT {} FROM clients WHERE tenant_id = $1 AND client_pk = $2",
            CLIENT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(client_pk)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error("get client"))
    }

    async fn get_client_by_client_id(
        &self,
        tenant_id: Uuid,
        client_id: &str,
    ) -> StoreResult<Option<Client>> {
        sqlx::query_as::<_, Client>(&format!(
            "SELECT {} FROM clients WHERE tenant_id = $1 AND client_id = $2",
            CLIENT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error("get client by client_id"))
    }

    async fn create_user(&self, user: User) -> StoreResult<User> {
        sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users ({cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {cols}
            "#,
            cols = USER_COLUMNS
        ))
        .bind(user.user_id)
        .bind(user.tenant_id)
        .bind(&user.email)
        .bind(user.email_verified)
        .bind(&user.hashed_password)
        .bind(&user.fields)
        .bind(user.created_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error("create user"))
    }

    async fn get_user(&self, tenant_id: Uuid, user_id: Uuid) -> StoreResult<Option<User>> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE tenant_id = $1 AND user_id = $2",
            USER_COLUMNS
        ))
        .bind(tenant_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error("get user"))
    }

    async fn get_user_tenant_id(&self, user_id: Uuid) -> StoreResult<Option<Uuid>> {
        sqlx::query_scalar::<_, Uuid>("SELECT tenant_id FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error("get user tenant"))
    }

    async fn get_user_by_email(&self, tenant_id: Uuid, email: &str) -> StoreResult<Option<User>> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE tenant_id = $1 AND email = $2",
            USER_COLUMNS
        ))
        .bind(tenant_id)
        .bind(email.to_lowercase())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error("get user by email"))
    }

    // ==================== Login sessions & codes ====================

    async fn create_login_session(&self, session: LoginSession) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO login_sessions (
                token, tenant_id, client_pk, response_type, response_mode, redirect_uri, scope,
                prompt, state, nonce, acr_requested, code_challenge, code_challenge_method,
                authenticated_user_id, authenticated_acr, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(&session.token)
        .bind(session.tenant_id)
        .bind(session.client_pk)
        .bind(&session.response_type)
        .bind(session.response_mode.as_str())
        .bind(&session.redirect_uri)
        .bind(&session.scope)
        .bind(session.prompt.map(|p| p.as_str()))
        .bind(&session.state)
        .bind(&session.nonce)
        .bind(session.acr_requested.map(|a| a.as_i16()))
        .bind(&session.code_challenge)
        .bind(session.code_challenge_method.map(|m| m.as_str()))
        .bind(session.authenticated_user_id)
        .bind(session.authenticated_acr.map(|a| a.as_i16()))
        .bind(session.expires_at)
        .execute(&self.pool)
        .await
        .map_err(map_db_error("create login session"))?;
        Ok(())
    }

    async fn get_login_session(
        &self,
        tenant_id: Uuid,
        token: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<LoginSession>> {
        let row = sqlx::query_as::<_, LoginSessionRow>(
            r#"
            SELECT token, tenant_id, client_pk, response_type, response_mode, redirect_uri, scope,
                   prompt, state, nonce, acr_requested, code_challenge, code_challenge_method,
                   authenticated_user_id, authenticated_acr, expires_at
            FROM login_sessions
            WHERE tenant_id = $1 AND token = $2 AND expires_at > $3
            "#,
        )
        .bind(tenant_id)
        .bind(token)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error("get login session"))?;

        row.map(LoginSession::try_from).transpose()
    }

    async fn update_login_session(&self, session: &LoginSession) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE login_sessions
            SET authenticated_user_id = $3, authenticated_acr = $4
            WHERE tenant_id = $1 AND token = $2
            "#,
        )
        .bind(session.tenant_id)
        .bind(&session.token)
        .bind(session.authenticated_user_id)
        .bind(session.authenticated_acr.map(|a| a.as_i16()))
        .execute(&self.pool)
        .await
        .map_err(map_db_error("update login session"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("login session".into()));
        }
        Ok(())
    }

    async fn delete_login_session(&self, tenant_id: Uuid, token: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM login_sessions WHERE tenant_id = $1 AND token = $2")
            .bind(tenant_id)
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(map_db_error("delete login session"))?;
        Ok(())
    }

    async fn take_login_session(
        &self,
        tenant_id: Uuid,
        token: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<LoginSession>> {
        let row = sqlx::query_as::<_, LoginSessionRow>(
            r#"
            DELETE FROM login_sessions
            WHERE tenant_id = $1 AND token = $2 AND expires_at > $3
            RETURNING token, tenant_id, client_pk, response_type, response_mode, redirect_uri,
                      scope, prompt, state, nonce, acr_requested, code_challenge,
                      code_challenge_method, authenticated_user_id, authenticated_acr, expires_at
            "#,
        )
        .bind(tenant_id)
        .bind(token)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error("take login session"))?;

        row.map(LoginSession::try_from).transpose()
    }

    async fn create_authorization_code(&self, code: AuthorizationCode) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO authorization_codes (
                code_hash, c_hash, tenant_id, client_pk, user_id, redirect_uri, scope,
                authenticated_at, nonce, acr, code_challenge, code_challenge_method, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(&code.code_hash)
        .bind(&code.c_hash)
        .bind(code.tenant_id)
        .bind(code.client_pk)
        .bind(code.user_id)
        .bind(&code.redirect_uri)
        .bind(&code.scope)
        .bind(code.authenticated_at)
        .bind(&code.nonce)
        .bind(code.acr.as_i16())
        .bind(&code.code_challenge)
        .bind(code.code_challenge_method.map(|m| m.as_str()))
        .bind(code.expires_at)
        .execute(&self.pool)
        .await
        .map_err(map_db_error("create authorization code"))?;
        Ok(())
    }

    #[instrument(skip(self, code_hash))]
    async fn take_authorization_code(
        &self,
        tenant_id: Uuid,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<AuthorizationCode>> {
        // DELETE ... RETURNING is the single-use primitive: a row lock makes
        // the second of two concurrent deletes see zero rows.
        let row = sqlx::query_as::<_, AuthorizationCodeRow>(
            r#"
            DELETE FROM authorization_codes
            WHERE tenant_id = $1 AND code_hash = $2 AND expires_at > $3
            RETURNING code_hash, c_hash, tenant_id, client_pk, user_id, redirect_uri, scope,
                      authenticated_at, nonce, acr, code_challenge, code_challenge_method, expires_at
            "#,
        )
        .bind(tenant_id)
        .bind(code_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error("take authorization code"))?;

        row.map(AuthorizationCode::try_from).transpose()
    }

    // ==================== Grants ====================

    async fn get_grant(&self, user_id: Uuid, client_pk: Uuid) -> StoreResult<Option<Grant>> {
        sqlx::query_as::<_, Grant>(
            r#"
            SELECT user_id, client_pk, scope, created_utc, updated_utc
            FROM grants
            WHERE user_id = $1 AND client_pk = $2
            "#,
        )
        .bind(user_id)
        .bind(client_pk)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error("get grant"))
    }

    async fn upsert_grant(&self, grant: Grant) -> StoreResult<Grant> {
        sqlx::query_as::<_, Grant>(
            r#"
            INSERT INTO grants (user_id, client_pk, scope, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, client_pk)
            DO UPDATE SET scope = EXCLUDED.scope, updated_utc = EXCLUDED.updated_utc
            RETURNING user_id, client_pk, scope, created_utc, updated_utc
            "#,
        )
        .bind(grant.user_id)
        .bind(grant.client_pk)
        .bind(&grant.scope)
        .bind(grant.created_utc)
        .bind(grant.updated_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error("upsert grant"))
    }

    // ==================== Refresh & session tokens ====================

    async fn create_refresh_token(&self, token: RefreshToken) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO refresh_tokens ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            REFRESH_COLUMNS
        ))
        .bind(&token.token_hash)
        .bind(token.family_id)
        .bind(token.tenant_id)
        .bind(token.client_pk)
        .bind(token.user_id)
        .bind(&token.scope)
        .bind(token.acr.as_i16())
        .bind(token.authenticated_at)
        .bind(token.expires_at)
        .bind(token.created_utc)
        .execute(&self.pool)
        .await
        .map_err(map_db_error("create refresh token"))?;
        Ok(())
    }

    async fn get_refresh_token(
        &self,
        tenant_id: Uuid,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RefreshToken>> {
        sqlx::query_as::<_, RefreshToken>(&format!(
            "SELECT {} FROM refresh_tokens WHERE tenant_id = $1 AND token_hash = $2 AND expires_at > $3",
            REFRESH_COLUMNS
        ))
        .bind(tenant_id)
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error("get refresh token"))
    }

    async fn list_refresh_tokens(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        client_pk: Uuid,
    ) -> StoreResult<Vec<RefreshToken>> {
        sqlx::query_as::<_, RefreshToken>(&format!(
            "SELECT {} FROM refresh_tokens WHERE tenant_id = $1 AND user_id = $2 AND client_pk = $3",
            REFRESH_COLUMNS
        ))
        .bind(tenant_id)
        .bind(user_id)
        .bind(client_pk)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error("list refresh tokens"))
    }

    #[instrument(skip(self, presented_hash, successor_hash))]
    async fn rotate_refresh_token(
        &self,
        tenant_id: Uuid,
        presented_hash: &str,
        client_pk: Uuid,
        successor_hash: &str,
        successor_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<RefreshRotation> {
        let mut tx = self.pool.begin().await.map_err(map_db_error("begin"))?;

        let consumed = sqlx::query_as::<_, RefreshToken>(&format!(
            r#"
            DELETE FROM refresh_tokens
            WHERE tenant_id = $1 AND token_hash = $2 AND client_pk = $3 AND expires_at > $4
            RETURNING {}
            "#,
            REFRESH_COLUMNS
        ))
        .bind(tenant_id)
        .bind(presented_hash)
        .bind(client_pk)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_error("consume refresh token"))?;

        if let Some(consumed) = consumed {
            sqlx::query(
                r#"
                INSERT INTO rotated_refresh_tokens (token_hash, tenant_id, family_id, expires_at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&consumed.token_hash)
            .bind(consumed.tenant_id)
            .bind(consumed.family_id)
            .bind(consumed.expires_at)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error("record rotated refresh token"))?;

            let successor =
                consumed.successor(successor_hash.to_string(), successor_expires_at, now);
            sqlx::query(&format!(
                "INSERT INTO refresh_tokens ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                REFRESH_COLUMNS
            ))
            .bind(&successor.token_hash)
            .bind(successor.family_id)
            .bind(successor.tenant_id)
            .bind(successor.client_pk)
            .bind(successor.user_id)
            .bind(&successor.scope)
            .bind(successor.acr.as_i16())
            .bind(successor.authenticated_at)
            .bind(successor.expires_at)
            .bind(successor.created_utc)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error("insert successor refresh token"))?;

            tx.commit().await.map_err(map_db_error("commit"))?;
            return Ok(RefreshRotation::Rotated(successor));
        }

        let family_id: Option<Uuid> = sqlx::query_scalar(
            "SELECT family_id FROM rotated_refresh_tokens WHERE tenant_id = $1 AND token_hash = $2",
        )
        .bind(tenant_id)
        .bind(presented_hash)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_error("look up rotated refresh token"))?;

        let outcome = match family_id {
            Some(family_id) => {
                let revoked =
                    sqlx::query("DELETE FROM refresh_tokens WHERE tenant_id = $1 AND family_id = $2")
                        .bind(tenant_id)
                        .bind(family_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(map_db_error("revoke refresh token family"))?
                        .rows_affected();
                RefreshRotation::Reused { family_id, revoked }
            }
            None => RefreshRotation::Absent,
        };

        tx.commit().await.map_err(map_db_error("commit"))?;
        Ok(outcome)
    }

    async fn create_session_token(&self, token: SessionToken) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO session_tokens (token_hash, tenant_id, user_id, expires_at, created_utc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&token.token_hash)
        .bind(token.tenant_id)
        .bind(token.user_id)
        .bind(token.expires_at)
        .bind(token.created_utc)
        .execute(&self.pool)
        .await
        .map_err(map_db_error("create session token"))?;
        Ok(())
    }

    async fn get_session_token(
        &self,
        tenant_id: Uuid,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<SessionToken>> {
        sqlx::query_as::<_, SessionToken>(
            r#"
            SELECT token_hash, tenant_id, user_id, expires_at, created_utc
            FROM session_tokens
            WHERE tenant_id = $1 AND token_hash = $2 AND expires_at > $3
            "#,
        )
        .bind(tenant_id)
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error("get session token"))
    }

    // ==================== RBAC ====================

    async fn create_permission(&self, permission: Permission) -> StoreResult<Permission> {
        sqlx::query_as::<_, Permission>(
            r#"
            INSERT INTO permissions (permission_id, name, codename, created_utc)
            VALUES ($1, $2, $3, $4)
            RETURNING permission_id, name, codename, created_utc
            "#,
        )
        .bind(permission.permission_id)
        .bind(&permission.name)
        .bind(&permission.codename)
        .bind(permission.created_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error("create permission"))
    }

    async fn create_role(&self, role: Role, permission_ids: &[Uuid]) -> StoreResult<Role> {
        let mut tx = self.pool.begin().await.map_err(map_db_error("begin"))?;

        let created = sqlx::query_as::<_, Role>(
            r#"
            INSERT INTO roles (role_id, name, created_utc)
            VALUES ($1, $2, $3)
            RETURNING role_id, name, created_utc
            "#,
        )
        .bind(role.role_id)
        .bind(&role.name)
        .bind(role.created_utc)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error("create role"))?;

        sqlx::query(
            r#"
            INSERT INTO role_permissions (role_id, permission_id)
            SELECT $1, unnest($2::uuid[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(created.role_id)
        .bind(permission_ids)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error("attach role permissions"))?;

        tx.commit().await.map_err(map_db_error("commit"))?;
        Ok(created)
    }

    async fn get_role(&self, role_id: Uuid) -> StoreResult<Option<Role>> {
        sqlx::query_as::<_, Role>("SELECT role_id, name, created_utc FROM roles WHERE role_id = $1")
            .bind(role_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error("get role"))
    }

    async fn delete_role(&self, role_id: Uuid) -> StoreResult<bool> {
        // role_permissions, user_roles and derived user_permissions cascade.
        let result = sqlx::query("DELETE FROM roles WHERE role_id = $1")
            .bind(role_id)
            .execute(&self.pool)
            .await
            .map_err(map_db_error("delete role"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_role_permissions(
        &self,
        role_id: Uuid,
        permission_ids: &[Uuid],
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO role_permissions (role_id, permission_id)
            SELECT $1, unnest($2::uuid[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(role_id)
        .bind(permission_ids)
        .execute(&self.pool)
        .await
        .map_err(map_db_error("add role permissions"))?;
        Ok(())
    }

    async fn remove_role_permissions(
        &self,
        role_id: Uuid,
        permission_ids: &[Uuid],
    ) -> StoreResult<()> {
        sqlx::query("DELETE FROM role_permissions WHERE role_id = $1 AND permission_id = ANY($2)")
            .bind(role_id)
            .bind(permission_ids)
            .execute(&self.pool)
            .await
            .map_err(map_db_error("remove role permissions"))?;
        Ok(())
    }

    async fn list_role_permission_ids(&self, role_id: Uuid) -> StoreResult<Vec<Uuid>> {
        sqlx::query_scalar("SELECT permission_id FROM role_permissions WHERE role_id = $1")
            .bind(role_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error("list role permissions"))
    }

    async fn list_role_user_ids(&self, role_id: Uuid) -> StoreResult<Vec<Uuid>> {
        sqlx::query_scalar("SELECT user_id FROM user_roles WHERE role_id = $1 ORDER BY user_id")
            .bind(role_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error("list role users"))
    }

    async fn assign_user_role(&self, user_id: Uuid, role_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO user_roles (user_id, role_id, created_utc)
            VALUES ($1, $2, NOW())
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(role_id)
        .execute(&self.pool)
        .await
        .map_err(map_db_error("assign user role"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn unassign_user_role(&self, user_id: Uuid, role_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM user_roles WHERE user_id = $1 AND role_id = $2")
            .bind(user_id)
            .bind(role_id)
            .execute(&self.pool)
            .await
            .map_err(map_db_error("unassign user role"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn user_has_role(&self, user_id: Uuid, role_id: Uuid) -> StoreResult<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM user_roles WHERE user_id = $1 AND role_id = $2)",
        )
        .bind(user_id)
        .bind(role_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error("check user role"))
    }

    async fn list_user_permissions(&self, user_id: Uuid) -> StoreResult<Vec<UserPermission>> {
        sqlx::query_as::<_, UserPermission>(
            r#"
            SELECT user_id, permission_id, from_role_id, created_utc
            FROM user_permissions
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error("list user permissions"))
    }

    async fn insert_user_permissions(
        &self,
        user_id: Uuid,
        permission_ids: &[Uuid],
        from_role_id: Option<Uuid>,
    ) -> StoreResult<Vec<UserPermission>> {
        sqlx::query_as::<_, UserPermission>(
            r#"
            INSERT INTO user_permissions (user_id, permission_id, from_role_id, created_utc)
            SELECT $1, unnest($2::uuid[]), $3, NOW()
            ON CONFLICT DO NOTHING
            RETURNING user_id, permission_id, from_role_id, created_utc
            "#,
        )
        .bind(user_id)
        .bind(permission_ids)
        .bind(from_role_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error("insert user permissions"))
    }

    async fn delete_derived_user_permissions(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        permission_ids: &[Uuid],
    ) -> StoreResult<Vec<UserPermission>> {
        sqlx::query_as::<_, UserPermission>(
            r#"
            DELETE FROM user_permissions
            WHERE user_id = $1 AND from_role_id = $2 AND permission_id = ANY($3)
            RETURNING user_id, permission_id, from_role_id, created_utc
            "#,
        )
        .bind(user_id)
        .bind(role_id)
        .bind(permission_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error("delete derived user permissions"))
    }

    async fn list_user_permission_codenames(&self, user_id: Uuid) -> StoreResult<Vec<String>> {
        sqlx::query_scalar(
            r#"
            SELECT DISTINCT p.codename
            FROM user_permissions up
            JOIN permissions p ON p.permission_id = up.permission_id
            WHERE up.user_id = $1
            ORDER BY p.codename
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error("list user permission codenames"))
    }

    // ==================== Maintenance ====================

    #[instrument(skip(self))]
    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<PurgeReport> {
        async fn purge(pool: &PgPool, table: &'static str, now: DateTime<Utc>) -> StoreResult<u64> {
            let result = sqlx::query(&format!("DELETE FROM {} WHERE expires_at <= $1", table))
                .bind(now)
                .execute(pool)
                .await
                .map_err(map_db_error("purge expired rows"))?;
            Ok(result.rows_affected())
        }

        Ok(PurgeReport {
            login_sessions: purge(&self.pool, "login_sessions", now).await?,
            authorization_codes: purge(&self.pool, "authorization_codes", now).await?,
            refresh_tokens: purge(&self.pool, "refresh_tokens", now).await?,
            rotated_refresh_tokens: purge(&self.pool, "rotated_refresh_tokens", now).await?,
            session_tokens: purge(&self.pool, "session_tokens", now).await?,
        })
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_db_error("health check"))?;
        Ok(())
    }
}

/// Workspace directory in the main database.
#[derive(Clone)]
pub struct PgWorkspaceDirectory {
    pool: PgPool,
}

impl PgWorkspaceDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, workspace: &Workspace) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workspaces (workspace_id, name, domain, schema_name, created_utc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(workspace.workspace_id)
        .bind(&workspace.name)
        .bind(&workspace.domain)
        .bind(&workspace.schema_name)
        .bind(workspace.created_utc)
        .execute(&self.pool)
        .await
        .map_err(map_db_error("insert workspace"))?;
        Ok(())
    }
}

#[async_trait]
impl WorkspaceDirectory for PgWorkspaceDirectory {
    async fn find_by_domain(&self, domain: &str) -> StoreResult<Option<Workspace>> {
        sqlx::query_as::<_, Workspace>(
            r#"
            SELECT workspace_id, name, domain, schema_name, created_utc
            FROM workspaces
            WHERE domain = $1
            "#,
        )
        .bind(domain.to_lowercase())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error("find workspace by domain"))
    }

    async fn get(&self, workspace_id: Uuid) -> StoreResult<Option<Workspace>> {
        sqlx::query_as::<_, Workspace>(
            r#"
            SELECT workspace_id, name, domain, schema_name, created_utc
            FROM workspaces
            WHERE workspace_id = $1
            "#,
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error("get workspace"))
    }

    async fn list(&self) -> StoreResult<Vec<Workspace>> {
        sqlx::query_as::<_, Workspace>(
            "SELECT workspace_id, name, domain, schema_name, created_utc FROM workspaces ORDER BY domain",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error("list workspaces"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_session_row_parses_enums() {
        let row = LoginSessionRow {
            token: "t".into(),
            tenant_id: Uuid::new_v4(),
            client_pk: Uuid::new_v4(),
            response_type: "code".into(),
            response_mode: "fragment".into(),
            redirect_uri: "https://app/cb".into(),
            scope: vec!["openid".into()],
            prompt: Some("login".into()),
            state: None,
            nonce: None,
            acr_requested: Some(1),
            code_challenge: Some("abc".into()),
            code_challenge_method: Some("S256".into()),
            authenticated_user_id: None,
            authenticated_acr: None,
            expires_at: Utc::now(),
        };
        let session = LoginSession::try_from(row).unwrap();
        assert_eq!(session.response_mode, ResponseMode::Fragment);
        assert_eq!(session.prompt, Some(Prompt::Login));
        assert_eq!(session.acr_requested, Some(Acr::Level1));
        assert_eq!(session.code_challenge_method, Some(CodeChallengeMethod::S256));
    }

    #[test]
    fn test_corrupt_acr_column_is_unexpected() {
        assert!(matches!(parse_acr(9), Err(StoreError::Unexpected(_))));
    }
}
