use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub workspaces: WorkspacePoolConfig,
    pub redis: RedisConfig,
    pub worker: WorkerConfig,
    pub oidc: OidcConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

/// Main database holding the workspace directory.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Per-workspace connection pools.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspacePoolConfig {
    /// Upper bound on cached per-workspace pools; the least recently used is closed.
    pub max_cached_pools: usize,
    pub max_connections_per_pool: u32,
    pub acquire_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub purge_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OidcConfig {
    /// Scheme used when building issuer URLs from the request host.
    pub public_scheme: String,
    pub login_session_ttl_seconds: i64,
    pub session_token_ttl_seconds: i64,
    pub login_session_cookie: String,
    pub session_cookie: String,
    pub cookie_secure: bool,
    /// Retired signing keys kept in the JWKS after a rotation.
    pub retained_signing_keys: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub admin_api_key: String,
}

impl OidcConfig {
    pub fn login_session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.login_session_ttl_seconds)
    }

    pub fn session_token_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_token_ttl_seconds)
    }
}

impl WorkerConfig {
    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_seconds)
    }
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            public_scheme: "https".to_string(),
            login_session_ttl_seconds: 600,
            session_token_ttl_seconds: 30 * 24 * 3600,
            login_session_cookie: "idp_login_session".to_string(),
            session_cookie: "idp_session".to_string(),
            cookie_secure: true,
            retained_signing_keys: 2,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 5,
            retry_initial_backoff_ms: 200,
            retry_max_backoff_ms: 30_000,
            purge_interval_seconds: 3600,
        }
    }
}

impl IdentityConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;
        let oidc_defaults = OidcConfig::default();
        let worker_defaults = WorkerConfig::default();

        let config = IdentityConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("identity-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|v| !v.is_empty()),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1", is_prod)?,
            },
            workspaces: WorkspacePoolConfig {
                max_cached_pools: parse_env("WORKSPACE_MAX_CACHED_POOLS", "64", is_prod)?,
                max_connections_per_pool: parse_env(
                    "WORKSPACE_MAX_CONNECTIONS_PER_POOL",
                    "5",
                    is_prod,
                )?,
                acquire_timeout_seconds: parse_env(
                    "WORKSPACE_ACQUIRE_TIMEOUT_SECONDS",
                    "5",
                    is_prod,
                )?,
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", None, is_prod)?,
                key_prefix: get_env("REDIS_KEY_PREFIX", Some("identity"), is_prod)?,
            },
            worker: WorkerConfig {
                concurrency: parse_env(
                    "WORKER_CONCURRENCY",
                    &worker_defaults.concurrency.to_string(),
                    is_prod,
                )?,
                max_attempts: parse_env(
                    "WORKER_MAX_ATTEMPTS",
                    &worker_defaults.max_attempts.to_string(),
                    is_prod,
                )?,
                retry_initial_backoff_ms: parse_env(
                    "WORKER_RETRY_INITIAL_BACKOFF_MS",
                    &worker_defaults.retry_initial_backoff_ms.to_string(),
                    is_prod,
                )?,
                retry_max_backoff_ms: parse_env(
                    "WORKER_RETRY_MAX_BACKOFF_MS",
                    &worker_defaults.retry_max_backoff_ms.to_string(),
                    is_prod,
                )?,
                purge_interval_seconds: parse_env(
                    "WORKER_PURGE_INTERVAL_SECONDS",
                    &worker_defaults.purge_interval_seconds.to_string(),
                    is_prod,
                )?,
            },
            oidc: OidcConfig {
                public_scheme: get_env("OIDC_PUBLIC_SCHEME", Some("https"), is_prod)?,
                login_session_ttl_seconds: parse_env(
                    "OIDC_LOGIN_SESSION_TTL_SECONDS",
                    &oidc_defaults.login_session_ttl_seconds.to_string(),
                    is_prod,
                )?,
                session_token_ttl_seconds: parse_env(
                    "OIDC_SESSION_TOKEN_TTL_SECONDS",
                    &oidc_defaults.session_token_ttl_seconds.to_string(),
                    is_prod,
                )?,
                login_session_cookie: get_env(
                    "OIDC_LOGIN_SESSION_COOKIE",
                    Some(&oidc_defaults.login_session_cookie),
                    is_prod,
                )?,
                session_cookie: get_env(
                    "OIDC_SESSION_COOKIE",
                    Some(&oidc_defaults.session_cookie),
                    is_prod,
                )?,
                cookie_secure: parse_env("OIDC_COOKIE_SECURE", "true", is_prod)?,
                retained_signing_keys: parse_env(
                    "OIDC_RETAINED_SIGNING_KEYS",
                    &oidc_defaults.retained_signing_keys.to_string(),
                    is_prod,
                )?,
            },
            security: SecurityConfig {
                allowed_origins: get_env("ALLOWED_ORIGINS", Some("http://localhost:3000"), is_prod)?
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                admin_api_key: get_env("ADMIN_API_KEY", None, true)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would only fail later at request time.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.oidc.public_scheme != "https" && self.oidc.public_scheme != "http" {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "OIDC_PUBLIC_SCHEME must be http or https, got {}",
                self.oidc.public_scheme
            )));
        }
        if self.environment == Environment::Prod && self.oidc.public_scheme != "https" {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "OIDC_PUBLIC_SCHEME must be https in production"
            )));
        }
        if self.oidc.login_session_ttl_seconds <= 0 || self.oidc.session_token_ttl_seconds <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "session lifetimes must be positive"
            )));
        }
        if self.workspaces.max_cached_pools == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "WORKSPACE_MAX_CACHED_POOLS must be at least 1"
            )));
        }
        if self.worker.concurrency == 0 || self.worker.max_attempts == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "WORKER_CONCURRENCY and WORKER_MAX_ATTEMPTS must be at least 1"
            )));
        }
        if self.security.admin_api_key.len() < 16 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "ADMIN_API_KEY must be at least 16 characters"
            )));
        }
        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod && default.is_none() {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
