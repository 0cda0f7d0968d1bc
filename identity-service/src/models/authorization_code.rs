use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::oauth::{Acr, CodeChallengeMethod};

/// Authorization code. Only the SHA-256 of the code is stored; the row is
/// removed by the exchange that consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCode {
    pub code_hash: String,
    /// OIDC `c_hash` of the plaintext code, echoed in the ID token.
    pub c_hash: String,
    pub tenant_id: Uuid,
    pub client_pk: Uuid,
    pub user_id: Uuid,
    pub redirect_uri: String,
    pub scope: Vec<String>,
    pub authenticated_at: DateTime<Utc>,
    pub nonce: Option<String>,
    pub acr: Acr,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
    pub expires_at: DateTime<Utc>,
}

impl AuthorizationCode {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
