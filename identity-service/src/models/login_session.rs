//! Login session - ephemeral record of an in-progress `/authorize` request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::oauth::{Acr, CodeChallengeMethod, Prompt, ResponseMode};

/// Where a login attempt currently stands. Code issuance deletes the row,
/// so the terminal state is never observed on a stored session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginSessionState {
    Requested,
    Authenticated,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginSession {
    pub token: String,
    pub tenant_id: Uuid,
    pub client_pk: Uuid,
    pub response_type: String,
    pub response_mode: ResponseMode,
    pub redirect_uri: String,
    pub scope: Vec<String>,
    pub prompt: Option<Prompt>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    /// ACR requested through `acr_values`.
    pub acr_requested: Option<Acr>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
    pub authenticated_user_id: Option<Uuid>,
    pub authenticated_acr: Option<Acr>,
    pub expires_at: DateTime<Utc>,
}

impl LoginSession {
    pub fn state_at(&self, now: DateTime<Utc>) -> LoginSessionState {
        if self.expires_at <= now {
            LoginSessionState::Expired
        } else if self.authenticated_user_id.is_some() {
            LoginSessionState::Authenticated
        } else {
            LoginSessionState::Requested
        }
    }

    /// `prompt=login` or `acr_values=1` force a credential check even when an
    /// SSO session exists.
    pub fn requires_fresh_login(&self) -> bool {
        self.prompt == Some(Prompt::Login) || self.acr_requested == Some(Acr::Level1)
    }

    pub fn mark_authenticated(&mut self, user_id: Uuid, acr: Acr) {
        let acr = self.authenticated_acr.map_or(acr, |previous| previous.max(acr));
        self.authenticated_user_id = Some(user_id);
        self.authenticated_acr = Some(acr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session() -> LoginSession {
        LoginSession {
            token: "t".into(),
            tenant_id: Uuid::new_v4(),
            client_pk: Uuid::new_v4(),
            response_type: "code".into(),
            response_mode: ResponseMode::Query,
            redirect_uri: "https://app/cb".into(),
            scope: vec!["openid".into()],
            prompt: None,
            state: None,
            nonce: None,
            acr_requested: None,
            code_challenge: None,
            code_challenge_method: None,
            authenticated_user_id: None,
            authenticated_acr: None,
            expires_at: Utc::now() + Duration::minutes(10),
        }
    }

    #[test]
    fn test_state_transitions() {
        let now = Utc::now();
        let mut ls = session();
        assert_eq!(ls.state_at(now), LoginSessionState::Requested);

        ls.mark_authenticated(Uuid::new_v4(), Acr::Level1);
        assert_eq!(ls.state_at(now), LoginSessionState::Authenticated);

        assert_eq!(
            ls.state_at(now + Duration::minutes(11)),
            LoginSessionState::Expired
        );
    }

    #[test]
    fn test_authenticated_acr_never_downgrades() {
        let mut ls = session();
        let user = Uuid::new_v4();
        ls.mark_authenticated(user, Acr::Level1);
        ls.mark_authenticated(user, Acr::Level0);
        assert_eq!(ls.authenticated_acr, Some(Acr::Level1));
    }

    #[test]
    fn test_fresh_login_required_by_prompt_or_acr() {
        let mut ls = session();
        assert!(!ls.requires_fresh_login());
        ls.prompt = Some(Prompt::Login);
        assert!(ls.requires_fresh_login());
        ls.prompt = None;
        ls.acr_requested = Some(Acr::Level1);
        assert!(ls.requires_fresh_login());
    }
}
