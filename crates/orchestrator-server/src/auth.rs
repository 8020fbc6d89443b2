//! Bearer JWT verification for the Client WS Hub (spec §6 "auth-first
//! bearer JWT (claim `username`) signed with a configured secret"). An
//! enrichment crate relative to the teacher — pulled in because this
//! system, unlike ccswarm's local IPC surface, authenticates untrusted
//! remote clients.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientClaims {
    pub username: String,
    #[serde(default)]
    pub exp: Option<i64>,
}

pub fn verify_bearer_jwt(token: &str, secret: &str) -> Result<ClientClaims, jsonwebtoken::errors::Error> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = false;
    let key = DecodingKey::from_secret(secret.as_bytes());
    decode::<ClientClaims>(token, &key, &validation).map(|data| data.claims)
}

/// Pluggable validator for manager API tokens (spec §4.4 "an alternate
/// auth path accepts manager API tokens validated by a pluggable validator
/// set at startup").
#[async_trait::async_trait]
pub trait ManagerTokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> bool;
}

pub struct SessionManagerTokenValidator {
    pub manager: std::sync::Arc<crate::manager_handle::ManagerHandle>,
}

#[async_trait::async_trait]
impl ManagerTokenValidator for SessionManagerTokenValidator {
    async fn validate(&self, token: &str) -> bool {
        self.manager.get().has_manager_api_token(token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    #[test]
    fn roundtrip_with_correct_secret() {
        let claims = ClientClaims { username: "alice".into(), exp: None };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(b"shh")).unwrap();
        let decoded = verify_bearer_jwt(&token, "shh").unwrap();
        assert_eq!(decoded.username, "alice");
    }

    #[test]
    fn rejects_wrong_secret() {
        let claims = ClientClaims { username: "alice".into(), exp: None };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(b"shh")).unwrap();
        assert!(verify_bearer_jwt(&token, "wrong").is_err());
    }
}
