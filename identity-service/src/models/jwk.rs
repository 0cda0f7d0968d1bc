use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// RSA public JSON Web Key. Private members are never modelled here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Jwk {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    pub n: String,
    pub e: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

impl Jwk {
    pub fn rsa_signing(kid: String, n: String, e: String) -> Self {
        Self {
            kty: "RSA".to_string(),
            kid: Some(kid),
            key_use: Some("sig".to_string()),
            alg: Some("RS256".to_string()),
            n,
            e,
        }
    }

    /// Parse a stored encryption key, rejecting anything that is not an RSA public key.
    pub fn parse_encryption_key(raw: &str) -> Result<Self, anyhow::Error> {
        let jwk: Jwk = serde_json::from_str(raw)
            .map_err(|e| anyhow::anyhow!("Invalid encryption JWK: {}", e))?;
        if jwk.kty != "RSA" {
            return Err(anyhow::anyhow!("Unsupported encryption key type {}", jwk.kty));
        }
        if matches!(jwk.key_use.as_deref(), Some(u) if u != "enc") {
            return Err(anyhow::anyhow!("JWK is not an encryption key"));
        }
        Ok(jwk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_use_member() {
        let jwk = Jwk::rsa_signing("k1".into(), "abc".into(), "AQAB".into());
        let value = serde_json::to_value(&jwk).unwrap();
        assert_eq!(value["use"], "sig");
        assert_eq!(value["kid"], "k1");
        assert!(value.get("d").is_none());
    }

    #[test]
    fn test_parse_encryption_key_rejects_signing_use() {
        let raw = r#"{"kty":"RSA","use":"sig","n":"abc","e":"AQAB"}"#;
        assert!(Jwk::parse_encryption_key(raw).is_err());
        let raw = r#"{"kty":"RSA","use":"enc","n":"abc","e":"AQAB"}"#;
        assert!(Jwk::parse_encryption_key(raw).is_ok());
    }
}
