//! Compact JWE (RFC 7516) wrapping of signed ID tokens.
//!
//! Key management is `RSA-OAEP-256`, content encryption `A256GCM`. The
//! protected header is the additional authenticated data.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::models::Jwk;
use crate::utils::crypto::{b64url, b64url_decode};

const ALG: &str = "RSA-OAEP-256";
const ENC: &str = "A256GCM";
const TAG_LEN: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct JweHeader {
    alg: String,
    enc: String,
    cty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

fn public_key(jwk: &Jwk) -> Result<RsaPublicKey, anyhow::Error> {
    let n = BigUint::from_bytes_be(&b64url_decode(&jwk.n)?);
    let e = BigUint::from_bytes_be(&b64url_decode(&jwk.e)?);
    RsaPublicKey::new(n, e).map_err(|e| anyhow::anyhow!("Invalid RSA encryption key: {}", e))
}

/// Encrypt `jwt` for the holder of `jwk`, producing
/// `header.encrypted_key.iv.ciphertext.tag`.
pub fn encrypt_compact(jwk: &Jwk, jwt: &str) -> Result<String, anyhow::Error> {
    let recipient = public_key(jwk)?;

    let header = JweHeader {
        alg: ALG.to_string(),
        enc: ENC.to_string(),
        cty: "JWT".to_string(),
        kid: jwk.kid.clone(),
    };
    let encoded_header = b64url(&serde_json::to_vec(&header)?);

    let mut rng = rand::thread_rng();
    let mut cek = [0u8; 32];
    rng.fill_bytes(&mut cek);
    let mut iv = [0u8; 12];
    rng.fill_bytes(&mut iv);

    let encrypted_key = recipient
        .encrypt(&mut rng, Oaep::new::<Sha256>(), &cek)
        .map_err(|e| anyhow::anyhow!("Failed to wrap content key: {}", e))?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&cek));
    let mut sealed = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: jwt.as_bytes(),
                aad: encoded_header.as_bytes(),
            },
        )
        .map_err(|_| anyhow::anyhow!("Failed to encrypt token"))?;
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(format!(
        "{}.{}.{}.{}.{}",
        encoded_header,
        b64url(&encrypted_key),
        b64url(&iv),
        b64url(&sealed),
        b64url(&tag)
    ))
}

/// Inverse of [`encrypt_compact`], for relying parties holding the private key.
pub fn decrypt_compact(private_key: &RsaPrivateKey, token: &str) -> Result<String, anyhow::Error> {
    let parts: Vec<&str> = token.split('.').collect();
    let [encoded_header, encrypted_key, iv, ciphertext, tag] = parts.as_slice() else {
        return Err(anyhow::anyhow!("Compact JWE must have five parts"));
    };

    let header: JweHeader = serde_json::from_slice(&b64url_decode(encoded_header)?)?;
    if header.alg != ALG || header.enc != ENC {
        return Err(anyhow::anyhow!(
            "Unsupported JWE algorithms {}/{}",
            header.alg,
            header.enc
        ));
    }

    let cek = private_key
        .decrypt(Oaep::new::<Sha256>(), &b64url_decode(encrypted_key)?)
        .map_err(|e| anyhow::anyhow!("Failed to unwrap content key: {}", e))?;
    if cek.len() != 32 {
        return Err(anyhow::anyhow!("Content key has wrong length"));
    }
    let iv = b64url_decode(iv)?;
    if iv.len() != 12 {
        return Err(anyhow::anyhow!("Initialization vector has wrong length"));
    }

    let mut sealed = b64url_decode(ciphertext)?;
    sealed.extend(b64url_decode(tag)?);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&cek));
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: &sealed,
                aad: encoded_header.as_bytes(),
            },
        )
        .map_err(|_| anyhow::anyhow!("JWE authentication failed"))?;

    String::from_utf8(plaintext).map_err(|e| anyhow::anyhow!("JWE payload is not UTF-8: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::keys::testing::PRIVATE_KEY_PEM;
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::traits::PublicKeyParts;

    fn key_pair() -> (RsaPrivateKey, Jwk) {
        let private_key = RsaPrivateKey::from_pkcs8_pem(PRIVATE_KEY_PEM).unwrap();
        let jwk = Jwk {
            kty: "RSA".into(),
            kid: Some("enc-1".into()),
            key_use: Some("enc".into()),
            alg: Some(ALG.into()),
            n: b64url(&private_key.n().to_bytes_be()),
            e: b64url(&private_key.e().to_bytes_be()),
        };
        (private_key, jwk)
    }

    #[test]
    fn test_encrypted_token_opens_with_private_key() {
        let (private_key, jwk) = key_pair();
        let jwe = encrypt_compact(&jwk, "header.payload.signature").unwrap();

        assert_eq!(jwe.split('.').count(), 5);
        let header: serde_json::Value =
            serde_json::from_slice(&b64url_decode(jwe.split('.').next().unwrap()).unwrap())
                .unwrap();
        assert_eq!(header["alg"], "RSA-OAEP-256");
        assert_eq!(header["enc"], "A256GCM");
        assert_eq!(header["cty"], "JWT");
        assert_eq!(header["kid"], "enc-1");

        assert_eq!(
            decrypt_compact(&private_key, &jwe).unwrap(),
            "header.payload.signature"
        );
    }

    #[test]
    fn test_tampered_header_fails_authentication() {
        let (private_key, jwk) = key_pair();
        let jwe = encrypt_compact(&jwk, "a.b.c").unwrap();

        let mut parts: Vec<String> = jwe.split('.').map(str::to_string).collect();
        parts[0] = b64url(br#"{"alg":"RSA-OAEP-256","enc":"A256GCM","cty":"JWT"}"#);
        assert!(decrypt_compact(&private_key, &parts.join(".")).is_err());
    }
}
