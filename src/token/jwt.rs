//! RS256 signing keys, bearer tokens, and ID tokens.
//!
//! One RSA key signs everything; its public half is published at the JWKS
//! endpoint under a key id derived from the modulus, so resource servers can
//! verify offline. ID token claims are gated by the granted scopes.

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

const RSA_BITS: usize = 2048;

/// Access token claims.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub scope: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
}

/// ID token claims. Identity fields appear only when the matching scope was
/// granted.
#[derive(Debug, Serialize, Deserialize)]
pub struct IdClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
}

/// Identity fields a user consented to share.
#[derive(Clone, Debug)]
pub struct UserProfile {
    pub username: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

pub struct TokenSigner {
    issuer: String,
    kid: String,
    encoding_key: EncodingKey,
    jwk_n: String,
    jwk_e: String,
}

impl TokenSigner {
    /// Generate a fresh signing key. Tokens from a previous process die with
    /// its key; deployments that need continuity pass a PEM instead.
    ///
    /// # Errors
    /// Returns an error if key generation fails.
    pub fn generate(issuer: &str) -> Result<Self> {
        let private_key =
            RsaPrivateKey::new(&mut OsRng, RSA_BITS).context("failed to generate signing key")?;
        Self::from_private_key(issuer, &private_key)
    }

    /// Load the signing key from a PEM string (PKCS#1 or PKCS#8).
    ///
    /// # Errors
    /// Returns an error if the PEM does not contain an RSA private key.
    pub fn from_pem(issuer: &str, pem: &str) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .context("failed to parse RSA private key PEM")?;
        Self::from_private_key(issuer, &private_key)
    }

    fn from_private_key(issuer: &str, private_key: &RsaPrivateKey) -> Result<Self> {
        let pem = private_key
            .to_pkcs1_pem(LineEnding::LF)
            .context("failed to encode signing key")?;
        let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .context("failed to build JWT encoding key")?;

        let public_key = RsaPublicKey::from(private_key);
        let n = public_key.n().to_bytes_be();
        let e = public_key.e().to_bytes_be();

        // Key id derived from the modulus so restarts with the same key keep
        // the same kid.
        let kid = URL_SAFE_NO_PAD.encode(&Sha256::digest(&n)[..12]);

        Ok(Self {
            issuer: issuer.to_string(),
            kid,
            encoding_key,
            jwk_n: URL_SAFE_NO_PAD.encode(n),
            jwk_e: URL_SAFE_NO_PAD.encode(e),
        })
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    fn header(&self) -> Header {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        header
    }

    /// Sign a bearer access token for one client and scope set.
    ///
    /// # Errors
    /// Returns an error if signing fails.
    pub fn sign_access_token(
        &self,
        user_id: Uuid,
        client_id: &str,
        scope: &str,
        ttl_seconds: i64,
    ) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = AccessClaims {
            iss: self.issuer.clone(),
            sub: user_id.to_string(),
            aud: client_id.to_string(),
            scope: scope.to_string(),
            exp: now + ttl_seconds,
            iat: now,
            jti: Uuid::new_v4().to_string(),
        };
        jsonwebtoken::encode(&self.header(), &claims, &self.encoding_key)
            .context("failed to sign access token")
    }

    /// Sign an ID token carrying only the claims the scopes allow.
    ///
    /// # Errors
    /// Returns an error if signing fails.
    pub fn sign_id_token(
        &self,
        user_id: Uuid,
        client_id: &str,
        scope: &str,
        profile: &UserProfile,
        ttl_seconds: i64,
    ) -> Result<String> {
        let scopes: Vec<&str> = scope.split_whitespace().collect();
        let now = Utc::now().timestamp();
        let claims = IdClaims {
            iss: self.issuer.clone(),
            sub: user_id.to_string(),
            aud: client_id.to_string(),
            exp: now + ttl_seconds,
            iat: now,
            preferred_username: scopes
                .contains(&"profile")
                .then(|| profile.username.clone()),
            email: if scopes.contains(&"email") {
                profile.email.clone()
            } else {
                None
            },
            phone_number: if scopes.contains(&"phone") {
                profile.phone.clone()
            } else {
                None
            },
        };
        jsonwebtoken::encode(&self.header(), &claims, &self.encoding_key)
            .context("failed to sign ID token")
    }

    /// The JWKS document for the verification endpoint.
    #[must_use]
    pub fn jwks(&self) -> serde_json::Value {
        serde_json::json!({
            "keys": [
                {
                    "kty": "RSA",
                    "use": "sig",
                    "alg": "RS256",
                    "kid": self.kid,
                    "n": self.jwk_n,
                    "e": self.jwk_e,
                }
            ]
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{AccessClaims, IdClaims, TokenSigner, UserProfile};
    use jsonwebtoken::{Algorithm, DecodingKey, Validation};
    use uuid::Uuid;

    fn signer() -> TokenSigner {
        TokenSigner::generate("https://issuer.test").unwrap()
    }

    fn decoding_key(signer: &TokenSigner) -> DecodingKey {
        let jwks = signer.jwks();
        let key = &jwks["keys"][0];
        DecodingKey::from_rsa_components(key["n"].as_str().unwrap(), key["e"].as_str().unwrap())
            .unwrap()
    }

    fn profile() -> UserProfile {
        UserProfile {
            username: "alice".to_string(),
            email: Some("alice@example.com".to_string()),
            phone: Some("+15550001111".to_string()),
        }
    }

    #[test]
    fn access_token_verifies_against_jwks() {
        let signer = signer();
        let user_id = Uuid::new_v4();
        let token = signer
            .sign_access_token(user_id, "client-1", "openid email", 3600)
            .unwrap();

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&["client-1"]);
        let decoded = jsonwebtoken::decode::<AccessClaims>(
            &token,
            &decoding_key(&signer),
            &validation,
        )
        .unwrap();

        assert_eq!(decoded.claims.iss, "https://issuer.test");
        assert_eq!(decoded.claims.sub, user_id.to_string());
        assert_eq!(decoded.claims.scope, "openid email");
        assert_eq!(decoded.header.kid.as_deref(), Some(signer.kid()));
    }

    #[test]
    fn id_token_claims_follow_scopes() {
        let signer = signer();
        let user_id = Uuid::new_v4();

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&["client-1"]);
        let key = decoding_key(&signer);

        let token = signer
            .sign_id_token(user_id, "client-1", "openid email", &profile(), 3600)
            .unwrap();
        let decoded = jsonwebtoken::decode::<IdClaims>(&token, &key, &validation).unwrap();
        assert_eq!(decoded.claims.email.as_deref(), Some("alice@example.com"));
        assert!(decoded.claims.preferred_username.is_none());
        assert!(decoded.claims.phone_number.is_none());

        let token = signer
            .sign_id_token(user_id, "client-1", "openid profile phone", &profile(), 3600)
            .unwrap();
        let decoded = jsonwebtoken::decode::<IdClaims>(&token, &key, &validation).unwrap();
        assert!(decoded.claims.email.is_none());
        assert_eq!(decoded.claims.preferred_username.as_deref(), Some("alice"));
        assert_eq!(decoded.claims.phone_number.as_deref(), Some("+15550001111"));
    }

    #[test]
    fn jwks_shape() {
        let signer = signer();
        let jwks = signer.jwks();
        let key = &jwks["keys"][0];
        assert_eq!(key["kty"], "RSA");
        assert_eq!(key["alg"], "RS256");
        assert_eq!(key["use"], "sig");
        assert!(key["n"].as_str().is_some_and(|n| !n.is_empty()));
        assert_eq!(key["e"], "AQAB");
    }

    #[test]
    fn pem_round_trip_keeps_kid() {
        use rsa::RsaPrivateKey;
        use rsa::pkcs1::EncodeRsaPrivateKey;

        let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).unwrap();
        let pem = private_key
            .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
            .unwrap();

        let first = TokenSigner::from_pem("https://issuer.test", &pem).unwrap();
        let second = TokenSigner::from_pem("https://issuer.test", &pem).unwrap();
        assert_eq!(first.kid(), second.kid());
    }
}
