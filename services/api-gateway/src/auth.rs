//! Bearer token verification.
//!
//! Two interchangeable backends sit behind [`TokenVerifier`]: a shared
//! HS256 secret and a JWKS endpoint for RS256 keys. Verification is
//! stateless per call; JWKS key material is cached with a bounded TTL
//! (at most 10 minutes, enforced by config validation).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use nimbus_shared::auth::Claims;

use crate::config::{AuthBackend, AuthConfig};
use crate::error::{ApiGatewayError, ApiResult};

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> ApiResult<Claims>;
}

pub fn extract_bearer_token(auth_header: &str) -> ApiResult<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiGatewayError::AuthInvalid {
            message: "Authorization header must start with 'Bearer '".to_string(),
        })
}

fn base_validation(algorithm: Algorithm, config: &AuthConfig) -> Validation {
    let mut validation = Validation::new(algorithm);
    match &config.audience {
        Some(aud) => validation.set_audience(&[aud]),
        None => validation.validate_aud = false,
    }
    if let Some(iss) = &config.issuer {
        validation.set_issuer(&[iss]);
    }
    validation
}

fn map_jwt_error(error: jsonwebtoken::errors::Error) -> ApiGatewayError {
    use jsonwebtoken::errors::ErrorKind;
    let message = match error.kind() {
        ErrorKind::ExpiredSignature => "token expired".to_string(),
        ErrorKind::InvalidSignature => "signature mismatch".to_string(),
        ErrorKind::InvalidAudience => "wrong audience".to_string(),
        ErrorKind::InvalidIssuer => "wrong issuer".to_string(),
        ErrorKind::ImmatureSignature => "token not yet valid".to_string(),
        _ => "malformed token".to_string(),
    };
    ApiGatewayError::AuthInvalid { message }
}

/// HS256 verification against a shared secret.
pub struct SecretVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl SecretVerifier {
    pub fn new(secret: &str, config: &AuthConfig) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: base_validation(Algorithm::HS256, config),
        }
    }
}

#[async_trait]
impl TokenVerifier for SecretVerifier {
    async fn verify(&self, token: &str) -> ApiResult<Claims> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(map_jwt_error)?;
        Ok(data.claims)
    }
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

/// Parses a JWKS document into kid-indexed decoding keys. Non-RSA entries
/// are skipped.
fn parse_jwks(body: &str) -> ApiResult<HashMap<String, DecodingKey>> {
    let document: JwksDocument =
        serde_json::from_str(body).map_err(|e| ApiGatewayError::AuthInvalid {
            message: format!("invalid JWKS document: {}", e),
        })?;

    let mut keys = HashMap::new();
    for jwk in document.keys {
        if jwk.kty != "RSA" {
            continue;
        }
        let (Some(kid), Some(n), Some(e)) = (jwk.kid, jwk.n, jwk.e) else {
            continue;
        };
        match DecodingKey::from_rsa_components(&n, &e) {
            Ok(key) => {
                keys.insert(kid, key);
            }
            Err(err) => warn!(error = %err, "Skipping unparseable JWK"),
        }
    }
    Ok(keys)
}

struct CachedKeys {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

/// RS256 verification against a JWKS endpoint, with TTL'd key caching.
pub struct JwksVerifier {
    url: String,
    client: reqwest::Client,
    ttl: Duration,
    validation: Validation,
    cache: RwLock<Option<CachedKeys>>,
}

impl JwksVerifier {
    pub fn new(url: &str, config: &AuthConfig) -> Self {
        Self {
            url: url.to_string(),
            client: reqwest::Client::new(),
            ttl: Duration::from_secs(config.key_cache_ttl_seconds),
            validation: base_validation(Algorithm::RS256, config),
            cache: RwLock::new(None),
        }
    }

    async fn refresh(&self) -> ApiResult<()> {
        let body = self
            .client
            .get(&self.url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ApiGatewayError::AuthInvalid {
                message: format!("JWKS fetch failed: {}", e),
            })?
            .text()
            .await
            .map_err(|e| ApiGatewayError::AuthInvalid {
                message: format!("JWKS fetch failed: {}", e),
            })?;

        let keys = parse_jwks(&body)?;
        debug!(keys = keys.len(), "JWKS refreshed");
        *self.cache.write().await = Some(CachedKeys {
            keys,
            fetched_at: Instant::now(),
        });
        Ok(())
    }

    async fn key_for(&self, kid: &str) -> ApiResult<DecodingKey> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < self.ttl {
                    if let Some(key) = cached.keys.get(kid) {
                        return Ok(key.clone());
                    }
                }
            }
        }

        // Stale cache or unknown kid: refetch once, then decide.
        self.refresh().await?;
        let cache = self.cache.read().await;
        cache
            .as_ref()
            .and_then(|c| c.keys.get(kid).cloned())
            .ok_or_else(|| ApiGatewayError::AuthInvalid {
                message: format!("unknown signing key '{}'", kid),
            })
    }
}

#[async_trait]
impl TokenVerifier for JwksVerifier {
    async fn verify(&self, token: &str) -> ApiResult<Claims> {
        let header = decode_header(token).map_err(map_jwt_error)?;
        let kid = header.kid.ok_or_else(|| ApiGatewayError::AuthInvalid {
            message: "token header missing kid".to_string(),
        })?;
        let key = self.key_for(&kid).await?;
        let data = decode::<Claims>(token, &key, &self.validation).map_err(map_jwt_error)?;
        Ok(data.claims)
    }
}

/// Builds the verifier selected by `AUTH_BACKEND`.
pub fn build_verifier(config: &AuthConfig) -> ApiResult<Arc<dyn TokenVerifier>> {
    match config.backend {
        AuthBackend::Secret => {
            let secret =
                config
                    .jwt_secret
                    .as_deref()
                    .ok_or_else(|| ApiGatewayError::ConfigInvalid {
                        message: "AUTH_BACKEND=secret requires JWT_SECRET".to_string(),
                    })?;
            Ok(Arc::new(SecretVerifier::new(secret, config)))
        }
        AuthBackend::Jwks => {
            let url = config
                .jwks_url
                .as_deref()
                .ok_or_else(|| ApiGatewayError::ConfigInvalid {
                    message: "AUTH_BACKEND=jwks requires JWKS_URL".to_string(),
                })?;
            Ok(Arc::new(JwksVerifier::new(url, config)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn auth_config() -> AuthConfig {
        AuthConfig {
            jwt_secret: Some(SECRET.to_string()),
            ..AuthConfig::default()
        }
    }

    fn token(claims: &serde_json::Value) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> i64 {
        chrono::Utc::now().timestamp() + 3_600
    }

    #[tokio::test]
    async fn test_secret_verifier_round_trip() {
        let verifier = SecretVerifier::new(SECRET, &auth_config());
        let token = token(&serde_json::json!({
            "sub": "user-1",
            "roles": ["admin"],
            "tenant_id": "acme",
            "exp": future_exp(),
            "iat": 0,
        }));

        let claims = verifier.verify(&token).await.unwrap();
        assert_eq!(claims.sub, "user-1");
        assert!(claims.has_role("admin"));
        assert_eq!(claims.tenant_claim(), Some("acme"));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let verifier = SecretVerifier::new(SECRET, &auth_config());
        let token = token(&serde_json::json!({
            "sub": "user-1",
            "exp": 1_000_000,
            "iat": 0,
        }));

        let err = verifier.verify(&token).await.unwrap_err();
        assert!(matches!(err, ApiGatewayError::AuthInvalid { .. }));
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let verifier = SecretVerifier::new("other-secret", &auth_config());
        let token = token(&serde_json::json!({
            "sub": "user-1",
            "exp": future_exp(),
        }));

        assert!(verifier.verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_token_rejected() {
        let verifier = SecretVerifier::new(SECRET, &auth_config());
        assert!(verifier.verify("not-a-jwt").await.is_err());
    }

    #[test]
    fn test_bearer_extraction() {
        assert_eq!(extract_bearer_token("Bearer abc").unwrap(), "abc");
        assert!(extract_bearer_token("Basic abc").is_err());
    }

    #[test]
    fn test_jwks_parsing_skips_non_rsa() {
        let body = serde_json::json!({
            "keys": [
                {"kty": "RSA", "kid": "k1",
                 "n": "sXchDaQebHnPiGvyDOAT4saGEUetSyo9MKLOoWFsueri23bOdgWp4Dy1Wl\
UzewbgBHod5pcM9H95GQRV3JDXboIRROSBigeC5yjU1hGzHHyXss8UDpre\
cbAYxknTcQkhslANGRUZmdTOQ5qTRsLAt6BTYuyvVRdhS8exSZEy_c4gs_\
7svlJJQ4H9_NxsiIoLwAEk7-Q3UXERGYw_75IDrGA84-lA_-Ct4eTlXHBI\
Y2EaV7t7LjJaynVJCpkv4LKjTTAumiGUIuQhrNhZLuF_RJLqHpM2kgWFLU\
7-VTdL1VbC2tejvcI2BlMkEpk1BzBZI0KQB0GaDWFLN-aEAw3vRw",
                 "e": "AQAB"},
                {"kty": "EC", "kid": "k2"}
            ]
        });
        let keys = parse_jwks(&body.to_string()).unwrap();
        assert!(keys.contains_key("k1"));
        assert!(!keys.contains_key("k2"));
    }

    #[test]
    fn test_invalid_jwks_document_rejected() {
        assert!(parse_jwks("{}").is_err());
        assert!(parse_jwks("not json").is_err());
    }
}
