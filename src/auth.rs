use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Outcome of checking a bearer token. `Invalid` covers everything proven
/// bad: malformed token, unknown key, bad signature, expired claims. A
/// transient signing-key lookup failure is surfaced as `Err` instead so
/// callers never conflate it with proven-invalid credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Valid { expires_at_ms: u64 },
    Invalid,
}

#[derive(Clone)]
pub struct SigningKey {
    pub alg: Algorithm,
    pub decoding_key: DecodingKey,
}

/// Narrow interface over the external signing-key service. `Ok(None)` means
/// the service affirmatively does not know the key id; `Err` means the lookup
/// itself failed (network, 5xx) and may be retried.
#[async_trait]
pub trait SigningKeyProvider: Send + Sync {
    async fn signing_key(&self, kid: &str) -> Result<Option<SigningKey>>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    exp: u64,
}

pub struct TokenVerifier {
    provider: Arc<dyn SigningKeyProvider>,
    cache: Mutex<HashMap<String, SigningKey>>,
}

impl TokenVerifier {
    pub fn new(provider: Arc<dyn SigningKeyProvider>) -> Self {
        Self {
            provider,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Verifies signature and time-based claims, returning the token expiry
    /// as an absolute millisecond timestamp. May block on the signing-key
    /// fetch; callers must not hold connection or registry locks across it.
    pub async fn verify(&self, token: &str) -> Result<Verification> {
        let Ok(header) = jsonwebtoken::decode_header(token) else {
            return Ok(Verification::Invalid);
        };
        let Some(kid) = header.kid else {
            debug!("rejecting token without key id");
            return Ok(Verification::Invalid);
        };

        let cached = {
            let cache = self.cache.lock().await;
            cache.get(&kid).cloned()
        };
        let key = match cached {
            Some(key) => key,
            None => {
                let Some(key) = self.provider.signing_key(&kid).await? else {
                    debug!("signing-key service reports unknown kid {kid}");
                    return Ok(Verification::Invalid);
                };
                let mut cache = self.cache.lock().await;
                cache.insert(kid.clone(), key.clone());
                key
            }
        };

        let mut validation = Validation::new(key.alg);
        validation.leeway = 0;
        validation.validate_aud = false;
        match jsonwebtoken::decode::<Claims>(token, &key.decoding_key, &validation) {
            Ok(data) => Ok(Verification::Valid {
                expires_at_ms: data.claims.exp.saturating_mul(1_000),
            }),
            Err(err) => {
                debug!("token verification failed: {err}");
                Ok(Verification::Invalid)
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    pub kid: String,
    pub alg: String,
    pub n: String,
    pub e: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// Fetches the signing-key set from the key service over HTTP. Unknown kids
/// are reported by the document simply not containing them.
pub struct HttpSigningKeyProvider {
    jwks_url: String,
    client: reqwest::Client,
}

impl HttpSigningKeyProvider {
    pub fn new(base_url: &str) -> Self {
        Self {
            jwks_url: format!(
                "{}/.well-known/jwks.json",
                base_url.trim_end_matches('/')
            ),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SigningKeyProvider for HttpSigningKeyProvider {
    async fn signing_key(&self, kid: &str) -> Result<Option<SigningKey>> {
        let response = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .with_context(|| format!("failed fetching signing keys from {}", self.jwks_url))?
            .error_for_status()
            .context("signing-key service returned an error status")?;
        let jwks: Jwks = response
            .json()
            .await
            .context("failed decoding signing-key document")?;

        let Some(jwk) = jwks.keys.iter().find(|key| key.kid == kid) else {
            return Ok(None);
        };
        let alg = Algorithm::from_str(&jwk.alg)
            .with_context(|| format!("unsupported signing algorithm {}", jwk.alg))?;
        let decoding_key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
            .context("invalid RSA components in signing-key document")?;
        Ok(Some(SigningKey { alg, decoding_key }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::anyhow;
    use jsonwebtoken::{EncodingKey, Header};
    use serde::Serialize;

    use super::*;

    const TEST_SECRET: &[u8] = b"gateway-test-secret";
    const TEST_KID: &str = "key-1";

    #[derive(Serialize)]
    struct TestClaims {
        exp: u64,
    }

    struct StaticProvider {
        lookups: AtomicUsize,
    }

    impl StaticProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                lookups: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SigningKeyProvider for StaticProvider {
        async fn signing_key(&self, kid: &str) -> Result<Option<SigningKey>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if kid != TEST_KID {
                return Ok(None);
            }
            Ok(Some(SigningKey {
                alg: Algorithm::HS256,
                decoding_key: DecodingKey::from_secret(TEST_SECRET),
            }))
        }
    }

    struct UnreachableProvider;

    #[async_trait]
    impl SigningKeyProvider for UnreachableProvider {
        async fn signing_key(&self, _kid: &str) -> Result<Option<SigningKey>> {
            Err(anyhow!("signing-key service unreachable"))
        }
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    pub(crate) fn mint_token(kid: &str, exp: u64) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(kid.to_owned());
        jsonwebtoken::encode(
            &header,
            &TestClaims { exp },
            &EncodingKey::from_secret(TEST_SECRET),
        )
        .expect("encode test token")
    }

    #[tokio::test]
    async fn valid_token_reports_expiry() -> Result<()> {
        let verifier = TokenVerifier::new(StaticProvider::new());
        let exp = now_secs() + 120;
        let outcome = verifier.verify(&mint_token(TEST_KID, exp)).await?;
        assert_eq!(
            outcome,
            Verification::Valid {
                expires_at_ms: exp * 1_000
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn expired_token_is_invalid() -> Result<()> {
        let verifier = TokenVerifier::new(StaticProvider::new());
        let outcome = verifier
            .verify(&mint_token(TEST_KID, now_secs() - 120))
            .await?;
        assert_eq!(outcome, Verification::Invalid);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_kid_is_invalid_not_error() -> Result<()> {
        let verifier = TokenVerifier::new(StaticProvider::new());
        let outcome = verifier
            .verify(&mint_token("key-unknown", now_secs() + 120))
            .await?;
        assert_eq!(outcome, Verification::Invalid);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_token_is_invalid() -> Result<()> {
        let verifier = TokenVerifier::new(StaticProvider::new());
        assert_eq!(verifier.verify("not.a.jwt").await?, Verification::Invalid);
        assert_eq!(verifier.verify("").await?, Verification::Invalid);
        Ok(())
    }

    #[tokio::test]
    async fn token_without_kid_is_invalid() -> Result<()> {
        let verifier = TokenVerifier::new(StaticProvider::new());
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &TestClaims {
                exp: now_secs() + 120,
            },
            &EncodingKey::from_secret(TEST_SECRET),
        )?;
        assert_eq!(verifier.verify(&token).await?, Verification::Invalid);
        Ok(())
    }

    #[tokio::test]
    async fn provider_failure_surfaces_as_error() {
        let verifier = TokenVerifier::new(Arc::new(UnreachableProvider));
        let result = verifier
            .verify(&mint_token(TEST_KID, now_secs() + 120))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn signing_keys_are_memoized_per_kid() -> Result<()> {
        let provider = StaticProvider::new();
        let verifier = TokenVerifier::new(provider.clone());
        let token = mint_token(TEST_KID, now_secs() + 120);
        verifier.verify(&token).await?;
        verifier.verify(&token).await?;
        verifier.verify(&token).await?;
        assert_eq!(provider.lookups.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
