//! Bearer token verification.
//!
//! Two modes, selected by configuration: RS256 against the identity
//! provider's published JWKS (production), or HS256 with a shared secret
//! (local development and tests). Both produce the same `VerifiedIdentity`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use axum::http::HeaderMap;
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::principal::VerifiedIdentity;

/// Claims carried by provider-issued identity tokens. `admin` is the custom
/// claim mirrored into the permission record by the claim synchronizer.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    admin: bool,
    exp: usize,
    iat: usize,
}

impl Claims {
    fn into_identity(self) -> VerifiedIdentity {
        VerifiedIdentity { uid: self.sub, email: self.email, admin_claim: self.admin }
    }
}

/// Extract a Bearer token from the Authorization header.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// HS256 shared-secret verifier for local/dev runtimes.
#[derive(Clone)]
pub struct HsVerifier {
    secret: String,
    issuer: Option<String>,
    audience: Option<String>,
}

impl HsVerifier {
    pub fn new(secret: String, issuer: Option<String>, audience: Option<String>) -> Self {
        Self { secret, issuer, audience }
    }

    pub fn verify(&self, token: &str) -> Result<VerifiedIdentity> {
        let mut validation = Validation::new(Algorithm::HS256);
        match &self.issuer {
            Some(iss) => validation.set_issuer(&[iss]),
            None => validation.iss = None,
        }
        match &self.audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        let key = DecodingKey::from_secret(self.secret.as_bytes());
        let data = decode::<Claims>(token, &key, &validation).context("token verification failed")?;
        Ok(data.claims.into_identity())
    }
}

/// Mint an HS256 token for the dev verifier. Used by local tooling and tests;
/// the production runtime only ever consumes provider-issued tokens.
pub fn mint_hs_token(
    secret: &str,
    uid: &str,
    email: Option<&str>,
    admin: bool,
    ttl_secs: i64,
) -> Result<String> {
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: uid.to_string(),
        email: email.map(|e| e.to_string()),
        admin,
        exp: (now + ttl_secs).max(0) as usize,
        iat: now.max(0) as usize,
    };
    let key = EncodingKey::from_secret(secret.as_bytes());
    encode(&Header::default(), &claims, &key).map_err(|e| anyhow!("minting token: {}", e))
}

/// JWKS cache entry: decoding keys indexed by kid.
struct JwksCache {
    keys: HashMap<String, DecodingKey>,
    last_refresh: Instant,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<JwkKey>,
}

#[derive(Debug, Deserialize)]
struct JwkKey {
    kty: String,
    kid: Option<String>,
    n: Option<String>,
    e: Option<String>,
}

/// RS256 verifier against the identity provider's JWKS endpoint.
pub struct JwksVerifier {
    issuer: String,
    jwks_url: String,
    audiences: Vec<String>,
    refresh_interval: Duration,
    http_client: reqwest::Client,
    cache: Arc<RwLock<Option<JwksCache>>>,
}

impl JwksVerifier {
    pub fn new(issuer: String, jwks_url: String, audiences: Vec<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building JWKS http client")?;
        Ok(Self {
            issuer,
            jwks_url,
            audiences,
            refresh_interval: Duration::from_secs(3600),
            http_client,
            cache: Arc::new(RwLock::new(None)),
        })
    }

    pub async fn verify(&self, token: &str) -> Result<VerifiedIdentity> {
        let header = decode_header(token).context("malformed token header")?;
        if header.alg != Algorithm::RS256 {
            bail!("unsupported token algorithm {:?}", header.alg);
        }
        let key = self.decoding_key(header.kid.as_deref()).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.issuer]);
        if self.audiences.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&self.audiences);
        }
        let data = decode::<Claims>(token, &key, &validation).context("token verification failed")?;
        debug!(admin = data.claims.admin, "verified provider token");
        Ok(data.claims.into_identity())
    }

    async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey> {
        let needs_refresh = {
            let cache = self.cache.read().await;
            match &*cache {
                None => true,
                Some(c) => c.last_refresh.elapsed() > self.refresh_interval,
            }
        };
        if needs_refresh {
            self.refresh_jwks().await?;
        }
        let cache = self.cache.read().await;
        let cache = cache.as_ref().ok_or_else(|| anyhow!("JWKS cache empty after refresh"))?;
        let key = match kid {
            Some(kid) => cache.keys.get(kid).cloned(),
            None => cache.keys.values().next().cloned(),
        };
        key.ok_or_else(|| anyhow!("no matching JWKS key for kid {:?}", kid))
    }

    async fn refresh_jwks(&self) -> Result<()> {
        debug!(url = %self.jwks_url, "fetching JWKS");
        let jwks: JwksDocument = self
            .http_client
            .get(&self.jwks_url)
            .send()
            .await
            .context("fetching JWKS")?
            .json()
            .await
            .context("parsing JWKS response")?;

        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            if jwk.kty != "RSA" {
                warn!(kty = %jwk.kty, "skipping unsupported JWKS key type");
                continue;
            }
            let (Some(n), Some(e)) = (jwk.n.as_ref(), jwk.e.as_ref()) else {
                warn!("skipping RSA JWKS key missing components");
                continue;
            };
            let key = DecodingKey::from_rsa_components(n, e).context("invalid RSA key in JWKS")?;
            keys.insert(jwk.kid.unwrap_or_else(|| "default".to_string()), key);
        }
        if keys.is_empty() {
            bail!("no usable keys in JWKS document");
        }
        info!(key_count = keys.len(), "refreshed JWKS cache");
        let mut cache = self.cache.write().await;
        *cache = Some(JwksCache { keys, last_refresh: Instant::now() });
        Ok(())
    }
}

/// Configured verification mode. Handlers call `verify` without caring which
/// mode the deployment runs.
pub enum TokenVerifier {
    Hs(HsVerifier),
    Jwks(JwksVerifier),
}

impl TokenVerifier {
    pub async fn verify(&self, token: &str) -> Result<VerifiedIdentity> {
        match self {
            TokenVerifier::Hs(v) => v.verify(token),
            TokenVerifier::Jwks(v) => v.verify(token).await,
        }
    }
}
