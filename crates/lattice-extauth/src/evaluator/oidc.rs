//! OIDC identity
//!
//! Validates JWT bearer tokens against the issuer's JWKS and yields the
//! token claims as the identity object.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tracing::{debug, info, warn};

use super::Evaluator;
use crate::credentials::Credentials;
use crate::error::EvaluatorError;
use crate::pipeline::AuthPipeline;

/// OIDC identity configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OidcConfig {
    /// Issuer URL; discovery is served under `/.well-known/openid-configuration`
    pub issuer_url: String,
    /// Accepted audiences; empty skips the audience check
    #[serde(default)]
    pub audiences: Vec<String>,
    /// JWKS refresh interval in seconds
    #[serde(default = "default_refresh_seconds")]
    pub jwks_refresh_interval_seconds: u64,
    /// Where the token is read from
    #[serde(default)]
    pub credentials: Credentials,
}

fn default_refresh_seconds() -> u64 {
    3600
}

/// JWKS cache entry
struct JwksCache {
    /// Keys indexed by kid
    keys: HashMap<String, DecodingKey>,
    /// When the cache was last refreshed
    last_refresh: Instant,
}

/// OIDC discovery document
#[derive(Debug, Deserialize)]
struct OidcDiscovery {
    issuer: String,
    jwks_uri: String,
}

/// JWKS document
#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<JwkKey>,
}

/// Individual JWK key
#[derive(Debug, Deserialize)]
struct JwkKey {
    kty: String,
    kid: Option<String>,
    n: Option<String>,
    e: Option<String>,
    crv: Option<String>,
    x: Option<String>,
    y: Option<String>,
}

/// JWT identity evaluator
pub struct Oidc {
    config: OidcConfig,
    refresh_interval: Duration,
    jwks_cache: Arc<RwLock<Option<JwksCache>>>,
    http_client: reqwest::Client,
}

impl Oidc {
    /// Build from configuration
    pub fn new(config: OidcConfig, http_client: reqwest::Client) -> Self {
        Self {
            refresh_interval: Duration::from_secs(config.jwks_refresh_interval_seconds),
            config,
            jwks_cache: Arc::new(RwLock::new(None)),
            http_client,
        }
    }

    /// Validate a token and return its claims
    async fn validate(&self, token: &str) -> Result<Value, EvaluatorError> {
        let header = decode_header(token).map_err(|e| {
            EvaluatorError::with_code(Code::Unauthenticated, "invalid token").detail(e)
        })?;
        let kid = header.kid.as_deref();

        let key = self.get_decoding_key(kid).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&self.config.issuer_url]);
        if self.config.audiences.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&self.config.audiences);
        }

        let token_data = decode::<Value>(token, &key, &validation).map_err(|e| {
            EvaluatorError::with_code(Code::Unauthenticated, "invalid token").detail(e)
        })?;

        Ok(token_data.claims)
    }

    /// Get decoding key from the JWKS cache, refreshing if needed
    async fn get_decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, EvaluatorError> {
        let needs_refresh = {
            let cache = self.jwks_cache.read().await;
            match &*cache {
                None => true,
                Some(c) => c.last_refresh.elapsed() > self.refresh_interval,
            }
        };

        if needs_refresh {
            self.refresh_jwks().await?;
        }

        let cache = self.jwks_cache.read().await;
        let cache = cache
            .as_ref()
            .ok_or_else(|| EvaluatorError::new("signing keys unavailable"))?;

        let key = match kid {
            Some(kid) => cache.keys.get(kid).cloned(),
            None => cache.keys.values().next().cloned(),
        };

        key.ok_or_else(|| EvaluatorError::with_code(Code::Unauthenticated, "invalid token"))
    }

    /// Refresh JWKS from the issuer
    async fn refresh_jwks(&self) -> Result<(), EvaluatorError> {
        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            self.config.issuer_url.trim_end_matches('/')
        );

        debug!(url = %discovery_url, "Fetching OIDC discovery document");

        let discovery: OidcDiscovery = self
            .http_client
            .get(&discovery_url)
            .send()
            .await?
            .json()
            .await?;

        if discovery.issuer.trim_end_matches('/') != self.config.issuer_url.trim_end_matches('/') {
            return Err(EvaluatorError::new("signing keys unavailable").detail(format!(
                "issuer mismatch: expected {}, got {}",
                self.config.issuer_url, discovery.issuer
            )));
        }

        debug!(url = %discovery.jwks_uri, "Fetching JWKS");

        let jwks: JwksDocument = self
            .http_client
            .get(&discovery.jwks_uri)
            .send()
            .await?
            .json()
            .await?;

        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            if let Some(key) = jwk_to_decoding_key(&jwk) {
                let kid = jwk.kid.unwrap_or_else(|| "default".to_string());
                keys.insert(kid, key);
            }
        }

        if keys.is_empty() {
            return Err(EvaluatorError::new("signing keys unavailable")
                .detail("no usable keys found in JWKS"));
        }

        info!(issuer = %self.config.issuer_url, key_count = keys.len(), "Refreshed JWKS cache");

        let mut cache = self.jwks_cache.write().await;
        *cache = Some(JwksCache {
            keys,
            last_refresh: Instant::now(),
        });

        Ok(())
    }
}

/// Convert a JWK to a DecodingKey, skipping unsupported keys
fn jwk_to_decoding_key(jwk: &JwkKey) -> Option<DecodingKey> {
    let result = match jwk.kty.as_str() {
        "RSA" => match (&jwk.n, &jwk.e) {
            (Some(n), Some(e)) => DecodingKey::from_rsa_components(n, e),
            _ => {
                warn!(kid = ?jwk.kid, "RSA key missing components");
                return None;
            }
        },
        "EC" => match (jwk.crv.as_deref(), &jwk.x, &jwk.y) {
            (Some("P-256") | Some("P-384"), Some(x), Some(y)) => {
                DecodingKey::from_ec_components(x, y)
            }
            (crv, _, _) => {
                warn!(kid = ?jwk.kid, crv = ?crv, "Unsupported EC key");
                return None;
            }
        },
        kty => {
            warn!(kty = %kty, "Unsupported key type");
            return None;
        }
    };

    match result {
        Ok(key) => Some(key),
        Err(e) => {
            warn!(kid = ?jwk.kid, error = %e, "Invalid JWK");
            None
        }
    }
}

#[async_trait]
impl Evaluator for Oidc {
    async fn call(
        &self,
        pipeline: &AuthPipeline,
        cancel: &CancellationToken,
    ) -> Result<Value, EvaluatorError> {
        let token = self
            .config
            .credentials
            .extract(pipeline.request())
            .ok_or_else(|| EvaluatorError::with_code(Code::Unauthenticated, "credential not found"))?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EvaluatorError::cancelled()),
            claims = self.validate(&token) => claims,
        }
    }
}
