//! Bearer-token verification for the read endpoints.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    pub exp: i64,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token rejected: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("no signing key for kid {0:?}")]
    UnknownKey(Option<String>),
    #[error("fetching signing keys: {0}")]
    KeySet(String),
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError>;
}

fn validation(algorithm: Algorithm, audience: Option<&str>, issuer: Option<&str>) -> Validation {
    let mut validation = Validation::new(algorithm);
    match audience {
        Some(audience) => validation.set_audience(&[audience]),
        None => validation.validate_aud = false,
    }
    if let Some(issuer) = issuer {
        validation.set_issuer(&[issuer]);
    }
    validation
}

/// HS256 tokens signed with a shared secret. Meant for development setups.
pub struct SharedSecretVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl SharedSecretVerifier {
    pub fn new(secret: &str, audience: Option<&str>, issuer: Option<&str>) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: validation(Algorithm::HS256, audience, issuer),
        }
    }
}

#[async_trait]
impl TokenVerifier for SharedSecretVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        Ok(decode::<Claims>(token, &self.key, &self.validation)?.claims)
    }
}

/// RS256 tokens checked against a remote JWKS. Keys are cached by `kid` and
/// the set is refetched when a token names a key not seen yet, at most once
/// per refresh interval.
pub struct JwksVerifier {
    client: reqwest::Client,
    jwks_url: String,
    validation: Validation,
    keys: RwLock<HashMap<String, DecodingKey>>,
    refresh_interval: Duration,
    last_refresh: Mutex<Option<Instant>>,
}

impl JwksVerifier {
    pub fn new(
        client: reqwest::Client,
        jwks_url: impl Into<String>,
        audience: Option<&str>,
        issuer: Option<&str>,
    ) -> Self {
        Self {
            client,
            jwks_url: jwks_url.into(),
            validation: validation(Algorithm::RS256, audience, issuer),
            keys: RwLock::new(HashMap::new()),
            refresh_interval: Duration::from_secs(60),
            last_refresh: Mutex::new(None),
        }
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Refetch unless another refresh started within the interval.
    /// Returns whether a fetch happened.
    async fn refresh_if_due(&self) -> Result<bool, AuthError> {
        let mut last = self.last_refresh.lock().await;
        if let Some(at) = *last {
            if at.elapsed() < self.refresh_interval {
                return Ok(false);
            }
        }
        *last = Some(Instant::now());
        self.refresh().await?;
        Ok(true)
    }

    async fn refresh(&self) -> Result<(), AuthError> {
        let set = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| AuthError::KeySet(e.to_string()))?
            .json::<JwkSet>()
            .await
            .map_err(|e| AuthError::KeySet(e.to_string()))?;

        let mut keys = HashMap::new();
        for jwk in &set.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                continue;
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(err) => debug!(kid = %kid, error = %err, "skipping unusable jwk"),
            }
        }
        info!(count = keys.len(), "signing keys refreshed");
        *self.keys.write().await = keys;
        Ok(())
    }

    async fn cached_key(&self, kid: &str) -> Option<DecodingKey> {
        self.keys.read().await.get(kid).cloned()
    }
}

#[async_trait]
impl TokenVerifier for JwksVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let kid = decode_header(token)?
            .kid
            .ok_or(AuthError::UnknownKey(None))?;

        let key = match self.cached_key(&kid).await {
            Some(key) => key,
            None => {
                if !self.refresh_if_due().await? {
                    warn!(kid = %kid, "unknown kid, key refresh throttled");
                }
                self.cached_key(&kid)
                    .await
                    .ok_or_else(|| AuthError::UnknownKey(Some(kid.clone())))?
            }
        };
        Ok(decode::<Claims>(token, &key, &self.validation)?.claims)
    }
}
