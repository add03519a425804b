//! Authenticated read endpoint over the listing stores.

pub mod auth;

use std::sync::Arc;

use anyhow::{bail, Context};
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use flatsync_core::ListingKind;
use flatsync_storage::RecordStore;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

pub use auth::{AuthError, Claims, JwksVerifier, SharedSecretVerifier, TokenVerifier};

pub const CRATE_NAME: &str = "flatsync-web";

#[derive(Clone)]
pub struct AppState {
    pub sale: Arc<dyn RecordStore>,
    pub rent: Arc<dyn RecordStore>,
    pub verifier: Arc<dyn TokenVerifier>,
}

impl AppState {
    fn store(&self, kind: ListingKind) -> &Arc<dyn RecordStore> {
        match kind {
            ListingKind::Sale => &self.sale,
            ListingKind::Rent => &self.rent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebConfig {
    pub port: u16,
    pub jwks_url: Option<String>,
    pub audience: Option<String>,
    pub issuer: Option<String>,
    pub secret: Option<String>,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            port: text("FLATSYNC_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(5000),
            jwks_url: text("FLATSYNC_JWKS_URL"),
            audience: text("FLATSYNC_JWT_AUDIENCE"),
            issuer: text("FLATSYNC_JWT_ISSUER"),
            secret: text("FLATSYNC_JWT_SECRET"),
        }
    }
}

/// Pick the token verifier for `config`: JWKS when a URL is set, otherwise the shared secret.
pub fn verifier_from_config(config: &WebConfig) -> anyhow::Result<Arc<dyn TokenVerifier>> {
    let audience = config.audience.as_deref();
    let issuer = config.issuer.as_deref();
    if let Some(url) = &config.jwks_url {
        let client = reqwest::Client::builder()
            .build()
            .context("building JWKS client")?;
        return Ok(Arc::new(JwksVerifier::new(client, url, audience, issuer)));
    }
    if let Some(secret) = &config.secret {
        warn!("FLATSYNC_JWKS_URL not set, verifying tokens with the shared secret");
        return Ok(Arc::new(SharedSecretVerifier::new(secret, audience, issuer)));
    }
    bail!("no token verification configured: set FLATSYNC_JWKS_URL or FLATSYNC_JWT_SECRET")
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/apartments/{id}", get(apartment_handler))
        .route("/rentals/{id}", get(rental_handler))
        .with_state(Arc::new(state))
}

/// Serve until Ctrl-C.
pub async fn serve(port: u16, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "read endpoint listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving read endpoint")?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn apartment_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    read_listing(&state, &headers, ListingKind::Sale, &id).await
}

async fn rental_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    read_listing(&state, &headers, ListingKind::Rent, &id).await
}

async fn read_listing(state: &AppState, headers: &HeaderMap, kind: ListingKind, id: &str) -> Response {
    let Some(token) = bearer_token(headers) else {
        return error_response(StatusCode::UNAUTHORIZED, "Token missing");
    };
    if let Err(err) = state.verifier.verify(token).await {
        debug!(error = %err, "rejected bearer token");
        return error_response(StatusCode::UNAUTHORIZED, "Invalid or expired token");
    }

    match state.store(kind).find_by_id(id).await {
        Ok(Some(listing)) => Json(listing).into_response(),
        Ok(None) => {
            let what = match kind {
                ListingKind::Sale => "Apartment",
                ListingKind::Rent => "Rental",
            };
            error_response(StatusCode::NOT_FOUND, &format!("{what} not found"))
        }
        Err(err) => {
            error!(%kind, id, error = %err, "store lookup failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::{claims, hs256_token, now, SECRET};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use flatsync_core::{Listing, ListingCandidate, ListingState, ListingUpdate, SyncError};
    use flatsync_storage::MemoryRecordStore;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct BrokenStore;

    #[async_trait]
    impl RecordStore for BrokenStore {
        fn kind(&self) -> ListingKind {
            ListingKind::Rent
        }

        async fn find_latest(&self) -> flatsync_core::Result<Option<Listing>> {
            Err(SyncError::store("connection refused"))
        }

        async fn find_by_id(&self, _id: &str) -> flatsync_core::Result<Option<Listing>> {
            Err(SyncError::store("connection refused"))
        }

        async fn find_by_state(&self, _state: ListingState) -> flatsync_core::Result<Vec<Listing>> {
            Err(SyncError::store("connection refused"))
        }

        async fn upsert_many(&self, _candidates: &[ListingCandidate]) -> flatsync_core::Result<usize> {
            Err(SyncError::store("connection refused"))
        }

        async fn upsert_one(
            &self,
            _id: &str,
            _update: &ListingUpdate,
            _create_if_missing: bool,
        ) -> flatsync_core::Result<bool> {
            Err(SyncError::store("connection refused"))
        }
    }

    async fn state_with(rent: Arc<dyn RecordStore>) -> AppState {
        let sale = MemoryRecordStore::new(ListingKind::Sale);
        sale.upsert_many(&[ListingCandidate::new(
            "3824111",
            "https://realt.by/grodno-region/sale-flats/object/3824111/",
        )])
        .await
        .unwrap();
        AppState {
            sale: Arc::new(sale),
            rent,
            verifier: Arc::new(SharedSecretVerifier::new(SECRET, None, None)),
        }
    }

    async fn get(state: AppState, uri: &str, auth: Option<String>) -> (StatusCode, String) {
        let mut request = Request::builder().uri(uri);
        if let Some(auth) = auth {
            request = request.header(header::AUTHORIZATION, auth);
        }
        let resp = app(state)
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn valid_bearer() -> String {
        format!("Bearer {}", hs256_token(&claims(now() + 600, None, None)))
    }

    fn rent_store() -> Arc<dyn RecordStore> {
        Arc::new(MemoryRecordStore::new(ListingKind::Rent))
    }

    #[tokio::test]
    async fn healthz_needs_no_token() {
        let (status, body) = get(state_with(rent_store()).await, "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn returns_stored_listing_for_valid_token() {
        let (status, body) = get(
            state_with(rent_store()).await,
            "/apartments/3824111",
            Some(valid_bearer()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let listing: Listing = serde_json::from_str(&body).unwrap();
        assert_eq!(listing.id, "3824111");
        assert_eq!(listing.kind, ListingKind::Sale);
        assert_eq!(listing.state, ListingState::Collected);
    }

    #[tokio::test]
    async fn bearer_scheme_is_case_insensitive() {
        let token = hs256_token(&claims(now() + 600, None, None));
        let (status, _) = get(
            state_with(rent_store()).await,
            "/apartments/3824111",
            Some(format!("bearer {token}")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let (status, body) = get(state_with(rent_store()).await, "/apartments/3824111", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, r#"{"error":"Token missing"}"#);

        let (status, body) = get(
            state_with(rent_store()).await,
            "/apartments/3824111",
            Some("Basic dXNlcjpwYXNz".to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, r#"{"error":"Token missing"}"#);
    }

    #[tokio::test]
    async fn expired_or_forged_token_is_unauthorized() {
        let expired = format!("Bearer {}", hs256_token(&claims(now() - 3600, None, None)));
        let (status, body) = get(state_with(rent_store()).await, "/apartments/3824111", Some(expired)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, r#"{"error":"Invalid or expired token"}"#);

        let (status, _) = get(
            state_with(rent_store()).await,
            "/apartments/3824111",
            Some("Bearer garbage.token.value".to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found_per_partition() {
        // 3824111 is a sale listing; the rent partition does not know it
        let (status, body) = get(
            state_with(rent_store()).await,
            "/rentals/3824111",
            Some(valid_bearer()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, r#"{"error":"Rental not found"}"#);
    }

    #[tokio::test]
    async fn store_failure_is_internal_error() {
        let (status, _) = get(
            state_with(Arc::new(BrokenStore)).await,
            "/rentals/1",
            Some(valid_bearer()),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn config_prefers_jwks_and_requires_some_verifier() {
        let config = WebConfig::from_lookup(|key| match key {
            "FLATSYNC_JWT_SECRET" => Some("dev".to_string()),
            "FLATSYNC_WEB_PORT" => Some("8080".to_string()),
            _ => None,
        });
        assert_eq!(config.port, 8080);
        assert!(verifier_from_config(&config).is_ok());

        let empty = WebConfig::from_lookup(|_| None);
        assert_eq!(empty.port, 5000);
        assert!(verifier_from_config(&empty).is_err());
    }
}
