//! Axum HTTP surface for oss-stats: the GitHub star webhook and JSON reads
//! over the cached stats.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use oss_stats_sync::{Reconciler, StatsConfig, StatsQuery, SyncError};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "oss-stats-web";

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

type HmacSha256 = Hmac<Sha256>;

pub struct AppState {
    pub query: StatsQuery,
    pub reconciler: Reconciler,
    pub webhook_secret: String,
    pub webhook_path: String,
    /// Owners and orgs listed by the unfiltered collection routes.
    pub github_owners: Vec<String>,
    pub npm_orgs: Vec<String>,
}

impl AppState {
    pub fn new(query: StatsQuery, reconciler: Reconciler, webhook_secret: impl Into<String>) -> Self {
        Self {
            query,
            reconciler,
            webhook_secret: webhook_secret.into(),
            webhook_path: oss_stats_sync::config::DEFAULT_WEBHOOK_PATH.to_string(),
            github_owners: Vec::new(),
            npm_orgs: Vec::new(),
        }
    }

    pub fn from_config(config: &StatsConfig, query: StatsQuery, reconciler: Reconciler) -> Self {
        Self {
            query,
            reconciler,
            webhook_secret: config.github_webhook_secret.clone(),
            webhook_path: config.sources.webhook_path.clone(),
            github_owners: config.sources.github_owners.clone(),
            npm_orgs: config.sources.npm_orgs.clone(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    let webhook_path = if state.webhook_path.starts_with('/') {
        state.webhook_path.clone()
    } else {
        format!("/{}", state.webhook_path)
    };
    Router::new()
        .route(&webhook_path, post(star_webhook_handler))
        .route("/github/owners", get(github_owners_handler))
        .route("/github/owners/{owner}", get(github_owner_handler))
        .route("/github/repos/{owner}/{name}", get(github_repo_handler))
        .route("/npm/orgs", get(npm_orgs_handler))
        .route("/npm/orgs/{org}", get(npm_org_handler))
        .route("/npm/packages", get(npm_packages_handler))
        .route("/npm/packages/{*name}", get(npm_package_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, webhook_path = %state.webhook_path, "http server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Checks a `sha256=<hex>` signature header against the raw request body.
pub fn verify_signature(secret: &[u8], body: &[u8], header: Option<&str>) -> bool {
    let Some(hex_digest) = header.and_then(|h| h.trim().strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StarEvent {
    pub repository: StarEventRepository,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StarEventRepository {
    pub name: String,
    pub owner: StarEventOwner,
    pub stargazers_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StarEventOwner {
    pub login: String,
}

impl StarEvent {
    pub fn parse(body: &[u8]) -> Result<Self, WebhookError> {
        let event: StarEvent = serde_json::from_slice(body)
            .map_err(|err| WebhookError::InvalidPayload(err.to_string()))?;
        if event.repository.name.trim().is_empty() || event.repository.owner.login.trim().is_empty() {
            return Err(WebhookError::InvalidPayload(
                "repository name and owner login must be non-empty".into(),
            ));
        }
        Ok(event)
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook signature invalid")]
    SignatureInvalid,
    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl WebhookError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::SignatureInvalid => StatusCode::UNAUTHORIZED,
            Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Self::Sync(err) if err.is_not_found() => StatusCode::NOT_FOUND,
            Self::Sync(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::SignatureInvalid => status.into_response(),
            other => (status, other.to_string()).into_response(),
        }
    }
}

async fn star_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, WebhookError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    if !verify_signature(state.webhook_secret.as_bytes(), &body, signature) {
        warn!("rejected webhook with bad signature");
        return Err(WebhookError::SignatureInvalid);
    }

    let event = StarEvent::parse(&body)?;
    let repo = &event.repository;
    let outcome = state
        .reconciler
        .apply_star_event(&repo.owner.login, &repo.name, repo.stargazers_count)
        .await
        .inspect_err(|err| warn!(owner = %repo.owner.login, repo = %repo.name, error = %err, "star event failed"))?;
    info!(
        owner = %repo.owner.login,
        repo = %repo.name,
        stars = repo.stargazers_count,
        owner_stars = outcome.owner_star_count,
        "star event accepted"
    );
    Ok(StatusCode::OK)
}

#[derive(Debug, Default, Deserialize)]
struct NamesQuery {
    names: Option<String>,
}

impl NamesQuery {
    /// Comma-separated `names`, or `None` when the parameter is absent.
    ///
    /// Blank entries are kept so batch answers line up with the request.
    fn names(&self) -> Option<Vec<String>> {
        self.names.as_deref().map(|raw| {
            if raw.trim().is_empty() {
                return Vec::new();
            }
            raw.split(',').map(|name| name.trim().to_string()).collect()
        })
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn json_or_404<T: Serialize>(found: Result<Option<T>, SyncError>, what: &str) -> Response {
    match found {
        Ok(Some(row)) => Json(row).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("{what} not found"),
            }),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

fn json_or_500<T: Serialize>(result: Result<T, SyncError>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: SyncError) -> Response {
    warn!(error = %err, "query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

async fn github_owners_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NamesQuery>,
) -> Response {
    match query.names() {
        Some(names) => json_or_500(state.query.get_github_owners(&names).await),
        None => json_or_500(state.query.get_all_github_owners(&state.github_owners).await),
    }
}

async fn github_owner_handler(
    State(state): State<Arc<AppState>>,
    Path(owner): Path<String>,
) -> Response {
    json_or_404(state.query.get_github_owner(&owner).await, "github owner")
}

async fn github_repo_handler(
    State(state): State<Arc<AppState>>,
    Path((owner, name)): Path<(String, String)>,
) -> Response {
    json_or_404(state.query.get_github_repo(&owner, &name).await, "github repo")
}

async fn npm_orgs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NamesQuery>,
) -> Response {
    match query.names() {
        Some(names) => json_or_500(state.query.get_npm_orgs(&names).await),
        None => json_or_500(state.query.get_all_npm_orgs(&state.npm_orgs).await),
    }
}

async fn npm_org_handler(State(state): State<Arc<AppState>>, Path(org): Path<String>) -> Response {
    json_or_404(state.query.get_npm_org(&org).await, "npm org")
}

async fn npm_packages_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NamesQuery>,
) -> Response {
    let names = query.names().unwrap_or_default();
    json_or_500(state.query.get_npm_packages(&names).await)
}

async fn npm_package_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    json_or_404(state.query.get_npm_package(&name).await, "npm package")
}
