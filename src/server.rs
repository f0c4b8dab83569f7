//! HTTP surface over the token and sync services.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info};

use crate::db::{Database, DbError};
use crate::gmail::{MailProvider, ProviderError};
use crate::inbound::{InboundDescriptor, InboundSyncEngine, SyncResult};
use crate::tokens::{RefreshSummary, TokenRefresher};

pub const USER_ID_HEADER: &str = "x-user-id";

pub struct AppState {
    pub db: Arc<Database>,
    pub tokens: Arc<TokenRefresher>,
    pub engine: Arc<InboundSyncEngine>,
    pub mail: Arc<dyn MailProvider>,
    pub default_hours_back: u32,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Provider(ProviderError::Config(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Provider(_) => StatusCode::BAD_GATEWAY,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(err) if err.downcast_ref::<ProviderError>().is_some() => {
                StatusCode::BAD_GATEWAY
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(%status, "request failed: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/gmail/auth-url", post(auth_url))
        .route("/auth/gmail/callback", get(oauth_callback))
        .route("/gmail/sync", post(sync_from_body))
        .route("/gmail/sync/{user_id}", post(sync_for_user))
        .route("/gmail/refresh-tokens", post(refresh_tokens))
        .route("/gmail/token-status/{user_id}", get(token_status))
        .route("/admin/accounts-needing-reauth", get(accounts_needing_reauth))
        .route("/inbound-email", post(inbound_email))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.db.token_status_counts() {
        Ok(tokens) => Json(json!({ "status": "ok", "tokens": tokens })).into_response(),
        Err(err) => {
            error!("health check: {err}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthUrlRequest {
    user_id: Option<String>,
}

async fn auth_url(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: AuthUrlRequest = if body.iter().all(u8::is_ascii_whitespace) {
        AuthUrlRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| ApiError::BadRequest(format!("invalid request body: {err}")))?
    };

    let user_id = request
        .user_id
        .or_else(|| {
            headers
                .get(USER_ID_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("userId is required".to_string()))?;

    let url = state.tokens.authorization_url(&user_id)?;
    Ok(Json(json!({ "url": url })))
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Result<Json<Value>, ApiError> {
    if let Some(denied) = params.error {
        return Err(ApiError::BadRequest(format!("authorization denied: {denied}")));
    }
    let code = params
        .code
        .filter(|code| !code.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing code".to_string()))?;
    let user_id = params
        .state
        .filter(|user_id| !user_id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing state".to_string()))?;

    let token = state
        .tokens
        .complete_authorization(&user_id, &code, state.mail.as_ref())
        .await?;
    info!(user_id = %user_id, email = %token.email, "oauth callback completed");
    Ok(Json(json!({
        "success": true,
        "userId": token.user_id,
        "email": token.email,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest {
    user_id: String,
    hours_back: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HoursBackQuery {
    hours_back: Option<u32>,
}

async fn sync_from_body(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SyncRequest>,
) -> Result<Json<SyncResult>, ApiError> {
    run_sync(&state, &request.user_id, request.hours_back).await
}

async fn sync_for_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(query): Query<HoursBackQuery>,
) -> Result<Json<SyncResult>, ApiError> {
    run_sync(&state, &user_id, query.hours_back).await
}

async fn run_sync(
    state: &AppState,
    user_id: &str,
    hours_back: Option<u32>,
) -> Result<Json<SyncResult>, ApiError> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(ApiError::BadRequest("userId is required".to_string()));
    }
    let hours_back = hours_back.unwrap_or(state.default_hours_back);
    Ok(Json(state.engine.sync_recent_emails(user_id, hours_back).await))
}

async fn refresh_tokens(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RefreshSummary>, ApiError> {
    Ok(Json(state.tokens.refresh_all_tokens().await?))
}

async fn token_status(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Json<Value> {
    let valid = state.tokens.validate_token_for_user(&user_id).await;
    Json(json!({ "userId": user_id, "valid": valid }))
}

async fn accounts_needing_reauth(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let accounts = state.tokens.accounts_needing_reauth()?;
    Ok(Json(json!({ "count": accounts.len(), "accounts": accounts })))
}

async fn inbound_email(
    State(state): State<Arc<AppState>>,
    Json(descriptor): Json<InboundDescriptor>,
) -> Response {
    if state.engine.handle_inbound_webhook(&descriptor) {
        Json(json!({ "success": true })).into_response()
    } else {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "success": false, "error": "inbound message rejected" })),
        )
            .into_response()
    }
}
