//! Internal source-management API
//!
//! JSON over HTTP on the internal port. The caller identity travels in the
//! `X-Group-Id` / `X-User-Id` headers; errors carry a gRPC status code name.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::{Router, routing::get};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::data::{Order, Source};
use crate::error::{AppError, record_error};

pub const GROUP_ID_HEADER: &str = "x-group-id";
pub const USER_ID_HEADER: &str = "x-user-id";

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 1000;

/// Create internal API router
///
/// Routes:
/// - POST /v1/sources - Follow an actor
/// - GET /v1/sources - List followed actor IRIs
/// - DELETE /v1/sources?url= - Unfollow
/// - GET /v1/sources/read?url= - Read one source
pub fn sources_router() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/sources",
            get(list_sources).post(create_source).delete(delete_source),
        )
        .route("/v1/sources/read", get(read_source))
}

/// Internal API failure: `{"code": .., "message": ..}`
pub struct ApiError(AppError);

impl From<AppError> for ApiError {
    fn from(e: AppError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Four codes only: INVALID_ARGUMENT, NOT_FOUND and ALREADY_EXISTS keep
        // the error text, anything else is INTERNAL with a fixed message.
        let (status, code, message) = match self.0.code() {
            "INVALID_ARGUMENT" => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", self.0.to_string()),
            "NOT_FOUND" => (StatusCode::NOT_FOUND, "NOT_FOUND", self.0.to_string()),
            "ALREADY_EXISTS" => (StatusCode::CONFLICT, "ALREADY_EXISTS", self.0.to_string()),
            _ => {
                let message = match self.0 {
                    AppError::ActivitySend(_) => "failed to send activity",
                    _ => "internal failure",
                };
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message.to_string())
            }
        };
        record_error(&self.0, "sources");
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Internal API failure");
        }
        (
            status,
            Json(serde_json::json!({ "code": code, "message": message })),
        )
            .into_response()
    }
}

/// Caller identity from the request headers
fn owner(headers: &HeaderMap) -> Result<(String, String), ApiError> {
    let value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ApiError(AppError::Invalid(format!("missing {} header", name))))
    };
    Ok((value(GROUP_ID_HEADER)?, value(USER_ID_HEADER)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    pub addr: String,
    #[serde(default)]
    pub sub_id: String,
    #[serde(default)]
    pub term: String,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub url: String,
}

/// POST /v1/sources
async fn create_source(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateRequest>,
) -> Result<Json<CreateResponse>, ApiError> {
    let (group_id, user_id) = owner(&headers)?;
    if request.addr.trim().is_empty() {
        return Err(AppError::Invalid("empty address".to_string()).into());
    }
    let cancel = state.shutdown.child_token();
    let url = state
        .federation
        .request_follow(
            &cancel,
            &request.addr,
            &group_id,
            &user_id,
            &request.sub_id,
            &request.term,
        )
        .await?;
    Ok(Json(CreateResponse { url }))
}

#[derive(Debug, Deserialize)]
struct UrlQuery {
    url: String,
}

/// GET /v1/sources/read?url=
async fn read_source(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UrlQuery>,
) -> Result<Json<Source>, ApiError> {
    let (group_id, user_id) = owner(&headers)?;
    let source = state
        .federation
        .read(&query.url, &group_id, &user_id)
        .await?;
    Ok(Json(source))
}

/// DELETE /v1/sources?url=
async fn delete_source(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UrlQuery>,
) -> Result<StatusCode, ApiError> {
    let (group_id, user_id) = owner(&headers)?;
    let cancel = state.shutdown.child_token();
    state
        .federation
        .unfollow(&cancel, &query.url, &group_id, &user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    cursor: String,
    limit: Option<u32>,
    #[serde(default)]
    order: Order,
    pattern: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub urls: Vec<String>,
}

/// GET /v1/sources?cursor=&limit=&order=&pattern=
async fn list_sources(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let (group_id, user_id) = owner(&headers)?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let pattern = query.pattern.filter(|p| !p.is_empty());
    let urls = state
        .federation
        .list(&group_id, &user_id, pattern, limit, &query.cursor, query.order)
        .await?;
    Ok(Json(ListResponse { urls }))
}
