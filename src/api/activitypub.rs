//! ActivityPub endpoints
//!
//! - Actor documents (shared and per interest)
//! - Inbox (activity receiving)
//! - Outbox
//! - Followers/Following collections

use axum::body::{Body, Bytes};
use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::{
    Router,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::Value;

use crate::AppState;
use crate::error::{AppError, record_error};
use crate::federation::signature::{key_id_matches_actor, verify_signature};
use crate::federation::vocab::{AS_CONTEXT, Activity, fix_context};
use crate::metrics::{
    FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS,
    HTTP_REQUESTS_TOTAL,
};

/// Upper bound for inbox request bodies
pub const MAX_INBOX_BYTES: usize = 262_144;

pub const ACTOR_CONTENT_TYPE: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

const COLLECTION_PAGE_SIZE: u32 = 40;

/// Create ActivityPub router
///
/// Routes:
/// - GET /actor, GET /actor/:id - Actor documents
/// - POST /inbox, POST /inbox/:id - Inboxes
/// - GET /outbox - Outbox
/// - GET /followers/:id - Followers collection
/// - GET /following - Following collection
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/actor", get(shared_actor))
        .route("/actor/:id", get(interest_actor))
        .route("/inbox", post(shared_inbox))
        .route("/inbox/:id", post(interest_inbox))
        .route("/outbox", get(outbox))
        .route("/followers/:id", get(followers))
        .route("/following", get(following))
}

// =============================================================================
// Actor
// =============================================================================

/// GET /actor
async fn shared_actor(State(state): State<AppState>, headers: HeaderMap) -> Response {
    actor_response(&state, "", &headers, "/actor")
}

/// GET /actor/:id
async fn interest_actor(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    actor_response(&state, &id, &headers, "/actor/:id")
}

fn wants_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html") && !accept.contains("json"))
}

fn actor_response(state: &AppState, id: &str, headers: &HeaderMap, route: &str) -> Response {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", route])
        .start_timer();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", route, "200"])
        .inc();

    let actors = state.federation.actors();
    if wants_html(headers) {
        let local_id = actors.local_id(id);
        let page = format!(
            "<!DOCTYPE html>\n<html><head><title>{name}</title></head><body>\
             <h1>{name}</h1>\
             <p>This is an automated ActivityPub actor of {host}. It republishes public posts and never reads private messages.</p>\
             <p>Follow <code>@{name}@{host}</code> from any fediverse server.</p>\
             </body></html>",
            name = html_escape::encode_text(local_id),
            host = html_escape::encode_text(actors.host()),
        );
        return Html(page).into_response();
    }

    let doc = fix_context(actors.document(id));
    ([(header::CONTENT_TYPE, ACTOR_CONTENT_TYPE)], Json(doc)).into_response()
}

// =============================================================================
// Inbox
// =============================================================================

/// Inbox failure with the fixed inbox status mapping
struct InboxError(AppError);

impl From<AppError> for InboxError {
    fn from(e: AppError) -> Self {
        Self(e)
    }
}

impl InboxError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            AppError::Conflict => StatusCode::CONFLICT,
            AppError::NoAccept(_) | AppError::NoBot => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Invalid(_) | AppError::Signature(_) => StatusCode::BAD_REQUEST,
            AppError::ActorGone => StatusCode::GONE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for InboxError {
    fn into_response(self) -> Response {
        let status = self.status();
        record_error(&self.0, "inbox");
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["inbound", status.as_str()])
            .inc();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Inbox failure");
        } else {
            tracing::info!(error = %self.0, status = %status, "Inbox rejected activity");
        }
        let message = match status {
            StatusCode::INTERNAL_SERVER_ERROR => "internal failure".to_string(),
            _ => self.0.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// POST /inbox
async fn shared_inbox(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, InboxError> {
    receive(state, "", uri.path(), headers, body).await
}

/// POST /inbox/:id
async fn interest_inbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, InboxError> {
    receive(state, &id, uri.path(), headers, body).await
}

/// Receive one activity
///
/// # Steps
/// 1. Read the bounded body and parse the activity
/// 2. Swallow untyped activities and self-deletes
/// 3. Refuse `#nobot`
/// 4. Fetch the sender and verify the HTTP signature against its key
/// 5. Hand over to the federation service; its post-action runs after the reply
async fn receive(
    state: AppState,
    interest_id: &str,
    path: &str,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, InboxError> {
    let _timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    let bytes: Bytes = axum::body::to_bytes(body, MAX_INBOX_BYTES)
        .await
        .map_err(|_| AppError::Invalid(format!("body exceeds {} bytes", MAX_INBOX_BYTES)))?;
    let activity: Activity = serde_json::from_slice(&bytes)
        .map_err(|e| AppError::Invalid(format!("invalid activity: {}", e)))?;

    if activity.kind.is_empty() || activity.is_self_delete() {
        return Ok(StatusCode::ACCEPTED);
    }
    if activity.has_nobot() {
        return Err(AppError::NoBot.into());
    }
    let actor_id = activity.actor_id();
    if actor_id.is_empty() {
        return Err(AppError::Invalid("activity has no actor".to_string()).into());
    }

    let cancel = state.shutdown.child_token();
    let federation = &state.federation;
    let key_id = federation.actors().key_id(interest_id);
    let actor = federation
        .client()
        .fetch_actor(&cancel, actor_id, &key_id)
        .await?;

    let public_key_pem = actor
        .public_key_pem()
        .ok_or_else(|| AppError::Signature(format!("actor {} has no public key", actor.id)))?;
    let signature = verify_signature("POST", path, &headers, &bytes, public_key_pem)?;
    if actor.id != actor_id
        || !key_id_matches_actor(&signature.key_id, &actor.id)
        || Some(signature.key_id.as_str()) != actor.public_key_id()
    {
        return Err(AppError::Signature(format!(
            "key {} does not belong to {}",
            signature.key_id, actor.id
        ))
        .into());
    }

    if let Some(action) = federation
        .handle_activity(&cancel, &actor, &activity, interest_id)
        .await?
    {
        tokio::spawn(action);
    }

    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["inbound", "202"])
        .inc();
    tracing::debug!(actor = %actor.id, kind = %activity.kind, "Activity accepted");
    Ok(StatusCode::ACCEPTED)
}

// =============================================================================
// Collections
// =============================================================================

#[derive(Debug, Deserialize)]
struct PageQuery {
    cursor: Option<String>,
}

/// GET /outbox
///
/// The bridge never publishes from the shared actor.
async fn outbox(State(state): State<AppState>) -> Json<Value> {
    let base_url = state.federation.actors().base_url();
    Json(serde_json::json!({
        "@context": AS_CONTEXT,
        "type": "OrderedCollection",
        "id": format!("{}/outbox", base_url),
        "totalItems": 0,
        "orderedItems": []
    }))
}

fn collection_page(
    collection_url: &str,
    cursor: &str,
    total: i64,
    items: Vec<String>,
    page_size: u32,
) -> Value {
    let next = items
        .last()
        .filter(|_| items.len() as u32 == page_size)
        .map(|last| format!("{}?cursor={}", collection_url, urlencoding::encode(last)));

    let mut page = serde_json::json!({
        "@context": AS_CONTEXT,
        "type": "OrderedCollectionPage",
        "id": format!("{}?cursor={}", collection_url, urlencoding::encode(cursor)),
        "partOf": collection_url,
        "totalItems": total,
        "orderedItems": items
    });
    if let Some(next) = next {
        page["next"] = Value::String(next);
    }
    page
}

/// GET /followers/:id
async fn followers(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Value>, AppError> {
    let federation = &state.federation;
    let cursor = query.cursor.unwrap_or_default();
    let total = federation.count_followers(&id).await?;
    let items = federation
        .followers_page(&id, COLLECTION_PAGE_SIZE, &cursor)
        .await?
        .into_iter()
        .map(|f| f.actor_id)
        .collect();
    Ok(Json(collection_page(
        &federation.actors().followers_url(&id),
        &cursor,
        total,
        items,
        COLLECTION_PAGE_SIZE,
    )))
}

/// GET /following
async fn following(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Value>, AppError> {
    let federation = &state.federation;
    let cursor = query.cursor.unwrap_or_default();
    let total = federation.count_sources().await?;
    let items = federation
        .following_page(COLLECTION_PAGE_SIZE, &cursor)
        .await?;
    Ok(Json(collection_page(
        &format!("{}/following", federation.actors().base_url()),
        &cursor,
        total,
        items,
        COLLECTION_PAGE_SIZE,
    )))
}
