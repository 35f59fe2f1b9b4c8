//! Hub-style callback
//!
//! The interest service pushes matched events here, one subscription per
//! `(interest, follower)` pair:
//!
//! - GET answers the subscription verification challenge
//! - POST delivers a JSON array of CloudEvents to the follower inbox

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Router, routing::get};

use crate::AppState;
use crate::error::{AppError, record_error};
use crate::event::CloudEvent;

pub const ACK_COUNT_HEADER: &str = "x-ack-count";

const PARAM_TOPIC: &str = "hub.topic";
const PARAM_CHALLENGE: &str = "hub.challenge";
const PARAM_FOLLOWER: &str = "follower";

/// Create callback router
///
/// Routes:
/// - GET /callback/:interest_id - Subscription verification
/// - POST /callback/:interest_id?follower=<actor> - Event delivery
pub fn callback_router() -> Router<AppState> {
    Router::new().route("/callback/:interest_id", get(verify).post(deliver))
}

/// GET /callback/:interest_id?hub.topic=..&hub.challenge=..
async fn verify(
    State(state): State<AppState>,
    Path(interest_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<String, AppError> {
    let topic = params.get(PARAM_TOPIC).map(String::as_str).unwrap_or_default();
    let prefix = &state.config.api.callback.topic.prefix;
    if !topic.starts_with(prefix.as_str()) {
        tracing::warn!(interest_id = %interest_id, topic = %topic, "Unexpected callback topic");
        return Err(AppError::Invalid(format!("unexpected topic {}", topic)));
    }
    let challenge = params.get(PARAM_CHALLENGE).cloned().unwrap_or_default();
    tracing::info!(interest_id = %interest_id, "Callback subscription verified");
    Ok(challenge)
}

fn ack_response(status: StatusCode, count: usize) -> Response {
    let mut response = status.into_response();
    response.headers_mut().insert(
        HeaderName::from_static(ACK_COUNT_HEADER),
        HeaderValue::from(count as u64),
    );
    response
}

/// POST /callback/:interest_id?follower=<actor IRI>
///
/// Replies with the number of delivered events in `X-Ack-Count`; the
/// status is 500 only when a non-empty batch had no delivery at all.
async fn deliver(
    State(state): State<AppState>,
    Path(interest_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Response, AppError> {
    let follower = params
        .get(PARAM_FOLLOWER)
        .filter(|f| !f.is_empty())
        .ok_or_else(|| AppError::Invalid("missing follower".to_string()))?;
    let events: Vec<CloudEvent> = serde_json::from_slice(&body)
        .map_err(|e| AppError::Invalid(format!("invalid events: {}", e)))?;
    if events.is_empty() {
        return Ok(ack_response(StatusCode::OK, 0));
    }

    let cancel = state.shutdown.child_token();
    let actors = state.publisher.actors();
    let actor = match state
        .federation
        .client()
        .fetch_actor(&cancel, follower, &actors.key_id(&interest_id))
        .await
    {
        Ok(actor) => actor,
        Err(e) => {
            record_error(&e, "callback");
            tracing::warn!(follower = %follower, error = %e, "Failed to fetch follower");
            return Ok(ack_response(StatusCode::INTERNAL_SERVER_ERROR, 0));
        }
    };

    let mut delivered = 0usize;
    for event in &events {
        match state
            .publisher
            .deliver(&cancel, event, &interest_id, &actor.inbox)
            .await
        {
            Ok(()) => delivered += 1,
            Err(e) => {
                record_error(&e, "callback");
                tracing::warn!(
                    event_id = %event.id,
                    follower = %follower,
                    error = %e,
                    "Failed to deliver event"
                );
            }
        }
    }

    let status = if delivered == 0 {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    tracing::debug!(interest_id = %interest_id, follower = %follower, delivered, total = events.len(), "Callback batch handled");
    Ok(ack_response(status, delivered))
}
