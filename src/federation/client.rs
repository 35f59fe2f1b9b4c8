//! Outbound ActivityPub HTTP client
//!
//! Fetches remote actors and delivers activities to remote inboxes. Every
//! request is signed with the bridge key and every response body is read
//! with a hard size bound.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::cancel;
use crate::error::{AppError, Result};
use crate::federation::signature::Signer;
use crate::federation::vocab::{Actor, fix_context};
use crate::metrics::{
    ACTIVITYPUB_ACTIVITIES_SENT, FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL,
};

/// Upper bound for remote response bodies
pub const MAX_RESPONSE_BYTES: usize = 65_536;

pub const ACTIVITY_CONTENT_TYPE: &str =
    "application/ld+json; profile=\"http://www.w3.org/ns/activitystreams\"";

const ACTOR_ACCEPT: &str = "application/activity+json";
const SEND_ATTEMPTS: u32 = 3;
const SEND_BACKOFF: Duration = Duration::from_millis(200);

/// Fetches actors and sends activities on behalf of local actors
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActivityPubClient: Send + Sync {
    /// GET a remote actor, signed with `key_id`.
    ///
    /// `410 Gone` maps to [`AppError::ActorGone`].
    async fn fetch_actor(
        &self,
        cancel: &CancellationToken,
        iri: &str,
        key_id: &str,
    ) -> Result<Actor>;

    /// POST `activity` to `inbox`, signed with `key_id`.
    async fn send_activity(
        &self,
        cancel: &CancellationToken,
        activity: &serde_json::Value,
        inbox: &str,
        key_id: &str,
    ) -> Result<()>;
}

/// Response body read up to a limit
#[derive(Debug)]
pub struct LimitedBody {
    pub bytes: Vec<u8>,
    /// The peer sent more than the limit; the rest was not read
    pub truncated: bool,
}

/// Read at most `limit` bytes of `response`, chunk by chunk.
pub async fn read_limited(
    mut response: reqwest::Response,
    limit: usize,
) -> std::result::Result<LimitedBody, reqwest::Error> {
    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let room = limit - bytes.len();
        if chunk.len() > room {
            bytes.extend_from_slice(&chunk[..room]);
            return Ok(LimitedBody {
                bytes,
                truncated: true,
            });
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(LimitedBody {
        bytes,
        truncated: false,
    })
}

/// reqwest-backed client
#[derive(Clone)]
pub struct HttpActivityPubClient {
    http_client: reqwest::Client,
    signer: Arc<Signer>,
}

impl HttpActivityPubClient {
    pub fn new(http_client: reqwest::Client, signer: Arc<Signer>) -> Self {
        Self {
            http_client,
            signer,
        }
    }

    fn signed_get(&self, iri: &str, key_id: &str) -> Result<reqwest::RequestBuilder> {
        let sig = self.signer.sign_request("GET", iri, b"", key_id)?;
        Ok(self
            .http_client
            .get(iri)
            .header("Accept", ACTOR_ACCEPT)
            .header("Date", sig.date)
            .header("Digest", sig.digest)
            .header("Signature", sig.signature))
    }

    fn signed_post(&self, inbox: &str, body: &[u8], key_id: &str) -> Result<reqwest::RequestBuilder> {
        let sig = self.signer.sign_request("POST", inbox, body, key_id)?;
        Ok(self
            .http_client
            .post(inbox)
            .header("Content-Type", ACTIVITY_CONTENT_TYPE)
            .header("Date", sig.date)
            .header("Digest", sig.digest)
            .header("Signature", sig.signature)
            .body(body.to_vec()))
    }

    async fn deliver(
        &self,
        cancel: &CancellationToken,
        inbox: &str,
        body: &[u8],
        key_id: &str,
    ) -> Result<()> {
        let mut backoff = SEND_BACKOFF;
        for attempt in 1..=SEND_ATTEMPTS {
            // Signed per attempt so the date stays fresh.
            let request = self.signed_post(inbox, body, key_id)?;
            let last = attempt == SEND_ATTEMPTS;

            match cancel::run(cancel, async { Ok(request.send().await) }).await? {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::GONE {
                        return Err(AppError::ActorGone);
                    }
                    if status.is_success() {
                        return Ok(());
                    }
                    if !should_retry_status(status) || last {
                        return Err(AppError::ActivitySend(format!(
                            "inbox {} responded HTTP {}",
                            inbox, status
                        )));
                    }
                    tracing::debug!(inbox = %inbox, status = %status, attempt, "Retrying delivery");
                }
                Err(e) => {
                    if last {
                        return Err(AppError::ActivitySend(format!(
                            "failed to deliver to {}: {}",
                            inbox, e
                        )));
                    }
                    tracing::debug!(inbox = %inbox, error = %e, attempt, "Retrying delivery");
                }
            }

            cancel::sleep(cancel, with_jitter(backoff)).await?;
            backoff = backoff.saturating_mul(2);
        }
        unreachable!("delivery loop returns on the last attempt")
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn with_jitter(base: Duration) -> Duration {
    let jitter_ms: u64 = rand::thread_rng().gen_range(0..=100);
    base + Duration::from_millis(jitter_ms)
}

fn record_outbound(status: &str) {
    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["outbound", status])
        .inc();
}

#[async_trait]
impl ActivityPubClient for HttpActivityPubClient {
    async fn fetch_actor(
        &self,
        cancel: &CancellationToken,
        iri: &str,
        key_id: &str,
    ) -> Result<Actor> {
        let timer = FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["fetch"])
            .start_timer();
        let request = self.signed_get(iri, key_id)?;

        let body = cancel::run(cancel, async {
            let response = request
                .send()
                .await
                .map_err(|e| AppError::ActorFetch(format!("request to {} failed: {}", iri, e)))?;

            let status = response.status();
            record_outbound(status.as_str());
            if status == StatusCode::GONE {
                return Err(AppError::ActorGone);
            }
            if status.as_u16() > 299 {
                return Err(AppError::ActorFetch(format!("{} responded HTTP {}", iri, status)));
            }

            read_limited(response, MAX_RESPONSE_BYTES)
                .await
                .map_err(|e| AppError::ActorFetch(format!("failed to read {}: {}", iri, e)))
        })
        .await?;
        timer.observe_duration();

        if body.truncated {
            tracing::warn!(iri = %iri, limit = MAX_RESPONSE_BYTES, "Actor document truncated");
        }

        let actor: Actor = serde_json::from_slice(&body.bytes)
            .map_err(|e| AppError::ActorFetch(format!("invalid actor {}: {}", iri, e)))?;
        if actor.id != iri {
            return Err(AppError::ActorFetch(format!(
                "document at {} claims id {:?}",
                iri, actor.id
            )));
        }
        Ok(actor)
    }

    async fn send_activity(
        &self,
        cancel: &CancellationToken,
        activity: &serde_json::Value,
        inbox: &str,
        key_id: &str,
    ) -> Result<()> {
        let activity_type = activity
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("unknown")
            .to_string();
        let body = serde_json::to_vec(&fix_context(activity.clone()))
            .map_err(|e| AppError::ActivitySend(format!("failed to serialize activity: {}", e)))?;

        let timer = FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["deliver"])
            .start_timer();
        let result = self.deliver(cancel, inbox, &body, key_id).await;
        timer.observe_duration();

        match &result {
            Ok(()) => {
                record_outbound("success");
                ACTIVITYPUB_ACTIVITIES_SENT
                    .with_label_values(&[&activity_type])
                    .inc();
                tracing::info!(inbox = %inbox, activity_type = %activity_type, "Delivered activity");
            }
            Err(e) => {
                record_outbound("failure");
                tracing::warn!(inbox = %inbox, activity_type = %activity_type, error = %e, "Activity delivery failed");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::signature::generate_digest;
    use axum::{
        Router,
        body::Bytes,
        http::HeaderMap,
        routing::{get, post},
    };
    use rsa::RsaPrivateKey;
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};
    use serde_json::json;
    use std::sync::Mutex;

    type Seen = Arc<Mutex<Vec<(HeaderMap, Bytes)>>>;

    fn client() -> HttpActivityPubClient {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("key generation");
        let pem = key.to_pkcs8_pem(LineEnding::LF).expect("pem").to_string();
        HttpActivityPubClient::new(
            reqwest::Client::new(),
            Arc::new(Signer::from_pem(&pem).expect("signer")),
        )
    }

    async fn serve(seen: Seen) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let alice = format!("{}/users/alice", base);
        let record = move |headers: HeaderMap, body: Bytes| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push((headers, body));
                StatusCode::ACCEPTED
            }
        };
        let app = Router::new()
            .route(
                "/users/alice",
                get(move || {
                    let alice = alice.clone();
                    async move {
                        axum::Json(json!({
                            "inbox": format!("{}/inbox", alice),
                            "id": alice,
                            "type": "Person"
                        }))
                    }
                }),
            )
            .route(
                "/users/impostor",
                get(|| async {
                    axum::Json(json!({
                        "id": "https://remote.example/users/alice",
                        "type": "Person",
                        "inbox": "https://remote.example/users/alice/inbox"
                    }))
                }),
            )
            .route("/users/gone", get(|| async { StatusCode::GONE }))
            .route("/users/broken", get(|| async { StatusCode::NOT_FOUND }))
            .route(
                "/users/huge",
                get(|| async {
                    axum::Json(json!({
                        "id": "https://remote.example/users/huge",
                        "summary": "x".repeat(2 * MAX_RESPONSE_BYTES)
                    }))
                }),
            )
            .route("/inbox", post(record))
            .route("/inbox/gone", post(|| async { StatusCode::GONE }))
            .route("/inbox/bad", post(|| async { StatusCode::BAD_REQUEST }));

        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        base
    }

    const KEY_ID: &str = "https://bridge.test/actor#main-key";

    #[tokio::test]
    async fn fetch_maps_statuses() {
        let base = serve(Arc::default()).await;
        let client = client();
        let cancel = CancellationToken::new();

        let actor = client
            .fetch_actor(&cancel, &format!("{}/users/alice", base), KEY_ID)
            .await
            .unwrap();
        assert_eq!(actor.id, format!("{}/users/alice", base));

        let impostor = client
            .fetch_actor(&cancel, &format!("{}/users/impostor", base), KEY_ID)
            .await;
        assert!(matches!(impostor, Err(AppError::ActorFetch(_))));

        let gone = client
            .fetch_actor(&cancel, &format!("{}/users/gone", base), KEY_ID)
            .await;
        assert!(matches!(gone, Err(AppError::ActorGone)));

        let missing = client
            .fetch_actor(&cancel, &format!("{}/users/broken", base), KEY_ID)
            .await;
        assert!(matches!(missing, Err(AppError::ActorFetch(_))));
    }

    #[tokio::test]
    async fn oversized_actor_is_cut_at_the_bound() {
        let base = serve(Arc::default()).await;
        let result = client()
            .fetch_actor(
                &CancellationToken::new(),
                &format!("{}/users/huge", base),
                KEY_ID,
            )
            .await;
        // The truncated document no longer parses
        assert!(matches!(result, Err(AppError::ActorFetch(_))));
    }

    #[tokio::test]
    async fn send_signs_body_with_digest() {
        let seen: Seen = Arc::default();
        let base = serve(seen.clone()).await;
        let activity = json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Follow",
            "actor": "https://bridge.test/actor",
            "object": "https://remote.example/users/alice"
        });

        client()
            .send_activity(
                &CancellationToken::new(),
                &activity,
                &format!("{}/inbox", base),
                KEY_ID,
            )
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (headers, body) = &seen[0];
        assert_eq!(headers.get_all("signature").iter().count(), 1);
        let signature = headers["signature"].to_str().unwrap();
        assert!(signature.contains(&format!("keyId=\"{}\"", KEY_ID)));
        assert_eq!(headers["digest"].to_str().unwrap(), generate_digest(body));
        assert_eq!(headers["content-type"].to_str().unwrap(), ACTIVITY_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn send_maps_statuses() {
        let base = serve(Arc::default()).await;
        let client = client();
        let cancel = CancellationToken::new();
        let activity = json!({ "type": "Undo" });

        let gone = client
            .send_activity(&cancel, &activity, &format!("{}/inbox/gone", base), KEY_ID)
            .await;
        assert!(matches!(gone, Err(AppError::ActorGone)));

        let rejected = client
            .send_activity(&cancel, &activity, &format!("{}/inbox/bad", base), KEY_ID)
            .await;
        assert!(matches!(rejected, Err(AppError::ActivitySend(_))));
    }

    #[tokio::test]
    async fn cancelled_send_stops() {
        let base = serve(Arc::default()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = client()
            .send_activity(&cancel, &json!({}), &format!("{}/inbox", base), KEY_ID)
            .await;
        assert!(matches!(result, Err(AppError::Canceled)));
    }
}
