//! Common test utilities for E2E tests
//!
//! A `TestServer` runs the public and internal routers on ephemeral ports
//! next to a `FakeRemote`, a minimal fediverse server with WebFinger, actor
//! documents and a recording inbox. Bus writes land in a `FakeBus`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use int_activitypub::config::{
    ActorConfig, ApiConfig, AppConfig, BatchConfig, CacheConfig, CallbackConfig, DbConfig,
    HttpConfig, KeyConfig, LogConfig, QueueConfig, SourceConfig, TableConfig, TopicConfig,
    WriterConfig,
};
use int_activitypub::data::{CachedSourceStorage, Database};
use int_activitypub::event::{BusError, CloudEvent, EventWriter, WriterClient, WriterPool};
use int_activitypub::federation::{HttpActivityPubClient, HttpWebFinger, Signer};
use int_activitypub::service::{EventPublisher, FederationService, LocalActors};
use int_activitypub::{AppState, build_internal_router, build_router};
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const BRIDGE_HOST: &str = "bridge.test";
pub const ACTOR_NAME: &str = "bridge";
pub const TOPIC_PREFIX: &str = "https://hub.test/v1/sub/";
pub const GROUP_ID: &str = "group0";
pub const USER_ID: &str = "user1";

/// PEM key pair, generated once per test binary
pub struct KeyPair {
    pub private_pem: String,
    pub public_pem: String,
}

fn generate_keypair() -> KeyPair {
    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    let public_key = RsaPublicKey::from(&private_key);
    KeyPair {
        private_pem: private_key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string(),
        public_pem: public_key.to_public_key_pem(LineEnding::LF).unwrap(),
    }
}

pub fn bridge_keys() -> &'static KeyPair {
    static KEYS: OnceLock<KeyPair> = OnceLock::new();
    KEYS.get_or_init(generate_keypair)
}

pub fn remote_keys() -> &'static KeyPair {
    static KEYS: OnceLock<KeyPair> = OnceLock::new();
    KEYS.get_or_init(generate_keypair)
}

async fn serve(app: axum::Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

// =============================================================================
// Fake bus
// =============================================================================

/// Records every event written through the pool
#[derive(Clone, Default)]
pub struct FakeBus {
    written: Arc<Mutex<Vec<(String, String, CloudEvent)>>>,
}

impl FakeBus {
    /// `(group_id, user_id, event)` in write order
    pub fn written(&self) -> Vec<(String, String, CloudEvent)> {
        self.written.lock().unwrap().clone()
    }

    /// Wait until at least `count` events arrived
    pub async fn wait_for(&self, count: usize) -> Vec<(String, String, CloudEvent)> {
        for _ in 0..50 {
            let written = self.written();
            if written.len() >= count {
                return written;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.written()
    }
}

struct FakeBusWriter {
    group_id: String,
    user_id: String,
    bus: FakeBus,
}

#[async_trait]
impl WriterClient for FakeBus {
    async fn open_writer(
        &self,
        _cancel: &CancellationToken,
        group_id: &str,
        user_id: &str,
    ) -> Result<Arc<dyn EventWriter>, BusError> {
        Ok(Arc::new(FakeBusWriter {
            group_id: group_id.to_string(),
            user_id: user_id.to_string(),
            bus: self.clone(),
        }))
    }
}

#[async_trait]
impl EventWriter for FakeBusWriter {
    async fn write_batch(
        &self,
        _cancel: &CancellationToken,
        events: &[CloudEvent],
    ) -> Result<u32, BusError> {
        let mut written = self.bus.written.lock().unwrap();
        for event in events {
            written.push((self.group_id.clone(), self.user_id.clone(), event.clone()));
        }
        Ok(events.len() as u32)
    }

    async fn close(&self) {}
}

// =============================================================================
// Fake remote fediverse server
// =============================================================================

/// Remote server hosting `alice`, `gone` (410) and `robot` (#nobot)
#[derive(Clone)]
pub struct FakeRemote {
    pub base: String,
    inbox: Arc<Mutex<Vec<Value>>>,
}

#[derive(Clone)]
struct RemoteState {
    base: Arc<OnceLock<String>>,
    inbox: Arc<Mutex<Vec<Value>>>,
}

impl RemoteState {
    fn base(&self) -> &str {
        self.base.get().map(String::as_str).unwrap_or_default()
    }
}

impl FakeRemote {
    pub async fn start() -> Self {
        let state = RemoteState {
            base: Arc::new(OnceLock::new()),
            inbox: Arc::new(Mutex::new(Vec::new())),
        };
        let app = axum::Router::new()
            .route("/.well-known/webfinger", get(remote_webfinger))
            .route("/users/:name", get(remote_actor))
            .route("/users/:name/inbox", axum::routing::post(remote_inbox))
            .with_state(state.clone());
        let base = serve(app).await;
        let _ = state.base.set(base.clone());
        Self {
            base,
            inbox: state.inbox,
        }
    }

    /// `host:port` of the remote
    pub fn host(&self) -> &str {
        self.base.trim_start_matches("http://")
    }

    pub fn actor_iri(&self, name: &str) -> String {
        format!("{}/users/{}", self.base, name)
    }

    pub fn key_id(&self, name: &str) -> String {
        format!("{}#main-key", self.actor_iri(name))
    }

    /// Activities the bridge delivered to any remote inbox
    pub fn received(&self) -> Vec<Value> {
        self.inbox.lock().unwrap().clone()
    }

    pub async fn wait_for(&self, count: usize) -> Vec<Value> {
        for _ in 0..50 {
            let received = self.received();
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.received()
    }
}

async fn remote_webfinger(
    State(state): State<RemoteState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let resource = query.get("resource").cloned().unwrap_or_default();
    let Some(name) = resource
        .strip_prefix("acct:")
        .and_then(|acct| acct.split_once('@'))
        .map(|(name, _)| name.to_string())
    else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    Json(json!({
        "subject": resource,
        "links": [{
            "rel": "self",
            "type": "application/activity+json",
            "href": format!("{}/users/{}", state.base(), name)
        }]
    }))
    .into_response()
}

async fn remote_actor(State(state): State<RemoteState>, Path(name): Path<String>) -> Response {
    if name == "gone" {
        return StatusCode::GONE.into_response();
    }
    let id = format!("{}/users/{}", state.base(), name);
    let mut actor = json!({
        "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
        "id": id,
        "type": "Person",
        "preferredUsername": name,
        "name": format!("{} example", name),
        "summary": "<p>posts about rust</p>",
        "inbox": format!("{}/inbox", id),
        "followers": format!("{}/followers", id),
        "publicKey": {
            "id": format!("{}#main-key", id),
            "owner": id,
            "publicKeyPem": remote_keys().public_pem
        }
    });
    if name == "robot" {
        actor["tag"] = json!([{ "type": "Hashtag", "name": "#nobot" }]);
    }
    Json(actor).into_response()
}

async fn remote_inbox(
    State(state): State<RemoteState>,
    Path(_name): Path<String>,
    Json(activity): Json<Value>,
) -> StatusCode {
    state.inbox.lock().unwrap().push(activity);
    StatusCode::ACCEPTED
}

/// Serve `document` as `/users/<name>` from a fresh host; returns the IRI
pub async fn serve_actor_document(name: &str, document: impl Fn(&str) -> Value) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let iri = format!("http://{}/users/{}", listener.local_addr().unwrap(), name);
    let body = document(&iri);
    let app = axum::Router::new().route(
        &format!("/users/{}", name),
        get(move || {
            let body = body.clone();
            async move { Json(body) }
        }),
    );
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    iri
}

// =============================================================================
// Test server
// =============================================================================

/// Test server instance
pub struct TestServer {
    /// Public API base URL
    pub addr: String,
    /// Internal API base URL
    pub internal_addr: String,
    pub state: AppState,
    pub remote: FakeRemote,
    pub bus: FakeBus,
    pub client: reqwest::Client,
    remote_signer: Signer,
    _temp_dir: TempDir,
}

fn test_config(db_uri: &str) -> AppConfig {
    let keys = bridge_keys();
    AppConfig {
        api: ApiConfig {
            http: HttpConfig {
                host: BRIDGE_HOST.to_string(),
                port: 0,
            },
            port: 0,
            writer: WriterConfig {
                uri: "ws://unused".to_string(),
                backoff: Duration::from_secs(2),
                batch: BatchConfig { size: 16 },
                cache: CacheConfig {
                    size: 16,
                    ttl: Duration::from_secs(3600),
                },
            },
            queue: QueueConfig {
                uri: String::new(),
                name: "int-activitypub".to_string(),
                subj: "follow-notifications".to_string(),
                batch: BatchConfig { size: 16 },
            },
            callback: CallbackConfig {
                topic: TopicConfig {
                    prefix: TOPIC_PREFIX.to_string(),
                },
            },
            actor: ActorConfig {
                name: ACTOR_NAME.to_string(),
            },
            key: KeyConfig {
                public: keys.public_pem.clone(),
                private: keys.private_pem.clone(),
            },
            source: SourceConfig {
                cache: CacheConfig {
                    size: 100,
                    ttl: Duration::from_secs(60),
                },
            },
        },
        db: DbConfig {
            uri: db_uri.to_string(),
            table: TableConfig {
                name: "sources".to_string(),
            },
        },
        log: LogConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
    }
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        int_activitypub::metrics::init_metrics();

        let temp_dir = TempDir::new().unwrap();
        let db_uri = format!(
            "sqlite://{}?mode=rwc",
            temp_dir.path().join("test.db").display()
        );
        let config = test_config(&db_uri);

        let db = Arc::new(
            Database::connect(&config.db.uri, &config.db.table.name)
                .await
                .unwrap(),
        );
        let sources = Arc::new(CachedSourceStorage::new(
            db.clone(),
            config.api.source.cache.size,
            config.api.source.cache.ttl,
        ));

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();
        let signer = Arc::new(Signer::from_pem(&config.api.key.private).unwrap());
        let ap_client = Arc::new(HttpActivityPubClient::new(http_client.clone(), signer));
        let webfinger = Arc::new(HttpWebFinger::new(http_client.clone()).insecure());

        let bus = FakeBus::default();
        let writers = Arc::new(WriterPool::new(
            Arc::new(bus.clone()),
            config.api.writer.cache.size,
            config.api.writer.cache.ttl,
            config.api.writer.backoff,
        ));

        let actors = LocalActors::new(
            &config.api.http.base_url(),
            &config.api.actor.name,
            &config.api.key.public,
        );
        let federation = FederationService::new(
            sources,
            db,
            webfinger,
            ap_client.clone(),
            writers,
            actors.clone(),
        );
        let publisher = Arc::new(EventPublisher::new(ap_client, actors));

        let state = AppState {
            config: Arc::new(config),
            federation,
            publisher,
            shutdown: CancellationToken::new(),
        };

        let remote = FakeRemote::start().await;
        let addr = serve(build_router(state.clone())).await;
        let internal_addr = serve(build_internal_router(state.clone())).await;

        Self {
            addr,
            internal_addr,
            state,
            remote,
            bus,
            client: http_client,
            remote_signer: Signer::from_pem(&remote_keys().private_pem).unwrap(),
            _temp_dir: temp_dir,
        }
    }

    /// Public API URL
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Internal API URL
    pub fn internal_url(&self, path: &str) -> String {
        format!("{}{}", self.internal_addr, path)
    }

    /// POST an activity to a public inbox, signed by remote user `name`
    pub async fn post_signed(&self, path: &str, name: &str, activity: &Value) -> reqwest::Response {
        self.post_signed_with_key(path, &self.remote.key_id(name), activity)
            .await
    }

    /// POST `activity` signed with the remote key under an arbitrary key id
    pub async fn post_signed_with_key(
        &self,
        path: &str,
        key_id: &str,
        activity: &Value,
    ) -> reqwest::Response {
        let url = self.url(path);
        let body = serde_json::to_vec(activity).unwrap();
        let sig = self
            .remote_signer
            .sign_request("POST", &url, &body, key_id)
            .unwrap();
        self.client
            .post(&url)
            .header("Content-Type", "application/activity+json")
            .header("Date", sig.date)
            .header("Digest", sig.digest)
            .header("Signature", sig.signature)
            .body(body)
            .send()
            .await
            .unwrap()
    }

    /// POST `sent` while carrying the signature computed over `signed`
    pub async fn post_tampered(
        &self,
        path: &str,
        name: &str,
        signed: &Value,
        sent: &Value,
    ) -> reqwest::Response {
        let url = self.url(path);
        let signed_body = serde_json::to_vec(signed).unwrap();
        let sig = self
            .remote_signer
            .sign_request("POST", &url, &signed_body, &self.remote.key_id(name))
            .unwrap();
        self.client
            .post(&url)
            .header("Content-Type", "application/activity+json")
            .header("Date", sig.date)
            .header("Digest", sig.digest)
            .header("Signature", sig.signature)
            .body(serde_json::to_vec(sent).unwrap())
            .send()
            .await
            .unwrap()
    }

    /// Follow `addr` through the internal API on behalf of the test tenant
    pub async fn follow(&self, addr: &str) -> reqwest::Response {
        self.client
            .post(self.internal_url("/v1/sources"))
            .header("X-Group-Id", GROUP_ID)
            .header("X-User-Id", USER_ID)
            .json(&json!({ "addr": addr, "subId": "interest1", "term": "rust" }))
            .send()
            .await
            .unwrap()
    }

    /// Follow remote `name` and have the remote accept it
    pub async fn follow_accepted(&self, name: &str) -> String {
        let response = self.follow(&self.remote.actor_iri(name)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let iri = self.remote.actor_iri(name);
        let accept = json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{}/accepts/1", iri),
            "type": "Accept",
            "actor": iri,
            "object": format!("https://{}/actor/interest1/follows/1", BRIDGE_HOST)
        });
        let response = self.post_signed("/inbox", name, &accept).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        iri
    }
}

/// A public Create{Note} from remote `actor`
pub fn public_note(actor: &str, n: u32) -> Value {
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{}/statuses/{}/activity", actor, n),
        "type": "Create",
        "actor": actor,
        "published": "2024-05-01T10:00:00Z",
        "to": ["https://www.w3.org/ns/activitystreams#Public"],
        "cc": [format!("{}/followers", actor)],
        "object": {
            "id": format!("{}/statuses/{}", actor, n),
            "type": "Note",
            "attributedTo": actor,
            "content": "<p>Hello <b>fediverse</b></p>",
            "url": format!("{}/statuses/{}", actor, n),
            "published": "2024-05-01T10:00:00Z",
            "to": ["https://www.w3.org/ns/activitystreams#Public"]
        }
    })
}
