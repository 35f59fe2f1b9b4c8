//! WebFinger protocol implementation
//!
//! Used to discover ActivityPub actor URIs from `user@host` addresses, and
//! to answer discovery queries for the bridge's own actors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cancel;
use crate::error::{AppError, Result};
use crate::federation::client::{MAX_RESPONSE_BYTES, read_limited};

/// Resolves `name@host` to an actor IRI
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebFingerResolver: Send + Sync {
    async fn resolve(&self, cancel: &CancellationToken, host: &str, name: &str) -> Result<String>;
}

/// reqwest-backed resolver
#[derive(Clone)]
pub struct HttpWebFinger {
    client: reqwest::Client,
    scheme: &'static str,
}

impl HttpWebFinger {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            scheme: "https",
        }
    }

    /// Talk plain HTTP instead of HTTPS (local test servers).
    pub fn insecure(mut self) -> Self {
        self.scheme = "http";
        self
    }
}

#[async_trait]
impl WebFingerResolver for HttpWebFinger {
    async fn resolve(&self, cancel: &CancellationToken, host: &str, name: &str) -> Result<String> {
        let url = format!(
            "{}://{}/.well-known/webfinger?resource={}",
            self.scheme,
            host,
            urlencoding::encode(&format!("acct:{}@{}", name, host))
        );

        let body = cancel::run(cancel, async {
            let response = self
                .client
                .get(&url)
                .header("Accept", "application/jrd+json")
                .send()
                .await
                .map_err(|e| AppError::WebFinger(format!("request failed: {}", e)))?;

            if !response.status().is_success() {
                return Err(AppError::WebFinger(format!(
                    "HTTP {} from {}",
                    response.status(),
                    host
                )));
            }

            let body = read_limited(response, MAX_RESPONSE_BYTES)
                .await
                .map_err(|e| AppError::WebFinger(format!("read failed: {}", e)))?;
            if body.truncated {
                return Err(AppError::WebFinger(format!(
                    "response exceeds {} bytes",
                    MAX_RESPONSE_BYTES
                )));
            }
            Ok(body.bytes)
        })
        .await?;

        let jrd: WebFingerResponse = serde_json::from_slice(&body)
            .map_err(|e| AppError::WebFinger(format!("invalid JRD: {}", e)))?;

        jrd.self_link()
            .map(str::to_string)
            .ok_or_else(|| AppError::WebFinger(format!("no self link for {}@{}", name, host)))
    }
}

/// Split `user@host`, `@user@host` or `acct:user@host` into `(user, host)`.
pub fn parse_acct(addr: &str) -> Option<(&str, &str)> {
    let addr = addr.trim();
    let addr = addr
        .strip_prefix("acct:")
        .or_else(|| addr.strip_prefix('@'))
        .unwrap_or(addr);
    let (name, host) = addr.split_once('@')?;
    if name.is_empty() || host.is_empty() || host.contains('@') || host.contains('/') {
        return None;
    }
    Some((name, host))
}

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

impl WebFingerResponse {
    /// First `rel=self` href
    pub fn self_link(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|l| l.rel == "self")
            .and_then(|l| l.href.as_deref())
    }
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// Generate WebFinger response for a local actor.
///
/// # Arguments
/// * `name` - Account name in the query
/// * `host` - Bridge host
/// * `actor_url` - Actor document URL
pub fn generate_webfinger_response(name: &str, host: &str, actor_url: &str) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", name, host),
        aliases: Some(vec![actor_url.to_string()]),
        links: vec![WebFingerLink {
            rel: "self".to_string(),
            link_type: Some("application/activity+json".to_string()),
            href: Some(actor_url.to_string()),
        }],
    }
}
