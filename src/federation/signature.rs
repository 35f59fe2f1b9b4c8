//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/
//!
//! Outbound requests always sign `(request-target) host date digest`,
//! including GETs where the digest covers an empty body.

use crate::error::AppError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

/// Maximum tolerated distance between the `date` header and now, in seconds
pub const CLOCK_SKEW_SECS: i64 = 120;

const SIGNED_HEADERS: &str = "(request-target) host date digest";

/// Holds the private key shared by every local actor
#[derive(Clone)]
pub struct Signer {
    key: SigningKey<Sha256>,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

impl Signer {
    /// Parse a PEM private key in PKCS#8 or PKCS#1 form.
    pub fn from_pem(private_key_pem: &str) -> Result<Self, AppError> {
        let pem = private_key_pem.trim();
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| AppError::Config(format!("Invalid private key: {}", e)))?;
        Ok(Self {
            key: SigningKey::<Sha256>::new(private_key),
        })
    }

    /// Sign an HTTP request
    ///
    /// Creates HTTP Signature header for outgoing requests.
    ///
    /// # Arguments
    /// * `method` - HTTP method (e.g., "POST")
    /// * `url` - Full URL being requested
    /// * `body` - Request body (empty for GET)
    /// * `key_id` - Full URL to the public key (actor#main-key)
    ///
    /// # Returns
    /// Headers to add: Signature, Date, Digest, Host
    pub fn sign_request(
        &self,
        method: &str,
        url: &str,
        body: &[u8],
        key_id: &str,
    ) -> Result<SignatureHeaders, AppError> {
        let parsed_url =
            url::Url::parse(url).map_err(|e| AppError::Invalid(format!("Invalid URL: {}", e)))?;

        let host = host_header(&parsed_url)?;
        let request_target = format!("{} {}", method.to_lowercase(), path_and_query(&parsed_url));
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let digest = generate_digest(body);

        let signing_string = format!(
            "(request-target): {}\nhost: {}\ndate: {}\ndigest: {}",
            request_target, host, date, digest
        );

        let mut rng = rand::thread_rng();
        let signature = self.key.sign_with_rng(&mut rng, signing_string.as_bytes());
        let signature_b64 = BASE64.encode(signature.to_bytes());

        let signature_header = format!(
            "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
            key_id, SIGNED_HEADERS, signature_b64
        );

        Ok(SignatureHeaders {
            signature: signature_header,
            date,
            digest,
            host,
        })
    }
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value
    pub digest: String,
    /// Host header value, including a non-default port
    pub host: String,
}

fn host_header(url: &url::Url) -> Result<String, AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Invalid("Missing host in URL".to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn path_and_query(url: &url::Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    }
}

/// Parse a PEM public key as SubjectPublicKeyInfo, falling back to PKCS#1.
pub fn parse_public_key(public_key_pem: &str) -> Result<RsaPublicKey, AppError> {
    let pem = public_key_pem.trim();
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| AppError::Signature(format!("Invalid public key: {}", e)))
}

/// Verify an HTTP request signature
///
/// # Arguments
/// * `method` - HTTP method
/// * `path` - Request path and query
/// * `headers` - All request headers
/// * `body` - Request body (for digest verification)
/// * `public_key_pem` - RSA public key in PEM format
///
/// # Returns
/// The parsed Signature header on success
///
/// # Errors
/// `AppError::Signature` on any mismatch
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: &[u8],
    public_key_pem: &str,
) -> Result<ParsedSignature, AppError> {
    // 1. Parse Signature header
    let parsed = parse_signature_header(header_str(headers, "signature")?)?;

    // 2. Validate algorithm and required signed headers.
    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(AppError::Signature(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    for required in ["(request-target)", "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(AppError::Signature(format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }

    if !body.is_empty() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(AppError::Signature(
            "Signed headers must include: digest".to_string(),
        ));
    }

    // 3. Verify Date is recent.
    let date = DateTime::parse_from_rfc2822(header_str(headers, "date")?)
        .map_err(|_| AppError::Signature("Invalid Date format".to_string()))?;
    let diff = (Utc::now().timestamp() - date.timestamp()).abs();
    if diff > CLOCK_SKEW_SECS {
        return Err(AppError::Signature(
            "Date header too old or in future".to_string(),
        ));
    }

    // 4. Verify Digest whenever it was signed or a body is present.
    if !body.is_empty() || parsed.headers.iter().any(|h| h == "digest") {
        let digest_str = header_str(headers, "digest")?;
        if !digest_matches(digest_str, body) {
            return Err(AppError::Signature("Digest mismatch".to_string()));
        }
    }

    // 5. Reconstruct signing string.
    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            name => header_str(headers, name)?.to_string(),
        };
        signing_parts.push(format!("{}: {}", header_name, value));
    }
    let signing_string = signing_parts.join("\n");

    // 6. Verify RSA signature.
    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| AppError::Signature("Invalid signature encoding".to_string()))?;
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| AppError::Signature(format!("Invalid signature format: {}", e)))?;

    let verifier = VerifyingKey::<Sha256>::new(parse_public_key(public_key_pem)?);
    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::Signature("Signature verification failed".to_string()))?;

    Ok(parsed)
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::Signature(format!("Missing {} header", name)))?
        .to_str()
        .map_err(|_| AppError::Signature(format!("Invalid {} header", name)))
}

/// A Digest header may list several algorithms; only SHA-256 is checked.
fn digest_matches(header: &str, body: &[u8]) -> bool {
    let expected = generate_digest(body);
    let expected_value = &expected["SHA-256=".len()..];
    header.split(',').any(|part| {
        part.trim()
            .split_once('=')
            .is_some_and(|(alg, value)| alg.eq_ignore_ascii_case("sha-256") && value == expected_value)
    })
}

/// Whether `key_id` names a key published by `actor_id`.
///
/// Accepts a fragment of the actor IRI (`<actor>#main-key`) and a path
/// below it (`<actor>/main-key`).
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key = key_id.split_once('#').map_or(key_id, |(iri, _)| iri);
    let actor = actor_id.trim_end_matches('/');
    if actor.is_empty() {
        return false;
    }
    key == actor
        || key
            .strip_prefix(actor)
            .is_some_and(|rest| rest.starts_with('/') && !rest[1..].contains('/'))
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
///
/// `algorithm` defaults to `hs2019` and `headers` to `date` when omitted.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_ascii_lowercase()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| AppError::Signature("Missing keyId".to_string()))?,
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature
            .ok_or_else(|| AppError::Signature("Missing signature".to_string()))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue};
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    fn generate_test_keypair() -> (RsaPrivateKey, String, String) {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).expect("key generation should work");
        let public_key = RsaPublicKey::from(&private_key);

        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("private key pem")
            .to_string();
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .expect("public key pem");

        (private_key, private_key_pem, public_key_pem)
    }

    fn build_signed_header_map(
        signer: &Signer,
        method: &str,
        url: &str,
        body: &[u8],
    ) -> (HeaderMap, String) {
        let key_id = "https://remote.example/users/alice#main-key";
        let signed = signer.sign_request(method, url, body, key_id).expect("signed");
        let parsed_url = url::Url::parse(url).expect("valid test url");

        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_str(&signed.host).expect("host header"));
        headers.insert("date", HeaderValue::from_str(&signed.date).expect("date header"));
        headers.insert(
            "digest",
            HeaderValue::from_str(&signed.digest).expect("digest header"),
        );
        headers.insert(
            "signature",
            HeaderValue::from_str(&signed.signature).expect("signature header"),
        );

        (headers, path_and_query(&parsed_url))
    }

    #[test]
    fn verify_signature_accepts_valid_signed_request() {
        let (_, private_key_pem, public_key_pem) = generate_test_keypair();
        let signer = Signer::from_pem(&private_key_pem).unwrap();
        let body = br#"{"type":"Follow"}"#;
        let (headers, path) =
            build_signed_header_map(&signer, "POST", "https://remote.example/inbox?foo=bar", body);

        let parsed = verify_signature("POST", &path, &headers, body, &public_key_pem)
            .expect("valid signature should verify");
        assert_eq!(parsed.key_id, "https://remote.example/users/alice#main-key");
        assert_eq!(parsed.headers.join(" "), SIGNED_HEADERS);
    }

    #[test]
    fn signs_get_with_empty_body_digest() {
        let (_, private_key_pem, public_key_pem) = generate_test_keypair();
        let signer = Signer::from_pem(&private_key_pem).unwrap();
        let (headers, path) =
            build_signed_header_map(&signer, "GET", "https://remote.example/users/bob", b"");

        assert_eq!(
            headers.get("digest").unwrap(),
            "SHA-256=47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
        assert!(verify_signature("GET", &path, &headers, b"", &public_key_pem).is_ok());
    }

    #[test]
    fn host_header_keeps_non_default_port() {
        let (_, private_key_pem, _) = generate_test_keypair();
        let signer = Signer::from_pem(&private_key_pem).unwrap();
        let signed = signer
            .sign_request("POST", "http://127.0.0.1:4567/inbox", b"{}", "k")
            .unwrap();
        assert_eq!(signed.host, "127.0.0.1:4567");

        let signed = signer
            .sign_request("POST", "https://remote.example:443/inbox", b"{}", "k")
            .unwrap();
        assert_eq!(signed.host, "remote.example");
    }

    #[test]
    fn accepts_pkcs1_private_key() {
        let (private_key, _, public_key_pem) = generate_test_keypair();
        let pkcs1 = private_key.to_pkcs1_pem(LineEnding::LF).unwrap().to_string();
        let signer = Signer::from_pem(&pkcs1).expect("pkcs1 key should parse");
        let body = b"{}";
        let (headers, path) =
            build_signed_header_map(&signer, "POST", "https://remote.example/inbox", body);
        assert!(verify_signature("POST", &path, &headers, body, &public_key_pem).is_ok());
    }

    #[test]
    fn rejects_garbage_private_key() {
        assert!(matches!(
            Signer::from_pem("not a key"),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn verify_signature_rejects_tampered_body() {
        let (_, private_key_pem, public_key_pem) = generate_test_keypair();
        let signer = Signer::from_pem(&private_key_pem).unwrap();
        let body = br#"{"type":"Follow"}"#;
        let (headers, path) =
            build_signed_header_map(&signer, "POST", "https://remote.example/inbox", body);

        match verify_signature("POST", &path, &headers, br#"{"type":"Undo"}"#, &public_key_pem) {
            Err(AppError::Signature(msg)) => assert!(msg.contains("Digest mismatch")),
            other => panic!("expected digest mismatch, got: {other:?}"),
        }
    }

    #[test]
    fn verify_signature_rejects_other_key() {
        let (_, private_key_pem, _) = generate_test_keypair();
        let (_, _, other_public_pem) = generate_test_keypair();
        let signer = Signer::from_pem(&private_key_pem).unwrap();
        let body = b"{}";
        let (headers, path) =
            build_signed_header_map(&signer, "POST", "https://remote.example/inbox", body);

        match verify_signature("POST", &path, &headers, body, &other_public_pem) {
            Err(AppError::Signature(msg)) => assert!(msg.contains("verification failed")),
            other => panic!("expected verification failure, got: {other:?}"),
        }
    }

    #[test]
    fn verify_signature_rejects_other_path() {
        let (_, private_key_pem, public_key_pem) = generate_test_keypair();
        let signer = Signer::from_pem(&private_key_pem).unwrap();
        let body = b"{}";
        let (headers, _) =
            build_signed_header_map(&signer, "POST", "https://remote.example/inbox", body);

        assert!(matches!(
            verify_signature("POST", "/inbox/other", &headers, body, &public_key_pem),
            Err(AppError::Signature(_))
        ));
    }

    #[test]
    fn verify_signature_rejects_missing_date_header() {
        let (_, private_key_pem, public_key_pem) = generate_test_keypair();
        let signer = Signer::from_pem(&private_key_pem).unwrap();
        let body = br#"{"type":"Follow"}"#;
        let (mut headers, path) =
            build_signed_header_map(&signer, "POST", "https://remote.example/inbox", body);
        headers.remove("date");

        match verify_signature("POST", &path, &headers, body, &public_key_pem) {
            Err(AppError::Signature(msg)) => assert!(msg.contains("Missing date header")),
            other => panic!("expected missing date header error, got: {other:?}"),
        }
    }

    #[test]
    fn verify_signature_rejects_stale_date() {
        let (_, private_key_pem, public_key_pem) = generate_test_keypair();
        let signer = Signer::from_pem(&private_key_pem).unwrap();
        let body = b"{}";
        let (mut headers, path) =
            build_signed_header_map(&signer, "POST", "https://remote.example/inbox", body);
        let stale = (Utc::now() - chrono::Duration::seconds(CLOCK_SKEW_SECS + 60))
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        headers.insert("date", HeaderValue::from_str(&stale).unwrap());

        match verify_signature("POST", &path, &headers, body, &public_key_pem) {
            Err(AppError::Signature(msg)) => assert!(msg.contains("too old")),
            other => panic!("expected stale date error, got: {other:?}"),
        }
    }

    #[test]
    fn verify_signature_rejects_when_digest_not_signed() {
        let (_, private_key_pem, public_key_pem) = generate_test_keypair();
        let signer = Signer::from_pem(&private_key_pem).unwrap();
        let body = br#"{"type":"Follow"}"#;
        let (mut headers, path) =
            build_signed_header_map(&signer, "POST", "https://remote.example/inbox", body);

        let parsed =
            parse_signature_header(headers.get("signature").unwrap().to_str().unwrap()).unwrap();
        let tampered = format!(
            "keyId=\"{}\",algorithm=\"{}\",headers=\"(request-target) host date\",signature=\"{}\"",
            parsed.key_id, parsed.algorithm, parsed.signature
        );
        headers.insert("signature", HeaderValue::from_str(&tampered).unwrap());

        match verify_signature("POST", &path, &headers, body, &public_key_pem) {
            Err(AppError::Signature(msg)) => {
                assert!(msg.contains("Signed headers must include: digest"))
            }
            other => panic!("expected missing signed digest error, got: {other:?}"),
        }
    }

    #[test]
    fn digest_accepts_multiple_algorithms() {
        let header = format!("SHA-512=abc,{}", generate_digest(b"hi"));
        assert!(digest_matches(&header, b"hi"));
        assert!(!digest_matches("SHA-512=abc", b"hi"));
    }

    #[test]
    fn key_id_matches_actor_checks_actor() {
        assert!(key_id_matches_actor(
            "https://remote.example/users/alice#main-key",
            "https://remote.example/users/alice",
        ));
        assert!(key_id_matches_actor(
            "https://gts.example/users/alice/main-key",
            "https://gts.example/users/alice",
        ));
        assert!(!key_id_matches_actor(
            "https://remote.example/users/bob#main-key",
            "https://remote.example/users/alice",
        ));
        assert!(!key_id_matches_actor(
            "https://remote.example/users/alice2#main-key",
            "https://remote.example/users/alice",
        ));
        assert!(!key_id_matches_actor(
            "https://remote.example/users/alice/other/key",
            "https://remote.example/users/alice",
        ));
        assert!(!key_id_matches_actor("https://remote.example/users/alice#main-key", ""));
    }
}
