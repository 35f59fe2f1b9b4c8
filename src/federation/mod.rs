//! ActivityPub federation module
//!
//! Handles:
//! - HTTP Signatures
//! - WebFinger
//! - Actor fetching and activity delivery
//! - The ActivityStreams subset spoken by Mastodon-compatible servers

pub mod client;
pub mod signature;
pub mod vocab;
pub mod webfinger;

pub use client::{ActivityPubClient, HttpActivityPubClient, MAX_RESPONSE_BYTES};
pub use signature::{Signer, verify_signature};
pub use vocab::{Activity, ActivityType, Actor, fix_context};
pub use webfinger::{HttpWebFinger, WebFingerResolver, generate_webfinger_response};
