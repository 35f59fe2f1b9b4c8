//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (actor documents, inboxes, collections)
//! - Well-known discovery (WebFinger, NodeInfo)
//! - Hub callback delivery
//! - Internal source management
//! - Metrics (Prometheus)

mod activitypub;
mod callback;
pub mod metrics;
mod sources;
mod wellknown;

pub use activitypub::{ACTOR_CONTENT_TYPE, MAX_INBOX_BYTES, activitypub_router};
pub use callback::{ACK_COUNT_HEADER, callback_router};
pub use metrics::metrics_router;
pub use sources::{GROUP_ID_HEADER, USER_ID_HEADER, sources_router};
pub use wellknown::wellknown_router;
