//! Service layer
//!
//! Contains business logic separated from HTTP handlers.
//! Services orchestrate storage, federation and the event bus.

mod actors;
mod federation;
mod publisher;
mod queue;

pub use actors::LocalActors;
pub use federation::{FederationService, PostAction};
pub use publisher::{EventPublisher, INTERESTS_UPDATED};
pub use queue::{ATTR_INTEREST_ID, QueueConsumer, RESTART_DELAY};
