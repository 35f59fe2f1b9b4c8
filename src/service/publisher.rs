//! Event publisher
//!
//! Turns internal events into activities of the interest actors and
//! delivers them to follower inboxes.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::actors::LocalActors;
use crate::error::Result;
use crate::event::{CloudEvent, event_to_activity};
use crate::federation::client::ActivityPubClient;
use crate::federation::vocab::builder;

/// Event type announcing a changed interest definition
pub const INTERESTS_UPDATED: &str = "interestsUpdated";

pub struct EventPublisher {
    client: Arc<dyn ActivityPubClient>,
    actors: LocalActors,
}

impl EventPublisher {
    pub fn new(client: Arc<dyn ActivityPubClient>, actors: LocalActors) -> Self {
        Self { client, actors }
    }

    pub fn actors(&self) -> &LocalActors {
        &self.actors
    }

    /// Activities published by the actor of `interest_id` for `event`.
    ///
    /// `interestsUpdated` yields an `Update` of the actor document followed
    /// by the regular `Create{Note}`.
    pub fn activities(&self, event: &CloudEvent, interest_id: &str) -> Vec<Value> {
        let actor_url = self.actors.actor_url(interest_id);
        let followers = self.actors.followers_url(interest_id);

        let mut activities = Vec::with_capacity(2);
        if event.kind == INTERESTS_UPDATED {
            activities.push(builder::update(
                &format!("{}/updates/{}", actor_url, urlencoding::encode(&event.id)),
                &actor_url,
                self.actors.document(interest_id),
                &followers,
            ));
        }
        activities.push(event_to_activity(event, &actor_url, &followers));
        activities
    }

    /// Deliver `event` to one follower inbox
    pub async fn deliver(
        &self,
        cancel: &CancellationToken,
        event: &CloudEvent,
        interest_id: &str,
        inbox: &str,
    ) -> Result<()> {
        let key_id = self.actors.key_id(interest_id);
        for activity in self.activities(event, interest_id) {
            self.client
                .send_activity(cancel, &activity, inbox, &key_id)
                .await?;
        }
        tracing::debug!(event_id = %event.id, interest_id = %interest_id, inbox = %inbox, "Event delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::federation::client::MockActivityPubClient;

    fn actors() -> LocalActors {
        LocalActors::new("https://ap.example", "bridge", "PEM")
    }

    #[test]
    fn interests_updated_emits_update_and_note() {
        let publisher = EventPublisher::new(Arc::new(MockActivityPubClient::new()), actors());
        let event = CloudEvent::new("e1", "https://src.example", INTERESTS_UPDATED);

        let activities = publisher.activities(&event, "i1");
        assert_eq!(activities.len(), 2);
        assert_eq!(activities[0]["type"], "Update");
        assert_eq!(activities[0]["object"]["id"], "https://ap.example/actor/i1");
        assert_eq!(activities[1]["type"], "Create");
        assert_eq!(activities[1]["object"]["type"], "Note");
    }

    #[test]
    fn regular_event_emits_note_only() {
        let publisher = EventPublisher::new(Arc::new(MockActivityPubClient::new()), actors());
        let event = CloudEvent::new("e1", "https://src.example", "com.example.v1");
        let activities = publisher.activities(&event, "i1");
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0]["cc"][0], "https://ap.example/followers/i1");
    }

    #[tokio::test]
    async fn deliver_signs_with_interest_key() {
        let mut client = MockActivityPubClient::new();
        client
            .expect_send_activity()
            .withf(|_, _, inbox, key_id| {
                inbox == "https://host.social/inbox" && key_id == "https://ap.example/actor/i1#main-key"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let publisher = EventPublisher::new(Arc::new(client), actors());
        let event = CloudEvent::new("e1", "https://src.example", "com.example.v1");

        publisher
            .deliver(&CancellationToken::new(), &event, "i1", "https://host.social/inbox")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deliver_stops_at_first_failure() {
        let mut client = MockActivityPubClient::new();
        client
            .expect_send_activity()
            .times(1)
            .returning(|_, _, _, _| Err(AppError::ActivitySend("500".to_string())));
        let publisher = EventPublisher::new(Arc::new(client), actors());
        let event = CloudEvent::new("e1", "https://src.example", INTERESTS_UPDATED);

        let result = publisher
            .deliver(&CancellationToken::new(), &event, "i1", "https://host.social/inbox")
            .await;
        assert!(matches!(result, Err(AppError::ActivitySend(_))));
    }
}
