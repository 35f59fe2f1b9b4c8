//! Outbound queue consumer
//!
//! Reads internal events from the bus queue and delivers each one to the
//! followers of the interest named by its `interestid` attribute.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::federation::FederationService;
use super::publisher::EventPublisher;
use crate::cancel;
use crate::error::{AppError, Result};
use crate::event::bus::{BusError, QueueClient};
use crate::event::CloudEvent;
use crate::metrics::QUEUE_EVENTS_TOTAL;

pub const ATTR_INTEREST_ID: &str = "interestid";

const FOLLOWERS_PAGE: u32 = 100;

/// First delay before resubscribing; doubles up to [`MAX_RESTART_DELAY`]
pub const RESTART_DELAY: Duration = Duration::from_millis(500);
pub const MAX_RESTART_DELAY: Duration = Duration::from_secs(60);

pub struct QueueConsumer {
    client: Arc<dyn QueueClient>,
    service: FederationService,
    publisher: Arc<EventPublisher>,
    queue: String,
    subject: String,
    batch_size: u32,
}

impl QueueConsumer {
    /// # Arguments
    /// * `queue` / `subject` / `batch_size` - Sent in the `start` frame
    pub fn new(
        client: Arc<dyn QueueClient>,
        service: FederationService,
        publisher: Arc<EventPublisher>,
        queue: &str,
        subject: &str,
        batch_size: u32,
    ) -> Self {
        Self {
            client,
            service,
            publisher,
            queue: queue.to_string(),
            subject: subject.to_string(),
            batch_size,
        }
    }

    fn map_err(&self, e: BusError) -> AppError {
        match e {
            BusError::NotFound => AppError::QueueMissing(self.queue.clone()),
            BusError::Canceled => AppError::Canceled,
            other => AppError::Internal(anyhow::anyhow!("queue {}: {}", self.queue, other)),
        }
    }

    /// Keep consuming until `cancel` fires.
    ///
    /// Every end of [`run`](Self::run), clean or not, is followed by a
    /// resubscription after a growing delay. A run that lasted longer than
    /// the longest delay resets it.
    pub async fn supervise(&self, cancel: &CancellationToken, initial_delay: Duration) {
        let mut delay = initial_delay;
        loop {
            let started = Instant::now();
            match self.run(cancel).await {
                Err(AppError::Canceled) => break,
                Ok(()) => tracing::warn!(queue = %self.queue, "Queue stream closed; resubscribing"),
                Err(e) => tracing::error!(queue = %self.queue, error = %e, "Queue consumer failed"),
            }
            if cancel.is_cancelled() {
                break;
            }
            if started.elapsed() > MAX_RESTART_DELAY {
                delay = initial_delay;
            }
            if cancel::sleep(cancel, delay).await.is_err() {
                break;
            }
            delay = delay.saturating_mul(2).min(MAX_RESTART_DELAY);
        }
        tracing::info!(queue = %self.queue, "Queue consumer stopped");
    }

    /// Consume until the bus closes the stream or `cancel` fires.
    ///
    /// Every received batch is acknowledged after all of its events were
    /// processed, whatever the delivery outcome.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let mut subscription = self
            .client
            .subscribe(cancel, &self.queue, &self.subject, self.batch_size)
            .await
            .map_err(|e| self.map_err(e))?;
        tracing::info!(queue = %self.queue, subject = %self.subject, "Queue consumer started");

        loop {
            let batch = match subscription.next_batch(cancel).await {
                Ok(batch) => batch,
                Err(BusError::Eof) => {
                    tracing::info!(queue = %self.queue, "Queue stream ended");
                    return Ok(());
                }
                Err(e) => return Err(self.map_err(e)),
            };

            for event in &batch {
                self.process(cancel, event).await;
            }
            subscription
                .ack(cancel, batch.len() as u32)
                .await
                .map_err(|e| self.map_err(e))?;
        }
    }

    async fn process(&self, cancel: &CancellationToken, event: &CloudEvent) {
        let interest_id = event.attr_str(ATTR_INTEREST_ID);
        if interest_id.is_empty() {
            tracing::debug!(event_id = %event.id, "Event without interest, skipping");
            QUEUE_EVENTS_TOTAL.with_label_values(&["skipped"]).inc();
            return;
        }

        let mut cursor = String::new();
        let mut delivered = 0usize;
        let mut failed = 0usize;
        loop {
            let page = match self
                .service
                .followers_page(interest_id, FOLLOWERS_PAGE, &cursor)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    tracing::error!(interest_id = %interest_id, error = %e, "Failed to list followers");
                    break;
                }
            };
            for follower in &page {
                match self
                    .publisher
                    .deliver(cancel, event, interest_id, &follower.inbox)
                    .await
                {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        failed += 1;
                        tracing::warn!(
                            event_id = %event.id,
                            follower = %follower.actor_id,
                            error = %e,
                            "Failed to deliver event"
                        );
                    }
                }
            }
            match page.last() {
                Some(last) if page.len() as u32 == FOLLOWERS_PAGE => cursor = last.actor_id.clone(),
                _ => break,
            }
        }

        let result = if failed > 0 { "failed" } else { "ok" };
        QUEUE_EVENTS_TOTAL.with_label_values(&[result]).inc();
        tracing::debug!(event_id = %event.id, interest_id = %interest_id, delivered, failed, "Event processed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Database, Follower, FollowerStorage};
    use crate::event::bus::QueueSubscription;
    use crate::event::WriterPool;
    use crate::event::bus::{EventWriter, WriterClient};
    use crate::federation::client::MockActivityPubClient;
    use crate::federation::webfinger::MockWebFingerResolver;
    use crate::service::LocalActors;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    type Script = VecDeque<std::result::Result<Vec<CloudEvent>, BusError>>;

    /// One script per subscription; `NotFound` once they run out
    struct ScriptedQueue {
        scripts: Mutex<VecDeque<Script>>,
        subscriptions: Arc<Mutex<u32>>,
        acks: Arc<Mutex<Vec<u32>>>,
    }

    struct ScriptedSubscription {
        batches: VecDeque<std::result::Result<Vec<CloudEvent>, BusError>>,
        acks: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl QueueClient for ScriptedQueue {
        async fn subscribe(
            &self,
            _cancel: &CancellationToken,
            _queue: &str,
            _subject: &str,
            _batch_size: u32,
        ) -> std::result::Result<Box<dyn QueueSubscription>, BusError> {
            *self.subscriptions.lock().unwrap() += 1;
            let batches = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(BusError::NotFound)?;
            Ok(Box::new(ScriptedSubscription {
                batches,
                acks: self.acks.clone(),
            }))
        }
    }

    #[async_trait]
    impl QueueSubscription for ScriptedSubscription {
        async fn next_batch(
            &mut self,
            _cancel: &CancellationToken,
        ) -> std::result::Result<Vec<CloudEvent>, BusError> {
            self.batches.pop_front().unwrap_or(Err(BusError::Eof))
        }

        async fn ack(
            &mut self,
            _cancel: &CancellationToken,
            count: u32,
        ) -> std::result::Result<(), BusError> {
            self.acks.lock().unwrap().push(count);
            Ok(())
        }
    }

    struct NoWriters;

    #[async_trait]
    impl WriterClient for NoWriters {
        async fn open_writer(
            &self,
            _cancel: &CancellationToken,
            _group_id: &str,
            _user_id: &str,
        ) -> std::result::Result<Arc<dyn EventWriter>, BusError> {
            Err(BusError::Unavailable("not used".to_string()))
        }
    }

    struct Harness {
        consumer: QueueConsumer,
        acks: Arc<Mutex<Vec<u32>>>,
        subscriptions: Arc<Mutex<u32>>,
        _temp_dir: TempDir,
    }

    async fn consumer(scripts: Vec<Script>, client: MockActivityPubClient) -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let uri = format!("sqlite:{}?mode=rwc", temp_dir.path().join("q.db").display());
        let db = Arc::new(Database::connect(&uri, "sources").await.unwrap());
        for actor in ["https://a.example/u/1", "https://b.example/u/2"] {
            db.add_follower(&Follower {
                actor_id: actor.to_string(),
                interest_id: "i1".to_string(),
                inbox: format!("{}/inbox", actor),
                created: Utc::now(),
            })
            .await
            .unwrap();
        }

        let actors = LocalActors::new("https://ap.example", "bridge", "PEM");
        let client: Arc<dyn crate::federation::client::ActivityPubClient> = Arc::new(client);
        let writers = WriterPool::new(
            Arc::new(NoWriters),
            4,
            Duration::from_secs(60),
            Duration::from_millis(10),
        );
        let service = FederationService::new(
            db.clone(),
            db,
            Arc::new(MockWebFingerResolver::new()),
            client.clone(),
            Arc::new(writers),
            actors.clone(),
        );
        let publisher = Arc::new(EventPublisher::new(client, actors));

        let acks = Arc::new(Mutex::new(Vec::new()));
        let subscriptions = Arc::new(Mutex::new(0));
        let queue = ScriptedQueue {
            scripts: Mutex::new(scripts.into()),
            subscriptions: subscriptions.clone(),
            acks: acks.clone(),
        };
        Harness {
            consumer: QueueConsumer::new(Arc::new(queue), service, publisher, "q", "s", 8),
            acks,
            subscriptions,
            _temp_dir: temp_dir,
        }
    }

    fn event(id: &str, interest: Option<&str>) -> CloudEvent {
        let mut event = CloudEvent::new(id, "https://src.example", "com.example.v1");
        if let Some(interest) = interest {
            event.set_attr(ATTR_INTEREST_ID, interest);
        }
        event
    }

    #[tokio::test]
    async fn delivers_to_every_follower_and_acks() {
        let mut client = MockActivityPubClient::new();
        client
            .expect_send_activity()
            .times(2)
            .returning(|_, _, _, _| Ok(()));
        let script = VecDeque::from(vec![Ok(vec![event("e1", Some("i1")), event("e2", None)])]);
        let h = consumer(vec![script], client).await;

        h.consumer.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(*h.acks.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn missing_queue_is_reported() {
        let h = consumer(Vec::new(), MockActivityPubClient::new()).await;
        let result = h.consumer.run(&CancellationToken::new()).await;
        assert!(matches!(result, Err(AppError::QueueMissing(q)) if q == "q"));
    }

    #[tokio::test]
    async fn stream_errors_are_internal() {
        let script = VecDeque::from(vec![Err(BusError::Transient("reset".to_string()))]);
        let h = consumer(vec![script], MockActivityPubClient::new()).await;
        let result = h.consumer.run(&CancellationToken::new()).await;
        assert!(matches!(result, Err(AppError::Internal(_))));
        assert!(h.acks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn supervisor_resubscribes_after_eof_and_errors() {
        let mut client = MockActivityPubClient::new();
        client
            .expect_send_activity()
            .times(4)
            .returning(|_, _, _, _| Ok(()));
        let scripts = vec![
            // Clean end of stream
            VecDeque::from(vec![Ok(vec![event("e1", Some("i1"))])]),
            // Broken stream
            VecDeque::from(vec![Err(BusError::Transient("reset".to_string()))]),
            VecDeque::from(vec![Ok(vec![event("e2", Some("i1"))])]),
        ];
        let h = Arc::new(consumer(scripts, client).await);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let h = h.clone();
            let cancel = cancel.clone();
            async move {
                h.consumer
                    .supervise(&cancel, Duration::from_millis(10))
                    .await
            }
        });

        // The three scripts, then resubscription attempts against a missing queue
        for _ in 0..100 {
            if *h.subscriptions.lock().unwrap() >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(*h.subscriptions.lock().unwrap() >= 4);
        assert_eq!(*h.acks.lock().unwrap(), vec![1, 1]);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("supervisor stops on cancel")
            .unwrap();
    }

    #[tokio::test]
    async fn supervisor_exits_when_cancelled_up_front() {
        let h = consumer(Vec::new(), MockActivityPubClient::new()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(
            Duration::from_secs(1),
            h.consumer.supervise(&cancel, Duration::from_secs(30)),
        )
        .await
        .expect("no resubscription after cancel");
    }
}
