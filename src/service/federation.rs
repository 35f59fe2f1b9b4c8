//! Federation service
//!
//! Owns the lifecycle of followed sources and of followers of the local
//! interest actors:
//!
//! - outbound Follow / Undo{Follow} on behalf of internal users
//! - dispatch of verified inbound activities
//! - forwarding of converted events to the writer pool

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::actors::LocalActors;
use crate::data::{Filter, Follower, FollowerStorage, Order, Source, SourceStorage};
use crate::error::{AppError, Result};
use crate::event::{WriterPool, activity_to_event};
use crate::federation::client::ActivityPubClient;
use crate::federation::vocab::{Activity, ActivityType, Actor, Object, builder, is_actor_type};
use crate::federation::webfinger::{WebFingerResolver, parse_acct};
use crate::metrics::{ACTIVITYPUB_ACTIVITIES_RECEIVED, FOLLOWERS_TOTAL, SOURCES_TOTAL};

/// Work left over after an inbound activity was accepted.
///
/// The inbox runs it in the background once the response is written.
pub type PostAction = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Federation service
#[derive(Clone)]
pub struct FederationService {
    sources: Arc<dyn SourceStorage>,
    followers: Arc<dyn FollowerStorage>,
    webfinger: Arc<dyn WebFingerResolver>,
    client: Arc<dyn ActivityPubClient>,
    writers: Arc<WriterPool>,
    actors: LocalActors,
}

impl FederationService {
    /// Create new federation service
    pub fn new(
        sources: Arc<dyn SourceStorage>,
        followers: Arc<dyn FollowerStorage>,
        webfinger: Arc<dyn WebFingerResolver>,
        client: Arc<dyn ActivityPubClient>,
        writers: Arc<WriterPool>,
        actors: LocalActors,
    ) -> Self {
        Self {
            sources,
            followers,
            webfinger,
            client,
            writers,
            actors,
        }
    }

    pub fn actors(&self) -> &LocalActors {
        &self.actors
    }

    pub fn client(&self) -> &Arc<dyn ActivityPubClient> {
        &self.client
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Follow a remote actor on behalf of `(group_id, user_id)`
    ///
    /// # Arguments
    /// * `addr` - Actor IRI or `user@host`
    /// * `sub_id` - Originating interest; the Follow is sent from its actor
    /// * `term` - Search term that led to the actor
    ///
    /// # Returns
    /// The followed actor IRI
    ///
    /// # Side Effects
    /// - Stores a pending source
    /// - Sends a signed Follow; the source is removed again if that fails
    pub async fn request_follow(
        &self,
        cancel: &CancellationToken,
        addr: &str,
        group_id: &str,
        user_id: &str,
        sub_id: &str,
        term: &str,
    ) -> Result<String> {
        let actor_iri = self.resolve_addr(cancel, addr).await?;
        let local_id = self.actors.local_id(sub_id);
        let key_id = self.actors.key_id(local_id);

        let actor = self.client.fetch_actor(cancel, &actor_iri, &key_id).await?;
        if actor.has_nobot() {
            tracing::info!(actor = %actor_iri, "Actor opted out with #nobot");
            return Err(AppError::NoBot);
        }
        if actor.inbox.is_empty() {
            return Err(AppError::Invalid(format!("actor {} has no inbox", actor_iri)));
        }

        let mut source = Source::pending(&actor_iri, group_id, user_id);
        source.kind = actor.kind.clone();
        source.name = actor.display_name().to_string();
        source.summary = actor.summary.clone().unwrap_or_default();
        source.sub_id = sub_id.to_string();
        source.term = term.to_string();
        self.sources.create(&source).await?;

        let actor_url = self.actors.actor_url(local_id);
        let follow = builder::follow(
            &format!("{}/follows/{}", actor_url, ulid::Ulid::new()),
            &actor_url,
            &actor_iri,
        );
        if let Err(e) = self
            .client
            .send_activity(cancel, &follow, &actor.inbox, &key_id)
            .await
        {
            tracing::warn!(actor = %actor_iri, error = %e, "Follow delivery failed, rolling back");
            if let Err(rollback) = self.sources.delete(&actor_iri, group_id, user_id).await {
                tracing::error!(actor = %actor_iri, error = %rollback, "Source rollback failed");
            }
            return Err(e);
        }

        self.refresh_gauges().await;
        tracing::info!(
            actor = %actor_iri,
            group_id = %group_id,
            user_id = %user_id,
            "Follow requested"
        );
        Ok(actor_iri)
    }

    async fn resolve_addr(&self, cancel: &CancellationToken, addr: &str) -> Result<String> {
        let addr = addr.trim();
        if addr.starts_with("https://") || addr.starts_with("http://") {
            let url = url::Url::parse(addr)
                .map_err(|e| AppError::Invalid(format!("invalid actor address {}: {}", addr, e)))?;
            if url.host_str().is_none() {
                return Err(AppError::Invalid(format!("invalid actor address {}", addr)));
            }
            return Ok(addr.to_string());
        }
        let (name, host) = parse_acct(addr)
            .ok_or_else(|| AppError::Invalid(format!("invalid actor address {}", addr)))?;
        self.webfinger.resolve(cancel, host, name).await
    }

    /// Stop following a remote actor
    ///
    /// The source is deleted once the Undo{Follow} is delivered, or right
    /// away when the remote actor is gone.
    ///
    /// # Errors
    /// * `AppError::NotFound` - no such source
    /// * `AppError::Forbidden` - the source belongs to someone else
    pub async fn unfollow(
        &self,
        cancel: &CancellationToken,
        actor_iri: &str,
        group_id: &str,
        user_id: &str,
    ) -> Result<()> {
        let source = self.sources.read(actor_iri).await?;
        if !source.is_owned_by(group_id, user_id) {
            return Err(AppError::Forbidden);
        }

        let local_id = self.actors.local_id(&source.sub_id);
        let key_id = self.actors.key_id(local_id);
        let actor_url = self.actors.actor_url(local_id);

        let sent = async {
            let actor = self.client.fetch_actor(cancel, actor_iri, &key_id).await?;
            let follow = builder::follow(
                &format!("{}/follows/{}", actor_url, ulid::Ulid::new()),
                &actor_url,
                actor_iri,
            );
            let undo = builder::undo(
                &format!("{}/undo/{}", actor_url, ulid::Ulid::new()),
                &actor_url,
                follow,
            );
            self.client
                .send_activity(cancel, &undo, &actor.inbox, &key_id)
                .await
        }
        .await;

        match sent {
            Ok(()) => {}
            Err(AppError::ActorGone) => {
                tracing::info!(actor = %actor_iri, "Actor is gone, dropping source");
            }
            Err(e) => return Err(e),
        }

        self.sources.delete(actor_iri, group_id, user_id).await?;
        self.refresh_gauges().await;
        tracing::info!(actor = %actor_iri, group_id = %group_id, user_id = %user_id, "Unfollowed");
        Ok(())
    }

    /// Source owned by `(group_id, user_id)`; other owners see `NotFound`
    pub async fn read(&self, actor_iri: &str, group_id: &str, user_id: &str) -> Result<Source> {
        let source = self.sources.read(actor_iri).await?;
        if !source.is_owned_by(group_id, user_id) {
            return Err(AppError::NotFound);
        }
        Ok(source)
    }

    /// Actor IRIs followed by `(group_id, user_id)`
    pub async fn list(
        &self,
        group_id: &str,
        user_id: &str,
        pattern: Option<String>,
        limit: u32,
        cursor: &str,
        order: Order,
    ) -> Result<Vec<String>> {
        let filter = Filter {
            pattern,
            ..Filter::owner(group_id, user_id)
        };
        self.sources.list(&filter, limit, cursor, order).await
    }

    /// Every followed actor, whoever the owner
    pub async fn following_page(&self, limit: u32, cursor: &str) -> Result<Vec<String>> {
        self.sources
            .list(&Filter::default(), limit, cursor, Order::Asc)
            .await
    }

    pub async fn count_sources(&self) -> Result<i64> {
        self.sources.count().await
    }

    pub async fn followers_page(
        &self,
        interest_id: &str,
        limit: u32,
        cursor: &str,
    ) -> Result<Vec<Follower>> {
        let local_id = self.actors.local_id(interest_id);
        self.followers.list_followers(local_id, limit, cursor).await
    }

    pub async fn count_followers(&self, interest_id: &str) -> Result<i64> {
        self.followers
            .count_followers(self.actors.local_id(interest_id))
            .await
    }

    pub async fn count_all_followers(&self) -> Result<i64> {
        self.followers.count_all_followers().await
    }

    /// Sync the source and follower gauges with storage
    pub async fn refresh_gauges(&self) {
        match self.sources.count().await {
            Ok(count) => SOURCES_TOTAL.set(count),
            Err(e) => tracing::warn!(error = %e, "Failed to count sources"),
        }
        match self.followers.count_all_followers().await {
            Ok(count) => FOLLOWERS_TOTAL.set(count),
            Err(e) => tracing::warn!(error = %e, "Failed to count followers"),
        }
    }

    /// Close every open bus writer
    pub async fn close(&self) {
        self.writers.close().await;
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Apply a verified inbound activity
    ///
    /// # Arguments
    /// * `cancel` - Token the returned post-action keeps using
    /// * `actor` - Sender, already fetched and signature-checked
    /// * `interest_id` - Interest of `/inbox/<id>`, empty for the shared inbox
    ///
    /// # Returns
    /// Optional work to run after the inbox replied
    pub async fn handle_activity(
        &self,
        cancel: &CancellationToken,
        actor: &Actor,
        activity: &Activity,
        interest_id: &str,
    ) -> Result<Option<PostAction>> {
        ACTIVITYPUB_ACTIVITIES_RECEIVED
            .with_label_values(&[activity.kind.as_str()])
            .inc();

        let Some(kind) = activity.activity_type() else {
            tracing::debug!(kind = %activity.kind, "Ignoring unsupported activity");
            return Ok(None);
        };

        match kind {
            ActivityType::Follow => self.accept_follower(cancel, actor, activity, interest_id).await,
            ActivityType::Accept => self.set_follow_outcome(actor, true).await,
            ActivityType::Reject => self.set_follow_outcome(actor, false).await,
            ActivityType::Undo => self.undo(actor, activity, interest_id).await,
            ActivityType::Delete => self.delete(actor, activity).await,
            ActivityType::Create | ActivityType::Announce | ActivityType::Update => {
                self.forward(cancel, actor, activity).await
            }
        }
    }

    /// Source of the sending actor, `None` when we do not follow it
    async fn followed(&self, actor_id: &str) -> Result<Option<Source>> {
        match self.sources.read(actor_id).await {
            Ok(source) => Ok(Some(source)),
            Err(AppError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn accept_follower(
        &self,
        cancel: &CancellationToken,
        actor: &Actor,
        activity: &Activity,
        interest_id: &str,
    ) -> Result<Option<PostAction>> {
        let target = activity.object_id();
        let local_id = match self.actors.id_of(target) {
            Some(id) => id,
            None if !interest_id.is_empty() => interest_id.to_string(),
            None => {
                return Err(AppError::Invalid(format!(
                    "follow target {} is not a local actor",
                    target
                )));
            }
        };
        if actor.inbox.is_empty() {
            return Err(AppError::Invalid(format!("actor {} has no inbox", actor.id)));
        }

        let follower = Follower {
            actor_id: actor.id.clone(),
            interest_id: local_id.clone(),
            inbox: actor.inbox.clone(),
            created: Utc::now(),
        };
        self.followers.add_follower(&follower).await?;
        self.refresh_gauges().await;
        tracing::info!(follower = %actor.id, interest_id = %local_id, "New follower");

        let actor_url = self.actors.actor_url(&local_id);
        let key_id = self.actors.key_id(&local_id);
        let follow = serde_json::to_value(activity)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("serialize follow: {}", e)))?;
        let accept = builder::accept(
            &format!("{}/accepts/{}", actor_url, ulid::Ulid::new()),
            &actor_url,
            follow,
        );
        let client = self.client.clone();
        let inbox = actor.inbox.clone();
        let cancel = cancel.clone();

        Ok(Some(Box::pin(async move {
            if let Err(e) = client.send_activity(&cancel, &accept, &inbox, &key_id).await {
                tracing::warn!(inbox = %inbox, error = %e, "Failed to deliver Accept");
            }
        })))
    }

    async fn set_follow_outcome(&self, actor: &Actor, accepted: bool) -> Result<Option<PostAction>> {
        match self.sources.set_follow_outcome(&actor.id, accepted).await {
            Ok(()) => {
                tracing::info!(actor = %actor.id, accepted, "Follow answered");
                Ok(None)
            }
            Err(AppError::NotFound) => {
                tracing::debug!(actor = %actor.id, "Follow outcome for unknown source");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn undo(
        &self,
        actor: &Actor,
        activity: &Activity,
        interest_id: &str,
    ) -> Result<Option<PostAction>> {
        let undone = activity.embedded_object();
        match undone.map(|o| o.kind.as_str()) {
            Some("Follow") | None => {
                let target = undone.map(Object::object_id).unwrap_or_default();
                let local_id = self
                    .actors
                    .id_of(target)
                    .unwrap_or_else(|| self.actors.local_id(interest_id).to_string());
                match self.followers.remove_follower(&actor.id, &local_id).await {
                    Ok(()) => {
                        self.refresh_gauges().await;
                        tracing::info!(follower = %actor.id, interest_id = %local_id, "Follower left");
                    }
                    Err(AppError::NotFound) => {}
                    Err(e) => return Err(e),
                }
                Ok(None)
            }
            Some("Announce") | Some("Like") => Ok(None),
            Some(_) => self.drop_source(&actor.id).await,
        }
    }

    async fn delete(&self, actor: &Actor, activity: &Activity) -> Result<Option<PostAction>> {
        let target = activity.object_id();
        if target.is_empty() {
            return Ok(None);
        }
        if !same_origin(&actor.id, target) {
            tracing::info!(actor = %actor.id, target = %target, "Ignoring cross-origin Delete");
            return Ok(None);
        }
        tracing::debug!(actor = %actor.id, target = %target, "Delete received");
        self.drop_source(target).await
    }

    async fn drop_source(&self, actor_id: &str) -> Result<Option<PostAction>> {
        let Some(source) = self.followed(actor_id).await? else {
            return Ok(None);
        };
        match self
            .sources
            .delete(&source.actor_id, &source.group_id, &source.user_id)
            .await
        {
            Ok(()) | Err(AppError::NotFound) => {}
            Err(e) => return Err(e),
        }
        self.refresh_gauges().await;
        tracing::info!(actor = %actor_id, "Source removed by remote");
        Ok(None)
    }

    async fn forward(
        &self,
        cancel: &CancellationToken,
        actor: &Actor,
        activity: &Activity,
    ) -> Result<Option<PostAction>> {
        let actor_id = match activity.actor_id() {
            "" => actor.id.as_str(),
            id => id,
        };
        let Some(source) = self.followed(actor_id).await? else {
            tracing::debug!(actor = %actor_id, "Activity from an actor nobody follows");
            return Ok(None);
        };

        if activity.kind == ActivityType::Update.as_str() {
            if let Some(profile) = activity
                .embedded_object()
                .filter(|o| is_actor_type(&o.kind) && o.id == source.actor_id)
            {
                self.sources
                    .set_profile(
                        &source.actor_id,
                        &profile.kind,
                        profile.name.as_deref().unwrap_or_default(),
                        profile.summary.as_deref().unwrap_or_default(),
                    )
                    .await?;
                tracing::info!(actor = %actor_id, "Source profile refreshed");
                return Ok(None);
            }
        }

        let Some(event) = activity_to_event(actor, activity)? else {
            return Ok(None);
        };

        let writers = self.writers.clone();
        let sources = self.sources.clone();
        let cancel = cancel.clone();
        Ok(Some(Box::pin(async move {
            let result = writers
                .write(&cancel, &event, &source.group_id, &source.user_id)
                .await;
            let (last, err) = match &result {
                Ok(()) => (Utc::now(), String::new()),
                Err(e) => {
                    tracing::warn!(
                        actor = %source.actor_id,
                        event_id = %event.id,
                        error = %e,
                        "Failed to forward activity"
                    );
                    (source.last.unwrap_or(source.created), e.to_string())
                }
            };
            if let Err(e) = sources.set_last(&source.actor_id, last, &err).await {
                tracing::warn!(actor = %source.actor_id, error = %e, "Failed to record last activity");
            }
        })))
    }
}

/// Same scheme, host and port
fn same_origin(a: &str, b: &str) -> bool {
    match (url::Url::parse(a), url::Url::parse(b)) {
        (Ok(a), Ok(b)) => a.origin() == b.origin(),
        _ => false,
    }
}
