//! ActivityStreams wire model
//!
//! Only the subset of the vocabulary Mastodon-compatible servers exchange.
//! Unknown fields are ignored on input. Outgoing documents are built with
//! `serde_json::json!` in [`builder`] and pass through [`fix_context`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";
pub const PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Activity types the bridge understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityType {
    Follow,
    Accept,
    Reject,
    Create,
    Update,
    Delete,
    Undo,
    Announce,
}

impl ActivityType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Follow" => Some(Self::Follow),
            "Accept" => Some(Self::Accept),
            "Reject" => Some(Self::Reject),
            "Create" => Some(Self::Create),
            "Update" => Some(Self::Update),
            "Delete" => Some(Self::Delete),
            "Undo" => Some(Self::Undo),
            "Announce" => Some(Self::Announce),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Undo => "Undo",
            Self::Announce => "Announce",
        }
    }
}

/// Types whose documents get the extended `@context`
const ACTOR_TYPES: [&str; 5] = ["Person", "Service", "Application", "Group", "Organization"];

pub fn is_actor_type(kind: &str) -> bool {
    ACTOR_TYPES.contains(&kind)
}

/// Either a bare IRI or an embedded object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectRef {
    Link(String),
    Object(Box<Object>),
}

impl ObjectRef {
    pub fn id(&self) -> &str {
        match self {
            ObjectRef::Link(iri) => iri,
            ObjectRef::Object(obj) => &obj.id,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            ObjectRef::Link(_) => None,
            ObjectRef::Object(obj) => Some(obj),
        }
    }
}

/// An inbound activity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    #[serde(rename = "@context", default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(default, with = "lenient_addresses", skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    #[serde(default, with = "lenient_addresses", skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, with = "lenient_tags", skip_serializing_if = "Vec::is_empty")]
    pub tag: Vec<Tag>,
}

impl Activity {
    pub fn activity_type(&self) -> Option<ActivityType> {
        ActivityType::parse(&self.kind)
    }

    pub fn actor_id(&self) -> &str {
        self.actor.as_ref().map(ObjectRef::id).unwrap_or_default()
    }

    pub fn object_id(&self) -> &str {
        self.object.as_ref().map(ObjectRef::id).unwrap_or_default()
    }

    pub fn embedded_object(&self) -> Option<&Object> {
        self.object.as_ref().and_then(ObjectRef::as_object)
    }

    /// `Delete` of the actor by itself
    pub fn is_self_delete(&self) -> bool {
        self.kind == "Delete" && !self.actor_id().is_empty() && self.actor_id() == self.object_id()
    }

    /// `#nobot` on the activity or its embedded object
    pub fn has_nobot(&self) -> bool {
        has_nobot(&self.tag) || self.embedded_object().is_some_and(|o| has_nobot(&o.tag))
    }

    pub fn published_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.published.as_deref().and_then(parse_time)
    }

    /// False only when addressing is present and none of it is the Public collection.
    pub fn is_public(&self) -> bool {
        let mut addressed = self.to.iter().chain(self.cc.iter()).peekable();
        let obj = self.embedded_object();
        let mut obj_addressed = obj
            .into_iter()
            .flat_map(|o| o.to.iter().chain(o.cc.iter()))
            .peekable();
        if addressed.peek().is_none() && obj_addressed.peek().is_none() {
            return true;
        }
        addressed.chain(obj_addressed).any(|a| is_public_iri(a))
    }
}

fn is_public_iri(iri: &str) -> bool {
    iri == PUBLIC || iri == "as:Public" || iri == "Public"
}

pub(crate) fn parse_time(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&chrono::Utc))
}

/// Embedded object (Note, Article, Image, or a nested activity)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Object {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Value>,
    #[serde(default, with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub attachment: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Value>,
    #[serde(default, with = "lenient_places", skip_serializing_if = "Vec::is_empty")]
    pub location: Vec<Place>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensitive: Option<bool>,
    #[serde(default, with = "lenient_tags", skip_serializing_if = "Vec::is_empty")]
    pub tag: Vec<Tag>,
    #[serde(default, with = "lenient_addresses", skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    #[serde(default, with = "lenient_addresses", skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributed_to: Option<Value>,
}

impl Object {
    pub fn is_sensitive(&self) -> bool {
        self.sensitive.unwrap_or(false)
    }

    pub fn object_id(&self) -> &str {
        self.object.as_ref().map(ObjectRef::id).unwrap_or_default()
    }
}

/// A `location` entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Place {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

/// Hashtag, Mention or Emoji
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

pub fn has_nobot(tags: &[Tag]) -> bool {
    tags.iter().any(|t| {
        t.name
            .as_deref()
            .is_some_and(|n| n.trim().eq_ignore_ascii_case("#nobot"))
    })
}

/// Remote actor profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub inbox: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub following: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKey>,
    #[serde(default, with = "lenient_tags", skip_serializing_if = "Vec::is_empty")]
    pub tag: Vec<Tag>,
}

impl Actor {
    pub fn has_nobot(&self) -> bool {
        has_nobot(&self.tag)
    }

    /// Name shown to humans, falling back to the handle and then the IRI.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .or(self.preferred_username.as_deref())
            .unwrap_or(&self.id)
    }

    pub fn public_key_id(&self) -> Option<&str> {
        self.public_key.as_ref().map(|k| k.id.as_str())
    }

    pub fn public_key_pem(&self) -> Option<&str> {
        self.public_key.as_ref().map(|k| k.public_key_pem.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKey {
    pub id: String,
    #[serde(default)]
    pub owner: String,
    pub public_key_pem: String,
}

/// First link of a `url`/`attachment`/`image` value
pub fn first_link(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(first_link),
        Value::Object(map) => map
            .get("href")
            .or_else(|| map.get("url"))
            .and_then(first_link),
        _ => None,
    }
}

/// Context used by Mastodon-compatible servers for actor documents
pub fn actor_context() -> Value {
    serde_json::json!([
        AS_CONTEXT,
        SECURITY_CONTEXT,
        {
            "manuallyApprovesFollowers": "as:manuallyApprovesFollowers",
            "toot": "http://joinmastodon.org/ns#",
            "featured": { "@id": "toot:featured", "@type": "@id" },
            "featuredTags": { "@id": "toot:featuredTags", "@type": "@id" },
            "alsoKnownAs": { "@id": "as:alsoKnownAs", "@type": "@id" },
            "movedTo": { "@id": "as:movedTo", "@type": "@id" },
            "schema": "http://schema.org#",
            "PropertyValue": "schema:PropertyValue",
            "value": "schema:value",
            "discoverable": "toot:discoverable",
            "indexable": "toot:indexable",
            "suspended": "toot:suspended",
            "memorial": "toot:memorial",
            "focalPoint": { "@container": "@list", "@id": "toot:focalPoint" }
        }
    ])
}

/// Rewrite `@context` for actor documents, either top level or embedded
/// (e.g. `Update{Service}`). Every other key is left untouched.
pub fn fix_context(mut doc: Value) -> Value {
    let is_actor = |v: &Value| v.get("type").and_then(Value::as_str).is_some_and(is_actor_type);
    let needs_fix = is_actor(&doc) || doc.get("object").is_some_and(is_actor);
    if needs_fix {
        if let Some(map) = doc.as_object_mut() {
            map.insert("@context".to_string(), actor_context());
        }
    }
    doc
}

/// Deserialize a value that may be a single item or an array.
pub mod one_or_many {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
            None => Vec::new(),
            Some(OneOrMany::One(item)) => vec![item],
            Some(OneOrMany::Many(items)) => items,
        })
    }

    pub fn serialize<S, T>(items: &[T], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        items.serialize(serializer)
    }
}

/// Addressing entries: IRIs, or embedded objects reduced to their `id`.
/// Anything else is skipped.
mod lenient_addresses {
    use serde::{Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Vec<Value> = super::one_or_many::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .filter_map(|v| match v {
                Value::String(iri) => Some(iri),
                Value::Object(mut map) => match map.remove("id") {
                    Some(Value::String(iri)) => Some(iri),
                    _ => None,
                },
                _ => None,
            })
            .collect())
    }

    pub fn serialize<S>(addresses: &[String], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        addresses.serialize(serializer)
    }
}

/// Tags of unexpected shape are skipped instead of failing the document.
mod lenient_tags {
    use super::Tag;
    use serde::{Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Tag>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Vec<Value> = super::one_or_many::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    pub fn serialize<S>(tags: &[Tag], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        tags.serialize(serializer)
    }
}

mod lenient_places {
    use super::Place;
    use serde::{Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Place>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Vec<Value> = super::one_or_many::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    pub fn serialize<S>(places: &[Place], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        places.serialize(serializer)
    }
}

/// ActivityPub activity builders
pub mod builder {
    use serde_json::Value;

    use super::{AS_CONTEXT, PUBLIC};

    /// Build a Follow activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (follower)
    /// * `object` - Object URI (followee)
    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": AS_CONTEXT,
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Accept activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (accepter)
    /// * `object` - Original activity being accepted (usually a Follow)
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": AS_CONTEXT,
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Undo activity
    pub fn undo(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": AS_CONTEXT,
            "type": "Undo",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a public Create activity wrapping `object`, copied to `followers`
    pub fn create(id: &str, actor: &str, object: Value, followers: &str) -> Value {
        serde_json::json!({
            "@context": AS_CONTEXT,
            "type": "Create",
            "id": id,
            "actor": actor,
            "object": object,
            "to": [PUBLIC],
            "cc": [followers],
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Build an Update activity carrying a refreshed document
    pub fn update(id: &str, actor: &str, object: Value, followers: &str) -> Value {
        serde_json::json!({
            "@context": AS_CONTEXT,
            "type": "Update",
            "id": id,
            "actor": actor,
            "object": object,
            "to": [PUBLIC],
            "cc": [followers],
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Build a public Note
    pub fn note(
        id: &str,
        attributed_to: &str,
        content: &str,
        url: &str,
        published: &str,
        followers: &str,
        summary: Option<&str>,
    ) -> Value {
        let mut note = serde_json::json!({
            "type": "Note",
            "id": id,
            "attributedTo": attributed_to,
            "content": content,
            "url": url,
            "published": published,
            "to": [PUBLIC],
            "cc": [followers]
        });
        if let Some(summary) = summary {
            note["summary"] = Value::String(summary.to_string());
        }
        note
    }

    /// Build a local Service actor document
    ///
    /// # Arguments
    /// * `base` - Base URL of the actor, e.g. `https://host/actor/<id>`
    /// * `host_base` - Base URL of the bridge
    /// * `username` - preferredUsername
    /// * `name` / `summary` - Display fields
    /// * `public_key_pem` - Shared public key
    #[allow(clippy::too_many_arguments)]
    pub fn service_actor(
        base: &str,
        inbox: &str,
        followers: &str,
        host_base: &str,
        username: &str,
        name: &str,
        summary: &str,
        public_key_pem: &str,
    ) -> Value {
        serde_json::json!({
            "@context": AS_CONTEXT,
            "type": "Service",
            "id": base,
            "preferredUsername": username,
            "name": name,
            "summary": summary,
            "url": base,
            "inbox": inbox,
            "outbox": format!("{}/outbox", host_base),
            "followers": followers,
            "following": format!("{}/following", host_base),
            "manuallyApprovesFollowers": false,
            "discoverable": true,
            "indexable": false,
            "endpoints": {
                "sharedInbox": format!("{}/inbox", host_base)
            },
            "publicKey": {
                "id": format!("{}#main-key", base),
                "owner": base,
                "publicKeyPem": public_key_pem
            },
            "tag": []
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mastodon_create() {
        let raw = serde_json::json!({
            "@context": AS_CONTEXT,
            "id": "https://host.social/users/john/statuses/1/activity",
            "type": "Create",
            "actor": "https://host.social/users/john",
            "published": "2024-05-01T10:00:00Z",
            "to": PUBLIC,
            "cc": ["https://host.social/users/john/followers"],
            "object": {
                "id": "https://host.social/users/john/statuses/1",
                "type": "Note",
                "content": "<p>hello</p>",
                "sensitive": false,
                "attachment": { "type": "Document", "url": "https://host.social/a.png" },
                "location": { "type": "Place", "latitude": 1.5, "longitude": -2.0 },
                "tag": [
                    { "type": "Hashtag", "name": "#rust", "href": "https://host.social/tags/rust" },
                    "unexpected"
                ]
            }
        });

        let activity: Activity = serde_json::from_value(raw).unwrap();
        assert_eq!(activity.activity_type(), Some(ActivityType::Create));
        assert_eq!(activity.actor_id(), "https://host.social/users/john");
        assert_eq!(activity.to, vec![PUBLIC.to_string()]);
        assert!(activity.is_public());
        assert!(!activity.has_nobot());

        let object = activity.embedded_object().unwrap();
        assert_eq!(object.kind, "Note");
        assert_eq!(object.location[0].latitude, Some(1.5));
        assert_eq!(object.tag.len(), 1);
        assert_eq!(
            first_link(&object.attachment[0]).as_deref(),
            Some("https://host.social/a.png")
        );
        assert!(activity.published_at().is_some());
    }

    #[test]
    fn detects_self_delete() {
        let activity: Activity = serde_json::from_value(serde_json::json!({
            "type": "Delete",
            "actor": "https://host.social/users/john",
            "object": "https://host.social/users/john"
        }))
        .unwrap();
        assert!(activity.is_self_delete());
    }

    #[test]
    fn detects_nobot_on_object() {
        let activity: Activity = serde_json::from_value(serde_json::json!({
            "type": "Create",
            "actor": "https://host.social/users/john",
            "object": {
                "type": "Note",
                "tag": { "type": "Hashtag", "name": "#NoBot" }
            }
        }))
        .unwrap();
        assert!(activity.has_nobot());
    }

    #[test]
    fn non_public_addressing() {
        let activity: Activity = serde_json::from_value(serde_json::json!({
            "type": "Create",
            "actor": "https://host.social/users/john",
            "to": ["https://host.social/users/john/followers"],
            "object": { "type": "Note", "to": ["https://host.social/users/john/followers"] }
        }))
        .unwrap();
        assert!(!activity.is_public());
    }

    #[test]
    fn embedded_addressing_entries_are_tolerated() {
        let activity: Activity = serde_json::from_value(serde_json::json!({
            "type": "Create",
            "actor": "https://host.social/users/john",
            "to": [
                { "type": "Collection", "id": "https://www.w3.org/ns/activitystreams#Public" },
                { "type": "Link" },
                42
            ],
            "cc": { "id": "https://host.social/users/john/followers" },
            "object": { "type": "Note", "to": [{ "name": "no id" }] }
        }))
        .unwrap();
        assert_eq!(activity.to, vec!["https://www.w3.org/ns/activitystreams#Public"]);
        assert_eq!(activity.cc, vec!["https://host.social/users/john/followers"]);
        assert!(activity.embedded_object().unwrap().to.is_empty());
        assert!(activity.is_public());
    }

    #[test]
    fn fix_context_is_idempotent() {
        let actor = builder::service_actor(
            "https://bridge.example/actor",
            "https://bridge.example/inbox",
            "https://bridge.example/followers/x",
            "https://bridge.example",
            "bridge",
            "Bridge",
            "",
            "PEM",
        );
        let once = fix_context(actor);
        let twice = fix_context(once.clone());
        assert_eq!(
            serde_json::to_vec(&once).unwrap(),
            serde_json::to_vec(&twice).unwrap()
        );
        assert_eq!(once["@context"][0], AS_CONTEXT);
        assert_eq!(once["preferredUsername"], "bridge");
    }

    #[test]
    fn fix_context_covers_embedded_actor_and_skips_notes() {
        let update = builder::update(
            "https://bridge.example/activities/1",
            "https://bridge.example/actor/x",
            serde_json::json!({ "type": "Service", "id": "https://bridge.example/actor/x" }),
            "https://bridge.example/followers/x",
        );
        assert!(fix_context(update)["@context"].is_array());

        let follow = builder::follow("id", "a", "b");
        assert_eq!(fix_context(follow.clone()), follow);
    }
}
