//! Local actors
//!
//! The bridge exposes one shared `Service` actor at `/actor` and one
//! `Service` actor per internal interest at `/actor/<interestId>`. All of
//! them share a single key pair.

use serde_json::Value;

use crate::federation::vocab::builder;

/// URL scheme of the bridge's local actors
#[derive(Debug, Clone)]
pub struct LocalActors {
    base_url: String,
    name: String,
    public_key_pem: String,
}

impl LocalActors {
    /// # Arguments
    /// * `base_url` - `https://<host>`
    /// * `name` - preferredUsername of the shared actor
    /// * `public_key_pem` - Public key published by every local actor
    pub fn new(base_url: &str, name: &str, public_key_pem: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            name: name.to_string(),
            public_key_pem: public_key_pem.to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Name of the shared actor, also used as its follower key
    pub fn shared_name(&self) -> &str {
        &self.name
    }

    /// Host part of the base URL
    pub fn host(&self) -> &str {
        self.base_url
            .split_once("://")
            .map(|(_, host)| host)
            .unwrap_or(&self.base_url)
    }

    fn is_shared(&self, id: &str) -> bool {
        id.is_empty() || id == self.name
    }

    /// Local actor id for an optional interest: the shared actor when absent
    pub fn local_id<'a>(&'a self, interest_id: &'a str) -> &'a str {
        if self.is_shared(interest_id) {
            &self.name
        } else {
            interest_id
        }
    }

    pub fn actor_url(&self, id: &str) -> String {
        if self.is_shared(id) {
            format!("{}/actor", self.base_url)
        } else {
            format!("{}/actor/{}", self.base_url, urlencoding::encode(id))
        }
    }

    pub fn key_id(&self, id: &str) -> String {
        format!("{}#main-key", self.actor_url(id))
    }

    pub fn inbox_url(&self, id: &str) -> String {
        if self.is_shared(id) {
            format!("{}/inbox", self.base_url)
        } else {
            format!("{}/inbox/{}", self.base_url, urlencoding::encode(id))
        }
    }

    pub fn followers_url(&self, id: &str) -> String {
        format!(
            "{}/followers/{}",
            self.base_url,
            urlencoding::encode(self.local_id(id))
        )
    }

    /// Local actor id addressed by `iri`, if it is one of ours
    pub fn id_of(&self, iri: &str) -> Option<String> {
        let iri = iri.split('#').next().unwrap_or_default();
        let rest = iri.strip_prefix(&self.base_url)?.strip_prefix("/actor")?;
        match rest {
            "" | "/" => Some(self.name.clone()),
            _ => {
                let id = rest.strip_prefix('/')?;
                if id.is_empty() || id.contains('/') {
                    return None;
                }
                urlencoding::decode(id).ok().map(|id| id.into_owned())
            }
        }
    }

    /// Actor document of a local actor
    pub fn document(&self, id: &str) -> Value {
        let id = self.local_id(id);
        let (name, summary) = if self.is_shared(id) {
            (
                self.name.clone(),
                format!(
                    "Bridge between the fediverse and {}. Follows public actors on behalf of its users.",
                    self.host()
                ),
            )
        } else {
            (
                id.to_string(),
                format!("Public posts matching the interest {}.", id),
            )
        };
        builder::service_actor(
            &self.actor_url(id),
            &self.inbox_url(id),
            &self.followers_url(id),
            &self.base_url,
            id,
            &name,
            &summary,
            &self.public_key_pem,
        )
    }
}
