//! Data models
//!
//! Rust structs representing database entities and cache items.
//! Timestamps use chrono and are stored as RFC 3339 text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Source
// =============================================================================

/// A remote actor followed on behalf of a tenant
///
/// `actor_id` is unique. `(group_id, user_id)` owns the record and is the
/// only principal allowed to update or delete it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub actor_id: String,
    pub group_id: String,
    pub user_id: String,
    /// Actor type (Person, Service, ...)
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub summary: String,
    /// Remote accepted our Follow
    pub accepted: bool,
    /// Remote rejected our Follow
    pub rejected: bool,
    pub created: DateTime<Utc>,
    /// Last successfully forwarded activity
    pub last: Option<DateTime<Utc>>,
    /// Originating interest id
    pub sub_id: String,
    /// Originating search term
    pub term: String,
    /// Last error
    pub err: String,
}

impl Source {
    /// Pending source for a freshly followed actor
    pub fn pending(actor_id: &str, group_id: &str, user_id: &str) -> Self {
        Self {
            actor_id: actor_id.to_string(),
            group_id: group_id.to_string(),
            user_id: user_id.to_string(),
            kind: String::new(),
            name: String::new(),
            summary: String::new(),
            accepted: false,
            rejected: false,
            created: Utc::now(),
            last: None,
            sub_id: String::new(),
            term: String::new(),
            err: String::new(),
        }
    }

    pub fn is_owned_by(&self, group_id: &str, user_id: &str) -> bool {
        self.group_id == group_id && self.user_id == user_id
    }

    pub fn state(&self) -> SourceState {
        if self.accepted {
            SourceState::Accepted
        } else if self.rejected {
            SourceState::Rejected
        } else {
            SourceState::Pending
        }
    }
}

/// Follow state of a Source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SourceState {
    Pending,
    Accepted,
    Rejected,
}

/// List filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub group_id: Option<String>,
    pub user_id: Option<String>,
    /// Substring of `name` or `summary`
    pub pattern: Option<String>,
}

impl Filter {
    pub fn owner(group_id: &str, user_id: &str) -> Self {
        Self {
            group_id: Some(group_id.to_string()),
            user_id: Some(user_id.to_string()),
            pattern: None,
        }
    }
}

/// Sort direction by `actor_id`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

// =============================================================================
// Follower
// =============================================================================

/// A remote actor following one of the interest actors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Follower {
    pub actor_id: String,
    pub interest_id: String,
    pub inbox: String,
    pub created: DateTime<Utc>,
}
