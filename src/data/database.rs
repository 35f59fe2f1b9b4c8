//! SQLite database operations
//!
//! All persistent state goes through this module: the followed sources and
//! the followers of the interest actors. Tables are created on connect; the
//! source table name is configurable and must be a plain identifier.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, QueryBuilder, Sqlite};

use super::models::*;
use crate::error::AppError;
use crate::metrics::DB_QUERIES_TOTAL;

/// Storage contract for followed sources
#[async_trait]
pub trait SourceStorage: Send + Sync {
    /// Insert a new source. `Conflict` when `actor_id` exists.
    async fn create(&self, source: &Source) -> Result<(), AppError>;

    /// `NotFound` when missing.
    async fn read(&self, actor_id: &str) -> Result<Source, AppError>;

    /// Upsert by `actor_id`; an existing row is only replaced when the
    /// owner matches, otherwise `NotFound`.
    async fn update(&self, source: &Source) -> Result<(), AppError>;

    /// Record the outcome of the latest forwarded activity. Never inserts.
    async fn set_last(
        &self,
        actor_id: &str,
        last: DateTime<Utc>,
        err: &str,
    ) -> Result<(), AppError>;

    /// Record the remote answer to our Follow. Never inserts.
    async fn set_follow_outcome(&self, actor_id: &str, accepted: bool) -> Result<(), AppError>;

    /// Refresh the profile columns from an actor Update. Never inserts.
    async fn set_profile(
        &self,
        actor_id: &str,
        kind: &str,
        name: &str,
        summary: &str,
    ) -> Result<(), AppError>;

    /// `NotFound` unless all three match.
    async fn delete(&self, actor_id: &str, group_id: &str, user_id: &str) -> Result<(), AppError>;

    /// Up to `limit` actor ids strictly after `cursor` in `order`.
    async fn list(
        &self,
        filter: &Filter,
        limit: u32,
        cursor: &str,
        order: Order,
    ) -> Result<Vec<String>, AppError>;

    async fn count(&self) -> Result<i64, AppError>;

    async fn count_by_owner(&self, group_id: &str, user_id: &str) -> Result<i64, AppError>;
}

/// Storage contract for followers of interest actors
#[async_trait]
pub trait FollowerStorage: Send + Sync {
    /// Idempotent; a repeated follow refreshes the inbox.
    async fn add_follower(&self, follower: &Follower) -> Result<(), AppError>;

    /// `NotFound` when missing.
    async fn remove_follower(&self, actor_id: &str, interest_id: &str) -> Result<(), AppError>;

    /// Followers of `interest_id` ordered by actor id, strictly after `cursor`.
    async fn list_followers(
        &self,
        interest_id: &str,
        limit: u32,
        cursor: &str,
    ) -> Result<Vec<Follower>, AppError>;

    async fn count_followers(&self, interest_id: &str) -> Result<i64, AppError>;

    async fn count_all_followers(&self) -> Result<i64, AppError>;
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
    sources: String,
    followers: String,
}

fn record_query(operation: &str, table: &str) {
    DB_QUERIES_TOTAL
        .with_label_values(&[operation, table])
        .inc();
}

fn map_insert_error(error: sqlx::Error) -> AppError {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => AppError::Conflict,
        _ => AppError::Database(error),
    }
}

/// Escape `%`, `_` and `\` for a LIKE pattern with `ESCAPE '\'`.
fn like_pattern(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len() + 2);
    escaped.push('%');
    for c in pattern.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

impl Database {
    /// Connect to database and create tables
    ///
    /// # Arguments
    /// * `uri` - SQLite URI, e.g. `sqlite://int-activitypub.db?mode=rwc`
    /// * `table` - Source table name
    ///
    /// # Errors
    /// Returns error if the table name is invalid or connection fails
    pub async fn connect(uri: &str, table: &str) -> Result<Self, AppError> {
        if !crate::config::is_identifier(table) {
            return Err(AppError::Config(format!(
                "invalid table name: {:?}",
                table
            )));
        }

        // Every in-memory connection is a separate database.
        let max_connections = if uri.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(uri)
            .await?;

        let db = Self {
            pool,
            sources: table.to_string(),
            followers: format!("{}_followers", table),
        };
        db.create_tables().await?;

        tracing::info!(table = %db.sources, "Database connected");
        Ok(db)
    }

    async fn create_tables(&self) -> Result<(), AppError> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {t} (
                actor_id TEXT PRIMARY KEY NOT NULL,
                group_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT '',
                name TEXT NOT NULL DEFAULT '',
                summary TEXT NOT NULL DEFAULT '',
                accepted INTEGER NOT NULL DEFAULT 0,
                rejected INTEGER NOT NULL DEFAULT 0,
                created TEXT NOT NULL,
                last TEXT,
                sub_id TEXT NOT NULL DEFAULT '',
                term TEXT NOT NULL DEFAULT '',
                err TEXT NOT NULL DEFAULT ''
            )
            "#,
            t = self.sources
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {t}_owner ON {t} (group_id, user_id)",
            t = self.sources
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {t} (
                actor_id TEXT NOT NULL,
                interest_id TEXT NOT NULL,
                inbox TEXT NOT NULL,
                created TEXT NOT NULL,
                PRIMARY KEY (actor_id, interest_id)
            )
            "#,
            t = self.followers
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Close the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl SourceStorage for Database {
    async fn create(&self, source: &Source) -> Result<(), AppError> {
        record_query("insert", "sources");
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (actor_id, group_id, user_id, kind, name, summary,
                accepted, rejected, created, last, sub_id, term, err)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            self.sources
        ))
        .bind(&source.actor_id)
        .bind(&source.group_id)
        .bind(&source.user_id)
        .bind(&source.kind)
        .bind(&source.name)
        .bind(&source.summary)
        .bind(source.accepted)
        .bind(source.rejected)
        .bind(source.created)
        .bind(source.last)
        .bind(&source.sub_id)
        .bind(&source.term)
        .bind(&source.err)
        .execute(&self.pool)
        .await
        .map_err(map_insert_error)?;

        Ok(())
    }

    async fn read(&self, actor_id: &str) -> Result<Source, AppError> {
        record_query("select", "sources");
        sqlx::query_as::<_, Source>(&format!(
            "SELECT * FROM {} WHERE actor_id = ?",
            self.sources
        ))
        .bind(actor_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound)
    }

    async fn update(&self, source: &Source) -> Result<(), AppError> {
        record_query("upsert", "sources");
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {t} (actor_id, group_id, user_id, kind, name, summary,
                accepted, rejected, created, last, sub_id, term, err)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (actor_id) DO UPDATE SET
                kind = excluded.kind,
                name = excluded.name,
                summary = excluded.summary,
                accepted = excluded.accepted,
                rejected = excluded.rejected,
                last = excluded.last,
                sub_id = excluded.sub_id,
                term = excluded.term,
                err = excluded.err
            WHERE {t}.group_id = excluded.group_id AND {t}.user_id = excluded.user_id
            "#,
            t = self.sources
        ))
        .bind(&source.actor_id)
        .bind(&source.group_id)
        .bind(&source.user_id)
        .bind(&source.kind)
        .bind(&source.name)
        .bind(&source.summary)
        .bind(source.accepted)
        .bind(source.rejected)
        .bind(source.created)
        .bind(source.last)
        .bind(&source.sub_id)
        .bind(&source.term)
        .bind(&source.err)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn set_last(
        &self,
        actor_id: &str,
        last: DateTime<Utc>,
        err: &str,
    ) -> Result<(), AppError> {
        record_query("update", "sources");
        let result = sqlx::query(&format!(
            "UPDATE {} SET last = ?, err = ? WHERE actor_id = ?",
            self.sources
        ))
        .bind(last)
        .bind(err)
        .bind(actor_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn set_follow_outcome(&self, actor_id: &str, accepted: bool) -> Result<(), AppError> {
        record_query("update", "sources");
        let result = sqlx::query(&format!(
            "UPDATE {} SET accepted = ?, rejected = ? WHERE actor_id = ?",
            self.sources
        ))
        .bind(accepted)
        .bind(!accepted)
        .bind(actor_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn set_profile(
        &self,
        actor_id: &str,
        kind: &str,
        name: &str,
        summary: &str,
    ) -> Result<(), AppError> {
        record_query("update", "sources");
        let result = sqlx::query(&format!(
            "UPDATE {} SET kind = ?, name = ?, summary = ? WHERE actor_id = ?",
            self.sources
        ))
        .bind(kind)
        .bind(name)
        .bind(summary)
        .bind(actor_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, actor_id: &str, group_id: &str, user_id: &str) -> Result<(), AppError> {
        record_query("delete", "sources");
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE actor_id = ? AND group_id = ? AND user_id = ?",
            self.sources
        ))
        .bind(actor_id)
        .bind(group_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn list(
        &self,
        filter: &Filter,
        limit: u32,
        cursor: &str,
        order: Order,
    ) -> Result<Vec<String>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        record_query("select", "sources");

        let mut query_builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT actor_id FROM {} WHERE 1 = 1",
            self.sources
        ));
        if let Some(group_id) = &filter.group_id {
            query_builder.push(" AND group_id = ").push_bind(group_id);
        }
        if let Some(user_id) = &filter.user_id {
            query_builder.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(pattern) = filter.pattern.as_deref().filter(|p| !p.is_empty()) {
            let like = like_pattern(pattern);
            query_builder
                .push(" AND (name LIKE ")
                .push_bind(like.clone())
                .push(" ESCAPE '\\' OR summary LIKE ")
                .push_bind(like)
                .push(" ESCAPE '\\')");
        }
        if !cursor.is_empty() {
            let cmp = match order {
                Order::Asc => " AND actor_id > ",
                Order::Desc => " AND actor_id < ",
            };
            query_builder.push(cmp).push_bind(cursor);
        }
        query_builder.push(match order {
            Order::Asc => " ORDER BY actor_id ASC",
            Order::Desc => " ORDER BY actor_id DESC",
        });
        query_builder.push(" LIMIT ").push_bind(i64::from(limit));

        let ids = query_builder
            .build_query_scalar::<String>()
            .fetch_all(&self.pool)
            .await?;

        Ok(ids)
    }

    async fn count(&self) -> Result<i64, AppError> {
        record_query("count", "sources");
        let count = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", self.sources))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn count_by_owner(&self, group_id: &str, user_id: &str) -> Result<i64, AppError> {
        record_query("count", "sources");
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {} WHERE group_id = ? AND user_id = ?",
            self.sources
        ))
        .bind(group_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl FollowerStorage for Database {
    async fn add_follower(&self, follower: &Follower) -> Result<(), AppError> {
        record_query("upsert", "followers");
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (actor_id, interest_id, inbox, created)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (actor_id, interest_id) DO UPDATE SET inbox = excluded.inbox
            "#,
            self.followers
        ))
        .bind(&follower.actor_id)
        .bind(&follower.interest_id)
        .bind(&follower.inbox)
        .bind(follower.created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_follower(&self, actor_id: &str, interest_id: &str) -> Result<(), AppError> {
        record_query("delete", "followers");
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE actor_id = ? AND interest_id = ?",
            self.followers
        ))
        .bind(actor_id)
        .bind(interest_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    async fn list_followers(
        &self,
        interest_id: &str,
        limit: u32,
        cursor: &str,
    ) -> Result<Vec<Follower>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        record_query("select", "followers");
        let followers = sqlx::query_as::<_, Follower>(&format!(
            r#"
            SELECT * FROM {}
            WHERE interest_id = ? AND actor_id > ?
            ORDER BY actor_id ASC
            LIMIT ?
            "#,
            self.followers
        ))
        .bind(interest_id)
        .bind(cursor)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(followers)
    }

    async fn count_followers(&self, interest_id: &str) -> Result<i64, AppError> {
        record_query("count", "followers");
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {} WHERE interest_id = ?",
            self.followers
        ))
        .bind(interest_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn count_all_followers(&self) -> Result<i64, AppError> {
        record_query("count", "followers");
        let count =
            sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", self.followers))
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
