//! Postgres persistence: batched existence checks and one-transaction-per-cycle commits.

use std::collections::HashSet;

use async_trait::async_trait;
use postvine_core::{Author, BatchPlan, Post};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "postvine-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Row counts reported after a committed cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitCounts {
    pub inserted: u64,
    pub posts_updated: u64,
    pub authors_updated: u64,
}

/// Backing store for the reconciler and committer.
///
/// Existence checks are batched: one set-membership query per kind over all
/// candidate keys of a cycle. `commit` applies a whole [`BatchPlan`] as a
/// single unit of work; on error nothing from the plan is observable.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn existing_author_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StorageError>;
    async fn existing_post_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StorageError>;
    async fn commit(&self, plan: &BatchPlan) -> Result<CommitCounts, StorageError>;
}

/// Postgres-backed store. The pool is shared across cycles; each commit still
/// runs in its own transaction.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn existing_author_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StorageError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows: Vec<i64> = sqlx::query_scalar("SELECT id FROM author WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn existing_post_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StorageError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows: Vec<i64> = sqlx::query_scalar("SELECT id FROM post WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    /// Apply all four operation sets in one transaction: inserts first
    /// (authors before posts, so the nullable back-reference usually resolves
    /// within the batch), then updates (posts before authors). A failure at
    /// any step rolls the whole cycle back.
    async fn commit(&self, plan: &BatchPlan) -> Result<CommitCounts, StorageError> {
        let mut tx = self.pool.begin().await?;

        if !plan.author_inserts.is_empty() {
            author_insert(&plan.author_inserts)
                .build()
                .execute(&mut *tx)
                .await?;
        }
        if !plan.post_inserts.is_empty() {
            post_insert(&plan.post_inserts)
                .build()
                .execute(&mut *tx)
                .await?;
        }

        let mut posts_updated = 0u64;
        for post in &plan.post_updates {
            posts_updated += update_post(post).execute(&mut *tx).await?.rows_affected();
        }
        let mut authors_updated = 0u64;
        for author in &plan.author_updates {
            authors_updated += update_author(author)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        debug!(
            inserted = plan.insert_count(),
            posts_updated, authors_updated, "committed batch plan"
        );

        Ok(CommitCounts {
            inserted: plan.insert_count() as u64,
            posts_updated,
            authors_updated,
        })
    }
}

fn author_insert(authors: &[Author]) -> QueryBuilder<'_, Postgres> {
    let mut qb = QueryBuilder::new(
        "INSERT INTO author (id, display_name, handle, location, url, description, verified, \
         followers_count, following_count, listed_count, likes_count, posts_count, created_at, bot) ",
    );
    qb.push_values(authors, |mut row, a| {
        row.push_bind(a.id)
            .push_bind(&a.display_name)
            .push_bind(&a.handle)
            .push_bind(&a.location)
            .push_bind(&a.url)
            .push_bind(&a.description)
            .push_bind(a.verified)
            .push_bind(a.followers_count)
            .push_bind(a.following_count)
            .push_bind(a.listed_count)
            .push_bind(a.likes_count)
            .push_bind(a.posts_count)
            .push_bind(a.created_at)
            .push_bind(a.bot);
    });
    qb
}

fn post_insert(posts: &[Post]) -> QueryBuilder<'_, Postgres> {
    let mut qb = QueryBuilder::new(
        "INSERT INTO post (id, text, lang, source, created_at, like_count, repost_count, \
         reply_count, reply_to_post_id, reply_to_author_id, quoted_post_id, sensitive, \
         latitude, longitude, author_id, tags, links, mentions) ",
    );
    qb.push_values(posts, |mut row, p| {
        row.push_bind(p.id)
            .push_bind(&p.text)
            .push_bind(&p.lang)
            .push_bind(&p.source)
            .push_bind(p.created_at)
            .push_bind(p.like_count)
            .push_bind(p.repost_count)
            .push_bind(p.reply_count)
            .push_bind(p.reply_to_post_id)
            .push_bind(p.reply_to_author_id)
            .push_bind(p.quoted_post_id)
            .push_bind(p.sensitive)
            .push_bind(p.latitude)
            .push_bind(p.longitude)
            .push_bind(p.author_id)
            .push_bind(&p.tags)
            .push_bind(&p.links)
            .push_bind(&p.mentions);
    });
    qb
}

fn update_author(a: &Author) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        "UPDATE author SET display_name = $2, handle = $3, location = $4, url = $5, \
         description = $6, verified = $7, followers_count = $8, following_count = $9, \
         listed_count = $10, likes_count = $11, posts_count = $12, created_at = $13, bot = $14 \
         WHERE id = $1",
    )
    .bind(a.id)
    .bind(&a.display_name)
    .bind(&a.handle)
    .bind(&a.location)
    .bind(&a.url)
    .bind(&a.description)
    .bind(a.verified)
    .bind(a.followers_count)
    .bind(a.following_count)
    .bind(a.listed_count)
    .bind(a.likes_count)
    .bind(a.posts_count)
    .bind(a.created_at)
    .bind(a.bot)
}

fn update_post(p: &Post) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        "UPDATE post SET text = $2, lang = $3, source = $4, created_at = $5, like_count = $6, \
         repost_count = $7, reply_count = $8, reply_to_post_id = $9, reply_to_author_id = $10, \
         quoted_post_id = $11, sensitive = $12, latitude = $13, longitude = $14, \
         author_id = $15, tags = $16, links = $17, mentions = $18 \
         WHERE id = $1",
    )
    .bind(p.id)
    .bind(&p.text)
    .bind(&p.lang)
    .bind(&p.source)
    .bind(p.created_at)
    .bind(p.like_count)
    .bind(p.repost_count)
    .bind(p.reply_count)
    .bind(p.reply_to_post_id)
    .bind(p.reply_to_author_id)
    .bind(p.quoted_post_id)
    .bind(p.sensitive)
    .bind(p.latitude)
    .bind(p.longitude)
    .bind(p.author_id)
    .bind(&p.tags)
    .bind(&p.links)
    .bind(&p.mentions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::Execute;

    fn author(id: i64) -> Author {
        Author::from_json(json!({"id": id}).as_object().expect("object")).expect("author")
    }

    fn post(id: i64) -> Post {
        Post::from_json(json!({"id": id}).as_object().expect("object")).expect("post")
    }

    #[test]
    fn author_insert_binds_all_columns_per_row() {
        let authors = vec![author(1), author(2)];
        let qb = author_insert(&authors);
        let sql = qb.sql();
        assert!(sql.starts_with("INSERT INTO author (id,"));
        // 14 columns x 2 rows
        assert_eq!(sql.matches('$').count(), 28);
    }

    #[test]
    fn post_insert_binds_all_columns_per_row() {
        let posts = vec![post(1)];
        let qb = post_insert(&posts);
        let sql = qb.sql();
        assert!(sql.starts_with("INSERT INTO post (id,"));
        assert_eq!(sql.matches('$').count(), 18);
    }

    #[test]
    fn updates_are_keyed_by_primary_key() {
        let a = author(9);
        let p = post(9);
        assert!(update_author(&a).sql().ends_with("WHERE id = $1"));
        assert!(update_post(&p).sql().ends_with("WHERE id = $1"));
    }
}
