//! Domain model, record normalization, and batch reconciliation for PostVine.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "postvine-core";

/// The two record categories the pipeline persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Author,
    Post,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Author => "author",
            EntityKind::Post => "post",
        }
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("{} record has no numeric primary key", kind.as_str())]
    MissingId { kind: EntityKind },
    #[error("record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Profile entity keyed by a source-supplied identity. Identities are never
/// generated locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub id: i64,
    pub display_name: Option<String>,
    pub handle: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub verified: Option<bool>,
    pub followers_count: Option<i32>,
    pub following_count: Option<i32>,
    pub listed_count: Option<i32>,
    pub likes_count: Option<i32>,
    pub posts_count: Option<i32>,
    pub created_at: Option<DateTime<Utc>>,
    pub bot: bool,
}

impl Author {
    /// Map a raw author object into a typed entity. Every field is pulled by
    /// name through a typed extractor; absent fields become `None`. The `bot`
    /// flag is a policy constant pending real classification.
    pub fn from_json(obj: &Map<String, Value>) -> Result<Self, NormalizeError> {
        let id = i64_field(obj, "id").ok_or(NormalizeError::MissingId {
            kind: EntityKind::Author,
        })?;
        Ok(Self {
            id,
            display_name: str_field(obj, "display_name"),
            handle: str_field(obj, "handle"),
            location: str_field(obj, "location"),
            url: str_field(obj, "url"),
            description: str_field(obj, "description"),
            verified: bool_field(obj, "verified"),
            followers_count: i32_field(obj, "followers_count"),
            following_count: i32_field(obj, "following_count"),
            listed_count: i32_field(obj, "listed_count"),
            likes_count: i32_field(obj, "likes_count"),
            posts_count: i32_field(obj, "posts_count"),
            created_at: timestamp_field(obj, "created_at"),
            bot: false,
        })
    }
}

/// Post entity. `author_id` is nullable: the associated author may be absent
/// or anonymized, and the relationship is not enforced at insert time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub text: Option<String>,
    pub lang: Option<String>,
    pub source: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub like_count: Option<i32>,
    pub repost_count: Option<i32>,
    pub reply_count: Option<i32>,
    pub reply_to_post_id: Option<i64>,
    pub reply_to_author_id: Option<i64>,
    pub quoted_post_id: Option<i64>,
    pub sensitive: Option<bool>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub author_id: Option<i64>,
    pub tags: Vec<String>,
    pub links: Vec<String>,
    pub mentions: Vec<i64>,
}

impl Post {
    /// Map a raw post object into a typed entity. List-valued fields extract
    /// one designated sub-attribute per element; malformed elements contribute
    /// nothing rather than failing the record. The author back-reference is
    /// taken only from the embedded `author` sub-object.
    pub fn from_json(obj: &Map<String, Value>) -> Result<Self, NormalizeError> {
        let id = i64_field(obj, "id").ok_or(NormalizeError::MissingId {
            kind: EntityKind::Post,
        })?;
        let author_id = obj
            .get("author")
            .and_then(Value::as_object)
            .and_then(|a| i64_field(a, "id"));
        Ok(Self {
            id,
            text: str_field(obj, "text"),
            lang: str_field(obj, "lang"),
            source: str_field(obj, "source"),
            created_at: timestamp_field(obj, "created_at"),
            like_count: i32_field(obj, "like_count"),
            repost_count: i32_field(obj, "repost_count"),
            reply_count: i32_field(obj, "reply_count"),
            reply_to_post_id: i64_field(obj, "reply_to_post_id"),
            reply_to_author_id: i64_field(obj, "reply_to_author_id"),
            quoted_post_id: i64_field(obj, "quoted_post_id"),
            sensitive: bool_field(obj, "sensitive"),
            latitude: f64_field(obj, "latitude"),
            longitude: f64_field(obj, "longitude"),
            author_id,
            tags: string_list(obj, "tags", "text"),
            links: string_list(obj, "links", "url"),
            mentions: id_list(obj, "mentions", "id"),
        })
    }
}

/// One raw queue record, normalized. A record always carries a post; the
/// embedded author is optional (a post without a resolvable author is kept
/// with a null back-reference rather than dropped).
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub author: Option<Author>,
    pub post: Post,
}

/// Normalize one serialized record from the queue.
///
/// Fails only for records that cannot be routed at all: invalid JSON, a
/// non-object payload, or a post with no numeric primary key. An author
/// sub-object that is missing or itself lacks an id degrades to
/// `author: None` instead of failing the record.
pub fn normalize_record(raw: &[u8]) -> Result<NormalizedRecord, NormalizeError> {
    let value: Value = serde_json::from_slice(raw)?;
    let obj = value.as_object().ok_or(NormalizeError::NotAnObject)?;
    let post = Post::from_json(obj)?;
    let author = obj
        .get("author")
        .and_then(Value::as_object)
        .and_then(|a| Author::from_json(a).ok());
    Ok(NormalizedRecord { author, post })
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn i64_field(obj: &Map<String, Value>, key: &str) -> Option<i64> {
    obj.get(key).and_then(Value::as_i64)
}

fn i32_field(obj: &Map<String, Value>, key: &str) -> Option<i32> {
    i64_field(obj, key).and_then(|n| i32::try_from(n).ok())
}

fn f64_field(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    obj.get(key).and_then(Value::as_f64)
}

fn bool_field(obj: &Map<String, Value>, key: &str) -> Option<bool> {
    obj.get(key).and_then(Value::as_bool)
}

/// Accepts RFC 3339 and the legacy `Wed Oct 10 20:19:24 +0000 2018` format.
/// Anything else normalizes to `None` rather than failing the record.
fn timestamp_field(obj: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    let raw = obj.get(key).and_then(Value::as_str)?;
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%a %b %d %H:%M:%S %z %Y"))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Extract `inner` string values from a list of objects, in order.
fn string_list(obj: &Map<String, Value>, key: &str, inner: &str) -> Vec<String> {
    list_items(obj, key)
        .filter_map(|item| item.get(inner))
        .filter_map(Value::as_str)
        .map(str::to_owned)
        .collect()
}

/// Extract `inner` numeric identities from a list of objects, in order.
fn id_list(obj: &Map<String, Value>, key: &str, inner: &str) -> Vec<i64> {
    list_items(obj, key)
        .filter_map(|item| item.get(inner))
        .filter_map(Value::as_i64)
        .collect()
}

fn list_items<'a>(obj: &'a Map<String, Value>, key: &str) -> impl Iterator<Item = &'a Value> + 'a {
    obj.get(key)
        .and_then(Value::as_array)
        .map(|a| a.as_slice())
        .unwrap_or(&[])
        .iter()
}

/// The reconciler's output: four operation sets for one cycle. Within a kind,
/// primary keys are disjoint between inserts and updates and unique within
/// each set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchPlan {
    pub author_inserts: Vec<Author>,
    pub author_updates: Vec<Author>,
    pub post_inserts: Vec<Post>,
    pub post_updates: Vec<Post>,
}

impl BatchPlan {
    pub fn is_empty(&self) -> bool {
        self.author_inserts.is_empty()
            && self.author_updates.is_empty()
            && self.post_inserts.is_empty()
            && self.post_updates.is_empty()
    }

    pub fn insert_count(&self) -> usize {
        self.author_inserts.len() + self.post_inserts.len()
    }
}

/// Partition normalized entities into insert and update sets per kind.
///
/// An entity routes to the update set when its key is in the corresponding
/// existence set (one batched store lookup per kind, taken once before this
/// call), otherwise to the insert set. Repeats of a key within the batch are
/// dropped: the first occurrence wins, for both kinds.
pub fn reconcile(
    authors: Vec<Author>,
    posts: Vec<Post>,
    existing_authors: &HashSet<i64>,
    existing_posts: &HashSet<i64>,
) -> BatchPlan {
    let (author_inserts, author_updates) = partition_entities(authors, existing_authors, |a| a.id);
    let (post_inserts, post_updates) = partition_entities(posts, existing_posts, |p| p.id);
    BatchPlan {
        author_inserts,
        author_updates,
        post_inserts,
        post_updates,
    }
}

fn partition_entities<T>(
    entities: Vec<T>,
    existing: &HashSet<i64>,
    key: impl Fn(&T) -> i64,
) -> (Vec<T>, Vec<T>) {
    let mut assigned = HashSet::new();
    let mut inserts = Vec::new();
    let mut updates = Vec::new();
    for entity in entities {
        let id = key(&entity);
        if !assigned.insert(id) {
            continue;
        }
        if existing.contains(&id) {
            updates.push(entity);
        } else {
            inserts.push(entity);
        }
    }
    (inserts, updates)
}
