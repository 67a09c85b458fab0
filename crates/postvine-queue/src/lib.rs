//! Queue collaborator: blocking pop + atomic multi-pop drain over a Redis list.

use std::collections::VecDeque;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

pub const CRATE_NAME: &str = "postvine-queue";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Source of raw serialized records.
///
/// `next_batch` blocks until at least one record is available, then returns
/// that record plus up to `max_extra` more, removing exactly the returned
/// records from the source. The blocking record is first in the returned
/// batch, so batch order matches arrival order.
#[async_trait]
pub trait RecordQueue: Send + Sync {
    async fn next_batch(&self, max_extra: usize) -> Result<Vec<Vec<u8>>, QueueError>;
}

/// Redis list implementation: BLPOP for the wait, then LRANGE + LTRIM inside
/// a MULTI/EXEC pipeline so that no record can be drained by two consumers or
/// dropped between the read and the trim.
pub struct RedisQueue {
    manager: ConnectionManager,
    key: String,
}

impl RedisQueue {
    pub async fn connect(url: &str, key: impl Into<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            key: key.into(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl RecordQueue for RedisQueue {
    async fn next_batch(&self, max_extra: usize) -> Result<Vec<Vec<u8>>, QueueError> {
        let mut conn = self.manager.clone();

        // No timeout: WAIT_FOR_DATA blocks until a producer pushes.
        let (_key, first): (String, Vec<u8>) = redis::cmd("BLPOP")
            .arg(&self.key)
            .arg(0)
            .query_async(&mut conn)
            .await?;

        let mut batch = Vec::with_capacity(max_extra + 1);
        batch.push(first);

        if max_extra > 0 {
            let (last, keep_from) = drain_bounds(max_extra);
            let (rest,): (Vec<Vec<u8>>,) = redis::pipe()
                .atomic()
                .cmd("LRANGE")
                .arg(&self.key)
                .arg(0)
                .arg(last)
                .cmd("LTRIM")
                .arg(&self.key)
                .arg(keep_from)
                .arg(-1)
                .ignore()
                .query_async(&mut conn)
                .await?;
            batch.extend(rest);
        }

        debug!(key = %self.key, drained = batch.len(), "drained record batch");
        Ok(batch)
    }
}

/// Index bounds for the drain pipeline: LRANGE's inclusive last index and
/// LTRIM's first retained index. Clamps instead of wrapping on a `max_extra`
/// beyond `isize::MAX`.
fn drain_bounds(max_extra: usize) -> (isize, isize) {
    let take = isize::try_from(max_extra).unwrap_or(isize::MAX);
    (take - 1, take)
}

/// In-memory queue with the same drain contract, for tests and local runs
/// without a Redis instance.
#[derive(Default)]
pub struct MemoryQueue {
    items: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, record: Vec<u8>) {
        self.items.lock().await.push_back(record);
        self.notify.notify_one();
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl RecordQueue for MemoryQueue {
    async fn next_batch(&self, max_extra: usize) -> Result<Vec<Vec<u8>>, QueueError> {
        loop {
            let notified = self.notify.notified();
            {
                let mut items = self.items.lock().await;
                if let Some(first) = items.pop_front() {
                    let take = max_extra.min(items.len());
                    let mut batch = Vec::with_capacity(take + 1);
                    batch.push(first);
                    batch.extend(items.drain(..take));
                    return Ok(batch);
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    async fn filled(count: usize) -> MemoryQueue {
        let queue = MemoryQueue::new();
        for n in 0..count {
            queue.push(format!("record-{n}").into_bytes()).await;
        }
        queue
    }

    #[tokio::test]
    async fn one_cycle_drains_at_most_the_blocking_item_plus_max_extra() {
        let queue = filled(250).await;

        let batch = queue.next_batch(100).await.expect("drain");
        assert_eq!(batch.len(), 101);
        assert_eq!(queue.len().await, 149);

        // The remainder stays available for the next cycle.
        let batch = queue.next_batch(100).await.expect("drain");
        assert_eq!(batch.len(), 101);
        assert_eq!(queue.len().await, 48);
    }

    #[tokio::test]
    async fn batch_preserves_arrival_order_with_blocking_item_first() {
        let queue = filled(3).await;
        let batch = queue.next_batch(10).await.expect("drain");
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0], b"record-0");
        assert_eq!(batch[2], b"record-2");
    }

    #[tokio::test]
    async fn zero_max_extra_pops_a_single_record() {
        let queue = filled(5).await;
        let batch = queue.next_batch(0).await.expect("drain");
        assert_eq!(batch.len(), 1);
        assert_eq!(queue.len().await, 4);
    }

    #[tokio::test]
    async fn next_batch_blocks_until_a_record_arrives() {
        let queue = Arc::new(MemoryQueue::new());

        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(b"late".to_vec()).await;
        });

        let batch = tokio::time::timeout(Duration::from_secs(5), queue.next_batch(10))
            .await
            .expect("did not block forever")
            .expect("drain");
        assert_eq!(batch, vec![b"late".to_vec()]);
        assert!(queue.is_empty().await);
    }

    #[test]
    fn drain_bounds_are_inclusive_range_and_trim_start() {
        assert_eq!(drain_bounds(100), (99, 100));
        assert_eq!(drain_bounds(1), (0, 1));
    }

    #[test]
    fn drain_bounds_clamp_instead_of_wrapping() {
        let (last, keep_from) = drain_bounds(usize::MAX);
        assert_eq!(last, isize::MAX - 1);
        assert_eq!(keep_from, isize::MAX);
    }
}
