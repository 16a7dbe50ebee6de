//! Durable hit queue.
//!
//! Entries live in SQLite keyed by a queue-wide monotonic sequence number.
//! The processor reads the head from the database on every step and holds
//! nothing but its sequence, so a restart resumes from the lowest surviving
//! entry. Events waiting for consent live in a separate wait set and join
//! the queue only when released.

use crate::{DispatchError, DispatchResult};
use edge_database::{queries, AsyncDatabase, HitQueueRow, NewHit};
use edge_protocol_types::EdgeHit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// A queue entry picked for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct HitEntry {
    pub sequence: i64,
    pub hit: EdgeHit,
    /// Retryable failures recorded so far.
    pub attempts: i64,
}

impl HitEntry {
    fn from_row(row: HitQueueRow) -> Result<Self, serde_json::Error> {
        Ok(Self {
            sequence: row.sequence,
            hit: serde_json::from_str(&row.payload)?,
            attempts: row.attempts,
        })
    }
}

/// Exclusive right to process a [`HitQueue`]. Released on drop.
pub struct ProcessorGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for ProcessorGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Ordered, durable queue of pending hits.
pub struct HitQueue {
    db: AsyncDatabase,
    /// Guards sequence assignment together with the persisting write.
    next_sequence: Mutex<i64>,
    processing: Arc<AtomicBool>,
}

impl HitQueue {
    /// Open the queue over `db`, resuming after whatever survived a restart.
    pub async fn open(db: AsyncDatabase) -> DispatchResult<Self> {
        let (next_sequence, surviving, held) = db
            .call(|conn| {
                Ok((
                    queries::next_hit_sequence(conn)?,
                    queries::count_hits(conn)?,
                    queries::list_held_events(conn)?.len(),
                ))
            })
            .await?;

        if surviving > 0 || held > 0 {
            info!(queued = surviving, held, next_sequence, "Recovered hit queue");
        }

        Ok(Self {
            db,
            next_sequence: Mutex::new(next_sequence),
            processing: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Append a hit. The entry is persisted before this returns.
    pub async fn enqueue(&self, hit: EdgeHit) -> DispatchResult<HitEntry> {
        let new_hit = NewHit {
            request_id: hit.request_id().to_string(),
            payload: serde_json::to_string(&hit)?,
        };

        let mut next_seq = self.next_sequence.lock().await;
        let sequence = *next_seq;
        self.db
            .call(move |conn| queries::insert_hits(conn, sequence, &[new_hit]))
            .await?;
        *next_seq += 1;
        drop(next_seq);

        debug!(sequence, request_id = %hit.request_id(), "Enqueued hit");
        Ok(HitEntry {
            sequence,
            hit,
            attempts: 0,
        })
    }

    /// Claim the processor role. Returns `None` while another guard is alive.
    pub fn acquire_processor(&self) -> Option<ProcessorGuard> {
        self.processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ProcessorGuard {
                flag: self.processing.clone(),
            })
    }

    /// The lowest-sequence entry not yet removed.
    ///
    /// Rows whose payload no longer decodes are removed and skipped.
    pub async fn process_next(&self, guard: &ProcessorGuard) -> DispatchResult<Option<HitEntry>> {
        if !Arc::ptr_eq(&guard.flag, &self.processing) {
            return Err(DispatchError::Queue(
                "processor guard belongs to another queue".to_string(),
            ));
        }

        loop {
            let Some(row) = self.db.call(|conn| queries::head_hit(conn)).await? else {
                return Ok(None);
            };

            let sequence = row.sequence;
            match HitEntry::from_row(row) {
                Ok(entry) => return Ok(Some(entry)),
                Err(e) => {
                    error!(sequence, error = %e, "Dropping undecodable hit");
                    self.remove(sequence).await?;
                }
            }
        }
    }

    /// Remove an entry after a terminal outcome.
    pub async fn remove(&self, sequence: i64) -> DispatchResult<bool> {
        let removed = self
            .db
            .call(move |conn| queries::delete_hit(conn, sequence))
            .await?;
        debug!(sequence, removed, "Removed hit");
        Ok(removed)
    }

    /// Record a retryable failure; the entry stays at the head.
    pub async fn record_attempt(&self, sequence: i64, reason: &str) -> DispatchResult<()> {
        let reason = reason.to_string();
        self.db
            .call(move |conn| queries::record_hit_attempt(conn, sequence, &reason))
            .await?;
        Ok(())
    }

    /// Remove every queued experience event, returning them. Consent updates
    /// stay queued.
    pub async fn clear(&self) -> DispatchResult<Vec<HitEntry>> {
        let entries = self
            .db
            .call(|conn| {
                let tx = conn.transaction()?;
                let mut removed = Vec::new();
                for row in queries::list_hits(&tx)? {
                    let sequence = row.sequence;
                    let Ok(entry) = HitEntry::from_row(row) else {
                        continue;
                    };
                    if matches!(entry.hit, EdgeHit::ExperienceEvent { .. }) {
                        queries::delete_hit(&tx, sequence)?;
                        removed.push(entry);
                    }
                }
                tx.commit()?;
                Ok(removed)
            })
            .await?;

        if !entries.is_empty() {
            warn!(count = entries.len(), "Cleared queued experience events");
        }
        Ok(entries)
    }

    /// Number of queued entries.
    pub async fn len(&self) -> DispatchResult<usize> {
        Ok(self.db.call(|conn| queries::count_hits(conn)).await?)
    }

    pub async fn is_empty(&self) -> DispatchResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Add a hit to the consent wait set.
    pub async fn hold(&self, hit: &EdgeHit) -> DispatchResult<()> {
        let new_hit = NewHit {
            request_id: hit.request_id().to_string(),
            payload: serde_json::to_string(hit)?,
        };
        let arrival = self
            .db
            .call(move |conn| queries::insert_held_event(conn, &new_hit))
            .await?;
        debug!(arrival, request_id = %hit.request_id(), "Held hit pending consent");
        Ok(())
    }

    /// Move every held hit into the queue in arrival order.
    pub async fn release_held(&self) -> DispatchResult<Vec<EdgeHit>> {
        let mut next_seq = self.next_sequence.lock().await;
        let first_sequence = *next_seq;
        let released = self
            .db
            .call(move |conn| queries::release_held_events(conn, first_sequence))
            .await?;
        *next_seq += released.len() as i64;
        drop(next_seq);

        if !released.is_empty() {
            info!(count = released.len(), first_sequence, "Released held hits");
        }
        Ok(released
            .into_iter()
            .filter_map(|row| serde_json::from_str(&row.payload).ok())
            .collect())
    }

    /// Discard the wait set, returning what was discarded.
    pub async fn discard_held(&self) -> DispatchResult<Vec<EdgeHit>> {
        let rows = self
            .db
            .call(|conn| {
                let rows = queries::list_held_events(conn)?;
                queries::clear_held_events(conn)?;
                Ok(rows)
            })
            .await?;

        if !rows.is_empty() {
            info!(count = rows.len(), "Discarded held hits");
        }
        Ok(rows
            .into_iter()
            .filter_map(|row| serde_json::from_str(&row.payload).ok())
            .collect())
    }

    /// Number of hits waiting for consent.
    pub async fn held_count(&self) -> DispatchResult<usize> {
        Ok(self
            .db
            .call(|conn| Ok(queries::list_held_events(conn)?.len()))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_protocol_types::{ConsentStatus, EventEnvelope, ExperienceEvent};
    use serde_json::json;

    fn experience(tag: &str) -> EdgeHit {
        let event = ExperienceEvent::new(json!({ "eventType": tag }));
        EdgeHit::experience(EventEnvelope::new(event, ConsentStatus::Yes))
    }

    async fn queue() -> HitQueue {
        HitQueue::open(AsyncDatabase::open_in_memory().await.unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_assigns_increasing_sequences() {
        let queue = queue().await;
        let a = queue.enqueue(experience("a")).await.unwrap();
        let b = queue.enqueue(experience("b")).await.unwrap();
        assert!(b.sequence > a.sequence);
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_process_next_yields_head_until_removed() {
        let queue = queue().await;
        let a = queue.enqueue(experience("a")).await.unwrap();
        let b = queue.enqueue(experience("b")).await.unwrap();
        let guard = queue.acquire_processor().unwrap();

        let head = queue.process_next(&guard).await.unwrap().unwrap();
        assert_eq!(head, a);

        queue.record_attempt(a.sequence, "HTTP 429").await.unwrap();
        let again = queue.process_next(&guard).await.unwrap().unwrap();
        assert_eq!(again.sequence, a.sequence);
        assert_eq!(again.attempts, 1);

        assert!(queue.remove(a.sequence).await.unwrap());
        let next = queue.process_next(&guard).await.unwrap().unwrap();
        assert_eq!(next.sequence, b.sequence);

        queue.remove(b.sequence).await.unwrap();
        assert!(queue.process_next(&guard).await.unwrap().is_none());
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_single_processor_guard() {
        let queue = queue().await;
        let guard = queue.acquire_processor().unwrap();
        assert!(queue.acquire_processor().is_none());
        drop(guard);
        assert!(queue.acquire_processor().is_some());
    }

    #[tokio::test]
    async fn test_foreign_guard_rejected() {
        let first = queue().await;
        let second = queue().await;
        let guard = first.acquire_processor().unwrap();
        assert!(matches!(
            second.process_next(&guard).await,
            Err(DispatchError::Queue(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_enqueue_keeps_total_order() {
        let queue = Arc::new(queue().await);
        let mut handles = Vec::new();
        for i in 0..20 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.enqueue(experience(&format!("e{}", i))).await.unwrap().sequence
            }));
        }
        let mut sequences = Vec::new();
        for handle in handles {
            sequences.push(handle.await.unwrap());
        }
        sequences.sort();
        sequences.dedup();
        assert_eq!(sequences.len(), 20);
        assert_eq!(queue.len().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_held_hits_join_queue_after_existing_entries() {
        let queue = queue().await;
        let first = experience("held-1");
        let second = experience("held-2");
        queue.hold(&first).await.unwrap();
        queue.hold(&second).await.unwrap();
        let direct = queue.enqueue(experience("direct")).await.unwrap();
        assert_eq!(queue.held_count().await.unwrap(), 2);
        assert_eq!(queue.len().await.unwrap(), 1);

        let released = queue.release_held().await.unwrap();
        assert_eq!(released, vec![first.clone(), second.clone()]);
        assert_eq!(queue.held_count().await.unwrap(), 0);

        let guard = queue.acquire_processor().unwrap();
        let head = queue.process_next(&guard).await.unwrap().unwrap();
        assert_eq!(head.sequence, direct.sequence);
        queue.remove(head.sequence).await.unwrap();
        let head = queue.process_next(&guard).await.unwrap().unwrap();
        assert_eq!(head.hit, first);

        let later = queue.enqueue(experience("later")).await.unwrap();
        assert!(later.sequence > head.sequence + 1);
    }

    #[tokio::test]
    async fn test_discard_held() {
        let queue = queue().await;
        queue.hold(&experience("x")).await.unwrap();
        assert_eq!(queue.discard_held().await.unwrap().len(), 1);
        assert!(queue.release_held().await.unwrap().is_empty());
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_keeps_consent_updates() {
        let queue = queue().await;
        queue.enqueue(experience("a")).await.unwrap();
        let update = queue
            .enqueue(EdgeHit::consent_update(json!({ "consents": { "collect": { "val": "n" } } })))
            .await
            .unwrap();
        queue.enqueue(experience("b")).await.unwrap();

        let cleared = queue.clear().await.unwrap();
        assert_eq!(cleared.len(), 2);
        assert_eq!(queue.len().await.unwrap(), 1);

        let guard = queue.acquire_processor().unwrap();
        let head = queue.process_next(&guard).await.unwrap().unwrap();
        assert_eq!(head.sequence, update.sequence);
    }

    #[tokio::test]
    async fn test_undecodable_rows_skipped() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        db.call(|conn| {
            queries::insert_hits(
                conn,
                1,
                &[NewHit {
                    request_id: "broken".to_string(),
                    payload: "{not json".to_string(),
                }],
            )
        })
        .await
        .unwrap();

        let queue = HitQueue::open(db).await.unwrap();
        let good = queue.enqueue(experience("ok")).await.unwrap();
        assert_eq!(good.sequence, 2);

        let guard = queue.acquire_processor().unwrap();
        let head = queue.process_next(&guard).await.unwrap().unwrap();
        assert_eq!(head.sequence, 2);
        assert_eq!(queue.len().await.unwrap(), 1);
    }
}
