//! Standalone query functions.
//!
//! Read-only and single-statement helpers take `&Connection`; helpers that
//! must be atomic across several statements take `&mut Connection` and run
//! inside a transaction.

use crate::{
    DatabaseResult, HeldEventRow, HitQueueRow, LocationHintRecord, NewHit, StorePayloadRecord,
    STATE_LAST_RESET_AT, STATE_LAST_SEQUENCE, STATE_LOCATION_HINT,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

// ==========================================
// Hit queue
// ==========================================

/// Next sequence number: one past the highest ever assigned.
///
/// Uses the persisted high-water mark so numbers are never reused after the
/// queue drains.
pub fn next_hit_sequence(conn: &Connection) -> DatabaseResult<i64> {
    let max_row: Option<i64> =
        conn.query_row("SELECT MAX(sequence) FROM hit_queue", [], |row| row.get(0))?;
    let high_water = get_state(conn, STATE_LAST_SEQUENCE)?
        .and_then(|raw| raw.parse::<i64>().ok())
        .unwrap_or(0);
    Ok(max_row.unwrap_or(0).max(high_water) + 1)
}

/// Insert hits with consecutive sequence numbers starting at `first_sequence`
/// and advance the high-water mark, in one transaction.
pub fn insert_hits(
    conn: &mut Connection,
    first_sequence: i64,
    hits: &[NewHit],
) -> DatabaseResult<Vec<i64>> {
    let tx = conn.transaction()?;
    let now = Utc::now().to_rfc3339();
    let mut sequences = Vec::with_capacity(hits.len());
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO hit_queue (sequence, request_id, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (offset, hit) in hits.iter().enumerate() {
            let sequence = first_sequence + offset as i64;
            stmt.execute(params![sequence, hit.request_id, hit.payload, now])?;
            sequences.push(sequence);
        }
    }
    if let Some(last) = sequences.last() {
        set_state(&tx, STATE_LAST_SEQUENCE, &last.to_string())?;
    }
    tx.commit()?;
    Ok(sequences)
}

/// Lowest-sequence entry still in the queue.
pub fn head_hit(conn: &Connection) -> DatabaseResult<Option<HitQueueRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT sequence, request_id, payload, attempts, last_error, created_at, last_attempt_at
         FROM hit_queue
         ORDER BY sequence ASC
         LIMIT 1",
    )?;
    let row = stmt.query_row([], map_hit_row).optional()?;
    Ok(row)
}

/// All entries in sequence order.
pub fn list_hits(conn: &Connection) -> DatabaseResult<Vec<HitQueueRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT sequence, request_id, payload, attempts, last_error, created_at, last_attempt_at
         FROM hit_queue
         ORDER BY sequence ASC",
    )?;
    let rows = stmt
        .query_map([], map_hit_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn map_hit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HitQueueRow> {
    Ok(HitQueueRow {
        sequence: row.get(0)?,
        request_id: row.get(1)?,
        payload: row.get(2)?,
        attempts: row.get(3)?,
        last_error: row.get(4)?,
        created_at: parse_datetime(row.get::<_, String>(5)?),
        last_attempt_at: row.get::<_, Option<String>>(6)?.map(parse_datetime),
    })
}

/// Remove an entry after a terminal outcome. Returns false if already gone.
pub fn delete_hit(conn: &Connection, sequence: i64) -> DatabaseResult<bool> {
    let count = conn.execute("DELETE FROM hit_queue WHERE sequence = ?1", params![sequence])?;
    Ok(count > 0)
}

/// Record a retryable failure against an entry.
pub fn record_hit_attempt(
    conn: &Connection,
    sequence: i64,
    error: &str,
) -> DatabaseResult<bool> {
    let now = Utc::now().to_rfc3339();
    let count = conn.execute(
        "UPDATE hit_queue
         SET attempts = attempts + 1, last_error = ?1, last_attempt_at = ?2
         WHERE sequence = ?3",
        params![error, now, sequence],
    )?;
    Ok(count > 0)
}

/// Number of queued entries.
pub fn count_hits(conn: &Connection) -> DatabaseResult<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM hit_queue", [], |row| row.get(0))?;
    Ok(count as usize)
}

// ==========================================
// Held events
// ==========================================

/// Append an event to the consent wait set.
pub fn insert_held_event(conn: &Connection, hit: &NewHit) -> DatabaseResult<i64> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO held_events (request_id, payload, created_at) VALUES (?1, ?2, ?3)",
        params![hit.request_id, hit.payload, now],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Held events in arrival order.
pub fn list_held_events(conn: &Connection) -> DatabaseResult<Vec<HeldEventRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT arrival, request_id, payload, created_at FROM held_events ORDER BY arrival ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(HeldEventRow {
                arrival: row.get(0)?,
                request_id: row.get(1)?,
                payload: row.get(2)?,
                created_at: parse_datetime(row.get::<_, String>(3)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Move every held event into the hit queue, preserving arrival order.
///
/// Returns the held rows that were released. Insert and delete share one
/// transaction, so an event is never both held and queued.
pub fn release_held_events(
    conn: &mut Connection,
    first_sequence: i64,
) -> DatabaseResult<Vec<HeldEventRow>> {
    let held = list_held_events(conn)?;
    if held.is_empty() {
        return Ok(held);
    }

    let tx = conn.transaction()?;
    let now = Utc::now().to_rfc3339();
    {
        let mut insert = tx.prepare_cached(
            "INSERT INTO hit_queue (sequence, request_id, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        let mut delete = tx.prepare_cached("DELETE FROM held_events WHERE arrival = ?1")?;
        for (offset, row) in held.iter().enumerate() {
            insert.execute(params![
                first_sequence + offset as i64,
                row.request_id,
                row.payload,
                now
            ])?;
            delete.execute(params![row.arrival])?;
        }
    }
    let last = first_sequence + held.len() as i64 - 1;
    set_state(&tx, STATE_LAST_SEQUENCE, &last.to_string())?;
    tx.commit()?;

    debug!(count = held.len(), first_sequence, "Released held events");
    Ok(held)
}

/// Discard every held event.
pub fn clear_held_events(conn: &Connection) -> DatabaseResult<usize> {
    let count = conn.execute("DELETE FROM held_events", [])?;
    Ok(count)
}

// ==========================================
// Store payloads
// ==========================================

/// Upsert records and delete `deletes`, in one transaction.
pub fn apply_store_payloads(
    conn: &mut Connection,
    upserts: &[StorePayloadRecord],
    deletes: &[String],
) -> DatabaseResult<()> {
    let tx = conn.transaction()?;
    let now = Utc::now().to_rfc3339();
    {
        let mut upsert = tx.prepare_cached(
            "INSERT INTO store_payloads (key, value, max_age, expires_at, attrs, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(key) DO UPDATE SET
                value = ?2, max_age = ?3, expires_at = ?4, attrs = ?5, updated_at = ?6",
        )?;
        for record in upserts {
            upsert.execute(params![
                record.key,
                record.value,
                record.max_age,
                record.expires_at,
                record.attrs,
                now
            ])?;
        }
        let mut delete = tx.prepare_cached("DELETE FROM store_payloads WHERE key = ?1")?;
        for key in deletes {
            delete.execute(params![key])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Purge expired payloads and return the rest, ordered by key.
pub fn live_store_payloads(
    conn: &mut Connection,
    now_ms: i64,
) -> DatabaseResult<Vec<StorePayloadRecord>> {
    let tx = conn.transaction()?;
    let purged = tx.execute(
        "DELETE FROM store_payloads WHERE expires_at <= ?1",
        params![now_ms],
    )?;
    if purged > 0 {
        debug!(purged, "Purged expired store payloads");
    }
    let records = {
        let mut stmt = tx.prepare_cached(
            "SELECT key, value, max_age, expires_at, attrs FROM store_payloads ORDER BY key ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StorePayloadRecord {
                    key: row.get(0)?,
                    value: row.get(1)?,
                    max_age: row.get(2)?,
                    expires_at: row.get(3)?,
                    attrs: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    tx.commit()?;
    Ok(records)
}

/// Drop every store payload, the location hint and record the reset time.
pub fn reset_identities(conn: &mut Connection, reset_at_ms: i64) -> DatabaseResult<usize> {
    let tx = conn.transaction()?;
    let cleared = tx.execute("DELETE FROM store_payloads", [])?;
    tx.execute(
        "DELETE FROM edge_state WHERE key = ?1",
        params![STATE_LOCATION_HINT],
    )?;
    set_state(&tx, STATE_LAST_RESET_AT, &reset_at_ms.to_string())?;
    tx.commit()?;
    Ok(cleared)
}

// ==========================================
// Key/value state
// ==========================================

pub fn get_state(conn: &Connection, key: &str) -> DatabaseResult<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM edge_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

pub fn set_state(conn: &Connection, key: &str, value: &str) -> DatabaseResult<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO edge_state (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
        params![key, value, now],
    )?;
    Ok(())
}

pub fn delete_state(conn: &Connection, key: &str) -> DatabaseResult<bool> {
    let count = conn.execute("DELETE FROM edge_state WHERE key = ?1", params![key])?;
    Ok(count > 0)
}

/// Last reset-identities time in ms, if a reset ever happened.
pub fn last_reset_at(conn: &Connection) -> DatabaseResult<Option<i64>> {
    Ok(get_state(conn, STATE_LAST_RESET_AT)?.and_then(|raw| raw.parse().ok()))
}

pub fn get_location_hint(conn: &Connection) -> DatabaseResult<Option<LocationHintRecord>> {
    match get_state(conn, STATE_LOCATION_HINT)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub fn set_location_hint(conn: &Connection, record: &LocationHintRecord) -> DatabaseResult<()> {
    set_state(conn, STATE_LOCATION_HINT, &serde_json::to_string(record)?)
}

pub fn clear_location_hint(conn: &Connection) -> DatabaseResult<bool> {
    delete_state(conn, STATE_LOCATION_HINT)
}

// ==========================================
// Helpers
// ==========================================

/// Parse an RFC3339 datetime string, falling back to current time on error.
fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_migrations;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn hit(request_id: &str) -> NewHit {
        NewHit {
            request_id: request_id.to_string(),
            payload: format!("{{\"id\":\"{}\"}}", request_id),
        }
    }

    #[test]
    fn test_sequences_never_reused() {
        let mut conn = conn();
        assert_eq!(next_hit_sequence(&conn).unwrap(), 1);

        insert_hits(&mut conn, 1, &[hit("a"), hit("b")]).unwrap();
        assert_eq!(next_hit_sequence(&conn).unwrap(), 3);

        delete_hit(&conn, 1).unwrap();
        delete_hit(&conn, 2).unwrap();
        assert_eq!(count_hits(&conn).unwrap(), 0);
        assert_eq!(next_hit_sequence(&conn).unwrap(), 3);
    }

    #[test]
    fn test_head_is_lowest_sequence() {
        let mut conn = conn();
        insert_hits(&mut conn, 5, &[hit("a")]).unwrap();
        insert_hits(&mut conn, 6, &[hit("b")]).unwrap();

        let head = head_hit(&conn).unwrap().unwrap();
        assert_eq!(head.sequence, 5);
        assert_eq!(head.request_id, "a");
        assert_eq!(head.attempts, 0);

        assert!(delete_hit(&conn, 5).unwrap());
        assert!(!delete_hit(&conn, 5).unwrap());
        assert_eq!(head_hit(&conn).unwrap().unwrap().request_id, "b");
    }

    #[test]
    fn test_record_attempt() {
        let mut conn = conn();
        insert_hits(&mut conn, 1, &[hit("a")]).unwrap();
        assert!(record_hit_attempt(&conn, 1, "HTTP 503").unwrap());

        let head = head_hit(&conn).unwrap().unwrap();
        assert_eq!(head.attempts, 1);
        assert_eq!(head.last_error.as_deref(), Some("HTTP 503"));
        assert!(head.last_attempt_at.is_some());
    }

    #[test]
    fn test_release_held_events_in_arrival_order() {
        let mut conn = conn();
        insert_held_event(&conn, &hit("first")).unwrap();
        insert_held_event(&conn, &hit("second")).unwrap();

        let released = release_held_events(&mut conn, 10).unwrap();
        assert_eq!(released.len(), 2);
        assert!(list_held_events(&conn).unwrap().is_empty());

        let hits = list_hits(&conn).unwrap();
        assert_eq!(hits[0].sequence, 10);
        assert_eq!(hits[0].request_id, "first");
        assert_eq!(hits[1].sequence, 11);
        assert_eq!(next_hit_sequence(&conn).unwrap(), 12);
    }

    #[test]
    fn test_release_nothing_held() {
        let mut conn = conn();
        assert!(release_held_events(&mut conn, 1).unwrap().is_empty());
        assert_eq!(next_hit_sequence(&conn).unwrap(), 1);
    }

    #[test]
    fn test_store_payload_expiry() {
        let mut conn = conn();
        let live = StorePayloadRecord {
            key: "live".to_string(),
            value: "v".to_string(),
            max_age: 600,
            expires_at: 2_000,
            attrs: None,
        };
        let stale = StorePayloadRecord {
            key: "stale".to_string(),
            expires_at: 1_000,
            ..live.clone()
        };
        apply_store_payloads(&mut conn, &[live.clone(), stale], &[]).unwrap();

        let records = live_store_payloads(&mut conn, 1_500).unwrap();
        assert_eq!(records, vec![live]);

        apply_store_payloads(&mut conn, &[], &["live".to_string()]).unwrap();
        assert!(live_store_payloads(&mut conn, 0).unwrap().is_empty());
    }

    #[test]
    fn test_reset_identities() {
        let mut conn = conn();
        apply_store_payloads(
            &mut conn,
            &[StorePayloadRecord {
                key: "k".to_string(),
                value: "v".to_string(),
                max_age: 10,
                expires_at: i64::MAX,
                attrs: None,
            }],
            &[],
        )
        .unwrap();
        set_location_hint(
            &conn,
            &LocationHintRecord {
                hint: "or2".to_string(),
                expires_at: i64::MAX,
            },
        )
        .unwrap();

        assert_eq!(reset_identities(&mut conn, 42).unwrap(), 1);
        assert!(live_store_payloads(&mut conn, 0).unwrap().is_empty());
        assert!(get_location_hint(&conn).unwrap().is_none());
        assert_eq!(last_reset_at(&conn).unwrap(), Some(42));
    }

    #[test]
    fn test_state_roundtrip() {
        let conn = conn();
        assert!(get_state(&conn, "x").unwrap().is_none());
        set_state(&conn, "x", "1").unwrap();
        set_state(&conn, "x", "2").unwrap();
        assert_eq!(get_state(&conn, "x").unwrap().as_deref(), Some("2"));
        assert!(delete_state(&conn, "x").unwrap());
    }
}
