// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Durable overflow queue backed by SQLite.
//
// Requests that cannot be admitted within the bounded wait are serialized
// here and completed in the background. Delivery is at-least-once: receiving
// a message leases it for a fixed duration, and a message that is not
// acknowledged before the lease expires becomes visible again. Consumers
// must therefore be idempotent — Stempel's are, because every run overwrites
// the same deterministic destination.

use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, params};
use tracing::{debug, info, instrument};

use stempel_core::error::{Result, StempelError};
use stempel_core::types::DeferredRequest;

/// SQLite schema for the overflow table.
const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS overflow (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        payload TEXT NOT NULL,
        enqueued_at TEXT NOT NULL,
        available_at INTEGER NOT NULL,
        deliveries INTEGER NOT NULL DEFAULT 0
    )
"#;

/// One leased delivery from the queue.
///
/// The payload is raw text: decoding happens at the consumer so that a
/// malformed record can be dropped permanently instead of poisoning
/// redelivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverflowMessage {
    /// Row ID, used to acknowledge or discard the message.
    pub id: i64,
    /// How many times this message has been delivered, this one included.
    pub deliveries: u32,
    /// The serialized [`DeferredRequest`].
    pub payload: String,
}

impl OverflowMessage {
    /// Decode the payload. A failure here is terminal for the message:
    /// redelivering the same bytes cannot make them parse.
    pub fn decode(&self) -> Result<DeferredRequest> {
        serde_json::from_str(&self.payload)
            .map_err(|err| StempelError::MalformedMessage(err.to_string()))
    }
}

/// Durable at-least-once buffer for deferred watermark requests.
///
/// All methods are synchronous because `rusqlite` does not support async
/// natively. In an async context, wrap calls in `tokio::task::spawn_blocking`.
pub struct OverflowQueue {
    /// The open SQLite connection.
    conn: Connection,
}

impl OverflowQueue {
    /// Open (or create) the overflow database at the given path.
    ///
    /// Applies WAL journal mode so the worker's reads coexist with enqueues
    /// from request handlers, and creates the table if it does not exist.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| StempelError::Database(format!("open: {e}")))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StempelError::Database(format!("WAL pragma: {e}")))?;

        conn.execute_batch(CREATE_TABLE_SQL)
            .map_err(|e| StempelError::Database(format!("create table: {e}")))?;

        info!("overflow queue database opened");
        Ok(Self { conn })
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StempelError::Database(format!("open in-memory: {e}")))?;

        conn.execute_batch(CREATE_TABLE_SQL)
            .map_err(|e| StempelError::Database(format!("create table: {e}")))?;

        debug!("in-memory overflow queue opened");
        Ok(Self { conn })
    }

    /// Serialize a deferred request onto the queue.
    #[instrument(skip(self, request), fields(source = %request.source_name))]
    pub fn enqueue(&self, request: &DeferredRequest) -> Result<i64> {
        let payload = serde_json::to_string(request)?;
        self.enqueue_raw(&payload)
    }

    /// Enqueue a raw payload. Decoding is deferred to the consumer.
    pub(crate) fn enqueue_raw(&self, payload: &str) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO overflow (payload, enqueued_at, available_at, deliveries)
                 VALUES (?1, ?2, ?3, 0)",
                params![payload, Utc::now().to_rfc3339(), now_millis()],
            )
            .map_err(|e| StempelError::Database(format!("enqueue: {e}")))?;

        let id = self.conn.last_insert_rowid();
        info!(message_id = id, "request deferred to overflow queue");
        Ok(id)
    }

    /// Receive the oldest available message, leasing it for `lease`.
    ///
    /// The message stays in the table; only its visibility moves into the
    /// future. If the consumer never acknowledges it — a crash, a transform
    /// failure — the lease expires and the message is delivered again.
    #[instrument(skip(self))]
    pub fn receive(&self, lease: Duration) -> Result<Option<OverflowMessage>> {
        let now = now_millis();

        let row = self
            .conn
            .query_row(
                "SELECT id, payload, deliveries FROM overflow
                 WHERE available_at <= ?1 ORDER BY id ASC LIMIT 1",
                params![now],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StempelError::Database(format!("receive: {other}"))),
            })?;

        let Some((id, payload, deliveries)) = row else {
            return Ok(None);
        };

        let visible_again = now + lease.as_millis() as i64;
        self.conn
            .execute(
                "UPDATE overflow SET available_at = ?1, deliveries = deliveries + 1
                 WHERE id = ?2",
                params![visible_again, id],
            )
            .map_err(|e| StempelError::Database(format!("lease: {e}")))?;

        let message = OverflowMessage {
            id,
            deliveries: deliveries + 1,
            payload,
        };
        debug!(
            message_id = message.id,
            deliveries = message.deliveries,
            "overflow message leased"
        );
        Ok(Some(message))
    }

    /// Remove a successfully processed message.
    #[instrument(skip(self))]
    pub fn acknowledge(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM overflow WHERE id = ?1", params![id])
            .map_err(|e| StempelError::Database(format!("acknowledge: {e}")))?;
        debug!(message_id = id, "overflow message acknowledged");
        Ok(())
    }

    /// Permanently drop a message that can never be processed (malformed
    /// payload). Same row deletion as [`acknowledge`], logged as a drop.
    #[instrument(skip(self))]
    pub fn discard(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM overflow WHERE id = ?1", params![id])
            .map_err(|e| StempelError::Database(format!("discard: {e}")))?;
        info!(message_id = id, "overflow message discarded");
        Ok(())
    }

    /// Number of messages in the queue, leased or not.
    pub fn pending_count(&self) -> Result<u32> {
        self.conn
            .query_row("SELECT COUNT(*) FROM overflow", [], |row| row.get(0))
            .map_err(|e| StempelError::Database(format!("count: {e}")))
    }
}

/// Current wall-clock time in milliseconds since the epoch, for visibility
/// comparisons.
fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_request() -> DeferredRequest {
        DeferredRequest {
            source_name: "report.pdf".into(),
            overlay_text: "CONFIDENTIAL".into(),
        }
    }

    #[test]
    fn enqueue_and_receive_round_trip() {
        let queue = OverflowQueue::open_in_memory().expect("open in-memory db");
        queue.enqueue(&test_request()).expect("enqueue");

        let message = queue
            .receive(Duration::from_secs(60))
            .expect("receive")
            .expect("message available");
        assert_eq!(message.deliveries, 1);

        let decoded: DeferredRequest =
            serde_json::from_str(&message.payload).expect("payload decodes");
        assert_eq!(decoded, test_request());
    }

    #[test]
    fn empty_queue_returns_none() {
        let queue = OverflowQueue::open_in_memory().expect("open in-memory db");
        assert!(queue.receive(Duration::from_secs(60)).expect("receive").is_none());
    }

    #[test]
    fn leased_message_is_invisible_until_expiry() {
        let queue = OverflowQueue::open_in_memory().expect("open in-memory db");
        queue.enqueue(&test_request()).expect("enqueue");

        let first = queue
            .receive(Duration::from_secs(60))
            .expect("receive")
            .expect("message");
        assert!(
            queue
                .receive(Duration::from_secs(60))
                .expect("receive")
                .is_none(),
            "leased message must not be redelivered early"
        );
        queue.acknowledge(first.id).expect("acknowledge");
    }

    #[test]
    fn unacknowledged_message_is_redelivered() {
        let queue = OverflowQueue::open_in_memory().expect("open in-memory db");
        queue.enqueue(&test_request()).expect("enqueue");

        let first = queue
            .receive(Duration::ZERO)
            .expect("receive")
            .expect("message");
        // Zero lease: visible again immediately, simulating expiry.
        let second = queue
            .receive(Duration::from_secs(60))
            .expect("receive")
            .expect("redelivered");

        assert_eq!(first.id, second.id);
        assert_eq!(second.deliveries, 2);
        assert_eq!(second.payload, first.payload);
    }

    #[test]
    fn acknowledged_message_is_gone() {
        let queue = OverflowQueue::open_in_memory().expect("open in-memory db");
        queue.enqueue(&test_request()).expect("enqueue");

        let message = queue
            .receive(Duration::ZERO)
            .expect("receive")
            .expect("message");
        queue.acknowledge(message.id).expect("acknowledge");

        assert!(queue.receive(Duration::ZERO).expect("receive").is_none());
        assert_eq!(queue.pending_count().expect("count"), 0);
    }

    #[test]
    fn discard_removes_malformed_payloads() {
        let queue = OverflowQueue::open_in_memory().expect("open in-memory db");
        queue.enqueue_raw("this is not json").expect("enqueue raw");

        let message = queue
            .receive(Duration::ZERO)
            .expect("receive")
            .expect("message");
        assert!(matches!(
            message.decode(),
            Err(StempelError::MalformedMessage(_))
        ));

        queue.discard(message.id).expect("discard");
        assert_eq!(queue.pending_count().expect("count"), 0);
    }

    #[test]
    fn messages_are_delivered_oldest_first() {
        let queue = OverflowQueue::open_in_memory().expect("open in-memory db");
        queue
            .enqueue(&DeferredRequest {
                source_name: "first.pdf".into(),
                overlay_text: "A".into(),
            })
            .expect("enqueue");
        queue
            .enqueue(&DeferredRequest {
                source_name: "second.pdf".into(),
                overlay_text: "B".into(),
            })
            .expect("enqueue");

        let message = queue
            .receive(Duration::from_secs(60))
            .expect("receive")
            .expect("message");
        let decoded: DeferredRequest = serde_json::from_str(&message.payload).expect("decode");
        assert_eq!(decoded.source_name, "first.pdf");
    }

    #[test]
    fn queue_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("overflow.db");

        {
            let queue = OverflowQueue::open(&path).expect("open");
            queue.enqueue(&test_request()).expect("enqueue");
        }

        let queue = OverflowQueue::open(&path).expect("reopen");
        assert_eq!(queue.pending_count().expect("count"), 1);
        let message = queue
            .receive(Duration::from_secs(60))
            .expect("receive")
            .expect("message survived restart");
        let decoded: DeferredRequest = serde_json::from_str(&message.payload).expect("decode");
        assert_eq!(decoded, test_request());
    }
}
