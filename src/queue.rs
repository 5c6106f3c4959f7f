// ABOUTME: Durable message queue backed by a single PostgreSQL table
// ABOUTME: Claims FIFO batches with FOR UPDATE SKIP LOCKED, retries with exponential backoff

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_postgres::Client;

use crate::config::PubSubConfig;

/// Re-claim deadline written when a batch is claimed. If the claiming process
/// dies mid-drain, another instance may pick the rows up again after this
/// long.
const VISIBILITY_DEADLINE: &str = "5 minutes";

/// A claimed queue row, ready for decoding.
#[derive(Debug, Clone)]
pub struct QueueRow {
    pub id: i64,
    pub channel: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub retry_count: i32,
}

/// Per-status row counts for introspection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub processed: i64,
    pub failed: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.processed + self.failed
    }
}

/// The DB-backed FIFO queue.
///
/// All writes into the queue come from the generated triggers; this service
/// owns setup, batch claiming, outcome marking, and TTL cleanup.
pub struct QueueService {
    client: Arc<Client>,
    relation: String,
    table: String,
    channel: String,
    batch_size: i64,
    max_retries: i32,
    message_ttl: Duration,
    cleanup_interval: Duration,
}

impl QueueService {
    pub fn new(client: Arc<Client>, config: &PubSubConfig) -> Self {
        Self {
            client,
            relation: config.queue_relation(),
            table: config.queue_table.clone(),
            channel: config.channel().to_string(),
            batch_size: config.batch_size,
            max_retries: config.max_retries,
            message_ttl: config.message_ttl,
            cleanup_interval: config.cleanup_interval,
        }
    }

    /// Idempotently create the queue table and its secondary indexes.
    ///
    /// Structural errors here (permission denied, invalid schema) are fatal
    /// and propagate to the caller.
    pub async fn setup(&self) -> Result<()> {
        let ddl = setup_sql(&self.relation, &self.table);
        self.client
            .batch_execute(&ddl)
            .await
            .with_context(|| format!("Failed to create queue table {}", self.relation))?;
        tracing::debug!("Queue table {} is ready", self.relation);
        Ok(())
    }

    /// Atomically claim the next batch of deliverable messages.
    ///
    /// Eligible rows are `pending`, plus `failed` rows whose retry budget is
    /// not exhausted and whose backoff deadline has passed. The claim is a
    /// single statement: the `FOR UPDATE SKIP LOCKED` inner select lets
    /// concurrent instances each take a disjoint batch without blocking, and
    /// claimed rows get a defensive re-claim deadline so they resurface if
    /// this process dies mid-drain.
    pub async fn fetch_pending_messages(&self) -> Result<Vec<QueueRow>> {
        let rows = self
            .client
            .query(
                &claim_sql(&self.relation),
                &[&self.channel, &self.max_retries, &self.batch_size],
            )
            .await
            .with_context(|| format!("Failed to claim a batch from {}", self.relation))?;

        let mut messages: Vec<QueueRow> = rows
            .iter()
            .map(|row| QueueRow {
                id: row.get(0),
                channel: row.get(1),
                payload: row.get(2),
                created_at: row.get(3),
                retry_count: row.get(4),
            })
            .collect();
        // UPDATE ... RETURNING does not promise an order; restore it here.
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    /// Mark messages as successfully processed.
    ///
    /// Already-processed ids are left untouched, so acknowledging twice is a
    /// no-op.
    pub async fn mark_processed(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let updated = self
            .client
            .execute(
                &format!(
                    "UPDATE {} SET status = 'processed', processed_at = now() \
                     WHERE id = ANY($1) AND status <> 'processed'",
                    self.relation
                ),
                &[&ids],
            )
            .await
            .with_context(|| format!("Failed to mark {} message(s) processed", ids.len()))?;
        Ok(updated)
    }

    /// Mark messages as failed and schedule their retry.
    ///
    /// `retry_count` increments and the next attempt backs off exponentially:
    /// `now + 1 minute * 2^retry_count`. Once the retry budget is exhausted
    /// `next_retry_at` goes NULL and the row waits for TTL cleanup. The
    /// exponent is capped so the interval arithmetic cannot overflow.
    pub async fn mark_failed(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let updated = self
            .client
            .execute(&fail_sql(&self.relation), &[&ids, &self.max_retries])
            .await
            .with_context(|| format!("Failed to mark {} message(s) failed", ids.len()))?;
        tracing::debug!("Marked {} message(s) failed", updated);
        Ok(updated)
    }

    /// Delete rows past their TTL: processed rows older than the TTL, and
    /// retry-exhausted failures whose original insert is older than the TTL.
    pub async fn cleanup(&self) -> Result<u64> {
        let ttl_secs = self.message_ttl.as_secs_f64();
        let deleted = self
            .client
            .execute(&cleanup_sql(&self.relation), &[&ttl_secs, &self.max_retries])
            .await
            .with_context(|| format!("Failed to clean up {}", self.relation))?;
        Ok(deleted)
    }

    /// Current per-status row counts.
    pub async fn stats(&self) -> Result<QueueStats> {
        let rows = self
            .client
            .query(
                &format!("SELECT status, COUNT(*) FROM {} GROUP BY status", self.relation),
                &[],
            )
            .await
            .context("Failed to read queue stats")?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.get(0);
            let count: i64 = row.get(1);
            match status.as_str() {
                "pending" => stats.pending = count,
                "processing" => stats.processing = count,
                "processed" => stats.processed = count,
                "failed" => stats.failed = count,
                other => tracing::warn!("Unexpected queue status '{}' ({} rows)", other, count),
            }
        }
        Ok(stats)
    }

    /// Start the periodic TTL cleanup task. Stops when `shutdown` flips to
    /// true.
    pub fn spawn_cleanup_timer(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval fires immediately; consume the first tick so cleanup
            // runs a full period after startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match queue.cleanup().await {
                            Ok(deleted) if deleted > 0 => {
                                tracing::info!("Queue cleanup deleted {} row(s)", deleted);
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::warn!("Queue cleanup failed: {}", e);
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::debug!("Queue cleanup timer stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

fn setup_sql(relation: &str, table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {relation} (
    id            BIGSERIAL PRIMARY KEY,
    channel       TEXT NOT NULL,
    payload       JSONB NOT NULL,
    created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
    processed_at  TIMESTAMPTZ,
    retry_count   INTEGER NOT NULL DEFAULT 0,
    next_retry_at TIMESTAMPTZ,
    status        TEXT NOT NULL DEFAULT 'pending'
);
CREATE INDEX IF NOT EXISTS {table}_status_idx ON {relation} (status);
CREATE INDEX IF NOT EXISTS {table}_channel_idx ON {relation} (channel);
CREATE INDEX IF NOT EXISTS {table}_next_retry_at_idx ON {relation} (next_retry_at);"
    )
}

fn claim_sql(relation: &str) -> String {
    format!(
        "WITH next AS (
    SELECT id
    FROM {relation}
    WHERE channel = $1
      AND (status = 'pending'
           OR (status = 'failed' AND retry_count < $2 AND next_retry_at <= now())
           OR (status = 'processing' AND next_retry_at <= now()))
    ORDER BY id ASC
    LIMIT $3
    FOR UPDATE SKIP LOCKED
)
UPDATE {relation} q
SET status = 'processing',
    next_retry_at = now() + interval '{VISIBILITY_DEADLINE}'
FROM next
WHERE q.id = next.id
RETURNING q.id, q.channel, q.payload, q.created_at, q.retry_count"
    )
}

fn fail_sql(relation: &str) -> String {
    format!(
        "UPDATE {relation}
SET status = 'failed',
    retry_count = retry_count + 1,
    next_retry_at = CASE
        WHEN retry_count + 1 >= $2 THEN NULL
        ELSE now() + interval '1 minute' * power(2, LEAST(retry_count + 1, 30))
    END
WHERE id = ANY($1)"
    )
}

fn cleanup_sql(relation: &str) -> String {
    format!(
        "DELETE FROM {relation}
WHERE (status = 'processed' AND processed_at < now() - make_interval(secs => $1))
   OR (status = 'failed' AND retry_count >= $2 AND created_at < now() - make_interval(secs => $1))"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const REL: &str = "\"public\".\"pg_pubsub_queue\"";

    #[test]
    fn test_claim_sql_shape() {
        let sql = claim_sql(REL);
        assert!(sql.contains("FOR UPDATE SKIP LOCKED"));
        assert!(sql.contains("ORDER BY id ASC"));
        assert!(sql.contains("status = 'pending'"));
        assert!(sql.contains("retry_count < $2"));
        assert!(sql.contains("next_retry_at <= now()"));
        assert!(sql.contains("interval '5 minutes'"));
        // Expired visibility deadlines make processing rows re-claimable.
        assert!(sql.contains("status = 'processing' AND next_retry_at <= now()"));
    }

    #[test]
    fn test_fail_sql_backoff() {
        let sql = fail_sql(REL);
        assert!(sql.contains("retry_count = retry_count + 1"));
        assert!(sql.contains("WHEN retry_count + 1 >= $2 THEN NULL"));
        assert!(sql.contains("interval '1 minute' * power(2, LEAST(retry_count + 1, 30))"));
    }

    #[test]
    fn test_cleanup_sql_predicate() {
        let sql = cleanup_sql(REL);
        assert!(sql.contains("status = 'processed' AND processed_at <"));
        assert!(sql.contains("status = 'failed' AND retry_count >= $2 AND created_at <"));
    }

    #[test]
    fn test_setup_sql_indexes() {
        let sql = setup_sql(REL, "pg_pubsub_queue");
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS"));
        assert!(sql.contains("pg_pubsub_queue_status_idx"));
        assert!(sql.contains("pg_pubsub_queue_channel_idx"));
        assert!(sql.contains("pg_pubsub_queue_next_retry_at_idx"));
        assert!(sql.contains("BIGSERIAL PRIMARY KEY"));
    }

    #[test]
    fn test_stats_total() {
        let stats = QueueStats {
            pending: 2,
            processing: 1,
            processed: 10,
            failed: 3,
        };
        assert_eq!(stats.total(), 16);
    }
}
