// ABOUTME: Drain pipeline - decode claimed rows, remap to properties, diff updates
// ABOUTME: Groups per table in id order, fans out to handlers, partitions outcomes

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::event::{ChangeData, ChangeMessage, EventKind, MessageMetadata, TableChanges, WirePayload, WireUpdateData};
use crate::queue::{QueueRow, QueueService};
use crate::registry::{Discovery, FailureSink};

/// Counters from one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Rows claimed from the queue
    pub claimed: usize,
    /// Rows acknowledged as processed
    pub processed: usize,
    /// Rows marked failed (decode failures plus handler reports)
    pub failed: usize,
}

impl DrainStats {
    pub fn is_empty(&self) -> bool {
        self.claimed == 0
    }
}

/// Anything that can run one drain iteration. The hybrid listener drives a
/// `Drainer` on notifications and fallback ticks.
#[async_trait]
pub trait Drainer: Send + Sync {
    async fn drain(&self) -> Result<DrainStats>;
}

/// Turns claimed queue rows into typed change messages and drives the
/// registered handlers.
pub struct MessageProcessor {
    queue: Arc<QueueService>,
    discovery: Arc<Discovery>,
    treat_unhandled_as_failures: bool,
}

impl MessageProcessor {
    pub fn new(
        queue: Arc<QueueService>,
        discovery: Arc<Discovery>,
        treat_unhandled_as_failures: bool,
    ) -> Self {
        Self {
            queue,
            discovery,
            treat_unhandled_as_failures,
        }
    }

    /// One full drain: claim, decode, dispatch, mark.
    pub async fn drain(&self) -> Result<DrainStats> {
        let rows = self.queue.fetch_pending_messages().await?;
        if rows.is_empty() {
            return Ok(DrainStats::default());
        }
        let claimed: Vec<i64> = rows.iter().map(|row| row.id).collect();

        let sink = FailureSink::new();
        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            match decode_message(&self.discovery, row) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    // One undecodable message fails alone; the batch goes on.
                    tracing::warn!("Failed to decode queue message {}: {:#}", row.id, e);
                    sink.report(&[row.id]);
                }
            }
        }

        let groups = group_by_table(messages);
        dispatch(&self.discovery, &groups, &sink, self.treat_unhandled_as_failures).await;

        let failed = sink.failed_ids();
        let processed: Vec<i64> = claimed
            .iter()
            .copied()
            .filter(|id| !sink.contains(*id))
            .collect();

        self.queue.mark_failed(&failed).await?;
        self.queue.mark_processed(&processed).await?;

        let stats = DrainStats {
            claimed: claimed.len(),
            processed: processed.len(),
            failed: failed.len(),
        };
        tracing::debug!(
            "Drain complete: {} claimed, {} processed, {} failed",
            stats.claimed,
            stats.processed,
            stats.failed
        );
        Ok(stats)
    }
}

#[async_trait]
impl Drainer for MessageProcessor {
    async fn drain(&self) -> Result<DrainStats> {
        MessageProcessor::drain(self).await
    }
}

/// Decode one claimed row into a typed change message.
///
/// The uuid the trigger put in the payload is discarded here: the message id
/// becomes the queue row id, which is what ordering and retry accounting key
/// on. Row data is remapped from column names to property names when the
/// table has a descriptor; unknown tables pass through unmapped.
pub(crate) fn decode_message(discovery: &Discovery, row: &QueueRow) -> Result<ChangeMessage> {
    let wire: WirePayload = serde_json::from_value(row.payload.clone())
        .context("Payload is not a valid change event")?;
    let descriptor = discovery.descriptor(&wire.table);

    let remap = |value: &Value| -> Result<Map<String, Value>> {
        let Some(object) = value.as_object() else {
            bail!("Expected a row object, got {}", value);
        };
        Ok(match descriptor {
            Some(descriptor) => descriptor.remap_row(object),
            None => object.clone(),
        })
    };

    let data = match wire.event {
        EventKind::Insert | EventKind::Delete => ChangeData::Row(remap(&wire.data)?),
        EventKind::Update => {
            let update: WireUpdateData = serde_json::from_value(wire.data)
                .context("UPDATE payload is missing new/old rows")?;
            let new = remap(&update.new)?;
            let old = remap(&update.old)?;
            let updated_fields = updated_fields(&old, &new);
            ChangeData::Update {
                new,
                old,
                updated_fields,
            }
        }
    };

    Ok(ChangeMessage {
        id: row.id,
        event: wire.event,
        schema: wire.schema,
        table: wire.table,
        data,
        metadata: MessageMetadata {
            retry_count: row.retry_count,
            created_at: row.created_at,
        },
    })
}

/// Property names whose scalar value changed between `old` and `new`.
///
/// Object- and array-typed values are skipped on either side, so nested
/// structures never show up in the diff. JSON nulls count as scalars.
pub(crate) fn updated_fields(old: &Map<String, Value>, new: &Map<String, Value>) -> Vec<String> {
    let mut fields = Vec::new();
    for (key, new_value) in new {
        if new_value.is_object() || new_value.is_array() {
            continue;
        }
        match old.get(key) {
            Some(old_value) if old_value.is_object() || old_value.is_array() => continue,
            Some(old_value) if old_value == new_value => continue,
            _ => fields.push(key.clone()),
        }
    }
    fields
}

/// Sort messages by id and split them into per-table batches.
///
/// Within a batch handlers observe strictly ascending ids; across tables no
/// order is promised, so groups are emitted in table-name order.
pub(crate) fn group_by_table(mut messages: Vec<ChangeMessage>) -> Vec<TableChanges> {
    messages.sort_by_key(|message| message.id);

    let mut groups: std::collections::BTreeMap<String, Vec<ChangeMessage>> =
        std::collections::BTreeMap::new();
    for message in messages {
        groups.entry(message.table.clone()).or_default().push(message);
    }
    groups
        .into_iter()
        .map(|(table, all)| TableChanges::new(table, all))
        .collect()
}

/// Invoke every registered handler for each group, in discovery order.
///
/// A handler error that was not reported through the sink is logged and, by
/// default, its messages still count as processed for this handler; other
/// handlers in the fan-out see the batch regardless. Messages for tables
/// without a listener (possible briefly after a reconfiguration while an
/// obsolete trigger overlaps) are dropped as processed.
pub(crate) async fn dispatch(
    discovery: &Discovery,
    groups: &[TableChanges],
    sink: &FailureSink,
    treat_unhandled_as_failures: bool,
) {
    for changes in groups {
        let Some(listener) = discovery.listener(&changes.table) else {
            tracing::warn!(
                "Dropping {} message(s) for unregistered table '{}'",
                changes.all.len(),
                changes.table
            );
            continue;
        };
        for handler in &listener.handlers {
            if let Err(e) = handler.process(changes, sink).await {
                tracing::error!(
                    "Handler for table '{}' failed without reporting ids: {:#}",
                    changes.table,
                    e
                );
                if treat_unhandled_as_failures {
                    sink.report(&changes.ids());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::TableDescriptor;
    use crate::registry::{merge_registrations, ChangeHandler, HandlerRegistration};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn queue_row(id: i64, payload: Value) -> QueueRow {
        QueueRow {
            id,
            channel: "pubsub_trigger".into(),
            payload,
            created_at: Utc::now(),
            retry_count: 0,
        }
    }

    fn users_discovery(handlers: Vec<Arc<dyn ChangeHandler>>) -> Discovery {
        let registrations: Vec<HandlerRegistration> = handlers
            .into_iter()
            .map(|handler| HandlerRegistration::new("test_users", handler))
            .collect();
        let listeners = merge_registrations("public", &registrations).unwrap();
        let mut tables = BTreeMap::new();
        tables.insert(
            "test_users".to_string(),
            TableDescriptor::new(
                "public",
                "test_users",
                vec!["id".into(), "name".into(), "email".into(), "created_at".into()],
                &[],
            ),
        );
        Discovery { tables, listeners }
    }

    fn insert_payload(name: &str) -> Value {
        json!({
            "id": "5e0ad0c9-6fd8-4a27-9f5e-0d1e4b6c9a11",
            "event": "INSERT",
            "schema": "public",
            "table": "test_users",
            "data": {"id": 1, "name": name, "email": "test@example.com", "created_at": "2026-01-01T00:00:00Z"}
        })
    }

    #[test]
    fn test_updated_fields_scalar_diff() {
        let old = json!({"name": "Test User", "email": "test@example.com", "age": 30});
        let new = json!({"name": "Updated User", "email": "test@example.com", "age": 30});
        let fields = updated_fields(old.as_object().unwrap(), new.as_object().unwrap());
        assert_eq!(fields, vec!["name".to_string()]);
    }

    #[test]
    fn test_updated_fields_ignores_objects_and_arrays() {
        let old = json!({"profile": {"bio": "a"}, "tags": [1], "name": "x"});
        let new = json!({"profile": {"bio": "b"}, "tags": [2], "name": "x"});
        let fields = updated_fields(old.as_object().unwrap(), new.as_object().unwrap());
        assert!(fields.is_empty());
    }

    #[test]
    fn test_updated_fields_null_is_scalar() {
        let old = json!({"nickname": null});
        let new = json!({"nickname": "ada"});
        let fields = updated_fields(old.as_object().unwrap(), new.as_object().unwrap());
        assert_eq!(fields, vec!["nickname".to_string()]);
    }

    #[test]
    fn test_decode_insert_remaps_and_replaces_id() {
        let discovery = users_discovery(vec![]);
        let row = queue_row(42, insert_payload("Test User"));
        let message = decode_message(&discovery, &row).unwrap();
        assert_eq!(message.id, 42);
        assert_eq!(message.event, EventKind::Insert);
        assert_eq!(message.table, "test_users");
        // created_at remapped to camelCase
        assert!(message.data.row().contains_key("createdAt"));
        assert_eq!(message.data.row()["name"], json!("Test User"));
        assert_eq!(message.metadata.retry_count, 0);
    }

    #[test]
    fn test_decode_update_computes_diff() {
        let discovery = users_discovery(vec![]);
        let payload = json!({
            "id": "e7a7e2f3-9c1c-4f3a-8f6e-2a54f3d9b001",
            "event": "UPDATE",
            "schema": "public",
            "table": "test_users",
            "data": {
                "new": {"id": 1, "name": "Updated User", "email": "test@example.com"},
                "old": {"id": 1, "name": "Test User", "email": "test@example.com"}
            }
        });
        let message = decode_message(&discovery, &queue_row(7, payload)).unwrap();
        match &message.data {
            ChangeData::Update {
                new,
                old,
                updated_fields,
            } => {
                assert_eq!(updated_fields, &vec!["name".to_string()]);
                assert_eq!(new["name"], json!("Updated User"));
                assert_eq!(old["name"], json!("Test User"));
            }
            other => panic!("expected update data, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let discovery = users_discovery(vec![]);
        let row = queue_row(9, json!({"event": "NONSENSE"}));
        assert!(decode_message(&discovery, &row).is_err());
    }

    #[test]
    fn test_group_by_table_orders_by_id() {
        let message = |id: i64, table: &str| ChangeMessage {
            id,
            event: EventKind::Insert,
            schema: "public".into(),
            table: table.into(),
            data: ChangeData::Row(Map::new()),
            metadata: MessageMetadata {
                retry_count: 0,
                created_at: Utc::now(),
            },
        };
        let groups = group_by_table(vec![
            message(5, "b"),
            message(1, "a"),
            message(3, "b"),
            message(2, "a"),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].table, "a");
        assert_eq!(groups[0].ids(), vec![1, 2]);
        assert_eq!(groups[1].table, "b");
        assert_eq!(groups[1].ids(), vec![3, 5]);
    }

    struct RecordingHandler {
        seen: Mutex<Vec<i64>>,
        fail_ids: Vec<i64>,
    }

    #[async_trait]
    impl ChangeHandler for RecordingHandler {
        async fn process(&self, changes: &TableChanges, failures: &FailureSink) -> Result<()> {
            self.seen.lock().unwrap().extend(changes.ids());
            if !self.fail_ids.is_empty() {
                failures.report(&self.fail_ids);
            }
            Ok(())
        }
    }

    struct ErroringHandler;

    #[async_trait]
    impl ChangeHandler for ErroringHandler {
        async fn process(&self, _: &TableChanges, _: &FailureSink) -> Result<()> {
            bail!("boom")
        }
    }

    fn decoded(discovery: &Discovery, rows: Vec<QueueRow>) -> Vec<TableChanges> {
        let messages: Vec<ChangeMessage> = rows
            .iter()
            .map(|row| decode_message(discovery, row).unwrap())
            .collect();
        group_by_table(messages)
    }

    #[tokio::test]
    async fn test_dispatch_partitions_failures() {
        let recorder = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
            fail_ids: vec![2],
        });
        let discovery = users_discovery(vec![recorder.clone()]);
        let groups = decoded(
            &discovery,
            vec![
                queue_row(1, insert_payload("a")),
                queue_row(2, insert_payload("b")),
            ],
        );

        let sink = FailureSink::new();
        dispatch(&discovery, &groups, &sink, false).await;
        assert_eq!(sink.failed_ids(), vec![2]);
        assert_eq!(*recorder.seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_dispatch_unreported_error_is_processed_by_default() {
        let discovery = users_discovery(vec![Arc::new(ErroringHandler)]);
        let groups = decoded(&discovery, vec![queue_row(1, insert_payload("a"))]);

        let sink = FailureSink::new();
        dispatch(&discovery, &groups, &sink, false).await;
        assert!(sink.failed_ids().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_unreported_error_flag_marks_failed() {
        let discovery = users_discovery(vec![Arc::new(ErroringHandler)]);
        let groups = decoded(&discovery, vec![queue_row(1, insert_payload("a"))]);

        let sink = FailureSink::new();
        dispatch(&discovery, &groups, &sink, true).await;
        assert_eq!(sink.failed_ids(), vec![1]);
    }

    #[tokio::test]
    async fn test_dispatch_fans_out_to_all_handlers() {
        let first = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
            fail_ids: vec![],
        });
        let second = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
            fail_ids: vec![1],
        });
        let discovery = users_discovery(vec![first.clone(), second.clone()]);
        let groups = decoded(&discovery, vec![queue_row(1, insert_payload("a"))]);

        let sink = FailureSink::new();
        dispatch(&discovery, &groups, &sink, false).await;
        // Both handlers saw the message even though the second failed it.
        assert_eq!(*first.seen.lock().unwrap(), vec![1]);
        assert_eq!(*second.seen.lock().unwrap(), vec![1]);
        assert_eq!(sink.failed_ids(), vec![1]);
    }

    #[tokio::test]
    async fn test_dispatch_drops_unregistered_table() {
        let discovery = users_discovery(vec![]);
        let payload = json!({
            "id": "00000000-0000-0000-0000-000000000000",
            "event": "INSERT",
            "schema": "public",
            "table": "abandoned_table",
            "data": {"id": 1}
        });
        let groups = decoded(&discovery, vec![queue_row(1, payload)]);
        let sink = FailureSink::new();
        dispatch(&discovery, &groups, &sink, false).await;
        assert!(sink.failed_ids().is_empty());
    }
}
