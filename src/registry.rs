// ABOUTME: Handler registration and startup discovery - merges registrations per table
// ABOUTME: Builds table descriptors from the catalog and the per-table handler fan-out lists

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio_postgres::Client;

use crate::config::PubSubConfig;
use crate::event::{EventKind, EventMask, TableChanges};
use crate::mapping::TableDescriptor;
use crate::postgres::validate_pg_identifier;

/// Collector for per-id delivery failures reported by handlers.
///
/// A handler that could not apply some of its messages reports their queue
/// row ids here; everything not reported is acknowledged as processed after
/// the drain. Shared across all handlers of a batch, so reports are unioned.
#[derive(Debug, Default)]
pub struct FailureSink {
    failed: Mutex<BTreeSet<i64>>,
}

impl FailureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the given queue row ids as failed for this drain.
    pub fn report(&self, ids: &[i64]) {
        let mut failed = self.failed.lock().unwrap();
        failed.extend(ids.iter().copied());
    }

    /// Ids reported so far, ascending.
    pub fn failed_ids(&self) -> Vec<i64> {
        self.failed.lock().unwrap().iter().copied().collect()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.failed.lock().unwrap().contains(&id)
    }
}

/// User-supplied consumer of change events for one table.
///
/// Handlers must be idempotent: delivery is at-least-once, and a message may
/// be redelivered after a crash or a reported failure. Returning an error
/// without reporting ids through the sink does not fail the batch by default;
/// see `treat_unhandled_handler_errors_as_failures`.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn process(&self, changes: &TableChanges, failures: &FailureSink) -> Result<()>;
}

/// One handler registration before merging.
#[derive(Clone)]
pub struct HandlerRegistration {
    pub(crate) table: String,
    pub(crate) schema: Option<String>,
    pub(crate) events: Option<EventMask>,
    pub(crate) payload_fields: Option<Vec<String>>,
    pub(crate) property_overrides: Vec<(String, String)>,
    pub(crate) handler: Arc<dyn ChangeHandler>,
}

impl HandlerRegistration {
    pub fn new(table: impl Into<String>, handler: Arc<dyn ChangeHandler>) -> Self {
        Self {
            table: table.into(),
            schema: None,
            events: None,
            payload_fields: None,
            property_overrides: Vec::new(),
            handler,
        }
    }

    /// Override the configured default schema for this table.
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Restrict which events this registration wants. Unset means all three.
    pub fn events(mut self, events: &[EventKind]) -> Self {
        self.events = Some(EventMask::from_events(events));
        self
    }

    /// Restrict the trigger payload to these properties. Unset means the
    /// whole row.
    pub fn payload_fields(mut self, fields: &[&str]) -> Self {
        self.payload_fields = Some(fields.iter().map(|f| (*f).to_string()).collect());
        self
    }

    /// Map a database column to a property name, overriding the default
    /// snake_case-to-camelCase derivation.
    pub fn map_column(mut self, column: impl Into<String>, property: impl Into<String>) -> Self {
        self.property_overrides.push((column.into(), property.into()));
        self
    }
}

/// Accumulates handler registrations until discovery runs at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    registrations: Vec<HandlerRegistration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, registration: HandlerRegistration) {
        self.registrations.push(registration);
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn registrations(&self) -> &[HandlerRegistration] {
        &self.registrations
    }
}

/// Merged registration state for one table.
#[derive(Clone)]
pub struct TableListener {
    pub schema: String,
    pub table: String,
    /// Union of the event masks of every registration
    pub events: EventMask,
    /// Union of requested payload properties; `None` once any registration
    /// asked for the whole row
    pub payload_fields: Option<Vec<String>>,
    /// Handlers in registration order
    pub handlers: Vec<Arc<dyn ChangeHandler>>,
}

/// The read-only result of startup discovery.
pub struct Discovery {
    /// table name -> descriptor
    pub tables: BTreeMap<String, TableDescriptor>,
    /// table name -> merged listener record
    pub listeners: BTreeMap<String, TableListener>,
}

impl Discovery {
    pub fn descriptor(&self, table: &str) -> Option<&TableDescriptor> {
        self.tables.get(table)
    }

    pub fn listener(&self, table: &str) -> Option<&TableListener> {
        self.listeners.get(table)
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

/// Merge raw registrations into per-table listener records.
///
/// Schema falls back to the configured default; event masks and payload
/// fields are set-unioned; handler fan-out order follows registration order.
/// Two registrations naming different explicit schemas for the same table are
/// a configuration error.
pub(crate) fn merge_registrations(
    default_schema: &str,
    registrations: &[HandlerRegistration],
) -> Result<BTreeMap<String, TableListener>> {
    let mut merged: BTreeMap<String, TableListener> = BTreeMap::new();
    // Track which tables already saw a full-row registration.
    let mut wants_full_row: BTreeSet<String> = BTreeSet::new();

    for registration in registrations {
        let schema = registration
            .schema
            .clone()
            .unwrap_or_else(|| default_schema.to_string());
        let events = registration.events.unwrap_or(EventMask::ALL);

        match merged.get_mut(&registration.table) {
            Some(listener) => {
                if listener.schema != schema {
                    bail!(
                        "Conflicting schemas for table '{}': '{}' vs '{}'",
                        registration.table,
                        listener.schema,
                        schema
                    );
                }
                listener.events = listener.events.union(events);
                if registration.payload_fields.is_none() {
                    wants_full_row.insert(registration.table.clone());
                    listener.payload_fields = None;
                } else if !wants_full_row.contains(&registration.table) {
                    let mut fields: BTreeSet<String> = listener
                        .payload_fields
                        .take()
                        .unwrap_or_default()
                        .into_iter()
                        .collect();
                    fields.extend(registration.payload_fields.clone().unwrap());
                    listener.payload_fields = Some(fields.into_iter().collect());
                }
                listener.handlers.push(registration.handler.clone());
            }
            None => {
                if registration.payload_fields.is_none() {
                    wants_full_row.insert(registration.table.clone());
                }
                let payload_fields = registration.payload_fields.clone().map(|fields| {
                    let set: BTreeSet<String> = fields.into_iter().collect();
                    set.into_iter().collect()
                });
                merged.insert(
                    registration.table.clone(),
                    TableListener {
                        schema,
                        table: registration.table.clone(),
                        events,
                        payload_fields,
                        handlers: vec![registration.handler.clone()],
                    },
                );
            }
        }
    }

    Ok(merged)
}

/// Run discovery: merge registrations and load each target's column metadata
/// from the catalog.
///
/// Fails fast with the offending target name when a registered table does not
/// exist, so misconfiguration is caught at startup rather than at the first
/// change event.
pub async fn discover(
    client: &Client,
    config: &PubSubConfig,
    registry: &HandlerRegistry,
) -> Result<Discovery> {
    let listeners = merge_registrations(&config.trigger_schema, registry.registrations())?;

    // Collect property overrides per table across all registrations.
    let mut overrides: HashMap<String, Vec<(String, String)>> = HashMap::new();
    for registration in registry.registrations() {
        overrides
            .entry(registration.table.clone())
            .or_default()
            .extend(registration.property_overrides.clone());
    }

    let mut tables = BTreeMap::new();
    for listener in listeners.values() {
        validate_pg_identifier(&listener.table)?;
        validate_pg_identifier(&listener.schema)?;

        let rows = client
            .query(
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 \
                 ORDER BY ordinal_position",
                &[&listener.schema, &listener.table],
            )
            .await
            .with_context(|| {
                format!(
                    "Failed to load column metadata for {}.{}",
                    listener.schema, listener.table
                )
            })?;

        if rows.is_empty() {
            bail!(
                "No table metadata found for target '{}.{}'. \
                 Registered tables must exist before the engine starts.",
                listener.schema,
                listener.table
            );
        }

        let columns: Vec<String> = rows.iter().map(|row| row.get(0)).collect();
        for column in &columns {
            validate_pg_identifier(column).with_context(|| {
                format!(
                    "Table {}.{} has a column unusable in generated SQL",
                    listener.schema, listener.table
                )
            })?;
        }

        let table_overrides = overrides.remove(&listener.table).unwrap_or_default();
        tables.insert(
            listener.table.clone(),
            TableDescriptor::new(&listener.schema, &listener.table, columns, &table_overrides),
        );
    }

    tracing::info!(
        "Discovery complete: {} table(s), {} handler registration(s)",
        tables.len(),
        registry.registrations().len()
    );

    Ok(Discovery { tables, listeners })
}
