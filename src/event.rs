// ABOUTME: Typed change events - wire payload written by triggers and decoded messages
// ABOUTME: Also defines the event mask and the per-table grouped view handed to handlers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of row-level change captured by a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

impl EventKind {
    /// SQL event name as used in `CREATE TRIGGER ... AFTER <event>`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            EventKind::Insert => "INSERT",
            EventKind::Update => "UPDATE",
            EventKind::Delete => "DELETE",
        }
    }
}

/// Which change events a listener wants for a table.
///
/// Masks from multiple registrations on the same table are unioned. An
/// unspecified mask means the full set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask {
    pub insert: bool,
    pub update: bool,
    pub delete: bool,
}

impl EventMask {
    pub const ALL: EventMask = EventMask {
        insert: true,
        update: true,
        delete: true,
    };

    /// Build a mask from a list of event kinds.
    pub fn from_events(events: &[EventKind]) -> Self {
        let mut mask = EventMask {
            insert: false,
            update: false,
            delete: false,
        };
        for event in events {
            match event {
                EventKind::Insert => mask.insert = true,
                EventKind::Update => mask.update = true,
                EventKind::Delete => mask.delete = true,
            }
        }
        mask
    }

    pub fn union(self, other: EventMask) -> EventMask {
        EventMask {
            insert: self.insert || other.insert,
            update: self.update || other.update,
            delete: self.delete || other.delete,
        }
    }

    pub fn contains(&self, event: EventKind) -> bool {
        match event {
            EventKind::Insert => self.insert,
            EventKind::Update => self.update,
            EventKind::Delete => self.delete,
        }
    }

    /// Enabled events in INSERT, UPDATE, DELETE order.
    pub fn events(&self) -> Vec<EventKind> {
        let mut events = Vec::with_capacity(3);
        if self.insert {
            events.push(EventKind::Insert);
        }
        if self.update {
            events.push(EventKind::Update);
        }
        if self.delete {
            events.push(EventKind::Delete);
        }
        events
    }
}

/// Queue payload exactly as the generated trigger wrote it.
///
/// The `id` field is a uuid generated inside the trigger function and only
/// guarantees payload uniqueness; after decoding it is discarded in favor of
/// the queue row id, which carries the ordering guarantee.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WirePayload {
    pub id: Value,
    pub event: EventKind,
    pub schema: String,
    pub table: String,
    pub data: Value,
}

/// Wire shape of `data` for UPDATE events.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WireUpdateData {
    pub new: Value,
    pub old: Value,
}

/// Delivery bookkeeping attached to each decoded message.
#[derive(Debug, Clone, Copy)]
pub struct MessageMetadata {
    /// Failed delivery attempts so far
    pub retry_count: i32,
    /// When the trigger enqueued the change
    pub created_at: DateTime<Utc>,
}

/// Row data of a decoded change, with property-name keys.
#[derive(Debug, Clone)]
pub enum ChangeData {
    /// INSERT carries the new row; DELETE carries the pre-delete row.
    Row(Map<String, Value>),
    Update {
        new: Map<String, Value>,
        old: Map<String, Value>,
        /// Property names whose scalar value differs between `old` and `new`.
        /// Object- and array-typed values are never listed.
        updated_fields: Vec<String>,
    },
}

impl ChangeData {
    /// The row a consumer most commonly wants: `new` for INSERT/UPDATE, the
    /// captured row for DELETE.
    pub fn row(&self) -> &Map<String, Value> {
        match self {
            ChangeData::Row(row) => row,
            ChangeData::Update { new, .. } => new,
        }
    }
}

/// A fully decoded change message ready for dispatch.
#[derive(Debug, Clone)]
pub struct ChangeMessage {
    /// Queue row id; defines per-table delivery order
    pub id: i64,
    pub event: EventKind,
    pub schema: String,
    pub table: String,
    pub data: ChangeData,
    pub metadata: MessageMetadata,
}

/// All changes for one table within a single drain, in ascending id order.
///
/// Handlers receive the full batch plus per-event views so they can pick
/// whichever cut is convenient.
#[derive(Debug, Clone, Default)]
pub struct TableChanges {
    pub table: String,
    pub all: Vec<ChangeMessage>,
}

impl TableChanges {
    pub fn new(table: String, all: Vec<ChangeMessage>) -> Self {
        Self { table, all }
    }

    fn of_kind(&self, kind: EventKind) -> Vec<&ChangeMessage> {
        self.all.iter().filter(|m| m.event == kind).collect()
    }

    pub fn inserts(&self) -> Vec<&ChangeMessage> {
        self.of_kind(EventKind::Insert)
    }

    pub fn updates(&self) -> Vec<&ChangeMessage> {
        self.of_kind(EventKind::Update)
    }

    pub fn deletes(&self) -> Vec<&ChangeMessage> {
        self.of_kind(EventKind::Delete)
    }

    /// Queue row ids of every message in the batch.
    pub fn ids(&self) -> Vec<i64> {
        self.all.iter().map(|m| m.id).collect()
    }
}
