// ABOUTME: PostgreSQL-backed change-data-capture and pub/sub engine
// ABOUTME: Triggers capture row changes into a durable queue drained via LISTEN/NOTIFY

pub mod config;
pub mod event;
pub mod listener;
pub mod locks;
pub mod mapping;
pub mod postgres;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod service;
pub mod triggers;

pub use config::{PubSubConfig, ReconcileStrategy};
pub use event::{ChangeData, ChangeMessage, EventKind, EventMask, TableChanges};
pub use listener::{HybridListener, ListenerState};
pub use processor::DrainStats;
pub use queue::QueueStats;
pub use registry::{ChangeHandler, FailureSink, HandlerRegistration};
pub use service::{PubSub, PubSubHandle};
