// ABOUTME: Top-level engine wiring - discovery, queue setup, gated reconcile, listener start
// ABOUTME: PubSub builds the subsystems; PubSubHandle owns them until shutdown

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::PubSubConfig;
use crate::listener::HybridListener;
use crate::locks::AdvisoryLocks;
use crate::postgres::{connect_with_retry, sanitize_url};
use crate::processor::{DrainStats, MessageProcessor};
use crate::queue::{QueueService, QueueStats};
use crate::registry::{discover, HandlerRegistration, HandlerRegistry};
use crate::triggers::{ReconcileSummary, TriggerService, RECONCILE_LOCK_DURATION, RECONCILE_LOCK_KEY};

/// Builder for a running pub/sub engine: collect handler registrations, then
/// [`start`](PubSub::start).
pub struct PubSub {
    config: PubSubConfig,
    registry: HandlerRegistry,
}

impl PubSub {
    pub fn new(config: PubSubConfig) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
        }
    }

    /// Register a handler. Multiple registrations for the same table are
    /// merged at startup.
    pub fn register(&mut self, registration: HandlerRegistration) -> &mut Self {
        self.registry.register(registration);
        self
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    /// Start every subsystem:
    ///
    /// 1. validate config and connect
    /// 2. run discovery over the registrations (fails fast on unknown tables)
    /// 3. idempotently create the queue table and start the cleanup timer
    /// 4. reconcile triggers under the cross-instance advisory lock
    /// 5. start the hybrid listener, which performs the initial drain
    pub async fn start(self) -> Result<PubSubHandle> {
        self.config.validate()?;
        if self.registry.is_empty() {
            bail!("No handlers registered; nothing to listen for");
        }

        tracing::info!(
            "Starting pg-pubsub against {}",
            sanitize_url(&self.config.database_url)
        );
        let client = Arc::new(connect_with_retry(&self.config.database_url).await?);

        let discovery = Arc::new(discover(&client, &self.config, &self.registry).await?);

        let queue = Arc::new(QueueService::new(client.clone(), &self.config));
        queue.setup().await?;

        let locks = AdvisoryLocks::new(client.clone());
        let triggers = TriggerService::new(client.clone(), &self.config);
        let reconciled = locks
            .try_lock_then(RECONCILE_LOCK_KEY, Some(RECONCILE_LOCK_DURATION), || async {
                triggers.reconcile(&discovery).await
            })
            .await
            .context("Trigger reconciliation failed")?;
        if reconciled.is_none() {
            tracing::info!("Another instance is already updating PubSub triggers, skipping");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cleanup = queue.spawn_cleanup_timer(shutdown_rx);

        let processor = Arc::new(MessageProcessor::new(
            queue.clone(),
            discovery.clone(),
            self.config.treat_unhandled_handler_errors_as_failures,
        ));
        let listener = HybridListener::start(
            self.config.database_url.clone(),
            self.config.channel().to_string(),
            self.config.fallback_interval,
            processor.clone(),
        );

        Ok(PubSubHandle {
            listener,
            queue,
            processor,
            locks,
            shutdown: shutdown_tx,
            cleanup,
        })
    }

    /// One-shot trigger reconciliation without starting the listener.
    ///
    /// Used by the CLI and by deployments that install triggers out of band.
    pub async fn install_triggers(self) -> Result<Option<ReconcileSummary>> {
        self.config.validate()?;
        let client = Arc::new(connect_with_retry(&self.config.database_url).await?);
        let discovery = discover(&client, &self.config, &self.registry).await?;

        let queue = QueueService::new(client.clone(), &self.config);
        queue.setup().await?;

        let locks = AdvisoryLocks::new(client.clone());
        let triggers = TriggerService::new(client.clone(), &self.config);
        let summary = locks
            .try_lock_then(RECONCILE_LOCK_KEY, Some(RECONCILE_LOCK_DURATION), || async {
                triggers.reconcile(&discovery).await
            })
            .await?;
        if summary.is_none() {
            tracing::info!("Another instance is already updating PubSub triggers, skipping");
        }
        Ok(summary)
    }
}

/// A running engine. Dropping the handle does not stop the background tasks
/// cleanly; call [`shutdown`](PubSubHandle::shutdown).
pub struct PubSubHandle {
    listener: HybridListener,
    queue: Arc<QueueService>,
    processor: Arc<MessageProcessor>,
    locks: AdvisoryLocks,
    shutdown: watch::Sender<bool>,
    cleanup: JoinHandle<()>,
}

impl PubSubHandle {
    /// Listener lifecycle controls: pause, resume, suspend_and_run,
    /// subscribe.
    pub fn listener(&self) -> &HybridListener {
        &self.listener
    }

    /// Queue introspection.
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.queue.stats().await
    }

    /// Run one drain immediately, outside the listener's schedule.
    pub async fn drain_now(&self) -> Result<DrainStats> {
        self.processor.drain().await
    }

    /// Stop the listener, the cleanup timer, and the advisory-lock timers.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.listener.stop().await?;
        self.locks.shutdown();
        self.cleanup.await.context("Cleanup task panicked")?;
        tracing::info!("pg-pubsub shut down");
        Ok(())
    }
}
