// ABOUTME: Hybrid NOTIFY listener - reactive drains on notifications plus fallback polling
// ABOUTME: Owns the dedicated NOTIFY connection with reconnect backoff and pause/resume control

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_postgres::{Client, Notification};

use crate::postgres::{connect_notify, quote_ident, validate_pg_identifier};
use crate::processor::Drainer;

/// Ceiling for the reconnect backoff.
const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

/// Lifecycle state of the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Connecting,
    Listening,
    Paused,
}

type SubscriptionCallback = Box<dyn Fn(&str) + Send + Sync>;
type Subscriptions = Arc<Mutex<HashMap<String, Vec<SubscriptionCallback>>>>;

enum Command {
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
    Subscribe {
        channel: String,
        ack: oneshot::Sender<Result<()>>,
    },
    Stop(oneshot::Sender<()>),
}

/// Reactive NOTIFY consumer with low-frequency fallback polling.
///
/// A dedicated connection (separate from the query connection) subscribes to
/// the engine channel. Each notification triggers a drain; a fallback timer
/// drains unconditionally to cover lost notifications; and the connection
/// reconnects forever with exponential backoff. Drains run inside the
/// listener task, so once [`pause`](Self::pause) returns no drain is running
/// and none will start until [`resume`](Self::resume).
pub struct HybridListener {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ListenerState>,
    handle: JoinHandle<()>,
    subscriptions: Subscriptions,
}

impl HybridListener {
    /// Spawn the listener task. It begins connecting immediately and drains
    /// once as soon as it is listening, picking up any backlog that
    /// accumulated while no listener was running.
    pub fn start(
        database_url: impl Into<String>,
        channel: impl Into<String>,
        fallback_interval: Duration,
        drainer: Arc<dyn Drainer>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(ListenerState::Stopped);
        let subscriptions: Subscriptions = Arc::new(Mutex::new(HashMap::new()));

        let task = ListenerTask {
            database_url: database_url.into(),
            channel: channel.into(),
            fallback_interval,
            drainer,
            subscriptions: subscriptions.clone(),
            commands: command_rx,
            state: state_tx,
        };
        let handle = tokio::spawn(task.run());

        Self {
            commands: command_tx,
            state: state_rx,
            handle,
            subscriptions,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Unsubscribe and close the NOTIFY connection. Returns once the
    /// listener has settled in `Paused`; any in-flight drain has completed
    /// by then.
    pub async fn pause(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Pause(ack))
            .await
            .context("Listener task is gone")?;
        done.await.context("Listener task dropped pause ack")?;
        Ok(())
    }

    /// Re-establish the connection and return to `Listening`.
    pub async fn resume(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Resume(ack))
            .await
            .context("Listener task is gone")?;
        done.await.context("Listener task dropped resume ack")?;
        Ok(())
    }

    /// Pause, run `f`, and resume on every exit path, including when `f`
    /// fails.
    pub async fn suspend_and_run<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.pause().await?;
        let result = f().await;
        self.resume().await?;
        result
    }

    /// Subscribe a raw callback to a user-defined NOTIFY channel.
    ///
    /// The callback runs on the listener task for every notification on that
    /// channel. Subscriptions survive reconnects and pauses; the `LISTEN` is
    /// re-issued each time the connection is re-established.
    pub async fn subscribe<F>(&self, channel: &str, callback: F) -> Result<()>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        validate_pg_identifier(channel)?;
        self.subscriptions
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push(Box::new(callback));

        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                channel: channel.to_string(),
                ack,
            })
            .await
            .context("Listener task is gone")?;
        done.await.context("Listener task dropped subscribe ack")?
    }

    /// Stop the listener and wait for the task to finish.
    pub async fn stop(self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Stop(ack)).await.is_ok() {
            let _ = done.await;
        }
        self.handle.await.context("Listener task panicked")?;
        Ok(())
    }
}

struct ListenerTask {
    database_url: String,
    channel: String,
    fallback_interval: Duration,
    drainer: Arc<dyn Drainer>,
    subscriptions: Subscriptions,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<ListenerState>,
}

impl ListenerTask {
    async fn run(mut self) {
        let mut reconnect_attempt: u32 = 0;

        'connect: loop {
            self.state.send_replace(ListenerState::Connecting);

            let (client, mut notifications) = match connect_notify(&self.database_url).await {
                Ok(pair) => pair,
                Err(e) => {
                    let delay = reconnect_delay(reconnect_attempt);
                    reconnect_attempt = reconnect_attempt.saturating_add(1);
                    tracing::warn!(
                        "NOTIFY connection attempt {} failed: {:#}; retrying in {:?}",
                        reconnect_attempt,
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        command = self.commands.recv() => {
                            if !self.handle_idle_command(command).await {
                                return;
                            }
                        }
                    }
                    continue 'connect;
                }
            };

            if let Err(e) = self.listen_all(&client).await {
                tracing::warn!("Failed to subscribe on new connection: {:#}", e);
                continue 'connect;
            }
            reconnect_attempt = 0;

            self.state.send_replace(ListenerState::Listening);
            tracing::info!("Listening for notifications on '{}'", self.channel);

            // Catch up on anything queued while no listener was connected.
            self.run_drain().await;

            let mut fallback = tokio::time::interval(self.fallback_interval);
            fallback.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval fires immediately and we just drained; skip that tick.
            fallback.tick().await;

            loop {
                tokio::select! {
                    notification = notifications.recv() => match notification {
                        Some(notification) => self.handle_notification(notification).await,
                        None => {
                            tracing::warn!("NOTIFY connection lost; reconnecting");
                            continue 'connect;
                        }
                    },
                    _ = fallback.tick() => {
                        self.run_drain().await;
                    }
                    command = self.commands.recv() => match command {
                        Some(Command::Pause(ack)) => {
                            drop(notifications);
                            drop(client);
                            self.state.send_replace(ListenerState::Paused);
                            let _ = ack.send(());
                            tracing::info!("Listener paused");
                            if !self.wait_for_resume().await {
                                return;
                            }
                            continue 'connect;
                        }
                        Some(Command::Resume(ack)) => {
                            // Already listening.
                            let _ = ack.send(());
                        }
                        Some(Command::Subscribe { channel, ack }) => {
                            let result = client
                                .batch_execute(&format!("LISTEN {}", quote_ident(&channel)))
                                .await
                                .with_context(|| format!("Failed to LISTEN on '{}'", channel));
                            let _ = ack.send(result);
                        }
                        Some(Command::Stop(ack)) => {
                            self.state.send_replace(ListenerState::Stopped);
                            let _ = ack.send(());
                            return;
                        }
                        None => {
                            self.state.send_replace(ListenerState::Stopped);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Handle a command received while not listening (during connect
    /// backoff). Returns false when the task should exit.
    async fn handle_idle_command(&mut self, command: Option<Command>) -> bool {
        match command {
            Some(Command::Pause(ack)) => {
                self.state.send_replace(ListenerState::Paused);
                let _ = ack.send(());
                self.wait_for_resume().await
            }
            Some(Command::Resume(ack)) => {
                let _ = ack.send(());
                true
            }
            Some(Command::Subscribe { ack, .. }) => {
                // Callback is registered; LISTEN happens on connect.
                let _ = ack.send(Ok(()));
                true
            }
            Some(Command::Stop(ack)) => {
                self.state.send_replace(ListenerState::Stopped);
                let _ = ack.send(());
                false
            }
            None => {
                self.state.send_replace(ListenerState::Stopped);
                false
            }
        }
    }

    /// Park in `Paused` until a resume arrives. A fallback tick cannot fire
    /// here: the timer only exists while listening. Returns false on stop.
    async fn wait_for_resume(&mut self) -> bool {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Resume(ack) => {
                    let _ = ack.send(());
                    tracing::info!("Listener resuming");
                    return true;
                }
                Command::Pause(ack) => {
                    // Already paused.
                    let _ = ack.send(());
                }
                Command::Subscribe { ack, .. } => {
                    let _ = ack.send(Ok(()));
                }
                Command::Stop(ack) => {
                    self.state.send_replace(ListenerState::Stopped);
                    let _ = ack.send(());
                    return false;
                }
            }
        }
        self.state.send_replace(ListenerState::Stopped);
        false
    }

    /// LISTEN on the engine channel and every user-subscribed channel.
    async fn listen_all(&self, client: &Client) -> Result<()> {
        let mut channels = vec![self.channel.clone()];
        channels.extend(self.subscriptions.lock().unwrap().keys().cloned());
        for channel in channels {
            client
                .batch_execute(&format!("LISTEN {}", quote_ident(&channel)))
                .await
                .with_context(|| format!("Failed to LISTEN on '{}'", channel))?;
        }
        Ok(())
    }

    async fn handle_notification(&self, notification: Notification) {
        if notification.channel() == self.channel {
            // The payload is the queue row id; it is advisory and only the
            // fact of the notification matters for correctness.
            match notification.payload().parse::<i64>() {
                Ok(id) => tracing::debug!("Change notification for queue row {}", id),
                Err(_) => tracing::debug!(
                    "Ignoring unparseable NOTIFY payload '{}'",
                    notification.payload()
                ),
            }
            self.run_drain().await;
        } else {
            let subscriptions = self.subscriptions.lock().unwrap();
            if let Some(callbacks) = subscriptions.get(notification.channel()) {
                for callback in callbacks {
                    callback(notification.payload());
                }
            }
        }
    }

    async fn run_drain(&self) {
        if let Err(e) = self.drainer.drain().await {
            tracing::error!("Drain failed: {:#}", e);
        }
    }
}

/// Reconnect backoff: `min(1000 * 2^attempt, 30000)` milliseconds.
fn reconnect_delay(attempt: u32) -> Duration {
    let millis = 1000u64
        .saturating_mul(1u64 << attempt.min(5))
        .min(MAX_RECONNECT_DELAY_MS);
    Duration::from_millis(millis)
}
