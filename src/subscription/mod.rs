//! Subscriptions: the consumption loop and its supervision.
//!
//! Each subscription runs one background task that pulls raw records from
//! the store client, drops what consumers must never see, decodes the rest,
//! and hands them to the caller over a bounded channel.
//!
//! Per record, in order:
//! 1. Tombstones (`$$` streams) are dropped and, on persistent subscriptions,
//!    acked on the spot.
//! 2. System events (`$` types) likewise.
//! 3. Payloads that fail to decode are logged, acked and dropped. They never
//!    end the loop.
//! 4. Everything else is emitted. On persistent subscriptions the consumer
//!    decides when to ack or nack, through the subscription handle.
//!
//! Only connection-level failures leave the loop. Supervised subscriptions
//! reconnect with backoff and resume from the last processed position
//! (catch-up) or the store-tracked checkpoint (persistent).

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use futures::Stream;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::{
    category_stream, AckHandle, ClientError, NackAction, PersistentConnection,
    PersistentSettings, RecordStream, StoreClient,
};
use crate::codec::{decode_record, DecodeError, Decoded, DomainEvent};
use crate::config::{Config, RetryConfig};
use crate::record::{AckToken, AckableEventRecord, EventRecord, RawEventRecord};
use crate::utils::retry::connection_backoff;

/// Channel capacity between the loop and the consumer.
pub const DEFAULT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Selection and options
// ============================================================================

/// What a subscription reads: one stream, or every stream of a category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Stream(String),
    Category(String),
}

impl Selector {
    pub fn stream(name: impl Into<String>) -> Self {
        Selector::Stream(name.into())
    }

    pub fn category(name: impl Into<String>) -> Self {
        Selector::Category(name.into())
    }

    /// Stream name to subscribe to on the store.
    pub fn stream_name(&self) -> String {
        match self {
            Selector::Stream(name) => name.clone(),
            Selector::Category(category) => category_stream(category),
        }
    }
}

/// Options shared by every subscription a store opens.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub buffer_size: usize,
    /// Default consumer group for `LogEventStore::observe_configured`.
    pub consumer_group: Option<String>,
    /// Consumer group settings, used when a group has to be created.
    pub settings: PersistentSettings,
    /// Reconnect backoff. `None` ends a subscription on its first
    /// connection failure.
    pub retry: Option<RetryConfig>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            consumer_group: None,
            settings: PersistentSettings::default(),
            retry: None,
        }
    }
}

impl SubscriptionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            buffer_size: config.subscription.buffer_size,
            consumer_group: config.subscription.consumer_group.clone(),
            settings: config.subscription.persistent_settings(),
            retry: Some(config.retry.clone()),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Errors surfaced by a subscription handle or its task.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("subscription closed")]
    Closed,

    #[error("subscription not connected")]
    NotConnected,

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("subscription task failed: {0}")]
    Task(String),
}

// ============================================================================
// Classification
// ============================================================================

/// What the loop does with one raw record.
#[derive(Debug)]
pub enum Disposition<E> {
    /// Residual marker of a hard-deleted stream.
    Tombstone,
    /// Store-internal bookkeeping.
    System,
    /// The event type knows the payload and chose to ignore it.
    Skipped,
    /// Payload could not be decoded.
    Undecodable(DecodeError),
    Deliver(EventRecord<E>),
}

impl<E> Disposition<E> {
    /// Filtered records are acked without reaching the consumer.
    pub fn is_filtered(&self) -> bool {
        !matches!(self, Disposition::Deliver(_))
    }
}

/// Decide what happens to a raw record.
///
/// Never panics; decode failures come back as [`Disposition::Undecodable`].
pub fn classify<E: DomainEvent>(record: RawEventRecord) -> Disposition<E> {
    if record.is_tombstone() {
        return Disposition::Tombstone;
    }
    if record.is_system_event() {
        return Disposition::System;
    }
    match decode_record::<E>(record) {
        Decoded::Event(record) => Disposition::Deliver(record),
        Decoded::Skip => Disposition::Skipped,
        Decoded::Error(e) => Disposition::Undecodable(e),
    }
}

/// Classify and log. Returns the record to emit, if any.
fn screen<E: DomainEvent>(record: RawEventRecord) -> Option<EventRecord<E>> {
    let stream = record.stream_name.clone();
    let event_type = record.event_type.clone();
    let id = record.id;

    match classify::<E>(record) {
        Disposition::Deliver(record) => Some(record),
        Disposition::Tombstone => {
            debug!(stream = %stream, id = %id, "Skipping tombstone");
            None
        }
        Disposition::System => {
            debug!(stream = %stream, event_type = %event_type, id = %id, "Skipping system event");
            None
        }
        Disposition::Skipped => {
            debug!(stream = %stream, event_type = %event_type, id = %id, "Event type ignored by decoder");
            None
        }
        Disposition::Undecodable(e) => {
            warn!(stream = %stream, event_type = %event_type, id = %id, error = %e, "Failed to decode event, skipping");
            None
        }
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Consumer side of a running subscription.
///
/// Dropping the handle stops the background task.
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    shutdown: watch::Sender<bool>,
    position: watch::Receiver<Option<u64>>,
    task: Option<JoinHandle<Result<(), SubscriptionError>>>,
}

/// Catch-up subscriptions emit plain records; the caller tracks its offset.
pub type CatchUpSubscription<E> = Subscription<EventRecord<E>>;

impl<T> Subscription<T> {
    /// Next record, or `None` once the subscription has ended or was closed.
    pub async fn recv(&mut self) -> Option<T> {
        if *self.shutdown.borrow() {
            return None;
        }
        self.rx.recv().await
    }

    /// Position (within the subscribed stream) of the last record processed,
    /// emitted or filtered. Resume a catch-up subscription after it.
    pub fn last_position(&self) -> Option<u64> {
        *self.position.borrow()
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop the task and wait for it to exit. Idempotent.
    pub async fn close(&mut self) {
        self.shutdown.send_replace(true);
        self.rx.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Subscription task ended abnormally");
            }
        }
    }

    /// Wait for the task to finish on its own and report how it ended.
    pub async fn wait(mut self) -> Result<(), SubscriptionError> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| SubscriptionError::Task(e.to_string()))?,
            None => Ok(()),
        }
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        if *self.shutdown.borrow() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Ack channel shared between a persistent handle and its task.
///
/// Swapped on every reconnect; empty while disconnected.
struct AckSlot {
    handle: RwLock<Option<Arc<dyn AckHandle>>>,
    closed: AtomicBool,
}

impl AckSlot {
    fn new() -> Self {
        Self {
            handle: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    async fn current(&self) -> Result<Arc<dyn AckHandle>, SubscriptionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubscriptionError::Closed);
        }
        self.handle
            .read()
            .await
            .clone()
            .ok_or(SubscriptionError::NotConnected)
    }
}

/// Persistent (consumer group) subscription.
///
/// Every emitted record must be settled through [`ack`](Self::ack) or
/// [`nack`](Self::nack); otherwise the store redelivers it after the message
/// timeout.
pub struct PersistentSubscription<E> {
    inner: Subscription<AckableEventRecord<E>>,
    acks: Arc<AckSlot>,
}

impl<E> PersistentSubscription<E> {
    pub async fn recv(&mut self) -> Option<AckableEventRecord<E>> {
        self.inner.recv().await
    }

    pub fn last_position(&self) -> Option<u64> {
        self.inner.last_position()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Acknowledge a record. Fails once the subscription is closed.
    pub async fn ack(&self, token: impl Into<AckToken>) -> Result<(), SubscriptionError> {
        let token = token.into();
        let handle = self.acks.current().await?;
        handle.ack(&[token.id()]).await?;
        Ok(())
    }

    /// Negatively acknowledge a record. Fails once the subscription is closed.
    pub async fn nack(
        &self,
        token: impl Into<AckToken>,
        action: NackAction,
        reason: &str,
    ) -> Result<(), SubscriptionError> {
        let token = token.into();
        let handle = self.acks.current().await?;
        handle.nack(&[token.id()], action, reason).await?;
        Ok(())
    }

    /// Stop the task. In-flight records are left for the store to redeliver.
    pub async fn close(&mut self) {
        self.acks.closed.store(true, Ordering::SeqCst);
        self.inner.close().await;
    }

    pub async fn wait(self) -> Result<(), SubscriptionError> {
        self.inner.wait().await
    }
}

/// Result of [`LogEventStore::observe`](crate::storage::LogEventStore::observe).
pub enum Observed<E> {
    CatchUp(CatchUpSubscription<E>),
    Persistent(PersistentSubscription<E>),
}

impl<E> Observed<E> {
    pub fn into_catch_up(self) -> Option<CatchUpSubscription<E>> {
        match self {
            Observed::CatchUp(s) => Some(s),
            Observed::Persistent(_) => None,
        }
    }

    pub fn into_persistent(self) -> Option<PersistentSubscription<E>> {
        match self {
            Observed::Persistent(s) => Some(s),
            Observed::CatchUp(_) => None,
        }
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// Create the consumer group if it does not exist yet.
pub async fn ensure_persistent_subscription(
    client: &dyn StoreClient,
    selector: &Selector,
    group: &str,
    settings: &PersistentSettings,
) -> Result<(), ClientError> {
    client
        .create_persistent_subscription(&selector.stream_name(), group, settings)
        .await
}

/// Catch-up subscription that ends on the first connection failure.
///
/// Starts at `from` (inclusive), or the beginning of the stream.
pub fn catch_up<E: DomainEvent>(
    client: Arc<dyn StoreClient>,
    selector: Selector,
    from: Option<u64>,
    options: SubscriptionOptions,
) -> CatchUpSubscription<E> {
    spawn_catch_up(client, selector, from, options, None)
}

/// Catch-up subscription that reconnects with backoff, resuming after the
/// last processed position.
pub fn supervise_catch_up<E: DomainEvent>(
    client: Arc<dyn StoreClient>,
    selector: Selector,
    from: Option<u64>,
    options: SubscriptionOptions,
    retry: &RetryConfig,
) -> CatchUpSubscription<E> {
    spawn_catch_up(client, selector, from, options, Some(connection_backoff(retry)))
}

/// Persistent subscription that ends on the first connection failure.
///
/// The group must exist; see [`ensure_persistent_subscription`].
pub fn persistent<E: DomainEvent>(
    client: Arc<dyn StoreClient>,
    selector: Selector,
    group: &str,
    options: SubscriptionOptions,
) -> PersistentSubscription<E> {
    spawn_persistent(client, selector, group, options, None)
}

/// Persistent subscription that reconnects with backoff. The store resumes
/// from the group's checkpoint and redelivers anything left unacked.
pub fn supervise_persistent<E: DomainEvent>(
    client: Arc<dyn StoreClient>,
    selector: Selector,
    group: &str,
    options: SubscriptionOptions,
    retry: &RetryConfig,
) -> PersistentSubscription<E> {
    spawn_persistent(client, selector, group, options, Some(connection_backoff(retry)))
}

// ============================================================================
// Tasks
// ============================================================================

/// Resolves when the handle asks for shutdown or goes away.
async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

/// Decide whether to reconnect after `failure`. Returns the delay, or the
/// error that ends the task.
fn next_attempt(
    failure: ClientError,
    backoff: &mut Option<ExponentialBackoff>,
    stream: &str,
) -> Result<std::time::Duration, SubscriptionError> {
    if !failure.is_connection_failure() {
        error!(stream = %stream, error = %failure, "Subscription failed");
        return Err(failure.into());
    }
    match backoff.as_mut().and_then(|b| b.next()) {
        Some(delay) => {
            error!(
                stream = %stream,
                error = %failure,
                backoff_ms = %delay.as_millis(),
                "Subscription connection failed, retrying after backoff"
            );
            Ok(delay)
        }
        None => {
            error!(stream = %stream, error = %failure, "Subscription connection failed, giving up");
            Err(failure.into())
        }
    }
}

fn spawn_catch_up<E: DomainEvent>(
    client: Arc<dyn StoreClient>,
    selector: Selector,
    from: Option<u64>,
    options: SubscriptionOptions,
    backoff: Option<ExponentialBuilder>,
) -> CatchUpSubscription<E> {
    let (tx, rx) = mpsc::channel(options.buffer_size.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (position_tx, position_rx) = watch::channel(from.and_then(|f| f.checked_sub(1)));

    let task = tokio::spawn(run_catch_up(
        client,
        selector.stream_name(),
        from,
        tx,
        shutdown_rx,
        position_tx,
        backoff,
    ));

    Subscription {
        rx,
        shutdown: shutdown_tx,
        position: position_rx,
        task: Some(task),
    }
}

async fn run_catch_up<E: DomainEvent>(
    client: Arc<dyn StoreClient>,
    stream: String,
    mut from: Option<u64>,
    tx: mpsc::Sender<EventRecord<E>>,
    mut shutdown: watch::Receiver<bool>,
    position: watch::Sender<Option<u64>>,
    backoff_builder: Option<ExponentialBuilder>,
) -> Result<(), SubscriptionError> {
    let mut backoff = backoff_builder.map(|b| b.build());

    loop {
        let opened = tokio::select! {
            _ = shutdown_signal(&mut shutdown) => return Ok(()),
            opened = client.subscribe_to_stream(&stream, from) => opened,
        };

        let failure = match opened {
            Ok(mut records) => {
                info!(stream = %stream, from = ?from, "Catch-up subscription connected");
                // Reset backoff on successful connection
                backoff = backoff_builder.map(|b| b.build());

                match pump_catch_up(&mut *records, &tx, &mut shutdown, &position, &mut from).await {
                    Ok(()) => return Ok(()),
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };

        let delay = next_attempt(failure, &mut backoff, &stream)?;
        tokio::select! {
            _ = shutdown_signal(&mut shutdown) => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Drain one connection. `Ok` means the subscription is over (closed, ended
/// by the server, or the consumer went away); `Err` is a connection failure.
async fn pump_catch_up<E: DomainEvent>(
    records: &mut dyn RecordStream,
    tx: &mpsc::Sender<EventRecord<E>>,
    shutdown: &mut watch::Receiver<bool>,
    position: &watch::Sender<Option<u64>>,
    from: &mut Option<u64>,
) -> Result<(), ClientError> {
    loop {
        let next = tokio::select! {
            _ = shutdown_signal(shutdown) => return Ok(()),
            next = records.next() => next?,
        };
        let Some(delivery) = next else {
            info!("Catch-up subscription ended by server");
            return Ok(());
        };

        let at = delivery.position;
        if let Some(record) = screen::<E>(delivery.record) {
            tokio::select! {
                _ = shutdown_signal(shutdown) => return Ok(()),
                sent = tx.send(record) => if sent.is_err() {
                    return Ok(());
                },
            }
        }
        *from = Some(at + 1);
        position.send_replace(Some(at));
    }
}

fn spawn_persistent<E: DomainEvent>(
    client: Arc<dyn StoreClient>,
    selector: Selector,
    group: &str,
    options: SubscriptionOptions,
    backoff: Option<ExponentialBuilder>,
) -> PersistentSubscription<E> {
    let (tx, rx) = mpsc::channel(options.buffer_size.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (position_tx, position_rx) = watch::channel(None);
    let acks = Arc::new(AckSlot::new());

    let task = tokio::spawn(run_persistent(
        client,
        selector.stream_name(),
        group.to_string(),
        options.buffer_size,
        tx,
        shutdown_rx,
        position_tx,
        acks.clone(),
        backoff,
    ));

    PersistentSubscription {
        inner: Subscription {
            rx,
            shutdown: shutdown_tx,
            position: position_rx,
            task: Some(task),
        },
        acks,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_persistent<E: DomainEvent>(
    client: Arc<dyn StoreClient>,
    stream: String,
    group: String,
    buffer_size: usize,
    tx: mpsc::Sender<AckableEventRecord<E>>,
    mut shutdown: watch::Receiver<bool>,
    position: watch::Sender<Option<u64>>,
    acks: Arc<AckSlot>,
    backoff_builder: Option<ExponentialBuilder>,
) -> Result<(), SubscriptionError> {
    let mut backoff = backoff_builder.map(|b| b.build());

    loop {
        let opened = tokio::select! {
            _ = shutdown_signal(&mut shutdown) => return Ok(()),
            opened = client.subscribe_to_persistent_subscription(&stream, &group, buffer_size) => opened,
        };

        let failure = match opened {
            Ok(PersistentConnection {
                stream: mut records,
                acks: handle,
            }) => {
                info!(stream = %stream, group = %group, "Persistent subscription connected");
                backoff = backoff_builder.map(|b| b.build());
                *acks.handle.write().await = Some(handle.clone());

                let outcome = pump_persistent(
                    &mut *records,
                    handle.as_ref(),
                    &tx,
                    &mut shutdown,
                    &position,
                )
                .await;

                *acks.handle.write().await = None;
                match outcome {
                    Ok(()) => return Ok(()),
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };

        let delay = next_attempt(failure, &mut backoff, &stream)?;
        tokio::select! {
            _ = shutdown_signal(&mut shutdown) => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn pump_persistent<E: DomainEvent>(
    records: &mut dyn RecordStream,
    handle: &dyn AckHandle,
    tx: &mpsc::Sender<AckableEventRecord<E>>,
    shutdown: &mut watch::Receiver<bool>,
    position: &watch::Sender<Option<u64>>,
) -> Result<(), ClientError> {
    loop {
        let next = tokio::select! {
            _ = shutdown_signal(shutdown) => return Ok(()),
            next = records.next() => next?,
        };
        let Some(delivery) = next else {
            info!("Persistent subscription ended by server");
            return Ok(());
        };

        let at = delivery.position;
        let ack_id = delivery.ack_id;
        let retry_count = delivery.retry_count;

        match screen::<E>(delivery.record) {
            Some(record) => {
                let record = AckableEventRecord::new(record, AckToken::new(ack_id), retry_count);
                tokio::select! {
                    _ = shutdown_signal(shutdown) => return Ok(()),
                    sent = tx.send(record) => if sent.is_err() {
                        return Ok(());
                    },
                }
            }
            None => {
                // Filtered records are settled here so the store never
                // redelivers them. Nothing is acked once closed.
                if *shutdown.borrow() {
                    return Ok(());
                }
                if let Err(e) = handle.ack(&[ack_id]).await {
                    if e.is_connection_failure() {
                        return Err(e);
                    }
                    warn!(id = %ack_id, error = %e, "Failed to ack filtered record");
                }
            }
        }
        position.send_replace(Some(at));
    }
}
