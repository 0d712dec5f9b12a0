//! EventStoreDB (KurrentDB) store client.
//!
//! Speaks the gRPC protocol through the `eventstore` crate. Category
//! streams (`$ce-*`) and `$all` are read with link resolution so records
//! carry the original event's stream and position.
//!
//! Persistent subscription connections are owned by a driver task: the
//! crate's subscription handle needs `&mut self` for both reads and acks,
//! so acks are sent to the driver over a channel while it waits for the
//! next event.

use std::sync::Arc;

use async_trait::async_trait;
use eventstore::{
    AppendToStreamOptions, Client, ClientSettings, EventData, NakAction,
    PersistentSubscriptionOptions, ReadStreamOptions, ResolvedEvent, StreamPosition,
    SubscribeToPersistentSubscriptionOptions, SubscribeToStreamOptions, TombstoneStreamOptions,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AckHandle, ClientError, Delivery, ExpectedRevision, NackAction, PersistentConnection,
    PersistentSettings, RecordStream, Result, StoreClient, CATEGORY_STREAM_PREFIX,
};
use crate::record::{EventDescriptor, RawEventRecord};

/// Stream name of the store-wide log.
const ALL_STREAM: &str = "$all";

/// EventStoreDB client.
pub struct EventStoreDbClient {
    client: Client,
}

impl EventStoreDbClient {
    /// Build a client from a connection string (`esdb://host:2113?tls=false`).
    ///
    /// The connection is established lazily on the first request.
    pub fn new(connection_string: &str) -> Result<Self> {
        let settings = connection_string
            .parse::<ClientSettings>()
            .map_err(|e| ClientError::Connection(format!("invalid connection string: {e}")))?;
        let client = Client::new(settings).map_err(|e| ClientError::Connection(e.to_string()))?;
        info!("EventStoreDB client created");
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn resolves_links(stream: &str) -> bool {
    stream.starts_with(CATEGORY_STREAM_PREFIX) || stream == ALL_STREAM
}

fn wire_revision(expected: ExpectedRevision) -> eventstore::ExpectedRevision {
    match expected {
        ExpectedRevision::Any => eventstore::ExpectedRevision::Any,
        ExpectedRevision::NoStream => eventstore::ExpectedRevision::NoStream,
        ExpectedRevision::Exact(rev) => eventstore::ExpectedRevision::Exact(rev),
    }
}

/// Subscription start for an inclusive `from`. The server starts after the
/// given revision.
fn subscribe_start(from: Option<u64>) -> StreamPosition<u64> {
    match from {
        None | Some(0) => StreamPosition::Start,
        Some(from) => StreamPosition::Position(from - 1),
    }
}

fn nak_action(action: NackAction) -> NakAction {
    match action {
        NackAction::Park => NakAction::Park,
        NackAction::Retry => NakAction::Retry,
        NackAction::Skip => NakAction::Skip,
        NackAction::Stop => NakAction::Stop,
    }
}

fn persistent_options(
    settings: &PersistentSettings,
    link_tos: bool,
) -> PersistentSubscriptionOptions {
    let options = PersistentSubscriptionOptions::default()
        .start_from(subscribe_start(Some(settings.start_from)))
        .checkpoint_lower_bound(settings.min_checkpoint_count as _)
        .checkpoint_upper_bound(settings.max_checkpoint_count as _)
        .message_timeout(settings.message_timeout)
        .max_retry_count(settings.max_retry_count as _);
    if link_tos {
        options.resolve_link_tos()
    } else {
        options
    }
}

fn map_error(stream: &str, e: eventstore::Error) -> ClientError {
    match e {
        eventstore::Error::ResourceDeleted => ClientError::StreamDeleted(stream.to_string()),
        other => ClientError::Connection(other.to_string()),
    }
}

fn map_append_error(
    stream: &str,
    expected: ExpectedRevision,
    e: eventstore::Error,
) -> ClientError {
    match e {
        // The actual revision is read out of band by the caller.
        eventstore::Error::WrongExpectedVersion { .. } => ClientError::WrongExpectedVersion {
            stream: stream.to_string(),
            expected,
            actual: None,
        },
        other => map_error(stream, other),
    }
}

/// Convert a resolved event. Links to deleted events keep the link record,
/// whose `$>` type is filtered as a system event downstream.
fn to_delivery(resolved: &ResolvedEvent, retry_count: u32) -> Delivery {
    let original = resolved.get_original_event();
    let event = resolved.event.as_ref().unwrap_or(original);
    Delivery {
        record: RawEventRecord {
            stream_name: event.stream_id.clone(),
            event_type: event.event_type.clone(),
            id: event.id,
            stream_position: event.revision,
            commit_position: event.position.commit,
            recorded_at: event.created,
            data: event.data.clone(),
            metadata: event.custom_metadata.clone(),
        },
        position: original.revision,
        ack_id: original.id,
        retry_count,
    }
}

fn event_data(descriptor: EventDescriptor) -> EventData {
    let event = EventData::binary(descriptor.event_type, descriptor.data).id(Uuid::new_v4());
    if descriptor.metadata.is_empty() {
        event
    } else {
        event.metadata(descriptor.metadata)
    }
}

#[async_trait]
impl StoreClient for EventStoreDbClient {
    async fn append_to_stream(
        &self,
        stream: &str,
        expected: ExpectedRevision,
        events: Vec<EventDescriptor>,
    ) -> Result<u64> {
        let options = AppendToStreamOptions::default().expected_revision(wire_revision(expected));
        let events: Vec<EventData> = events.into_iter().map(event_data).collect();

        let result = self
            .client
            .append_to_stream(stream, &options, events)
            .await
            .map_err(|e| map_append_error(stream, expected, e))?;

        debug!(stream = %stream, revision = result.next_expected_version, "Appended");
        Ok(result.next_expected_version + 1)
    }

    async fn read_stream(&self, stream: &str, from: u64) -> Result<Vec<RawEventRecord>> {
        let mut options = ReadStreamOptions::default().position(StreamPosition::Position(from));
        if resolves_links(stream) {
            options = options.resolve_link_tos();
        }

        let mut read = match self.client.read_stream(stream, &options).await {
            Ok(read) => read,
            Err(eventstore::Error::ResourceNotFound) => return Ok(Vec::new()),
            Err(e) => return Err(map_error(stream, e)),
        };

        let mut records = Vec::new();
        loop {
            match read.next().await {
                Ok(Some(resolved)) => records.push(to_delivery(&resolved, 0).record),
                Ok(None) => break,
                Err(eventstore::Error::ResourceNotFound) => break,
                Err(e) => return Err(map_error(stream, e)),
            }
        }
        Ok(records)
    }

    async fn stream_version(&self, stream: &str) -> Result<Option<u64>> {
        let options = ReadStreamOptions::default()
            .position(StreamPosition::End)
            .backwards()
            .max_count(1);

        let mut read = match self.client.read_stream(stream, &options).await {
            Ok(read) => read,
            Err(eventstore::Error::ResourceNotFound) => return Ok(None),
            Err(e) => return Err(map_error(stream, e)),
        };

        match read.next().await {
            Ok(Some(resolved)) => Ok(Some(resolved.get_original_event().revision + 1)),
            Ok(None) | Err(eventstore::Error::ResourceNotFound) => Ok(None),
            Err(e) => Err(map_error(stream, e)),
        }
    }

    async fn tombstone_stream(&self, stream: &str) -> Result<()> {
        let options = TombstoneStreamOptions::default();
        match self.client.tombstone_stream(stream, &options).await {
            Ok(_) => Ok(()),
            Err(eventstore::Error::ResourceNotFound) => Ok(()),
            Err(e) => Err(map_error(stream, e)),
        }
    }

    async fn subscribe_to_stream(
        &self,
        stream: &str,
        from: Option<u64>,
    ) -> Result<Box<dyn RecordStream>> {
        let mut options = SubscribeToStreamOptions::default().start_from(subscribe_start(from));
        if resolves_links(stream) {
            options = options.resolve_link_tos();
        }
        let subscription = self.client.subscribe_to_stream(stream, &options).await;
        Ok(Box::new(CatchUpStream {
            stream: stream.to_string(),
            subscription,
        }))
    }

    async fn create_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: &PersistentSettings,
    ) -> Result<()> {
        let options = persistent_options(settings, resolves_links(stream));
        match self
            .client
            .create_persistent_subscription(stream, group, &options)
            .await
        {
            Ok(()) => {
                info!(stream = %stream, group = %group, "Created persistent subscription");
                Ok(())
            }
            Err(eventstore::Error::ResourceAlreadyExists) => Ok(()),
            Err(e) => Err(map_error(stream, e)),
        }
    }

    async fn subscribe_to_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        buffer_size: usize,
    ) -> Result<PersistentConnection> {
        let options = SubscribeToPersistentSubscriptionOptions::default().buffer_size(buffer_size);
        let subscription = match self
            .client
            .subscribe_to_persistent_subscription(stream, group, &options)
            .await
        {
            Ok(subscription) => subscription,
            Err(eventstore::Error::ResourceNotFound) => {
                return Err(ClientError::SubscriptionNotFound {
                    stream: stream.to_string(),
                    group: group.to_string(),
                })
            }
            Err(e) => return Err(map_error(stream, e)),
        };

        let (records_tx, records_rx) = mpsc::channel(buffer_size.max(1));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive_persistent(
            stream.to_string(),
            subscription,
            records_tx,
            commands_rx,
        ));

        Ok(PersistentConnection {
            stream: Box::new(PersistentStream { records: records_rx }),
            acks: Arc::new(PersistentAcks { commands: commands_tx }),
        })
    }
}

struct CatchUpStream {
    stream: String,
    subscription: eventstore::Subscription,
}

#[async_trait]
impl RecordStream for CatchUpStream {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        match self.subscription.next().await {
            Ok(resolved) => Ok(Some(to_delivery(&resolved, 0))),
            Err(eventstore::Error::ResourceDeleted) => {
                Err(ClientError::StreamDeleted(self.stream.clone()))
            }
            Err(e) => Err(ClientError::SubscriptionDropped(e.to_string())),
        }
    }
}

enum AckCommand {
    Ack {
        ids: Vec<Uuid>,
        reply: oneshot::Sender<Result<()>>,
    },
    Nack {
        ids: Vec<Uuid>,
        action: NackAction,
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Own the server connection: forward events, apply acks in between.
async fn drive_persistent(
    stream: String,
    mut subscription: eventstore::PersistentSubscription,
    records: mpsc::Sender<Result<Delivery>>,
    mut commands: mpsc::UnboundedReceiver<AckCommand>,
) {
    let mut pending: Option<Result<Delivery>> = None;
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(AckCommand::Ack { ids, reply }) => {
                    let result = subscription
                        .ack_ids(ids)
                        .await
                        .map_err(|e| ClientError::SubscriptionDropped(e.to_string()));
                    let _ = reply.send(result);
                }
                Some(AckCommand::Nack { ids, action, reason, reply }) => {
                    let result = subscription
                        .nack_ids(ids, nak_action(action), reason.as_str())
                        .await
                        .map_err(|e| ClientError::SubscriptionDropped(e.to_string()));
                    let _ = reply.send(result);
                }
                None => break,
            },
            permit = records.reserve(), if pending.is_some() => {
                let Ok(permit) = permit else { break };
                if let Some(item) = pending.take() {
                    let failed = item.is_err();
                    permit.send(item);
                    if failed {
                        break;
                    }
                }
            },
            event = subscription.next(), if pending.is_none() => {
                pending = Some(match event {
                    Ok(resolved) => Ok(to_delivery(&resolved, 0)),
                    Err(e) => {
                        warn!(stream = %stream, error = %e, "Persistent subscription dropped");
                        Err(ClientError::SubscriptionDropped(e.to_string()))
                    }
                });
            },
        }
    }
    debug!(stream = %stream, "Persistent subscription driver stopped");
}

struct PersistentStream {
    records: mpsc::Receiver<Result<Delivery>>,
}

#[async_trait]
impl RecordStream for PersistentStream {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        match self.records.recv().await {
            Some(Ok(delivery)) => Ok(Some(delivery)),
            Some(Err(e)) => Err(e),
            None => Err(ClientError::SubscriptionDropped(
                "persistent subscription closed".to_string(),
            )),
        }
    }
}

struct PersistentAcks {
    commands: mpsc::UnboundedSender<AckCommand>,
}

impl PersistentAcks {
    async fn send(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<()>>) -> AckCommand,
    ) -> Result<()> {
        let (reply, response) = oneshot::channel();
        let dropped = || ClientError::SubscriptionDropped("persistent subscription closed".to_string());
        self.commands.send(build(reply)).map_err(|_| dropped())?;
        response.await.map_err(|_| dropped())?
    }
}

#[async_trait]
impl AckHandle for PersistentAcks {
    async fn ack(&self, ids: &[Uuid]) -> Result<()> {
        let ids = ids.to_vec();
        self.send(|reply| AckCommand::Ack { ids, reply }).await
    }

    async fn nack(&self, ids: &[Uuid], action: NackAction, reason: &str) -> Result<()> {
        let ids = ids.to_vec();
        let reason = reason.to_string();
        self.send(|reply| AckCommand::Nack {
            ids,
            action,
            reason,
            reply,
        })
        .await
    }
}
