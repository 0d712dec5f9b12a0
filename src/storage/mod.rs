//! Event store: named-stream persistence over a log store client.
//!
//! `EventStore` is the boundary the repository talks to. `LogEventStore` is
//! the implementation over any [`StoreClient`]; it also opens subscriptions
//! through [`LogEventStore::observe`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::client::{ClientError, ExpectedRevision, StoreClient};
use crate::codec::DomainEvent;
use crate::config::Config;
use crate::record::{EventDescriptor, RawEventRecord};
use crate::subscription::{self, Observed, Selector, SubscriptionOptions};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// An append was rejected because the stream moved on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("concurrency conflict on '{stream}': expected version {expected}, actual {actual}")]
pub struct ConcurrencyConflict {
    pub stream: String,
    pub expected: u64,
    pub actual: u64,
}

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyConflict),

    #[error("stream '{0}' has been deleted")]
    StreamDeleted(String),

    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("store error: {0}")]
    Client(ClientError),
}

impl From<ClientError> for StorageError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::StreamDeleted(stream) => StorageError::StreamDeleted(stream),
            ClientError::Connection(msg) | ClientError::SubscriptionDropped(msg) => {
                StorageError::Connection(msg)
            }
            other => StorageError::Client(other),
        }
    }
}

/// Interface for event persistence.
///
/// Implementations:
/// - `LogEventStore`: any [`StoreClient`], including the in-memory log
///
/// Subscriptions are not part of this trait: `observe` is generic over the
/// decoded event type, so it lives on [`LogEventStore`]. Code that needs
/// both keeps an `Arc<LogEventStore>` and hands out `Arc<dyn EventStore>`
/// clones of it.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append events atomically, only if the stream is at `expected_version`.
    ///
    /// Events receive consecutive positions starting at `expected_version`.
    /// Returns the new stream version. Conflicts are never retried here.
    async fn append(
        &self,
        stream: &str,
        events: Vec<EventDescriptor>,
        expected_version: u64,
    ) -> Result<u64>;

    /// Read a stream from `from_version` to its end.
    ///
    /// A stream that was never written reads as empty.
    async fn read(&self, stream: &str, from_version: u64) -> Result<Vec<RawEventRecord>>;

    /// Hard-delete a stream, leaving a tombstone. Irreversible.
    async fn delete(&self, stream: &str) -> Result<()>;

    /// Current version (count of events) of a stream; 0 when it does not exist.
    async fn stream_version(&self, stream: &str) -> Result<u64>;
}

/// Event store backed by a log store client.
pub struct LogEventStore {
    client: Arc<dyn StoreClient>,
    options: SubscriptionOptions,
}

impl LogEventStore {
    pub fn new(client: Arc<dyn StoreClient>) -> Self {
        Self {
            client,
            options: SubscriptionOptions::default(),
        }
    }

    /// Build from configuration: subscription settings and reconnect backoff.
    pub fn from_config(client: Arc<dyn StoreClient>, config: &Config) -> Self {
        Self {
            client,
            options: SubscriptionOptions::from_config(config),
        }
    }

    pub fn with_subscription_options(mut self, options: SubscriptionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn client(&self) -> &Arc<dyn StoreClient> {
        &self.client
    }

    /// Open a subscription on a stream or category.
    ///
    /// Without a consumer group this is a catch-up subscription starting at
    /// `offset` (the caller tracks its own position). With a group it is a
    /// persistent subscription; the group is created on first use, starting
    /// at `offset`, and the store tracks the checkpoint from then on.
    ///
    /// Subscriptions reconnect with backoff when the options carry a retry
    /// policy, as they do when built from configuration.
    pub async fn observe<E: DomainEvent>(
        &self,
        selector: Selector,
        consumer_group: Option<&str>,
        offset: Option<u64>,
    ) -> Result<Observed<E>> {
        match consumer_group {
            None => {
                info!(stream = %selector.stream_name(), offset = ?offset, "Observing (catch-up)");
                let client = self.client.clone();
                let options = self.options.clone();
                Ok(Observed::CatchUp(match &self.options.retry {
                    Some(retry) => {
                        subscription::supervise_catch_up(client, selector, offset, options, retry)
                    }
                    None => subscription::catch_up(client, selector, offset, options),
                }))
            }
            Some(group) => {
                let mut settings = self.options.settings.clone();
                if let Some(start) = offset {
                    settings.start_from = start;
                }
                subscription::ensure_persistent_subscription(
                    self.client.as_ref(),
                    &selector,
                    group,
                    &settings,
                )
                .await?;
                info!(stream = %selector.stream_name(), group = %group, "Observing (persistent)");
                let client = self.client.clone();
                let options = self.options.clone();
                Ok(Observed::Persistent(match &self.options.retry {
                    Some(retry) => {
                        subscription::supervise_persistent(client, selector, group, options, retry)
                    }
                    None => subscription::persistent(client, selector, group, options),
                }))
            }
        }
    }

    /// Open a subscription using the configured consumer group.
    ///
    /// Persistent when `subscription.consumer_group` is set, catch-up from
    /// `offset` otherwise.
    pub async fn observe_configured<E: DomainEvent>(
        &self,
        selector: Selector,
        offset: Option<u64>,
    ) -> Result<Observed<E>> {
        let group = self.options.consumer_group.clone();
        self.observe(selector, group.as_deref(), offset).await
    }

    /// The store's actual version, read out of band after a rejected append.
    ///
    /// A failed read is returned as the error; no conflict is reported
    /// without a known actual version.
    async fn actual_version(&self, stream: &str, reported: Option<u64>) -> Result<u64> {
        if let Some(actual) = reported {
            return Ok(actual);
        }
        match self.client.stream_version(stream).await {
            Ok(version) => Ok(version.unwrap_or(0)),
            Err(e) => {
                warn!(stream = %stream, error = %e, "Could not read actual version after conflict");
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl EventStore for LogEventStore {
    #[tracing::instrument(name = "store.append", skip_all, fields(stream = %stream, expected = expected_version, count = events.len()))]
    async fn append(
        &self,
        stream: &str,
        events: Vec<EventDescriptor>,
        expected_version: u64,
    ) -> Result<u64> {
        if events.is_empty() {
            return Ok(expected_version);
        }

        let expected = ExpectedRevision::from_version(expected_version);
        match self.client.append_to_stream(stream, expected, events).await {
            Ok(version) => {
                debug!(version, "Events appended");
                Ok(version)
            }
            Err(ClientError::WrongExpectedVersion { actual, .. }) => {
                let actual = self.actual_version(stream, actual).await?;
                warn!(actual, "Concurrency conflict");
                Err(ConcurrencyConflict {
                    stream: stream.to_string(),
                    expected: expected_version,
                    actual,
                }
                .into())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(name = "store.read", skip_all, fields(stream = %stream, from = from_version))]
    async fn read(&self, stream: &str, from_version: u64) -> Result<Vec<RawEventRecord>> {
        let records = self.client.read_stream(stream, from_version).await?;
        debug!(count = records.len(), "Stream read");
        Ok(records)
    }

    #[tracing::instrument(name = "store.delete", skip_all, fields(stream = %stream))]
    async fn delete(&self, stream: &str) -> Result<()> {
        self.client.tombstone_stream(stream).await?;
        info!("Stream deleted");
        Ok(())
    }

    async fn stream_version(&self, stream: &str) -> Result<u64> {
        Ok(self.client.stream_version(stream).await?.unwrap_or(0))
    }
}
