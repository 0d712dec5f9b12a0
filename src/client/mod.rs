//! Log store client boundary.
//!
//! This module contains:
//! - `StoreClient` trait: the wire-level operations against the external log
//! - `RecordStream` / `AckHandle` traits: subscription plumbing
//! - Persistent subscription settings and nack actions
//! - `InMemoryClient`: an in-process log honoring the same protocol
//! - `EventStoreDbClient`: the gRPC client (`eventstoredb` feature)
//!
//! Connection management, TLS and transport-level retries belong to the
//! concrete client and are not modelled here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::record::{EventDescriptor, RawEventRecord};

pub mod memory;

#[cfg(feature = "eventstoredb")]
pub mod eventstoredb;

pub use memory::InMemoryClient;

#[cfg(feature = "eventstoredb")]
pub use eventstoredb::EventStoreDbClient;

/// Prefix of category projection streams (`$ce-{category}`).
pub const CATEGORY_STREAM_PREFIX: &str = "$ce-";

/// Build the category stream name for an aggregate type.
pub fn category_stream(category: &str) -> String {
    format!("{}{}", CATEGORY_STREAM_PREFIX, category)
}

// ============================================================================
// Errors
// ============================================================================

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the wire client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("wrong expected version on '{stream}': expected {expected:?}, actual {actual:?}")]
    WrongExpectedVersion {
        stream: String,
        expected: ExpectedRevision,
        actual: Option<u64>,
    },

    #[error("stream '{0}' has been deleted")]
    StreamDeleted(String),

    #[error("persistent subscription '{group}' on '{stream}' not found")]
    SubscriptionNotFound { stream: String, group: String },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("subscription dropped: {0}")]
    SubscriptionDropped(String),
}

impl ClientError {
    /// Connection-level failures, which a supervisor may retry.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            ClientError::Connection(_) | ClientError::SubscriptionDropped(_)
        )
    }
}

// ============================================================================
// Protocol types
// ============================================================================

/// Optimistic concurrency expectation sent with an append.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedRevision {
    /// Skip the check.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream's last event must be at this revision.
    Exact(u64),
}

impl ExpectedRevision {
    /// Translate a stream version (count of events) into a wire revision.
    pub fn from_version(version: u64) -> Self {
        match version {
            0 => ExpectedRevision::NoStream,
            v => ExpectedRevision::Exact(v - 1),
        }
    }

    /// Whether the expectation holds for a stream at `version`.
    pub fn matches(self, version: u64) -> bool {
        match self {
            ExpectedRevision::Any => true,
            ExpectedRevision::NoStream => version == 0,
            ExpectedRevision::Exact(rev) => version == rev + 1,
        }
    }
}

/// What the store should do with a negatively acknowledged record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NackAction {
    /// Move the record to the parked queue for manual inspection.
    Park,
    /// Redeliver the record.
    Retry,
    /// Drop the record without processing.
    Skip,
    /// Stop the subscription connection.
    Stop,
}

/// Settings for a consumer group.
///
/// Acks must be flushed one at a time: with batching, acks queued client-side
/// but never sent look identical to events that were never received, and the
/// store redelivers them after `message_timeout`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentSettings {
    /// Stream position the group starts from when first created.
    pub start_from: u64,
    pub min_checkpoint_count: u32,
    pub max_checkpoint_count: u32,
    pub message_timeout: Duration,
    /// Deliveries after which a record is parked instead of retried.
    pub max_retry_count: u32,
}

impl Default for PersistentSettings {
    fn default() -> Self {
        Self {
            start_from: 0,
            min_checkpoint_count: 1,
            max_checkpoint_count: 1,
            message_timeout: Duration::from_secs(30),
            max_retry_count: 10,
        }
    }
}

/// One record delivered by a subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub record: RawEventRecord,
    /// Position within the subscribed stream (differs from
    /// `record.stream_position` on category streams).
    pub position: u64,
    /// Identifier to hand back on ack/nack.
    pub ack_id: Uuid,
    pub retry_count: u32,
}

// ============================================================================
// Traits
// ============================================================================

/// A live stream of deliveries.
///
/// `Ok(None)` means the server ended the subscription cleanly; `Err` is a
/// connection-level failure.
#[async_trait]
pub trait RecordStream: Send {
    async fn next(&mut self) -> Result<Option<Delivery>>;
}

/// Ack/nack side of a persistent subscription connection.
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&self, ids: &[Uuid]) -> Result<()>;

    async fn nack(&self, ids: &[Uuid], action: NackAction, reason: &str) -> Result<()>;
}

/// A connected persistent subscription: its deliveries and its ack channel.
pub struct PersistentConnection {
    pub stream: Box<dyn RecordStream>,
    pub acks: Arc<dyn AckHandle>,
}

/// Wire client for the external log store.
///
/// Implementations:
/// - `InMemoryClient`: in-process log for standalone use and tests
/// - `EventStoreDbClient`: EventStoreDB / KurrentDB over gRPC
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Append events atomically. Returns the stream version after the append.
    async fn append_to_stream(
        &self,
        stream: &str,
        expected: ExpectedRevision,
        events: Vec<EventDescriptor>,
    ) -> Result<u64>;

    /// Read a stream (or category projection) from `from` to its end.
    async fn read_stream(&self, stream: &str, from: u64) -> Result<Vec<RawEventRecord>>;

    /// Current version of a stream; `None` when it has never been written.
    async fn stream_version(&self, stream: &str) -> Result<Option<u64>>;

    /// Hard-delete a stream, leaving a tombstone.
    async fn tombstone_stream(&self, stream: &str) -> Result<()>;

    /// Catch-up subscription: history from `from` (inclusive), then live.
    async fn subscribe_to_stream(
        &self,
        stream: &str,
        from: Option<u64>,
    ) -> Result<Box<dyn RecordStream>>;

    /// Create a consumer group. Idempotent when the group already exists.
    async fn create_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: &PersistentSettings,
    ) -> Result<()>;

    /// Connect to an existing consumer group.
    async fn subscribe_to_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        buffer_size: usize,
    ) -> Result<PersistentConnection>;
}

/// Initialize a store client based on configuration.
pub async fn init_client(config: &StoreConfig) -> Result<Arc<dyn StoreClient>> {
    info!(store_type = %config.store_type, "Initializing store client");

    match config.store_type.as_str() {
        "memory" => Ok(Arc::new(InMemoryClient::new())),
        #[cfg(feature = "eventstoredb")]
        "eventstoredb" => Ok(Arc::new(EventStoreDbClient::new(
            &config.eventstoredb.connection_string,
        )?)),
        #[cfg(not(feature = "eventstoredb"))]
        "eventstoredb" => {
            error!("EventStoreDB client requested but 'eventstoredb' feature is not enabled");
            Err(ClientError::Connection(
                "eventstoredb feature not enabled".to_string(),
            ))
        }
        other => {
            error!(store_type = %other, "Unknown store type");
            Err(ClientError::Connection(format!(
                "unsupported store type: {other}"
            )))
        }
    }
}
