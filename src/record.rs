//! Event records and descriptors.
//!
//! An [`EventDescriptor`] is what an aggregate hands to the store; an
//! [`EventRecord`] is what the store hands back once the event has a position.

use std::ops::Deref;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::codec::{DomainEvent, EncodeError, EventMetadata};

/// Stream name prefix that marks a hard-deleted stream.
pub const TOMBSTONE_PREFIX: &str = "$$";

/// Event type prefix reserved for store-internal bookkeeping.
pub const SYSTEM_EVENT_PREFIX: &str = "$";

/// An event ready to be appended (no position assigned yet).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDescriptor {
    pub event_type: String,
    pub data: Bytes,
    pub metadata: Bytes,
}

impl EventDescriptor {
    pub fn new(
        event_type: impl Into<String>,
        data: impl Into<Bytes>,
        metadata: impl Into<Bytes>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
            metadata: metadata.into(),
        }
    }

    /// Encode a domain event together with its type-name metadata.
    pub fn from_event<E: DomainEvent>(
        event: &E,
        aggregate_type: &str,
    ) -> Result<Self, EncodeError> {
        let event_type = event.event_type();
        let data = event.encode()?;
        let metadata = EventMetadata::new(event_type)
            .with_aggregate_type(aggregate_type)
            .to_bytes()?;
        Ok(Self {
            event_type: event_type.to_string(),
            data,
            metadata,
        })
    }
}

/// A stored event with its store-assigned positions.
///
/// `T` is the payload: raw bytes as read from the store, or a decoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord<T = Bytes> {
    pub stream_name: String,
    pub event_type: String,
    pub id: Uuid,
    /// Index of the event within its own stream.
    pub stream_position: u64,
    /// Store-wide ordering token. Advisory outside a single stream.
    pub commit_position: u64,
    pub recorded_at: DateTime<Utc>,
    pub data: T,
    pub metadata: Bytes,
}

/// A record whose payload has not been decoded.
pub type RawEventRecord = EventRecord<Bytes>;

impl<T> EventRecord<T> {
    /// Replace the payload, keeping every positional field.
    pub fn with_data<U>(self, data: U) -> EventRecord<U> {
        EventRecord {
            stream_name: self.stream_name,
            event_type: self.event_type,
            id: self.id,
            stream_position: self.stream_position,
            commit_position: self.commit_position,
            recorded_at: self.recorded_at,
            data,
            metadata: self.metadata,
        }
    }

    /// Residual marker of a hard-deleted stream.
    pub fn is_tombstone(&self) -> bool {
        self.stream_name.starts_with(TOMBSTONE_PREFIX)
    }

    /// Store-internal bookkeeping (metadata changes, deletion markers, ...).
    pub fn is_system_event(&self) -> bool {
        self.event_type.starts_with(SYSTEM_EVENT_PREFIX)
    }
}

/// Opaque handle used to acknowledge a persistent delivery.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct AckToken(Uuid);

impl AckToken {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn id(&self) -> Uuid {
        self.0
    }
}

/// A record delivered through a persistent subscription.
///
/// The record carries only a token; acknowledging goes through the owning
/// [`PersistentSubscription`](crate::subscription::PersistentSubscription).
#[derive(Debug, Clone)]
pub struct AckableEventRecord<E> {
    record: EventRecord<E>,
    token: AckToken,
    retry_count: u32,
}

impl<E> AckableEventRecord<E> {
    pub fn new(record: EventRecord<E>, token: AckToken, retry_count: u32) -> Self {
        Self {
            record,
            token,
            retry_count,
        }
    }

    pub fn token(&self) -> AckToken {
        self.token
    }

    /// Number of times the store has already delivered this record.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn record(&self) -> &EventRecord<E> {
        &self.record
    }

    pub fn into_record(self) -> EventRecord<E> {
        self.record
    }
}

impl<E> From<&AckableEventRecord<E>> for AckToken {
    fn from(record: &AckableEventRecord<E>) -> Self {
        record.token
    }
}

impl<E> Deref for AckableEventRecord<E> {
    type Target = EventRecord<E>;

    fn deref(&self) -> &Self::Target {
        &self.record
    }
}
